use mail_auth::{
    common::headers::HeaderWriter,
    dkim::DkimSigner,
};

use crate::models::{DkimKey, Error};

/// Headers DKIM-signed on every outbound message, in the order RFC 6376
/// recommends signing them.
const SIGNED_HEADERS: [&str; 26] = [
    "From",
    "Subject",
    "Date",
    "Message-ID",
    "To",
    "Cc",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-ID",
    "Content-Description",
    "Resent-Date",
    "Resent-From",
    "Resent-Sender",
    "Resent-To",
    "Resent-Cc",
    "Resent-Message-ID",
    "In-Reply-To",
    "References",
    "List-Id",
    "List-Help",
    "List-Unsubscribe",
    "List-Subscribe",
    "List-Post",
    "List-Owner",
    "List-Archive",
];

/// Signs a parsed message on behalf of `domain_key`, producing the raw
/// `DKIM-Signature` header to prepend to the outgoing message.
pub fn sign(domain: &str, domain_key: &DkimKey, msg: &mail_parser::Message) -> Result<String, Error> {
    let signer = DkimSigner::from_key(domain_key.signing_key()?)
        .domain(domain)
        .selector(domain_key.selector())
        .headers(SIGNED_HEADERS);

    Ok(signer
        .sign(&msg.raw_message)
        .map_err(Error::MailAuth)?
        .to_header())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{DkimKeyRepository, DomainRepository, NewDomain, NewTenant, Plan, TenantRepository};
    use mail_builder::MessageBuilder;
    use mail_parser::MessageParser;
    use sqlx::PgPool;

    #[sqlx::test]
    async fn signs_a_message(db: PgPool) {
        let tenants = TenantRepository::new(db.clone());
        let tenant = tenants
            .create(&NewTenant {
                name: "Acme".to_string(),
                plan: Plan::Standard,
            })
            .await
            .unwrap();

        let domains = DomainRepository::new(db.clone());
        let domain = domains
            .create(
                tenant.id(),
                &NewDomain {
                    domain: "example.com".to_string(),
                },
                "uz",
            )
            .await
            .unwrap();

        let keys = DkimKeyRepository::new(db);
        let key = keys.find_active(domain.id(), "uz").await.unwrap();

        let raw = MessageBuilder::new()
            .from(("John Doe", "john@example.com"))
            .to(vec![("Jane Doe", "jane@example.com")])
            .subject("Hi!")
            .text_body("Hello world!")
            .write_to_vec()
            .unwrap();

        let parsed = MessageParser::default().parse(&raw).unwrap();

        let header = sign("example.com", &key, &parsed).unwrap();
        assert!(header.starts_with("DKIM-Signature:"));
    }
}
