use email_address::EmailAddress;
use smtp_proto::{
    AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES, EXT_SMTP_UTF8, EXT_START_TLS,
    EhloResponse, Request,
};
use std::net::SocketAddr;
use tracing::{debug, trace};

use crate::models::{ApiCredential, Capability, CredentialRepository};
use crate::smtp::limiter::SessionLimiter;
use crate::submission::{Envelope, MAX_MESSAGE_SIZE, MAX_RECIPIENTS_PER_ENVELOPE, SubmissionError, SubmissionPipeline};
use crate::tenant_context::TenantContextService;

/// An envelope under construction between `MAIL FROM` and a completed
/// `DATA`. Unlike the HTTP API, the SMTP server only learns the full body
/// once `DATA` finishes, so admission (and therefore the credential's
/// `Envelope`) cannot be built until then.
struct PendingEnvelope {
    from: EmailAddress,
    to: Vec<EmailAddress>,
    raw_data: Vec<u8>,
}

pub struct SmtpSession {
    credentials: CredentialRepository,
    tenant_context: TenantContextService,
    pipeline: SubmissionPipeline,
    limits: SessionLimiter,

    peer_addr: SocketAddr,
    peer_name: Option<String>,
    tls_active: bool,
    authenticated: Option<ApiCredential>,
    current_envelope: Option<PendingEnvelope>,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    IngestAuth(u16, String),
    /// Reply, then the connection must complete a `STARTTLS` handshake
    /// before the next command is read.
    UpgradeTls(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

struct AttemptedAuth<'a> {
    username: &'a str,
    password: &'a str,
}

enum AttemptedAuthError {
    SyntaxError,
    Utf8Error,
}

impl SmtpSession {
    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &str = "2.1.0 Originator <[email]> ok";
    const RESPONSE_TO_OK: &str = "2.1.5 Recipient <[email]> ok";
    const RESPONSE_SYNTAX_ERROR: &str = "5.5.2 Syntax error";
    const RESPONSE_AUTH_SUCCCESS: &str = "2.7.0 Authentication succeeded.";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_START_TLS: &str = "2.0.0 Ready to start TLS";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_MESSAGE_ACCEPTED: &str = "2.6.0 Message queued for delivery";
    const RESPONSE_MESSAGE_REJECTED: &str = "5.6.0 Message rejected";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_NOVALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
    const RESPONSE_TOO_MANY_RECIPIENTS: &str = "5.5.3 Too many recipients";
    const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
    const RESPONSE_INVALID_EMAIL: &str = "5.1.3 This email address is not valid";
    const RESPONSE_UNAUTHORIZED_SENDER: &str = "5.7.1 Sender domain not authorized for this tenant";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_ALREADY_AUTHENTICATED: &str = "5.5.1 Already authenticated";
    const RESPONSE_AUTH_ERROR: &str = "5.7.8 Authentication credentials invalid";
    const RESPONSE_AUTH_REQUIRES_TLS: &str = "5.7.11 AUTH requires an encrypted connection";
    const RESPONSE_AUTHENTICATION_REQUIRED: &str = "5.7.1 Authentication required";
    const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
    const RESPONSE_COMMAND_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
    const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";
    const RESPONSE_QUOTA_EXCEEDED: &str = "4.7.1 Tenant quota exceeded, try again later";
    const RESPONSE_TOO_MANY_COMMANDS: &str = "4.7.0 Too many commands, closing connection";
    const RESPONSE_TOO_MANY_MESSAGES: &str = "4.7.0 Too many messages for this connection";

    pub fn new(
        peer_addr: SocketAddr,
        credentials: CredentialRepository,
        tenant_context: TenantContextService,
        pipeline: SubmissionPipeline,
        limits: SessionLimiter,
    ) -> Self {
        Self {
            credentials,
            tenant_context,
            pipeline,
            limits,
            peer_addr,
            peer_name: None,
            tls_active: false,
            authenticated: None,
            current_envelope: None,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// Called by the connection loop right after the `STARTTLS` handshake
    /// completes. RFC 3207 requires the session state machine to reset as
    /// if a fresh connection had just been opened.
    pub fn mark_tls_active(&mut self) {
        self.tls_active = true;
        self.peer_name = None;
        self.authenticated = None;
        self.current_envelope = None;
    }

    /// AUTH is refused on a connection that is neither TLS-protected nor
    /// local — plaintext credentials must never cross an untrusted network.
    fn auth_allowed(&self) -> bool {
        self.tls_active || self.peer_addr.ip().is_loopback()
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
        if !self.limits.record_command() {
            return SessionReply::ReplyAndStop(421, Self::RESPONSE_TOO_MANY_COMMANDS.into());
        }

        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");

                // RFC 4409, 4.1
                return SessionReply::ReplyAndContinue(554, e.to_string());
            }
        };

        if let Request::Auth { mechanism, .. } = request {
            // This is a workaround as we are not in control of the `Debug` implementation of `Request`
            // Without this if statement, we would print the user password as base64 string in the logs
            // which we want to avoid
            trace!(
                "received AUTH with mechanism {mechanism} request from {}",
                self.peer_addr
            );
        } else {
            trace!("received request: {request:?} from {}", self.peer_addr);
        }

        match request {
            Request::Ehlo { host } => {
                // RFC5231, 4.1.1.1
                let mut response = EhloResponse::new(&host);
                response.capabilities =
                    EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8 | EXT_AUTH;
                if !self.tls_active {
                    response.capabilities |= EXT_START_TLS;
                }

                response.auth_mechanisms = AUTH_PLAIN;

                let mut buf = Vec::with_capacity(64);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);

                SessionReply::RawReply(buf)
            }
            Request::Lhlo { host: _ } => {
                // we do not currently support LMTP
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Helo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::Auth { mechanism, initial_response } => {
                // RFC 4954
                if self.authenticated.is_some() {
                    return SessionReply::ReplyAndContinue(
                        503,
                        Self::RESPONSE_ALREADY_AUTHENTICATED.into(),
                    );
                }

                if !self.auth_allowed() {
                    return SessionReply::ReplyAndContinue(538, Self::RESPONSE_AUTH_REQUIRES_TLS.into());
                }

                if mechanism == AUTH_PLAIN {
                    debug!("Received AUTH PLAIN");

                    if initial_response.is_empty() {
                        return SessionReply::IngestAuth(334, "Tell me your secret.".into());
                    }

                    let (code, message) =
                        self.handle_plain_auth(&mut initial_response.into_bytes()).await;

                    SessionReply::ReplyAndContinue(code, message)
                } else {
                    debug!("Received unsupported AUTH request");
                    SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_ERROR.into())
                }
            }
            Request::Quit => {
                // RFC5321, 4.1.1.10
                SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into())
            }
            // if the client did not say EHLO, we want to ask for that first instead of processing any of the below commands
            _ignored_command if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::StartTls => {
                if self.tls_active {
                    return SessionReply::ReplyAndContinue(504, Self::RESPONSE_ALREADY_TLS.into());
                }
                SessionReply::UpgradeTls(220, Self::RESPONSE_START_TLS.into())
            }
            Request::Mail { from } => {
                // RFC5231, 4.1.1.2
                debug!("received MAIL FROM: {}", from.address);

                let Ok(from_address) = from.address.parse::<EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(
                        553,
                        Self::RESPONSE_INVALID_SENDER.into(),
                    );
                };

                let Some(credential) = self.authenticated.as_ref() else {
                    return SessionReply::ReplyAndContinue(
                        530,
                        Self::RESPONSE_AUTHENTICATION_REQUIRED.into(),
                    );
                };
                if !credential.has(Capability::Send) {
                    return SessionReply::ReplyAndContinue(
                        550,
                        Self::RESPONSE_UNAUTHORIZED_SENDER.into(),
                    );
                }

                if self.current_envelope.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }

                self.current_envelope =
                    Some(PendingEnvelope { from: from_address, to: Vec::new(), raw_data: Vec::new() });

                let response_message = Self::RESPONSE_FROM_OK.replace("[email]", &from.address);
                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Rcpt { to } => {
                // RFC5231, 4.1.1.3
                debug!("received RCPT TO: {}", to.address);

                let Ok(to_address) = to.address.parse::<EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(
                        553,
                        Self::RESPONSE_INVALID_EMAIL.into(),
                    );
                };

                let Some(envelope) = self.current_envelope.as_mut() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
                };

                if envelope.to.len() >= MAX_RECIPIENTS_PER_ENVELOPE {
                    return SessionReply::ReplyAndContinue(452, Self::RESPONSE_TOO_MANY_RECIPIENTS.into());
                }

                envelope.to.push(to_address);

                let response_message = Self::RESPONSE_TO_OK.replace("[email]", &to.address);
                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Bdat { chunk_size: _, is_last: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Noop { value: _ } => {
                // RFC5321, 4.1.1.9
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Data => {
                // RFC5231, 4.1.1.4
                let Some(PendingEnvelope { to, .. }) = self.current_envelope.as_ref() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                };

                if to.is_empty() {
                    return SessionReply::ReplyAndContinue(
                        554,
                        Self::RESPONSE_NOVALID_RECIPIENTS.into(),
                    );
                }

                if !self.limits.record_message() {
                    return SessionReply::ReplyAndContinue(452, Self::RESPONSE_TOO_MANY_MESSAGES.into());
                }

                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Rset => {
                // RFC5321, 4.1.1.5. Comments about this:
                // - this does not need to clear AUTH status
                // - this does not clear the EHLO status
                self.current_envelope = None;
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Vrfy { value: _ } => {
                // RFC5321, 4.1.1.6
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NO_VRFY.into())
            }
            Request::Expn { value: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Help { value: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Etrn { .. } | Request::Atrn { .. } | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
        }
    }

    fn decode_plain_auth(data: &mut [u8]) -> Result<AttemptedAuth, AttemptedAuthError> {
        // we may need to trim off a trailing CR/LF
        let ascii_len = data.trim_ascii_end().len();
        let data = &mut data[..ascii_len];

        let Ok(decoded) = base64ct::Base64::decode_in_place(data) else {
            return Err(AttemptedAuthError::SyntaxError);
        };

        let mut parts = decoded.split(|&b| b == 0);

        let Some(authcid) = parts.next() else {
            return Err(AttemptedAuthError::SyntaxError);
        };
        if authcid != b"" {
            trace!(
                "Ignoring received authentication identity (authcid): {}",
                String::from_utf8_lossy(authcid)
            );
        }
        let username = parts.next().ok_or(AttemptedAuthError::SyntaxError)?;
        let password = parts.next().ok_or(AttemptedAuthError::SyntaxError)?;
        if parts.count() != 0 {
            return Err(AttemptedAuthError::SyntaxError);
        }

        let username = std::str::from_utf8(username).map_err(|_| AttemptedAuthError::Utf8Error)?;
        let password = std::str::from_utf8(password).map_err(|_| AttemptedAuthError::Utf8Error)?;

        Ok(AttemptedAuth { username, password })
    }

    /// The SMTP username is accepted but ignored: the password carries the
    /// whole `{credential_id}.{secret}` bearer token, verified exactly the
    /// way the HTTP API's `Authorization` header is, plus the same
    /// freshness/active check on the owning tenant.
    pub(super) async fn handle_plain_auth(&mut self, data: &mut [u8]) -> (u16, String) {
        let Ok(AttemptedAuth { username: _, password: token }) = Self::decode_plain_auth(data) else {
            return (501, Self::RESPONSE_SYNTAX_ERROR.into());
        };

        trace!("decoded AUTH PLAIN token ({} characters)", token.len());

        let Ok(Some(credential)) = self.credentials.find_by_token(token).await else {
            return (535, Self::RESPONSE_AUTH_ERROR.into());
        };
        if !credential.verify_token(token) || !credential.active() {
            return (535, Self::RESPONSE_AUTH_ERROR.into());
        }

        let Ok(tenant) = self.tenant_context.load(credential.tenant_id()).await else {
            return (454, Self::RESPONSE_AUTH_ERROR.into());
        };
        if tenant.require_fresh_and_active().is_err() {
            return (454, Self::RESPONSE_AUTH_ERROR.into());
        }

        self.credentials.mark_used(credential.id()).await.ok();
        self.authenticated = Some(credential);

        (235, Self::RESPONSE_AUTH_SUCCCESS.into())
    }

    pub async fn handle_data(&mut self, data: &[u8]) -> DataReply {
        let Some(PendingEnvelope { raw_data, .. }) = self.current_envelope.as_mut() else {
            return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        raw_data.extend_from_slice(data);

        if raw_data.len() > MAX_MESSAGE_SIZE {
            debug!("failed to read message: message too big");

            return DataReply::ReplyAndContinue(554, Self::RESPONSE_MESSAGE_REJECTED.into());
        }

        const DATA_END: &[u8] = b"\r\n.\r\n";

        if raw_data.ends_with(DATA_END) || raw_data.as_slice() == &DATA_END[2..] {
            raw_data.truncate(raw_data.len() - DATA_END.len());

            let Some(envelope) = self.current_envelope.take() else {
                return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
            };
            // authenticated credential/tenant were already checked at AUTH
            // and at MAIL FROM time; current_envelope can only exist once
            // both happened.
            let Some(credential) = self.authenticated.as_ref() else {
                return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
            };

            trace!("received message ({} bytes)", envelope.raw_data.len());

            let submission = Envelope {
                credential_id: credential.id(),
                from: envelope.from,
                to: envelope.to,
                subject: None,
                raw_data: envelope.raw_data,
            };

            match self.pipeline.submit(credential.tenant_id(), submission).await {
                Ok(_message_id) => {
                    DataReply::ReplyAndContinue(250, Self::RESPONSE_MESSAGE_ACCEPTED.into())
                }
                Err(SubmissionError::QuotaExceeded { .. }) => {
                    DataReply::ReplyAndContinue(451, Self::RESPONSE_QUOTA_EXCEEDED.into())
                }
                Err(err) => {
                    debug!("failed to submit message: {err}");
                    DataReply::ReplyAndContinue(554, Self::RESPONSE_MESSAGE_REJECTED.into())
                }
            }
        } else {
            DataReply::ContinueIngest
        }
    }
}
