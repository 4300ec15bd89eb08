mod credential;
mod dkim_key;
mod domain;
mod event;
mod message;
mod queue_job;
mod suppression;
mod tenant;

pub(crate) use credential::*;
pub(crate) use dkim_key::*;
pub(crate) use domain::*;
pub(crate) use event::*;
pub(crate) use message::*;
pub(crate) use queue_job::*;
pub(crate) use suppression::*;
pub(crate) use tenant::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Email(#[from] email_address::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error("cryptographic error: {0}")]
    AwsCrypto(#[from] aws_lc_rs::error::Unspecified),
    #[error("cryptographic key rejected: {0}")]
    WrongCryptKey(#[from] aws_lc_rs::error::KeyRejected),
    #[error("email authentication error: {0}")]
    MailAuth(#[from] mail_auth::Error),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
    #[error("invalid utf8")]
    FromUtf8(#[from] std::string::FromUtf8Error),
    #[error("too many requests, try again later")]
    TooManyRequests,
    #[error("tenant has been suspended")]
    TenantSuspended,
    #[error("recipient is suppressed")]
    Suppressed,
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("not found");
        }
        Error::Database(sql)
    }
}
