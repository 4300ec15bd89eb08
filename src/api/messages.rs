//! C8 submission handlers: `send`, `sendBatch`, `get_message`.
//!
//! `State<Repo>` extractors and an `ApiResult<T>` wrapper for the handler
//! shape. The RFC 5322 body is built with `mail_builder::MessageBuilder`
//! (`MessageBuilder::new().from(..).to(..).subject(..).html_body(..)
//! .text_body(..).into_message()`); everything past "the bytes are built"
//! — domain authorization, suppression, quota, persist, enqueue — runs
//! through [`crate::submission::SubmissionPipeline`], the same path the
//! SMTP submission server uses.

use axum::{
    Json,
    extract::{Path, State},
};
use email_address::EmailAddress;
use garde::Validate;
use mail_builder::MessageBuilder;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::{
    auth::TenantAuth,
    error::{ApiError, ApiResult},
    validation::ValidatedJson,
};
use crate::models::{Capability, Message, MessageId, MessageRepository};
use crate::submission::{Envelope, SubmissionPipeline};

/// The HTTP API names "up to N messages" per batch without a number; 100
/// keeps one request's work bounded.
const MAX_ENVELOPES_PER_BATCH: usize = 100;

#[derive(Debug, Deserialize, ToSchema, Validate)]
#[cfg_attr(test, derive(Serialize))]
pub struct SendEmailRequest {
    #[garde(length(min = 3, max = 320))]
    pub from: String,
    #[garde(length(min = 1))]
    pub to: Vec<String>,
    #[garde(length(max = 998))]
    #[serde(default)]
    pub subject: Option<String>,
    #[garde(skip)]
    #[serde(default)]
    pub text_body: Option<String>,
    #[garde(skip)]
    #[serde(default)]
    pub html_body: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
#[cfg_attr(test, derive(Serialize))]
pub struct SendBatchRequest {
    #[garde(length(min = 1), dive)]
    pub envelopes: Vec<SendEmailRequest>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SendResponse {
    pub message_id: MessageId,
}

/// One envelope's outcome within a batch — a bad envelope never fails the
/// others in the same request.
#[derive(Debug, Serialize, ToSchema)]
pub struct BatchResult {
    pub ok: bool,
    pub message_id: Option<MessageId>,
    pub error: Option<String>,
}

pub async fn send(
    auth: TenantAuth,
    State(pipeline): State<SubmissionPipeline>,
    ValidatedJson(request): ValidatedJson<SendEmailRequest>,
) -> ApiResult<SendResponse> {
    let message_id = submit_http_envelope(&auth, &pipeline, request).await?;

    Ok(Json(SendResponse { message_id }))
}

pub async fn send_batch(
    auth: TenantAuth,
    State(pipeline): State<SubmissionPipeline>,
    ValidatedJson(request): ValidatedJson<SendBatchRequest>,
) -> ApiResult<Vec<BatchResult>> {
    if request.envelopes.len() > MAX_ENVELOPES_PER_BATCH {
        return Err(ApiError::ValidationFailed(format!(
            "batch exceeds the maximum of {MAX_ENVELOPES_PER_BATCH} envelopes"
        )));
    }

    let mut results = Vec::with_capacity(request.envelopes.len());
    for envelope in request.envelopes {
        match submit_http_envelope(&auth, &pipeline, envelope).await {
            Ok(message_id) => {
                results.push(BatchResult { ok: true, message_id: Some(message_id), error: None })
            }
            Err(err) => {
                results.push(BatchResult { ok: false, message_id: None, error: Some(err.to_string()) })
            }
        }
    }

    Ok(Json(results))
}

pub async fn get_message(
    auth: TenantAuth,
    Path(id): Path<MessageId>,
    State(messages): State<MessageRepository>,
) -> ApiResult<Message> {
    auth.require(Capability::Read)?;

    let message = messages
        .find_by_id(auth.tenant().tenant_id(), id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(message))
}

/// HTTP-specific prelude: capability check, structural validation, and RFC
/// 5322 construction from the JSON fields, then a hand-off into the shared
/// [`SubmissionPipeline`].
async fn submit_http_envelope(
    auth: &TenantAuth,
    pipeline: &SubmissionPipeline,
    request: SendEmailRequest,
) -> Result<MessageId, ApiError> {
    auth.require(Capability::Send)?;

    if request.to.is_empty() {
        return Err(ApiError::InvalidAddress("at least one recipient is required".to_string()));
    }
    if request.text_body.is_none() && request.html_body.is_none() {
        return Err(ApiError::ValidationFailed(
            "at least one of text_body or html_body is required".to_string(),
        ));
    }

    let from_email: EmailAddress =
        request.from.parse().map_err(|_| ApiError::InvalidAddress(request.from.clone()))?;

    let mut recipients = Vec::with_capacity(request.to.len());
    for address in &request.to {
        let parsed: EmailAddress =
            address.parse().map_err(|_| ApiError::InvalidAddress(address.clone()))?;
        recipients.push(parsed);
    }

    let mut builder = MessageBuilder::new()
        .from(from_email.as_str())
        .to(recipients.iter().map(|r| r.as_str()).collect::<Vec<_>>());
    if let Some(subject) = &request.subject {
        builder = builder.subject(subject.as_str());
    }
    if let Some(text) = &request.text_body {
        builder = builder.text_body(text.as_str());
    }
    if let Some(html) = &request.html_body {
        builder = builder.html_body(html.as_str());
    }

    let built: mail_send::smtp::message::Message = builder
        .into_message()
        .map_err(|_| ApiError::ValidationFailed("could not construct message".to_string()))?;

    let envelope = Envelope {
        credential_id: auth.credential().id(),
        from: from_email,
        to: recipients,
        subject: request.subject,
        raw_data: built.body.to_vec(),
    };

    Ok(pipeline.submit(auth.tenant().tenant_id(), envelope).await?)
}
