//! Typed failures of the Lark core.
//!
//! Every variant except [`LarkError::DeliveryFailure`] aborts the enclosing
//! operation. Delivery failures are captured per recipient by
//! [`crate::notify::delivery`] and reported in the run summary.

use reqwest::StatusCode;

pub type Result<T, E = LarkError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum LarkError {
    #[error("missing Lark app credentials: {0} is not configured")]
    CredentialMissing(&'static str),

    #[error("tenant_access_token issuance failed: {0}")]
    UpstreamAuthFailure(String),

    #[error("Lark {context} failed: code={code}, msg={msg}")]
    UpstreamApiFailure {
        context: String,
        code: i64,
        msg: String,
    },

    #[error("Lark {context} failed: status={status}")]
    UpstreamHttp { context: String, status: StatusCode },

    #[error("malformed multipart body: {0}")]
    MalformedMultipart(String),

    #[error("attachment too large: {size} bytes > {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("missing upload: request carries no file part")]
    MissingUpload,

    #[error("upload has no {0}")]
    IncompleteUpload(&'static str),

    #[error("card delivery to {open_id} failed: {reason}")]
    DeliveryFailure { open_id: String, reason: String },

    #[error("pagination stalled on {resource}: cursor {cursor:?} seen before")]
    PaginationStalled { resource: String, cursor: String },

    #[error("unexpected Lark response for {context}: {detail}")]
    UnexpectedResponse { context: String, detail: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LarkError {
    pub(crate) fn api(context: impl Into<String>, code: i64, msg: impl Into<String>) -> Self {
        Self::UpstreamApiFailure {
            context: context.into(),
            code,
            msg: msg.into(),
        }
    }

    pub(crate) fn unexpected(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Upstream message carried verbatim, when the failure came from a Lark body.
    pub fn upstream_message(&self) -> Option<&str> {
        match self {
            Self::UpstreamAuthFailure(msg) | Self::UpstreamApiFailure { msg, .. } => Some(msg),
            Self::DeliveryFailure { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
