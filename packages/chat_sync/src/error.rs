use tokio_tungstenite::tungstenite;

/// Errors surfaced by the synchronization core.
///
/// Nothing here is fatal: every variant is reported to the presentation
/// layer as a state change or notice.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Transient transport failure on a request/response call. Never retried
    /// automatically; the user re-triggers the operation.
    #[error("network error: {0}")]
    Network(String),

    /// The server rejected the credential (HTTP 401). Escalated to whoever
    /// owns authentication.
    #[error("session is no longer valid")]
    SessionInvalid,

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode server payload: {0}")]
    Decode(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("no credential: log in first")]
    NoCredential,

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error("sync orchestrator is gone")]
    ActorGone,
}

impl SyncError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            Self::SessionInvalid
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
                Self::SessionInvalid
            }
            _ => Self::Channel(err.to_string()),
        }
    }

    /// True for failures the auth collaborator has to handle.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionInvalid)
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
