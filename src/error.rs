//! Failure taxonomy for the chat core.
//!
//! Every path reachable from a transport adapter must end in a user-facing
//! string; `CoreError::user_message` renders that string while the full
//! detail stays on the server side via `tracing`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad user input: unknown mode, unknown role, missing argument,
    /// absent or ambiguous session-id prefix. Recovered locally.
    #[error("{0}")]
    Validation(String),

    /// Caller is not on the admin allow-list.
    #[error("user {user_id} is not an admin (admins: {admins:?})")]
    NotAuthorized { user_id: i64, admins: Vec<i64> },

    /// The user has no active session to route free text to.
    #[error("no active session")]
    NoActiveSession,

    /// A factory could not build a chat service (unknown mode, missing
    /// persona data, retrieval corpus unavailable). Detail is logged
    /// server-side; callers only see a generic message.
    #[error("no chat service available")]
    ServiceUnavailable,

    /// The language-model call failed. Retryable; no history is written.
    #[error("model call failed: {0}")]
    ModelCall(#[source] anyhow::Error),

    /// The reply did not arrive within the configured timeout. Retryable;
    /// no history is written.
    #[error("reply timed out")]
    Timeout,

    /// Saving persisted state failed. The in-memory mutation stands.
    #[error("failed to persist state: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl CoreError {
    /// Render the reply shown to the caller. Internal detail is never
    /// echoed here except for validation messages, which are written for
    /// the user in the first place.
    pub fn user_message(&self, available_modes: &[String]) -> String {
        match self {
            CoreError::Validation(msg) => msg.clone(),
            CoreError::NotAuthorized { user_id, admins } => format!(
                "Permission denied. You are not an admin. You: {}, Admins: {:?}",
                user_id, admins
            ),
            CoreError::NoActiveSession => format!(
                "No active session. Start one with /new <mode>.\nAvailable modes: {}",
                available_modes.join(", ")
            ),
            CoreError::ServiceUnavailable => {
                "The chat service is currently unavailable. Please try again later.".to_string()
            }
            CoreError::ModelCall(_) => {
                "The model call failed. Nothing was saved; please try again.".to_string()
            }
            CoreError::Timeout => {
                "The reply took too long and was cancelled. Nothing was saved; please try again."
                    .to_string()
            }
            CoreError::Persistence(_) => {
                "Your change was applied but could not be saved to disk.".to_string()
            }
        }
    }
}
