//! The chat-service capability and its per-mode factories.
//!
//! A chat service owns the conversational state for exactly one session:
//! it builds a prompt from its history (and, for role-play, retrieved
//! passages), calls its model binding, and appends the exchange to history
//! only after the call returns. Factories validate a session's
//! mode-specific fields and construct the right variant; nothing is cached
//! on construction failure.

pub mod plain;
pub mod roleplay;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;
use crate::llm::ModelBinding;
use crate::session::SessionInfo;

/// Entries (not pairs) of history included in each prompt. Full history is
/// persisted regardless; this only bounds the prompt.
pub const PROMPT_HISTORY_WINDOW: usize = 40;

/// Callback by which a live service patches its own session's config map.
/// The hub routes it back through the store under the shared lock.
pub type ConfigSink = Arc<dyn Fn(&str, serde_json::Map<String, Value>) + Send + Sync>;

#[async_trait]
pub trait ChatService: Send + Sync {
    /// Produce a reply and, on success, append the exchange to history.
    /// Failures leave history untouched.
    async fn produce_reply(&self, text: &str) -> Result<String, CoreError>;

    /// Swap the model binding without losing history.
    fn replace_binding(&self, binding: Arc<dyn ModelBinding>);

    /// Persisted history length for this session (entries, not pairs).
    fn history_len(&self) -> usize;
}

// Test harness plumbing: lets `.unwrap_err()` format `Arc<dyn ChatService>`.
#[cfg(test)]
impl std::fmt::Debug for dyn ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ChatService")
    }
}

#[async_trait]
pub trait ChatServiceFactory: Send + Sync {
    fn mode(&self) -> &'static str;

    async fn create(
        &self,
        info: &SessionInfo,
        binding: Arc<dyn ModelBinding>,
        sink: ConfigSink,
    ) -> Result<Arc<dyn ChatService>, CoreError>;
}

#[cfg(test)]
pub mod testing {
    //! Shared fakes for service and hub tests.

    use super::*;
    use crate::llm::ChatTurn;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A model binding that replays canned replies and records every
    /// prompt it was called with.
    pub struct ScriptedBinding {
        name: String,
        replies: Mutex<VecDeque<String>>,
        calls: Mutex<Vec<Vec<ChatTurn>>>,
        fail: bool,
    }

    impl ScriptedBinding {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                replies: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        pub fn with_reply(self, reply: impl Into<String>) -> Self {
            self.replies.lock().unwrap().push_back(reply.into());
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub fn last_prompt(&self) -> Vec<ChatTurn> {
            self.calls.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ModelBinding for ScriptedBinding {
        fn name(&self) -> &str {
            &self.name
        }

        async fn chat(&self, turns: &[ChatTurn]) -> anyhow::Result<String> {
            self.calls.lock().unwrap().push(turns.to_vec());
            if self.fail {
                anyhow::bail!("scripted failure");
            }
            let canned = self.replies.lock().unwrap().pop_front();
            Ok(canned.unwrap_or_else(|| format!("{}-reply", self.name)))
        }
    }

    pub fn noop_sink() -> ConfigSink {
        Arc::new(|_session_id, _patch| {})
    }
}
