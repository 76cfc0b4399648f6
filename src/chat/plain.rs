//! Plain chat: a session-supplied or default system prompt, no retrieval.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::chat::{ChatService, ChatServiceFactory, ConfigSink, PROMPT_HISTORY_WINDOW};
use crate::database::ChatDatabase;
use crate::error::CoreError;
use crate::llm::{ChatTurn, ModelBinding};
use crate::session::SessionInfo;

pub const PLAIN_MODE: &str = "plain";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const SYSTEM_PROMPT_CONFIG_KEY: &str = "system_prompt";

pub struct PlainChatService {
    session_id: String,
    system_prompt: String,
    binding: Mutex<Arc<dyn ModelBinding>>,
    db: Arc<ChatDatabase>,
}

impl PlainChatService {
    pub fn new(
        session_id: impl Into<String>,
        system_prompt: impl Into<String>,
        binding: Arc<dyn ModelBinding>,
        db: Arc<ChatDatabase>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            system_prompt: system_prompt.into(),
            binding: Mutex::new(binding),
            db,
        }
    }
}

#[async_trait]
impl ChatService for PlainChatService {
    async fn produce_reply(&self, text: &str) -> Result<String, CoreError> {
        let recent = self
            .db
            .recent_history(&self.session_id, PROMPT_HISTORY_WINDOW)
            .map_err(|e| {
                tracing::error!("History read failed for {}: {:#}", self.session_id, e);
                CoreError::ServiceUnavailable
            })?;

        let mut messages = Vec::with_capacity(recent.len() + 2);
        messages.push(ChatTurn::system(self.system_prompt.clone()));
        messages.extend(recent);
        messages.push(ChatTurn::user(text));

        let binding = self.binding.lock().unwrap().clone();
        let reply = binding
            .chat(&messages)
            .await
            .map_err(CoreError::ModelCall)?;

        if let Err(e) = self.db.append_turns(
            &self.session_id,
            &[ChatTurn::user(text), ChatTurn::assistant(reply.clone())],
        ) {
            tracing::error!("History write failed for {}: {:#}", self.session_id, e);
        }

        Ok(reply)
    }

    fn replace_binding(&self, binding: Arc<dyn ModelBinding>) {
        *self.binding.lock().unwrap() = binding;
    }

    fn history_len(&self) -> usize {
        self.db.history_len(&self.session_id).unwrap_or_else(|e| {
            tracing::warn!("History count failed for {}: {:#}", self.session_id, e);
            0
        })
    }
}

pub struct PlainServiceFactory {
    db: Arc<ChatDatabase>,
}

impl PlainServiceFactory {
    pub fn new(db: Arc<ChatDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ChatServiceFactory for PlainServiceFactory {
    fn mode(&self) -> &'static str {
        PLAIN_MODE
    }

    async fn create(
        &self,
        info: &SessionInfo,
        binding: Arc<dyn ModelBinding>,
        sink: ConfigSink,
    ) -> Result<Arc<dyn ChatService>, CoreError> {
        if info.mode != PLAIN_MODE {
            return Err(CoreError::Validation(format!(
                "This factory only supports '{}' sessions.",
                PLAIN_MODE
            )));
        }

        let system_prompt = match info
            .config
            .get(SYSTEM_PROMPT_CONFIG_KEY)
            .and_then(|v| v.as_str())
        {
            Some(prompt) => prompt.to_string(),
            None => {
                // Record the effective prompt so the session shows what it
                // actually runs with.
                let mut patch = serde_json::Map::new();
                patch.insert(
                    SYSTEM_PROMPT_CONFIG_KEY.to_string(),
                    serde_json::Value::String(DEFAULT_SYSTEM_PROMPT.to_string()),
                );
                sink(&info.session_id, patch);
                DEFAULT_SYSTEM_PROMPT.to_string()
            }
        };

        Ok(Arc::new(PlainChatService::new(
            info.session_id.clone(),
            system_prompt,
            binding,
            self.db.clone(),
        )))
    }
}
