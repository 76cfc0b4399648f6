//! OneBot v11 bridge.
//!
//! A forward WebSocket client: message events come in, replies and pushed
//! reports go back out as API action frames. Private messages always reach
//! the hub; group messages only when they at-mention the bot. Outbound
//! frames travel through a flume channel so the pusher handle can be
//! shared with the scheduler while the writer task owns the sink.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::config::BotConfig;
use crate::hub::ChatHub;
use crate::pusher::{split_message, MessagePusher};

// ─── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OneBotEvent {
    #[serde(default)]
    post_type: Option<String>,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    group_id: Option<i64>,
    #[serde(default)]
    self_id: Option<i64>,
    #[serde(default)]
    message: Value,
}

/// Concatenate the text segments of a message. Segment arrays are the
/// normal case; a bare string body is passed through as-is.
fn extract_text(message: &Value) -> String {
    match message {
        Value::String(text) => text.trim().to_string(),
        Value::Array(segments) => segments
            .iter()
            .filter(|seg| seg["type"] == "text")
            .filter_map(|seg| seg["data"]["text"].as_str())
            .collect::<String>()
            .trim()
            .to_string(),
        _ => String::new(),
    }
}

/// Whether a segment array at-mentions the given account. The `qq` field
/// arrives as a string or a number depending on the implementation.
fn mentions_self(message: &Value, self_id: i64) -> bool {
    let Value::Array(segments) = message else {
        return false;
    };
    segments.iter().any(|seg| {
        if seg["type"] != "at" {
            return false;
        }
        let qq = &seg["data"]["qq"];
        qq.as_i64() == Some(self_id)
            || qq.as_str().and_then(|s| s.parse::<i64>().ok()) == Some(self_id)
    })
}

// ─── Outbound pusher ──────────────────────────────────────────────────────

pub struct OneBotPusher {
    frames: flume::Sender<Value>,
    max_chunk_len: usize,
}

impl OneBotPusher {
    pub fn new(frames: flume::Sender<Value>, max_chunk_len: usize) -> Self {
        Self {
            frames,
            max_chunk_len,
        }
    }

    fn enqueue(&self, frame: Value) -> Result<()> {
        self.frames
            .send(frame)
            .map_err(|_| anyhow::anyhow!("OneBot writer is gone"))
    }
}

#[async_trait]
impl MessagePusher for OneBotPusher {
    async fn send_private(&self, user_id: i64, message: &str) -> Result<()> {
        for chunk in split_message(message, self.max_chunk_len) {
            self.enqueue(json!({
                "action": "send_private_msg",
                "params": { "user_id": user_id, "message": chunk },
            }))?;
        }
        Ok(())
    }

    async fn send_group(&self, group_id: i64, message: &str) -> Result<()> {
        for chunk in split_message(message, self.max_chunk_len) {
            self.enqueue(json!({
                "action": "send_group_msg",
                "params": { "group_id": group_id, "message": chunk },
            }))?;
        }
        Ok(())
    }
}

// ─── Adapter loop ─────────────────────────────────────────────────────────

/// Connect and run until the connection drops. The caller owns reconnect
/// policy.
pub async fn run_onebot_adapter(
    hub: ChatHub,
    config: &BotConfig,
    frames: flume::Receiver<Value>,
    pusher: Arc<OneBotPusher>,
) -> Result<()> {
    let (ws, _) = connect_async(config.onebot_ws_url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", config.onebot_ws_url))?;
    tracing::info!("OneBot adapter connected to {}", config.onebot_ws_url);

    let (mut sink, mut stream) = ws.split();

    let writer = tokio::spawn(async move {
        while let Ok(frame) = frames.recv_async().await {
            if let Err(e) = sink.send(WsMessage::Text(frame.to_string())).await {
                tracing::error!("OneBot send failed: {}", e);
                break;
            }
        }
    });

    let self_id = config.bot_self_id;
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!("OneBot stream error: {}", e);
                break;
            }
        };
        let WsMessage::Text(text) = msg else { continue };
        let Ok(event) = serde_json::from_str::<OneBotEvent>(&text) else {
            continue;
        };
        if event.post_type.as_deref() != Some("message") {
            continue;
        }
        let Some(user_id) = event.user_id else { continue };

        let incoming = extract_text(&event.message);
        if incoming.is_empty() {
            continue;
        }

        match event.message_type.as_deref() {
            Some("private") => {
                tracing::info!("OneBot [private {}]: {:?}", user_id, incoming);
                let reply = hub.handle_message(user_id, &incoming).await;
                if let Err(e) = pusher.send_private(user_id, &reply).await {
                    tracing::error!("Failed to reply to user {}: {:#}", user_id, e);
                }
            }
            Some("group") => {
                let bot_id = event.self_id.unwrap_or(self_id);
                if !mentions_self(&event.message, bot_id) {
                    continue;
                }
                let Some(group_id) = event.group_id else { continue };
                tracing::info!("OneBot [group {} / {}]: {:?}", group_id, user_id, incoming);
                let reply = hub.handle_message(user_id, &incoming).await;
                if let Err(e) = pusher.send_group(group_id, &reply).await {
                    tracing::error!("Failed to reply to group {}: {:#}", group_id, e);
                }
            }
            _ => {}
        }
    }

    tracing::warn!("OneBot connection closed");
    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_extracted_from_segments_and_strings() {
        let segments = json!([
            {"type": "at", "data": {"qq": "12345"}},
            {"type": "text", "data": {"text": " hello "}},
            {"type": "image", "data": {"file": "x.png"}},
            {"type": "text", "data": {"text": "there"}},
        ]);
        assert_eq!(extract_text(&segments), "hello there");
        assert_eq!(extract_text(&json!("  plain body  ")), "plain body");
        assert_eq!(extract_text(&json!(null)), "");
    }

    #[test]
    fn at_mention_matches_string_and_numeric_ids() {
        let as_string = json!([{"type": "at", "data": {"qq": "777"}}]);
        let as_number = json!([{"type": "at", "data": {"qq": 777}}]);
        let other = json!([{"type": "at", "data": {"qq": "888"}}]);

        assert!(mentions_self(&as_string, 777));
        assert!(mentions_self(&as_number, 777));
        assert!(!mentions_self(&other, 777));
        assert!(!mentions_self(&json!("no segments"), 777));
    }

    #[tokio::test]
    async fn pusher_splits_long_messages_into_frames() {
        let (tx, rx) = flume::unbounded();
        let pusher = OneBotPusher::new(tx, 10);

        pusher
            .send_group(5, "first line\nsecond line")
            .await
            .unwrap();

        let frames: Vec<Value> = rx.drain().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["action"], "send_group_msg");
        assert_eq!(frames[0]["params"]["group_id"], 5);
        assert_eq!(frames[0]["params"]["message"], "first line");
        assert_eq!(frames[1]["params"]["message"], "second line");
    }
}
