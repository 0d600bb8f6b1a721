//! Tool executor for the terminal chat: deliveries are printed and written
//! back into the in-memory store so later turns see them.

use std::sync::Arc;

use chrono::Utc;
use kuuki_core::io::{InMemoryStore, ToolError, ToolInvoker};
use kuuki_core::types::{ChatId, ContextItem};
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub struct ConsoleTools {
    store: Arc<InMemoryStore>,
    out: mpsc::UnboundedSender<String>,
}

impl ConsoleTools {
    pub fn new(store: Arc<InMemoryStore>, out: mpsc::UnboundedSender<String>) -> Self {
        Self { store, out }
    }

    fn print(&self, line: String) {
        let _ = self.out.send(line);
    }
}

fn str_arg<'a>(tool: &str, args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key).and_then(Value::as_str).ok_or_else(|| ToolError::InvalidArguments {
        tool: tool.to_owned(),
        reason: format!("missing {key}"),
    })
}

#[async_trait::async_trait]
impl ToolInvoker for ConsoleTools {
    async fn execute(&self, chat_id: ChatId, name: &str, args: Value) -> Result<Value, ToolError> {
        let at = Some(Utc::now());
        let item = match name {
            "send_text" => {
                let text = str_arg(name, &args, "message")?.to_owned();
                self.print(format!("kuuki> {text}"));
                ContextItem::BotText { text, at }
            }
            "reply" => {
                let text = str_arg(name, &args, "message")?.to_owned();
                let message_id = args.get("message_id").and_then(Value::as_i64);
                match message_id {
                    Some(id) => self.print(format!("kuuki (re #{id})> {text}")),
                    None => self.print(format!("kuuki> {text}")),
                }
                ContextItem::BotReply { text, reply_to_message_id: message_id, at }
            }
            "note" => {
                let text = str_arg(name, &args, "content")?.to_owned();
                tracing::debug!(chat_id, note = %text, "note written");
                ContextItem::BotNote { text, at }
            }
            "skip" => {
                self.print("kuuki stays quiet".to_owned());
                ContextItem::BotSkip { at }
            }
            "update_memory" => {
                let user_id = args
                    .get("user_id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| ToolError::InvalidArguments { tool: name.to_owned(), reason: "missing user_id".into() })?;
                let memories = str_arg(name, &args, "memories")?;
                self.store.set_user_memory(user_id, memories).map_err(|e| ToolError::failed(name, e))?;
                return Ok(json!({ "ok": true }));
            }
            other => return Err(ToolError::failed(other, "not available in console mode")),
        };
        self.store.push(chat_id, item).map_err(|e| ToolError::failed(name, e))?;
        Ok(json!({ "ok": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_is_printed_and_stored() {
        let store = Arc::new(InMemoryStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tools = ConsoleTools::new(store.clone(), tx);

        tools.execute(7, "reply", json!({"message_id": 3, "message": "sure"})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "kuuki (re #3)> sure");
        assert!(matches!(
            store.items(7).as_slice(),
            [ContextItem::BotReply { reply_to_message_id: Some(3), .. }]
        ));
    }

    #[tokio::test]
    async fn web_tools_are_unavailable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tools = ConsoleTools::new(Arc::new(InMemoryStore::new()), tx);
        let result = tools.execute(7, "search_web", json!({"query": "rust"})).await;
        assert!(matches!(result, Err(ToolError::Failed { .. })));
    }
}
