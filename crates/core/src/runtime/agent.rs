//! Routes inbound messages to per-conversation schedulers, opening a
//! scheduler the first time an admitted chat speaks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigStore;
use crate::decision::{RandomSampler, Sampler};
use crate::dialogue::ConversationSnapshot;
use crate::io::RetrievalStore;
use crate::runtime::RuntimeError;
use crate::runtime::pipeline::TurnRunner;
use crate::runtime::scheduler::{SchedulerHandle, TurnScheduler};
use crate::types::{ChatId, ChatMessage};

const INBOX_BUFFER: usize = 256;

type SamplerFactory = Box<dyn Fn() -> Box<dyn Sampler> + Send + Sync>;

enum AgentCmd {
    Submit(ChatMessage),
    Snapshot(ChatId, oneshot::Sender<Option<ConversationSnapshot>>),
}

/// Inbound side of a running [`Agent`].
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<AgentCmd>,
}

impl AgentHandle {
    pub async fn submit(&self, msg: ChatMessage) -> Result<(), RuntimeError> {
        self.tx
            .send(AgentCmd::Submit(msg))
            .await
            .map_err(|_| RuntimeError::Closed)
    }

    /// `None` when the chat has no open conversation.
    pub async fn snapshot(&self, chat_id: ChatId) -> Result<Option<ConversationSnapshot>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AgentCmd::Snapshot(chat_id, reply))
            .await
            .map_err(|_| RuntimeError::Closed)?;
        rx.await.map_err(|_| RuntimeError::Closed)
    }
}

pub struct Agent {
    configs: ConfigStore,
    store: Arc<dyn RetrievalStore>,
    runner: Arc<dyn TurnRunner>,
    conversations: HashMap<ChatId, SchedulerHandle>,
    sampler: SamplerFactory,
    shutdown: CancellationToken,
    rx: mpsc::Receiver<AgentCmd>,
}

impl Agent {
    pub fn new(
        configs: ConfigStore,
        store: Arc<dyn RetrievalStore>,
        runner: Arc<dyn TurnRunner>,
        shutdown: CancellationToken,
    ) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::channel(INBOX_BUFFER);
        let agent = Self {
            configs,
            store,
            runner,
            conversations: HashMap::new(),
            sampler: Box::new(|| Box::new(RandomSampler::from_entropy())),
            shutdown,
            rx,
        };
        (agent, AgentHandle { tx })
    }

    /// Replace the random source given to each new conversation.
    pub fn with_sampler<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Sampler> + Send + Sync + 'static,
    {
        self.sampler = Box::new(factory);
        self
    }

    pub async fn run(mut self) {
        tracing::info!(configured_chats = self.configs.chat_count(), "kuuki agent started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("shutdown requested, stopping agent");
                    break;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(AgentCmd::Submit(msg)) => self.route(msg).await,
                    Some(AgentCmd::Snapshot(chat_id, reply)) => {
                        let snapshot = match self.conversations.get(&chat_id) {
                            Some(handle) => handle.snapshot().await.ok(),
                            None => None,
                        };
                        let _ = reply.send(snapshot);
                    }
                    None => break,
                },
            }
        }
        tracing::info!(conversations = self.conversations.len(), "kuuki agent stopped");
    }

    async fn route(&mut self, msg: ChatMessage) {
        let chat_id = msg.chat_id;
        let handle = match self.conversations.get(&chat_id) {
            Some(handle) if !handle.is_closed() => handle.clone(),
            _ => match self.open(&msg).await {
                Some(handle) => handle,
                None => {
                    tracing::debug!(chat_id, user_id = msg.author.id, "chat not served, message ignored");
                    return;
                }
            },
        };
        if let Err(e) = handle.submit(msg).await {
            tracing::warn!(chat_id, error = %e, "conversation unavailable");
            self.conversations.remove(&chat_id);
        }
    }

    async fn open(&mut self, msg: &ChatMessage) -> Option<SchedulerHandle> {
        let has_memory = if self.configs.needs_memory_check(msg.chat_id, msg.chat_kind) {
            match self.store.get_user_memory(msg.author.id).await {
                Ok(memory) => memory.is_some(),
                Err(e) => {
                    tracing::warn!(chat_id = msg.chat_id, error = %e, "user memory lookup failed");
                    false
                }
            }
        } else {
            false
        };
        let cfg = self.configs.resolve(msg.chat_id, msg.chat_kind, has_memory)?;

        let handle = TurnScheduler::spawn(
            msg.chat_id,
            Arc::new(cfg),
            (self.sampler)(),
            Arc::clone(&self.store),
            Arc::clone(&self.runner),
            self.shutdown.child_token(),
        );
        self.conversations.insert(msg.chat_id, handle.clone());
        tracing::info!(chat_id = msg.chat_id, kind = ?msg.chat_kind, "conversation opened");
        Some(handle)
    }
}
