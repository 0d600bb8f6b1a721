use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;

use crate::types::{ChatId, ChatKind, UserId};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Which private chats are served when they have no explicit config entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrivateChatMode {
    /// Only chats listed in `kuuki_chat_config`.
    #[default]
    ConfiguredOnly,
    /// Private chats whose user already has a stored memory.
    KnownUsers,
    /// Every private chat.
    Open,
}

impl FromStr for PrivateChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" | "configured" => Ok(Self::ConfiguredOnly),
            "1" | "known" => Ok(Self::KnownUsers),
            "2" | "open" => Ok(Self::Open),
            other => Err(format!("unknown private chat mode: {other}")),
        }
    }
}

impl std::fmt::Display for PrivateChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Self::ConfiguredOnly => 0,
            Self::KnownUsers => 1,
            Self::Open => 2,
        };
        write!(f, "{code}")
    }
}

/// Per-conversation parameters. Loaded from the `kuuki_config` table at
/// startup, then overlaid with the chat's rows from `kuuki_chat_config`.
/// Immutable once a conversation has been created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCfg {
    // identity
    pub bot_user_id: UserId,
    pub bot_username: String,

    // triggering
    pub trigger_words: Vec<String>,
    pub ignore_words: Vec<String>,
    pub blacklist_users: Vec<UserId>,
    pub cooldown_ms: u64,
    pub private_chat_mode: PrivateChatMode,

    // response rate
    pub initial_response_rate: f64,
    pub response_rate_min: f64,
    pub response_rate_max: f64,
    pub mention_multiplier: f64,
    pub trigger_word_multiplier: f64,
    pub decay_rate_per_min: f64,
    pub decay_interval_ms: u64,
    pub reply_rate_boost: f64,
    pub skip_rate_decay: f64,

    // scheduling
    pub interrupt_timeout_ms: u64,
    pub max_interruptions: u32,

    // model calls
    pub max_retries: usize,
    pub retry_backoff_ms: u64,

    // action loop
    pub max_stack_depth: u32,
    pub max_allowed_diff: usize,
    pub context_limit: usize,
    pub related_notes_limit: usize,
    pub related_notes_window_hours: i64,
    pub history_search_limit: usize,
    pub recall_limit: usize,
    pub utc_offset_minutes: i32,

    // prompts
    pub system_prompt: String,
    pub task_prompt: String,
    pub jailbreak_prompt: String,
    pub deliberation_system_prompt: String,
    pub deliberation_task_prompt: String,
}

impl Default for ChatCfg {
    fn default() -> Self {
        Self {
            bot_user_id: 0,
            bot_username: "kuuki_bot".into(),
            trigger_words: Vec::new(),
            ignore_words: Vec::new(),
            blacklist_users: Vec::new(),
            cooldown_ms: 1000,
            private_chat_mode: PrivateChatMode::ConfiguredOnly,
            initial_response_rate: 0.05,
            response_rate_min: 0.05,
            response_rate_max: 0.7,
            mention_multiplier: 0.2,
            trigger_word_multiplier: 0.2,
            decay_rate_per_min: 0.1,
            decay_interval_ms: 20_000,
            reply_rate_boost: 0.1,
            skip_rate_decay: 0.2,
            interrupt_timeout_ms: 5000,
            max_interruptions: 2,
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_stack_depth: 5,
            max_allowed_diff: 2,
            context_limit: 25,
            related_notes_limit: 10,
            related_notes_window_hours: 24 * 7,
            history_search_limit: 5,
            recall_limit: 10,
            utc_offset_minutes: 8 * 60,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            task_prompt: DEFAULT_TASK_PROMPT.into(),
            jailbreak_prompt: String::new(),
            deliberation_system_prompt: DEFAULT_DELIBERATION_SYSTEM_PROMPT.into(),
            deliberation_task_prompt: DEFAULT_DELIBERATION_TASK_PROMPT.into(),
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a regular member of a group chat. \
Talk like a person: short messages, no lists, no assistant phrasing. \
Only speak when you have something worth adding.";

const DEFAULT_TASK_PROMPT: &str = "Read the chat history above and decide what to do. \
Use the tools to act. Several tools may be called in one response; \
a search or fetch must be the last call.";

const DEFAULT_DELIBERATION_SYSTEM_PROMPT: &str = "You decide whether a chat bot should \
join the conversation, and gather background it may need. You never write chat messages.";

const DEFAULT_DELIBERATION_TASK_PROMPT: &str = "Call skip if the bot should stay quiet. \
Call join to let it speak. Use recall_history, web_answer or fetch_url first if the \
reply needs facts the chat history does not contain.";

impl ChatCfg {
    /// Load config from `kuuki_config` table. If table is empty, seed with defaults.
    pub async fn load(pool: &PgPool) -> Result<Self, ConfigError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM kuuki_config")
            .fetch_all(pool)
            .await?;

        if rows.is_empty() {
            let cfg = Self::default();
            cfg.seed(pool).await?;
            return Ok(cfg);
        }

        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Write all default values into `kuuki_config` table.
    async fn seed(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        for (key, value, desc) in &self.to_entries() {
            sqlx::query(
                "INSERT INTO kuuki_config (key, value, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(desc)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub fn from_map(m: &HashMap<String, String>) -> Self {
        Self::default().overlay(m)
    }

    /// Copy of `self` with every key present in `m` replaced. Unparseable
    /// values keep the current setting.
    pub fn overlay(&self, m: &HashMap<String, String>) -> Self {
        let d = self;
        Self {
            bot_user_id: get_or(m, "bot_user_id", d.bot_user_id),
            bot_username: get_or(m, "bot_username", d.bot_username.clone()),
            trigger_words: get_list_or(m, "trigger_words", &d.trigger_words),
            ignore_words: get_list_or(m, "ignore_words", &d.ignore_words),
            blacklist_users: get_list_or(m, "blacklist_users", &d.blacklist_users),
            cooldown_ms: get_or(m, "cooldown_ms", d.cooldown_ms),
            private_chat_mode: get_or(m, "private_chat_mode", d.private_chat_mode),
            initial_response_rate: get_or(m, "initial_response_rate", d.initial_response_rate),
            response_rate_min: get_or(m, "response_rate_min", d.response_rate_min),
            response_rate_max: get_or(m, "response_rate_max", d.response_rate_max),
            mention_multiplier: get_or(m, "mention_multiplier", d.mention_multiplier),
            trigger_word_multiplier: get_or(m, "trigger_word_multiplier", d.trigger_word_multiplier),
            decay_rate_per_min: get_or(m, "decay_rate_per_min", d.decay_rate_per_min),
            decay_interval_ms: get_or(m, "decay_interval_ms", d.decay_interval_ms),
            reply_rate_boost: get_or(m, "reply_rate_boost", d.reply_rate_boost),
            skip_rate_decay: get_or(m, "skip_rate_decay", d.skip_rate_decay),
            interrupt_timeout_ms: get_or(m, "interrupt_timeout_ms", d.interrupt_timeout_ms),
            max_interruptions: get_or(m, "max_interruptions", d.max_interruptions),
            max_retries: get_or(m, "max_retries", d.max_retries),
            retry_backoff_ms: get_or(m, "retry_backoff_ms", d.retry_backoff_ms),
            max_stack_depth: get_or(m, "max_stack_depth", d.max_stack_depth),
            max_allowed_diff: get_or(m, "max_allowed_diff", d.max_allowed_diff),
            context_limit: get_or(m, "context_limit", d.context_limit),
            related_notes_limit: get_or(m, "related_notes_limit", d.related_notes_limit),
            related_notes_window_hours: get_or(m, "related_notes_window_hours", d.related_notes_window_hours),
            history_search_limit: get_or(m, "history_search_limit", d.history_search_limit),
            recall_limit: get_or(m, "recall_limit", d.recall_limit),
            utc_offset_minutes: get_or(m, "utc_offset_minutes", d.utc_offset_minutes),
            system_prompt: get_or(m, "system_prompt", d.system_prompt.clone()),
            task_prompt: get_or(m, "task_prompt", d.task_prompt.clone()),
            jailbreak_prompt: get_or(m, "jailbreak_prompt", d.jailbreak_prompt.clone()),
            deliberation_system_prompt: get_or(m, "deliberation_system_prompt", d.deliberation_system_prompt.clone()),
            deliberation_task_prompt: get_or(m, "deliberation_task_prompt", d.deliberation_task_prompt.clone()),
        }
    }

    fn to_entries(&self) -> Vec<(&str, String, &str)> {
        vec![
            ("bot_user_id", self.bot_user_id.to_string(), "Bot account user id"),
            ("bot_username", self.bot_username.clone(), "Bot handle, matched as @handle"),
            ("trigger_words", list(&self.trigger_words), "JSON array of words that may trigger a reply"),
            ("ignore_words", list(&self.ignore_words), "JSON array of words that suppress any reply"),
            ("blacklist_users", list(&self.blacklist_users), "JSON array of user ids hidden from the model"),
            ("cooldown_ms", self.cooldown_ms.to_string(), "Minimum gap between acted turns ms"),
            ("private_chat_mode", self.private_chat_mode.to_string(), "0 configured only, 1 known users, 2 all private chats"),
            ("initial_response_rate", self.initial_response_rate.to_string(), "Response rate at conversation start"),
            ("response_rate_min", self.response_rate_min.to_string(), "Response rate floor"),
            ("response_rate_max", self.response_rate_max.to_string(), "Response rate ceiling"),
            ("mention_multiplier", self.mention_multiplier.to_string(), "Rate gain per mention"),
            ("trigger_word_multiplier", self.trigger_word_multiplier.to_string(), "Rate gain per trigger word"),
            ("decay_rate_per_min", self.decay_rate_per_min.to_string(), "Rate decay per idle minute"),
            ("decay_interval_ms", self.decay_interval_ms.to_string(), "Periodic rate adjustment interval ms"),
            ("reply_rate_boost", self.reply_rate_boost.to_string(), "Rate gain per delivered message"),
            ("skip_rate_decay", self.skip_rate_decay.to_string(), "Rate loss per skip"),
            ("interrupt_timeout_ms", self.interrupt_timeout_ms.to_string(), "Window after turn start in which new messages preempt ms"),
            ("max_interruptions", self.max_interruptions.to_string(), "Max restarts of one turn"),
            ("max_retries", self.max_retries.to_string(), "Model call attempts per request"),
            ("retry_backoff_ms", self.retry_backoff_ms.to_string(), "Pause between model attempts ms"),
            ("max_stack_depth", self.max_stack_depth.to_string(), "Max follow-up rounds per turn"),
            ("max_allowed_diff", self.max_allowed_diff.to_string(), "Char difference at or below which a message is a duplicate"),
            ("context_limit", self.context_limit.to_string(), "Transcript items fetched per turn"),
            ("related_notes_limit", self.related_notes_limit.to_string(), "Related notes fetched per turn"),
            ("related_notes_window_hours", self.related_notes_window_hours.to_string(), "Max age of related notes hours"),
            ("history_search_limit", self.history_search_limit.to_string(), "Results per search_history call"),
            ("recall_limit", self.recall_limit.to_string(), "Results per recall_history call"),
            ("utc_offset_minutes", self.utc_offset_minutes.to_string(), "Local time offset shown to the model"),
            ("system_prompt", self.system_prompt.clone(), "Persona prompt"),
            ("task_prompt", self.task_prompt.clone(), "Task prompt"),
            ("jailbreak_prompt", self.jailbreak_prompt.clone(), "Closing prompt"),
            ("deliberation_system_prompt", self.deliberation_system_prompt.clone(), "Deliberation persona prompt"),
            ("deliberation_task_prompt", self.deliberation_task_prompt.clone(), "Deliberation task prompt"),
        ]
    }
}

/// Base config, per-chat overrides and the private-chat admission policy.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    base: ChatCfg,
    chats: HashMap<ChatId, HashMap<String, String>>,
}

impl ConfigStore {
    pub fn new(base: ChatCfg) -> Self {
        Self { base, chats: HashMap::new() }
    }

    /// Load base config and every per-chat override row.
    pub async fn load(pool: &PgPool) -> Result<Self, ConfigError> {
        let base = ChatCfg::load(pool).await?;
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT chat_id, key, value FROM kuuki_chat_config")
                .fetch_all(pool)
                .await?;

        let mut store = Self::new(base);
        for (chat_id, key, value) in rows {
            store.chats.entry(chat_id).or_default().insert(key, value);
        }
        tracing::info!(chats = store.chats.len(), "chat config loaded");
        Ok(store)
    }

    pub fn with_chat(mut self, chat_id: ChatId, overrides: HashMap<String, String>) -> Self {
        self.chats.insert(chat_id, overrides);
        self
    }

    pub fn base(&self) -> &ChatCfg {
        &self.base
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    pub fn is_configured(&self, chat_id: ChatId) -> bool {
        self.chats.contains_key(&chat_id)
    }

    /// Whether admitting this chat depends on the user having a stored memory.
    pub fn needs_memory_check(&self, chat_id: ChatId, kind: ChatKind) -> bool {
        kind == ChatKind::Private
            && !self.is_configured(chat_id)
            && self.base.private_chat_mode == PrivateChatMode::KnownUsers
    }

    /// Effective config for a chat, or `None` when the chat is not served.
    pub fn resolve(&self, chat_id: ChatId, kind: ChatKind, has_memory: bool) -> Option<ChatCfg> {
        if let Some(overrides) = self.chats.get(&chat_id) {
            return Some(self.base.overlay(overrides));
        }
        if kind != ChatKind::Private {
            return None;
        }
        match self.base.private_chat_mode {
            PrivateChatMode::Open => Some(self.base.clone()),
            PrivateChatMode::KnownUsers if has_memory => Some(self.base.clone()),
            _ => None,
        }
    }
}

fn get_or<T: FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_list_or<T>(map: &HashMap<String, String>, key: &str, default: &[T]) -> Vec<T>
where
    T: Clone + serde::de::DeserializeOwned,
{
    map.get(key)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_else(|| default.to_vec())
}

fn list<T: Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}
