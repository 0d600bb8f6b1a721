mod console;

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use kuuki_core::config::{ChatCfg, ConfigStore};
use kuuki_core::io::InMemoryStore;
use kuuki_core::runtime::{Agent, AgentHandle, ShutdownGuard, TurnPipeline};
use kuuki_core::types::{Author, ChatId, ChatMessage, ContextItem, UserId};
use kuuki_llm::invoker::ModelInvoker;
use kuuki_llm::provider::LlmProvider;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::console::ConsoleTools;

const DB_CONNECT_TIMEOUT_SECS: u64 = 3;
const CONSOLE_CHAT: ChatId = -1;
const DEFAULT_LOG_FILE: &str = "/tmp/kuuki.log";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The prompt owns the terminal, so logs go to a file when enabled.
    if std::env::var("RUST_LOG").is_ok() {
        let path = std::env::var("KUUKI_LOG_FILE").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_owned());
        let file = std::fs::File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(fmt::layer().json().with_target(true).with_writer(file))
            .init();
    }

    let mut startup_notice: Option<String> = None;
    let pool = if let Ok(url) = std::env::var("DATABASE_URL") {
        let mut fallback = |reason: String| {
            startup_notice = Some(format!("note: {reason}, running with default settings."));
        };
        match tokio::time::timeout(
            Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(8)
                .connect(&url),
        )
        .await
        {
            Ok(Ok(pool)) => match sqlx::migrate!("../../migrations").run(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => { fallback(format!("migration failed ({e})")); None }
            },
            Ok(Err(e)) => { fallback(format!("cannot connect to DATABASE_URL ({e})")); None }
            Err(_) => { fallback(format!("database connect timed out after {DB_CONNECT_TIMEOUT_SECS}s")); None }
        }
    } else {
        None
    };

    let configs = match pool {
        Some(ref pool) => ConfigStore::load(pool).await?,
        None => ConfigStore::new(ChatCfg::default()),
    };
    let configs = if configs.is_configured(CONSOLE_CHAT) {
        configs
    } else {
        configs.with_chat(CONSOLE_CHAT, HashMap::new())
    };
    let max_retries = configs.base().max_retries;

    let backends: Vec<Arc<dyn LlmProvider>> = kuuki_llm::http::from_env()
        .into_iter()
        .map(|p| Arc::new(p) as Arc<dyn LlmProvider>)
        .collect();
    if backends.is_empty() {
        anyhow::bail!("no model configured: set KUUKI_LLM_MODEL and KUUKI_LLM_API_KEY");
    }
    let lite: Vec<Arc<dyn LlmProvider>> = kuuki_llm::http::lite_from_env()
        .into_iter()
        .map(|p| Arc::new(p) as Arc<dyn LlmProvider>)
        .collect();

    let shutdown = ShutdownGuard::new();
    shutdown.spawn_signal_listener();
    let token = shutdown.token();

    let store = Arc::new(InMemoryStore::new());
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let tools = Arc::new(ConsoleTools::new(Arc::clone(&store), out_tx));
    let pipeline = TurnPipeline::new(store.clone(), tools, ModelInvoker::new(backends, max_retries))
        .with_deliberation(ModelInvoker::new(lite, 1));
    let (agent, handle) = Agent::new(configs, store.clone(), Arc::new(pipeline), token.clone());

    let agent_fut = agent.run();
    let repl_fut = run_repl(handle, store, out_rx, token.clone(), startup_notice);
    tokio::pin!(agent_fut);
    tokio::pin!(repl_fut);

    tokio::select! {
        _ = &mut agent_fut => {
            token.cancel();
            (&mut repl_fut).await
        }
        result = &mut repl_fut => {
            token.cancel();
            (&mut agent_fut).await;
            result
        }
    }
}

/// Who is typing in the console group chat. `/as <name>` switches speaker.
struct Speakers {
    ids: HashMap<String, UserId>,
    current: Author,
}

impl Speakers {
    fn new(name: &str) -> Self {
        let mut speakers = Self { ids: HashMap::new(), current: Author::new(0, name) };
        speakers.switch(name);
        speakers
    }

    fn switch(&mut self, name: &str) {
        let next_id = 1000 + self.ids.len() as UserId;
        let id = *self.ids.entry(name.to_owned()).or_insert(next_id);
        self.current = Author::new(id, name);
    }
}

async fn run_repl(
    agent: AgentHandle,
    store: Arc<InMemoryStore>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    token: CancellationToken,
    startup_notice: Option<String>,
) -> anyhow::Result<()> {
    if let Some(notice) = startup_notice {
        println!("{notice}");
    }
    println!("console group chat. /as <name> switches speaker, /quit exits.");

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<InputEvent>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    spawn_input_thread(line_tx, ready_rx);
    request_next_prompt(&ready_tx);

    let mut speakers = Speakers::new("you");
    let mut next_message_id: i64 = 1;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = line_rx.recv() => {
                let Some(line) = line else {
                    break;
                };
                match line {
                    InputEvent::Line(line) => {
                        let text = line.trim();
                        if matches!(text, "/q" | "/exit" | "/quit") {
                            break;
                        }
                        if let Some(name) = text.strip_prefix("/as ") {
                            speakers.switch(name.trim());
                            println!("now speaking as {}", speakers.current.display_name);
                        } else if !text.is_empty() {
                            let msg = ChatMessage::group(CONSOLE_CHAT, next_message_id, speakers.current.clone(), text);
                            next_message_id += 1;
                            store.push(CONSOLE_CHAT, ContextItem::from_message(&msg))?;
                            if agent.submit(msg).await.is_err() {
                                break;
                            }
                        }
                        request_next_prompt(&ready_tx);
                    }
                    InputEvent::Interrupted => {
                        token.cancel();
                        break;
                    }
                    InputEvent::Eof => break,
                    InputEvent::Error(err) => {
                        eprintln!("input error: {err}");
                        break;
                    }
                }
            }
            out = out_rx.recv() => {
                let Some(out) = out else {
                    break;
                };
                print!("\r\x1b[2K{out}\n");
                io::stdout().flush()?;
            }
        }
    }
    drop(ready_tx);
    println!();
    Ok(())
}

fn request_next_prompt(ready_tx: &std::sync::mpsc::Sender<()>) {
    let _ = ready_tx.send(());
}

fn spawn_input_thread(
    line_tx: mpsc::UnboundedSender<InputEvent>,
    ready_rx: std::sync::mpsc::Receiver<()>,
) {
    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(InputEvent::Error(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            match editor.readline("> ") {
                Ok(line) => {
                    if line_tx.send(InputEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    let _ = line_tx.send(InputEvent::Interrupted);
                    break;
                }
                Err(ReadlineError::Eof) => {
                    let _ = line_tx.send(InputEvent::Eof);
                    break;
                }
                Err(e) => {
                    let _ = line_tx.send(InputEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    });
}

enum InputEvent {
    Line(String),
    Interrupted,
    Eof,
    Error(String),
}
