//! `chatrelay chat`: a line-oriented console client driving the orchestrator against a proxy.

use crate::constants::WAKEUP_MAX_POLLS;
use crate::main_helper::ChatArgs;
use crate::orchestrator::backend::HttpBackend;
use crate::orchestrator::store::{ConversationStore, Phase, StoreEvent};
use crate::orchestrator::{ChatOrchestrator, OrchestratorConfig, SubmitOutcome};
use crate::todos::{FileStore, KeyValueStore, TodoList};
use crate::types::*;
use base64::Engine;
use colored::*;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum TodoCommand {
    Add(String),
    Toggle(i64),
    Remove(i64),
    List,
    ClearCompleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Prompt(String),
    SwitchMode(Mode),
    Attach(String),
    Cancel,
    Todo(TodoCommand),
    Status,
    Clear,
    Help,
    Quit,
}

const HELP: &str = "\
/mode <general|coding|vision|media|todo>  switch mode
/attach <path>                            attach an image for the next vision prompt
/cancel                                   cancel the request in the current mode (also Ctrl-C)
/todo add <text> | done <id> | rm <id> | ls | clean
/status                                   show model readiness
/clear                                    clear the current conversation
/quit";

fn parse_id(arg: &str) -> Result<i64> {
    arg.trim()
        .parse()
        .map_err(|_| RelayError::InvalidRequest(format!("'{}' is not a to-do id", arg.trim())).into())
}

pub fn parse_command(line: &str) -> Result<ReplCommand> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(ReplCommand::Prompt(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match name {
        "mode" => ReplCommand::SwitchMode(arg.parse()?),
        "attach" if !arg.is_empty() => ReplCommand::Attach(arg.to_string()),
        "cancel" => ReplCommand::Cancel,
        "status" => ReplCommand::Status,
        "clear" => ReplCommand::Clear,
        "help" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        "todo" => {
            let (sub, value) = match arg.split_once(char::is_whitespace) {
                Some((sub, value)) => (sub, value.trim()),
                None => (arg, ""),
            };
            ReplCommand::Todo(match sub {
                "add" => TodoCommand::Add(value.to_string()),
                "done" => TodoCommand::Toggle(parse_id(value)?),
                "rm" => TodoCommand::Remove(parse_id(value)?),
                "ls" | "" => TodoCommand::List,
                "clean" => TodoCommand::ClearCompleted,
                other => {
                    return Err(RelayError::InvalidRequest(format!(
                        "unknown /todo command '{}'",
                        other
                    ))
                    .into())
                }
            })
        }
        other => {
            return Err(
                RelayError::InvalidRequest(format!("unknown command '/{}', try /help", other))
                    .into(),
            )
        }
    };
    Ok(command)
}

/// Reads an image file into a data URL for vision prompts.
pub fn load_attachment(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(crate::str_utils::to_data_url(mime, &b64))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Streamed text, printed without a newline.
    Fragment(String),
    Line(String),
    Status(String),
}

/// Turns store events into console output for the active mode.
#[derive(Default)]
pub struct Renderer {
    printed_draft: HashMap<Mode, usize>,
    streamed: HashSet<Uuid>,
    seen: HashSet<Uuid>,
    transient: HashMap<Uuid, String>,
}

impl Renderer {
    pub fn render(&mut self, store: &ConversationStore, active: Mode, event: &StoreEvent) -> Vec<Output> {
        match event {
            StoreEvent::DraftChanged(mode) if *mode == active => {
                let printed = self.printed_draft.entry(*mode).or_default();
                match store.draft(*mode) {
                    Some(draft) => {
                        self.streamed.insert(draft.id);
                        let fresh = draft.content.get(*printed..).unwrap_or_default().to_string();
                        *printed = draft.content.len();
                        if fresh.is_empty() {
                            Vec::new()
                        } else {
                            vec![Output::Fragment(fresh)]
                        }
                    }
                    // Committed or discarded: end the streamed line.
                    None if *printed > 0 => {
                        *printed = 0;
                        vec![Output::Line(String::new())]
                    }
                    None => Vec::new(),
                }
            }
            StoreEvent::HistoryChanged(mode) if *mode == active => {
                let mut out = Vec::new();
                for message in store.history(*mode) {
                    if message.is_transient() {
                        if self.transient.get(&message.id) != Some(&message.content) {
                            self.transient.insert(message.id, message.content.clone());
                            out.push(Output::Status(message.content));
                        }
                        continue;
                    }
                    if !self.seen.insert(message.id) || message.role == Role::User {
                        continue;
                    }
                    if self.streamed.remove(&message.id) {
                        continue;
                    } else if let Some(image) = &message.image {
                        out.push(Output::Line(format!(
                            "[image ready: {} chars of data URL] {}",
                            image.len(),
                            message.prompt.as_deref().unwrap_or_default()
                        )));
                    } else {
                        out.push(Output::Line(message.content));
                    }
                }
                out
            }
            StoreEvent::PhaseChanged(mode, Phase::Retrying) if *mode == active => {
                self.printed_draft.insert(*mode, 0);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

fn print_outputs(outputs: Vec<Output>) {
    let mut stdout = std::io::stdout();
    for output in outputs {
        let _ = match output {
            Output::Fragment(text) => write!(stdout, "{}", text),
            Output::Line(text) => writeln!(stdout, "{}", text),
            Output::Status(text) => writeln!(stdout, "{}", text.dimmed()),
        };
    }
    let _ = stdout.flush();
}

fn spawn_renderer(store: ConversationStore, active: watch::Receiver<Mode>) -> tokio::task::JoinHandle<()> {
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        let mut renderer = Renderer::default();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let mode = *active.borrow();
                    print_outputs(renderer.render(&store, mode, &event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Renderer lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_todos<S: KeyValueStore>(todos: &TodoList<S>) -> Result<()> {
    let items = todos.list()?;
    if items.is_empty() {
        println!("{}", "No to-dos yet.".dimmed());
    }
    for item in items {
        let mark = if item.completed { "[x]".green() } else { "[ ]".normal() };
        println!("{} {} {}", mark, item.id.to_string().dimmed(), item.text);
    }
    Ok(())
}

fn run_todo<S: KeyValueStore>(todos: &TodoList<S>, command: TodoCommand) -> Result<()> {
    match command {
        TodoCommand::Add(text) => {
            let item = todos.add(&text)?;
            println!("{} {}", "added".green(), item.id);
        }
        TodoCommand::Toggle(id) => match todos.toggle(id)? {
            Some(item) => println!("{} {}", if item.completed { "done" } else { "reopened" }, item.text),
            None => println!("{}", format!("no to-do with id {}", id).yellow()),
        },
        TodoCommand::Remove(id) => {
            if !todos.remove(id)? {
                println!("{}", format!("no to-do with id {}", id).yellow());
            }
        }
        TodoCommand::List => print_todos(todos)?,
        TodoCommand::ClearCompleted => println!("removed {} completed", todos.clear_completed()?),
    }
    Ok(())
}

/// Submits `text`, taking the pending attachment in vision mode.
/// A refused submission puts the attachment back so it can be resent.
pub(crate) async fn submit_with_attachment(
    orchestrator: &ChatOrchestrator,
    mode: Mode,
    text: &str,
    pending: &Mutex<Option<String>>,
) -> Result<SubmitOutcome> {
    let image = if mode == Mode::Vision {
        pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    } else {
        None
    };
    let result = orchestrator.submit(mode, text, image.clone()).await;
    if result.is_err() {
        let mut slot = pending.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = image;
        }
    }
    result
}

async fn wait_for_model(orchestrator: &ChatOrchestrator) {
    println!("{}", "Waking up the model...".dimmed());
    let token = CancellationToken::new();
    let interrupt = token.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });
    match orchestrator.await_ready(WAKEUP_MAX_POLLS, &token).await {
        Ok(status) => match status.status {
            WakeupState::Ready => println!("{}", "Model is ready.".green()),
            WakeupState::Loading => println!("{}", "Model is still loading; prompts may be retried.".yellow()),
            WakeupState::Offline => println!(
                "{} {}",
                "Model is offline:".red(),
                status.detail.unwrap_or_default()
            ),
        },
        Err(e) => println!("{} {}", "Could not wake the model:".red(), e),
    }
    ctrl_c.abort();
}

pub async fn run(args: ChatArgs) -> Result<()> {
    let backend = Arc::new(HttpBackend::new(args.proxy_url.clone())?);
    let config = OrchestratorConfig {
        text_timeout: Duration::from_secs(args.text_timeout_secs),
        artifact_timeout: Duration::from_secs(args.artifact_timeout_secs),
        ..Default::default()
    };
    let orchestrator = ChatOrchestrator::new(backend, config);
    let todos = TodoList::new(FileStore::new(&args.todo_file));

    let (mode_tx, mode_rx) = watch::channel(args.mode);
    let renderer = spawn_renderer(orchestrator.store().clone(), mode_rx);

    if !args.no_wait {
        wait_for_model(&orchestrator).await;
    }
    println!("{} {} {}", "chatrelay".bold(), "mode:".dimmed(), args.mode.as_str().cyan());
    println!("{}", "Type /help for commands.".dimmed());

    let attachment: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let mode = *mode_tx.borrow();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                if !orchestrator.cancel(mode) {
                    break;
                }
                println!("{}", "cancelled".yellow());
                continue;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e.to_string().yellow());
                continue;
            }
        };

        match command {
            ReplCommand::Quit => break,
            ReplCommand::Help => println!("{}", HELP),
            ReplCommand::SwitchMode(next) => {
                mode_tx.send_replace(next);
                println!("{} {}", "mode:".dimmed(), next.as_str().cyan());
            }
            ReplCommand::Attach(path) => match load_attachment(Path::new(&path)) {
                Ok(data_url) => {
                    println!("{} {}", "attached".green(), path);
                    *attachment.lock().unwrap_or_else(|e| e.into_inner()) = Some(data_url);
                }
                Err(e) => println!("{} {}", "could not attach:".red(), e),
            },
            ReplCommand::Cancel => {
                if !orchestrator.cancel(mode) {
                    println!("{}", "nothing to cancel".dimmed());
                }
            }
            ReplCommand::Clear => {
                if let Err(e) = orchestrator.clear(mode) {
                    println!("{}", e.to_string().yellow());
                }
            }
            ReplCommand::Status => match orchestrator.model_status().await {
                Ok(report) => {
                    for (model, readiness) in report {
                        let label = match readiness {
                            ModelReadiness::Online => "online".green(),
                            ModelReadiness::Loading => "loading".yellow(),
                            ModelReadiness::Offline => "offline".red(),
                        };
                        println!("{:<50} {}", model, label);
                    }
                }
                Err(e) => println!("{} {}", "status failed:".red(), e),
            },
            ReplCommand::Todo(todo) => {
                if let Err(e) = run_todo(&todos, todo) {
                    println!("{}", e.to_string().yellow());
                }
            }
            ReplCommand::Prompt(text) if mode == Mode::Todo => {
                if let Err(e) = run_todo(&todos, TodoCommand::Add(text)) {
                    println!("{}", e.to_string().yellow());
                }
            }
            ReplCommand::Prompt(text) => {
                let orchestrator = orchestrator.clone();
                let attachment = attachment.clone();
                tokio::spawn(async move {
                    match submit_with_attachment(&orchestrator, mode, &text, &attachment).await {
                        Ok(SubmitOutcome::Cancelled) => {
                            tracing::debug!("[{}] submission cancelled", mode)
                        }
                        Ok(_) => {}
                        Err(e) => println!("{}", e.to_string().yellow()),
                    }
                });
            }
        }
    }

    for mode in Mode::ALL {
        orchestrator.cancel(mode);
    }
    renderer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_prompt() {
        assert_eq!(
            parse_command("  hello there ").unwrap(),
            ReplCommand::Prompt("hello there".into())
        );
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(
            parse_command("/mode code").unwrap(),
            ReplCommand::SwitchMode(Mode::Coding)
        );
        assert_eq!(
            parse_command("/todo add buy milk").unwrap(),
            ReplCommand::Todo(TodoCommand::Add("buy milk".into()))
        );
        assert_eq!(
            parse_command("/todo done 42").unwrap(),
            ReplCommand::Todo(TodoCommand::Toggle(42))
        );
        assert_eq!(parse_command("/todo").unwrap(), ReplCommand::Todo(TodoCommand::List));
        assert_eq!(parse_command("/quit").unwrap(), ReplCommand::Quit);
        assert!(parse_command("/todo rm abc").is_err());
        assert!(parse_command("/mode nonsense").is_err());
        assert!(parse_command("/frobnicate").is_err());
        assert!(parse_command("/attach").is_err());
    }

    #[test]
    fn renderer_prints_only_new_draft_text_then_ends_the_line() {
        let store = ConversationStore::new();
        let mut renderer = Renderer::default();
        let mode = Mode::General;

        store.push(mode, Message::user("hi"));
        assert!(renderer
            .render(&store, mode, &StoreEvent::HistoryChanged(mode))
            .is_empty());

        store.open_draft(mode);
        store.append_draft(mode, "Hel");
        assert_eq!(
            renderer.render(&store, mode, &StoreEvent::DraftChanged(mode)),
            vec![Output::Fragment("Hel".into())]
        );
        store.append_draft(mode, "lo");
        assert_eq!(
            renderer.render(&store, mode, &StoreEvent::DraftChanged(mode)),
            vec![Output::Fragment("lo".into())]
        );

        store.commit_draft(mode);
        assert_eq!(
            renderer.render(&store, mode, &StoreEvent::DraftChanged(mode)),
            vec![Output::Line(String::new())]
        );
        assert!(renderer
            .render(&store, mode, &StoreEvent::HistoryChanged(mode))
            .is_empty());
    }

    #[test]
    fn renderer_shows_placeholder_progress_once_per_change() {
        let store = ConversationStore::new();
        let mut renderer = Renderer::default();
        let mode = Mode::Media;
        let placeholder = Message::placeholder("Sketching...");
        let id = placeholder.id;
        store.push(mode, placeholder);

        let event = StoreEvent::HistoryChanged(mode);
        assert_eq!(
            renderer.render(&store, mode, &event),
            vec![Output::Status("Sketching...".into())]
        );
        assert!(renderer.render(&store, mode, &event).is_empty());
        store.update_placeholder(mode, id, "Mixing...");
        assert_eq!(
            renderer.render(&store, mode, &event),
            vec![Output::Status("Mixing...".into())]
        );
        // Other modes are not rendered.
        assert!(renderer.render(&store, Mode::General, &event).is_empty());
    }

    #[test]
    fn attachment_becomes_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.JPG");
        std::fs::write(&path, [0xFFu8, 0xD8, 0xFF]).unwrap();
        let url = load_attachment(&path).unwrap();
        assert_eq!(url, "data:image/jpeg;base64,/9j/");
    }

    #[tokio::test]
    async fn refused_vision_submit_keeps_the_attachment() {
        let backend = Arc::new(HttpBackend::new("http://127.0.0.1:9").unwrap());
        let orchestrator = ChatOrchestrator::new(backend, OrchestratorConfig::default());
        orchestrator.store().set_phase(Mode::Vision, Phase::Streaming);
        let pending = Mutex::new(Some("data:image/png;base64,QUJD".to_string()));

        let err = submit_with_attachment(&orchestrator, Mode::Vision, "what is this?", &pending)
            .await
            .unwrap_err();
        assert!(matches!(err.inner, RelayError::Busy(Mode::Vision)));
        assert_eq!(
            pending.lock().unwrap().as_deref(),
            Some("data:image/png;base64,QUJD")
        );
    }

    #[tokio::test]
    async fn other_modes_leave_the_attachment_alone() {
        let backend = Arc::new(HttpBackend::new("http://127.0.0.1:9").unwrap());
        let orchestrator = ChatOrchestrator::new(backend, OrchestratorConfig::default());
        orchestrator.store().set_phase(Mode::General, Phase::Streaming);
        let pending = Mutex::new(Some("data:image/png;base64,QUJD".to_string()));

        assert!(submit_with_attachment(&orchestrator, Mode::General, "hi", &pending)
            .await
            .is_err());
        assert!(pending.lock().unwrap().is_some());
    }
}
