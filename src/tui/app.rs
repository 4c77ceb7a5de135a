//! Application state and event handling for the observer TUI.

use crate::client::EngineClient;
use crate::events::{Event, EventKind};
use crate::protocol::{ApprovalParams, Request};
use crate::settings::Paths;
use crossterm::{
    event::{self, Event as TermEvent, KeyCode, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend, widgets::ListState};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::time::Duration;

use super::ui;

/// Rolling cap on the event log pane.
const EVENT_LOG_CAP: usize = 500;

/// One approval waiting for a verdict.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub command: String,
    pub rule: String,
    pub reason: String,
}

/// One rendered line in the event log.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp_ms: i64,
    pub kind: &'static str,
    pub text: String,
}

/// Application state.
pub struct App {
    /// Approvals awaiting a verdict.
    pub pending: Vec<PendingEntry>,
    /// Rolling event log, newest last.
    pub log: VecDeque<LogLine>,
    /// Selection within the pending list.
    pub selected: usize,
    pub list_state: ListState,
    /// Latest daemon status line, if any.
    pub daemon_status: Option<String>,
    /// Status message shown in the footer.
    pub message: Option<String>,
    pub should_quit: bool,
    writer: UnixStream,
}

impl App {
    fn new(writer: UnixStream) -> Self {
        Self {
            pending: Vec::new(),
            log: VecDeque::new(),
            selected: 0,
            list_state: ListState::default(),
            daemon_status: None,
            message: None,
            should_quit: false,
            writer,
        }
    }

    pub fn current(&self) -> Option<&PendingEntry> {
        self.pending.get(self.selected)
    }

    pub fn next_entry(&mut self) {
        if !self.pending.is_empty() {
            self.selected = (self.selected + 1) % self.pending.len();
            self.list_state.select(Some(self.selected));
        }
    }

    pub fn prev_entry(&mut self) {
        if !self.pending.is_empty() {
            self.selected = if self.selected == 0 {
                self.pending.len() - 1
            } else {
                self.selected - 1
            };
            self.list_state.select(Some(self.selected));
        }
    }

    fn clamp_selection(&mut self) {
        if self.pending.is_empty() {
            self.selected = 0;
            self.list_state.select(None);
        } else {
            self.selected = self.selected.min(self.pending.len() - 1);
            self.list_state.select(Some(self.selected));
        }
    }

    fn push_log(&mut self, line: LogLine) {
        if self.log.len() >= EVENT_LOG_CAP {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    /// Fold one engine event into the display state.
    pub fn apply_event(&mut self, event: Event) {
        let text = match &event.kind {
            EventKind::CommandReceived {
                command,
                execution_context,
                ..
            } => format!("{} ▸ {command}", execution_context.as_str()),
            EventKind::EvaluationCompleted { decision, rule, .. } => match rule {
                Some(rule) => format!("{decision} ({rule})"),
                None => decision.clone(),
            },
            EventKind::ApprovalNeeded {
                approval_id,
                command,
                rule,
                reason,
                ..
            } => {
                // The connect-time backlog can overlap the live stream.
                if !self.pending.iter().any(|p| p.id == *approval_id) {
                    self.pending.push(PendingEntry {
                        id: approval_id.clone(),
                        command: command.clone(),
                        rule: rule.clone(),
                        reason: reason.clone(),
                    });
                    self.clamp_selection();
                }
                format!("approval {approval_id}: {command}")
            }
            EventKind::ApprovalResolved {
                approval_id,
                outcome,
                ..
            } => {
                self.pending.retain(|p| p.id != *approval_id);
                self.clamp_selection();
                format!("approval {approval_id}: {}", outcome.as_str())
            }
            EventKind::ExecutionCompleted {
                executed,
                exit_code,
                ..
            } => {
                if *executed {
                    format!("exit {}", exit_code.unwrap_or(-1))
                } else {
                    "not executed".to_string()
                }
            }
            EventKind::DaemonStatus {
                version,
                rules_loaded,
                pending_approvals,
                note,
                ..
            } => {
                self.daemon_status = Some(format!(
                    "engine {version} · {rules_loaded} rules · {pending_approvals} pending"
                ));
                match note {
                    Some(note) => note.clone(),
                    None => "engine status".to_string(),
                }
            }
        };
        self.push_log(LogLine {
            timestamp_ms: event.timestamp_ms,
            kind: event.kind.name(),
            text,
        });
    }

    fn send_verdict(&mut self, approve: bool) {
        let Some(entry) = self.current().cloned() else {
            self.message = Some("nothing pending".to_string());
            return;
        };
        let request = if approve {
            Request::Approve(ApprovalParams {
                approval_id: entry.id.clone(),
                message: None,
            })
        } else {
            Request::Deny(ApprovalParams {
                approval_id: entry.id.clone(),
                message: None,
            })
        };
        match serde_json::to_string(&request) {
            Ok(line) => {
                let verdict = if approve { "approved" } else { "denied" };
                if writeln!(self.writer, "{line}").is_err() {
                    self.message = Some("engine connection lost".to_string());
                    self.should_quit = true;
                } else {
                    self.message = Some(format!("{verdict} {}", entry.id));
                }
            }
            Err(e) => self.message = Some(format!("encode failed: {e}")),
        }
    }

    fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers) {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true;
            }
            KeyCode::Down | KeyCode::Char('j') => self.next_entry(),
            KeyCode::Up | KeyCode::Char('k') => self.prev_entry(),
            KeyCode::Char('a') | KeyCode::Char('y') => self.send_verdict(true),
            KeyCode::Char('d') | KeyCode::Char('n') => self.send_verdict(false),
            _ => {}
        }
    }
}

/// Connect to the observer endpoint and run the TUI until quit.
pub fn run_observer(paths: &Paths) -> anyhow::Result<()> {
    let client = EngineClient::connect_observer(paths)?;
    let (reader, writer) = client.split();

    // Reader thread: engine events -> channel. Ends when the socket closes.
    let (tx, rx) = mpsc::channel::<Event>();
    std::thread::spawn(move || {
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(_) => continue,
            }
        }
    });

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(writer);
    let result = event_loop(&mut terminal, &mut app, &rx);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    rx: &mpsc::Receiver<Event>,
) -> anyhow::Result<()> {
    loop {
        // Drain whatever the engine sent since the last frame.
        while let Ok(event) = rx.try_recv() {
            app.apply_event(event);
        }

        terminal.draw(|f| ui::draw(f, app))?;

        if event::poll(Duration::from_millis(100))? {
            if let TermEvent::Key(key) = event::read()? {
                app.handle_key(key.code, key.modifiers);
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}
