//! Terminal console state.
//!
//! `App` mirrors what the supervisor reports (serving status, console lines)
//! and turns key presses into `AppAction`s that the event loop carries out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseEvent, MouseEventKind};

use crate::events::DatabaseEvent;
use crate::output::{sanitize_text, ConsoleBuffer, ConsoleLine, LineSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    /// Typing a console filter.
    Filter,
}

/// What the shell believes the database is doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServingStatus {
    Offline,
    Starting,
    Running { pid: u32, ready: bool },
    Stopping,
    Failed { error: String },
}

impl ServingStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServingStatus::Starting | ServingStatus::Running { .. } | ServingStatus::Stopping
        )
    }

    pub fn label(&self) -> String {
        match self {
            ServingStatus::Offline => "offline".to_string(),
            ServingStatus::Starting => "starting".to_string(),
            ServingStatus::Running { pid, ready: true } => format!("serving (pid {pid})"),
            ServingStatus::Running { pid, ready: false } => format!("booting (pid {pid})"),
            ServingStatus::Stopping => "stopping".to_string(),
            ServingStatus::Failed { error } => format!("failed ({error})"),
        }
    }
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    None,
    Quit,
    Start,
    Stop,
    Restart,
    /// Copy the console to the clipboard.
    Copy,
    /// Write the console to the exports directory.
    Export,
    /// Persist the new pinned flag.
    TogglePinned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

#[derive(Debug)]
pub struct App {
    pub status: ServingStatus,
    pub console: ConsoleBuffer,
    pub input_mode: InputMode,
    pub input: String,
    pub filter_query: Option<String>,
    pub follow: bool,
    pub scroll: usize,
    pub log_view_height: usize,
    pub show_help: bool,
    pub should_quit: bool,
    pub pinned: bool,
    /// Address clients connect to, shown in the status panel.
    pub endpoint: String,
    pub started_at: Option<Instant>,
    pub last_exit: Option<i32>,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(history_size: usize, endpoint: impl Into<String>, pinned: bool) -> Self {
        Self {
            status: ServingStatus::Offline,
            console: ConsoleBuffer::new(history_size),
            input_mode: InputMode::Normal,
            input: String::new(),
            filter_query: None,
            follow: true,
            scroll: 0,
            log_view_height: 0,
            show_help: false,
            should_quit: false,
            pinned,
            endpoint: endpoint.into(),
            started_at: None,
            last_exit: None,
            status_message: None,
        }
    }

    pub fn on_database_event(&mut self, event: &DatabaseEvent) {
        match event {
            DatabaseEvent::Started { pid } => {
                let ready = matches!(
                    self.status,
                    ServingStatus::Running { pid: current, ready: true } if current == *pid
                );
                if !matches!(self.status, ServingStatus::Running { .. }) {
                    self.started_at = Some(Instant::now());
                }
                self.status = ServingStatus::Running { pid: *pid, ready };
                self.last_exit = None;
            }
            DatabaseEvent::Ready => {
                if let ServingStatus::Running { ready, .. } = &mut self.status {
                    *ready = true;
                    self.set_status_message(format!("Database ready at {}", self.endpoint));
                }
            }
            DatabaseEvent::Output { line, stream } => {
                self.push_line(ConsoleLine::new(line.clone(), *stream));
            }
            DatabaseEvent::Error { message } => {
                self.status = ServingStatus::Failed {
                    error: message.clone(),
                };
                self.started_at = None;
                self.push_line(ConsoleLine::new(message.clone(), LineSource::Shell));
                self.set_status_warning_persistent(message.clone());
            }
            DatabaseEvent::Stopped { code } => {
                self.status = ServingStatus::Offline;
                self.started_at = None;
                self.last_exit = *code;
                self.set_status_message("Database stopped");
            }
        }
    }

    /// Marks a start as requested; the supervisor confirms with `Started`.
    pub fn mark_starting(&mut self) {
        if !matches!(self.status, ServingStatus::Running { .. }) {
            self.status = ServingStatus::Starting;
        }
    }

    pub fn mark_stopping(&mut self) {
        if self.status.is_active() {
            self.status = ServingStatus::Stopping;
        }
    }

    fn push_line(&mut self, line: ConsoleLine) {
        let counted = self.matches_filter(&line);
        let dropped = self.console.push(line);
        if dropped && !self.follow && self.scroll > 0 {
            self.scroll -= 1;
        }
        if counted && self.follow {
            self.ensure_follow();
        }
    }

    pub fn handle_mouse(&mut self, mouse: MouseEvent) -> AppAction {
        match mouse.kind {
            MouseEventKind::ScrollDown => self.scroll_down(3),
            MouseEventKind::ScrollUp => self.scroll_up(3),
            _ => {}
        }
        AppAction::None
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        match self.input_mode {
            InputMode::Filter => self.handle_filter_input(key),
            InputMode::Normal => self.handle_normal_input(key),
        }
    }

    fn handle_filter_input(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
                self.input.clear();
                self.filter_query = None;
            }
            KeyCode::Enter => {
                self.input.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Backspace => {
                if self.input.pop().is_some() {
                    self.apply_filter_input();
                }
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.input.push(c);
                self.apply_filter_input();
            }
            _ => {}
        }
        AppAction::None
    }

    fn apply_filter_input(&mut self) {
        let query = self.input.trim().to_string();
        self.filter_query = if query.is_empty() { None } else { Some(query) };
        self.follow = true;
        self.ensure_follow();
    }

    fn handle_normal_input(&mut self, key: KeyEvent) -> AppAction {
        if self.show_help && matches!(key.code, KeyCode::Esc | KeyCode::Char('?')) {
            self.show_help = false;
            return AppAction::None;
        }
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => AppAction::Copy,
            KeyCode::Char('q') => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Char('s') => {
                if self.status.is_active() {
                    self.mark_stopping();
                    AppAction::Stop
                } else {
                    self.mark_starting();
                    AppAction::Start
                }
            }
            KeyCode::Char('x') => {
                if self.status.is_active() {
                    self.mark_stopping();
                    AppAction::Stop
                } else {
                    self.set_status_message("Database is not running");
                    AppAction::None
                }
            }
            KeyCode::Char('r') => {
                self.mark_stopping();
                AppAction::Restart
            }
            KeyCode::Char('c') => {
                self.console.clear();
                self.scroll = 0;
                self.follow = true;
                self.set_status_message("Console cleared");
                AppAction::None
            }
            KeyCode::Char('y') => AppAction::Copy,
            KeyCode::Char('e') => AppAction::Export,
            KeyCode::Char('p') => {
                self.pinned = !self.pinned;
                AppAction::TogglePinned
            }
            KeyCode::Char('f') => {
                self.follow = !self.follow;
                if self.follow {
                    self.ensure_follow();
                }
                AppAction::None
            }
            KeyCode::Char('/') => {
                self.input_mode = InputMode::Filter;
                self.input = self.filter_query.clone().unwrap_or_default();
                AppAction::None
            }
            KeyCode::Char('?') => {
                self.show_help = !self.show_help;
                AppAction::None
            }
            KeyCode::Up => {
                self.scroll_up(1);
                AppAction::None
            }
            KeyCode::Down => {
                self.scroll_down(1);
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.scroll = 0;
                self.follow = false;
                AppAction::None
            }
            KeyCode::End => {
                self.follow = true;
                self.ensure_follow();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn matches_filter(&self, line: &ConsoleLine) -> bool {
        match &self.filter_query {
            Some(query) => line.text.to_lowercase().contains(&query.to_lowercase()),
            None => true,
        }
    }

    /// Console lines that pass the active filter, oldest first.
    pub fn visible_lines(&self) -> Vec<&ConsoleLine> {
        self.console
            .iter()
            .filter(|line| self.matches_filter(line))
            .collect()
    }

    fn max_scroll(&self) -> usize {
        self.visible_lines()
            .len()
            .saturating_sub(self.log_view_height.max(1))
    }

    pub fn scroll_up(&mut self, amount: usize) {
        let max_scroll = self.max_scroll();
        let current = if self.follow { max_scroll } else { self.scroll };
        self.scroll = current.saturating_sub(amount).min(max_scroll);
        self.follow = false;
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let max_scroll = self.max_scroll();
        let current = if self.follow { max_scroll } else { self.scroll };
        let next = (current + amount).min(max_scroll);
        self.scroll = next;
        self.follow = next == max_scroll;
    }

    pub fn ensure_follow(&mut self) {
        self.scroll = self.max_scroll();
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
        let max_scroll = self.max_scroll();
        if self.follow {
            self.scroll = max_scroll;
        } else {
            self.scroll = self.scroll.min(max_scroll);
        }
    }

    /// Console text with escapes removed, for the clipboard.
    pub fn console_text(&self) -> Option<String> {
        let lines: Vec<String> = self
            .visible_lines()
            .into_iter()
            .map(|line| sanitize_text(&line.text, true))
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    /// Writes the console to `dir/console-<epoch>.log`.
    pub fn export_console(&mut self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = dir.join(format!("console-{epoch}.log"));
        let mut output = String::new();
        for line in self.console.iter() {
            match line.source {
                LineSource::Stderr => output.push_str("[stderr] "),
                LineSource::Shell => output.push_str("[dbdeck] "),
                LineSource::Stdout => {}
            }
            output.push_str(&sanitize_text(&line.text, true));
            output.push('\n');
        }
        fs::write(&path, output).with_context(|| format!("failed to write {}", path.display()))?;
        self.set_status_message(format!("Exported console to {}", path.display()));
        Ok(path)
    }

    pub fn status_line(&self) -> String {
        let uptime = self
            .started_at
            .map(|t| format_duration(t.elapsed()))
            .unwrap_or_else(|| "-".into());
        let filter = self
            .filter_query
            .as_deref()
            .map(|q| format!(" | filter: {q}"))
            .unwrap_or_default();
        let exit = self
            .last_exit
            .map(|code| format!(" | last exit: {code}"))
            .unwrap_or_default();
        format!(
            "lines: {} | uptime: {} | follow: {} | pinned: {}{}{}",
            self.console.len(),
            uptime,
            if self.follow { "on" } else { "off" },
            if self.pinned { "on" } else { "off" },
            exit,
            filter
        )
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        let still_visible = match message.ttl {
            Some(ttl) => message.at.elapsed() < ttl,
            None => true,
        };
        still_visible.then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning_for(&mut self, message: impl Into<String>, ttl: Duration) {
        self.set_status_message_with_level(message, StatusLevel::Warning, Some(ttl));
    }

    pub fn set_status_warning_persistent(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, None);
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs / 60) % 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventKind, KeyEventState};

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    fn make_app() -> App {
        App::new(100, "http://127.0.0.1:8000", false)
    }

    fn output(app: &mut App, text: &str) {
        app.on_database_event(&DatabaseEvent::Output {
            line: text.to_string(),
            stream: LineSource::Stderr,
        });
    }

    #[test]
    fn s_toggles_between_start_and_stop() {
        let mut app = make_app();
        assert_eq!(app.handle_key(key(KeyCode::Char('s'))), AppAction::Start);
        assert_eq!(app.status, ServingStatus::Starting);

        app.on_database_event(&DatabaseEvent::Started { pid: 7 });
        assert_eq!(app.status, ServingStatus::Running { pid: 7, ready: false });
        app.on_database_event(&DatabaseEvent::Ready);
        assert_eq!(app.status, ServingStatus::Running { pid: 7, ready: true });

        assert_eq!(app.handle_key(key(KeyCode::Char('s'))), AppAction::Stop);
        assert_eq!(app.status, ServingStatus::Stopping);
        app.on_database_event(&DatabaseEvent::Stopped { code: None });
        assert_eq!(app.status, ServingStatus::Offline);
    }

    #[test]
    fn repeated_start_event_keeps_readiness() {
        let mut app = make_app();
        app.on_database_event(&DatabaseEvent::Started { pid: 9 });
        app.on_database_event(&DatabaseEvent::Ready);
        app.on_database_event(&DatabaseEvent::Started { pid: 9 });
        assert_eq!(app.status, ServingStatus::Running { pid: 9, ready: true });
    }

    #[test]
    fn stop_key_when_offline_does_nothing() {
        let mut app = make_app();
        assert_eq!(app.handle_key(key(KeyCode::Char('x'))), AppAction::None);
        assert_eq!(app.status, ServingStatus::Offline);
    }

    #[test]
    fn error_marks_failed_and_logs_message() {
        let mut app = make_app();
        app.mark_starting();
        app.on_database_event(&DatabaseEvent::Error {
            message: "did not start".into(),
        });
        assert_eq!(
            app.status,
            ServingStatus::Failed {
                error: "did not start".into()
            }
        );
        let last = app.console.iter().last().unwrap();
        assert_eq!(last.source, LineSource::Shell);
        assert_eq!(app.status_message().map(|(_, l)| l), Some(StatusLevel::Warning));
        // A failed database can be started again.
        assert_eq!(app.handle_key(key(KeyCode::Char('s'))), AppAction::Start);
    }

    #[test]
    fn filter_limits_visible_lines() {
        let mut app = make_app();
        output(&mut app, "INFO started");
        output(&mut app, "WARN slow query");
        output(&mut app, "INFO ready");
        app.handle_key(key(KeyCode::Char('/')));
        for c in "info".chars() {
            app.handle_key(key(KeyCode::Char(c)));
        }
        app.handle_key(key(KeyCode::Enter));
        assert_eq!(app.input_mode, InputMode::Normal);
        assert_eq!(app.visible_lines().len(), 2);
        assert_eq!(app.console_text().unwrap(), "INFO started\nINFO ready");

        app.handle_key(key(KeyCode::Char('/')));
        app.handle_key(key(KeyCode::Esc));
        assert_eq!(app.filter_query, None);
        assert_eq!(app.visible_lines().len(), 3);
    }

    #[test]
    fn scrolling_leaves_and_resumes_follow() {
        let mut app = make_app();
        for i in 0..20 {
            output(&mut app, &format!("line {i}"));
        }
        app.set_log_view_height(5);
        assert_eq!(app.scroll, 15);

        app.handle_key(key(KeyCode::PageUp));
        assert!(!app.follow);
        assert_eq!(app.scroll, 10);

        output(&mut app, "more");
        assert_eq!(app.scroll, 10);

        app.handle_key(key(KeyCode::End));
        assert!(app.follow);
        assert_eq!(app.scroll, 16);
    }

    #[test]
    fn clear_and_pin_keys() {
        let mut app = make_app();
        output(&mut app, "x");
        app.handle_key(key(KeyCode::Char('c')));
        assert!(app.console.is_empty());
        assert_eq!(app.handle_key(key(KeyCode::Char('p'))), AppAction::TogglePinned);
        assert!(app.pinned);
        let ctrl_c = KeyEvent {
            modifiers: KeyModifiers::CONTROL,
            ..key(KeyCode::Char('c'))
        };
        assert_eq!(app.handle_key(ctrl_c), AppAction::Copy);
    }

    #[test]
    fn help_closes_on_escape() {
        let mut app = make_app();
        app.handle_key(key(KeyCode::Char('?')));
        assert!(app.show_help);
        app.handle_key(key(KeyCode::Esc));
        assert!(!app.show_help);
    }

    #[test]
    fn export_writes_console_with_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = make_app();
        app.on_database_event(&DatabaseEvent::Output {
            line: "\u{1b}[32mhello\u{1b}[0m".into(),
            stream: LineSource::Stdout,
        });
        output(&mut app, "warn");
        app.on_database_event(&DatabaseEvent::Stopped { code: Some(1) });
        let path = app.export_console(&dir.path().join("exports")).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "hello\n[stderr] warn\n");
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("console-") && n.ends_with(".log")));
        assert_eq!(app.last_exit, Some(1));
        assert!(app.status_line().contains("last exit: 1"));
        app.on_database_event(&DatabaseEvent::Started { pid: 7 });
        assert!(!app.status_line().contains("last exit"));
    }

    #[test]
    fn format_duration_includes_hours_when_needed() {
        assert_eq!(format_duration(Duration::from_secs(65)), "01:05");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1:02:05");
    }
}
