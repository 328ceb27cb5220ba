//! Terminal console rendering.
//!
//! Raw-mode setup and teardown plus the `ratatui` drawing of the status panel,
//! the database console and the footer.

use std::io::{self, Stdout};

use crossterm::event::{DisableMouseCapture, EnableMouseCapture};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear, Paragraph};
use ratatui::Terminal;

use crate::app::{App, InputMode, ServingStatus, StatusLevel};
use crate::output::{sanitize_text, ConsoleLine, LineSource};

pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const HELP_LINE: &str =
    "s serve/stop | r restart | c clear | y copy | e export | / filter | f follow | p pin | ? help | q quit";

/// Enables raw mode and the alternate screen.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    Ok(())
}

pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    execute!(terminal.backend_mut(), SetTitle(window_title(app)))?;
    terminal.draw(|frame| {
        let area = frame.size();
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(1),
                Constraint::Length(4),
            ])
            .split(area);
        let border_style = Style::default().fg(Color::DarkGray);

        let header = Paragraph::new(Line::from(vec![
            Span::styled(
                format!("{} ", status_symbol(&app.status)),
                status_style(&app.status),
            ),
            Span::styled(
                app.status.label(),
                status_style(&app.status).add_modifier(Modifier::BOLD),
            ),
            Span::styled("  ", Style::default()),
            Span::styled(app.endpoint.clone(), Style::default().fg(Color::Cyan)),
        ]))
        .block(
            Block::default()
                .title(" dbdeck ")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(header, vertical[0]);

        let console_block = Block::default()
            .title(console_title(app))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(if app.input_mode == InputMode::Filter {
                Style::default().fg(Color::Yellow)
            } else {
                border_style
            });
        let console_area = console_block.inner(vertical[1]);
        app.set_log_view_height(console_area.height as usize);
        let (console_lines, total) =
            render_console(app, console_area.height as usize, console_area.width as usize);
        frame.render_widget(Paragraph::new(console_lines).block(console_block), vertical[1]);

        if total == 0 {
            let empty = if app.console.is_empty() {
                "No output yet. Press s to start serving."
            } else {
                "No lines match the filter"
            };
            frame.render_widget(
                Paragraph::new(empty).style(Style::default().fg(Color::DarkGray)),
                console_area,
            );
        }

        let footer_line = match app.input_mode {
            InputMode::Filter => Line::from(Span::styled(
                format!("Filter: {} (Enter to keep, Esc to clear)", app.input),
                Style::default().fg(Color::Yellow),
            )),
            InputMode::Normal => match app.status_message() {
                Some((text, StatusLevel::Warning)) => {
                    Line::from(Span::styled(text.to_string(), Style::default().fg(Color::Red)))
                }
                Some((text, StatusLevel::Info)) => {
                    Line::from(Span::styled(text.to_string(), Style::default().fg(Color::Green)))
                }
                None => Line::from(Span::styled(HELP_LINE, Style::default().fg(Color::DarkGray))),
            },
        };
        let footer = Paragraph::new(Text::from(vec![
            Line::from(Span::raw(app.status_line())),
            footer_line,
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(footer, vertical[2]);

        if app.show_help {
            let popup_area = centered_rect(60, 70, area);
            let help_text = [
                "Serving:",
                "  s          Start or stop the database",
                "  x          Stop the database",
                "  r          Restart the database",
                "",
                "Console:",
                "  PageUp/Dn  Scroll",
                "  Home/End   Jump to top/bottom",
                "  f          Toggle auto-follow",
                "  /          Filter lines",
                "  c          Clear console",
                "  y, Ctrl-C  Copy console to clipboard",
                "  e          Export console to a file",
                "",
                "Window:",
                "  p          Toggle always on top",
                "  ?          Toggle this help",
                "  q          Quit (stops the database)",
            ]
            .join("\n");
            let help = Paragraph::new(help_text)
                .block(
                    Block::default()
                        .title("Help")
                        .borders(Borders::ALL)
                        .border_type(BorderType::Rounded),
                )
                .style(Style::default().bg(Color::DarkGray).fg(Color::White));
            frame.render_widget(Clear, popup_area);
            frame.render_widget(help, popup_area);
        }
    })?;
    Ok(())
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn window_title(app: &App) -> String {
    let pin = if app.pinned { " [pinned]" } else { "" };
    format!("dbdeck · {}{}", app.status.label(), pin)
}

fn console_title(app: &App) -> String {
    match &app.filter_query {
        Some(query) => format!("Console (filter: {query})"),
        None if app.follow => "Console".to_string(),
        None => "Console (paused)".to_string(),
    }
}

// Slices the filtered console to the viewport, honoring scroll and follow.
fn render_console(app: &App, height: usize, width: usize) -> (Text<'static>, usize) {
    let visible = app.visible_lines();
    let total = visible.len();
    if height == 0 {
        return (Text::default(), total);
    }
    let max_start = total.saturating_sub(height);
    let start = if app.follow {
        max_start
    } else {
        app.scroll.min(max_start)
    };
    let end = (start + height).min(total);
    let lines = visible[start..end]
        .iter()
        .map(|line| console_line(line, width))
        .collect::<Vec<_>>();
    (Text::from(lines), total)
}

fn console_line(line: &ConsoleLine, width: usize) -> Line<'static> {
    let plain = strip_carriage(&sanitize_text(&line.text, true));
    let text = truncate(&plain, width.saturating_sub(1));
    match line.source {
        LineSource::Shell => Line::from(Span::styled(
            text,
            Style::default().fg(Color::Magenta).add_modifier(Modifier::ITALIC),
        )),
        LineSource::Stdout | LineSource::Stderr => {
            Line::from(Span::styled(text, level_style(&plain)))
        }
    }
}

// Colors by the log level keyword the database prints.
fn level_style(text: &str) -> Style {
    let head: String = text.chars().take(48).collect::<String>().to_ascii_uppercase();
    if head.contains("ERROR") {
        Style::default().fg(Color::Red)
    } else if head.contains("WARN") {
        Style::default().fg(Color::Yellow)
    } else if head.contains("DEBUG") || head.contains("TRACE") {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default()
    }
}

fn status_symbol(status: &ServingStatus) -> char {
    match status {
        ServingStatus::Offline => '○',
        ServingStatus::Starting | ServingStatus::Stopping => '◌',
        ServingStatus::Running { ready: true, .. } => '●',
        ServingStatus::Running { ready: false, .. } => '◎',
        ServingStatus::Failed { .. } => '✕',
    }
}

fn status_style(status: &ServingStatus) -> Style {
    match status {
        ServingStatus::Offline => Style::default().fg(Color::Gray),
        ServingStatus::Starting | ServingStatus::Stopping => Style::default().fg(Color::Yellow),
        ServingStatus::Running { ready: true, .. } => Style::default().fg(Color::Green),
        ServingStatus::Running { ready: false, .. } => Style::default().fg(Color::Cyan),
        ServingStatus::Failed { .. } => Style::default().fg(Color::Red),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}

fn strip_carriage(text: &str) -> String {
    text.rsplit('\r').next().unwrap_or("").to_string()
}
