//! UI rendering for the observer TUI.

use super::app::App;
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
};

pub fn draw(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(10),   // Main content
            Constraint::Length(3), // Footer/help
        ])
        .split(f.area());

    draw_header(f, app, chunks[0]);
    draw_main(f, app, chunks[1]);
    draw_footer(f, app, chunks[2]);
}

fn draw_header(f: &mut Frame, app: &App, area: Rect) {
    let status = app
        .daemon_status
        .clone()
        .unwrap_or_else(|| "waiting for engine status".to_string());
    let title = format!(" shellgate observer · {} ", status);

    let header = Paragraph::new(Line::from(vec![Span::styled(
        title,
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    )]))
    .block(Block::default().borders(Borders::ALL));

    f.render_widget(header, area);
}

fn draw_main(f: &mut Frame, app: &mut App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(area);

    draw_pending(f, app, chunks[0]);
    draw_log(f, app, chunks[1]);
}

fn draw_pending(f: &mut Frame, app: &mut App, area: Rect) {
    let items: Vec<ListItem> = app
        .pending
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let cmd = if entry.command.chars().count() > 40 {
                let truncated: String = entry.command.chars().take(37).collect();
                format!("{truncated}...")
            } else {
                entry.command.clone()
            };

            let style = if i == app.selected {
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            let prefix = if i == app.selected { "▶ " } else { "  " };

            ListItem::new(Line::from(vec![
                Span::styled(prefix, style),
                Span::styled(
                    format!("[{}] ", entry.id),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(cmd, style),
            ]))
        })
        .collect();

    let title = format!(" Pending approvals ({}) ", app.pending.len());
    let list = List::new(items).block(Block::default().title(title).borders(Borders::ALL));
    f.render_stateful_widget(list, area, &mut app.list_state.clone());

    // Reason for the selected entry rides in the bottom border area when
    // something is selected; drawn as an overlay line to keep layout simple.
    if let Some(entry) = app.current() {
        if area.height > 4 {
            let detail_area = Rect {
                x: area.x + 1,
                y: area.y + area.height - 2,
                width: area.width.saturating_sub(2),
                height: 1,
            };
            let detail = Paragraph::new(Line::from(vec![
                Span::styled(&entry.rule, Style::default().fg(Color::Magenta)),
                Span::raw(": "),
                Span::styled(&entry.reason, Style::default().fg(Color::Gray)),
            ]))
            .wrap(Wrap { trim: true });
            f.render_widget(detail, detail_area);
        }
    }
}

fn draw_log(f: &mut Frame, app: &App, area: Rect) {
    let visible = area.height.saturating_sub(2) as usize;
    let items: Vec<ListItem> = app
        .log
        .iter()
        .rev()
        .take(visible)
        .rev()
        .map(|line| {
            let color = match line.kind {
                "approval_needed" => Color::Yellow,
                "approval_resolved" => Color::Green,
                "evaluation_completed" => Color::Blue,
                "daemon_status" => Color::DarkGray,
                _ => Color::Gray,
            };
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:<21}", line.kind),
                    Style::default().fg(color),
                ),
                Span::raw(line.text.clone()),
            ]))
        })
        .collect();

    let list = List::new(items).block(Block::default().title(" Events ").borders(Borders::ALL));
    f.render_widget(list, area);
}

fn draw_footer(f: &mut Frame, app: &App, area: Rect) {
    let help = match &app.message {
        Some(message) => Line::from(vec![Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )]),
        None => Line::from(vec![
            Span::styled("a", Style::default().fg(Color::Yellow)),
            Span::raw(" approve  "),
            Span::styled("d", Style::default().fg(Color::Yellow)),
            Span::raw(" deny  "),
            Span::styled("j/k", Style::default().fg(Color::Yellow)),
            Span::raw(" select  "),
            Span::styled("q", Style::default().fg(Color::Yellow)),
            Span::raw(" quit"),
        ]),
    };

    let footer = Paragraph::new(help).block(Block::default().borders(Borders::ALL));
    f.render_widget(footer, area);
}
