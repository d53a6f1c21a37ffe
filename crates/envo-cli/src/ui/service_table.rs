use ratatui::layout::{Constraint, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState};
use ratatui::Frame;

use envo_core::models::{ServiceRuntimeState, ServiceState};

use crate::app::App;

pub fn render(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .title(" Services ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    if app.services.is_empty() {
        let message = if app.loaded {
            " No environment is up"
        } else {
            " Loading..."
        };
        f.render_widget(Paragraph::new(message).block(block), area);
        return;
    }

    let header = Row::new(["", "SERVICE", "STATE", "RESTARTS"])
        .style(Style::default().fg(Color::DarkGray).add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = app.services.iter().map(service_row).collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(1),
            Constraint::Min(10),
            Constraint::Length(16),
            Constraint::Length(8),
        ],
    )
    .header(header)
    .block(block)
    .row_highlight_style(
        Style::default()
            .bg(Color::Rgb(0x1A, 0x3A, 0x5C))
            .add_modifier(Modifier::BOLD),
    )
    .highlight_symbol("> ");

    let mut state = TableState::default();
    state.select(Some(app.selected_index));
    f.render_stateful_widget(table, area, &mut state);
}

fn service_row(service: &ServiceRuntimeState) -> Row<'static> {
    let state_style = Style::default().fg(state_color(service.state));
    let state = match &service.blocked_by {
        Some(blocker) => format!("blocked ({blocker})"),
        None => service.state.to_string(),
    };
    Row::new(vec![
        Cell::from(state_icon(service.state)),
        Cell::from(Line::from(Span::styled(
            service.name.clone(),
            Style::default().fg(Color::White),
        ))),
        Cell::from(Span::styled(state, state_style)),
        Cell::from(service.restart_count.to_string()),
    ])
}

fn state_icon(state: ServiceState) -> Span<'static> {
    match state {
        ServiceState::Running => Span::styled("▶", Style::default().fg(Color::Green)),
        ServiceState::Degraded => Span::styled("◉", Style::default().fg(Color::Yellow)),
        ServiceState::Failed => Span::styled("✗", Style::default().fg(Color::Red)),
        ServiceState::Stopped => Span::styled("■", Style::default().fg(Color::DarkGray)),
        ServiceState::Stopping => Span::styled("◌", Style::default().fg(Color::Yellow)),
        _ => Span::styled("…", Style::default().fg(Color::DarkGray)),
    }
}

pub fn state_color(state: ServiceState) -> Color {
    match state {
        ServiceState::Running => Color::Green,
        ServiceState::Degraded | ServiceState::Stopping => Color::Yellow,
        ServiceState::Failed => Color::Red,
        ServiceState::Starting | ServiceState::HealthChecking => Color::Cyan,
        _ => Color::DarkGray,
    }
}
