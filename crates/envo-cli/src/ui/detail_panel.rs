use chrono::{DateTime, Utc};
use ratatui::layout::Rect;
use ratatui::style::{Color, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Frame;

use envo_core::models::ServiceRuntimeState;

use crate::app::App;
use crate::ui::service_table::state_color;

pub fn render_with_now(f: &mut Frame, area: Rect, app: &App, now: DateTime<Utc>) {
    let block = Block::default()
        .title(" Details ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let Some(service) = app.selected_service() else {
        let empty = Paragraph::new(" No service selected").block(block);
        f.render_widget(empty, area);
        return;
    };

    let lines = build_detail_lines(service, now);
    let paragraph = Paragraph::new(lines)
        .block(block)
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn build_detail_lines(service: &ServiceRuntimeState, now: DateTime<Utc>) -> Vec<Line<'static>> {
    let mut lines = vec![
        detail_line("Service", &service.name, Color::White),
        detail_line(
            "State",
            &service.state.to_string(),
            state_color(service.state),
        ),
    ];

    if let Some(process) = &service.process {
        lines.push(detail_line("Process", &process.name, Color::White));
        lines.push(detail_line("Id", &short(&process.id, 12), Color::DarkGray));
    }

    if let Some(started) = service.started_at {
        let d = now.signed_duration_since(started);
        lines.push(detail_line("Uptime", &format_duration(d), Color::Green));
    }

    let changed = now.signed_duration_since(service.updated_at);
    lines.push(detail_line(
        "Changed",
        &format!("{} ago", format_duration(changed)),
        Color::DarkGray,
    ));

    if service.restart_count > 0 {
        lines.push(detail_line(
            "Restarts",
            &service.restart_count.to_string(),
            Color::Yellow,
        ));
    }

    if let Some(blocker) = &service.blocked_by {
        lines.push(detail_line("Waiting on", blocker, Color::Yellow));
    }

    if let Some(error) = &service.last_error {
        lines.push(detail_line("Error", error, Color::Red));
    }

    lines
}

fn short(value: &str, len: usize) -> String {
    value.chars().take(len).collect()
}

fn format_duration(d: chrono::Duration) -> String {
    let total_secs = d.num_seconds().max(0);
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{hours}h {mins:02}m")
    } else if mins > 0 {
        format!("{mins}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}

fn detail_line(label: &str, value: &str, color: Color) -> Line<'static> {
    Line::from(vec![
        Span::styled(
            format!("  {label:<10} "),
            Style::default().fg(Color::DarkGray),
        ),
        Span::styled(value.to_string(), Style::default().fg(color)),
    ])
}
