use ratatui::layout::Rect;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;
use ratatui::Frame;

use crate::app::{App, Mode};

pub fn render(f: &mut Frame, area: Rect, app: &App) {
    // First line: status message, or the per-state summary
    let status_line = if let Some(ref msg) = app.status_message {
        let color = if msg.starts_with("Error") || msg.contains("failed") {
            Color::Red
        } else {
            Color::Green
        };
        Line::from(Span::styled(format!(" {msg}"), Style::default().fg(color)))
    } else {
        summary_line(app)
    };

    let hints = match app.mode {
        Mode::HelpDialog => Line::from(vec![hint("Esc", "close")]),
        Mode::ServiceList => Line::from(vec![
            hint("↑↓", "select"),
            Span::raw(" "),
            hint("?", "help"),
            Span::raw(" "),
            hint("Q", "uit"),
        ]),
    };

    let widget = Paragraph::new(vec![status_line, hints]);
    f.render_widget(widget, area);
}

fn summary_line(app: &App) -> Line<'static> {
    let summary = app.summary();
    let mut spans = vec![Span::styled(
        format!(" {} running", summary.running),
        Style::default().fg(Color::Green),
    )];
    if summary.degraded > 0 {
        spans.push(Span::styled(
            format!("  {} degraded", summary.degraded),
            Style::default().fg(Color::Yellow),
        ));
    }
    if summary.failed > 0 {
        spans.push(Span::styled(
            format!("  {} failed", summary.failed),
            Style::default().fg(Color::Red),
        ));
    }
    if summary.pending > 0 {
        spans.push(Span::styled(
            format!("  {} pending", summary.pending),
            Style::default().fg(Color::DarkGray),
        ));
    }
    if summary.stopped > 0 {
        spans.push(Span::styled(
            format!("  {} stopped", summary.stopped),
            Style::default().fg(Color::DarkGray),
        ));
    }
    Line::from(spans)
}

fn hint(key: &str, label: &str) -> Span<'static> {
    Span::styled(
        format!("[{key}]{label}"),
        Style::default()
            .fg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    )
}
