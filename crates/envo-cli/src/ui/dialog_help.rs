use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph};
use ratatui::Frame;

use envo_core::models::ServiceState;

use crate::ui::layout::popup;
use crate::ui::service_table::state_color;

const KEYS: &[(&str, &str)] = &[
    ("Up / k", "Select previous service"),
    ("Down / j", "Select next service"),
    ("?", "Toggle this help"),
    ("q / Esc", "Quit"),
];

const STATES: &[(ServiceState, &str)] = &[
    (ServiceState::Running, "Healthy and watched"),
    (ServiceState::Degraded, "Up, failing its health check"),
    (ServiceState::NetworkReady, "Waiting on dependencies"),
    (ServiceState::Failed, "Given up; see the error"),
];

pub fn render(f: &mut Frame) {
    let mut lines = vec![heading("Keys")];
    lines.extend(KEYS.iter().map(|(key, what)| {
        entry(key, Style::default().fg(Color::Cyan), what)
    }));
    lines.push(Line::default());
    lines.push(heading("States"));
    lines.extend(STATES.iter().map(|(state, what)| {
        entry(state.label(), Style::default().fg(state_color(*state)), what)
    }));

    let area = popup(f.area(), 52, lines.len() as u16 + 2);
    f.render_widget(Clear, area);
    let block = Block::default()
        .title(" Help ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn heading(title: &str) -> Line<'static> {
    Line::from(Span::styled(
        format!(" {title}"),
        Style::default().add_modifier(Modifier::BOLD),
    ))
}

fn entry(name: &str, style: Style, what: &str) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("   {name:<14}"), style),
        Span::raw(what.to_string()),
    ])
}
