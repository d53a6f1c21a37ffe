use ratatui::layout::{Constraint, Flex, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;
use ratatui::Frame;

/// The regions of the watch screen.
pub struct Screen {
    pub title: Rect,
    pub table: Rect,
    pub detail: Rect,
    pub status: Rect,
}

impl Screen {
    pub fn split(area: Rect) -> Self {
        let [title, content, status] = Layout::vertical([
            Constraint::Length(1),
            Constraint::Min(6),
            Constraint::Length(2),
        ])
        .areas(area);
        let [table, detail] =
            Layout::horizontal([Constraint::Percentage(55), Constraint::Percentage(45)])
                .areas(content);
        Self {
            title,
            table,
            detail,
            status,
        }
    }
}

pub fn render_title(f: &mut Frame, area: Rect, project: &str) {
    let title = Paragraph::new(Line::from(vec![
        Span::styled(
            " envo ",
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(project.to_string(), Style::default().fg(Color::DarkGray)),
    ]));
    f.render_widget(title, area);
}

/// A `width` x `height` box centered in `area`, shrunk to fit when the terminal is small.
pub fn popup(area: Rect, width: u16, height: u16) -> Rect {
    let [row] = Layout::vertical([Constraint::Length(height.min(area.height))])
        .flex(Flex::Center)
        .areas(area);
    let [popup] = Layout::horizontal([Constraint::Length(width.min(area.width))])
        .flex(Flex::Center)
        .areas(row);
    popup
}
