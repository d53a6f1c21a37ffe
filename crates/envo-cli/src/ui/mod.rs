pub mod detail_panel;
pub mod dialog_help;
pub mod layout;
pub mod service_table;
pub mod status_bar;

use chrono::{DateTime, Utc};
use ratatui::Frame;

use crate::app::{App, Mode};

/// Top-level render dispatch. Pass `now` to pin timestamps for deterministic output,
/// or `None` to use the current time.
pub fn render(f: &mut Frame, app: &App, now: Option<DateTime<Utc>>) {
    let now = now.unwrap_or_else(Utc::now);
    let screen = layout::Screen::split(f.area());

    layout::render_title(f, screen.title, &app.project);
    service_table::render(f, screen.table, app);
    detail_panel::render_with_now(f, screen.detail, app, now);
    status_bar::render(f, screen.status, app);

    if app.mode == Mode::HelpDialog {
        dialog_help::render(f);
    }
}
