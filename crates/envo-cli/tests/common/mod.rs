// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};

use envo_cli::app::App;
use envo_cli::ui;
use envo_core::models::{EnvironmentState, ProcessHandle, ServiceRuntimeState, ServiceState};
use ratatui::{backend::TestBackend, Terminal};

/// Render the app to a string using a TestBackend of the given dimensions.
pub fn render_to_string(app: &App, width: u16, height: u16) -> String {
    render_to_string_at(app, width, height, fixed_now())
}

/// Render the app with a fixed `now` for deterministic timestamps.
pub fn render_to_string_at(app: &App, width: u16, height: u16, now: DateTime<Utc>) -> String {
    let mut terminal = Terminal::new(TestBackend::new(width, height)).unwrap();
    terminal.draw(|f| ui::render(f, app, Some(now))).unwrap();
    terminal.backend().to_string()
}

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// A service record in `state`; up states get a process started 90s before `fixed_now`.
pub fn make_service(name: &str, state: ServiceState) -> ServiceRuntimeState {
    let mut record = ServiceRuntimeState::new(name.to_string());
    record.state = state;
    record.updated_at = fixed_now() - chrono::Duration::seconds(30);
    if state.is_up() {
        record.process = Some(ProcessHandle {
            id: format!("{name}0123456789abcdef"),
            name: format!("shop-{name}"),
        });
        record.started_at = Some(fixed_now() - chrono::Duration::seconds(90));
    }
    record
}

/// An app showing `services` for project "shop".
pub fn make_app(services: Vec<ServiceRuntimeState>) -> App {
    let mut app = App::new("shop");
    app.apply_state(Some(EnvironmentState {
        project: "shop".into(),
        services,
        ..EnvironmentState::default()
    }));
    app
}
