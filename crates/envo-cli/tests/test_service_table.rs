mod common;

use envo_cli::app::App;
use envo_core::models::ServiceState;

use common::{make_app, make_service, render_to_string};

#[test]
fn loading_before_first_read() {
    let app = App::new("shop");
    let output = render_to_string(&app, 100, 20);
    insta::assert_snapshot!(output);
    assert!(output.contains("Loading..."));
    assert!(output.contains(" envo shop"));
}

#[test]
fn empty_environment() {
    let app = make_app(Vec::new());
    let output = render_to_string(&app, 100, 20);
    insta::assert_snapshot!(output);
    assert!(output.contains("No environment is up"));
    assert!(output.contains("No service selected"));
}

#[test]
fn rows_show_state_and_restarts() {
    let mut db = make_service("db", ServiceState::Running);
    db.restart_count = 3;
    let app = make_app(vec![
        db,
        make_service("cache", ServiceState::Degraded),
        make_service("api", ServiceState::Failed),
    ]);
    let output = render_to_string(&app, 100, 20);
    insta::assert_snapshot!(output);

    assert!(output.contains("SERVICE"));
    assert!(output.contains("running"));
    assert!(output.contains("degraded"));
    assert!(output.contains("failed"));
    let db_line = output.lines().find(|l| l.contains("> ")).unwrap();
    assert!(db_line.contains("db"));
    assert!(db_line.contains('3'));
}

#[test]
fn blocked_service_names_its_blocker() {
    let mut api = make_service("api", ServiceState::NetworkReady);
    api.blocked_by = Some("db".into());
    let app = make_app(vec![make_service("db", ServiceState::Failed), api]);
    let output = render_to_string(&app, 100, 20);
    insta::assert_snapshot!(output);
    assert!(output.contains("blocked (db)"));
}

#[test]
fn selection_follows_index() {
    let mut app = make_app(vec![
        make_service("db", ServiceState::Running),
        make_service("web", ServiceState::Running),
    ]);
    app.selected_index = 1;
    let output = render_to_string(&app, 100, 20);
    insta::assert_snapshot!(output);
    let selected = output.lines().find(|l| l.contains("> ")).unwrap();
    assert!(selected.contains("web"));
}

#[test]
fn summary_in_status_bar() {
    let app = make_app(vec![
        make_service("db", ServiceState::Running),
        make_service("cache", ServiceState::Degraded),
        make_service("api", ServiceState::Failed),
    ]);
    let output = render_to_string(&app, 100, 20);
    insta::assert_snapshot!(output);
    assert!(output.contains("1 running  1 degraded  1 failed"));
    assert!(output.contains("[Q]uit"));
}

#[test]
fn status_message_replaces_summary() {
    let mut app = make_app(vec![make_service("db", ServiceState::Running)]);
    app.set_status("Error: state file unreadable");
    let output = render_to_string(&app, 100, 20);
    insta::assert_snapshot!(output);
    assert!(output.contains("Error: state file unreadable"));
    assert!(!output.contains("1 running"));
}
