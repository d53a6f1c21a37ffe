mod common;

use envo_cli::app::Mode;
use envo_core::models::ServiceState;

use common::{make_app, make_service, render_to_string};

#[test]
fn help_overlay_lists_keys_and_states() {
    let mut app = make_app(vec![make_service("db", ServiceState::Running)]);
    app.mode = Mode::HelpDialog;
    let output = render_to_string(&app, 100, 30);
    insta::assert_snapshot!(output);

    assert!(output.contains(" Help "));
    assert!(output.contains("Toggle this help"));
    assert!(output.contains("network-ready"));
    assert!(output.contains("Waiting on dependencies"));
    assert!(output.contains("[Esc]close"));
}

#[test]
fn help_is_hidden_in_service_list() {
    let app = make_app(vec![make_service("db", ServiceState::Running)]);
    let output = render_to_string(&app, 100, 30);
    insta::assert_snapshot!(output);
    assert!(!output.contains("Toggle this help"));
}

#[test]
fn help_shrinks_on_a_small_terminal() {
    let mut app = make_app(vec![make_service("db", ServiceState::Running)]);
    app.mode = Mode::HelpDialog;
    let output = render_to_string(&app, 40, 12);
    insta::assert_snapshot!(output);
    assert!(output.contains("Help"));
}
