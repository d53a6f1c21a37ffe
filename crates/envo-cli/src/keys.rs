use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::app::{App, Mode};

/// Dispatch a key press for the current mode.
pub fn handle_key(app: &mut App, key: KeyEvent) {
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.should_quit = true;
        return;
    }

    match app.mode {
        Mode::HelpDialog => {
            if matches!(key.code, KeyCode::Esc | KeyCode::Char('?') | KeyCode::Char('q')) {
                app.mode = Mode::ServiceList;
            }
        }
        Mode::ServiceList => match key.code {
            KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
            KeyCode::Down | KeyCode::Char('j') => app.select_next(),
            KeyCode::Up | KeyCode::Char('k') => app.select_previous(),
            KeyCode::Char('?') => app.mode = Mode::HelpDialog,
            _ => {}
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envo_core::models::{EnvironmentState, ServiceRuntimeState};

    fn press(app: &mut App, code: KeyCode) {
        handle_key(app, KeyEvent::new(code, KeyModifiers::NONE));
    }

    #[test]
    fn arrows_move_and_q_quits() {
        let mut app = App::new("dev");
        app.apply_state(Some(EnvironmentState {
            project: "dev".into(),
            services: vec![
                ServiceRuntimeState::new("db".into()),
                ServiceRuntimeState::new("app".into()),
            ],
            ..EnvironmentState::default()
        }));

        press(&mut app, KeyCode::Down);
        assert_eq!(app.selected_index, 1);
        press(&mut app, KeyCode::Up);
        assert_eq!(app.selected_index, 0);
        press(&mut app, KeyCode::Char('q'));
        assert!(app.should_quit);
    }

    #[test]
    fn esc_closes_help_before_quitting() {
        let mut app = App::new("dev");
        press(&mut app, KeyCode::Char('?'));
        assert_eq!(app.mode, Mode::HelpDialog);
        press(&mut app, KeyCode::Esc);
        assert_eq!(app.mode, Mode::ServiceList);
        assert!(!app.should_quit);
        press(&mut app, KeyCode::Esc);
        assert!(app.should_quit);
    }

    #[test]
    fn ctrl_c_always_quits() {
        let mut app = App::new("dev");
        app.mode = Mode::HelpDialog;
        handle_key(
            &mut app,
            KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL),
        );
        assert!(app.should_quit);
    }
}
