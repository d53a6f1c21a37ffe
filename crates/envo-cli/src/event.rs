use std::path::PathBuf;
use std::time::Duration;

use crossterm::event::{self, Event, KeyEvent};
use tokio::sync::mpsc;

use envo_core::models::EnvironmentState;
use envo_core::services::state::StateStore;

/// Events flowing into the main loop.
#[derive(Debug)]
pub enum AppEvent {
    /// A key press from the user.
    Key(KeyEvent),
    /// A fresh read of the state file.
    State(Option<EnvironmentState>),
    /// Reading the state file failed.
    Error(String),
}

/// Spawn the crossterm input polling task.
pub fn spawn_input_task(tx: mpsc::UnboundedSender<AppEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Poll crossterm events with 50ms timeout (non-blocking feel)
            let has_event = tokio::task::spawn_blocking(|| {
                event::poll(Duration::from_millis(50)).unwrap_or(false)
            })
            .await
            .unwrap_or(false);

            if has_event {
                if let Ok(Event::Key(key)) = tokio::task::spawn_blocking(event::read)
                    .await
                    .unwrap_or(Err(std::io::Error::other("spawn_blocking failed")))
                {
                    if tx.send(AppEvent::Key(key)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Spawn the task that re-reads the state file every `period`.
pub fn spawn_state_task(
    state_directory: PathBuf,
    period: Duration,
    tx: mpsc::UnboundedSender<AppEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let store = StateStore::new(&state_directory);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let event = match store.load().await {
                Ok(state) => AppEvent::State(state),
                Err(e) => AppEvent::Error(e.to_string()),
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    })
}
