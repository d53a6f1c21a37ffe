use envo_core::models::{EnvironmentState, ServiceRuntimeState, ServiceState};

/// The active mode determines which UI is shown and how keys are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ServiceList,
    HelpDialog,
}

/// Per-state tallies shown in the status bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub running: usize,
    pub degraded: usize,
    pub failed: usize,
    pub pending: usize,
    pub stopped: usize,
}

/// State behind the `watch` view.
pub struct App {
    pub project: String,
    pub services: Vec<ServiceRuntimeState>,
    pub selected_index: usize,
    pub mode: Mode,
    pub status_message: Option<String>,
    /// False until a state file has been read at least once.
    pub loaded: bool,
    pub should_quit: bool,
}

impl App {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            services: Vec::new(),
            selected_index: 0,
            mode: Mode::ServiceList,
            status_message: None,
            loaded: false,
            should_quit: false,
        }
    }

    /// Replace the table with a freshly read state file. `None` means no
    /// environment is up.
    pub fn apply_state(&mut self, state: Option<EnvironmentState>) {
        self.loaded = true;
        match state {
            Some(state) => {
                self.project = state.project;
                self.services = state.services;
            }
            None => self.services.clear(),
        }
        self.clamp_selection();
    }

    pub fn selected_service(&self) -> Option<&ServiceRuntimeState> {
        self.services.get(self.selected_index)
    }

    pub fn select_next(&mut self) {
        if !self.services.is_empty() {
            self.selected_index = (self.selected_index + 1) % self.services.len();
        }
    }

    pub fn select_previous(&mut self) {
        if !self.services.is_empty() {
            self.selected_index = self
                .selected_index
                .checked_sub(1)
                .unwrap_or(self.services.len() - 1);
        }
    }

    pub fn set_status(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for service in &self.services {
            match service.state {
                ServiceState::Running => summary.running += 1,
                ServiceState::Degraded => summary.degraded += 1,
                ServiceState::Failed => summary.failed += 1,
                ServiceState::Stopped => summary.stopped += 1,
                _ => summary.pending += 1,
            }
        }
        summary
    }

    fn clamp_selection(&mut self) {
        if self.services.is_empty() {
            self.selected_index = 0;
        } else if self.selected_index >= self.services.len() {
            self.selected_index = self.services.len() - 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, state: ServiceState) -> ServiceRuntimeState {
        let mut record = ServiceRuntimeState::new(name.to_string());
        record.state = state;
        record
    }

    fn environment(services: Vec<ServiceRuntimeState>) -> EnvironmentState {
        EnvironmentState {
            project: "dev".into(),
            services,
            ..EnvironmentState::default()
        }
    }

    #[test]
    fn selection_wraps() {
        let mut app = App::new("dev");
        app.apply_state(Some(environment(vec![
            service("db", ServiceState::Running),
            service("app", ServiceState::Running),
        ])));
        app.select_previous();
        assert_eq!(app.selected_service().unwrap().name, "app");
        app.select_next();
        assert_eq!(app.selected_service().unwrap().name, "db");
    }

    #[test]
    fn shrinking_state_clamps_selection() {
        let mut app = App::new("dev");
        app.apply_state(Some(environment(vec![
            service("db", ServiceState::Running),
            service("app", ServiceState::Running),
            service("web", ServiceState::Running),
        ])));
        app.selected_index = 2;
        app.apply_state(Some(environment(vec![service("db", ServiceState::Running)])));
        assert_eq!(app.selected_index, 0);

        app.apply_state(None);
        assert!(app.selected_service().is_none());
        assert!(app.loaded);
    }

    #[test]
    fn summary_counts_by_state() {
        let mut app = App::new("dev");
        app.apply_state(Some(environment(vec![
            service("db", ServiceState::Running),
            service("cache", ServiceState::Degraded),
            service("api", ServiceState::NetworkReady),
            service("web", ServiceState::Failed),
        ])));
        assert_eq!(
            app.summary(),
            Summary {
                running: 1,
                degraded: 1,
                failed: 1,
                pending: 1,
                stopped: 0,
            }
        );
    }
}
