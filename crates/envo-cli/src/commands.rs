use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{eyre, WrapErr};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use tokio::sync::mpsc;

use envo_core::models::{Model, RunReport, ServiceState};
use envo_core::services::allocator::allocate;
use envo_core::services::docker::DockerBackend;
use envo_core::services::graph::DependencyGraph;
use envo_core::services::host::resolve_capacity;
use envo_core::services::loader::{self, LoadOptions};
use envo_core::services::logs::stream_lines;
use envo_core::services::orchestrator::Orchestrator;
use envo_core::services::reconciler::Reconciler;
use envo_core::services::runtime::Collaborators;
use envo_core::services::state::StateStore;

use envo_cli::app::App;
use envo_cli::event::{spawn_input_task, spawn_state_task, AppEvent};
use envo_cli::{keys, ui};

use crate::ModelArgs;

/// Options shared by every command.
pub struct Context {
    pub spec: Option<PathBuf>,
    pub project: Option<String>,
}

impl Context {
    fn spec_path(&self) -> color_eyre::Result<PathBuf> {
        match &self.spec {
            Some(path) => Ok(path.clone()),
            None => Ok(loader::discover(&std::env::current_dir()?)?),
        }
    }

    fn load(&self, args: &ModelArgs) -> color_eyre::Result<(Model, PathBuf)> {
        let spec_path = self.spec_path()?;
        let options = LoadOptions {
            project: self.project.clone(),
            variant: args.variant.clone(),
            overrides: args.set.iter().cloned().collect(),
            ..LoadOptions::from_process_env()
        };
        let model = loader::load_file(&spec_path, &options)
            .wrap_err_with(|| format!("failed to load {}", spec_path.display()))?;
        Ok((model, spec_path))
    }

    /// Model, docker-backed orchestrator with persisted state merged in.
    async fn orchestrator(&self, args: &ModelArgs) -> color_eyre::Result<Orchestrator> {
        let (model, spec_path) = self.load(args)?;
        let capacity = resolve_capacity(&model.engine, args.cpus, args.memory)?;
        let store = StateStore::new(&loader::state_directory(&spec_path, &model.engine));
        let backend = Arc::new(DockerBackend::new());
        let orchestrator = Orchestrator::with_store(
            model,
            Collaborators::from_backend(backend),
            capacity,
            store,
        )?;
        orchestrator.load_state().await?;
        Ok(orchestrator)
    }

    fn store(&self) -> color_eyre::Result<StateStore> {
        let (model, spec_path) = self.load(&ModelArgs::default())?;
        Ok(StateStore::new(&loader::state_directory(
            &spec_path,
            &model.engine,
        )))
    }
}

pub async fn up(context: &Context, args: &ModelArgs, follow: bool) -> color_eyre::Result<i32> {
    let orchestrator = context.orchestrator(args).await?;
    let report = orchestrator.up().await?;
    print_report(&report);

    if !follow {
        return Ok(report.exit_code());
    }

    println!(
        "reconciling every {:?}; Ctrl-C to stop",
        orchestrator.model().engine.reconcile.interval
    );
    let mut reconciler = Reconciler::new(orchestrator.clone());
    reconciler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "could not listen for Ctrl-C");
            }
        })
        .await;
    let report = orchestrator.report();
    print_report(&report);
    Ok(report.exit_code())
}

fn print_report(report: &RunReport) {
    for outcome in &report.services {
        match (&outcome.blocked_by, &outcome.error) {
            (Some(blocker), _) => println!("{:<20} blocked by {blocker}", outcome.name),
            (None, Some(error)) if outcome.state != ServiceState::Running => {
                println!("{:<20} {:<16} {error}", outcome.name, outcome.state)
            }
            _ => println!("{:<20} {}", outcome.name, outcome.state),
        }
    }
    for chain in report.failures() {
        eprintln!("{}", chain.describe());
    }
}

pub async fn down(context: &Context, keep_volumes: bool) -> color_eyre::Result<i32> {
    let orchestrator = context.orchestrator(&ModelArgs::default()).await?;
    let report = orchestrator.down(keep_volumes).await?;

    for name in &report.stopped {
        println!("stopped {name}");
    }
    for name in &report.removed_networks {
        println!("removed network {name}");
    }
    for name in &report.removed_volumes {
        println!("removed volume {name}");
    }
    for (name, error) in &report.failed {
        eprintln!("{name}: {error}");
    }
    Ok(if report.is_clean() { 0 } else { 1 })
}

pub async fn status(context: &Context, json: bool) -> color_eyre::Result<i32> {
    let store = context.store()?;
    let Some(state) = store.load().await? else {
        if json {
            println!("null");
        } else {
            println!("no environment is up");
        }
        return Ok(0);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(0);
    }

    println!("project {}", state.project);
    println!("{:<20} {:<16} {:>8}  DETAIL", "SERVICE", "STATE", "RESTARTS");
    for service in &state.services {
        let detail = match (&service.blocked_by, &service.last_error) {
            (Some(blocker), _) => format!("blocked by {blocker}"),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{:<20} {:<16} {:>8}  {detail}",
            service.name, service.state, service.restart_count
        );
    }
    Ok(0)
}

pub fn plan(context: &Context, args: &ModelArgs) -> color_eyre::Result<i32> {
    let (model, _) = context.load(args)?;
    let capacity = resolve_capacity(&model.engine, args.cpus, args.memory)?;
    let graph = DependencyGraph::build(&model)?;
    let ledger = allocate(&graph, &model, capacity)?;

    println!("project {}", model.project);
    for (position, name) in graph.order().iter().enumerate() {
        let reservation = ledger.reservation(name).unwrap_or_default();
        let waits_on = graph.predecessors(name).join(", ");
        print!("{:>3}. {name:<20} {reservation}", position + 1);
        if !waits_on.is_empty() {
            print!("  after {waits_on}");
        }
        println!();
    }
    println!("reserved {} of {capacity}", ledger.allocated());
    Ok(0)
}

pub async fn logs(
    context: &Context,
    service: &str,
    follow: bool,
    tail: Option<usize>,
) -> color_eyre::Result<i32> {
    let (model, _) = context.load(&ModelArgs::default())?;
    if model.service(service).is_none() {
        return Err(eyre!("service '{service}' is not defined in the spec"));
    }

    let backend = DockerBackend::new();
    let command = backend.logs_command(&model.container_name(service), follow, tail);
    let (mut child, mut lines) = stream_lines(command, service)?;

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => println!("{line}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                child.kill().await?;
                break;
            }
        }
    }
    let status = child.wait().await?;
    Ok(if status.success() { 0 } else { status.code().unwrap_or(1) })
}

/// Run the live table until the user quits.
pub async fn watch(context: &Context, refresh: Duration) -> color_eyre::Result<i32> {
    let (model, spec_path) = context.load(&ModelArgs::default())?;
    let state_directory = loader::state_directory(&spec_path, &model.engine);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AppEvent>();
    let input_task = spawn_input_task(event_tx.clone());
    let state_task = spawn_state_task(state_directory, refresh, event_tx);

    // Initialize terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(model.project.clone());
    let result = run_watch_loop(&mut terminal, &mut app, &mut event_rx).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    input_task.abort();
    state_task.abort();

    result.map(|()| 0)
}

async fn run_watch_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    event_rx: &mut mpsc::UnboundedReceiver<AppEvent>,
) -> color_eyre::Result<()> {
    loop {
        terminal.draw(|f| ui::render(f, app, None))?;

        let Some(event) = event_rx.recv().await else {
            return Ok(());
        };
        match event {
            AppEvent::Key(key) => {
                if key.kind == crossterm::event::KeyEventKind::Press {
                    keys::handle_key(app, key);
                }
            }
            AppEvent::State(state) => {
                app.status_message = None;
                app.apply_state(state);
            }
            AppEvent::Error(msg) => {
                tracing::debug!(error = %msg, "state_read_failed");
                app.set_status(format!("Error: {msg}"));
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}
