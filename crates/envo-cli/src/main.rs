mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use envo_core::models::{CpuQuantity, MemoryQuantity};

/// Bring up a multi-service development environment from one spec file.
#[derive(Debug, Parser)]
#[command(name = "envo", version)]
struct Cli {
    /// Spec file; defaults to envo.yaml, envo.yml, compose.yaml or
    /// docker-compose.yml in the current directory.
    #[arg(short, long, global = true)]
    spec: Option<PathBuf>,

    /// Project name; defaults to the spec's `name`, then the directory name.
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// Also write debug logs to .envo-debug.log.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start every service in dependency order.
    Up {
        #[command(flatten)]
        model: ModelArgs,
        /// Keep reconciling (restart unhealthy services) until Ctrl-C.
        #[arg(short, long)]
        follow: bool,
    },
    /// Stop every service, dependents first, and remove what `up` created.
    Down {
        /// Leave named volumes in place.
        #[arg(long)]
        keep_volumes: bool,
    },
    /// Show the recorded state of each service.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print start order and reservations without touching the runtime.
    Plan {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Stream a service's output.
    Logs {
        service: String,
        #[arg(short, long)]
        follow: bool,
        /// Only the last N lines.
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Live table of service states.
    Watch {
        /// Refresh interval in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval: u64,
    },
}

/// Inputs that change how the spec resolves.
#[derive(Debug, Clone, Default, Args)]
pub struct ModelArgs {
    /// Entry of `variants:` to apply.
    #[arg(long)]
    pub variant: Option<String>,
    /// Override a variable (KEY=VALUE); wins over everything else.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,
    /// Host cpu capacity, e.g. 4 or 3500m.
    #[arg(long)]
    pub cpus: Option<CpuQuantity>,
    /// Host memory capacity, e.g. 8g.
    #[arg(long)]
    pub memory: Option<MemoryQuantity>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // The watch view owns the terminal; only the debug file gets logs there.
    let interactive = matches!(cli.command, Command::Watch { .. });
    let _guard = setup_logging(cli.debug, !interactive);

    let context = commands::Context {
        spec: cli.spec,
        project: cli.project,
    };
    let code = match cli.command {
        Command::Up { model, follow } => commands::up(&context, &model, follow).await?,
        Command::Down { keep_volumes } => commands::down(&context, keep_volumes).await?,
        Command::Status { json } => commands::status(&context, json).await?,
        Command::Plan { model } => commands::plan(&context, &model)?,
        Command::Logs {
            service,
            follow,
            tail,
        } => commands::logs(&context, &service, follow, tail).await?,
        Command::Watch { interval } => {
            commands::watch(&context, std::time::Duration::from_millis(interval)).await?
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Log to stderr (`RUST_LOG`, default info) and, with `--debug`, to
/// `.envo-debug.log` in the current directory. The returned guard must be
/// held for the lifetime of the program.
fn setup_logging(
    debug: bool,
    to_stderr: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stderr = to_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
    });

    let (file, guard) = if debug {
        let file_appender = tracing_appender::rolling::never(".", ".envo-debug.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry().with(stderr).with(file).init();
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_up_with_overrides() {
        let cli = Cli::parse_from([
            "envo", "--spec", "dev.yaml", "up", "--variant", "zsh", "--set", "TAG=1.2",
            "--cpus", "2", "--memory", "4g",
        ]);
        let Command::Up { model, follow } = cli.command else {
            panic!("expected up");
        };
        assert!(!follow);
        assert_eq!(model.variant.as_deref(), Some("zsh"));
        assert_eq!(model.set, [("TAG".to_string(), "1.2".to_string())]);
        assert_eq!(model.cpus, Some(CpuQuantity(2000)));
        assert_eq!(cli.spec, Some(PathBuf::from("dev.yaml")));
    }

    #[test]
    fn set_requires_key_value() {
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
        assert_eq!(
            parse_key_value("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
    }
}
