use std::path::PathBuf;

use tokio::select;
use tokio::signal::unix;
use tokio::signal::unix::SignalKind;
use std::fmt::Write as _;

use tracing::field::{Field, Visit};
use tracing::{level_filters::LevelFilter, Event, Level, Subscriber};
use tracing_subscriber::{filter::Targets, layer::Layer, prelude::*, EnvFilter};

use crate::{
    cli::{daemon::Daemon, Cli},
    config::DaemonConfig,
};

/// Configuration file consulted when `-c` is not given.
const DEFAULT_CONFIG: &str = "/etc/tern/ternd.toml";

pub async fn run(cli: Cli) -> eyre::Result<()> {
    let path = cli.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = DaemonConfig::from_path(path)?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::from(config.logger.level)
    };

    let filter = Targets::new()
        .with_target("tern_engine", level)
        .with_target("tern_proto", level)
        .with_target("ternd", level)
        .with_default(level);

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()?;

    tracing_subscriber::registry()
        .with(TernTracer.with_filter(filter))
        .with(env_filter)
        .try_init()?;

    // A dropped control peer must not kill the daemon, and spawned
    // hooks are never waited on.
    //
    // SAFETY: trivially safe libc signal disposition changes.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }
    // Restrict the control socket node to owner and group.
    //
    // SAFETY: umask is async-signal-safe and cannot fail.
    unsafe {
        libc::umask(0o117);
    }

    let daemon = Daemon::new(config);
    let handle = daemon.run()?;

    let mut sigterm =
        unix::signal(SignalKind::terminate()).expect("Failed to create SIGTERM signal handler");
    let mut sigint =
        unix::signal(SignalKind::interrupt()).expect("Failed to create SIGINT signal handler");

    select! {
        _ = daemon.cancelled() => {
            tracing::info!("Engine stopped");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM signal");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT signal");
        }
    }

    daemon.shutdown(&handle).await;

    Ok(())
}

pub fn info() -> eyre::Result<()> {
    println!("ternd {}", env!("CARGO_PKG_VERSION"));
    println!("control protocol: {}", tern_engine::fsm::handler::GREETING);

    Ok(())
}

pub fn paths() -> eyre::Result<()> {
    println!("config: {}", DEFAULT_CONFIG);
    println!("socket: /tmp/ternd.sock");

    Ok(())
}

pub fn version() -> eyre::Result<()> {
    println!("{}", env!("CARGO_PKG_VERSION"));

    Ok(())
}

/// Syslog-flavoured line layer.
///
/// The engine names its subsystems through `target:` (`fsm`, `net`,
/// `control`, `plugins`, `hooks`, `event`); foreign crates show up
/// under the tail of their module path. Structured fields beyond the
/// message are appended as `key=value` so broadcast-style records stay
/// greppable.
struct TernTracer;

impl<S> Layer<S> for TernTracer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        let subsystem = metadata.target().rsplit("::").next().unwrap_or_default();

        let severity = match *metadata.level() {
            Level::ERROR => "error: ",
            Level::WARN => "warning: ",
            Level::INFO => "",
            Level::DEBUG => "debug: ",
            Level::TRACE => "trace: ",
        };

        let mut fields = LineFields::default();
        event.record(&mut fields);

        println!(
            "{} {}: {}{}{}",
            chrono::offset::Local::now().format("%b %e %H:%M:%S"),
            subsystem,
            severity,
            fields.message,
            fields.extras,
        );
    }
}

/// Splits an event into its message and the remaining fields.
#[derive(Default)]
struct LineFields {
    message: String,
    extras: String,
}

impl Visit for LineFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            write!(self.extras, " {}={}", field.name(), value).ok();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            write!(self.message, "{:?}", value).ok();
        } else {
            write!(self.extras, " {}={:?}", field.name(), value).ok();
        }
    }
}
