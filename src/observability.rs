//! Logging setup and span helpers.
//!
//! Every state-machine step runs inside a `run_step` span carrying the run id,
//! the status being entered, and the task/round coordinates, so a single run
//! can be followed through the logs with `RUST_LOG=fedrun=debug`.

use fedrun_common::Run;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logs (for production)
    Json,
    /// Human-readable logs (for development)
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: json, pretty", s),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` controls levels (default `info`). When `log_file` is given, a
/// daily-rotated copy of the log is written next to it in JSON. Calling this
/// twice is harmless; the second call leaves the first subscriber in place.
pub fn init_logging(format: LogFormat, log_file: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = match format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    let file_layer = log_file.and_then(|path| {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty())?;
        let name = path.file_name()?;
        let appender = tracing_appender::rolling::daily(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        FILE_GUARD.set(guard).ok();
        Some(fmt::layer().json().with_ansi(false).with_writer(writer).boxed())
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .ok();
}

/// Span wrapping one state-machine step for `run`.
#[must_use]
pub fn step_span(run: &Run) -> Span {
    tracing::info_span!(
        "run_step",
        run_id = %run.id,
        batch = %run.batch_id,
        role = %run.role,
        status = %run.status,
        task_seq = run.cur_seq,
        round = run.round_seq(),
    )
}

/// Span wrapping one detection pass (poll or monitor).
#[must_use]
pub fn detect_span(pass: &'static str, site_uid: &str) -> Span {
    tracing::debug_span!("detect", pass = pass, site_uid = site_uid)
}
