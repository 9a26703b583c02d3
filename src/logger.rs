use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

/// Install the global tracing subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"` or
///   `"deepstack_flow=debug,reqwest=off"`).
/// - `log_file`, when given, also writes plain-text logs to a daily
///   rolling file next to it, plus newline-delimited JSON `request`
///   events to `<log_file>.requests`.
///
/// The returned guards flush the file writers on drop; keep them alive
/// for as long as the program logs.
pub fn init_tracing(log_level: &str, log_file: Option<&Path>) -> Result<Vec<WorkerGuard>> {
    let env_filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level `{log_level}`"))?;
    let stdout_layer = fmt::layer().with_target(false);

    let Some(log_file) = log_file else {
        Registry::default()
            .with(env_filter)
            .with(stdout_layer)
            .try_init()?;
        return Ok(vec![]);
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = log_file
        .file_name()
        .context("log file needs a file name")?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("could not create log dir {}", dir.display()))?;

    let (txt_writer, txt_guard) =
        tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, name));
    let txt_layer = fmt::layer().with_writer(txt_writer).with_ansi(false);

    let mut requests = name.to_os_string();
    requests.push(".requests");
    let (json_writer, json_guard) =
        tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, requests));
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()?;

    Ok(vec![txt_guard, json_guard])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_filter_directive() {
        assert!(init_tracing("deepstack_flow=loud", None).is_err());
    }
}
