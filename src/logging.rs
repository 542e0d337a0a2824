//! Activity and error log sinks.
//!
//! Both sinks are append-only files fed by one `tracing` subscriber:
//! - the activity file receives every event allowed by the level filter
//! - the error file receives `WARN` and above
//!
//! Worker processes log activity to the same file and send warnings to
//! stderr, which the server forwards to its own error sink.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Local wall-clock timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Open `path` for appending, creating it and its parent directory.
pub fn open_sink(path: &Path) -> std::io::Result<Arc<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Arc::new)
}

/// Level filter from `RUST_LOG`, falling back to `level`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn sinks_subscriber<A, E>(
    activity: A,
    errors: E,
    filter: EnvFilter,
) -> impl Subscriber + Send + Sync + 'static
where
    A: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    E: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let activity_layer = fmt::layer()
        .with_writer(activity)
        .with_ansi(false)
        .with_target(false)
        .with_timer(LocalTime)
        .with_filter(filter);

    let error_layer = fmt::layer()
        .with_writer(errors)
        .with_ansi(false)
        .with_target(false)
        .with_timer(LocalTime)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(activity_layer)
        .with(error_layer)
}

/// Install the server's global subscriber.
pub fn init(
    activity_log: &Path,
    error_log: &Path,
    level: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let activity = open_sink(activity_log)?;
    let errors = open_sink(error_log)?;

    sinks_subscriber(activity, errors, env_filter(level)).try_init()?;
    Ok(())
}

/// Install the subscriber for a worker process.
///
/// Warnings go to stderr without timestamps; the server stamps them when
/// it forwards them to its error sink.
pub fn init_worker(
    activity_log: Option<&Path>,
    level: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .with_filter(LevelFilter::WARN);

    let activity_layer = match activity_log {
        Some(path) => Some(
            fmt::layer()
                .with_writer(open_sink(path)?)
                .with_ansi(false)
                .with_target(false)
                .with_timer(LocalTime)
                .with_filter(env_filter(level)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(activity_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tracing::{error, info, warn};

    fn temp_log(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fullname-server-{}-{}.log",
            name,
            std::process::id()
        ))
    }

    #[test]
    fn test_events_routed_to_sinks() {
        let activity_path = temp_log("activity");
        let error_path = temp_log("errors");
        let _ = std::fs::remove_file(&activity_path);
        let _ = std::fs::remove_file(&error_path);

        let subscriber = sinks_subscriber(
            open_sink(&activity_path).unwrap(),
            open_sink(&error_path).unwrap(),
            EnvFilter::new("info"),
        );

        tracing::subscriber::with_default(subscriber, || {
            info!("client connected");
            warn!("command finished with error");
            error!(error = "boom", "failed to start worker");
        });

        let activity = std::fs::read_to_string(&activity_path).unwrap();
        let errors = std::fs::read_to_string(&error_path).unwrap();

        assert!(activity.contains("client connected"));
        assert!(activity.contains("failed to start worker"));
        assert!(!errors.contains("client connected"));
        assert!(errors.contains("command finished with error"));
        assert!(errors.contains("error=\"boom\"") || errors.contains("error=boom"));
        assert_eq!(errors.lines().count(), 2);

        std::fs::remove_file(&activity_path).unwrap();
        std::fs::remove_file(&error_path).unwrap();
    }

    #[test]
    fn test_open_sink_appends() {
        let path = temp_log("append");
        let _ = std::fs::remove_file(&path);

        {
            use std::io::Write;
            let file = open_sink(&path).unwrap();
            (&*file).write_all(b"first\n").unwrap();
        }
        {
            use std::io::Write;
            let file = open_sink(&path).unwrap();
            (&*file).write_all(b"second\n").unwrap();
        }

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_open_sink_creates_directory() {
        let dir = std::env::temp_dir().join(format!("fullname-server-logs-{}", std::process::id()));
        let path = dir.join("log_file.txt");
        let _ = std::fs::remove_dir_all(&dir);

        open_sink(&path).unwrap();
        assert!(path.exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
