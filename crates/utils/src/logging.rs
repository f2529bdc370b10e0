//! provides logging helpers

use std::fmt::{self};
use std::path::Path;
use std::path::PathBuf;

use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Events on this target are written verbatim to the metrics file.
pub const METRICS_TARGET: &str = "metrics";

const DEFAULT_METRICS_PREFIX: &str = "metrics.log";

struct LineFormatter;

struct FieldVisitor {
    msg: String,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, _: &Field, value: &str) {
        self.msg.push_str(value);
    }

    fn record_debug(&mut self, _: &Field, value: &dyn fmt::Debug) {
        self.msg.push_str(&format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor { msg: String::new() };
        event.record(&mut visitor);
        writeln!(writer, "{}", visitor.msg)
    }
}

/// Splits the metrics path into the rotation directory and the file prefix.
fn rotation_target(metrics_file: &Path) -> (PathBuf, String) {
    if metrics_file.is_dir() {
        return (metrics_file.to_path_buf(), DEFAULT_METRICS_PREFIX.to_string());
    }
    let parent = metrics_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = metrics_file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_METRICS_PREFIX);
    (parent.to_path_buf(), prefix.to_string())
}

/// initiate the global tracing subscriber
///
/// Regular events go to stderr filtered by `RUST_LOG` (default INFO); events on
/// [`METRICS_TARGET`] go to a daily rolling file at `metrics_file`.
pub fn init<P: AsRef<Path>>(metrics_file: P) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter.and(filter::filter_fn(|metadata| {
            metadata.target() != METRICS_TARGET
        })));

    let (rotation_dir, prefix) = rotation_target(metrics_file.as_ref());
    let (file_writer, file_guard) = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(&rotation_dir)
    {
        Ok(appender) => tracing_appender::non_blocking(appender),
        Err(err) => {
            eprintln!(
                "failed to create metrics rolling file appender at {}: {err}; falling back to stdout",
                rotation_dir.display()
            );
            tracing_appender::non_blocking(std::io::stdout())
        }
    };

    let metrics_layer = layer()
        .event_format(LineFormatter)
        .fmt_fields(format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() == METRICS_TARGET
        }));

    registry().with(fmt_layer).with(metrics_layer).init();
    file_guard
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn rotation_target_for_file_path() {
        let (dir, prefix) = rotation_target(Path::new("/logs/gpu-mounter.metrics"));
        assert_eq!(dir, PathBuf::from("/logs"));
        assert_eq!(prefix, "gpu-mounter.metrics");
    }

    #[test]
    fn rotation_target_for_bare_file_name() {
        let (dir, prefix) = rotation_target(Path::new("metrics.out"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(prefix, "metrics.out");
    }

    #[test]
    fn rotation_target_for_directory() {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let (dir, prefix) = rotation_target(tmp.path());
        assert_eq!(dir, tmp.path().to_path_buf());
        assert_eq!(prefix, DEFAULT_METRICS_PREFIX);
    }
}
