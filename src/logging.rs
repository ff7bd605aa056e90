use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::filter::{Targets, filter_fn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target used for transition audit records
pub const AUDIT_TARGET: &str = "audit";

/// Flush guards for the non-blocking writers. Hold for the process lifetime.
pub struct LogGuards {
    _main: WorkerGuard,
    _audit: Option<WorkerGuard>,
}

fn appender(config: &AppConfig, file: &str) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, file),
        _ => tracing_appender::rolling::never(&config.log_dir, file),
    }
}

/// `txn_core.log` -> `txn_core.audit.log`
fn audit_file_name(log_file: &str) -> String {
    match log_file.rsplit_once('.') {
        Some((stem, ext)) => format!("{}.{}.{}", stem, AUDIT_TARGET, ext),
        None => format!("{}.{}", log_file, AUDIT_TARGET),
    }
}

/// Install the global subscriber.
///
/// Operational logs go to `log_file` (plus stdout in text mode). With
/// `enable_tracing`, transition audit records are written as JSON to a
/// separate `<stem>.audit.<ext>` file and kept out of the main log.
pub fn init_logging(config: &AppConfig) -> LogGuards {
    let (main_writer, main_guard) = tracing_appender::non_blocking(appender(config, &config.log_file));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let not_audit = filter_fn(|meta| meta.target() != AUDIT_TARGET);

    let (audit_layer, audit_guard) = if config.enable_tracing {
        let (writer, guard) =
            tracing_appender::non_blocking(appender(config, &audit_file_name(&config.log_file)));
        let layer = fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(Targets::new().with_target(AUDIT_TARGET, tracing::Level::INFO));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let registry = tracing_subscriber::registry().with(audit_layer);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(main_writer)
            .with_ansi(false)
            .with_filter(not_audit)
            .with_filter(filter);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(true)
            .with_writer(main_writer)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry
            .with(
                file_layer
                    .and_then(stdout_layer)
                    .with_filter(not_audit)
                    .with_filter(filter),
            )
            .init();
    }

    LogGuards {
        _main: main_guard,
        _audit: audit_guard,
    }
}
