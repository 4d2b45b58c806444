//! # Structured Logging Module
//!
//! Console plus JSON-file logging for the sync workers. The JSON file under
//! `log/` is what gets shipped; the console layer is for operators.
//!
//! Level defaults to `debug`, or `info` in production. `RUST_LOG` overrides both.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

/// Keeps the non-blocking file writer alive for the life of the process
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOG_GUARD.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let pid = process::id();

        let console_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(build_filter(&log_level));

        let log_dir = PathBuf::from("log");
        let file_setup = fs::create_dir_all(&log_dir).map(|_| {
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
            let file_name = format!("crm-sync.{environment}.{pid}.{timestamp}.log");
            let appender = tracing_appender::rolling::never(&log_dir, &file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, guard, log_dir.join(file_name))
        });

        match file_setup {
            Ok((writer, guard, log_path)) => {
                let file_layer = fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(build_filter(&log_level));

                if tracing_subscriber::registry()
                    .with(console_layer)
                    .with(file_layer)
                    .try_init()
                    .is_err()
                {
                    tracing::debug!("Global tracing subscriber already initialized");
                }

                tracing::info!(
                    pid = pid,
                    environment = %environment,
                    log_file = %log_path.display(),
                    "🔧 Structured logging initialized"
                );
                Some(guard)
            }
            Err(e) => {
                if tracing_subscriber::registry()
                    .with(console_layer)
                    .try_init()
                    .is_err()
                {
                    tracing::debug!("Global tracing subscriber already initialized");
                }
                tracing::warn!(error = %e, "Log directory unavailable, logging to console only");
                None
            }
        }
    });
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn get_environment() -> String {
    std::env::var("CRM_SYNC_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log a sync run lifecycle event
pub fn log_sync_operation(
    operation: &str,
    sync_id: Option<Uuid>,
    data_type: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        sync_id = ?sync_id,
        data_type = %data_type,
        status = %status,
        details = details,
        "🔄 SYNC_OPERATION"
    );
}

/// Log a queue job lifecycle event
pub fn log_job_operation(
    operation: &str,
    job_id: Uuid,
    job_type: &str,
    status: &str,
    attempts: Option<i32>,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = %job_id,
        job_type = %job_type,
        status = %status,
        attempts = attempts,
        details = details,
        "📋 JOB_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("staging"), "debug");
    }
}
