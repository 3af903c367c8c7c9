use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Filter directives that replace the `--log-level` default when set, e.g.
/// `warn,simplepipe_peer=debug`.
pub const LOG_ENV: &str = "SIMPLEPIPE_LOG";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    /// One object per event; `channel` and `connection` are top-level keys.
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// `level` for the simplepipe crates, at most `warn` for everything else.
///
/// Targets match by prefix, so `simplepipe` also covers `simplepipe_peer` and
/// `simplepipe_transport`.
fn default_directives(level: LogLevel) -> String {
    let own = LevelFilter::from(level);
    let others = own.min(LevelFilter::WARN);
    format!("{others},simplepipe={own}")
}

fn env_filter(level: LogLevel) -> EnvFilter {
    let directives = std::env::var(LOG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_directives(level));
    EnvFilter::builder().parse_lossy(directives)
}

/// Install the stderr subscriber.
///
/// Connection and accept threads are named after their connection id and
/// channel, so thread names are always shown; targets only at debug and
/// trace.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter(level))
        .with_ansi(false)
        .with_thread_names(true)
        .with_target(matches!(level, LogLevel::Debug | LogLevel::Trace));

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().flatten_event(true).try_init();
        }
    }
}
