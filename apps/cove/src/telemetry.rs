//! Logging for the `cove` binary. Library code only emits `tracing` events under
//! `cove::*` targets; the binary decides where they go.

pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// A full `EnvFilter` directive string that replaces the level-derived filter.
    pub const FILTER_ENV: &str = "COVE_LOG_FILTER";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Let webrtc and websocket internals log at `level` too instead of `warn`.
        pub dependency_traces: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    /// Installs the global subscriber. Keep the returned guard alive for as long as logs
    /// should be flushed.
    pub fn init(config: &LogConfig) -> Result<WorkerGuard, InitError> {
        let directives = std::env::var(FILTER_ENV)
            .unwrap_or_else(|_| directives(config.level, config.dependency_traces));

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            // stdout carries the chat transcript.
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Configure(err.to_string()))?;

        tracing::debug!(target = "cove::telemetry", filter = %directives, "logging ready");
        Ok(guard)
    }

    /// Cove's own events at `level`; everything else capped at `warn` unless
    /// `dependency_traces` is set.
    pub(crate) fn directives(level: LogLevel, dependency_traces: bool) -> String {
        let own = level.as_str();
        let others = if dependency_traces {
            level
        } else {
            level.min(LogLevel::Warn)
        };
        format!("{},cove={own},cove_core={own}", others.as_str())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn verbose_levels_keep_dependencies_at_warn() {
            assert_eq!(
                directives(LogLevel::Debug, false),
                "warn,cove=debug,cove_core=debug"
            );
            assert_eq!(
                directives(LogLevel::Trace, true),
                "trace,cove=trace,cove_core=trace"
            );
        }

        #[test]
        fn quiet_levels_apply_everywhere() {
            assert_eq!(
                directives(LogLevel::Error, false),
                "error,cove=error,cove_core=error"
            );
            assert_eq!(LogLevel::default(), LogLevel::Warn);
        }

        #[test]
        fn the_filter_parses() {
            for level in [LogLevel::Error, LogLevel::Info, LogLevel::Trace] {
                assert!(EnvFilter::try_new(directives(level, false)).is_ok());
            }
        }
    }
}
