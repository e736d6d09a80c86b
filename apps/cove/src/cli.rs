use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use cove_core::config::DEFAULT_RELAY_URL;
use cove_core::protocol::ParticipantRole;
use cove_core::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "cove",
    about = "Two-party end-to-end encrypted chat and calls over WebRTC",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join a relay session and chat over stdin
    Join(JoinArgs),
    /// Run a host and a guest in-process and exchange one message
    Demo(DemoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    #[arg(
        long,
        env = "COVE_RELAY_URL",
        default_value = DEFAULT_RELAY_URL,
        help = "Relay WebSocket base URL; the token is appended as a path segment"
    )]
    pub relay: String,

    #[arg(long, env = "COVE_TOKEN", help = "Session token issued by the relay")]
    pub token: String,

    #[arg(
        long = "participant-id",
        env = "COVE_PARTICIPANT_ID",
        help = "Participant id returned when joining the session"
    )]
    pub participant_id: String,

    #[arg(long, env = "COVE_ROLE", help = "host or guest")]
    pub role: ParticipantRole,
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    #[arg(long, default_value = "hi", help = "Message the host sends to the guest")]
    pub message: String,

    #[arg(long, help = "Also place and hang up an audio call")]
    pub call: bool,

    #[arg(long, default_value_t = 30, help = "Give up after this many seconds")]
    pub timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "COVE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "COVE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,

    #[arg(
        long = "trace-deps",
        global = true,
        env = "COVE_TRACE_DEPS",
        help = "Log webrtc and websocket internals at the chosen level"
    )]
    pub trace_deps: bool,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            dependency_traces: self.trace_deps,
        }
    }
}

/// A line typed at the `join` prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    Empty,
    Text(String),
    Delete(String),
    Call,
    Accept,
    Reject,
    Cancel,
    Hangup,
    Status,
    Quit,
    Unknown(String),
}

impl InputLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return InputLine::Empty;
        }
        if !line.starts_with('/') {
            return InputLine::Text(line.to_string());
        }
        let (command, rest) = line
            .split_once(char::is_whitespace)
            .map(|(command, rest)| (command, rest.trim()))
            .unwrap_or((line, ""));
        match command {
            "/delete" if !rest.is_empty() => InputLine::Delete(rest.to_string()),
            "/call" => InputLine::Call,
            "/accept" => InputLine::Accept,
            "/reject" => InputLine::Reject,
            "/cancel" => InputLine::Cancel,
            "/hangup" => InputLine::Hangup,
            "/status" => InputLine::Status,
            "/quit" | "/exit" => InputLine::Quit,
            _ => InputLine::Unknown(command.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_arguments_parse() {
        let cli = Cli::try_parse_from([
            "cove",
            "--log-level",
            "debug",
            "join",
            "--relay",
            "ws://relay.test/ws/sessions",
            "--token",
            "tok",
            "--participant-id",
            "p-1",
            "--role",
            "guest",
        ])
        .unwrap();
        assert_eq!(cli.logging.level, LogLevel::Debug);
        let Command::Join(args) = cli.command else {
            panic!("expected join");
        };
        assert_eq!(args.role, ParticipantRole::Guest);
        assert_eq!(args.participant_id, "p-1");
    }

    #[test]
    fn input_lines() {
        assert_eq!(InputLine::parse("  hello there "), InputLine::Text("hello there".into()));
        assert_eq!(InputLine::parse("/delete  abc"), InputLine::Delete("abc".into()));
        assert_eq!(InputLine::parse("/delete"), InputLine::Unknown("/delete".into()));
        assert_eq!(InputLine::parse("/hangup"), InputLine::Hangup);
        assert_eq!(InputLine::parse(""), InputLine::Empty);
    }
}
