use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::SecretString;

#[derive(Clone, Parser, Debug)]
pub struct AppendCommand {
    /// The text to append
    #[clap(long, env = "STARCITE_DEV_CLIENT_TEXT", default_value = "hello from dev-client")]
    pub text: String,

    /// Idempotency key for the append
    #[clap(long, env = "STARCITE_DEV_CLIENT_IDEMPOTENCY_KEY")]
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Parser, Debug)]
pub struct TailCommand {
    /// The cursor to start from
    #[clap(long, env = "STARCITE_DEV_CLIENT_CURSOR", default_value = "0")]
    pub cursor: u64,

    /// Stop when caught up instead of staying live
    #[clap(long, env = "STARCITE_DEV_CLIENT_CATCH_UP")]
    pub catch_up: bool,

    /// Only show events of this agent
    #[clap(long, env = "STARCITE_DEV_CLIENT_AGENT")]
    pub agent: Option<String>,
}

#[derive(Clone, Parser, Debug)]
pub struct StressAppendCommand {
    /// The amount of appends
    #[clap(long, env = "STARCITE_DEV_CLIENT_RUNS", default_value = "10")]
    pub runs: usize,

    /// Send requests sequentially instead of concurrently
    #[clap(long, env = "STARCITE_DEV_CLIENT_SEQUENTIAL")]
    pub sequential: bool,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Create the session
    Create,
    /// Append one event
    Append(AppendCommand),
    /// Print the session's events as JSON lines
    Tail(TailCommand),
    /// Consume with a file-backed cursor, resuming where the last run left off
    Consume,
    /// Measure append throughput
    StressAppend(StressAppendCommand),
}

/// The configuration for the Starcite dev client.
///
/// It can be configured via environment variables or command line arguments using `clap`.
#[derive(Parser, Debug)]
pub struct DevClientConfig {
    /// The URL of the Starcite server
    #[clap(
        long,
        env = "STARCITE_DEV_CLIENT_URL",
        default_value = "http://127.0.0.1:4800"
    )]
    pub url: String,

    /// API key presented as a bearer token
    #[clap(long, env = "STARCITE_DEV_CLIENT_API_KEY")]
    pub api_key: Option<SecretString>,

    /// The session to operate on
    #[clap(long, env = "STARCITE_DEV_CLIENT_SESSION", default_value = "dev")]
    pub session: String,

    /// Directory holding the producer identity and consumption cursors
    #[clap(long, env = "STARCITE_DEV_CLIENT_STATE_DIR", default_value = ".starcite")]
    pub state_dir: PathBuf,

    /// Max wait time for the server health check
    #[clap(
        long,
        env = "STARCITE_DEV_CLIENT_WAIT_TIME",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub max_wait_time: Duration,

    /// Command
    #[command(subcommand)]
    pub command: Command,
}
