//! # Command-Line Interface
//!
//! Argument parsing for the `procbroker` binary, using `clap`'s derive API.
//! Grounded in the teacher's `cli::Args` shape (one flat `Parser` struct,
//! `help_heading` groups, a human-readable `parse_duration` for every
//! timing flag) but covering the broker's own surface: socket/service
//! directories, restart defaults, optimizer tuning, and RPC/ready/kill
//! timeouts, rather than benchmark mechanism/iteration knobs.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};
use std::path::PathBuf;
use std::time::Duration;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// procbroker - a local multi-process message broker
///
/// Spawns and supervises a fixed set of child services, carries typed
/// messages between them over point-to-point Unix domain socket
/// transports, and correlates request/response pairs for in-process RPC.
/// The broker is the only process that knows the full topology; children
/// communicate only with the broker.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Directory under which per-process `<id>.sock` listeners are created
    ///
    /// Defaults to the system temporary directory. Permissions on this
    /// directory are the only peer authentication the broker offers: it
    /// does not authenticate children beyond OS filesystem permissions.
    #[arg(long, help_heading = "Topology")]
    pub socket_dir: Option<PathBuf>,

    /// Directory scanned for co-located service binaries at startup
    ///
    /// Defaults to the directory containing the running broker executable.
    /// Binaries matching the `procbroker-svc-*` naming convention are
    /// spawned in parallel and treated as RPC children.
    #[arg(long, help_heading = "Topology")]
    pub service_dir: Option<PathBuf>,

    /// Default maximum restart attempts for a restart-enabled service
    ///
    /// A negative value means unbounded restarts. This is the default
    /// applied by `LoadProcessesFromConfig`; individual `SpawnWithRestart`
    /// callers may override it per process.
    #[arg(long, default_value_t = crate::defaults::MAX_RESTARTS, help_heading = "Supervisor")]
    pub max_restarts: i64,

    /// Delay between a restart-enabled child's exit and its respawn
    ///
    /// A value of zero is treated as "use the compiled-in default" rather
    /// than "restart immediately with no delay".
    #[arg(long, default_value = "1s", value_parser = parse_duration, help_heading = "Supervisor")]
    pub restart_delay: Duration,

    /// Deadline for a newly-spawned RPC child to emit `subprocess_ready`
    #[arg(long, default_value = "5s", value_parser = parse_duration, help_heading = "Supervisor")]
    pub ready_timeout: Duration,

    /// Deadline for a killed child to exit after SIGTERM before SIGKILL
    #[arg(long, default_value = "5s", value_parser = parse_duration, help_heading = "Supervisor")]
    pub kill_grace: Duration,

    /// Default timeout for a broker-initiated `InvokeRPC` call
    #[arg(long, default_value = "30s", value_parser = parse_duration, help_heading = "Supervisor")]
    pub rpc_timeout: Duration,

    /// Disable the performance optimizer entirely
    ///
    /// When set, every message is routed inline rather than offered to a
    /// work queue; the broker operates correctly either way.
    #[arg(long, help_heading = "Optimizer")]
    pub no_optimizer: bool,

    /// Optimizer bounded work queue capacity
    #[arg(long, default_value_t = crate::defaults::QUEUE_CAPACITY, help_heading = "Optimizer")]
    pub queue_capacity: usize,

    /// Drop policy applied when the work queue is full
    #[arg(long, value_enum, default_value_t = DropPolicyArg::Newest, help_heading = "Optimizer")]
    pub drop_policy: DropPolicyArg,

    /// Optimizer worker pool size (defaults to host parallelism, minimum 4)
    #[arg(long, help_heading = "Optimizer")]
    pub workers: Option<usize>,

    /// Number of messages a worker batches before dispatching (1 disables batching)
    #[arg(long, default_value_t = crate::defaults::BATCH_SIZE, help_heading = "Optimizer")]
    pub batch_size: usize,

    /// Maximum time a worker waits to fill a batch before flushing early
    #[arg(long, default_value = "50ms", value_parser = parse_duration, help_heading = "Optimizer")]
    pub flush_interval: Duration,

    /// Global permit budget backing admission control for third-party providers
    #[arg(long, default_value_t = crate::defaults::PERMIT_BUDGET, help_heading = "Optimizer")]
    pub permit_budget: usize,

    /// Enable the adaptive loop that revokes permits under sustained kernel-metric breach
    #[arg(long, help_heading = "Optimizer")]
    pub adaptive: bool,

    /// Silence all user-facing informational output on stdout
    ///
    /// When this flag is present, only diagnostic logs on stderr/file will
    /// be shown. Useful for scripting or when supervising this process
    /// under another init system.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: debug
    ///  -vv and above: trace
    /// By default, only INFO and above is shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Write detailed logs to this file instead of the default rolling log,
    /// or to "stderr" to log there instead of a file
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

/// Queue admission policy exposed on the CLI, mirroring
/// [`crate::optimizer::DropPolicy`] without pulling `clap::ValueEnum` onto
/// the core optimizer type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DropPolicyArg {
    Newest,
    Oldest,
}

/// Parse a human-readable duration like `"10s"`, `"500ms"`, `"5m"`, `"1h"`.
/// A bare number is treated as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => unreachable!("unit is one of the four suffixes matched above"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_empty_invalid_and_negative() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn zero_duration_parses_to_zero() {
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }
}
