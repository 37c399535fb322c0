//! # Procbroker
//!
//! A local multi-process message broker: a process supervisor that spawns
//! and watches child services, carries typed messages over point-to-point
//! Unix domain socket transports, and correlates request/response pairs for
//! in-process RPC.

pub mod broker;
pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod message;
pub mod optimizer;
pub mod process;
pub mod router;
pub mod transport;
pub mod transport_manager;

pub use broker::Broker;
pub use bus::{Bus, BusStats};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use message::{Message, MessageType};
pub use optimizer::Optimizer;
pub use process::ProcessSupervisor;
pub use router::Router;

/// The current version of the broker crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values, gathered as associated constants rather
/// than literals scattered through the modules that use them.
pub mod defaults {
    use std::time::Duration;

    /// Maximum accepted size, in bytes, of one marshaled message line.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Default optimizer work queue capacity.
    pub const QUEUE_CAPACITY: usize = 1000;

    /// Minimum optimizer worker pool size, regardless of host parallelism.
    pub const MIN_WORKERS: usize = 4;

    /// Default restart delay applied when `--restart-delay` is zero.
    pub const RESTART_DELAY: Duration = Duration::from_secs(1);

    /// Default maximum restart attempts for a `SpawnWithRestart` process.
    pub const MAX_RESTARTS: i64 = 3;

    /// Deadline for a newly-spawned RPC child to emit `subprocess_ready`.
    pub const READY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Deadline for a killed child to exit after SIGTERM before SIGKILL.
    pub const KILL_GRACE: Duration = Duration::from_secs(5);

    /// Default timeout for a broker-initiated `InvokeRPC` call.
    pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

    /// Deadline for delivering a matched response to a waiting caller.
    pub const RESPONSE_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default optimizer batch size (1 disables batching).
    pub const BATCH_SIZE: usize = 1;

    /// Default optimizer batch flush interval.
    pub const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

    /// Default global permit budget backing admission control.
    pub const PERMIT_BUDGET: usize = 1000;

    /// Interval at which the adaptive loop samples kernel metrics.
    pub const ADAPTIVE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

    /// Consecutive breached samples required before the adaptive loop revokes permits.
    pub const ADAPTIVE_SUSTAIN_SAMPLES: u32 = 3;

    /// P99 latency, in milliseconds, above which a sample counts as breached.
    pub const ADAPTIVE_LATENCY_THRESHOLD_MS: f64 = 250.0;

    /// Queue saturation (0.0-1.0) above which a sample counts as breached.
    pub const ADAPTIVE_SATURATION_THRESHOLD: f64 = 0.85;

    /// Fraction of a provider's allocation revoked per adaptive breach.
    pub const ADAPTIVE_REVOKE_FRACTION: f64 = 0.2;

    /// Prefix stripped from auto-discovered service binary filenames to
    /// derive their process id.
    pub const SERVICE_BINARY_PREFIX: &str = "procbroker-svc-";
}
