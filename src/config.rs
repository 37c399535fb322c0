//! # Resolved Configuration
//!
//! `BrokerConfig` is the fully-resolved, build-time-and-CLI-derived
//! configuration a [`crate::broker::Broker`] is constructed from. Built once
//! from parsed arguments and never re-read at runtime, mirroring the
//! teacher's `BenchmarkConfiguration::from(&Args)` conversion shape.

use crate::cli::{Args, DropPolicyArg};
use crate::defaults;
use crate::optimizer::{DropPolicy, OptimizerConfig};
use crate::process::supervisor::SupervisorConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Fully-resolved broker configuration, derived once from CLI flags layered
/// over compiled-in defaults.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Directory under which per-process `<id>.sock` listeners are created.
    pub socket_dir: PathBuf,
    /// Directory scanned for co-located `procbroker-svc-*` service binaries.
    pub service_dir: PathBuf,
    pub ready_timeout: Duration,
    pub kill_grace: Duration,
    pub rpc_timeout: Duration,
    pub default_max_restarts: i64,
    pub default_restart_delay: Duration,
    pub optimizer: Option<OptimizerConfig>,
}

impl BrokerConfig {
    /// Transform parsed CLI arguments into a resolved `BrokerConfig`. Panics
    /// are never used here: every numeric/path argument clap already
    /// validated at parse time.
    pub fn from_args(args: &Args) -> Self {
        let socket_dir = args.socket_dir.clone().unwrap_or_else(std::env::temp_dir);
        let service_dir = args.service_dir.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()))
                .unwrap_or_else(|| PathBuf::from("."))
        });

        let optimizer = if args.no_optimizer {
            None
        } else {
            Some(OptimizerConfig {
                queue_capacity: args.queue_capacity,
                drop_policy: match args.drop_policy {
                    DropPolicyArg::Newest => DropPolicy::DropNewest,
                    DropPolicyArg::Oldest => DropPolicy::DropOldest,
                },
                workers: args.workers.unwrap_or_else(|| defaults::MIN_WORKERS.max(num_cpus::get())),
                batch_size: args.batch_size,
                flush_interval: args.flush_interval,
                permit_budget: args.permit_budget,
                adaptive_enabled: args.adaptive,
                ..OptimizerConfig::default()
            })
        };

        Self {
            socket_dir,
            service_dir,
            ready_timeout: args.ready_timeout,
            kill_grace: args.kill_grace,
            rpc_timeout: args.rpc_timeout,
            default_max_restarts: args.max_restarts,
            default_restart_delay: if args.restart_delay.is_zero() {
                defaults::RESTART_DELAY
            } else {
                args.restart_delay
            },
            optimizer,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            service_dir: self.service_dir.clone(),
            ready_timeout: self.ready_timeout,
            kill_grace: self.kill_grace,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
            service_dir: PathBuf::from("."),
            ready_timeout: defaults::READY_TIMEOUT,
            kill_grace: defaults::KILL_GRACE,
            rpc_timeout: defaults::RPC_TIMEOUT,
            default_max_restarts: defaults::MAX_RESTARTS,
            default_restart_delay: defaults::RESTART_DELAY,
            optimizer: Some(OptimizerConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn from_args_applies_restart_delay_zero_as_default() {
        let args = Args::parse_from(["procbroker", "--restart-delay", "0s"]);
        let config = BrokerConfig::from_args(&args);
        assert_eq!(config.default_restart_delay, defaults::RESTART_DELAY);
    }

    #[test]
    fn no_optimizer_flag_leaves_optimizer_unset() {
        let args = Args::parse_from(["procbroker", "--no-optimizer"]);
        let config = BrokerConfig::from_args(&args);
        assert!(config.optimizer.is_none());
    }
}
