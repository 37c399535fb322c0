//! # Broker Facade
//!
//! The single long-lived object a binary constructs: owns one
//! [`ProcessSupervisor`], one [`TransportManager`], one [`Router`] and an
//! optional [`Optimizer`], wires them together, and exposes the
//! init/shutdown lifecycle. Grounded in the teacher's top-level
//! `BenchmarkRunner` (one owning object per run, constructed once,
//! `run`/cleanup lifecycle) generalized from a single benchmark pass to a
//! long-lived supervising process.

use crate::bus::Bus;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::message::Message;
use crate::optimizer::Optimizer;
use crate::process::supervisor::MessageSink;
use crate::process::ProcessSupervisor;
use crate::router::Router;
use crate::transport_manager::TransportManager;
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const BUS_CAPACITY: usize = 4096;

/// Shared handle to the currently-attached optimizer, read by the RPC
/// handlers and the message sink, written by `attach_optimizer`. A plain
/// `RwLock` rather than `arc-swap` or similar, matching the rest of the
/// core's "parking-lot-or-std-lock, never held across `.await`" convention.
type OptimizerSlot = Arc<RwLock<Option<Arc<Optimizer>>>>;

/// The broker's single long-lived object. Constructed once per process;
/// reached only through whatever owns the returned value, never through
/// global state.
pub struct Broker {
    supervisor: Arc<ProcessSupervisor>,
    transport_manager: Arc<TransportManager>,
    router: Arc<Router>,
    optimizer: OptimizerSlot,
    bus: Arc<Bus>,
    cancel: CancellationToken,
}

/// Routes messages read off a child's transport into the router, or (when
/// an optimizer is attached and the message isn't broker-local RPC) onto
/// the optimizer's work queue instead of inline dispatch.
struct BrokerMessageSink {
    router: Arc<Router>,
    optimizer: OptimizerSlot,
}

#[async_trait]
impl MessageSink for BrokerMessageSink {
    async fn accept(&self, msg: Message, source_process_id: String) {
        let optimizer = self.optimizer.read().unwrap().clone();
        if msg.target != "broker" {
            if let Some(optimizer) = optimizer {
                // Best-effort: a rejected offer is dropped per the
                // configured queue drop policy, not escalated to an error.
                optimizer.offer(msg);
                return;
            }
        }
        if let Err(e) = self.router.route(msg, &source_process_id).await {
            tracing::warn!(error = %e, "dropping route failure from message sink");
        }
    }
}

impl Broker {
    /// Wire the supervisor, transport manager and router together. Spawns
    /// nothing; see [`Broker::start`].
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let bus = Arc::new(Bus::new(BUS_CAPACITY));
        let transport_manager = Arc::new(TransportManager::new(&config.socket_dir));
        let router = Arc::new(Router::new(bus.clone(), transport_manager.clone(), cancel.clone()));
        let supervisor = Arc::new(ProcessSupervisor::new(
            bus.clone(),
            transport_manager.clone(),
            cancel.clone(),
            config.supervisor_config(),
        ));

        let optimizer_slot: OptimizerSlot = Arc::new(RwLock::new(None));
        register_rpc_methods(&router, &bus, &optimizer_slot);

        if let Some(opt_config) = config.optimizer.clone() {
            let optimizer = Arc::new(Optimizer::new(opt_config, router.clone(), bus.clone()));
            optimizer.start();
            *optimizer_slot.write().unwrap() = Some(optimizer);
        }

        let broker = Arc::new(Self {
            supervisor,
            transport_manager,
            router,
            optimizer: optimizer_slot.clone(),
            bus,
            cancel,
        });

        let sink = Arc::new(BrokerMessageSink {
            router: broker.router.clone(),
            optimizer: optimizer_slot,
        });
        let supervisor_for_sink = broker.supervisor.clone();
        tokio::spawn(async move { supervisor_for_sink.set_message_sink(sink).await });

        broker
    }

    /// Discover and spawn the configured service set.
    pub async fn start(self: &Arc<Self>) -> BrokerResult<()> {
        self.supervisor.load_processes_from_config().await
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn transport_manager(&self) -> &Arc<TransportManager> {
        &self.transport_manager
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn optimizer(&self) -> Option<Arc<Optimizer>> {
        self.optimizer.read().unwrap().clone()
    }

    /// Hot-swap the attached optimizer (or detach it with `None`). The
    /// broker operates correctly either way.
    pub fn attach_optimizer(&self, optimizer: Option<Arc<Optimizer>>) {
        *self.optimizer.write().unwrap() = optimizer;
    }

    /// Broker-issued outbound RPC with the caller-supplied timeout.
    pub async fn invoke_rpc(
        &self,
        source: &str,
        target: &str,
        method: &str,
        params: &serde_json::Value,
        timeout: Duration,
    ) -> BrokerResult<Message> {
        self.router.invoke_rpc(source, target, method, params, timeout).await
    }

    /// Cancel the root context, drain the router's pending table, stop the
    /// optimizer, kill every still-running process, wait for background
    /// tasks, then close the Bus and every transport. The single place
    /// that tears the whole broker down.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("broker shutdown initiated");
        self.cancel.cancel();
        self.router.fail_all_pending();
        if let Some(optimizer) = self.optimizer() {
            optimizer.stop().await;
        }
        self.supervisor.shutdown().await;
    }
}

/// Install the broker-local RPC method table: `RPCGetMessageStats`,
/// `RPCGetMessageCount`, `RPCRequestPermits`, `RPCReleasePermits`,
/// `RPCGetKernelMetrics`. The permit/kernel-metric methods error with
/// `not-found` when no optimizer is attached, matching §6's "errors if
/// permit manager absent".
fn register_rpc_methods(router: &Arc<Router>, bus: &Arc<Bus>, optimizer: &OptimizerSlot) {
    let bus_for_stats = bus.clone();
    router.register_method(
        "RPCGetMessageStats",
        Arc::new(move |_msg| {
            let stats = bus_for_stats.stats();
            Ok(json!({
                "total": {
                    "total_sent": stats.total_sent,
                    "total_received": stats.total_received,
                    "by_type": stats.by_type,
                    "first_message_time": stats.first_message_time,
                    "last_message_time": stats.last_message_time,
                },
                "per_process": stats.per_peer,
            }))
        }),
    );

    let bus_for_count = bus.clone();
    router.register_method(
        "RPCGetMessageCount",
        Arc::new(move |_msg| Ok(crate::router::message_count_payload(&bus_for_count))),
    );

    let optimizer_for_request = optimizer.clone();
    router.register_method(
        "RPCRequestPermits",
        Arc::new(move |msg| {
            let optimizer = optimizer_for_request
                .read()
                .unwrap()
                .clone()
                .ok_or_else(|| BrokerError::not_found("no optimizer attached, permit manager unavailable"))?;
            let params: PermitParams = msg.decode_payload()?;
            let (granted, available) = optimizer.permits().request(&params.provider_id, params.permit_count);
            Ok(json!({ "granted": granted, "available": available, "provider_id": params.provider_id }))
        }),
    );

    let optimizer_for_release = optimizer.clone();
    router.register_method(
        "RPCReleasePermits",
        Arc::new(move |msg| {
            let optimizer = optimizer_for_release
                .read()
                .unwrap()
                .clone()
                .ok_or_else(|| BrokerError::not_found("no optimizer attached, permit manager unavailable"))?;
            let params: PermitParams = msg.decode_payload()?;
            let (success, available) = optimizer.permits().release(&params.provider_id, params.permit_count);
            Ok(json!({ "success": success, "available": available, "provider_id": params.provider_id }))
        }),
    );

    let optimizer_for_kernel = optimizer.clone();
    router.register_method(
        "RPCGetKernelMetrics",
        Arc::new(move |_msg| {
            let optimizer = optimizer_for_kernel
                .read()
                .unwrap()
                .clone()
                .ok_or_else(|| BrokerError::not_found("no optimizer attached, kernel metrics unavailable"))?;
            Ok(serde_json::to_value(optimizer.kernel_metrics())
                .expect("KernelMetrics always serializes to a JSON object"))
        }),
    );
}

#[derive(Debug, serde::Deserialize)]
struct PermitParams {
    provider_id: String,
    permit_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    fn test_config(dir: &std::path::Path) -> BrokerConfig {
        BrokerConfig {
            socket_dir: dir.to_path_buf(),
            service_dir: dir.to_path_buf(),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn broker_constructs_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(test_config(dir.path()));
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn broker_rpc_get_message_count_round_trips_via_bus() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.optimizer = None;
        let broker = Broker::new(config);
        let msg = Message::new_request("RPCGetMessageCount", "tester", "broker", "corr-x", &json!({})).unwrap();
        broker.router().route(msg, "tester").await.unwrap();
        let reply = broker.bus().receive(&CancellationToken::new()).await.unwrap();
        assert_eq!(reply.correlation_id, "corr-x");
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn permit_rpc_errors_without_an_attached_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.optimizer = None;
        let broker = Broker::new(config);
        let msg = Message::new_request(
            "RPCRequestPermits",
            "tester",
            "broker",
            "corr-y",
            &json!({"provider_id": "p", "permit_count": 5}),
        )
        .unwrap();
        broker.router().route(msg, "tester").await.unwrap();
        let reply = broker.bus().receive(&CancellationToken::new()).await.unwrap();
        assert_eq!(reply.message_type, crate::message::MessageType::Error);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn permit_rpc_grants_through_attached_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(test_config(dir.path()));
        let msg = Message::new_request(
            "RPCRequestPermits",
            "tester",
            "broker",
            "corr-z",
            &json!({"provider_id": "p", "permit_count": 5}),
        )
        .unwrap();
        broker.router().route(msg, "tester").await.unwrap();
        let reply = broker.bus().receive(&CancellationToken::new()).await.unwrap();
        assert_eq!(reply.message_type, crate::message::MessageType::Response);
        let payload: serde_json::Value = reply.decode_payload().unwrap();
        assert_eq!(payload["granted"], 5);
        broker.shutdown().await;
    }
}
