//! # Router & RPC Correlator
//!
//! `Router::route` is the single entry point for every message the broker
//! handles: broker-local RPC dispatch, correlated-response delivery,
//! remote-target egress and fallback enqueue onto the internal [`Bus`].
//! Grounded in the teacher's connection-id allocation pattern
//! (`ipc::unix_domain_socket`'s `AtomicU64` counter) for correlation-id
//! generation, generalized from a raw counter to the `corr-<n>` token the
//! design calls for.

use crate::bus::{Bus, BusStats};
use crate::error::{BrokerError, BrokerResult};
use crate::message::{Message, MessageType};
use crate::transport_manager::TransportManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Deadline for delivering a matched response onto a waiter's channel
/// before concluding the waiter abandoned the call.
const RESPONSE_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Narrow capability the Optimizer calls into for broker-local RPC without
/// depending on the concrete `Router` type. Breaks the Router/Optimizer
/// cyclic reference the design notes call out.
#[async_trait]
pub trait BrokerRpcHandler: Send + Sync {
    async fn process_broker_message(&self, msg: Message) -> Option<Message>;
}

/// A single in-flight broker-issued request awaiting its response.
struct PendingRequest {
    responder: oneshot::Sender<Message>,
}

/// Signature of a broker-local RPC method handler: takes the decoded
/// request and the requesting process id, returns the response payload or
/// a `BrokerError` rendered as an error message by the caller.
pub type RpcMethod = Arc<dyn Fn(&Message) -> BrokerResult<Value> + Send + Sync>;

/// Dispatches messages by target, correlates broker-issued RPC calls with
/// their responses, and hosts the broker-local RPC method table.
///
/// Holds only weak references (ids) into the supervisor/transport manager;
/// every call re-resolves its target rather than caching a handle.
pub struct Router {
    bus: Arc<Bus>,
    transport_manager: Arc<TransportManager>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_correlation_id: AtomicU64,
    methods: Mutex<HashMap<&'static str, RpcMethod>>,
    cancel: CancellationToken,
}

impl Router {
    pub fn new(bus: Arc<Bus>, transport_manager: Arc<TransportManager>, cancel: CancellationToken) -> Self {
        Self {
            bus,
            transport_manager,
            pending: Mutex::new(HashMap::new()),
            next_correlation_id: AtomicU64::new(1),
            methods: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Register (or replace) a broker-local RPC method handler.
    pub fn register_method(&self, name: &'static str, handler: RpcMethod) {
        self.methods.lock().insert(name, handler);
    }

    /// Monotone, collision-free correlation id generator, prefixed `corr-`.
    pub fn generate_correlation_id(&self) -> String {
        let n = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        format!("corr-{n}")
    }

    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    /// Number of pending RPC entries currently parked. Exposed for tests
    /// verifying pending-table conservation.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Single entry point for any message the broker handles.
    ///
    /// 1. Fill in `Source` if the caller left it empty.
    /// 2. A `response` with a non-empty `correlation_id` matching a pending
    ///    entry completes that entry and returns; otherwise it falls
    ///    through to steps 3-5 using `Target` as normal (see Open Question
    ///    (a) in the design: an orphaned "response" is routed like any
    ///    other message rather than silently dropped).
    /// 3. `Target == "broker"` dispatches to broker-local RPC.
    /// 4. `Target != ""` egresses via the transport manager.
    /// 5. Otherwise enqueues onto the internal Bus.
    pub async fn route(&self, mut msg: Message, source_process_id: &str) -> BrokerResult<()> {
        if msg.source.is_empty() {
            msg.source = source_process_id.to_string();
        }

        if msg.message_type == MessageType::Response && !msg.correlation_id.is_empty() {
            if let Some(pending) = self.pending.lock().remove(&msg.correlation_id) {
                return self.deliver(pending, msg).await;
            }
        }

        if msg.target == "broker" {
            if let Some(response) = self.process_broker_message(msg).await {
                return self.route_boxed(response).await;
            }
            return Ok(());
        }

        if !msg.target.is_empty() {
            return self.transport_manager.send_to_process(&msg.target, &msg).await;
        }

        self.bus.send(msg, &self.cancel).await
    }

    /// Route a broker-emitted message (an error or response the broker
    /// itself constructed) back out through the normal path.
    async fn route_boxed(&self, msg: Message) -> BrokerResult<()> {
        if !msg.target.is_empty() && msg.target != "broker" {
            self.transport_manager.send_to_process(&msg.target, &msg).await
        } else {
            self.bus.send(msg, &self.cancel).await
        }
    }

    async fn deliver(&self, pending: PendingRequest, msg: Message) -> BrokerResult<()> {
        match tokio::time::timeout(RESPONSE_DELIVERY_TIMEOUT, async {
            pending.responder.send(msg)
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_returned)) => {
                // Waiter already dropped its receiver (abandoned the call).
                Ok(())
            }
            Err(_) => Err(BrokerError::timeout("timeout delivering response to waiter")),
        }
    }

    /// Dispatch a broker-local RPC request. Only `request` messages are
    /// dispatched; every other type is silently accepted (a no-op here).
    /// The method name is `msg.id`. An unknown method, or a handler
    /// returning an error, is rendered as an `error` message addressed
    /// back to the original source.
    pub async fn process_broker_message(&self, msg: Message) -> Option<Message> {
        if msg.message_type != MessageType::Request {
            return None;
        }

        let handler = self.methods.lock().get(msg.id.as_str()).cloned();
        let response = match handler {
            Some(handler) => match handler(&msg) {
                Ok(payload) => Message::new_response(&msg.id, "broker", &msg.source, &msg.correlation_id, &payload)
                    .unwrap_or_else(|e| {
                        Message::new_error(&msg.id, "broker", &msg.source, &msg.correlation_id, e.to_string())
                    }),
                Err(e) => Message::new_error(&msg.id, "broker", &msg.source, &msg.correlation_id, e.to_string()),
            },
            None => Message::new_error(
                &msg.id,
                "broker",
                &msg.source,
                &msg.correlation_id,
                format!("unknown broker RPC method '{}'", msg.id),
            ),
        };
        Some(response)
    }

    /// Broker-issued outbound RPC: send `method` with `params` to `target`
    /// and wait for the correlated response (or `timeout`, or broker
    /// shutdown). The pending entry is always removed before returning,
    /// whichever of the three fires first.
    pub async fn invoke_rpc(
        &self,
        source: &str,
        target: &str,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> BrokerResult<Message> {
        let correlation_id = self.generate_correlation_id();
        let request = Message::new_request(method, source, target, &correlation_id, params)?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(correlation_id.clone(), PendingRequest { responder: tx });

        if let Err(e) = self.route(request, source).await {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        tokio::select! {
            result = rx => {
                result.map_err(|_| BrokerError::cancelled("broker shutdown while awaiting RPC response"))
            }
            _ = tokio::time::sleep(timeout) => {
                self.pending.lock().remove(&correlation_id);
                Err(BrokerError::timeout(format!(
                    "InvokeRPC to '{target}' method '{method}' timed out after {timeout:?}"
                )))
            }
            _ = self.cancel.cancelled() => {
                self.pending.lock().remove(&correlation_id);
                Err(BrokerError::cancelled("broker shutdown while awaiting RPC response"))
            }
        }
    }

    /// Drain the pending table, failing every outstanding `invoke_rpc`
    /// caller with a cancellation error. Called transitively from
    /// `Broker::shutdown` via the supervisor's shutdown sequence.
    pub fn fail_all_pending(&self) {
        let mut pending = self.pending.lock();
        let count = pending.len();
        if count > 0 {
            debug!(count, "failing pending RPC entries on shutdown");
        }
        pending.clear();
    }
}

#[async_trait]
impl BrokerRpcHandler for Router {
    async fn process_broker_message(&self, msg: Message) -> Option<Message> {
        Router::process_broker_message(self, msg).await
    }
}

/// Helper constructing the standard `{"count": N}`-shaped payload used by
/// `RPCGetMessageCount`.
pub fn message_count_payload(bus: &Bus) -> Value {
    let stats = bus.stats();
    json!({ "count": stats.total_sent + stats.total_received })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn router() -> (Arc<Router>, Arc<Bus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(Bus::new(16));
        let transport_manager = Arc::new(TransportManager::new(dir.path()));
        let cancel = CancellationToken::new();
        let router = Arc::new(Router::new(bus.clone(), transport_manager, cancel));
        (router, bus, dir)
    }

    #[test]
    fn correlation_ids_are_monotone_and_prefixed() {
        let (router, _bus, _dir) = router();
        let ids: Vec<_> = (0..100).map(|_| router.generate_correlation_id()).collect();
        for id in &ids {
            assert!(id.starts_with("corr-"));
        }
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn untargeted_message_lands_on_the_bus() {
        let (router, bus, _dir) = router();
        let msg = Message::new_event("evt", "", &json!({})).unwrap();
        router.route(msg, "src").await.unwrap();
        let received = bus.receive(&CancellationToken::new()).await.unwrap();
        assert_eq!(received.source, "src");
    }

    #[tokio::test]
    async fn unknown_broker_method_yields_error_reply() {
        let (router, bus, _dir) = router();
        let msg = Message::new_request("RPCDoesNotExist", "src", "broker", "corr-1", &json!({})).unwrap();
        router.route(msg, "src").await.unwrap();
        let reply = bus.receive(&CancellationToken::new()).await.unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.correlation_id, "corr-1");
        assert_eq!(reply.target, "src");
    }

    #[tokio::test]
    async fn known_broker_method_replies_with_source_broker() {
        let (router, bus, _dir) = router();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        router.register_method(
            "RPCGetMessageCount",
            Arc::new(move |_msg| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"count": 0}))
            }),
        );
        let msg = Message::new_request("RPCGetMessageCount", "src", "broker", "corr-2", &json!({})).unwrap();
        router.route(msg, "src").await.unwrap();
        let reply = bus.receive(&CancellationToken::new()).await.unwrap();
        assert_eq!(reply.message_type, MessageType::Response);
        assert_eq!(reply.source, "broker");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invoke_rpc_round_trips_through_pending_table() {
        let (router, _bus, dir) = router();
        let transport_manager = Arc::new(TransportManager::new(dir.path()));
        let transport = transport_manager.register_uds_transport("t").await.unwrap();
        let router = Arc::new(Router::new(router.bus.clone(), transport_manager.clone(), CancellationToken::new()));

        let client = crate::transport::UdsTransport::new(transport.socket_path());
        let accept = tokio::spawn({
            let transport = transport.clone();
            async move { transport.accept().await }
        });
        client.dial().await.unwrap();
        accept.await.unwrap().unwrap();

        let responder = {
            let client = client;
            tokio::spawn(async move {
                let req = client.receive().await.unwrap();
                let response = Message::new_response(&req.id, "t", &req.source, &req.correlation_id, &json!({"ok": true})).unwrap();
                client.send(&response).await.unwrap();
            })
        };

        let result = router
            .invoke_rpc("src", "t", "M", &json!({}), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(result.message_type, MessageType::Response);
        responder.await.unwrap();
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn invoke_rpc_times_out_and_clears_pending_entry() {
        let (router, _bus, dir) = router();
        let transport_manager = Arc::new(TransportManager::new(dir.path()));
        transport_manager.register_uds_transport("ghost").await.unwrap();
        let router = Arc::new(Router::new(router.bus.clone(), transport_manager, CancellationToken::new()));

        let err = router
            .invoke_rpc("src", "ghost", "M", &json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
        assert_eq!(router.pending_count(), 0);
    }
}
