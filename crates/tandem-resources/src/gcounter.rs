//! Grow-only counter resource replicated by gossip.
//!
//! State-based CRDT: each peer owns one slot of a map from peer id to a
//! non-negative count, and the externally observed counter is the sum of
//! all slots. Replicas exchange whole maps and join them with a pointwise
//! max, so merges commute and re-delivery is harmless.
//!
//! The resource participates in the critical-section protocol: the first
//! read or write of an attempt raises the in-critical-section flag, and
//! while it is up, inbound remote states queue instead of merging, keeping
//! the attempt's view stable. The terminal call drains the queue. A
//! background task broadcasts the committed map to every reachable peer on
//! an interval, skipping ticks while an attempt holds uncommitted writes.
//!
//! Two locks guard the resource: one for the flag, one for the state.
//! They are always acquired in the order (flag, state) and never the other
//! way around.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};

use tandem_core::{ArchetypeResource, RuntimeError, RuntimeResult, Value};
use tandem_runtime::rpc::{decode, encode, RpcClient, RpcServer, RpcService};

/// RPC service name under which every replica accepts remote states.
pub const GCOUNTER_SERVICE: &str = "GCounter";

/// Timing knobs for gossip.
#[derive(Debug, Clone)]
pub struct GCounterConfig {
    /// Pause between broadcast ticks
    pub broadcast_interval: Duration,
    /// Per-peer wait for a broadcast acknowledgement
    pub broadcast_timeout: Duration,
    /// Per-peer dial timeout
    pub connection_timeout: Duration,
}

impl Default for GCounterConfig {
    fn default() -> Self {
        GCounterConfig {
            broadcast_interval: Duration::from_secs(5),
            broadcast_timeout: Duration::from_secs(2),
            connection_timeout: Duration::from_secs(2),
        }
    }
}

/// Map from peer id to that peer's partial count.
pub type CounterMap = BTreeMap<Value, i32>;

/// Join `other` into `into`, slot-wise: each peer's count becomes the max
/// of the two. Commutative, associative, idempotent.
pub(crate) fn merge(into: &mut CounterMap, other: &CounterMap) {
    for (peer, count) in other {
        let slot = into.entry(peer.clone()).or_insert(*count);
        if *count > *slot {
            *slot = *count;
        }
    }
}

fn fmt_counters(map: &CounterMap) -> String {
    let entries: Vec<String> = map.iter().map(|(k, v)| format!("{k}:{v}")).collect();
    format!("map[{}]", entries.join(" "))
}

/// Wire form of a replica's state: (peer id, count) pairs in map iteration
/// order. The receiver rebuilds the map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveValueArgs {
    entries: Vec<(Value, i32)>,
}

impl ReceiveValueArgs {
    /// Serialize a counter map.
    pub fn from_map(map: &CounterMap) -> Self {
        ReceiveValueArgs {
            entries: map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    /// Rebuild the counter map.
    pub fn into_map(self) -> CounterMap {
        self.entries.into_iter().collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ReceiveValueAck;

struct CounterState {
    value: CounterMap,
    old_value: CounterMap,
    has_old_value: bool,
    merge_queue: Vec<CounterMap>,
}

struct Shared {
    id: Value,
    // lock order: in_cs before state, always
    in_cs: RwLock<bool>,
    state: RwLock<CounterState>,
}

impl Shared {
    async fn enter_cs(&self) {
        *self.in_cs.write().await = true;
    }

    /// Terminal commit: queued remote states join the committed map, the
    /// rollback snapshot is discarded, and the flag drops.
    async fn commit(&self) {
        let mut in_cs = self.in_cs.write().await;
        let mut state = self.state.write().await;
        let queue = std::mem::take(&mut state.merge_queue);
        for other in &queue {
            merge(&mut state.value, other);
        }
        state.has_old_value = false;
        *in_cs = false;
    }

    /// Terminal abort: drain the queue, then roll the map back to the
    /// pre-attempt snapshot if one was taken, and drop the flag.
    async fn abort(&self) {
        let mut in_cs = self.in_cs.write().await;
        let mut state = self.state.write().await;
        let queue = std::mem::take(&mut state.merge_queue);
        for other in &queue {
            merge(&mut state.value, other);
        }
        if state.has_old_value {
            state.value = state.old_value.clone();
            state.has_old_value = false;
        }
        *in_cs = false;
    }

    /// Inbound remote state: merge immediately when quiescent, queue when
    /// an attempt is in flight. Observes the flag without ever waiting for
    /// it to drop.
    async fn receive(&self, other: CounterMap) {
        let in_cs = self.in_cs.read().await;
        let mut state = self.state.write().await;
        if !*in_cs {
            merge(&mut state.value, &other);
        } else {
            tracing::debug!(
                node = %self.id,
                queued = state.merge_queue.len() + 1,
                "in critical section, queuing merge"
            );
            state.merge_queue.push(other);
        }
    }
}

struct GCounterRpc {
    shared: Arc<Shared>,
}

#[async_trait]
impl RpcService for GCounterRpc {
    async fn dispatch(&self, method: &str, payload: &[u8]) -> RuntimeResult<Vec<u8>> {
        match method {
            "ReceiveValue" => {
                let args: ReceiveValueArgs = decode(payload)?;
                let other = args.into_map();
                tracing::debug!(node = %self.shared.id, value = %fmt_counters(&other), "received value");
                self.shared.receive(other).await;
                encode(&ReceiveValueAck)
            }
            other => Err(RuntimeError::network(format!(
                "unknown method {GCOUNTER_SERVICE}.{other}"
            ))),
        }
    }
}

/// Shared grow-only counter archetype resource.
pub struct GCounter {
    id: Value,
    shared: Arc<Shared>,
    clients: Arc<Mutex<HashMap<Value, Arc<RpcClient>>>>,
    shutdown: watch::Sender<bool>,
    closed: bool,
}

impl GCounter {
    /// Start a replica: bind the listen address `address_of(&id)`, accept
    /// remote states, and broadcast the committed map to `peers` on every
    /// interval. Local counter state is volatile; a restarted replica
    /// recovers it from its peers' gossip.
    pub async fn start(
        id: Value,
        peers: Vec<Value>,
        address_of: impl Fn(&Value) -> String,
        config: GCounterConfig,
    ) -> RuntimeResult<Self> {
        let listen_addr = address_of(&id);
        let peer_addrs: Vec<(Value, String)> = peers
            .iter()
            .filter(|peer| **peer != id)
            .map(|peer| (peer.clone(), address_of(peer)))
            .collect();

        let shared = Arc::new(Shared {
            id: id.clone(),
            in_cs: RwLock::new(false),
            state: RwLock::new(CounterState {
                value: CounterMap::new(),
                old_value: CounterMap::new(),
                has_old_value: false,
                merge_queue: Vec::new(),
            }),
        });

        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| RuntimeError::network(format!("bind {listen_addr}: {e}")))?;
        tracing::debug!(node = %id, addr = %listen_addr, "counter listening");

        let mut server = RpcServer::new();
        server.register(
            GCOUNTER_SERVICE,
            Arc::new(GCounterRpc {
                shared: Arc::clone(&shared),
            }),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.serve(listener, shutdown_rx));

        let clients = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(run_broadcasts(
            Arc::clone(&shared),
            peer_addrs,
            Arc::clone(&clients),
            config,
            shutdown.subscribe(),
        ));

        Ok(GCounter {
            id,
            shared,
            clients,
            shutdown,
            closed: false,
        })
    }

    #[cfg(test)]
    fn shared_for_tests(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }
}

#[async_trait]
impl ArchetypeResource for GCounter {
    async fn read(&mut self, index: &[Value]) -> RuntimeResult<Value> {
        if !index.is_empty() {
            return Err(RuntimeError::internal("counter resources take no index"));
        }
        self.shared.enter_cs().await;
        let state = self.shared.state.read().await;
        let sum = state
            .value
            .values()
            .fold(0i32, |acc, count| acc.wrapping_add(*count));
        Ok(Value::Number(sum))
    }

    async fn write(&mut self, index: &[Value], value: Value) -> RuntimeResult<()> {
        if !index.is_empty() {
            return Err(RuntimeError::internal("counter resources take no index"));
        }
        let count = value.as_number()?;
        self.shared.enter_cs().await;
        let mut state = self.shared.state.write().await;
        let current = state.value.get(&self.id).copied().unwrap_or(0);
        if count < current {
            return Err(RuntimeError::internal(format!(
                "grow-only counter cannot shrink: {count} < {current}"
            )));
        }
        if !state.has_old_value {
            state.old_value = state.value.clone();
            state.has_old_value = true;
        }
        state.value.insert(self.id.clone(), count);
        Ok(())
    }

    async fn pre_commit(&mut self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn commit(&mut self) {
        self.shared.commit().await;
    }

    async fn abort(&mut self) {
        self.shared.abort().await;
    }

    async fn close(&mut self) -> RuntimeResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.shutdown.send(true);
        let mut clients = self.clients.lock().await;
        let dropped = clients.len();
        clients.clear();
        let state = self.shared.state.read().await;
        tracing::debug!(
            node = %self.id,
            peers = dropped,
            state = %fmt_counters(&state.value),
            "closing counter"
        );
        Ok(())
    }
}

/// Dial every not-yet-connected peer, caching clients that answer.
async fn try_connect_peers(
    peer_addrs: &[(Value, String)],
    clients: &Mutex<HashMap<Value, Arc<RpcClient>>>,
    timeout: Duration,
) {
    for (peer, addr) in peer_addrs {
        let connected = clients.lock().await.contains_key(peer);
        if connected {
            continue;
        }
        match RpcClient::connect(addr, timeout).await {
            Ok(client) => {
                clients.lock().await.insert(peer.clone(), Arc::new(client));
            }
            Err(err) => {
                tracing::trace!(peer = %peer, error = %err, "peer not reachable");
            }
        }
    }
}

/// Broadcast loop: on every interval, refresh connections and push the
/// committed map to each connected peer. A tick that finds an attempt in
/// flight is skipped; one that cannot reach a peer logs and moves on.
async fn run_broadcasts(
    shared: Arc<Shared>,
    peer_addrs: Vec<(Value, String)>,
    clients: Arc<Mutex<HashMap<Value, Arc<RpcClient>>>>,
    config: GCounterConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|s| *s) => {
                tracing::debug!(node = %shared.id, "terminating broadcasts");
                return;
            }
            _ = tokio::time::sleep(config.broadcast_interval) => {}
        }

        try_connect_peers(&peer_addrs, &clients, config.connection_timeout).await;

        // snapshot the committed map; no lock is held across the calls below
        let snapshot = {
            let state = shared.state.read().await;
            if state.has_old_value {
                // mid-critical-section; wait for the value to stabilize
                None
            } else {
                Some(state.value.clone())
            }
        };
        let Some(value) = snapshot else { continue };
        let args = ReceiveValueArgs::from_map(&value);

        let targets: Vec<(Value, Arc<RpcClient>)> = clients
            .lock()
            .await
            .iter()
            .map(|(peer, client)| (peer.clone(), Arc::clone(client)))
            .collect();

        let calls: Vec<_> = targets
            .into_iter()
            .map(|(peer, client)| {
                let args = args.clone();
                let node = shared.id.clone();
                let timeout = config.broadcast_timeout;
                tokio::spawn(async move {
                    match tokio::time::timeout(
                        timeout,
                        client.call::<_, ReceiveValueAck>(GCOUNTER_SERVICE, "ReceiveValue", &args),
                    )
                    .await
                    {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(node = %node, peer = %peer, error = %err, "broadcast failed");
                        }
                        Err(_) => {
                            tracing::warn!(node = %node, peer = %peer, "broadcast timed out");
                        }
                    }
                })
            })
            .collect();
        for call in calls {
            let _ = call.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn quiet_config() -> GCounterConfig {
        // long interval: unit tests drive merges directly
        GCounterConfig {
            broadcast_interval: Duration::from_secs(3600),
            ..GCounterConfig::default()
        }
    }

    fn loopback(_: &Value) -> String {
        "127.0.0.1:0".to_string()
    }

    fn map(entries: &[(i32, i32)]) -> CounterMap {
        entries
            .iter()
            .map(|(k, v)| (Value::number(*k), *v))
            .collect()
    }

    #[tokio::test]
    async fn remote_state_during_critical_section_is_deferred_until_commit() {
        let mut counter = GCounter::start(
            Value::number(1),
            vec![],
            loopback,
            quiet_config(),
        )
        .await
        .unwrap();
        let shared = counter.shared_for_tests();

        counter.write(&[], Value::number(7)).await.unwrap();
        assert_eq!(counter.read(&[]).await.unwrap(), Value::number(7));

        // p2 gossips while p1 is mid-section
        shared.receive(map(&[(2, 5)])).await;
        assert_eq!(
            counter.read(&[]).await.unwrap(),
            Value::number(7),
            "read must not observe the queued merge"
        );

        counter.commit().await;
        assert_eq!(counter.read(&[]).await.unwrap(), Value::number(12));
        counter.commit().await;
    }

    #[tokio::test]
    async fn abort_restores_the_pre_write_value() {
        let mut counter = GCounter::start(
            Value::number(1),
            vec![],
            loopback,
            quiet_config(),
        )
        .await
        .unwrap();

        counter.write(&[], Value::number(4)).await.unwrap();
        counter.commit().await;

        counter.write(&[], Value::number(10)).await.unwrap();
        counter.abort().await;

        assert_eq!(counter.read(&[]).await.unwrap(), Value::number(4));
        counter.commit().await;

        // the snapshot was cleared: another abort is a no-op
        counter.abort().await;
        assert_eq!(counter.read(&[]).await.unwrap(), Value::number(4));
        counter.commit().await;
    }

    #[tokio::test]
    async fn quiescent_remote_state_merges_immediately() {
        let counter = GCounter::start(
            Value::number(1),
            vec![],
            loopback,
            quiet_config(),
        )
        .await
        .unwrap();
        let shared = counter.shared_for_tests();

        shared.receive(map(&[(2, 3), (3, 9)])).await;
        let state = shared.state.read().await;
        assert_eq!(state.value, map(&[(2, 3), (3, 9)]));
        assert!(state.merge_queue.is_empty());
    }

    #[tokio::test]
    async fn shrinking_the_local_slot_is_rejected() {
        let mut counter = GCounter::start(
            Value::number(1),
            vec![],
            loopback,
            quiet_config(),
        )
        .await
        .unwrap();

        counter.write(&[], Value::number(5)).await.unwrap();
        counter.commit().await;
        let err = counter.write(&[], Value::number(3)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Internal { .. }));
        counter.abort().await;
    }

    #[test]
    fn wire_round_trip_preserves_the_map() {
        let original = map(&[(1, 7), (2, 4), (3, 9)]);
        let bytes = encode(&ReceiveValueArgs::from_map(&original)).unwrap();
        let decoded: ReceiveValueArgs = decode(&bytes).unwrap();
        assert_eq!(decoded.into_map(), original);
    }

    fn counter_map_strategy() -> impl Strategy<Value = CounterMap> {
        proptest::collection::btree_map(
            (0i32..8).prop_map(Value::number),
            0i32..1000,
            0..6,
        )
    }

    proptest! {
        #[test]
        fn merge_commutes(a in counter_map_strategy(), b in counter_map_strategy()) {
            let mut ab = a.clone();
            merge(&mut ab, &b);
            let mut ba = b.clone();
            merge(&mut ba, &a);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn merge_is_idempotent(a in counter_map_strategy(), b in counter_map_strategy()) {
            let mut once = a.clone();
            merge(&mut once, &b);
            let mut twice = once.clone();
            merge(&mut twice, &b);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn merge_never_shrinks_a_slot(a in counter_map_strategy(), b in counter_map_strategy()) {
            let mut merged = a.clone();
            merge(&mut merged, &b);
            for (peer, count) in &a {
                prop_assert!(merged[peer] >= *count);
            }
            for (peer, count) in &b {
                prop_assert!(merged[peer] >= *count);
            }
        }
    }
}
