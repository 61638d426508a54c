//! Process-initialization barrier.
//!
//! A compiled system starts every process at once: each process calls
//! [`ProcessBarrier::wait_peers`] and none returns until all have called.
//! One process — the one whose address equals the configured coordinator
//! address — counts arrivals; the rest announce themselves to it. When the
//! count reaches the peer-set size, the coordinator invokes `Start` on
//! every other process and releases itself. The barrier is reusable: each
//! crossing resets the ready counter.
//!
//! Dial failures toward the coordinator mean it is not up yet and are
//! retried indefinitely; failures of the coordinator's own calls to peers
//! propagate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};

use tandem_core::{RuntimeError, RuntimeResult};

use crate::rpc::{decode, encode, RpcClient, RpcServer, RpcService};

/// Well-known RPC service name every process exposes.
pub const PROCESS_SERVICE: &str = "PlusCalProcess";

/// Barrier timing knobs.
#[derive(Debug, Clone)]
pub struct BarrierConfig {
    /// Sleep between attempts to reach a coordinator that is not up yet
    pub coordinator_retry: Duration,
    /// Per-dial timeout
    pub dial_timeout: Duration,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        BarrierConfig {
            coordinator_retry: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(2),
        }
    }
}

struct BarrierShared {
    peers: Vec<String>,
    self_addr: String,
    coordinator: String,
    config: BarrierConfig,
    ready: AtomicU32,
    start_tx: mpsc::Sender<()>,
    clients: Mutex<HashMap<String, Arc<RpcClient>>>,
}

impl BarrierShared {
    fn is_coordinator(&self) -> bool {
        self.self_addr == self.coordinator
    }

    /// Memoized client for `addr`, dialing on first use.
    async fn client(&self, addr: &str) -> RuntimeResult<Arc<RpcClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(RpcClient::connect(addr, self.config.dial_timeout).await?);
        clients.insert(addr.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Coordinator side: once every peer has checked in, tell each of them
    /// to start, then release ourselves. The counter resets atomically with
    /// the barrier firing, so a fast peer's next-crossing `ProcessReady`
    /// arriving mid-release counts toward the next crossing instead of
    /// being wiped.
    async fn check_barrier(&self) -> RuntimeResult<()> {
        let full = self.peers.len() as u32;
        if self
            .ready
            .compare_exchange(full, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        for peer in &self.peers {
            if *peer == self.self_addr {
                continue;
            }
            let client = self.client(peer).await?;
            let _ok: bool = client.call(PROCESS_SERVICE, "Start", &0i32).await?;
        }
        let _ = self.start_tx.send(()).await;
        Ok(())
    }

    /// Non-coordinator side: reach the coordinator, retrying until it is
    /// up, and announce readiness.
    async fn hello_coordinator(&self) {
        loop {
            let client = match self.client(&self.coordinator).await {
                Ok(client) => client,
                Err(err) => {
                    tracing::trace!(error = %err, "coordinator not up yet");
                    tokio::time::sleep(self.config.coordinator_retry).await;
                    continue;
                }
            };
            match client
                .call::<_, bool>(PROCESS_SERVICE, "ProcessReady", &self.self_addr)
                .await
            {
                Ok(_) => return,
                Err(err) => {
                    tracing::debug!(error = %err, "coordinator hello failed, retrying");
                    // the cached connection may be dead; redial next round
                    self.clients.lock().await.remove(&self.coordinator);
                }
            }
        }
    }
}

struct ProcessRpc {
    shared: Arc<BarrierShared>,
}

#[async_trait]
impl RpcService for ProcessRpc {
    async fn dispatch(&self, method: &str, payload: &[u8]) -> RuntimeResult<Vec<u8>> {
        match method {
            "ProcessReady" => {
                let peer: String = decode(payload)?;
                let ready = self.shared.ready.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(peer = %peer, ready, "process ready");
                self.shared.check_barrier().await?;
                encode(&true)
            }
            "Start" => {
                let _round: i32 = decode(payload)?;
                let _ = self.shared.start_tx.send(()).await;
                encode(&true)
            }
            other => Err(RuntimeError::network(format!(
                "unknown method {PROCESS_SERVICE}.{other}"
            ))),
        }
    }
}

/// Reusable start rendezvous across every process in a system.
pub struct ProcessBarrier {
    shared: Arc<BarrierShared>,
    start_rx: Mutex<mpsc::Receiver<()>>,
    listening: Mutex<bool>,
    shutdown: watch::Sender<bool>,
}

impl ProcessBarrier {
    /// A barrier over `peers` (every process address, this one included),
    /// run by the process listening on `self_addr`, coordinated by the
    /// process listening on `coordinator`.
    pub fn new(peers: Vec<String>, self_addr: String, coordinator: String) -> Self {
        Self::with_config(peers, self_addr, coordinator, BarrierConfig::default())
    }

    /// Like [`ProcessBarrier::new`], with explicit timing knobs.
    pub fn with_config(
        peers: Vec<String>,
        self_addr: String,
        coordinator: String,
        config: BarrierConfig,
    ) -> Self {
        let (start_tx, start_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        ProcessBarrier {
            shared: Arc::new(BarrierShared {
                peers,
                self_addr,
                coordinator,
                config,
                ready: AtomicU32::new(0),
                start_tx,
                clients: Mutex::new(HashMap::new()),
            }),
            start_rx: Mutex::new(start_rx),
            listening: Mutex::new(false),
            shutdown,
        }
    }

    /// Block until every process in the system has called `wait_peers`.
    /// May be called again for further barriers; each crossing resets the
    /// ready counter.
    pub async fn wait_peers(&self) -> RuntimeResult<()> {
        self.ensure_listening().await?;

        // this process is ready; the coordinator also counts the arrivals
        // announced over ProcessReady
        self.shared.ready.fetch_add(1, Ordering::SeqCst);

        if self.shared.is_coordinator() {
            self.shared.check_barrier().await?;
        } else {
            self.shared.hello_coordinator().await;
        }

        self.start_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| RuntimeError::internal("barrier start channel closed"))?;

        // the coordinator's counter was reset when the barrier fired;
        // everyone else's counts nothing between crossings
        if !self.shared.is_coordinator() {
            self.shared.ready.store(0, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Stop the RPC listener. Further `wait_peers` calls would hang; only
    /// call when the process is shutting down.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn ensure_listening(&self) -> RuntimeResult<()> {
        let mut listening = self.listening.lock().await;
        if *listening {
            return Ok(());
        }
        let listener = TcpListener::bind(&self.shared.self_addr)
            .await
            .map_err(|e| {
                RuntimeError::network(format!("bind {}: {e}", self.shared.self_addr))
            })?;
        tracing::debug!(addr = %self.shared.self_addr, "barrier listening");

        let mut server = RpcServer::new();
        server.register(
            PROCESS_SERVICE,
            Arc::new(ProcessRpc {
                shared: Arc::clone(&self.shared),
            }),
        );
        tokio::spawn(server.serve(listener, self.shutdown.subscribe()));
        *listening = true;
        Ok(())
    }
}

impl Drop for ProcessBarrier {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
