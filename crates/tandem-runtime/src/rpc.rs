//! Framed RPC over TCP.
//!
//! The one transport both the process-initialization barrier and the
//! gossip-replicated resources speak: each message is a `u32` big-endian
//! length prefix followed by a bincode body. A server hosts named services;
//! a request names the service, the method, and carries an opaque payload
//! the service decodes itself. Responses carry either a payload or an
//! error string.
//!
//! Clients hold one connection with a single in-flight call at a time;
//! callers that want fan-out concurrency (the gossip broadcast does) issue
//! calls from separate tasks against separate clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use tandem_core::{RuntimeError, RuntimeResult};

/// Frames larger than this are rejected before allocation.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    service: String,
    method: String,
    payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    result: Result<Vec<u8>, String>,
}

/// Encode a wire value with bincode.
pub fn encode<T: Serialize>(value: &T) -> RuntimeResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| RuntimeError::network(format!("encode failed: {e}")))
}

/// Decode a wire value with bincode.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RuntimeResult<T> {
    bincode::deserialize(bytes).map_err(|e| RuntimeError::network(format!("decode failed: {e}")))
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> RuntimeResult<()> {
    let length = u32::try_from(body.len())
        .map_err(|_| RuntimeError::network("frame exceeds u32 length"))?;
    stream
        .write_all(&length.to_be_bytes())
        .await
        .map_err(|e| RuntimeError::network(format!("write length failed: {e}")))?;
    stream
        .write_all(body)
        .await
        .map_err(|e| RuntimeError::network(format!("write frame failed: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| RuntimeError::network(format!("flush failed: {e}")))?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> RuntimeResult<Vec<u8>> {
    let mut length_bytes = [0u8; 4];
    stream
        .read_exact(&mut length_bytes)
        .await
        .map_err(|e| RuntimeError::network(format!("read length failed: {e}")))?;
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(RuntimeError::network(format!(
            "frame too large: {length} > {MAX_FRAME_BYTES}"
        )));
    }
    let mut body = vec![0u8; length];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| RuntimeError::network(format!("read frame failed: {e}")))?;
    Ok(body)
}

/// A named RPC service: decodes its own method payloads.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle one call; the returned bytes become the response payload.
    async fn dispatch(&self, method: &str, payload: &[u8]) -> RuntimeResult<Vec<u8>>;
}

/// Hosts named services on a TCP listener.
pub struct RpcServer {
    services: HashMap<String, Arc<dyn RpcService>>,
}

impl RpcServer {
    /// An empty server; register services before spawning.
    pub fn new() -> Self {
        RpcServer {
            services: HashMap::new(),
        }
    }

    /// Register `service` under `name`.
    pub fn register(&mut self, name: &str, service: Arc<dyn RpcService>) {
        self.services.insert(name.to_string(), service);
    }

    /// Accept connections until `shutdown` flips. Each connection is served
    /// on its own task, one request at a time in arrival order.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let services = Arc::new(self.services);
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            break;
                        }
                    };
                    tracing::trace!(peer = %addr, "accepted connection");
                    let services = Arc::clone(&services);
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(serve_connection(stream, services, conn_shutdown));
                }
            }
        }
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|s| *s).await;
}

async fn serve_connection(
    mut stream: TcpStream,
    services: Arc<HashMap<String, Arc<dyn RpcService>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.wait_for(|s| *s) => return,
            frame = read_frame(&mut stream) => frame,
        };
        let request: Request = match frame.and_then(|f| decode(&f)) {
            Ok(request) => request,
            // EOF or a broken peer ends the connection quietly
            Err(err) => {
                tracing::trace!(error = %err, "connection ended");
                return;
            }
        };

        let result = match services.get(&request.service) {
            Some(service) => service
                .dispatch(&request.method, &request.payload)
                .await
                .map_err(|e| e.to_string()),
            None => Err(format!("unknown service {}", request.service)),
        };
        if let Err(err) = &result {
            tracing::debug!(
                service = %request.service,
                method = %request.method,
                error = %err,
                "dispatch failed"
            );
        }

        let response = Response { result };
        let Ok(body) = encode(&response) else { return };
        if let Err(err) = write_frame(&mut stream, &body).await {
            tracing::trace!(error = %err, "response write failed");
            return;
        }
    }
}

/// Client side of the framed RPC protocol.
#[derive(Debug)]
pub struct RpcClient {
    stream: Mutex<TcpStream>,
    peer: String,
}

impl RpcClient {
    /// Dial `addr`, failing after `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> RuntimeResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RuntimeError::network(format!("dial {addr}: timed out")))?
            .map_err(|e| RuntimeError::network(format!("dial {addr}: {e}")))?;
        Ok(RpcClient {
            stream: Mutex::new(stream),
            peer: addr.to_string(),
        })
    }

    /// Address this client is connected to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Invoke `service.method(args)`, decoding the response payload.
    pub async fn call<A, R>(&self, service: &str, method: &str, args: &A) -> RuntimeResult<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let request = Request {
            service: service.to_string(),
            method: method.to_string(),
            payload: encode(args)?,
        };
        let body = encode(&request)?;

        let mut stream = self.stream.lock().await;
        write_frame(&mut stream, &body).await?;
        let frame = read_frame(&mut stream).await?;
        drop(stream);

        let response: Response = decode(&frame)?;
        match response.result {
            Ok(payload) => decode(&payload),
            Err(message) => Err(RuntimeError::network(format!(
                "{service}.{method} on {}: {message}",
                self.peer
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RpcService for Echo {
        async fn dispatch(&self, method: &str, payload: &[u8]) -> RuntimeResult<Vec<u8>> {
            match method {
                "Echo" => {
                    let s: String = decode(payload)?;
                    encode(&s)
                }
                other => Err(RuntimeError::network(format!("unknown method {other}"))),
            }
        }
    }

    #[tokio::test]
    async fn round_trip_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut server = RpcServer::new();
        server.register("echo", Arc::new(Echo));
        tokio::spawn(server.serve(listener, shutdown_rx));

        let client = RpcClient::connect(&addr, Duration::from_secs(2)).await.unwrap();
        let reply: String = client
            .call("echo", "Echo", &"hello".to_string())
            .await
            .unwrap();
        assert_eq!(reply, "hello");

        // unknown service surfaces as a network error
        let err = client
            .call::<_, String>("nope", "Echo", &"x".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Network { .. }));

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn dial_failure_is_a_network_error() {
        // nothing listens on this port
        let err = RpcClient::connect("127.0.0.1:1", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Network { .. }));
    }
}
