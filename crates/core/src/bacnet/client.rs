use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::BacnetError;

use super::codec;
use super::{BacnetClient, PropertyRef};

const MAX_FRAME: usize = 1500;

/// BACnet/IP client over a bounded pool of UDP sockets.
///
/// Sockets are checked out exclusively per request, so a response is always
/// read by the task that sent the matching request. The pool bound keeps the
/// agent from exhausting ephemeral ports under meter fan-out.
pub struct UdpBacnetClient {
    bind_addr: SocketAddr,
    connect_timeout: Duration,
    idle: Arc<Mutex<Vec<UdpSocket>>>,
    permits: Arc<Semaphore>,
    invoke_id: AtomicU8,
}

impl UdpBacnetClient {
    pub fn new(bind_addr: SocketAddr, pool_size: usize, connect_timeout: Duration) -> Self {
        Self {
            bind_addr,
            connect_timeout,
            idle: Arc::new(Mutex::new(Vec::with_capacity(pool_size))),
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            invoke_id: AtomicU8::new(0),
        }
    }

    fn next_invoke_id(&self) -> u8 {
        self.invoke_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn checkout(&self) -> Result<PooledSocket, BacnetError> {
        let permit = tokio::time::timeout(
            self.connect_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| BacnetError::Timeout(self.connect_timeout))?
        .expect("socket pool semaphore closed");

        let existing = self.idle.lock().pop();
        let socket = match existing {
            Some(s) => s,
            None => UdpSocket::bind(self.bind_addr)
                .await
                .map_err(|e| BacnetError::Unreachable(format!("bind failed: {e}")))?,
        };
        Ok(PooledSocket {
            socket: Some(socket),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }

    /// Send one request frame and wait for a decodable response from the
    /// target. Datagrams from other peers and stale responses with a foreign
    /// invoke id are skipped until the deadline.
    async fn exchange<T>(
        &self,
        target: SocketAddr,
        frame: Vec<u8>,
        timeout: Duration,
        decode: impl Fn(&[u8]) -> Result<T, BacnetError>,
    ) -> Result<T, BacnetError> {
        let pooled = self.checkout().await?;
        let socket = pooled.socket();
        socket
            .send_to(&frame, target)
            .await
            .map_err(|e| BacnetError::Unreachable(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_FRAME];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(BacnetError::Timeout(timeout));
            }
            let (n, from) = tokio::time::timeout(deadline - now, socket.recv_from(&mut buf))
                .await
                .map_err(|_| BacnetError::Timeout(timeout))?
                .map_err(|e| BacnetError::Unreachable(e.to_string()))?;
            if from.ip() != target.ip() {
                continue;
            }
            match decode(&buf[..n]) {
                Err(e) if e == codec::invoke_mismatch_error() => continue,
                other => return other,
            }
        }
    }
}

#[async_trait]
impl BacnetClient for UdpBacnetClient {
    async fn read_property(
        &self,
        target: SocketAddr,
        prop: PropertyRef,
        timeout: Duration,
    ) -> Result<f64, BacnetError> {
        let invoke_id = self.next_invoke_id();
        let frame = codec::encode_read_property(invoke_id, prop);
        self.exchange(target, frame, timeout, |resp| {
            codec::decode_read_property_ack(resp, invoke_id)
        })
        .await
    }

    async fn read_property_multiple(
        &self,
        target: SocketAddr,
        props: &[PropertyRef],
        timeout: Duration,
    ) -> Result<Vec<Result<f64, BacnetError>>, BacnetError> {
        let invoke_id = self.next_invoke_id();
        let frame = codec::encode_read_property_multiple(invoke_id, props);
        let results = self
            .exchange(target, frame, timeout, |resp| {
                codec::decode_read_property_multiple_ack(resp, invoke_id)
            })
            .await?;
        if results.len() != props.len() {
            return Err(BacnetError::Protocol(format!(
                "expected {} results, device returned {}",
                props.len(),
                results.len()
            )));
        }
        Ok(results)
    }
}

/// A socket on loan from the pool; returned on drop.
struct PooledSocket {
    socket: Option<UdpSocket>,
    idle: Arc<Mutex<Vec<UdpSocket>>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSocket {
    fn socket(&self) -> &UdpSocket {
        self.socket.as_ref().expect("socket present until drop")
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.idle.lock().push(socket);
        }
    }
}
