//! In-process duplex transport over tokio mpsc channels.
//!
//! The default backing for spawned workers and broker channels: packets
//! sent on one endpoint appear on the peer's `recv` and vice versa, in
//! FIFO order. Ownership of buffers and endpoints moves with the packet,
//! so nothing is copied.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Packet;
use crate::transport::Transport;

pub struct DuplexTransport {
    tx: StdMutex<Option<mpsc::UnboundedSender<Packet>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Packet>>>,
}

impl DuplexTransport {
    /// Creates a pair of endpoints connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: StdMutex::new(Some(tx_a)),
            rx: Arc::new(Mutex::new(rx_b)),
        };

        let b = Self {
            tx: StdMutex::new(Some(tx_b)),
            rx: Arc::new(Mutex::new(rx_a)),
        };

        (a, b)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Packet>> {
        self.tx.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, packet: Packet) -> transport::Result<()> {
        let Some(tx) = self.sender() else {
            return Err(transport::Error::Closed);
        };
        tx.send(packet)
            .map_err(|_| transport::Error::ConnectionLost("peer endpoint dropped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Packet>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    fn is_open(&self) -> bool {
        self.tx
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}
