//! # Channel Broker
//!
//! Builds direct worker-to-worker channels so piped traffic bypasses the
//! coordinator. A channel is a fresh duplex pair whose endpoints are
//! transferred to the participants inside `addWorker` control messages;
//! each side registers its endpoint as a worker handle under the shared
//! channel id, after which it is addressable like any other peer.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crewrpc::Envelope;
use crewrpc::Value;

use crate::duplex::DuplexTransport;
use crate::registry::Error;
use crate::registry::Registry;
use crate::registry::Result;
use crate::registry::WorkerSpec;
use crate::transport::Packet;
use crate::worker::WorkerHandle;

impl Registry {
    fn live_worker(&self, id: &str) -> Result<Arc<WorkerHandle>> {
        self.worker(id)
            .filter(|handle| handle.is_active())
            .ok_or_else(|| Error::ChannelUnavailable(id.to_string()))
    }

    /// Establishes a channel between worker `a` and worker `b`, or
    /// between `a` and this registry when `b` is `None`. Returns the
    /// channel id both sides now know the other end by.
    pub async fn establish_channel(
        self: &Arc<Self>,
        a: &str,
        b: Option<&str>,
    ) -> Result<String> {
        let handle_a = self.live_worker(a)?;
        let handle_b = match b {
            Some(b) => Some(self.live_worker(b)?),
            None => None,
        };

        let channel_id = format!(
            "channel-{}",
            self.next_channel.fetch_add(1, Ordering::Relaxed)
        );
        let (end_a, end_b) = DuplexTransport::pair();

        let announce = Envelope::post(
            "addWorker",
            Value::map([("_id", Value::Str(channel_id.clone()))]),
        );

        handle_a
            .send_packet(Packet::with_endpoint(announce.clone(), Box::new(end_a)))
            .await?;

        match handle_b {
            Some(handle_b) => {
                handle_b
                    .send_packet(Packet::with_endpoint(announce, Box::new(end_b)))
                    .await?;
            }
            // Coordinator keeps the far end itself, registered like any
            // other worker.
            None => {
                self.add_worker(
                    WorkerSpec::new(Box::new(end_b)).id(channel_id.clone()),
                );
            }
        }

        tracing::debug!(channel = %channel_id, from = %a, to = b.unwrap_or("coordinator"), "channel established");
        Ok(channel_id)
    }
}
