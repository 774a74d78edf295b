//! # Worker Handle
//!
//! The coordinator-side proxy for one isolated execution unit. Each
//! handle exclusively owns its transport and spawns a pump task that
//! demultiplexes inbound packets: replies are correlated back to pending
//! callers by sequence number, everything else is handed to the registry
//! for dispatch and event fan-out.
//!
//! Lifecycle is terminal: once a handle is terminated it never accepts
//! new calls, and termination runs in a fixed order (unwind the
//! subscription ledger, reject pending correlations, release the
//! transport).

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crewrpc::CallbackId;
use crewrpc::Envelope;
use crewrpc::Value;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::engine::SubscribeInput;
use crate::pubsub::SubscribeTarget;
use crate::registry;
use crate::registry::Registry;
use crate::transport;
use crate::transport::Packet;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum Error {
    Transport(transport::Error),
    /// The worker terminated before the reply arrived.
    WorkerUnavailable,
    /// The caller-supplied deadline expired first.
    DeadlineExceeded,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::WorkerUnavailable => write!(f, "Worker terminated before replying"),
            Self::DeadlineExceeded => write!(f, "Request deadline exceeded"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Remote confirmation state of one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubToken {
    /// Recorded but not yet confirmed by the remote side.
    Pending,
    /// Confirmed; the token is what `unsubscribe` needs.
    Confirmed(u64),
    /// Deliberately stopped but retained for later `start`.
    Stopped,
}

/// One entry in the handle's subscription ledger.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub route: String,
    pub channel_id: String,
    pub callback: Option<String>,
    pub blocking: bool,
    pub token: SubToken,
}

pub(crate) type OnClose = Box<dyn FnOnce(&str) + Send>;

pub struct WorkerHandle {
    id: String,
    transport: Arc<dyn Transport>,
    /// Correlation table: in-flight sequence number -> waiting caller.
    pending: DashMap<u64, oneshot::Sender<Value>>,
    next_seq: AtomicU64,
    /// Subscription ledger, keyed by (route, channel id).
    subs: DashMap<(String, String), Subscription>,
    terminated: AtomicBool,
    pump: StdMutex<Option<JoinHandle<()>>>,
    registry: Weak<Registry>,
    on_close: StdMutex<Option<OnClose>>,
}

impl WorkerHandle {
    pub(crate) fn attach(
        id: String,
        transport: Box<dyn Transport>,
        registry: &Arc<Registry>,
        on_close: Option<OnClose>,
    ) -> Arc<Self> {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let handle = Arc::new(WorkerHandle {
            id,
            transport: transport.clone(),
            pending: DashMap::new(),
            next_seq: AtomicU64::new(1),
            subs: DashMap::new(),
            terminated: AtomicBool::new(false),
            pump: StdMutex::new(None),
            registry: Arc::downgrade(registry),
            on_close: StdMutex::new(on_close),
        });

        let pump = tokio::spawn(Self::pump(Arc::downgrade(&handle), transport));
        if let Ok(mut guard) = handle.pump.lock() {
            *guard = Some(pump);
        }
        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst) && self.transport.is_open()
    }

    /// Reads the pump task: demultiplex until the transport goes away.
    async fn pump(weak: Weak<WorkerHandle>, transport: Arc<dyn Transport>) {
        loop {
            let packet = match transport.recv().await {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    if let Some(handle) = weak.upgrade() {
                        tracing::warn!(worker = %handle.id, error = %e, "transport receive failed");
                    }
                    break;
                }
            };
            let Some(handle) = weak.upgrade() else { return };
            handle.inbound(packet).await;
        }
        // Transport gone underneath us: run the local half of teardown.
        if let Some(handle) = weak.upgrade() {
            handle.shutdown(false).await;
        }
    }

    async fn inbound(&self, packet: Packet) {
        let Packet { envelope, buffers, endpoints } = packet;

        // A reply: resolve exactly one waiter, or drop it as late.
        if envelope.route.is_none() {
            if let Some(CallbackId::Seq(seq)) = &envelope.callback_id {
                match self.pending.remove(seq) {
                    Some((_, tx)) => {
                        let _ = tx.send(envelope.args.unwrap_or(Value::Null));
                    }
                    None => {
                        tracing::trace!(worker = %self.id, seq, "late reply dropped");
                    }
                }
                return;
            }
        }

        let Some(registry) = self.registry.upgrade() else { return };
        if envelope.route.is_some() {
            let packet = Packet {
                envelope: envelope.clone(),
                buffers,
                endpoints,
            };
            registry
                .deliver(packet, Some(self.transport.clone()))
                .await;
        }
        registry.fire_triggers(&self.id, &envelope).await;
    }

    fn ensure_active(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::WorkerUnavailable);
        }
        Ok(())
    }

    /// Fire-and-forget delivery of a raw envelope.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.ensure_active()?;
        self.transport.send(Packet::from_envelope(envelope)).await?;
        Ok(())
    }

    /// Like `send`, with an explicit transfer list (detection skipped).
    pub async fn send_with_buffers(
        &self,
        envelope: Envelope,
        buffers: Vec<bytes::Bytes>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.transport
            .send(Packet::with_buffers(envelope, buffers))
            .await?;
        Ok(())
    }

    pub(crate) async fn send_packet(&self, packet: Packet) -> Result<()> {
        self.ensure_active()?;
        self.transport.send(packet).await?;
        Ok(())
    }

    /// One-way invocation of a route on the worker.
    pub async fn post(&self, route: &str, args: Value) -> Result<()> {
        self.send(Envelope::post(route, args)).await
    }

    pub async fn post_with(
        &self,
        route: &str,
        args: Value,
        method: Option<&str>,
    ) -> Result<()> {
        self.send(Envelope::operation(route, args, method.map(str::to_string)))
            .await
    }

    /// Invokes a route on the worker and awaits its correlated reply.
    pub async fn run(&self, route: &str, args: Value) -> Result<Value> {
        self.run_with(route, args, None, None).await
    }

    /// `run` with a sub-operation selector and an optional deadline.
    pub async fn run_with(
        &self,
        route: &str,
        args: Value,
        method: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let message = Envelope::operation(route, args, method.map(str::to_string));
        self.request_with(message, deadline).await
    }

    /// Forwards an already-built message and awaits the correlated reply.
    pub async fn request(&self, message: Envelope) -> Result<Value> {
        self.request_with(message, None).await
    }

    pub async fn request_with(
        &self,
        message: Envelope,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        self.ensure_active()?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        let call = Value::List(vec![
            message.into(),
            Value::Str(self.id.clone()),
            Value::Int(seq as i64),
        ]);
        let envelope = Envelope::post("runRequest", call);
        if let Err(e) = self.transport.send(Packet::from_envelope(envelope)).await {
            self.pending.remove(&seq);
            return Err(e.into());
        }

        match deadline {
            None => rx.await.map_err(|_| Error::WorkerUnavailable),
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(Error::WorkerUnavailable),
                Err(_) => {
                    self.pending.remove(&seq);
                    Err(Error::DeadlineExceeded)
                }
            },
        }
    }

    /// Asks the worker to start publishing `route` results back over
    /// this handle's transport. Resolves to the remote token.
    pub async fn subscribe(
        &self,
        route: &str,
        target: SubscribeTarget,
        input: SubscribeInput,
        blocking: bool,
    ) -> registry::Result<Value> {
        let registry = self
            .registry
            .upgrade()
            .ok_or(registry::Error::Worker(Error::WorkerUnavailable))?;
        registry
            .subscribe_to_worker(route, &self.id, target, input, blocking)
            .await
    }

    /// Asks the worker to stop publishing. Idempotent: a missing token
    /// is already the desired end state and reports success.
    pub async fn unsubscribe(&self, route: &str, token: u64) -> Result<bool> {
        let call = Value::List(vec![Value::Str(route.into()), Value::Int(token as i64)]);
        let confirmed = self.run("unsubscribe", call).await?;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_route_triggers(&self.id, route);
        }
        Ok(confirmed.as_bool().unwrap_or(true))
    }

    // Ledger bookkeeping, used by the pipe helpers and `start`/`stop`.

    pub(crate) fn note_subscription(
        &self,
        route: &str,
        channel_id: &str,
        callback: Option<&str>,
        blocking: bool,
    ) {
        let key = (route.to_string(), channel_id.to_string());
        self.subs.entry(key).or_insert_with(|| Subscription {
            route: route.to_string(),
            channel_id: channel_id.to_string(),
            callback: callback.map(str::to_string),
            blocking,
            token: SubToken::Pending,
        });
    }

    pub(crate) fn confirm_subscription(&self, route: &str, channel_id: &str, token: u64) {
        let key = (route.to_string(), channel_id.to_string());
        if let Some(mut entry) = self.subs.get_mut(&key) {
            entry.token = SubToken::Confirmed(token);
        }
    }

    pub(crate) fn forget_subscription(&self, route: &str, channel_id: &str) {
        let key = (route.to_string(), channel_id.to_string());
        self.subs.remove(&key);
    }

    fn mark_stopped(&self, route: &str, channel_id: &str) {
        let key = (route.to_string(), channel_id.to_string());
        if let Some(mut entry) = self.subs.get_mut(&key) {
            entry.token = SubToken::Stopped;
        }
    }

    pub fn subscription(&self, route: &str, channel_id: &str) -> Option<Subscription> {
        let key = (route.to_string(), channel_id.to_string());
        self.subs.get(&key).map(|entry| entry.value().clone())
    }

    pub fn ledger_len(&self) -> usize {
        self.subs.len()
    }

    /// Batch (re)activation of ledger entries. With no target, every
    /// entry not currently confirmed is resubscribed; used for bulk
    /// reconnection after a transport is replaced.
    pub async fn start(
        &self,
        route: Option<&str>,
        channel_id: Option<&str>,
        callback: Option<&str>,
        blocking: bool,
    ) -> Result<bool> {
        match (route, channel_id) {
            (Some(route), Some(channel_id)) => {
                self.note_subscription(route, channel_id, callback, blocking);
                self.start_entry(route, channel_id, callback, blocking).await?;
            }
            _ => {
                let entries: Vec<Subscription> = self
                    .subs
                    .iter()
                    .filter(|entry| !matches!(entry.token, SubToken::Confirmed(_)))
                    .map(|entry| entry.value().clone())
                    .collect();
                for sub in entries {
                    self.start_entry(
                        &sub.route,
                        &sub.channel_id,
                        sub.callback.as_deref(),
                        sub.blocking,
                    )
                    .await?;
                }
            }
        }
        Ok(true)
    }

    async fn start_entry(
        &self,
        route: &str,
        channel_id: &str,
        callback: Option<&str>,
        blocking: bool,
    ) -> Result<()> {
        let call = Value::List(vec![
            Value::Str(route.into()),
            Value::Str(channel_id.into()),
            callback.into(),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Bool(blocking),
        ]);
        let token = self.run("subscribeToWorker", call).await?;
        if let Some(token) = token.as_u64() {
            self.confirm_subscription(route, channel_id, token);
        }
        Ok(())
    }

    /// Batch deactivation of ledger entries; entries stay in the ledger
    /// so a later `start` can revive them.
    pub async fn stop(&self, route: Option<&str>, channel_id: Option<&str>) -> Result<bool> {
        match (route, channel_id) {
            (Some(route), Some(channel_id)) => {
                if let Some(sub) = self.subscription(route, channel_id)
                    && let SubToken::Confirmed(token) = sub.token
                {
                    let call = Value::List(vec![
                        Value::Str(route.into()),
                        Value::Str(channel_id.into()),
                        Value::Int(token as i64),
                    ]);
                    self.run("unpipeWorkers", call).await?;
                }
                self.mark_stopped(route, channel_id);
            }
            _ => {
                let entries: Vec<Subscription> = self
                    .subs
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                for sub in entries {
                    if let SubToken::Confirmed(token) = sub.token {
                        let call = Value::List(vec![
                            Value::Str(sub.route.clone()),
                            Value::Str(sub.channel_id.clone()),
                            Value::Int(token as i64),
                        ]);
                        self.run("unpipeWorkers", call).await?;
                    }
                    self.mark_stopped(&sub.route, &sub.channel_id);
                }
            }
        }
        Ok(true)
    }

    /// Tears the worker down: unwinds the ledger, rejects pending
    /// correlations with `WorkerUnavailable`, releases the transport.
    /// Idempotent; returns whether this call did the work.
    pub async fn terminate(&self) -> bool {
        self.shutdown(true).await
    }

    async fn shutdown(&self, unwind: bool) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Fixed order: subscriptions first, transport last, so a half-
        // terminated handle never accepts new subscribe calls.
        let entries: Vec<Subscription> = self
            .subs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.subs.clear();
        if unwind {
            for sub in entries {
                let SubToken::Confirmed(token) = sub.token else { continue };
                let call = Value::List(vec![
                    Value::Str(sub.route),
                    Value::Str(sub.channel_id),
                    Value::Int(token as i64),
                ]);
                let envelope = Envelope::post("unpipeWorkers", call);
                if let Err(e) = self.transport.send(Packet::from_envelope(envelope)).await {
                    tracing::trace!(worker = %self.id, error = %e, "teardown notice failed");
                }
            }
        }

        // Dropping the senders rejects every waiter.
        let waiting: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for seq in waiting {
            self.pending.remove(&seq);
        }

        self.transport.close();
        if unwind
            && let Ok(mut guard) = self.pump.lock()
            && let Some(pump) = guard.take()
        {
            pump.abort();
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.id);
        }
        let hook = self.on_close.lock().ok().and_then(|mut guard| guard.take());
        if let Some(hook) = hook {
            hook(&self.id);
        }
        tracing::debug!(worker = %self.id, "worker terminated");
        true
    }
}
