//! # Worker Registry
//!
//! The shared coordination point: a roster of worker handles, a
//! round-robin dispatcher over that roster, per-worker event triggers,
//! and the deny list for remotely-invokable routes.
//!
//! ## Philosophy
//!
//! - **Explicit ownership**: a registry is an `Arc<Registry>` the caller
//!   holds; there is no ambient global. Workers hold it weakly, so
//!   dropping the registry tears everything down.
//! - **Ids are monotonic**: worker and channel ids come from counters
//!   scoped to this registry. They are unique here, stable for logging,
//!   and never random.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crewrpc::CallbackId;
use crewrpc::Envelope;
use crewrpc::Value;
use dashmap::DashMap;

use crate::duplex::DuplexTransport;
use crate::engine::BoxFuture;
use crate::engine::Context;
use crate::engine::Engine;
use crate::transport;
use crate::transport::Packet;
use crate::transport::Transport;
use crate::worker;
use crate::worker::OnClose;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone)]
pub enum Error {
    /// No worker is registered under the given id.
    UnknownWorker(String),
    /// Channel establishment failed because an endpoint is gone.
    ChannelUnavailable(String),
    /// Round-robin dispatch with an empty roster.
    NoWorkers,
    Worker(worker::Error),
    Transport(transport::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownWorker(id) => write!(f, "Unknown worker: {}", id),
            Self::ChannelUnavailable(id) => {
                write!(f, "Channel endpoint unavailable: {}", id)
            }
            Self::NoWorkers => write!(f, "No workers registered"),
            Self::Worker(e) => write!(f, "Worker error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<worker::Error> for Error {
    fn from(e: worker::Error) -> Self {
        Self::Worker(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// How to register a worker whose transport already exists.
pub struct WorkerSpec {
    pub(crate) id: Option<String>,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) on_close: Option<OnClose>,
}

impl WorkerSpec {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        WorkerSpec { id: None, transport, on_close: None }
    }

    /// Registers under a caller-chosen id instead of a generated one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Hook fired once when the worker is detached, with its id.
    pub fn on_close(mut self, hook: impl FnOnce(&str) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

/// A callback fired when a worker emits a message, optionally filtered
/// to stream values for one route.
pub type EventCallback = Arc<dyn Fn(Envelope) -> BoxFuture<()> + Send + Sync>;

struct EventTrigger {
    id: u64,
    route: Option<String>,
    callback: EventCallback,
}

pub struct Registry {
    engine: Arc<Engine>,
    workers: DashMap<String, Arc<WorkerHandle>>,
    /// Insertion-ordered worker ids, for stable round-robin.
    roster: StdRwLock<Vec<String>>,
    rotation: AtomicUsize,
    next_worker: AtomicU64,
    pub(crate) next_channel: AtomicU64,
    /// Routes refused to remote callers.
    restricted: DashMap<String, ()>,
    /// Per-worker event triggers, keyed by worker id.
    triggers: DashMap<String, Vec<EventTrigger>>,
    next_trigger: AtomicU64,
    /// Last envelope observed from each worker, as a plain value.
    state: DashMap<String, Value>,
    /// Handle back to the registry that spawned this one, if any.
    parent: StdMutex<Option<Arc<WorkerHandle>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Self::with_engine(Engine::new())
    }

    /// Builds a registry around an existing dispatch table, so callers
    /// can pre-install their own routes.
    pub fn with_engine(engine: Arc<Engine>) -> Arc<Self> {
        let registry = Arc::new(Registry {
            engine,
            workers: DashMap::new(),
            roster: StdRwLock::new(Vec::new()),
            rotation: AtomicUsize::new(0),
            next_worker: AtomicU64::new(1),
            next_channel: AtomicU64::new(1),
            restricted: DashMap::new(),
            triggers: DashMap::new(),
            next_trigger: AtomicU64::new(1),
            state: DashMap::new(),
            parent: StdMutex::new(None),
        });
        crate::pubsub::install_control_routes(&registry);
        registry
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Registers a worker over an existing transport and starts its
    /// pump. An id collision returns the already-registered handle.
    pub fn add_worker(self: &Arc<Self>, spec: WorkerSpec) -> Arc<WorkerHandle> {
        let id = spec.id.unwrap_or_else(|| {
            format!("worker-{}", self.next_worker.fetch_add(1, Ordering::Relaxed))
        });
        if let Some(existing) = self.workers.get(&id) {
            // Id collision: keep the registered handle and close the
            // offered transport so its peer sees the rejection.
            tracing::warn!(worker = %id, "id already registered, rejecting offered transport");
            spec.transport.close();
            return existing.value().clone();
        }

        let handle = WorkerHandle::attach(id.clone(), spec.transport, self, spec.on_close);
        self.workers.insert(id.clone(), handle.clone());
        if let Ok(mut roster) = self.roster.write() {
            roster.push(id.clone());
        }
        tracing::debug!(worker = %id, "worker registered");
        handle
    }

    /// Spawns an in-process worker: a task hosting its own registry,
    /// wired to this one over a duplex pair. `setup` runs inside the
    /// worker to install its routes before any message is delivered.
    pub fn spawn_worker<F>(self: &Arc<Self>, id: Option<String>, setup: F) -> Arc<WorkerHandle>
    where
        F: FnOnce(&Arc<Registry>) + Send + 'static,
    {
        let (near, far) = DuplexTransport::pair();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let registry = Registry::new();
            registry.connect_parent(
                Box::new(far),
                Some(Box::new(move |_id: &str| {
                    let _ = stop_tx.send(());
                })),
            );
            setup(&registry);
            // Keep the worker-side registry alive until its parent
            // transport goes away.
            let _ = stop_rx.await;
        });

        let mut spec = WorkerSpec::new(Box::new(near));
        if let Some(id) = id {
            spec = spec.id(id);
        }
        self.add_worker(spec)
    }

    /// Wires this registry to the one that spawned it. The parent is a
    /// full worker handle but stays off the round-robin roster.
    pub fn connect_parent(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
        on_close: Option<OnClose>,
    ) -> Arc<WorkerHandle> {
        let handle = WorkerHandle::attach("parent".into(), transport, self, on_close);
        if let Ok(mut guard) = self.parent.lock() {
            *guard = Some(handle.clone());
        }
        handle
    }

    pub fn parent(&self) -> Option<Arc<WorkerHandle>> {
        self.parent.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn worker(&self, id: &str) -> Option<Arc<WorkerHandle>> {
        if let Some(handle) = self.workers.get(id) {
            return Some(handle.value().clone());
        }
        self.parent().filter(|handle| handle.id() == id)
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.roster
            .read()
            .map(|roster| roster.clone())
            .unwrap_or_default()
    }

    pub fn worker_count(&self) -> usize {
        self.roster.read().map(|roster| roster.len()).unwrap_or(0)
    }

    /// Resolves a named worker, the parent, or the next roster entry in
    /// round-robin order.
    fn select(&self, target: Option<&str>) -> Result<Arc<WorkerHandle>> {
        match target {
            Some(id) => self
                .worker(id)
                .ok_or_else(|| Error::UnknownWorker(id.to_string())),
            None => {
                let id = {
                    let roster = self
                        .roster
                        .read()
                        .map_err(|_| Error::NoWorkers)?;
                    if roster.is_empty() {
                        return Err(Error::NoWorkers);
                    }
                    let turn = self.rotation.fetch_add(1, Ordering::Relaxed);
                    roster[turn % roster.len()].clone()
                };
                self.worker(&id).ok_or(Error::UnknownWorker(id))
            }
        }
    }

    /// Invokes a route on a worker and awaits the correlated reply.
    /// With no target, workers take turns.
    pub async fn run(
        &self,
        route: &str,
        args: Value,
        target: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let handle = self.select(target)?;
        Ok(handle.run_with(route, args, None, deadline).await?)
    }

    /// One-way variant of `run`.
    pub async fn post(&self, route: &str, args: Value, target: Option<&str>) -> Result<()> {
        let handle = self.select(target)?;
        Ok(handle.post(route, args).await?)
    }

    /// Sends a raw envelope, targeted or round-robin.
    pub async fn transmit(&self, envelope: Envelope, target: Option<&str>) -> Result<()> {
        let handle = self.select(target)?;
        Ok(handle.send(envelope).await?)
    }

    /// Terminates one worker. Returns whether this call tore it down.
    pub async fn terminate(&self, target: &str) -> Result<bool> {
        let handle = self
            .worker(target)
            .ok_or_else(|| Error::UnknownWorker(target.to_string()))?;
        Ok(handle.terminate().await)
    }

    pub(crate) fn detach(&self, id: &str) {
        self.workers.remove(id);
        if let Ok(mut roster) = self.roster.write() {
            roster.retain(|entry| entry != id);
        }
        self.triggers.remove(id);
        self.state.remove(id);
        if id == "parent"
            && let Ok(mut guard) = self.parent.lock()
        {
            guard.take();
        }
    }

    // Deny list. Restricted routes are refused to remote callers only;
    // local dispatch through the engine is unaffected.

    pub fn restrict(&self, route: impl Into<String>) {
        self.restricted.insert(route.into(), ());
    }

    pub fn allow(&self, route: &str) -> bool {
        self.restricted.remove(route).is_some()
    }

    pub fn is_restricted(&self, route: &str) -> bool {
        self.restricted.contains_key(route)
    }

    /// Remote entry point to the dispatch table: enforces the deny list
    /// before running.
    pub(crate) async fn run_guarded(
        &self,
        route: &str,
        args: Value,
        ctx: Context,
    ) -> Option<Value> {
        if self.is_restricted(route) {
            tracing::trace!(route, "deny-listed route refused");
            return None;
        }
        self.engine.run(route, args, ctx).await
    }

    /// Dispatches one inbound packet: runs the route handler isolated in
    /// its own task and, when the envelope carries a callback id, sends
    /// the settled result back over the originating transport.
    pub(crate) async fn deliver(
        self: &Arc<Self>,
        packet: Packet,
        source: Option<Arc<dyn Transport>>,
    ) {
        let Packet { envelope, buffers, endpoints } = packet;
        let Some(route) = envelope.route.clone() else { return };
        let args = envelope.args.clone().unwrap_or(Value::Null);
        let callback = envelope.callback_id.clone();

        let ctx = Context::from_packet(
            Arc::downgrade(self),
            source.clone(),
            envelope.method.clone(),
            buffers,
            endpoints,
        );

        let registry = self.clone();
        // Each inbound route message runs as its own task, so a slow or
        // panicking handler never stalls the pump behind it.
        let task = tokio::spawn(async move {
            let result = registry.run_guarded(&route, args, ctx).await;
            let (Some(callback), Some(source)) = (callback, source) else {
                return;
            };
            let reply = Envelope::reply(result.unwrap_or(Value::Null), callback);
            if let Err(e) = source.send(Packet::from_envelope(reply)).await {
                tracing::trace!(error = %e, "reply delivery failed");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "route handler panicked");
            }
        });
    }

    // Event triggers: per-worker callbacks fired for inbound traffic,
    // optionally filtered to one route's stream values.

    pub fn subscribe_events(
        &self,
        worker_id: &str,
        route: Option<&str>,
        callback: EventCallback,
    ) -> u64 {
        let id = self.next_trigger.fetch_add(1, Ordering::Relaxed);
        self.triggers
            .entry(worker_id.to_string())
            .or_default()
            .push(EventTrigger {
                id,
                route: route.map(str::to_string),
                callback,
            });
        id
    }

    pub fn unsubscribe_events(&self, worker_id: &str, trigger_id: u64) -> bool {
        let Some(mut list) = self.triggers.get_mut(worker_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|trigger| trigger.id != trigger_id);
        list.len() != before
    }

    /// Drops every trigger filtered to `route`, so values still in
    /// flight under a stale token cannot reach a fresh subscriber.
    pub(crate) fn remove_route_triggers(&self, worker_id: &str, route: &str) {
        if let Some(mut list) = self.triggers.get_mut(worker_id) {
            list.retain(|trigger| trigger.route.as_deref() != Some(route));
        }
    }

    fn trigger_matches(trigger: &EventTrigger, envelope: &Envelope) -> bool {
        let Some(route) = trigger.route.as_deref() else {
            return true;
        };
        match &envelope.callback_id {
            // Stream values reuse the route name as their callback id.
            Some(CallbackId::Route(name)) => name == route,
            _ => envelope.route.as_deref() == Some(route),
        }
    }

    pub(crate) async fn fire_triggers(&self, worker_id: &str, envelope: &Envelope) {
        self.state
            .insert(worker_id.to_string(), envelope.to_value());

        let callbacks: Vec<EventCallback> = match self.triggers.get(worker_id) {
            Some(list) => list
                .iter()
                .filter(|trigger| Self::trigger_matches(trigger, envelope))
                .map(|trigger| trigger.callback.clone())
                .collect(),
            None => return,
        };
        for callback in callbacks {
            callback(envelope.clone()).await;
        }
    }

    /// Last envelope observed from a worker, lowered to a plain value.
    pub fn latest(&self, worker_id: &str) -> Option<Value> {
        self.state.get(worker_id).map(|entry| entry.value().clone())
    }
}
