//! # Dispatch Engine
//!
//! The local dispatch table the orchestration layer assumes from its
//! node-engine collaborator: named handlers (`add`/`get`/`remove`), an
//! invocation path (`run`) and a generic trigger mechanism
//! (`subscribe`/`unsubscribe`/`publish`) keyed by route name.
//!
//! Every invocation publishes its settled result to the route's
//! subscribers, which is what the pub/sub protocol builds on: a producer
//! route "emits" simply by being run. Control routes and user routes
//! share this table; the layer above makes no distinction between them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use crewrpc::Value;
use dashmap::DashMap;

use crate::registry::Registry;
use crate::transport::Transport;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A named handler: takes the call arguments and the delivery context.
pub type HandlerFn = Arc<dyn Fn(Value, Context) -> BoxFuture<Value> + Send + Sync>;

/// A publish callback installed by `subscribe`.
pub type TriggerFn = Arc<dyn Fn(Value) -> BoxFuture<()> + Send + Sync>;

/// Where a call came from and what traveled with it.
///
/// Handlers that never look past their arguments can ignore this; the
/// control routes use it to reply to the originating transport and to
/// receive transferred channel endpoints.
#[derive(Clone)]
pub struct Context {
    pub registry: Weak<Registry>,
    /// Transport the triggering packet arrived on, if any.
    pub source: Option<Arc<dyn Transport>>,
    /// Sub-operation selector from the envelope, if any.
    pub method: Option<String>,
    /// Buffers moved alongside the envelope.
    pub buffers: Vec<Bytes>,
    endpoints: Arc<StdMutex<Vec<Box<dyn Transport>>>>,
}

impl Context {
    /// A context with no source packet, for locally-initiated calls.
    pub fn detached(registry: Weak<Registry>) -> Self {
        Context {
            registry,
            source: None,
            method: None,
            buffers: Vec::new(),
            endpoints: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub(crate) fn from_packet(
        registry: Weak<Registry>,
        source: Option<Arc<dyn Transport>>,
        method: Option<String>,
        buffers: Vec<Bytes>,
        endpoints: Vec<Box<dyn Transport>>,
    ) -> Self {
        Context {
            registry,
            source,
            method,
            buffers,
            endpoints: Arc::new(StdMutex::new(endpoints)),
        }
    }

    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.registry.upgrade()
    }

    /// Takes one transferred channel endpoint, if the packet carried any.
    pub fn take_endpoint(&self) -> Option<Box<dyn Transport>> {
        self.endpoints.lock().ok()?.pop()
    }
}

/// Collaborator-owned subscription parameters, carried through the
/// protocol but not interpreted by this local table.
#[derive(Debug, Clone, Default)]
pub struct SubscribeInput {
    pub args: Option<Value>,
    pub key: Option<String>,
    pub sub_input: bool,
}

struct Subscriber {
    token: u64,
    publish: TriggerFn,
    #[allow(dead_code)]
    input: SubscribeInput,
}

/// The dispatch table.
pub struct Engine {
    nodes: DashMap<String, HandlerFn>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_token: AtomicU64,
}

impl Engine {
    pub fn new() -> Arc<Self> {
        Arc::new(Engine {
            nodes: DashMap::new(),
            subscribers: DashMap::new(),
            next_token: AtomicU64::new(1),
        })
    }

    /// Installs a handler under a route name, replacing any previous one.
    pub fn add(&self, route: impl Into<String>, handler: HandlerFn) {
        self.nodes.insert(route.into(), handler);
    }

    /// Convenience for handlers that only need their arguments.
    pub fn add_fn<F, Fut>(&self, route: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.add(route, Arc::new(move |args, _ctx| Box::pin(f(args))));
    }

    pub fn get(&self, route: &str) -> Option<HandlerFn> {
        self.nodes.get(route).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, route: &str) -> bool {
        self.nodes.remove(route).is_some()
    }

    /// Invokes a route, publishes the settled result to its subscribers,
    /// and returns it. `None` when no handler is installed.
    pub async fn run(&self, route: &str, args: Value, ctx: Context) -> Option<Value> {
        let handler = self.get(route)?;
        let result = handler(args, ctx).await;
        self.publish(route, result.clone());
        Some(result)
    }

    /// Registers a publish callback for a route and returns its token.
    pub fn subscribe(&self, route: &str, publish: TriggerFn, input: SubscribeInput) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(route.to_string())
            .or_default()
            .push(Subscriber { token, publish, input });
        token
    }

    /// Removes one subscription. Returns whether it existed; callers
    /// treat a missing token as already-unsubscribed.
    pub fn unsubscribe(&self, route: &str, token: u64) -> bool {
        let Some(mut list) = self.subscribers.get_mut(route) else {
            return false;
        };
        let before = list.len();
        list.retain(|sub| sub.token != token);
        list.len() != before
    }

    /// Fans a value out to the route's subscribers.
    ///
    /// Each callback runs as its own task, so forwarded values are
    /// ordered by settlement, not by production.
    pub fn publish(&self, route: &str, value: Value) {
        let callbacks: Vec<TriggerFn> = match self.subscribers.get(route) {
            Some(list) => list.iter().map(|sub| sub.publish.clone()).collect(),
            None => return,
        };
        for publish in callbacks {
            let value = value.clone();
            tokio::spawn(publish(value));
        }
    }
}
