//! # Subscription Protocol
//!
//! The control routes every registry installs, and the coordinator-side
//! pipe helpers built on them. Control routes are ordinary dispatch-table
//! entries; nothing below this module distinguishes them from user
//! routes.
//!
//! The protocol in one paragraph: a consumer sends `subscribeWorker` to a
//! producer, which subscribes locally and forwards each settled value of
//! the named route back over the agreed handle. Non-blocking forwarding
//! fires stream-value replies tagged with the route name. Blocking
//! forwarding holds a single delivery credit: the producer calls
//! `triggerSubscription` on the consumer and must see that call settle
//! before forwarding again; values produced while the credit is out are
//! dropped, not queued.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crewrpc::CallbackId;
use crewrpc::Envelope;
use crewrpc::Value;

use crate::engine::Context;
use crate::engine::SubscribeInput;
use crate::engine::TriggerFn;
use crate::registry::Error;
use crate::registry::EventCallback;
use crate::registry::Registry;
use crate::registry::Result;
use crate::registry::WorkerSpec;
use crate::transport::Packet;
use crate::worker::SubToken;

/// What to do with each value a worker subscription delivers.
pub enum SubscribeTarget {
    /// Only record it as the worker's latest observed state.
    State,
    /// Run a local route with the value as its argument.
    Node(String),
    /// Invoke a caller-supplied callback.
    Callback(TriggerFn),
}

fn item(args: &Value, index: usize) -> Value {
    args.as_list()
        .and_then(|list| list.get(index))
        .cloned()
        .unwrap_or(Value::Null)
}

fn item_str(args: &Value, index: usize) -> Option<String> {
    args.as_list()
        .and_then(|list| list.get(index))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn item_u64(args: &Value, index: usize) -> Option<u64> {
    args.as_list()
        .and_then(|list| list.get(index))
        .and_then(Value::as_u64)
}

fn item_bool(args: &Value, index: usize) -> bool {
    args.as_list()
        .and_then(|list| list.get(index))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn callback_id(value: Value) -> Option<CallbackId> {
    match value {
        Value::Int(n) if n >= 0 => Some(CallbackId::Seq(n as u64)),
        Value::Str(s) => Some(CallbackId::Route(s)),
        _ => None,
    }
}

pub(crate) fn install_control_routes(registry: &Arc<Registry>) {
    let engine = registry.engine();
    engine.add("runRequest", Arc::new(|args, ctx| Box::pin(run_request(args, ctx))));
    engine.add("addWorker", Arc::new(|args, ctx| Box::pin(add_worker(args, ctx))));
    engine.add("subscribe", Arc::new(|args, ctx| Box::pin(subscribe_local(args, ctx))));
    engine.add(
        "subscribeWorker",
        Arc::new(|args, ctx| Box::pin(subscribe_worker(args, ctx))),
    );
    engine.add(
        "subscribeToWorker",
        Arc::new(|args, ctx| Box::pin(subscribe_to_worker(args, ctx))),
    );
    engine.add("unsubscribe", Arc::new(|args, ctx| Box::pin(unsubscribe(args, ctx))));
    engine.add(
        "triggerSubscription",
        Arc::new(|args, ctx| Box::pin(trigger_subscription(args, ctx))),
    );
    engine.add(
        "unpipeWorkers",
        Arc::new(|args, ctx| Box::pin(unpipe_workers(args, ctx))),
    );
}

/// `[message, replyTo, callbackId]`: unwraps an embedded message, runs
/// it, and sends the correlated reply back. Reply routing prefers the
/// named worker, then the originating transport, then the parent.
async fn run_request(args: Value, ctx: Context) -> Value {
    let Some(registry) = ctx.registry() else {
        return Value::Null;
    };
    let message = Envelope::from_value(&item(&args, 0)).unwrap_or_default();
    let reply_to = item_str(&args, 1);
    let callback = callback_id(item(&args, 2));

    let result = match &message.route {
        Some(route) => {
            let mut inner = ctx.clone();
            inner.method = message.method.clone();
            let inner_args = message.args.clone().unwrap_or(Value::Null);
            registry
                .run_guarded(route, inner_args, inner)
                .await
                .unwrap_or(Value::Null)
        }
        None => Value::Null,
    };

    // Always reply, even with Null, so the caller's correlation settles.
    // Routing falls back: named worker, then the originating transport,
    // then the parent.
    if let Some(callback) = callback {
        let reply = Envelope::reply(result.clone(), callback);
        let mut delivered = false;
        if let Some(handle) = reply_to.as_deref().and_then(|id| registry.worker(id)) {
            delivered = handle.send(reply.clone()).await.is_ok();
        }
        if !delivered && let Some(source) = &ctx.source {
            delivered = source.send(Packet::from_envelope(reply.clone())).await.is_ok();
        }
        if !delivered && let Some(parent) = registry.parent() {
            if let Err(e) = parent.send(reply).await {
                tracing::trace!(error = %e, "reply delivery failed");
            }
        }
    }
    result
}

/// `{_id}` plus a transferred endpoint: registers the far side of a
/// brokered channel as a peer worker.
async fn add_worker(args: Value, ctx: Context) -> Value {
    let Some(registry) = ctx.registry() else {
        return Value::Null;
    };
    let Some(endpoint) = ctx.take_endpoint() else {
        tracing::warn!("addWorker without a transferred endpoint");
        return Value::Null;
    };
    let mut spec = WorkerSpec::new(endpoint);
    if let Some(id) = args.get("_id").and_then(Value::as_str) {
        spec = spec.id(id);
    }
    let handle = registry.add_worker(spec);
    Value::Str(handle.id().to_string())
}

/// `[route, callbackNode?]`: a purely local subscription on this side's
/// dispatch table.
async fn subscribe_local(args: Value, ctx: Context) -> Value {
    let Some(registry) = ctx.registry() else {
        return Value::Null;
    };
    let Some(route) = item_str(&args, 0) else {
        return Value::Null;
    };
    let engine = registry.engine().clone();
    let trigger: TriggerFn = match item_str(&args, 1) {
        Some(node) => {
            let weak = ctx.registry.clone();
            let engine = engine.clone();
            Arc::new(move |value| {
                let weak = weak.clone();
                let engine = engine.clone();
                let node = node.clone();
                Box::pin(async move {
                    engine.run(&node, value, Context::detached(weak)).await;
                })
            })
        }
        None => Arc::new(|_value| Box::pin(async {})),
    };
    let token = engine.subscribe(&route, trigger, SubscribeInput::default());
    Value::Int(token as i64)
}

/// `[route, dest, args, key, subInput, blocking]`: producer side of the
/// protocol. Subscribes locally and forwards each settled value to the
/// destination handle; returns the subscription token.
async fn subscribe_worker(args: Value, ctx: Context) -> Value {
    let Some(registry) = ctx.registry() else {
        return Value::Null;
    };
    let Some(route) = item_str(&args, 0) else {
        return Value::Null;
    };
    if registry.is_restricted(&route) {
        tracing::trace!(route = %route, "deny-listed route refused subscription");
        return Value::Null;
    }
    let dest = item_str(&args, 1).unwrap_or_else(|| "parent".to_string());
    let input = SubscribeInput {
        args: match item(&args, 2) {
            Value::Null => None,
            other => Some(other),
        },
        key: item_str(&args, 3),
        sub_input: item_bool(&args, 4),
    };
    let blocking = item_bool(&args, 5);

    let weak = ctx.registry.clone();
    let trigger: TriggerFn = if blocking {
        // One delivery credit: while a forwarded value is unsettled at
        // the consumer, further values are dropped.
        let blocked = Arc::new(AtomicBool::new(false));
        let route = route.clone();
        Arc::new(move |value| {
            let weak = weak.clone();
            let blocked = blocked.clone();
            let route = route.clone();
            let dest = dest.clone();
            Box::pin(async move {
                if blocked.swap(true, Ordering::SeqCst) {
                    tracing::trace!(route = %route, "consumer busy, value dropped");
                    return;
                }
                let handle = weak
                    .upgrade()
                    .and_then(|reg| reg.worker(&dest).or_else(|| reg.parent()));
                let Some(handle) = handle else {
                    blocked.store(false, Ordering::SeqCst);
                    return;
                };
                let call = Value::List(vec![
                    Value::Str(route.clone()),
                    Value::Str(dest),
                    value,
                ]);
                if let Err(e) = handle.run("triggerSubscription", call).await {
                    tracing::trace!(route = %route, error = %e, "blocking delivery failed");
                }
                // Release the credit on error too; a stuck credit would
                // silence the stream forever.
                blocked.store(false, Ordering::SeqCst);
            })
        })
    } else {
        let route = route.clone();
        Arc::new(move |value| {
            let weak = weak.clone();
            let route = route.clone();
            let dest = dest.clone();
            Box::pin(async move {
                let handle = weak
                    .upgrade()
                    .and_then(|reg| reg.worker(&dest).or_else(|| reg.parent()));
                let Some(handle) = handle else { return };
                let reply = Envelope::reply(value, CallbackId::Route(route.clone()));
                if let Err(e) = handle.send(reply).await {
                    tracing::trace!(route = %route, error = %e, "stream delivery failed");
                }
            })
        })
    };

    let token = registry.engine().subscribe(&route, trigger, input);
    Value::Int(token as i64)
}

/// `[route, worker, callbackNode, args, key, subInput, blocking]`:
/// listener side of a pipe. Subscribes this registry to a route on one
/// of its own peers (usually a channel handle) and returns the remote
/// token.
async fn subscribe_to_worker(args: Value, ctx: Context) -> Value {
    let Some(registry) = ctx.registry() else {
        return Value::Null;
    };
    let (Some(route), Some(worker_id)) = (item_str(&args, 0), item_str(&args, 1)) else {
        return Value::Null;
    };
    let target = match item_str(&args, 2) {
        Some(node) => SubscribeTarget::Node(node),
        None => SubscribeTarget::State,
    };
    let input = SubscribeInput {
        args: match item(&args, 3) {
            Value::Null => None,
            other => Some(other),
        },
        key: item_str(&args, 4),
        sub_input: item_bool(&args, 5),
    };
    let blocking = item_bool(&args, 6);

    registry
        .subscribe_to_worker(&route, &worker_id, target, input, blocking)
        .await
        .unwrap_or(Value::Null)
}

/// `[route, token]`: drops one local subscription. Reports success even
/// for a missing token; absent is the desired end state.
async fn unsubscribe(args: Value, ctx: Context) -> Value {
    let Some(registry) = ctx.registry() else {
        return Value::Bool(true);
    };
    if let (Some(route), Some(token)) = (item_str(&args, 0), item_u64(&args, 1)) {
        registry.engine().unsubscribe(&route, token);
    }
    Value::Bool(true)
}

/// `[route, worker, value]`: consumer side of a blocking delivery. The
/// reply to this call is the producer's signal to forward again, so the
/// consumer's callbacks run to completion before this handler returns.
async fn trigger_subscription(args: Value, ctx: Context) -> Value {
    let Some(registry) = ctx.registry() else {
        return Value::Bool(false);
    };
    let (Some(route), Some(worker_id)) = (item_str(&args, 0), item_str(&args, 1)) else {
        return Value::Bool(false);
    };
    let value = item(&args, 2);
    let envelope = Envelope::reply(value, CallbackId::Route(route));
    registry.fire_triggers(&worker_id, &envelope).await;
    Value::Bool(true)
}

/// `[route, channel, token]`: tears one pipe leg down. Resolved against
/// the named channel handle when one exists, else the local table.
async fn unpipe_workers(args: Value, ctx: Context) -> Value {
    let Some(registry) = ctx.registry() else {
        return Value::Bool(true);
    };
    let Some(route) = item_str(&args, 0) else {
        return Value::Bool(true);
    };
    let channel = item_str(&args, 1);
    let token = item_u64(&args, 2);

    if let Some(handle) = channel.as_deref().and_then(|id| registry.worker(id)) {
        if let Some(token) = token {
            match handle.unsubscribe(&route, token).await {
                Ok(ok) => return Value::Bool(ok),
                Err(e) => {
                    tracing::trace!(route = %route, error = %e, "pipe teardown failed");
                    return Value::Bool(false);
                }
            }
        }
        return Value::Bool(true);
    }
    if let Some(token) = token {
        registry.engine().unsubscribe(&route, token);
    }
    Value::Bool(true)
}

impl Registry {
    /// Subscribes this registry to a route on one of its workers (or its
    /// parent). Returns the remote token as a value so callers piping on
    /// behalf of others can forward it untouched.
    pub async fn subscribe_to_worker(
        self: &Arc<Self>,
        route: &str,
        worker_id: &str,
        target: SubscribeTarget,
        input: SubscribeInput,
        blocking: bool,
    ) -> Result<Value> {
        let handle = self
            .worker(worker_id)
            .or_else(|| self.parent())
            .ok_or_else(|| Error::UnknownWorker(worker_id.to_string()))?;

        let callback: EventCallback = match target {
            // `fire_triggers` already records latest state.
            SubscribeTarget::State => Arc::new(|_envelope| Box::pin(async {})),
            SubscribeTarget::Node(node) => {
                let weak = Arc::downgrade(self);
                Arc::new(move |envelope: Envelope| {
                    let weak = weak.clone();
                    let node = node.clone();
                    Box::pin(async move {
                        let Some(registry) = weak.upgrade() else { return };
                        let value = envelope.args.unwrap_or(Value::Null);
                        let ctx = Context::detached(Arc::downgrade(&registry));
                        registry.engine().run(&node, value, ctx).await;
                    })
                })
            }
            SubscribeTarget::Callback(f) => Arc::new(move |envelope: Envelope| {
                f(envelope.args.unwrap_or(Value::Null))
            }),
        };
        self.subscribe_events(handle.id(), Some(route), callback);

        let call = Value::List(vec![
            Value::Str(route.to_string()),
            Value::Str(handle.id().to_string()),
            input.args.clone().unwrap_or(Value::Null),
            input.key.clone().into(),
            Value::Bool(input.sub_input),
            Value::Bool(blocking),
        ]);
        Ok(handle.run("subscribeWorker", call).await?)
    }

    /// Pipes a route on one worker into another: establishes a direct
    /// channel, subscribes the listener to the source route over it, and
    /// records the pipe in the listener's ledger. Returns the channel id.
    pub async fn pipe_workers(
        self: &Arc<Self>,
        source_id: &str,
        source_route: &str,
        listener_id: &str,
        listener_route: Option<&str>,
        blocking: bool,
    ) -> Result<String> {
        let channel_id = self.establish_channel(source_id, Some(listener_id)).await?;
        let listener = self
            .worker(listener_id)
            .ok_or_else(|| Error::UnknownWorker(listener_id.to_string()))?;

        listener.note_subscription(source_route, &channel_id, listener_route, blocking);
        let call = Value::List(vec![
            Value::Str(source_route.to_string()),
            Value::Str(channel_id.clone()),
            listener_route.into(),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Bool(blocking),
        ]);
        let token = listener.run("subscribeToWorker", call).await?;
        if let Some(token) = token.as_u64() {
            listener.confirm_subscription(source_route, &channel_id, token);
        }
        tracing::debug!(
            channel = %channel_id,
            source = %source_id,
            listener = %listener_id,
            route = %source_route,
            "pipe established"
        );
        Ok(channel_id)
    }

    /// Tears one pipe down by asking the listener to unsubscribe over
    /// its channel handle. The ledger entry is removed, not retained.
    pub async fn unpipe_workers(
        self: &Arc<Self>,
        listener_id: &str,
        source_route: &str,
        channel_id: &str,
    ) -> Result<bool> {
        let listener = self
            .worker(listener_id)
            .ok_or_else(|| Error::UnknownWorker(listener_id.to_string()))?;

        let token = match listener.subscription(source_route, channel_id) {
            Some(sub) => match sub.token {
                SubToken::Confirmed(token) => Some(token),
                _ => None,
            },
            None => None,
        };
        let call = Value::List(vec![
            Value::Str(source_route.to_string()),
            Value::Str(channel_id.to_string()),
            token.map(|t| Value::Int(t as i64)).unwrap_or(Value::Null),
        ]);
        let confirmed = listener.run("unpipeWorkers", call).await?;
        listener.forget_subscription(source_route, channel_id);
        Ok(confirmed.as_bool().unwrap_or(true))
    }
}
