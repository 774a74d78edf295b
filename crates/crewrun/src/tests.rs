use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crewrpc::Envelope;
use crewrpc::Value;

use crate::duplex::DuplexTransport;
use crate::engine::Context;
use crate::engine::Engine;
use crate::engine::SubscribeInput;
use crate::engine::TriggerFn;
use crate::pubsub::SubscribeTarget;
use crate::registry;
use crate::registry::Registry;
use crate::registry::WorkerSpec;
use crate::transport;
use crate::transport::Packet;
use crate::transport::Transport;
use crate::worker;
use crate::worker::SubToken;
use crate::worker::WorkerHandle;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spawn_echo(registry: &Arc<Registry>, id: &str) -> Arc<WorkerHandle> {
    registry.spawn_worker(Some(id.to_string()), |reg| {
        reg.engine().add_fn("echo", |args| async move { args });
        reg.engine().add_fn("tick", |args| async move { args });
    })
}

fn collect_into(seen: Arc<StdMutex<Vec<Value>>>) -> TriggerFn {
    Arc::new(move |value| {
        let seen = seen.clone();
        Box::pin(async move {
            if let Ok(mut guard) = seen.lock() {
                guard.push(value);
            }
        })
    })
}

#[tokio::test]
async fn test_run_round_trips_through_a_worker() {
    let registry = Registry::new();
    let worker = spawn_echo(&registry, "echo");

    let result = worker
        .run("echo", Value::List(vec![Value::Int(42)]))
        .await
        .unwrap();
    assert_eq!(result, Value::List(vec![Value::Int(42)]));
}

#[tokio::test]
async fn test_replies_correlate_out_of_order() {
    let registry = Registry::new();
    let worker = registry.spawn_worker(Some("delay".into()), |reg| {
        reg.engine().add_fn("delay", |args| async move {
            let ms = args
                .as_list()
                .and_then(|list| list.first())
                .and_then(Value::as_u64)
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            args.as_list()
                .and_then(|list| list.get(1))
                .cloned()
                .unwrap_or(Value::Null)
        });
    });

    let slow = worker.run(
        "delay",
        Value::List(vec![Value::Int(40), Value::Str("slow".into())]),
    );
    let fast = worker.run(
        "delay",
        Value::List(vec![Value::Int(5), Value::Str("fast".into())]),
    );
    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.unwrap(), Value::Str("slow".into()));
    assert_eq!(fast.unwrap(), Value::Str("fast".into()));
}

#[tokio::test]
async fn test_round_robin_takes_turns_and_wraps() {
    let registry = Registry::new();
    for name in ["a", "b", "c"] {
        let tag = name.to_string();
        registry.spawn_worker(Some(name.into()), move |reg| {
            reg.engine().add_fn("whoami", move |_args| {
                let tag = tag.clone();
                async move { Value::Str(tag) }
            });
        });
    }

    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(registry.run("whoami", Value::Null, None, None).await.unwrap());
    }
    // Two full rotations visit every worker in the same order.
    assert_eq!(seen[0..3], seen[3..6]);
    for name in ["a", "b", "c"] {
        assert!(seen.contains(&Value::Str(name.into())));
    }
}

#[tokio::test]
async fn test_deadline_fails_slow_requests() {
    let registry = Registry::new();
    let worker = registry.spawn_worker(Some("stall".into()), |reg| {
        reg.engine().add_fn("stall", |_args| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Value::Null
        });
    });

    let err = worker
        .run_with("stall", Value::Null, None, Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, worker::Error::DeadlineExceeded));
}

#[tokio::test]
async fn test_terminate_rejects_pending_and_is_idempotent() {
    let registry = Registry::new();
    let worker = registry.spawn_worker(Some("stall".into()), |reg| {
        reg.engine().add_fn("stall", |_args| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Value::Null
        });
    });

    let pending = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run("stall", Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(worker.terminate().await);
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, worker::Error::WorkerUnavailable));

    assert!(!worker.terminate().await);
    assert_eq!(worker.ledger_len(), 0);
    assert!(registry.worker("stall").is_none());

    let err = worker.run("stall", Value::Null).await.unwrap_err();
    assert!(matches!(err, worker::Error::WorkerUnavailable));
}

#[tokio::test]
async fn test_terminate_unwinds_outstanding_subscriptions() {
    let registry = Registry::new();

    let engine_slot = Arc::new(StdMutex::new(None));
    let producer = {
        let slot = engine_slot.clone();
        registry.spawn_worker(Some("src".into()), move |reg| {
            reg.engine().add_fn("tick", |args| async move { args });
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(reg.engine().clone());
            }
        })
    };

    let counter = Arc::new(AtomicUsize::new(0));
    let listener = {
        let counter = counter.clone();
        registry.spawn_worker(Some("dst".into()), move |reg| {
            reg.engine().add_fn("sink", move |_args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Value::Bool(true)
                }
            });
        })
    };

    let channel = registry
        .pipe_workers("src", "tick", "dst", Some("sink"), false)
        .await
        .unwrap();
    let SubToken::Confirmed(token) = listener.subscription("tick", &channel).unwrap().token
    else {
        panic!("pipe not confirmed");
    };

    producer.run("tick", Value::Int(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(listener.ledger_len(), 1);

    // Terminating with the subscription outstanding unwinds the ledger.
    assert!(listener.terminate().await);
    assert_eq!(listener.ledger_len(), 0);
    assert!(!listener.terminate().await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The teardown notice reached the producer: its subscriber is gone,
    // so removing the token again reports nothing to remove.
    let engine = engine_slot.lock().unwrap().clone().unwrap();
    assert!(!engine.unsubscribe("tick", token));

    producer.run("tick", Value::Int(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_nonblocking_subscription_delivers_every_value() {
    let registry = Registry::new();
    let worker = spawn_echo(&registry, "prod");

    let seen = Arc::new(StdMutex::new(Vec::new()));
    let token = registry
        .subscribe_to_worker(
            "tick",
            "prod",
            SubscribeTarget::Callback(collect_into(seen.clone())),
            SubscribeInput::default(),
            false,
        )
        .await
        .unwrap();
    assert!(token.as_u64().is_some());

    for i in 0..5 {
        worker.run("tick", Value::Int(i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let got = seen.lock().unwrap().clone();
    assert_eq!(got.len(), 5);
    for i in 0..5 {
        assert!(got.contains(&Value::Int(i)));
    }
}

#[tokio::test]
async fn test_blocking_subscription_holds_one_credit() {
    init_tracing();
    let registry = Registry::new();
    let worker = registry.spawn_worker(Some("prod".into()), |reg| {
        reg.engine().add_fn("metric", |args| async move { args });
        let engine = reg.engine().clone();
        let weak = Arc::downgrade(reg);
        reg.engine().add_fn("begin", move |_args| {
            let engine = engine.clone();
            let weak = weak.clone();
            async move {
                tokio::spawn(async move {
                    for i in 0..40 {
                        engine
                            .run("metric", Value::Int(i), Context::detached(weak.clone()))
                            .await;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                });
                Value::Bool(true)
            }
        });
    });

    let received = Arc::new(AtomicUsize::new(0));
    let busy = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let callback: TriggerFn = {
        let received = received.clone();
        let busy = busy.clone();
        let overlapped = overlapped.clone();
        Arc::new(move |_value| {
            let received = received.clone();
            let busy = busy.clone();
            let overlapped = overlapped.clone();
            Box::pin(async move {
                if busy.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                // Slow consumer: much slower than the producer emits.
                tokio::time::sleep(Duration::from_millis(25)).await;
                received.fetch_add(1, Ordering::SeqCst);
                busy.store(false, Ordering::SeqCst);
            })
        })
    };

    registry
        .subscribe_to_worker(
            "metric",
            "prod",
            SubscribeTarget::Callback(callback),
            SubscribeInput::default(),
            true,
        )
        .await
        .unwrap();

    worker.post("begin", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let got = received.load(Ordering::SeqCst);
    assert!(got >= 2, "expected some deliveries, got {}", got);
    assert!(got < 40, "expected drops under backpressure, got {}", got);
    assert!(!overlapped.load(Ordering::SeqCst), "deliveries overlapped");
}

#[tokio::test]
async fn test_pipe_routes_one_worker_into_another() {
    init_tracing();
    let registry = Registry::new();
    let producer = spawn_echo(&registry, "src");

    let counter = Arc::new(AtomicUsize::new(0));
    let listener = {
        let counter = counter.clone();
        registry.spawn_worker(Some("dst".into()), move |reg| {
            reg.engine().add_fn("sink", move |_args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Value::Bool(true)
                }
            });
        })
    };

    let channel = registry
        .pipe_workers("src", "tick", "dst", Some("sink"), false)
        .await
        .unwrap();
    assert!(channel.starts_with("channel-"));
    let sub = listener.subscription("tick", &channel).unwrap();
    assert!(matches!(sub.token, SubToken::Confirmed(_)));

    for i in 0..3 {
        producer.run("tick", Value::Int(i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    assert!(registry.unpipe_workers("dst", "tick", &channel).await.unwrap());
    producer.run("tick", Value::Int(9)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert!(listener.subscription("tick", &channel).is_none());
}

#[tokio::test]
async fn test_stop_and_start_revive_a_pipe() {
    let registry = Registry::new();
    let producer = spawn_echo(&registry, "src");

    let counter = Arc::new(AtomicUsize::new(0));
    let listener = {
        let counter = counter.clone();
        registry.spawn_worker(Some("dst".into()), move |reg| {
            reg.engine().add_fn("sink", move |_args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Value::Bool(true)
                }
            });
        })
    };

    let channel = registry
        .pipe_workers("src", "tick", "dst", Some("sink"), false)
        .await
        .unwrap();

    producer.run("tick", Value::Int(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    listener
        .stop(Some("tick"), Some(channel.as_str()))
        .await
        .unwrap();
    let sub = listener.subscription("tick", &channel).unwrap();
    assert_eq!(sub.token, SubToken::Stopped);

    producer.run("tick", Value::Int(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    listener
        .start(Some("tick"), Some(channel.as_str()), Some("sink"), false)
        .await
        .unwrap();
    let sub = listener.subscription("tick", &channel).unwrap();
    assert!(matches!(sub.token, SubToken::Confirmed(_)));

    producer.run("tick", Value::Int(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_resubscribing_gets_a_fresh_isolated_token() {
    let registry = Registry::new();
    let worker = spawn_echo(&registry, "prod");

    let first = Arc::new(StdMutex::new(Vec::new()));
    let token = registry
        .subscribe_to_worker(
            "tick",
            "prod",
            SubscribeTarget::Callback(collect_into(first.clone())),
            SubscribeInput::default(),
            false,
        )
        .await
        .unwrap()
        .as_u64()
        .unwrap();

    worker.run("tick", Value::Int(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(worker.unsubscribe("tick", token).await.unwrap());

    let second = Arc::new(StdMutex::new(Vec::new()));
    let fresh = registry
        .subscribe_to_worker(
            "tick",
            "prod",
            SubscribeTarget::Callback(collect_into(second.clone())),
            SubscribeInput::default(),
            false,
        )
        .await
        .unwrap()
        .as_u64()
        .unwrap();
    assert_ne!(fresh, token);

    worker.run("tick", Value::Int(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(first.lock().unwrap().clone(), vec![Value::Int(1)]);
    assert_eq!(second.lock().unwrap().clone(), vec![Value::Int(2)]);
}

#[tokio::test]
async fn test_unsubscribing_a_missing_token_succeeds() {
    let registry = Registry::new();
    let worker = spawn_echo(&registry, "prod");
    assert!(worker.unsubscribe("tick", 9999).await.unwrap());
}

#[tokio::test]
async fn test_deny_listed_routes_refuse_remote_callers() {
    let registry = Registry::new();
    let worker = registry.spawn_worker(Some("prod".into()), |reg| {
        reg.engine().add_fn("secret", |_args| async move { Value::Int(1) });
        reg.restrict("secret");
    });

    let result = worker.run("secret", Value::Null).await.unwrap();
    assert!(result.is_null());

    let token = registry
        .subscribe_to_worker(
            "secret",
            "prod",
            SubscribeTarget::State,
            SubscribeInput::default(),
            false,
        )
        .await
        .unwrap();
    assert!(token.is_null());
}

#[tokio::test]
async fn test_channel_to_coordinator_is_addressable() {
    let registry = Registry::new();
    spawn_echo(&registry, "prod");

    let channel = registry.establish_channel("prod", None).await.unwrap();
    let handle = registry.worker(&channel).unwrap();

    let result = handle.run("echo", Value::Int(7)).await.unwrap();
    assert_eq!(result, Value::Int(7));
}

#[tokio::test]
async fn test_establish_channel_requires_live_endpoints() {
    let registry = Registry::new();
    let err = registry.establish_channel("ghost", None).await.unwrap_err();
    assert!(matches!(err, registry::Error::ChannelUnavailable(_)));
}

#[tokio::test]
async fn test_dispatch_with_empty_roster_fails() {
    let registry = Registry::new();
    let err = registry
        .run("anything", Value::Null, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, registry::Error::NoWorkers));

    let err = registry
        .run("anything", Value::Null, Some("ghost"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, registry::Error::UnknownWorker(_)));
}

#[tokio::test]
async fn test_state_subscription_records_latest_value() {
    let registry = Registry::new();
    let worker = spawn_echo(&registry, "prod");

    registry
        .subscribe_to_worker(
            "tick",
            "prod",
            SubscribeTarget::State,
            SubscribeInput::default(),
            false,
        )
        .await
        .unwrap();

    worker.run("tick", Value::Int(3)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let latest = registry.latest("prod").unwrap();
    assert_eq!(latest.get("args"), Some(&Value::Int(3)));
    assert_eq!(latest.get("callbackId"), Some(&Value::Str("tick".into())));
}

#[tokio::test]
async fn test_adopted_transport_reports_close() {
    let registry = Registry::new();
    let (near, far) = DuplexTransport::pair();

    let closed = Arc::new(AtomicBool::new(false));
    let worker = {
        let closed = closed.clone();
        registry.add_worker(
            WorkerSpec::new(Box::new(near))
                .id("adopted")
                .on_close(move |id| {
                    assert_eq!(id, "adopted");
                    closed.store(true, Ordering::SeqCst);
                }),
        )
    };
    assert_eq!(registry.worker_count(), 1);

    // Peer goes away; the pump detaches the worker and fires the hook.
    drop(far);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(closed.load(Ordering::SeqCst));
    assert!(registry.worker("adopted").is_none());
    assert!(!worker.is_active());
}

#[tokio::test]
async fn test_add_worker_id_collision_keeps_existing() {
    let registry = Registry::new();

    let (near_a, _far_a) = DuplexTransport::pair();
    let first = registry.add_worker(WorkerSpec::new(Box::new(near_a)).id("dup"));

    let (near_b, far_b) = DuplexTransport::pair();
    let second = registry.add_worker(WorkerSpec::new(Box::new(near_b)).id("dup"));

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.worker_count(), 1);
    // The rejected transport was closed, so its peer drains to None
    // instead of dangling.
    assert!(matches!(far_b.recv().await, Ok(None)));
}

#[tokio::test]
async fn test_duplex_pair_moves_packets_both_ways() {
    let (a, b) = DuplexTransport::pair();

    a.send(Packet::from_envelope(Envelope::post("x", Value::Int(1))))
        .await
        .unwrap();
    let got = b.recv().await.unwrap().unwrap();
    assert_eq!(got.envelope.route.as_deref(), Some("x"));

    b.close();
    assert!(!b.is_open());
    assert!(matches!(
        b.send(Packet::from_envelope(Envelope::post("y", Value::Null))).await,
        Err(transport::Error::Closed)
    ));
    // Peer dropped its sender, so our receive side drains to None.
    assert!(matches!(a.recv().await, Ok(None)));
}

#[tokio::test]
async fn test_engine_runs_and_publishes_settled_results() {
    let engine = Engine::new();
    engine.add_fn("double", |args| async move {
        Value::Int(args.as_i64().unwrap_or(0) * 2)
    });

    let seen = Arc::new(StdMutex::new(Vec::new()));
    let token = engine.subscribe("double", collect_into(seen.clone()), SubscribeInput::default());

    let registry = Registry::new();
    let ctx = Context::detached(Arc::downgrade(&registry));
    let result = engine.run("double", Value::Int(4), ctx.clone()).await;
    assert_eq!(result, Some(Value::Int(8)));
    assert_eq!(engine.run("missing", Value::Null, ctx.clone()).await, None);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(seen.lock().unwrap().clone(), vec![Value::Int(8)]);

    assert!(engine.unsubscribe("double", token));
    assert!(!engine.unsubscribe("double", token));
}
