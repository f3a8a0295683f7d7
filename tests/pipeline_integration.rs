//! End-to-end tests of pipeline construction, lifecycle and error routing.

mod common;

use common::builders::TestPipeline;
use common::{drain_events, test_timeout, wait_idle, Collector};
use proptest::prelude::*;
use sensorflow_rs::buffer::BufferPool;
use sensorflow_rs::pipeline::{
    CallbackStage, Component, ComponentContext, DeliveryPolicy, Envelope, LifecycleState,
    Passive, PipelineError, PipelineEvent, Time,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct CountingStops {
    stops: Arc<AtomicUsize>,
}

impl Component for CountingStops {
    fn on_stop(&mut self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_stop_is_idempotent() {
    let pool = BufferPool::new();
    let p = TestPipeline::new("idempotent").pool(pool.clone()).build();
    let stops = Arc::new(AtomicUsize::new(0));
    let cam = p.add_component(
        "cam",
        CountingStops {
            stops: Arc::clone(&stops),
        },
    );
    let out = p.create_emitter::<sensorflow_rs::SharedBuffer>(cam, "frames").unwrap();
    let events = p.subscribe();

    p.run_async().unwrap();
    assert!(common::wait_until(test_timeout(), || {
        p.topology().component(cam).map(|c| c.state) == Some(LifecycleState::Running)
    }));
    out.post(pool.acquire(1024), p.now()).unwrap();

    p.stop();
    let after_first = pool.stats();
    p.stop();

    assert_eq!(p.state(), LifecycleState::Stopped);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats(), after_first);
    assert_eq!(after_first.outstanding, 0);

    let events = drain_events(&events);
    let stopped = events
        .iter()
        .filter(|e| e.is_lifecycle(LifecycleState::Stopped))
        .count();
    assert_eq!(stopped, 1);
    let component_stops = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::ComponentStopped { .. }))
        .count();
    assert_eq!(component_stops, 1);
}

#[test]
fn test_lifecycle_sequence() {
    let p = TestPipeline::new("lifecycle").build();
    p.add_component("a", Passive);
    let events = p.subscribe();
    p.run_async().unwrap();
    p.stop();

    let transitions: Vec<_> = drain_events(&events)
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::LifecycleChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            LifecycleState::Started,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ]
    );
}

#[test]
fn test_post_after_stop_fails() {
    let p = TestPipeline::new("late").build();
    let a = p.add_component("a", Passive);
    let b = p.add_component("b", Passive);
    let out = p.create_emitter::<u32>(a, "out").unwrap();
    let sink = Collector::new();
    let input = p
        .create_receiver(b, "in", DeliveryPolicy::Unlimited, sink.handler())
        .unwrap();
    p.connect(&out, &input).unwrap();

    p.run_async().unwrap();
    p.stop();
    let err = out.post(1, Time::from_millis(1)).unwrap_err();
    assert!(err.is_stopped());
    assert_eq!(err.component(), Some(a));
}

#[test]
fn test_originating_time_regression_rejected() {
    let p = TestPipeline::new("order").build();
    let a = p.add_component("a", Passive);
    let ordered = p.create_emitter::<u32>(a, "ordered").unwrap();
    let unordered = p.create_unordered_emitter::<u32>(a, "unordered").unwrap();

    ordered.post(1, Time::from_millis(20)).unwrap();
    ordered.post(2, Time::from_millis(20)).unwrap();
    let err = ordered.post(3, Time::from_millis(10)).unwrap_err();
    match err {
        PipelineError::OriginatingTimeOrder {
            attempted, last, ..
        } => {
            assert_eq!(attempted, Time::from_millis(10));
            assert_eq!(last, Time::from_millis(20));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ordered.last_envelope().unwrap().sequence_id, 2);

    unordered.post(1, Time::from_millis(20)).unwrap();
    unordered.post(2, Time::from_millis(10)).unwrap();
}

#[test]
fn test_graph_errors() {
    let p1 = TestPipeline::new("one").build();
    let p2 = TestPipeline::new("two").build();
    let a = p1.add_component("a", Passive);
    let b = p1.add_component("b", Passive);
    let out = p1.create_emitter::<u32>(a, "out").unwrap();
    let numbers = p1
        .create_receiver(b, "numbers", DeliveryPolicy::Unlimited, Collector::<u32>::new().handler())
        .unwrap();
    let words = p1
        .create_receiver(b, "words", DeliveryPolicy::Unlimited, Collector::<String>::new().handler())
        .unwrap();
    let c = p2.add_component("c", Passive);
    let foreign = p2
        .create_receiver(c, "in", DeliveryPolicy::Unlimited, Collector::<u32>::new().handler())
        .unwrap();

    p1.connect(&out, &numbers).unwrap();
    assert!(matches!(
        p1.connect(&out, &numbers),
        Err(PipelineError::AlreadyConnected { .. })
    ));
    assert!(matches!(
        p1.connect_ports(out.id(), words.id()),
        Err(PipelineError::TypeMismatch { component, .. }) if component == a
    ));
    assert!(matches!(
        p1.connect(&out, &foreign),
        Err(PipelineError::ForeignPort(_))
    ));
    assert_eq!(out.target_count(), 1);
    assert_eq!(p1.topology().edges.len(), 1);
}

#[test]
fn test_fan_out_delivers_to_every_receiver() {
    let p = TestPipeline::new("fanout").build();
    let a = p.add_component("a", Passive);
    let b = p.add_component("b", Passive);
    let out = p.create_emitter::<String>(a, "out").unwrap();
    let sinks: Vec<_> = (0..3).map(|_| Collector::<String>::new()).collect();
    for (i, sink) in sinks.iter().enumerate() {
        let input = p
            .create_receiver(b, format!("in{i}"), DeliveryPolicy::Unlimited, sink.handler())
            .unwrap();
        p.connect(&out, &input).unwrap();
    }

    p.run_async().unwrap();
    let env = out.post("frame".to_string(), Time::from_millis(7)).unwrap();
    for sink in &sinks {
        assert!(sink.wait_for(1));
        assert_eq!(sink.values(), vec!["frame".to_string()]);
        assert_eq!(sink.envelopes(), vec![env]);
    }
    p.stop();
}

#[test]
fn test_fail_fast_stops_pipeline() {
    let p = TestPipeline::new("failfast").build();
    let a = p.add_component("a", Passive);
    let b = p.add_component("b", Passive);
    let out = p.create_emitter::<u32>(a, "out").unwrap();
    let input = p
        .create_receiver(b, "in", DeliveryPolicy::Unlimited, |v: u32, _: &Envelope| {
            anyhow::ensure!(v != 3, "cannot handle {v}");
            Ok(())
        })
        .unwrap();
    p.connect(&out, &input).unwrap();
    let errors = p.errors();

    p.run_async().unwrap();
    let bad = out.post(3, Time::from_millis(3)).unwrap();
    assert!(p.wait_stopped(test_timeout()));

    let err = errors.recv_timeout(test_timeout()).unwrap();
    match &err {
        PipelineError::ComponentCallback {
            component,
            stage,
            envelope,
            ..
        } => {
            assert_eq!(*component, b);
            assert!(matches!(stage, CallbackStage::Message { receiver } if receiver == "in"));
            assert_eq!(envelope.as_ref(), Some(&bad));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("cannot handle 3"));
}

#[test]
fn test_panicking_handler_is_reported() {
    let p = TestPipeline::new("panic").build();
    let a = p.add_component("a", Passive);
    let b = p.add_component("b", Passive);
    let out = p.create_emitter::<u32>(a, "out").unwrap();
    let input = p
        .create_receiver(b, "in", DeliveryPolicy::Unlimited, |_: u32, _: &Envelope| -> anyhow::Result<()> {
            panic!("decoder crashed")
        })
        .unwrap();
    p.connect(&out, &input).unwrap();
    let errors = p.errors();

    p.run_async().unwrap();
    out.post(1, Time::from_millis(1)).unwrap();
    let err = errors.recv_timeout(test_timeout()).unwrap();
    assert!(err.to_string().contains("decoder crashed"));
    assert!(p.wait_stopped(test_timeout()));
}

#[test]
fn test_isolate_subgraph_keeps_healthy_branch() {
    let p = TestPipeline::new("isolate").isolate_failures().build();
    let source = p.add_component("source", Passive);
    let faulty = p.add_component("faulty", Passive);
    let after = p.add_component("after", Passive);
    let healthy = p.add_component("healthy", Passive);

    let out = p.create_emitter::<u32>(source, "out").unwrap();
    let relay = p.create_emitter::<u32>(faulty, "relay").unwrap();
    let relay_out = relay.clone();
    let faulty_in = p
        .create_receiver(faulty, "in", DeliveryPolicy::Unlimited, move |v: u32, env: &Envelope| {
            anyhow::ensure!(v != 2, "bad value");
            relay_out.post(v, env.originating_time)?;
            Ok(())
        })
        .unwrap();
    let after_sink = Collector::new();
    let after_in = p
        .create_receiver(after, "in", DeliveryPolicy::Unlimited, after_sink.handler())
        .unwrap();
    let healthy_sink = Collector::new();
    let healthy_in = p
        .create_receiver(healthy, "in", DeliveryPolicy::Unlimited, healthy_sink.handler())
        .unwrap();
    p.connect(&out, &faulty_in).unwrap();
    p.connect(&relay, &after_in).unwrap();
    p.connect(&out, &healthy_in).unwrap();
    let events = p.subscribe();

    p.run_async().unwrap();
    for v in 1..=4u32 {
        out.post(v, Time::from_millis(i64::from(v))).unwrap();
    }
    assert!(healthy_sink.wait_for(4));
    assert!(wait_idle(&p));

    assert_eq!(p.state(), LifecycleState::Running);
    assert_eq!(healthy_sink.values(), vec![1, 2, 3, 4]);
    assert_eq!(after_sink.values(), vec![1]);

    let topology = p.topology();
    let isolated: Vec<_> = topology.isolated().map(|c| c.name.clone()).collect();
    assert_eq!(isolated, vec!["faulty".to_string(), "after".to_string()]);
    assert!(faulty_in.dropped() >= 2);

    let isolated_events = drain_events(&events)
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::ComponentIsolated { .. }))
        .count();
    assert_eq!(isolated_events, 2);
    p.stop();
}

#[test]
fn test_cycle_does_not_deadlock() {
    const ROUNDS: u32 = 200;
    let p = TestPipeline::new("cycle").workers(1).build();
    let ping = p.add_component("ping", Passive);
    let pong = p.add_component("pong", Passive);
    let ping_out = p.create_unordered_emitter::<u32>(ping, "out").unwrap();
    let pong_out = p.create_unordered_emitter::<u32>(pong, "out").unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    let reply = ping_out.clone();
    let done = Arc::clone(&finished);
    let ping_in = p
        .create_receiver(ping, "in", DeliveryPolicy::throttle_blocking(1), move |v: u32, env: &Envelope| {
            if v >= ROUNDS {
                done.store(v as usize, Ordering::SeqCst);
                return Ok(());
            }
            reply.post(v + 1, env.originating_time)?;
            Ok(())
        })
        .unwrap();
    let answer = pong_out.clone();
    let pong_in = p
        .create_receiver(pong, "in", DeliveryPolicy::throttle_blocking(1), move |v: u32, env: &Envelope| {
            answer.post(v, env.originating_time)?;
            Ok(())
        })
        .unwrap();
    p.connect(&ping_out, &pong_in).unwrap();
    p.connect(&pong_out, &ping_in).unwrap();

    p.run_async().unwrap();
    ping_out.post(0, p.now()).unwrap();
    assert!(common::wait_until(test_timeout(), || {
        finished.load(Ordering::SeqCst) == ROUNDS as usize
    }));
    p.stop();
}

#[test]
fn test_self_loop_with_throttle() {
    let p = TestPipeline::new("self-loop").workers(1).build();
    let counter = p.add_component("counter", Passive);
    let out = p.create_unordered_emitter::<u32>(counter, "out").unwrap();
    let again = out.clone();
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in = Arc::clone(&seen);
    let input = p
        .create_receiver(counter, "in", DeliveryPolicy::throttle_blocking(1), move |v: u32, env: &Envelope| {
            seen_in.fetch_add(1, Ordering::SeqCst);
            if v < 50 {
                again.post(v + 1, env.originating_time)?;
            }
            Ok(())
        })
        .unwrap();
    p.connect(&out, &input).unwrap();

    p.run_async().unwrap();
    out.post(0, p.now()).unwrap();
    assert!(common::wait_until(test_timeout(), || seen.load(Ordering::SeqCst) == 51));
    p.stop();
}

#[test]
fn test_self_loop_posting_twice_into_throttle() {
    let p = TestPipeline::new("self-fan-out").workers(1).build();
    let doubler = p.add_component("doubler", Passive);
    let out = p.create_unordered_emitter::<u32>(doubler, "out").unwrap();
    let again = out.clone();
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&runs);
    let input = p
        .create_receiver(doubler, "in", DeliveryPolicy::throttle_blocking(1), move |v: u32, env: &Envelope| {
            counted.fetch_add(1, Ordering::SeqCst);
            if v < 5 {
                again.post(v + 1, env.originating_time)?;
                again.post(v + 1, env.originating_time)?;
            }
            Ok(())
        })
        .unwrap();
    p.connect(&out, &input).unwrap();

    p.run_async().unwrap();
    out.post(0, p.now()).unwrap();
    // 1 + 2 + 4 + 8 + 16 + 32
    assert!(common::wait_until(test_timeout(), || runs.load(Ordering::SeqCst) == 63));
    assert!(wait_idle(&p));
    assert_eq!(input.dropped(), 0);
    assert_eq!(input.dispatched(), 63);
    p.stop();
}

#[test]
fn test_concurrent_posts_reach_receiver_in_sequence_order() {
    const THREADS: usize = 4;
    const POSTS: usize = 500;

    for round in 0..10 {
        let p = TestPipeline::new("concurrent-posts").build();
        let producer = p.add_component("producer", Passive);
        let consumer = p.add_component("consumer", Passive);
        let out = p.create_unordered_emitter::<usize>(producer, "out").unwrap();
        let sink: Collector<usize> = Collector::new();
        let input = p
            .create_receiver(consumer, "in", DeliveryPolicy::Unlimited, sink.handler())
            .unwrap();
        p.connect(&out, &input).unwrap();
        p.run_async().unwrap();

        let posters: Vec<_> = (0..THREADS)
            .map(|t| {
                let out = out.clone();
                thread::spawn(move || {
                    for i in 0..POSTS {
                        out.post(t * POSTS + i, Time::from_millis(i as i64)).unwrap();
                    }
                })
            })
            .collect();
        for poster in posters {
            poster.join().unwrap();
        }
        assert!(sink.wait_for(THREADS * POSTS));
        p.stop();

        let sequence: Vec<u64> = sink.envelopes().iter().map(|e| e.sequence_id).collect();
        assert_eq!(sequence.len(), THREADS * POSTS);
        assert!(
            sequence.windows(2).all(|pair| pair[0] < pair[1]),
            "round {round}: sequence ids delivered out of order"
        );
    }
}

struct Ticker {
    ticks: Arc<AtomicUsize>,
}

impl Component for Ticker {
    fn on_start(&mut self, ctx: &ComponentContext) -> anyhow::Result<()> {
        let ticks = Arc::clone(&self.ticks);
        for i in 1..=3u64 {
            let ticks = Arc::clone(&ticks);
            ctx.schedule_after(Duration::from_millis(5 * i), move |ctx| {
                if ticks.fetch_add(1, Ordering::SeqCst) == 2 {
                    ctx.complete();
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

#[test]
fn test_run_returns_when_sources_complete() {
    let p = TestPipeline::new("sources").build();
    let ticks = Arc::new(AtomicUsize::new(0));
    p.add_source(
        "ticker",
        Ticker {
            ticks: Arc::clone(&ticks),
        },
    );
    p.run().unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
    assert_eq!(p.state(), LifecycleState::Stopped);
}

#[test]
fn test_component_added_while_running_is_started() {
    let p = TestPipeline::new("late-add").build();
    p.run_async().unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));
    let id = p.add_component(
        "ticker",
        Ticker {
            ticks: Arc::clone(&ticks),
        },
    );
    assert!(common::wait_until(test_timeout(), || ticks.load(Ordering::SeqCst) == 3));
    assert_eq!(
        p.topology().component(id).map(|c| c.state),
        Some(LifecycleState::Running)
    );
    p.stop();
}

#[test]
fn test_stop_from_handler_is_deferred() {
    let p = TestPipeline::new("self-stop").build();
    let a = p.add_component("a", Passive);
    let out = p.create_emitter::<u32>(a, "out").unwrap();
    let handle = p.clone();
    let input = p
        .create_receiver(a, "in", DeliveryPolicy::Unlimited, move |_: u32, _: &Envelope| {
            handle.stop();
            Ok(())
        })
        .unwrap();
    p.connect(&out, &input).unwrap();

    p.run_async().unwrap();
    out.post(1, p.now()).unwrap();
    assert!(p.wait_stopped(test_timeout()));
    assert_eq!(p.errors().try_iter().count(), 0);
    // The handler holds a pipeline handle; break the cycle explicitly.
    p.dispose();
}

#[test]
fn test_dispose_releases_pending_buffers() {
    let pool = BufferPool::new();
    let p = TestPipeline::new("dispose").pool(pool.clone()).build();
    let a = p.add_component("a", Passive);
    let b = p.add_component("b", Passive);
    let out = p.create_emitter::<sensorflow_rs::SharedBuffer>(a, "out").unwrap();
    let input = p
        .create_receiver(b, "in", DeliveryPolicy::Unlimited, Collector::new().handler())
        .unwrap();
    p.connect(&out, &input).unwrap();

    for i in 0..5 {
        out.post(pool.acquire(256), Time::from_millis(i)).unwrap();
    }
    assert_eq!(pool.stats().outstanding, 5);
    assert_eq!(input.pending(), 5);

    p.dispose();
    assert_eq!(pool.stats().outstanding, 0);
    assert_eq!(pool.stats().available_blocks, 5);
    assert_eq!(input.dropped(), 5);
}

#[test]
fn test_topology_snapshot_serializes() {
    let p = TestPipeline::new("snapshot").build();
    let cam = p.add_component("camera", Passive);
    let det = p.add_component("detector", Passive);
    let out = p.create_emitter::<u32>(cam, "frames").unwrap();
    let input = p
        .create_receiver(det, "frames", DeliveryPolicy::LatestMessage, Collector::new().handler())
        .unwrap();
    p.connect(&out, &input).unwrap();

    let json = p.topology().to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["name"], "snapshot");
    assert_eq!(value["state"], "created");
    assert_eq!(value["components"][1]["name"], "detector");
    assert_eq!(value["receivers"][0]["port"]["policy"]["policy"], "latest_message");
    assert_eq!(value["edges"].as_array().map(Vec::len), Some(1));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_originating_order_preserved(gaps in prop::collection::vec(0i64..5, 1..60), workers in 1usize..4) {
        let p = TestPipeline::new("prop-order").workers(workers).build();
        let a = p.add_component("a", Passive);
        let b = p.add_component("b", Passive);
        let out = p.create_emitter::<usize>(a, "out").unwrap();
        let sink = Collector::new();
        let input = p.create_receiver(b, "in", DeliveryPolicy::Unlimited, sink.handler()).unwrap();
        p.connect(&out, &input).unwrap();

        p.run_async().unwrap();
        let mut t = 0;
        let mut times = Vec::new();
        for (i, gap) in gaps.iter().enumerate() {
            t += gap;
            times.push(Time::from_millis(t));
            out.post(i, Time::from_millis(t)).unwrap();
        }
        prop_assert!(sink.wait_for(gaps.len()));
        p.stop();

        let envelopes = sink.envelopes();
        prop_assert_eq!(sink.values(), (0..gaps.len()).collect::<Vec<_>>());
        prop_assert_eq!(envelopes.iter().map(|e| e.originating_time).collect::<Vec<_>>(), times);
        prop_assert!(envelopes.windows(2).all(|w| w[0].sequence_id + 1 == w[1].sequence_id));
        prop_assert!(envelopes.iter().all(|e| e.source_id == a));
    }
}
