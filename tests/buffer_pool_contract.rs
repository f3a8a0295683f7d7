//! Pooled buffers crossing a pipeline: holders, release and reuse.

mod common;

use common::{test_timeout, wait_until};
use proptest::prelude::*;
use sensorflow_rs::buffer::{BufferPool, SharedBuffer};
use sensorflow_rs::pipeline::{DeliveryPolicy, Envelope, Passive, Pipeline, Time};
use serial_test::serial;
use std::sync::{Arc, Mutex};

#[test]
#[serial]
fn test_global_pool_round_trip_through_pipeline() {
    let pool = BufferPool::global();
    let baseline = pool.stats().outstanding;

    let p = Pipeline::builder().name("global-pool").workers(2).build();
    assert!(BufferPool::ptr_eq(p.pool(), pool));

    let camera = p.add_component("camera", Passive);
    let viewers = p.add_component("viewers", Passive);
    let frames = p.create_emitter::<SharedBuffer>(camera, "frames").unwrap();
    let held: Arc<Mutex<Vec<SharedBuffer>>> = Arc::default();
    for name in ["left", "right", "archive"] {
        let held = Arc::clone(&held);
        let input = p
            .create_receiver(viewers, name, DeliveryPolicy::Unlimited, move |frame: SharedBuffer, _: &Envelope| {
                held.lock().unwrap().push(frame);
                Ok(())
            })
            .unwrap();
        p.connect(&frames, &input).unwrap();
    }

    p.run_async().unwrap();
    let frame = pool.acquire_from(b"pixels");
    let storage = frame.storage_ptr();
    frames.post(frame, Time::from_millis(1)).unwrap();
    assert!(wait_until(test_timeout(), || held.lock().unwrap().len() == 3));

    {
        let held = held.lock().unwrap();
        assert!(held.iter().all(|f| f.storage_ptr() == storage));
        assert!(held.iter().all(|f| &f[..] == b"pixels"));
        assert_eq!(held[0].holders(), 3);
    }
    assert_eq!(pool.stats().outstanding, baseline + 1);

    // Two of three holders gone: the block is still out.
    held.lock().unwrap().truncate(1);
    assert_eq!(pool.stats().outstanding, baseline + 1);
    let other = pool.acquire(6);
    assert_ne!(other.storage_ptr(), storage);
    drop(other);

    held.lock().unwrap().clear();
    assert_eq!(pool.stats().outstanding, baseline);
    p.stop();
}

#[test]
#[serial]
fn test_storage_reused_after_last_release() {
    let pool = BufferPool::global();
    let first = pool.acquire(100);
    let storage = first.storage_ptr();
    let second_holder = first.clone();

    drop(first);
    let meanwhile = pool.acquire(100);
    assert_ne!(meanwhile.storage_ptr(), storage);

    drop(second_holder);
    let reused = pool.acquire(100);
    assert_eq!(reused.storage_ptr(), storage);
    drop(meanwhile);
    drop(reused);
}

#[test]
fn test_copy_on_write_leaves_other_holders_untouched() {
    let pool = BufferPool::new();
    let original = pool.acquire_from(&[1, 2, 3]);
    let mut edited = original.clone();
    edited.make_mut()[0] = 9;

    assert_eq!(&original[..], &[1, 2, 3]);
    assert_eq!(&edited[..], &[9, 2, 3]);
    assert!(!SharedBuffer::ptr_eq(&original, &edited));
    assert_eq!(pool.stats().outstanding, 2);
}

#[test]
fn test_dropped_messages_release_buffers() {
    let pool = BufferPool::new();
    let p = Pipeline::builder().name("latest").pool(pool.clone()).build();
    let a = p.add_component("a", Passive);
    let b = p.add_component("b", Passive);
    let out = p.create_emitter::<SharedBuffer>(a, "out").unwrap();
    let input = p
        .create_receiver(b, "in", DeliveryPolicy::LatestMessage, |_: SharedBuffer, _: &Envelope| Ok(()))
        .unwrap();
    p.connect(&out, &input).unwrap();

    // Not started: each post replaces the pending one.
    for i in 0..4 {
        out.post(pool.acquire(64), Time::from_millis(i)).unwrap();
    }
    assert_eq!(input.dropped(), 3);
    assert_eq!(pool.stats().outstanding, 1);
    p.dispose();
    assert_eq!(pool.stats().outstanding, 0);
}

proptest! {
    #[test]
    fn prop_outstanding_tracks_live_handles(ops in prop::collection::vec((1usize..5000, 0usize..4), 1..40)) {
        let pool = BufferPool::new();
        let mut live: Vec<Vec<SharedBuffer>> = Vec::new();
        for (len, clones) in ops {
            let buffer = pool.acquire(len);
            prop_assert_eq!(buffer.len(), len);
            prop_assert!(buffer.capacity() >= len);
            let mut group = vec![buffer.clone(); clones];
            group.push(buffer);
            live.push(group);
            prop_assert_eq!(pool.stats().outstanding, live.len());
        }
        while let Some(group) = live.pop() {
            drop(group);
            prop_assert_eq!(pool.stats().outstanding, live.len());
        }
        let stats = pool.stats();
        prop_assert_eq!(stats.available_blocks, stats.allocated_blocks);
    }
}
