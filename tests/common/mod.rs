//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use sensorflow_rs::pipeline::{Envelope, Pipeline, PipelineEvent};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Poll `condition` until it holds or the timeout passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Wait until the pipeline has no queued or running work.
pub fn wait_idle(pipeline: &Pipeline) -> bool {
    wait_until(test_timeout(), || pipeline.is_idle())
}

/// Records every message a receiver hands to its handler.
pub struct Collector<T> {
    items: Arc<Mutex<Vec<(T, Envelope)>>>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: Clone + Send + 'static> Collector<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handler appending to this collector.
    pub fn handler(&self) -> impl FnMut(T, &Envelope) -> anyhow::Result<()> + Send + 'static {
        let items = Arc::clone(&self.items);
        move |value: T, envelope: &Envelope| {
            items.lock().unwrap().push((value, *envelope));
            Ok(())
        }
    }

    /// Handler that sleeps `delay` before recording, to simulate a slow
    /// consumer.
    pub fn slow_handler(
        &self,
        delay: Duration,
    ) -> impl FnMut(T, &Envelope) -> anyhow::Result<()> + Send + 'static {
        let mut record = self.handler();
        move |value: T, envelope: &Envelope| {
            std::thread::sleep(delay);
            record(value, envelope)
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn values(&self) -> Vec<T> {
        self.items.lock().unwrap().iter().map(|(v, _)| v.clone()).collect()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.items.lock().unwrap().iter().map(|(_, e)| *e).collect()
    }

    pub fn wait_for(&self, count: usize) -> bool {
        wait_until(test_timeout(), || self.len() >= count)
    }
}

/// Drain all events currently queued on a subscription.
pub fn drain_events(events: &crossbeam_channel::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    events.try_iter().collect()
}
