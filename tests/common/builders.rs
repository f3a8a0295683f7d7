//! Test data builders for creating test objects

use sensorflow_rs::buffer::BufferPool;
use sensorflow_rs::config::{ClockMode, ErrorPolicy, ReplaySpeed};
use sensorflow_rs::pipeline::{Pipeline, Time};
use sensorflow_rs::store::{InMemoryStore, JsonSerializer, Serializer};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Builder for pipelines with test-friendly defaults: a private buffer pool
/// and a small worker count.
pub struct TestPipeline {
    name: String,
    workers: usize,
    policy: ErrorPolicy,
    clock: ClockMode,
    pool: BufferPool,
}

impl TestPipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            workers: 2,
            policy: ErrorPolicy::FailFast,
            clock: ClockMode::Live,
            pool: BufferPool::new(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn isolate_failures(mut self) -> Self {
        self.policy = ErrorPolicy::IsolateSubgraph;
        self
    }

    pub fn unpaced_replay(mut self) -> Self {
        self.clock = ClockMode::Replay {
            speed: ReplaySpeed::AsFastAsPossible,
        };
        self
    }

    pub fn clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline::builder()
            .name(self.name)
            .workers(self.workers)
            .error_policy(self.policy)
            .clock_mode(self.clock)
            .pool(self.pool)
            .build()
    }
}

/// Store pre-filled with JSON records at the given millisecond times.
pub fn json_store<T>(records: &[(i64, T)]) -> InMemoryStore
where
    T: Serialize + DeserializeOwned + Clone,
{
    let codec = JsonSerializer::<T>::new();
    InMemoryStore::from_records(
        records
            .iter()
            .map(|(ms, value)| (Time::from_millis(*ms), codec.to_bytes(value).unwrap())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorflow_rs::pipeline::LifecycleState;

    #[test]
    fn test_pipeline_builder() {
        let p = TestPipeline::new("fixture").workers(1).build();
        assert_eq!(p.name(), "fixture");
        assert_eq!(p.state(), LifecycleState::Created);
        assert_eq!(p.config().worker_threads, 1);
    }

    #[test]
    fn test_json_store() {
        let store = json_store(&[(1, 10u32), (2, 20u32)]);
        assert_eq!(store.times(), vec![Time::from_millis(1), Time::from_millis(2)]);
    }
}
