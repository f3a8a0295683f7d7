//! In-memory record store.

use super::{Record, StoreReader, StoreWriter};
use crate::pipeline::error::PipelineResult;
use crate::pipeline::sync::lock;
use crate::pipeline::time::Time;
use std::sync::{Arc, Mutex};

/// Record store backed by a shared vector.
///
/// Clones share the records but keep their own read position, so one clone
/// can be handed to an `Exporter` and another to a `ReplaySource`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    records: Arc<Mutex<Vec<Record>>>,
    cursor: usize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records.into_iter().collect())),
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every stored record.
    pub fn records(&self) -> Vec<Record> {
        lock(&self.records).clone()
    }

    pub fn times(&self) -> Vec<Time> {
        lock(&self.records).iter().map(|(t, _)| *t).collect()
    }

    /// Restart reading from the first record.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl StoreReader for InMemoryStore {
    fn next_record(&mut self) -> PipelineResult<Option<Record>> {
        let record = lock(&self.records).get(self.cursor).cloned();
        if record.is_some() {
            self.cursor += 1;
        }
        Ok(record)
    }
}

impl StoreWriter for InMemoryStore {
    fn append_record(&mut self, originating_time: Time, data: &[u8]) -> PipelineResult<()> {
        lock(&self.records).push((originating_time, data.to_vec()));
        Ok(())
    }
}
