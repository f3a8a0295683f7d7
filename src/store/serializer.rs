//! Payload codecs.

use crate::pipeline::error::{PipelineError, PipelineResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::marker::PhantomData;

/// Encodes and decodes one payload type.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T, writer: &mut dyn Write) -> PipelineResult<()>;

    fn deserialize(&self, reader: &mut dyn Read) -> PipelineResult<T>;

    /// Encode into a fresh byte vector.
    fn to_bytes(&self, value: &T) -> PipelineResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.serialize(value, &mut bytes)?;
        Ok(bytes)
    }

    fn from_bytes(&self, mut bytes: &[u8]) -> PipelineResult<T> {
        self.deserialize(&mut bytes)
    }
}

/// JSON codec for any serde type.
pub struct JsonSerializer<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JsonSerializer<{}>", std::any::type_name::<T>())
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T, writer: &mut dyn Write) -> PipelineResult<()> {
        serde_json::to_writer(writer, value).map_err(|e| PipelineError::Serialization(e.to_string()))
    }

    fn deserialize(&self, reader: &mut dyn Read) -> PipelineResult<T> {
        serde_json::from_reader(reader).map_err(|e| PipelineError::Serialization(e.to_string()))
    }
}
