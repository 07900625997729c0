//! Opaque payloads that travel between nodes.
//!
//! Job results, job summaries and deallocation messages are defined by the
//! job queen, not by the distributor. Any `serde` type is a [`Payload`]; the
//! receiving side turns bytes back into a boxed payload through a
//! [`PayloadRegistry`] that the queen fills in at startup.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: bincode::Error,
    },

    #[error("no decoder registered for payload type {0}")]
    Unregistered(String),

    #[error("payload compression failed: {0}")]
    Compression(#[source] std::io::Error),
}

/// A value the distributor can ship without knowing its type.
pub trait Payload: Any + Send + Sync + fmt::Debug {
    /// Registry key for this payload's concrete type.
    fn type_tag(&self) -> &'static str;

    fn to_bytes(&self) -> Result<Vec<u8>, PayloadError>;

    fn as_any(&self) -> &dyn Any;
}

impl<T> Payload for T
where
    T: Serialize + DeserializeOwned + Any + Send + Sync + fmt::Debug,
{
    fn type_tag(&self) -> &'static str {
        type_name::<T>()
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        bincode::serialize(self).map_err(PayloadError::Encode)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Payload {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// A payload together with the tag needed to decode it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPayload {
    pub type_tag: String,
    pub bytes: Vec<u8>,
}

impl SerializedPayload {
    pub fn encode(payload: &dyn Payload) -> Result<Self, PayloadError> {
        Ok(Self {
            type_tag: payload.type_tag().to_string(),
            bytes: payload.to_bytes()?,
        })
    }
}

type Decoder = fn(&[u8]) -> Result<Box<dyn Payload>, bincode::Error>;

fn decode_as<T>(bytes: &[u8]) -> Result<Box<dyn Payload>, bincode::Error>
where
    T: Serialize + DeserializeOwned + Any + Send + Sync + fmt::Debug,
{
    Ok(Box::new(bincode::deserialize::<T>(bytes)?))
}

/// Maps payload type tags to decoders.
#[derive(Default)]
pub struct PayloadRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self)
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync + fmt::Debug,
    {
        self.decoders.insert(type_name::<T>(), decode_as::<T>);
    }

    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.decoders.contains_key(type_tag)
    }

    pub fn decode(&self, payload: &SerializedPayload) -> Result<Box<dyn Payload>, PayloadError> {
        let decoder = self
            .decoders
            .get(payload.type_tag.as_str())
            .ok_or_else(|| PayloadError::Unregistered(payload.type_tag.clone()))?;
        decoder(&payload.bytes).map_err(|source| PayloadError::Decode {
            what: payload.type_tag.clone(),
            source,
        })
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("PayloadRegistry").field("types", &tags).finish()
    }
}
