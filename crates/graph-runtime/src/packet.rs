//! Timestamped, type-erased values exchanged over graph streams.

use std::{
    any::{Any, type_name},
    fmt,
    sync::Arc,
};

use crate::error::GraphError;

/// Packet timestamp in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Immutable payload plus the timestamp it belongs to.
///
/// Cloning a packet shares the payload; fan-out to several consumers never
/// copies pixel data.
#[derive(Clone)]
pub struct Packet {
    payload: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    timestamp: Timestamp,
}

impl Packet {
    /// Take ownership of `value` and stamp it with `timestamp`.
    pub fn adopt<T>(value: T, timestamp: Timestamp) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            payload: Arc::new(value),
            type_name: type_name::<T>(),
            timestamp,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Same payload, different timestamp.
    pub fn at(&self, timestamp: Timestamp) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
            type_name: self.type_name,
            timestamp,
        }
    }

    pub fn get<T: Any>(&self) -> Result<&T, GraphError> {
        self.payload
            .downcast_ref::<T>()
            .ok_or(GraphError::PacketType {
                requested: type_name::<T>(),
                actual: self.type_name,
            })
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.type_name)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
