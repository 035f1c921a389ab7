//! Serialization seam used by the Event Store and the snapshotting
//! machinery. The crate standardizes on JSON through [`json::JsonSerde`],
//! but any codec implementing [`Serde`] can be plugged in.

pub mod json;

/// Serializes a value of type `T` into its wire representation.
pub trait Serializer<T> {
    /// The error type returned when serialization fails.
    type Error;

    /// Serializes the value into bytes.
    fn serialize(&self, value: &T) -> Result<Vec<u8>, Self::Error>;
}

/// Deserializes a value of type `T` from its wire representation.
pub trait Deserializer<T> {
    /// The error type returned when deserialization fails.
    type Error;

    /// Deserializes the value from bytes.
    fn deserialize(&self, data: &[u8]) -> Result<T, Self::Error>;
}

/// A bidirectional codec for values of type `T`.
pub trait Serde<T>: Serializer<T> + Deserializer<T> {}

impl<K, T> Serde<T> for K where K: Serializer<T> + Deserializer<T> {}
