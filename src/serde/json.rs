//! Contains the [Serializer][crate::serde::Serializer] and
//! [Deserializer][crate::serde::Deserializer] compatible implementation
//! using JSON.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::serde::{Deserializer, Serializer};

/// Implements the [Serializer] and [Deserializer] traits from the
/// [crate::serde] module, using the [serde] crate to serialize and
/// deserialize a message into JSON.
#[derive(Debug, Clone, Copy)]
pub struct JsonSerde<T>(PhantomData<T>)
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>;

impl<T> Default for JsonSerde<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serializer<T> for JsonSerde<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    type Error = serde_json::Error;

    fn serialize(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value)
    }
}

impl<T> Deserializer<T> for JsonSerde<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    type Error = serde_json::Error;

    fn deserialize(&self, data: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u64,
    }

    #[test]
    fn roundtrip() {
        let serde = JsonSerde::<Sample>::default();
        let value = Sample {
            name: "sample".to_owned(),
            count: 42,
        };

        let bytes = serde.serialize(&value).unwrap();
        assert_eq!(value, serde.deserialize(&bytes).unwrap());
    }

    #[test]
    fn deserialize_rejects_malformed_bytes() {
        let serde = JsonSerde::<Sample>::default();

        assert!(serde.deserialize(b"not json").is_err());
    }
}
