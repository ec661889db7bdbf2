//! Packing of application objects into pooled buffers and back.
mod deserializer;
mod key;
mod serializer;

pub use self::deserializer::MessageDeserializer;
pub use self::key::KeySerializer;
pub use self::serializer::{MessageSerializer, SerializeState};

use bincode::Options;
use comms_core::{HeaderError, Key, KeyError, KeyType};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

use crate::prelude::*;

/// Application records that can travel through a dataflow operation.
pub trait Payload: Serialize + DeserializeOwned + Clone + Debug + Send + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Debug + Send + 'static {}

#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("{0}")]
    Header(#[from] HeaderError),

    #[error("{0}")]
    Key(#[from] KeyError),

    #[error("keyed operation received content without a key")]
    MissingKey,

    #[error("operation is not keyed but content carries key {0}")]
    UnexpectedKey(Key),

    #[error("payload of {found} bytes is shorter than its {expected} byte key block")]
    TruncatedKey { expected: usize, found: usize },

    #[error("message needs {needed} buffers, the send pool only has {capacity}")]
    MessageTooLarge { needed: usize, capacity: usize },

    #[error("message carries {found} payload bytes, header declares {expected}")]
    LengthMismatch { expected: usize, found: usize },
}

/// Object carried by a message: either a plain value or a value together with its key.
#[derive(Debug, Clone, PartialEq)]
pub enum Content<T> {
    Plain(T),
    Keyed(Key, T),
}

impl<T> Content<T> {
    pub fn key(&self) -> Option<&Key> {
        match self {
            Content::Plain(_) => None,
            Content::Keyed(k, _) => Some(k),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Content::Plain(v) | Content::Keyed(_, v) => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Content::Plain(v) | Content::Keyed(_, v) => v,
        }
    }
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_varint_encoding()
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> bincode::Result<Vec<u8>> {
    bincode_options().serialize(value)
}

pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> bincode::Result<T> {
    bincode_options().deserialize(bytes)
}

/// Checks that `content` matches the key configuration of an operation.
pub(crate) fn check_key<T>(
    content: &Content<T>,
    keyed: bool,
    key_type: KeyType,
) -> Result<(), SerializeError> {
    match (content, keyed) {
        (Content::Plain(_), false) => Ok(()),
        (Content::Plain(_), true) => Err(SerializeError::MissingKey),
        (Content::Keyed(key, _), false) => Err(SerializeError::UnexpectedKey(key.clone())),
        (Content::Keyed(key, _), true) if key.key_type() != key_type => {
            Err(KeyError::TypeMismatch {
                key: key.clone(),
                expected: key_type,
            }
            .into())
        }
        (Content::Keyed(_, _), true) => Ok(()),
    }
}
