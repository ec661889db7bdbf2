use comms_core::{KeyType, MessageHeader};

use super::{decode_value, Content, KeySerializer, Payload, SerializeError};
use crate::buffer::Buffer;
use crate::operation::InMessage;

/// Rebuilds application objects, or raw key/value bytes, from the buffers of a complete
/// inbound message.
#[derive(Debug, Copy, Clone)]
pub struct MessageDeserializer {
    keyed: bool,
    keys: KeySerializer,
}

impl MessageDeserializer {
    pub fn new(keyed: bool, key_type: KeyType) -> Self {
        Self {
            keyed,
            keys: KeySerializer::new(key_type),
        }
    }

    pub fn build_header(&self, buffer: &Buffer) -> Result<MessageHeader, SerializeError> {
        Ok(MessageHeader::decode(buffer.as_slice())?)
    }

    fn payload(&self, message: &InMessage) -> Result<Vec<u8>, SerializeError> {
        let payload = message.payload();
        let expected = message.header().length;

        if payload.len() != expected {
            return Err(SerializeError::LengthMismatch {
                expected,
                found: payload.len(),
            });
        }

        Ok(payload)
    }

    pub fn build<T: Payload>(&self, message: &InMessage) -> Result<Content<T>, SerializeError> {
        let payload = self.payload(message)?;

        if self.keyed {
            let (key, value) = self.keys.unpack(&payload)?;
            Ok(Content::Keyed(key, decode_value(value)?))
        } else {
            Ok(Content::Plain(decode_value(&payload)?))
        }
    }

    /// Raw key and value bytes of a message. Messages of un-keyed operations are keyed by the
    /// big-endian id of their source.
    pub fn extract_key_value(
        &self,
        message: &InMessage,
    ) -> Result<(Vec<u8>, Vec<u8>), SerializeError> {
        let payload = self.payload(message)?;

        if self.keyed {
            let (key, value) = self.keys.split(&payload)?;
            Ok((key.to_vec(), value.to_vec()))
        } else {
            let key = message.header().source.get().to_be_bytes().to_vec();
            Ok((key, payload))
        }
    }
}
