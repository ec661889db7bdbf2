use comms_core::{HeaderError, KeyType, MessageHeader, HEADER_SIZE};

use super::{check_key, encode_value, Content, KeySerializer, Payload, SerializeError};
use crate::buffer::BufferPool;
use crate::operation::{SendDescriptor, SendState};
use crate::prelude::*;

/// Encoded payload of a message that is waiting for enough pool buffers.
#[derive(Debug)]
pub struct SerializeState {
    bytes: Vec<u8>,
}

impl SerializeState {
    pub fn total_bytes(&self) -> usize {
        self.bytes.len()
    }
}

/// Number of `buffer_size` buffers holding the header followed by `payload` bytes.
fn buffers_needed(payload: usize, buffer_size: usize) -> Result<usize, SerializeError> {
    if buffer_size <= HEADER_SIZE {
        return Err(HeaderError::Truncated(buffer_size).into());
    }

    let total = HEADER_SIZE + payload;
    Ok((total + buffer_size - 1) / buffer_size)
}

/// Packs application objects into send pool buffers. The cursor lives in the send descriptor,
/// so one serializer is shared by every source of an operation.
#[derive(Debug, Copy, Clone)]
pub struct MessageSerializer {
    keyed: bool,
    keys: KeySerializer,
}

impl MessageSerializer {
    pub fn new(keyed: bool, key_type: KeyType) -> Self {
        Self {
            keyed,
            keys: KeySerializer::new(key_type),
        }
    }

    pub fn is_keyed(&self) -> bool {
        self.keyed
    }

    /// Payload bytes of `content`: the key block (keyed operations only) followed by the
    /// encoded value.
    pub fn encode<T: Payload>(&self, content: &Content<T>) -> Result<Vec<u8>, SerializeError> {
        check_key(content, self.keyed, self.keys.key_type())?;

        let mut bytes = vec![];
        if let Some(key) = content.key() {
            self.keys.pack(key, &mut bytes);
        }

        bytes.extend(encode_value(content.value())?);
        Ok(bytes)
    }

    /// Key and value bytes as written to an operation store. Plain content is keyed by the
    /// big-endian id of its source.
    pub fn encode_key_value<T: Payload>(
        &self,
        content: &Content<T>,
        source: TaskId,
    ) -> Result<(Vec<u8>, Vec<u8>), SerializeError> {
        check_key(content, self.keyed, self.keys.key_type())?;

        let key = match content.key() {
            Some(key) => key.to_bytes(),
            None => source.get().to_be_bytes().to_vec(),
        };

        Ok((key, encode_value(content.value())?))
    }

    /// Copies `content` into buffers of `pool`. A message takes all the buffers it needs in
    /// one go, or none: anything short of `Serialized` means the pool is too empty right now
    /// and the call has to be repeated later. The encoded bytes are kept in the descriptor in
    /// the meantime.
    pub fn build<T: Payload>(
        &self,
        content: &Content<T>,
        send: &mut SendDescriptor,
        pool: &BufferPool,
    ) -> Result<SendState, SerializeError> {
        if send.state() >= SendState::Serialized {
            return Ok(send.state());
        }

        let encoded = match send.serialize_state.take() {
            Some(encoded) => encoded,
            None => SerializeState {
                bytes: self.encode(content)?,
            },
        };

        let needed = buffers_needed(encoded.bytes.len(), pool.buffer_size())?;
        if needed > pool.count() {
            return Err(SerializeError::MessageTooLarge {
                needed,
                capacity: pool.count(),
            });
        }

        match pool.acquire_many(needed) {
            Some(buffers) => send.buffers.extend(buffers),
            None => {
                send.serialize_state = Some(encoded);
                return Ok(send.state());
            }
        }

        let header = MessageHeader::new(
            send.source,
            send.edge,
            send.flags,
            encoded.bytes.len(),
            send.routing.destination,
        );

        let mut copied = 0;
        for (i, buffer) in enumerate(&mut send.buffers) {
            if i == 0 {
                let capacity = buffer.capacity();
                let out = buffer
                    .reserve(HEADER_SIZE)
                    .ok_or(HeaderError::Truncated(capacity))?;
                header.encode(out)?;
            }

            copied += buffer.write(&encoded.bytes[copied..]);
        }

        debug_assert_eq!(copied, encoded.bytes.len());
        trace!(
            "serialized {} bytes from {} into {} buffers",
            copied,
            send.source,
            send.buffers.len()
        );

        send.set_state(SendState::Serialized);
        Ok(send.state())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::routing::RoutingParameters;
    use comms_core::Key;

    fn descriptor() -> SendDescriptor {
        let routing = RoutingParameters {
            destination: Some(TaskId(4)),
            ..default()
        };

        SendDescriptor::new(TaskId(1), EdgeId(2), 0, 3, routing)
    }

    #[test]
    fn test_build_waits_for_all_buffers() {
        let serializer = MessageSerializer::new(false, KeyType::Short);
        let content = Content::Plain(vec![7u8; 40]);
        let payload = serializer.encode(&content).unwrap();
        assert_eq!(payload.len(), 41);

        // Buffers of 24 bytes: the header plus 41 payload bytes need three of them.
        let pool = BufferPool::new(3, HEADER_SIZE + 4);
        let held = pool.acquire().unwrap();
        let mut send = descriptor();

        assert_eq!(
            serializer.build(&content, &mut send, &pool).unwrap(),
            SendState::Init
        );
        assert!(send.buffers.is_empty());
        assert_eq!(pool.available(), 2);
        assert_eq!(send.serialize_state.as_ref().unwrap().total_bytes(), 41);

        pool.release(held).unwrap();
        assert_eq!(
            serializer.build(&content, &mut send, &pool).unwrap(),
            SendState::Serialized
        );
        assert_eq!(send.buffers.len(), 3);
        assert!(send.serialize_state.is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_message_larger_than_pool() {
        let serializer = MessageSerializer::new(false, KeyType::Short);
        let content = Content::Plain(vec![7u8; 40]);
        let pool = BufferPool::new(2, HEADER_SIZE + 4);
        let mut send = descriptor();

        assert!(matches!(
            serializer.build(&content, &mut send, &pool),
            Err(SerializeError::MessageTooLarge {
                needed: 3,
                capacity: 2
            })
        ));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_build_layout() {
        let serializer = MessageSerializer::new(false, KeyType::Short);
        let content = Content::Plain(vec![7u8; 40]);
        let payload = serializer.encode(&content).unwrap();

        let pool = BufferPool::new(8, HEADER_SIZE + 16);
        let mut send = descriptor();

        assert_eq!(
            serializer.build(&content, &mut send, &pool).unwrap(),
            SendState::Serialized
        );

        let header = MessageHeader::decode(send.buffers[0].as_slice()).unwrap();
        assert_eq!(header.source, TaskId(1));
        assert_eq!(header.edge, EdgeId(2));
        assert_eq!(header.flags, 3);
        assert_eq!(header.length, payload.len());
        assert_eq!(header.destination, Some(TaskId(4)));

        let copied = send
            .buffers
            .iter()
            .flat_map(|b| b.as_slice().iter().copied())
            .skip(HEADER_SIZE)
            .collect_vec();
        assert_eq!(copied, payload);
    }

    #[test]
    fn test_keyed_encoding() {
        let serializer = MessageSerializer::new(true, KeyType::Integer);
        let bytes = serializer
            .encode(&Content::Keyed(Key::Integer(5), 1u32))
            .unwrap();
        assert_eq!(&bytes[..8], &[0, 0, 0, 4, 0, 0, 0, 5]);

        assert!(matches!(
            serializer.encode(&Content::Plain(1u32)),
            Err(SerializeError::MissingKey)
        ));
        assert!(matches!(
            serializer.encode(&Content::Keyed(Key::Short(5), 1u32)),
            Err(SerializeError::Key(_))
        ));

        let (key, value) = MessageSerializer::new(false, KeyType::Short)
            .encode_key_value(&Content::Plain(1u32), TaskId(9))
            .unwrap();
        assert_eq!(key, vec![0, 0, 0, 9]);
        assert_eq!(value, vec![1]);
    }
}
