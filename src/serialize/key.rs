use comms_core::{Key, KeyType};

use super::SerializeError;

const KEY_LENGTH_SIZE: usize = 4;

/// Packs keys in front of the value bytes of a keyed message as `[length:i32][key bytes]`.
#[derive(Debug, Copy, Clone)]
pub struct KeySerializer {
    key_type: KeyType,
}

impl KeySerializer {
    pub fn new(key_type: KeyType) -> Self {
        Self { key_type }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn pack(&self, key: &Key, out: &mut Vec<u8>) {
        let bytes = key.to_bytes();
        out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
        out.extend_from_slice(&bytes);
    }

    /// Splits a keyed payload into the raw key bytes and the remaining value bytes.
    pub fn split<'a>(&self, payload: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), SerializeError> {
        if payload.len() < KEY_LENGTH_SIZE {
            return Err(SerializeError::TruncatedKey {
                expected: KEY_LENGTH_SIZE,
                found: payload.len(),
            });
        }

        let mut raw = [0u8; KEY_LENGTH_SIZE];
        raw.copy_from_slice(&payload[..KEY_LENGTH_SIZE]);
        let len = i32::from_be_bytes(raw).max(0) as usize;
        let end = KEY_LENGTH_SIZE + len;

        if payload.len() < end {
            return Err(SerializeError::TruncatedKey {
                expected: end,
                found: payload.len(),
            });
        }

        Ok((&payload[KEY_LENGTH_SIZE..end], &payload[end..]))
    }

    pub fn unpack<'a>(&self, payload: &'a [u8]) -> Result<(Key, &'a [u8]), SerializeError> {
        let (key, rest) = self.split(payload)?;
        Ok((Key::from_bytes(self.key_type, key)?, rest))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_block() {
        let serializer = KeySerializer::new(KeyType::Text);
        let mut out = vec![];
        serializer.pack(&Key::Text("ab".into()), &mut out);
        out.extend_from_slice(&[9, 9]);

        assert_eq!(&out[..4], &[0, 0, 0, 2]);
        let (key, rest) = serializer.unpack(&out).unwrap();
        assert_eq!(key, Key::Text("ab".into()));
        assert_eq!(rest, &[9, 9]);

        assert!(matches!(
            serializer.split(&out[..5]),
            Err(SerializeError::TruncatedKey {
                expected: 6,
                found: 5
            })
        ));
    }
}
