//! Keys of keyed operations and their byte encodings.

use crate::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::{self, FromStr};

#[derive(
    IntoPrimitive, TryFromPrimitive, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug,
)]
#[repr(i32)]
pub enum KeyType {
    Short,
    Integer,
    Long,
    Bytes,
    Text,
}

impl KeyType {
    /// Size of an encoded key of this type, `None` for variable sized keys.
    pub fn fixed_size(self) -> Option<usize> {
        use KeyType::*;

        match self {
            Short => Some(2),
            Integer => Some(4),
            Long => Some(8),
            Bytes | Text => None,
        }
    }
}

impl Default for KeyType {
    fn default() -> Self {
        KeyType::Short
    }
}

impl FromStr for KeyType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use KeyType::*;

        match s.trim().to_ascii_lowercase().as_str() {
            "short" => Ok(Short),
            "int" | "integer" => Ok(Integer),
            "long" => Ok(Long),
            "bytes" => Ok(Bytes),
            "text" | "string" => Ok(Text),
            _ => Err(KeyError::UnknownType(s.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("unknown key type {0:?}")]
    UnknownType(String),

    #[error("expected {expected} bytes for key of type {key_type:?}, found {found}")]
    InvalidSize {
        key_type: KeyType,
        expected: usize,
        found: usize,
    },

    #[error("key of type {0:?} is not valid utf-8")]
    InvalidText(KeyType),

    #[error("key {key} does not have the configured type {expected:?}")]
    TypeMismatch { key: Key, expected: KeyType },
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub enum Key {
    Short(i16),
    Integer(i32),
    Long(i64),
    Bytes(Vec<u8>),
    Text(String),
}

impl Key {
    pub fn key_type(&self) -> KeyType {
        match self {
            Key::Short(_) => KeyType::Short,
            Key::Integer(_) => KeyType::Integer,
            Key::Long(_) => KeyType::Long,
            Key::Bytes(_) => KeyType::Bytes,
            Key::Text(_) => KeyType::Text,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Key::Short(v) => v.to_be_bytes().to_vec(),
            Key::Integer(v) => v.to_be_bytes().to_vec(),
            Key::Long(v) => v.to_be_bytes().to_vec(),
            Key::Bytes(v) => v.clone(),
            Key::Text(v) => v.as_bytes().to_vec(),
        }
    }

    pub fn from_bytes(key_type: KeyType, bytes: &[u8]) -> Result<Self, KeyError> {
        if let Some(expected) = key_type.fixed_size() {
            if bytes.len() != expected {
                return Err(KeyError::InvalidSize {
                    key_type,
                    expected,
                    found: bytes.len(),
                });
            }
        }

        let key = match key_type {
            KeyType::Short => Key::Short(i16::from_be_bytes([bytes[0], bytes[1]])),
            KeyType::Integer => {
                let mut raw = [0; 4];
                raw.copy_from_slice(bytes);
                Key::Integer(i32::from_be_bytes(raw))
            }
            KeyType::Long => {
                let mut raw = [0; 8];
                raw.copy_from_slice(bytes);
                Key::Long(i64::from_be_bytes(raw))
            }
            KeyType::Bytes => Key::Bytes(bytes.to_vec()),
            KeyType::Text => match str::from_utf8(bytes) {
                Ok(s) => Key::Text(s.to_string()),
                Err(_) => return Err(KeyError::InvalidText(key_type)),
            },
        };

        Ok(key)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Short(v) => write!(f, "{}s", v),
            Key::Integer(v) => write!(f, "{}", v),
            Key::Long(v) => write!(f, "{}l", v),
            Key::Bytes(v) => write!(f, "{:02x?}", v),
            Key::Text(v) => write!(f, "{:?}", v),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fixed_size_keys() {
        let key = Key::Integer(-2);
        assert_eq!(key.to_bytes(), vec![0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(Key::from_bytes(KeyType::Integer, &key.to_bytes()), Ok(key));

        assert_eq!(
            Key::from_bytes(KeyType::Long, &[1, 2, 3]),
            Err(KeyError::InvalidSize {
                key_type: KeyType::Long,
                expected: 8,
                found: 3
            })
        );
    }

    #[test]
    fn test_variable_size_keys() {
        let key = Key::Text("word".to_string());
        assert_eq!(Key::from_bytes(KeyType::Text, b"word"), Ok(key));
        assert_eq!(
            Key::from_bytes(KeyType::Text, &[0xff, 0xfe]),
            Err(KeyError::InvalidText(KeyType::Text))
        );
        assert_eq!(Key::from_bytes(KeyType::Bytes, &[]), Ok(Key::Bytes(vec![])));
    }

    #[test]
    fn test_key_type_names() {
        assert_eq!("Integer".parse::<KeyType>(), Ok(KeyType::Integer));
        assert_eq!(" string ".parse::<KeyType>(), Ok(KeyType::Text));
        assert!("float".parse::<KeyType>().is_err());
        assert_eq!(i32::from(KeyType::Long), 2);
        assert_eq!(KeyType::try_from(4).ok(), Some(KeyType::Text));
    }
}
