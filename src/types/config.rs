use comms_core::{KeyType, HEADER_SIZE};
use std::env;
use std::fmt::Debug;
use std::path::PathBuf;
use std::str::FromStr;

use crate::prelude::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be at least {min}, found {found}")]
    TooSmall {
        name: &'static str,
        min: usize,
        found: usize,
    },

    #[error("receive buffers ({receive} bytes) must be able to hold a send buffer ({send} bytes)")]
    ReceiveBufferTooSmall { send: usize, receive: usize },

    #[error("store based operations require a store directory")]
    MissingStoreDirectory,
}

/// Sizing of the pools and queues of a dataflow operation.
#[derive(Debug, Clone)]
pub struct CommsConfig {
    pub send_buffer_count: usize,
    pub send_buffer_size: usize,
    pub receive_buffer_count: usize,
    pub receive_buffer_size: usize,
    /// Maximum number of pending sends per source before `send` reports backpressure. Also
    /// bounds the number of items a streaming receiver buffers per source.
    pub send_pending_max: usize,
    pub keyed: bool,
    pub key_type: KeyType,
    pub store_based: bool,
    pub store_dir: Option<PathBuf>,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            send_buffer_count: 32,
            send_buffer_size: 64 * 1024,
            receive_buffer_count: 32,
            receive_buffer_size: 64 * 1024,
            send_pending_max: 128,
            keyed: false,
            key_type: KeyType::default(),
            store_based: false,
            store_dir: None,
        }
    }
}

fn env_or<T>(name: &str, fallback: T) -> T
where
    T: FromStr + Debug,
{
    match env::var(name) {
        Ok(value) => match value.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    "invalid value {:?} for {}, reverting to {:?}",
                    value, name, fallback
                );
                fallback
            }
        },
        Err(_) => fallback,
    }
}

impl CommsConfig {
    pub fn from_env() -> Self {
        let fallback = Self::default();
        let mut store_dir = fallback.store_dir;

        if let Ok(dir) = env::var("DATAFLOW_STORE_DIR") {
            let dir = dir.trim();

            if !dir.is_empty() {
                info!("storing operation data in {:?}", dir);
                store_dir = Some(dir.into());
            }
        }

        Self {
            send_buffer_count: env_or("DATAFLOW_SEND_BUFFERS", fallback.send_buffer_count),
            send_buffer_size: env_or("DATAFLOW_SEND_BUFFER_SIZE", fallback.send_buffer_size),
            receive_buffer_count: env_or("DATAFLOW_RECV_BUFFERS", fallback.receive_buffer_count),
            receive_buffer_size: env_or(
                "DATAFLOW_RECV_BUFFER_SIZE",
                fallback.receive_buffer_size,
            ),
            send_pending_max: env_or("DATAFLOW_SEND_PENDING_MAX", fallback.send_pending_max),
            keyed: env_or("DATAFLOW_KEYED", fallback.keyed),
            key_type: env_or("DATAFLOW_KEY_TYPE", fallback.key_type),
            store_based: env_or("DATAFLOW_STORE_BASED", fallback.store_based),
            store_dir,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let minimums = [
            ("send_buffer_count", self.send_buffer_count, 1),
            ("receive_buffer_count", self.receive_buffer_count, 1),
            ("send_pending_max", self.send_pending_max, 1),
            ("send_buffer_size", self.send_buffer_size, HEADER_SIZE + 1),
        ];

        for &(name, found, min) in &minimums {
            if found < min {
                return Err(ConfigError::TooSmall { name, min, found });
            }
        }

        if self.receive_buffer_size < self.send_buffer_size {
            return Err(ConfigError::ReceiveBufferTooSmall {
                send: self.send_buffer_size,
                receive: self.receive_buffer_size,
            });
        }

        if self.store_based && self.store_dir.is_none() {
            return Err(ConfigError::MissingStoreDirectory);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        CommsConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate() {
        let config = CommsConfig {
            send_buffer_size: 8,
            ..default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooSmall {
                name: "send_buffer_size",
                min: HEADER_SIZE + 1,
                found: 8
            })
        );

        let config = CommsConfig {
            receive_buffer_size: 1024,
            send_buffer_size: 2048,
            ..default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReceiveBufferTooSmall { .. })
        ));

        let config = CommsConfig {
            store_based: true,
            ..default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MissingStoreDirectory));
    }
}
