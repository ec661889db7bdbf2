//! Append-only key/value storage backing store based operations.
use rand::distributions::Alphanumeric;
use rand::prelude::*;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::prelude::*;
use crate::serialize::decode_value;

const FILE_SUFFIX_LENGTH: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("path {0:?} does not exist or is not a directory")]
    InvalidDirectory(PathBuf),

    #[error("a store for {0} already exists")]
    DuplicateOperation(EdgeId),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Range {
    offset: u64,
    len: usize,
}

struct Log {
    file: File,
    end: u64,
}

/// Values of one operation. Values are appended to a log file, an in-memory index maps every
/// key to the ranges of its values in insertion order.
pub struct OperationStore {
    operation: EdgeId,
    path: PathBuf,
    log: Mutex<Log>,
    index: Mutex<IndexMap<Vec<u8>, Vec<Range>>>,
}

impl OperationStore {
    fn create(dir: &Path, operation: EdgeId) -> Result<Self, StoreError> {
        let mut tries = 0;
        let (path, file) = loop {
            tries += 1;
            let suffix: String = Alphanumeric
                .sample_iter(thread_rng())
                .take(FILE_SUFFIX_LENGTH)
                .map(char::from)
                .collect();

            let path = dir.join(format!("op-{}-{}.log", operation.get(), suffix));
            let result = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path);

            match result {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && tries < 100 => continue,
                Err(e) => return Err(e.into()),
            }
        };

        debug!("created store for {} at {:?}", operation, path);

        Ok(Self {
            operation,
            path,
            log: Mutex::new(Log { file, end: 0 }),
            index: default(),
        })
    }

    pub fn operation(&self) -> EdgeId {
        self.operation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, value: &[u8]) -> Result<Range, StoreError> {
        let mut log = self.log.lock();
        let offset = log.end;

        log.file.seek(SeekFrom::Start(offset))?;
        log.file.write_all(value)?;
        log.end += value.len() as u64;

        Ok(Range {
            offset,
            len: value.len(),
        })
    }

    /// Adds `value` to the values of `key` and returns its position among them.
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<usize, StoreError> {
        let range = self.write(value)?;
        let mut index = self.index.lock();
        let ranges = index.entry(key.to_vec()).or_default();
        ranges.push(range);
        Ok(ranges.len() - 1)
    }

    /// Replaces the values of `key` by `value`. Old bytes stay in the log.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let range = self.write(value)?;
        self.index.lock().insert(key.to_vec(), vec![range]);
        Ok(())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.index.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw values of `key` in insertion order.
    pub fn get(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let ranges = match self.index.lock().get(key) {
            Some(r) => r.clone(),
            None => return Ok(vec![]),
        };

        let mut log = self.log.lock();
        let mut values = Vec::with_capacity(ranges.len());

        for range in ranges {
            let mut value = vec![0; range.len];
            log.file.seek(SeekFrom::Start(range.offset))?;
            log.file.read_exact(&mut value)?;
            values.push(value);
        }

        Ok(values)
    }

    /// The value at `position` among the values of `key`, as returned by `append`.
    pub fn get_value<T: DeserializeOwned>(
        &self,
        key: &[u8],
        position: usize,
    ) -> Result<Option<T>, StoreError> {
        let range = match self.index.lock().get(key).and_then(|r| r.get(position)) {
            Some(&range) => range,
            None => return Ok(None),
        };

        let mut value = vec![0; range.len];
        {
            let mut log = self.log.lock();
            log.file.seek(SeekFrom::Start(range.offset))?;
            log.file.read_exact(&mut value)?;
        }

        Ok(Some(decode_value(&value)?))
    }

    pub fn get_values<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Vec<T>, StoreError> {
        let mut values = vec![];
        for bytes in self.get(key)? {
            values.push(decode_value(&bytes)?);
        }

        Ok(values)
    }
}

impl Drop for OperationStore {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("error while deleting {:?}: {}", self.path, e);
        }
    }
}

impl std::fmt::Debug for OperationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationStore")
            .field("operation", &self.operation)
            .field("path", &self.path)
            .finish()
    }
}

/// Hands out one store per operation, all placed in the same directory.
#[derive(Debug)]
pub struct StoreManager {
    dir: PathBuf,
    stores: Mutex<HashMap<EdgeId, Arc<OperationStore>>>,
}

impl StoreManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }

        if !dir.is_dir() {
            return Err(StoreError::InvalidDirectory(dir));
        }

        Ok(Self {
            dir: dir.canonicalize()?,
            stores: default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn add_operation(&self, operation: EdgeId) -> Result<Arc<OperationStore>, StoreError> {
        let mut stores = self.stores.lock();
        if stores.contains_key(&operation) {
            return Err(StoreError::DuplicateOperation(operation));
        }

        let store = Arc::new(OperationStore::create(&self.dir, operation)?);
        stores.insert(operation, Arc::clone(&store));
        Ok(store)
    }

    pub fn get(&self, operation: EdgeId) -> Option<Arc<OperationStore>> {
        self.stores.lock().get(&operation).cloned()
    }
}
