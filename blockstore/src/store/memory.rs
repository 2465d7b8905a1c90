use super::{Head, Object, Range, Store};
use crate::Error;
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// Default size of the chunks an object body is streamed in.
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// In-memory object store.
///
/// Bodies are streamed in fixed-size chunks so consumers observe the same chunk
/// boundaries they would from a network store. Reads of keys marked with [Memory::fail]
/// return an error instead of data.
#[derive(Clone)]
pub struct Memory {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    chunk_size: usize,
    gets: Arc<AtomicUsize>,
    heads: Arc<AtomicUsize>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Memory {
    /// Create an empty store that streams bodies in chunks of `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
            chunk_size: chunk_size.max(1),
            gets: Arc::new(AtomicUsize::new(0)),
            heads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Store `value` under `key`, replacing any previous object.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    /// Remove the object stored under `key`.
    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().remove(key)
    }

    /// Make subsequent reads of `key` fail.
    pub fn fail(&self, key: impl Into<String>) {
        self.failing.lock().unwrap().insert(key.into());
    }

    /// Number of `get` requests served.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of `head` requests served.
    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::Relaxed)
    }

    fn check(&self, key: &str) -> Result<(), Error> {
        if self.failing.lock().unwrap().contains(key) {
            return Err(Error::Store(format!("read of {key} failed")));
        }
        Ok(())
    }
}

impl Store for Memory {
    async fn head(&self, key: &str) -> Result<Option<Head>, Error> {
        self.heads.fetch_add(1, Ordering::Relaxed);
        self.check(key)?;
        let objects = self.objects.lock().unwrap();
        Ok(objects.get(key).map(|value| Head {
            size: value.len() as u64,
        }))
    }

    async fn get(&self, key: &str, range: Option<Range>) -> Result<Option<Object>, Error> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.check(key)?;
        let Some(value) = self.objects.lock().unwrap().get(key).cloned() else {
            return Ok(None);
        };
        let size = value.len() as u64;
        let (start, end) = range.map_or((0, size), |range| range.clamp(size));
        let body = value.slice(start as usize..end as usize);

        let chunk_size = self.chunk_size;
        let chunks = (0..body.len())
            .step_by(chunk_size)
            .map(move |i| Ok(body.slice(i..(i + chunk_size).min(body.len()))))
            .collect::<Vec<_>>();
        Ok(Some(Object {
            size,
            body: stream::iter(chunks).boxed(),
        }))
    }
}
