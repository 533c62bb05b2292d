//! The brain: durable key/value memory with an optimistic-locking
//! checkout protocol.
//!
//! Both in-process callers and external plugin processes (over the
//! bridge) read-modify-write records through the same
//! checkout → update/checkin cycle, so the semantics here are the only
//! semantics. A write checkout issues an opaque lock token; an update
//! must present the exact token or it is rejected without writing.
//! Locks expire on a timer so a crashed holder can never wedge a key.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use rand::RngCore;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::protocol::RetVal;

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("brain store failure: {0}")]
    Store(String),
    #[error("brain provider initialization failed: {0}")]
    Init(String),
}

/// Storage backend behind the brain. Implementations only need to be
/// a consistent key/value map; locking lives above them.
pub trait BrainStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, BrainError>;
    fn put(&self, key: &str, value: &str) -> Result<(), BrainError>;
}

/// Datum keys may contain word characters and `:` separators.
static DATUM_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w:]+$").unwrap());

const MAX_KEY_LEN: usize = 128;

pub fn valid_datum_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN && DATUM_KEY.is_match(key)
}

/// Result of one checkout: payload (when the record exists), a lock
/// token (non-empty only for a successful write checkout), and a
/// result code.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub key: String,
    pub exists: bool,
    pub token: String,
    pub payload: Option<String>,
    pub ret: RetVal,
}

impl Checkout {
    fn failed(key: &str, ret: RetVal) -> Self {
        Checkout {
            key: key.to_string(),
            exists: false,
            token: String::new(),
            payload: None,
            ret,
        }
    }
}

struct LockEntry {
    token: String,
    expires: Instant,
}

pub struct Brain {
    store: Box<dyn BrainStore>,
    locks: Mutex<HashMap<String, LockEntry>>,
    lock_timeout: Duration,
}

const LOCK_POLL: Duration = Duration::from_millis(10);

impl Brain {
    pub fn new(store: Box<dyn BrainStore>) -> Self {
        Self::with_lock_timeout(store, Duration::from_secs(10))
    }

    pub fn with_lock_timeout(store: Box<dyn BrainStore>, lock_timeout: Duration) -> Self {
        Brain {
            store,
            locks: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Check out a datum. With `for_write`, acquires the per-key lock,
    /// waiting out any current holder until checkin or expiry; at most
    /// one live token exists per key at any instant.
    pub async fn checkout(&self, key: &str, for_write: bool) -> Checkout {
        if !valid_datum_key(key) {
            return Checkout::failed(key, RetVal::InvalidDatumKey);
        }
        let token = if for_write {
            self.acquire_lock(key).await
        } else {
            String::new()
        };
        match self.store.get(key) {
            Ok(Some(payload)) => Checkout {
                key: key.to_string(),
                exists: true,
                token,
                payload: Some(payload),
                ret: RetVal::Ok,
            },
            Ok(None) => Checkout {
                key: key.to_string(),
                exists: false,
                token,
                payload: None,
                ret: RetVal::Ok,
            },
            Err(e) => {
                warn!("brain read failed for '{}': {}", key, e);
                if for_write {
                    self.checkin(key, &token);
                }
                Checkout::failed(key, RetVal::BrainFailed)
            }
        }
    }

    /// Release a held lock without writing. Releasing with a stale or
    /// foreign token is a no-op.
    pub fn checkin(&self, key: &str, token: &str) -> RetVal {
        if token.is_empty() {
            return RetVal::Ok;
        }
        let mut locks = self.locks.lock().expect("brain lock table poisoned");
        if locks.get(key).is_some_and(|e| e.token == token) {
            locks.remove(key);
        }
        RetVal::Ok
    }

    /// Write a new payload, but only when the presented token exactly
    /// matches the currently held one for the key. A stale or
    /// mismatched token is rejected and nothing is written.
    pub fn update(&self, key: &str, token: &str, payload: &str) -> RetVal {
        if !valid_datum_key(key) {
            return RetVal::InvalidDatumKey;
        }
        {
            let mut locks = self.locks.lock().expect("brain lock table poisoned");
            match locks.get(key) {
                Some(entry) if entry.token == token && entry.expires > Instant::now() => {
                    locks.remove(key);
                }
                _ => {
                    warn!("stale lock token presented updating '{}'", key);
                    return RetVal::DatumLockExpired;
                }
            }
        }
        match self.store.put(key, payload) {
            Ok(()) => RetVal::Ok,
            Err(e) => {
                warn!("brain write failed for '{}': {}", key, e);
                RetVal::BrainFailed
            }
        }
    }

    /// Lock-free read used by internal callers that only need the
    /// current value, such as namespace secret lookup.
    pub fn peek(&self, key: &str) -> Option<String> {
        if !valid_datum_key(key) {
            return None;
        }
        self.store.get(key).ok().flatten()
    }

    async fn acquire_lock(&self, key: &str) -> String {
        loop {
            {
                let mut locks = self.locks.lock().expect("brain lock table poisoned");
                let now = Instant::now();
                let held = match locks.get(key) {
                    Some(entry) if entry.expires > now => true,
                    Some(_) => {
                        warn!("expiring abandoned lock on '{}'", key);
                        locks.remove(key);
                        false
                    }
                    None => false,
                };
                if !held {
                    let token = new_token();
                    locks.insert(
                        key.to_string(),
                        LockEntry {
                            token: token.clone(),
                            expires: now + self.lock_timeout,
                        },
                    );
                    return token;
                }
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    /// Test hook: whether a live lock is currently held for the key.
    pub fn locked(&self, key: &str) -> bool {
        let locks = self.locks.lock().expect("brain lock table poisoned");
        locks.get(key).is_some_and(|e| e.expires > Instant::now())
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
