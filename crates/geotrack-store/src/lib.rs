//! Small key/value persistence for state that must survive a reset.
//!
//! Values are opaque bytes; [`load_json`]/[`save_json`] layer serde on top.
//! [`FileStore`] never leaves a half-written value behind: a crash during
//! `save` leaves either the old value or the new one.

pub mod doctor;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const KEY_SESSION: &str = "lw_session";
pub const KEY_GEOFENCES: &str = "geofences";

const DIGEST_LEN: usize = 32;

pub trait KvStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn save(&mut self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

pub fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match store.load(key)? {
        Some(bytes) => {
            let v = serde_json::from_slice(&bytes).with_context(|| format!("decode stored {}", key))?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

pub fn save_json<T: Serialize + ?Sized>(store: &mut dyn KvStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).with_context(|| format!("encode {}", key))?;
    store.save(key, &bytes)
}

fn check_key(key: &str) -> Result<()> {
    anyhow::ensure!(
        !key.is_empty() && key.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_'),
        "invalid store key {:?}",
        key
    );
    Ok(())
}

/// One file per key: `<dir>/<key>.bin` holding a BLAKE3 digest of the body
/// followed by the body. Written to a temp file, synced, then renamed.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("create store dir {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", key))
    }
}

impl KvStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let mut bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        if bytes.len() < DIGEST_LEN {
            warn!("store: {} truncated ({} bytes)", path.display(), bytes.len());
            anyhow::bail!("{}: truncated", path.display());
        }
        let body = bytes.split_off(DIGEST_LEN);
        if blake3::hash(&body).as_bytes()[..] != bytes[..] {
            warn!("store: {} failed its BLAKE3 check", path.display());
            anyhow::bail!("{}: checksum mismatch", path.display());
        }
        Ok(Some(body))
    }

    fn save(&mut self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(blake3::hash(value).as_bytes())?;
            f.write_all(value)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path).with_context(|| format!("replace {}", path.display()))?;
        debug!("store: wrote {} ({} bytes)", key, value.len());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        check_key(key)?;
        let path = self.path(key);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }
}

/// In-memory store. Clones share the same map, so a test can keep a handle
/// to inspect what a component persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    map: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    writes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls across all clones.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every subsequent `save` fail until turned off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        Ok(self.map().get(key).cloned())
    }

    fn save(&mut self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        anyhow::ensure!(!self.fail_writes.load(Ordering::SeqCst), "store write refused");
        self.map().insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        check_key(key)?;
        self.map().remove(key);
        Ok(())
    }
}
