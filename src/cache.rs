//! On-disk dataset cache with reference-counted object storage.
//!
//! Datasets (the last-known value of a subscription) are stored as ordered
//! lists of references into per-collection object tables, so a document that
//! appears in several cached datasets is stored once and reference-counted.
//!
//! Directory layout, one directory per api key under the platform cache root:
//!
//! ```text
//! 00.dat          cache-info:    bucket -> { key -> last-modified ms }
//! 01.dat          refcount-info: group  -> { "group/object" -> count }
//! 00<bucket>.dat  link table:    key -> [ [groupId, objectId], .. ]
//! 01<group>.dat   object table:  objectId -> payload (base64, optionally XORed)
//! ```
//!
//! Object payloads can be XOR-obfuscated with the current auth token. This is
//! obfuscation, not encryption; it keeps casual readers out of the cache file
//! but is no security boundary.
//!
//! All disk I/O runs on one dedicated worker thread; callers talk to it over
//! a channel and receive results through oneshot responses. Every file write
//! goes through a tempfile-then-rename so a crash never corrupts a table.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::{mpsc, oneshot};

use crate::document::Document;
use crate::error::{Error, Result};

/// Default on-disk size cap (100 MiB).
pub const DEFAULT_MAX_SIZE: u64 = 100 * 1024 * 1024;

const CACHE_INFO_FILE: &str = "00.dat";
const REFCOUNT_INFO_FILE: &str = "01.dat";
const LINK_TABLE_PREFIX: &str = "00";
const OBJECT_TABLE_PREFIX: &str = "01";
/// Entries evicted per size-pruning round.
const PRUNE_CHUNK: usize = 5;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Entries older than this are evicted on open. `None` means no TTL.
    pub ttl: Option<Duration>,
    /// On-disk size cap; pruning shrinks the directory to half of it.
    pub max_size: u64,
    /// Override for the platform cache root (used by tests).
    pub root: Option<PathBuf>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { ttl: None, max_size: DEFAULT_MAX_SIZE, root: None }
    }
}

/// Non-unique bucket hash used to shard link tables.
///
/// Lowercases the key, counts character frequencies, sorts the (char, freq)
/// pairs ascending by (freq, char), then folds
/// `sum((i+1) * 101 * freq * ascii) mod 2^31`. Collisions are expected; the
/// per-bucket tables key on the full string.
pub fn bucket_hash(key: &str) -> String {
    let mut freq: HashMap<char, u64> = HashMap::new();
    for c in key.to_lowercase().chars() {
        *freq.entry(c).or_insert(0) += 1;
    }
    let mut pairs: Vec<(char, u64)> = freq.into_iter().collect();
    pairs.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut sum: u64 = 0;
    for (i, (c, f)) in pairs.iter().enumerate() {
        sum = (sum + (i as u64 + 1) * 101 * f * (*c as u64)) % (1 << 31);
    }
    sum.to_string()
}

/// Injective hash used where collisions are not tolerable (group partitions):
/// the concatenation of decimal character codes. Unambiguous over the
/// identifier alphabet because two-digit codes never start with `1` and
/// three-digit codes always do.
pub fn unique_hash(key: &str) -> String {
    key.chars().map(|c| (c as u32).to_string()).collect()
}

/// XOR obfuscation: byte `i` is XORed with `secret[i mod len]`. Applying it
/// twice with the same secret restores the input.
pub fn obfuscate(bytes: &mut [u8], secret: &str) {
    let secret = secret.as_bytes();
    if secret.is_empty() {
        return;
    }
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= secret[i % secret.len()];
    }
}

type CacheInfo = HashMap<String, HashMap<String, i64>>;
type RefcountInfo = HashMap<String, HashMap<String, i64>>;
type LinkTable = HashMap<String, Vec<(String, String)>>;
type ObjectTable = HashMap<String, String>;

/// One object going into or out of the store.
struct CachedObject {
    group_id: String,
    object_id: String,
    bytes: Vec<u8>,
}

/// The synchronous store. Owned by the worker thread; never shared.
struct CacheStore {
    dir: PathBuf,
    info: CacheInfo,
    refcounts: RefcountInfo,
}

impl CacheStore {
    fn open(dir: PathBuf, options: &CacheOptions) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let info: CacheInfo = read_table(&dir.join(CACHE_INFO_FILE)).unwrap_or_default();
        let refcounts = match read_table(&dir.join(REFCOUNT_INFO_FILE)) {
            Some(r) => r,
            // Missing or unreadable after a crash: rebuild from link tables,
            // which are the authoritative record of what references what.
            None => Self::rebuild_refcounts(&dir, &info),
        };
        let mut store = Self { dir, info, refcounts };
        store.prune(options);
        Ok(store)
    }

    fn rebuild_refcounts(dir: &Path, info: &CacheInfo) -> RefcountInfo {
        let mut refcounts: RefcountInfo = HashMap::new();
        for bucket in info.keys() {
            let links: LinkTable =
                read_table(&dir.join(format!("{}{}.dat", LINK_TABLE_PREFIX, bucket)))
                    .unwrap_or_default();
            for refs in links.values() {
                for (group, object) in refs {
                    *refcounts
                        .entry(unique_hash(group))
                        .or_default()
                        .entry(format!("{}/{}", group, object))
                        .or_insert(0) += 1;
                }
            }
        }
        log::info!("cache: rebuilt refcount table from link tables");
        refcounts
    }

    fn link_table_path(&self, bucket: &str) -> PathBuf {
        self.dir.join(format!("{}{}.dat", LINK_TABLE_PREFIX, bucket))
    }

    fn object_table_path(&self, group_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.dat", OBJECT_TABLE_PREFIX, unique_hash(group_id)))
    }

    /// Writes a dataset under `key`, adjusting refcounts against whatever the
    /// key previously referenced.
    fn save(&mut self, key: &str, objects: Vec<CachedObject>, secret: Option<&str>) -> Result<()> {
        let bucket = bucket_hash(key);
        let link_path = self.link_table_path(&bucket);
        let mut links: LinkTable = read_table(&link_path).unwrap_or_default();
        let mut prev: Vec<(String, String)> = links.get(key).cloned().unwrap_or_default();

        // Survivors keep their refcount; new references gain one.
        for obj in &objects {
            let reference = (obj.group_id.clone(), obj.object_id.clone());
            if let Some(pos) = prev.iter().position(|r| *r == reference) {
                prev.remove(pos);
            } else {
                *self
                    .refcounts
                    .entry(unique_hash(&obj.group_id))
                    .or_default()
                    .entry(format!("{}/{}", obj.group_id, obj.object_id))
                    .or_insert(0) += 1;
            }
        }

        // Whatever is left of the old reference list was dropped by this
        // write; release and collect unreferenced objects.
        let mut doomed: Vec<(String, String)> = Vec::new();
        for (group, object) in prev {
            if self.release(&group, &object) {
                doomed.push((group, object));
            }
        }

        // Write payloads into their group object tables.
        let mut tables: HashMap<String, ObjectTable> = HashMap::new();
        for obj in objects.iter() {
            let table = tables.entry(obj.group_id.clone()).or_insert_with(|| {
                read_table(&self.object_table_path(&obj.group_id)).unwrap_or_default()
            });
            let mut bytes = obj.bytes.clone();
            if let Some(secret) = secret {
                obfuscate(&mut bytes, secret);
            }
            table.insert(obj.object_id.clone(), BASE64.encode(bytes));
        }
        for (group, object) in doomed {
            let table = tables.entry(group.clone()).or_insert_with(|| {
                read_table(&self.object_table_path(&group)).unwrap_or_default()
            });
            table.remove(&object);
        }
        for (group, table) in &tables {
            self.persist_object_table(group, table)?;
        }

        self.persist_refcounts()?;

        self.info
            .entry(bucket.clone())
            .or_default()
            .insert(key.to_string(), now_ms());
        self.persist_info()?;

        links.insert(
            key.to_string(),
            objects
                .into_iter()
                .map(|o| (o.group_id, o.object_id))
                .collect(),
        );
        write_table(&link_path, &links)?;
        Ok(())
    }

    /// Reads the dataset stored under `key`, or `None` when absent.
    /// References whose object vanished are silently skipped.
    fn load(&self, key: &str, secret: Option<&str>) -> Result<Option<Vec<Vec<u8>>>> {
        let bucket = bucket_hash(key);
        let known = self
            .info
            .get(&bucket)
            .map(|keys| keys.contains_key(key))
            .unwrap_or(false);
        if !known {
            return Ok(None);
        }

        let links: LinkTable = read_table(&self.link_table_path(&bucket)).unwrap_or_default();
        let refs = match links.get(key) {
            Some(refs) => refs,
            None => return Ok(None),
        };

        let mut tables: HashMap<&str, ObjectTable> = HashMap::new();
        let mut out = Vec::with_capacity(refs.len());
        for (group, object) in refs {
            let table = tables.entry(group.as_str()).or_insert_with(|| {
                read_table(&self.object_table_path(group)).unwrap_or_default()
            });
            let encoded = match table.get(object) {
                Some(encoded) => encoded,
                None => continue,
            };
            let mut bytes = BASE64
                .decode(encoded)
                .map_err(|e| Error::Other(format!("corrupt cache object: {}", e)))?;
            if let Some(secret) = secret {
                obfuscate(&mut bytes, secret);
            }
            out.push(bytes);
        }
        Ok(Some(out))
    }

    /// Removes the dataset stored under `key`, releasing its references.
    fn remove(&mut self, key: &str) -> Result<()> {
        let bucket = bucket_hash(key);
        let link_path = self.link_table_path(&bucket);
        let mut links: LinkTable = read_table(&link_path).unwrap_or_default();
        if let Some(refs) = links.remove(key) {
            let mut tables: HashMap<String, ObjectTable> = HashMap::new();
            for (group, object) in refs {
                if self.release(&group, &object) {
                    let table = tables.entry(group.clone()).or_insert_with(|| {
                        read_table(&self.object_table_path(&group)).unwrap_or_default()
                    });
                    table.remove(&object);
                }
            }
            for (group, table) in &tables {
                self.persist_object_table(group, table)?;
            }
        }

        if let Some(keys) = self.info.get_mut(&bucket) {
            keys.remove(key);
            if keys.is_empty() {
                self.info.remove(&bucket);
            }
        }

        self.persist_refcounts()?;
        self.persist_info()?;
        if links.is_empty() {
            remove_file_if_exists(&link_path)?;
        } else {
            write_table(&link_path, &links)?;
        }
        Ok(())
    }

    /// Deletes the whole cache directory contents.
    fn clear(&mut self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        self.info.clear();
        self.refcounts.clear();
        Ok(())
    }

    /// Decrements the refcount for `group/object`; returns true when the
    /// object became unreferenced and must be dropped from its table.
    fn release(&mut self, group: &str, object: &str) -> bool {
        let group_key = unique_hash(group);
        let reference = format!("{}/{}", group, object);
        let Some(counts) = self.refcounts.get_mut(&group_key) else {
            return false;
        };
        let Some(count) = counts.get_mut(&reference) else {
            return false;
        };
        *count -= 1;
        if *count < 1 {
            counts.remove(&reference);
            if counts.is_empty() {
                self.refcounts.remove(&group_key);
            }
            return true;
        }
        false
    }

    fn persist_object_table(&self, group: &str, table: &ObjectTable) -> Result<()> {
        let path = self.object_table_path(group);
        if table.is_empty() {
            remove_file_if_exists(&path)
        } else {
            write_table(&path, table)
        }
    }

    fn persist_refcounts(&self) -> Result<()> {
        write_table(&self.dir.join(REFCOUNT_INFO_FILE), &self.refcounts)
    }

    fn persist_info(&self) -> Result<()> {
        write_table(&self.dir.join(CACHE_INFO_FILE), &self.info)
    }

    /// Runs once on open: TTL eviction first, then size-bounded pruning of
    /// the oldest entries, five at a time, down to half of `max_size`.
    fn prune(&mut self, options: &CacheOptions) {
        if let Some(ttl) = options.ttl {
            let cutoff = now_ms() - ttl.as_millis() as i64;
            let expired: Vec<String> = self
                .info
                .values()
                .flatten()
                .filter(|(_, ts)| **ts < cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                log::debug!("cache: evicting expired entry {}", key);
                if let Err(e) = self.remove(&key) {
                    log::warn!("cache: failed to evict {}: {}", key, e);
                }
            }
        }

        if self.disk_size() <= options.max_size {
            return;
        }
        let target = options.max_size / 2;
        let mut entries: Vec<(String, i64)> = self
            .info
            .values()
            .flatten()
            .map(|(key, ts)| (key.clone(), *ts))
            .collect();
        entries.sort_by_key(|(_, ts)| *ts);
        let mut entries = entries.into_iter();
        while self.disk_size() > target {
            let chunk: Vec<_> = entries.by_ref().take(PRUNE_CHUNK).collect();
            if chunk.is_empty() {
                break;
            }
            for (key, _) in chunk {
                log::debug!("cache: pruning {} for size", key);
                if let Err(e) = self.remove(&key) {
                    log::warn!("cache: failed to prune {}: {}", key, e);
                }
            }
        }
    }

    fn disk_size(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn read_table<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Tempfile-then-rename write; a crash mid-write leaves the old file intact.
fn write_table<T: serde::Serialize>(path: &Path, table: &T) -> Result<()> {
    let bytes = serde_json::to_vec(table)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

enum Command {
    Save {
        key: String,
        documents: Vec<Document>,
        secret: Option<String>,
        done: oneshot::Sender<Result<()>>,
    },
    Load {
        key: String,
        secret: Option<String>,
        done: oneshot::Sender<Result<Option<Vec<Document>>>>,
    },
    Remove {
        key: String,
        done: oneshot::Sender<Result<()>>,
    },
    Clear {
        done: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the cache worker. Cheap to clone; the worker thread exits when
/// the last handle is dropped.
#[derive(Clone)]
pub struct Cache {
    tx: mpsc::UnboundedSender<Command>,
}

impl Cache {
    /// Opens (or creates) the cache directory for `api_key` and spawns the
    /// worker thread. Pruning runs before the handle is returned usable.
    pub fn open(api_key: &str, options: CacheOptions) -> Result<Self> {
        let root = match options.root.clone() {
            Some(root) => root,
            None => dirs::cache_dir()
                .ok_or_else(|| Error::Other("no platform cache directory".to_string()))?,
        };
        let dir = root.join("larkdb").join(sanitize_dir_name(api_key));

        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        std::thread::Builder::new()
            .name("larkdb-cache".to_string())
            .spawn(move || {
                let mut store = match CacheStore::open(dir, &options) {
                    Ok(store) => store,
                    Err(e) => {
                        log::error!("cache: failed to open: {}", e);
                        return;
                    }
                };
                while let Some(command) = rx.blocking_recv() {
                    run_command(&mut store, command);
                }
            })
            .map_err(|e| Error::Other(format!("failed to spawn cache thread: {}", e)))?;

        Ok(Self { tx })
    }

    /// Stores `documents` as the dataset for `key`.
    pub async fn save_dataset(
        &self,
        key: &str,
        documents: Vec<Document>,
        secret: Option<String>,
    ) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Save { key: key.to_string(), documents, secret, done })
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Loads the dataset stored for `key`, or `None` when absent.
    pub async fn load_dataset(
        &self,
        key: &str,
        secret: Option<String>,
    ) -> Result<Option<Vec<Document>>> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Load { key: key.to_string(), secret, done })
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Drops the dataset stored for `key`.
    pub async fn remove_dataset(&self, key: &str) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Remove { key: key.to_string(), done })
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Deletes every cached dataset and object.
    pub async fn clear(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Clear { done })
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }
}

fn run_command(store: &mut CacheStore, command: Command) {
    match command {
        Command::Save { key, documents, secret, done } => {
            let objects: Vec<CachedObject> = documents
                .iter()
                .filter_map(|doc| {
                    let bytes = encode_document(doc).ok()?;
                    Some(CachedObject {
                        group_id: doc.collection_id.clone(),
                        object_id: doc.id.clone(),
                        bytes,
                    })
                })
                .collect();
            let _ = done.send(store.save(&key, objects, secret.as_deref()));
        }
        Command::Load { key, secret, done } => {
            let result = store.load(&key, secret.as_deref()).map(|datasets| {
                datasets.map(|rows| {
                    rows.iter()
                        .filter_map(|bytes| decode_document(bytes).ok())
                        .collect()
                })
            });
            let _ = done.send(result);
        }
        Command::Remove { key, done } => {
            let _ = done.send(store.remove(&key));
        }
        Command::Clear { done } => {
            let _ = done.send(store.clear());
        }
    }
}

fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let wrapped = serde_json::json!({
        "col-id": doc.collection_id,
        "doc": doc,
    });
    serde_json::to_vec(&wrapped).map_err(Error::from)
}

fn decode_document(bytes: &[u8]) -> Result<Document> {
    let wrapped: serde_json::Value = serde_json::from_slice(bytes)?;
    let col_id = wrapped
        .get("col-id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut doc: Document = serde_json::from_value(
        wrapped
            .get("doc")
            .cloned()
            .ok_or(Error::Other("corrupt cached document".to_string()))?,
    )?;
    doc.collection_id = col_id;
    Ok(doc)
}

fn sanitize_dir_name(api_key: &str) -> String {
    api_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
