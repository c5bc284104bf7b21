use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use xxhash_rust::xxh3::xxh3_64;

use crate::document::{Document, Filter};
use crate::error::StoreError;
use crate::schema::IndexSpec;
use crate::store::memory::{MemoryStore, StoreState};
use crate::store::{DocumentStore, UpsertOutcome};

/// 快照文件 Header
const MAGIC: u32 = 0x5452_4453; // "TRDS"
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8; // magic + version + state + data_len + checksum

/// 单文件存储：内存语义 + 每次变更后原子落盘。
///
/// 落盘流程：
/// 1) 写 `<path>.tmp` 的 INCOMPLETE header，再写 body
/// 2) seek 回开头覆盖 COMMITTED header（真实 len / xxh3）
/// 3) fsync(tmpfile)
/// 4) rename(tmp, target) 原子替换
/// 5) fsync(dir)
///
/// 加载时校验 magic + version + state + data_len + checksum，任何不一致都拒绝打开，
/// 而不是当作空库继续（空库会让协调器重建全部索引、种子数据丢失）。
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            let state = load_snapshot(&path)?;
            tracing::debug!(
                "Loaded store snapshot {:?}: {} collections",
                path,
                state.collections.len()
            );
            state
        } else {
            tracing::info!("Store snapshot {:?} not found, starting empty", path);
            StoreState::default()
        };
        Ok(Self {
            path,
            inner: MemoryStore::from_state(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// TTL 清理并落盘，返回删除的文档数
    pub fn purge_expired(&self, now: SystemTime) -> Result<usize, StoreError> {
        let purged = self.inner.purge_expired(now);
        if purged > 0 {
            self.persist()?;
        }
        Ok(purged)
    }

    fn persist(&self) -> Result<(), StoreError> {
        write_snapshot(&self.path, &self.inner.state())
    }
}

fn load_snapshot(path: &Path) -> Result<StoreState, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let data = std::fs::read(path)?;
    if data.len() < HEADER_SIZE {
        return Err(corrupt(format!("{} bytes, header needs {}", data.len(), HEADER_SIZE)));
    }

    let u32_at = |off: usize| u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
    let u64_at = |off: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&data[off..off + 8]);
        u64::from_le_bytes(b)
    };

    let magic = u32_at(0);
    let version = u32_at(4);
    let state = u32_at(8);
    let data_len = u64_at(12) as usize;
    let stored_checksum = u64_at(20);

    if magic != MAGIC {
        return Err(corrupt(format!("magic mismatch: {:#x} != {:#x}", magic, MAGIC)));
    }
    if version != VERSION_CURRENT {
        return Err(corrupt(format!("unsupported version {}", version)));
    }
    if state != STATE_COMMITTED {
        return Err(corrupt("snapshot state INCOMPLETE".to_string()));
    }

    let body = &data[HEADER_SIZE..];
    if body.len() != data_len {
        return Err(corrupt(format!(
            "data length mismatch: {} != {}",
            body.len(),
            data_len
        )));
    }
    let computed = xxh3_64(body);
    if computed != stored_checksum {
        return Err(corrupt(format!(
            "checksum mismatch: {:#x} != {:#x}",
            computed, stored_checksum
        )));
    }

    Ok(serde_json::from_slice(body)?)
}

fn header(state: u32, data_len: u64, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    h[8..12].copy_from_slice(&state.to_le_bytes());
    h[12..20].copy_from_slice(&data_len.to_le_bytes());
    h[20..28].copy_from_slice(&checksum.to_le_bytes());
    h
}

fn write_snapshot(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let body = serde_json::to_vec(state)?;
    let checksum = xxh3_64(&body);
    let tmp_path = path.with_extension("tmp");

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&header(STATE_INCOMPLETE, 0, 0))?;
    file.write_all(&body)?;

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header(STATE_COMMITTED, body.len() as u64, checksum))?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    tracing::debug!(
        "Store snapshot written: {} collections, {} bytes",
        state.collections.len(),
        HEADER_SIZE + body.len()
    );
    Ok(())
}

impl DocumentStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    fn create_collection(&self, name: &str) -> Result<bool, StoreError> {
        let created = self.inner.create_collection(name)?;
        if created {
            self.persist()?;
        }
        Ok(created)
    }

    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_collections()
    }

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        self.inner.list_indexes(collection)
    }

    fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        self.inner.create_index(collection, index)?;
        self.persist()
    }

    fn drop_index(&self, collection: &str, name: &str) -> Result<(), StoreError> {
        self.inner.drop_index(collection, name)?;
        self.persist()
    }

    fn insert(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        let id = self.inner.insert(collection, doc)?;
        self.persist()?;
        Ok(id)
    }

    fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Document,
    ) -> Result<UpsertOutcome, StoreError> {
        let outcome = self.inner.upsert(collection, filter, doc)?;
        self.persist()?;
        Ok(outcome)
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        self.inner.find(collection, filter)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let n = self.inner.delete_many(collection, filter)?;
        if n > 0 {
            self.persist()?;
        }
        Ok(n)
    }
}
