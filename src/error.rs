use std::path::PathBuf;
use thiserror::Error;

/// 存储层错误（与后端无关）
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection}: index {index} already exists with different options ({detail})")]
    IndexConflict {
        collection: String,
        index: String,
        detail: String,
    },

    #[error("{collection}: duplicate key on index {index}: {key}")]
    DuplicateKey {
        collection: String,
        index: String,
        key: String,
    },

    #[error("{collection}: index {index} not found")]
    IndexNotFound { collection: String, index: String },

    #[error("collection {0} not found")]
    CollectionNotFound(String),

    #[error("{collection}: invalid document: {reason}")]
    InvalidDocument { collection: String, reason: String },

    #[error("storage unavailable: {0}")]
    Transient(String),

    #[error("snapshot {path:?} rejected: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// 生命周期组件错误：迁移、TTL、种子加载
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{collection}: index {index} conflicts with the live index and could not be replaced ({detail})")]
    SchemaConflict {
        collection: String,
        index: String,
        detail: String,
    },

    #[error("{collection}: unique index {index} is violated by existing data at {key}; deduplicate before migrating")]
    UniquenessViolation {
        collection: String,
        index: String,
        key: String,
    },

    #[error("{collection}: storage error: {source}")]
    TransientStorage {
        collection: String,
        #[source]
        source: StoreError,
    },

    #[error("{collection}: seed record siteid={siteid} collides on unique index {index} at {key}")]
    DuplicateSeedKey {
        collection: String,
        siteid: u32,
        index: String,
        key: String,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid site record #{position}: {reason}")]
    InvalidSite { position: usize, reason: String },

    #[error("malformed seed data: {0}")]
    SeedFormat(#[from] serde_json::Error),

    #[error("invalid retention policy {collection}.{field}: {reason}")]
    InvalidPolicy {
        collection: String,
        field: String,
        reason: String,
    },
}

impl LifecycleError {
    /// 把存储层错误归入生命周期错误分类。冲突与唯一性违例保留原始索引名。
    pub fn from_store(collection: &str, err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey {
                collection,
                index,
                key,
            } => LifecycleError::UniquenessViolation {
                collection,
                index,
                key,
            },
            StoreError::IndexConflict {
                collection,
                index,
                detail,
            } => LifecycleError::SchemaConflict {
                collection,
                index,
                detail,
            },
            other => LifecycleError::TransientStorage {
                collection: collection.to_string(),
                source: other,
            },
        }
    }
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;
