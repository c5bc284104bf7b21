use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::error::{LifecycleError, StoreError};
use crate::schema::trident;
use crate::store::{DocumentStore, FileStore, MemoryStore};
use crate::ttl::{default_policies, RetentionPolicy};

const APP_DIR: &str = "trident-lifecycle";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_STORE_FILE: &str = "trident-store.json";
const DEFAULT_MONGO_URI: &str = "mongodb://localhost:27017";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Policy(#[from] LifecycleError),

    #[error("failed to open store: {0}")]
    Store(#[from] StoreError),

    #[error("backend {0} is not compiled in (enable the `mongo` feature)")]
    BackendUnavailable(&'static str),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    #[default]
    File,
    Mongo,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: Backend,
    /// file 后端的快照路径
    pub path: PathBuf,
    /// mongo 后端连接串
    pub uri: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            path: PathBuf::from(DEFAULT_STORE_FILE),
            uri: DEFAULT_MONGO_URI.to_string(),
        }
    }
}

/// 运行配置。缺省值即现网部署的取值。
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: String,
    pub store: StoreConfig,
    /// 非空时整体替换默认保留表
    pub retention: Vec<RetentionPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: trident::DATABASE.to_string(),
            store: StoreConfig::default(),
            retention: default_policies(),
        }
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/trident-lifecycle/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
    }

    /// 读取配置；未显式指定且默认位置不存在时返回缺省配置
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };
        if !explicit && !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let cfg = Self::from_toml_str(&text)?;
        tracing::debug!("Loaded config {:?}", path);
        Ok(cfg)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config = toml::from_str(text)?;
        if cfg.retention.is_empty() {
            cfg.retention = default_policies();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for p in &self.retention {
            p.validate()?;
        }
        Ok(())
    }
}

/// 按配置打开存储后端
pub fn open_store(cfg: &Config) -> Result<Box<dyn DocumentStore>, ConfigError> {
    let store: Box<dyn DocumentStore> = match cfg.store.backend {
        Backend::Memory => Box::new(MemoryStore::new()),
        Backend::File => Box::new(FileStore::open(&cfg.store.path)?),
        #[cfg(feature = "mongo")]
        Backend::Mongo => Box::new(
            crate::store::MongoStore::connect(&cfg.store.uri, &cfg.database)?,
        ),
        #[cfg(not(feature = "mongo"))]
        Backend::Mongo => return Err(ConfigError::BackendUnavailable("mongo")),
    };
    tracing::info!("Using {} store", store.backend());
    Ok(store)
}
