use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};
use crate::reconcile::{IndexReconciler, IndexState};
use crate::schema::{Catalog, IndexSpec, MAX_EXPIRE_AFTER_SECS};
use crate::store::DocumentStore;

/// 默认保留期：10 天
pub const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 10;

/// TTL 索引名由字段确定（沿用现网：索引名即字段路径）
pub fn ttl_index_name(field: &str) -> String {
    field.to_string()
}

/// 保留策略：集合 + 过期字段 + 时长（秒）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub collection: String,
    pub field: String,
    pub duration_secs: u64,
}

impl RetentionPolicy {
    pub fn new(collection: &str, field: &str, duration_secs: u64) -> Self {
        Self {
            collection: collection.to_string(),
            field: field.to_string(),
            duration_secs,
        }
    }

    pub fn index_spec(&self) -> IndexSpec {
        IndexSpec::ttl(&self.field, self.duration_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| LifecycleError::InvalidPolicy {
            collection: self.collection.clone(),
            field: self.field.clone(),
            reason: reason.to_string(),
        };
        if self.collection.trim().is_empty() {
            return Err(invalid("empty collection name"));
        }
        if self.field.trim().is_empty() {
            return Err(invalid("empty field"));
        }
        if self.field == crate::document::ID_FIELD {
            return Err(invalid("cannot expire on _id"));
        }
        if self.duration_secs > MAX_EXPIRE_AFTER_SECS {
            return Err(invalid("duration exceeds the 32-bit expireAfterSeconds limit"));
        }
        Ok(())
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} = {}s", self.collection, self.field, self.duration_secs)
    }
}

/// 现网默认策略：tracks / activity 按 time，notices 按 etime
pub fn default_policies() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy::new("tracks", "time", DEFAULT_RETENTION_SECS),
        RetentionPolicy::new("activity", "time", DEFAULT_RETENTION_SECS),
        RetentionPolicy::new("notices", "etime", DEFAULT_RETENTION_SECS),
    ]
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TtlOutcome {
    Created,
    Unchanged,
    /// 旧索引按名删除后重建；`previous` 为旧的 expireAfterSeconds（非 TTL 索引为 None）
    Updated { previous: Option<u64> },
}

impl fmt::Display for TtlOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtlOutcome::Created => write!(f, "created"),
            TtlOutcome::Unchanged => write!(f, "unchanged"),
            TtlOutcome::Updated { previous: Some(s) } => write!(f, "updated (was {}s)", s),
            TtlOutcome::Updated { previous: None } => write!(f, "updated (was not a TTL index)"),
        }
    }
}

/// TTL 管理器：数据库不支持原地修改 expireAfterSeconds，时长变化只能 drop + create。
///
/// 每次启动调用都安全；时长不变时没有任何副作用。
/// 存储错误直接上抛，不在内部重试。
pub struct TtlManager<'a, S: DocumentStore + ?Sized> {
    reconciler: IndexReconciler<'a, S>,
    /// 集合 -> 声明索引名；这些索引与 TTL 同键时不会被当作影子删除
    declared: HashMap<String, Vec<String>>,
}

impl<'a, S: DocumentStore + ?Sized> TtlManager<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            reconciler: IndexReconciler::new(store),
            declared: HashMap::new(),
        }
    }

    /// 保护声明表中的索引
    pub fn with_catalog(mut self, catalog: &Catalog) -> Self {
        self.declared = catalog
            .collections
            .iter()
            .map(|c| {
                let names: Vec<String> = c.indexes.iter().map(|i| i.name.clone()).collect();
                (c.name.clone(), names)
            })
            .collect();
        self
    }

    pub fn ensure_ttl(&self, collection: &str, field: &str, duration_secs: u64) -> Result<TtlOutcome> {
        let policy = RetentionPolicy::new(collection, field, duration_secs);
        policy.validate()?;

        let keep: Vec<&str> = self
            .declared
            .get(collection)
            .map(|names| names.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let outcome = match self
            .reconciler
            .ensure_index_keeping(collection, &policy.index_spec(), &keep)?
        {
            IndexState::Absent => TtlOutcome::Created,
            IndexState::PresentMatching => TtlOutcome::Unchanged,
            IndexState::PresentConflicting { live, .. } => TtlOutcome::Updated {
                previous: live.options.expire_after_seconds,
            },
        };
        match &outcome {
            TtlOutcome::Unchanged => tracing::debug!("TTL {}: unchanged", policy),
            other => tracing::info!("TTL {}: {}", policy, other),
        }
        Ok(outcome)
    }

    /// 按表应用全部策略；遇到第一个错误即停止
    pub fn apply(&self, policies: &[RetentionPolicy]) -> Result<Vec<(RetentionPolicy, TtlOutcome)>> {
        for p in policies {
            p.validate()?;
        }
        policies
            .iter()
            .map(|p| {
                self.ensure_ttl(&p.collection, &p.field, p.duration_secs)
                    .map(|o| (p.clone(), o))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::KeyPattern;
    use crate::store::MemoryStore;

    #[test]
    fn duration_change_replaces_index_in_place_by_name() {
        let store = MemoryStore::new();
        let ttl = TtlManager::new(&store);

        assert_eq!(ttl.ensure_ttl("tracks", "time", 3600).unwrap(), TtlOutcome::Created);
        assert_eq!(ttl.ensure_ttl("tracks", "time", 3600).unwrap(), TtlOutcome::Unchanged);
        assert_eq!(
            ttl.ensure_ttl("tracks", "time", 7200).unwrap(),
            TtlOutcome::Updated {
                previous: Some(3600)
            }
        );

        let live = store.list_indexes("tracks").unwrap();
        let on_time: Vec<_> = live
            .iter()
            .filter(|i| i.key.single_field() == Some("time"))
            .collect();
        assert_eq!(on_time.len(), 1);
        assert_eq!(on_time[0].name, ttl_index_name("time"));
        assert_eq!(on_time[0].options.expire_after_seconds, Some(7200));
    }

    #[test]
    fn plain_index_with_same_name_becomes_ttl() {
        let store = MemoryStore::new();
        store
            .create_index(
                "activity",
                &IndexSpec::new("time", KeyPattern::new().asc("time")).background(),
            )
            .unwrap();
        let outcome = TtlManager::new(&store)
            .ensure_ttl("activity", "time", DEFAULT_RETENTION_SECS)
            .unwrap();
        assert_eq!(outcome, TtlOutcome::Updated { previous: None });
    }

    #[test]
    fn default_table_applies_cleanly_and_rejects_bad_policies() {
        let store = MemoryStore::new();
        let ttl = TtlManager::new(&store);
        let results = ttl.apply(&default_policies()).unwrap();
        assert!(results.iter().all(|(_, o)| *o == TtlOutcome::Created));
        assert_eq!(store.list_indexes("notices").unwrap()[0].name, "etime");

        let err = ttl.ensure_ttl("tracks", "_id", 10).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidPolicy { .. }));
        assert!(ttl
            .ensure_ttl("tracks", "time", MAX_EXPIRE_AFTER_SECS + 1)
            .is_err());
    }

    #[test]
    fn declared_index_on_same_key_is_not_dropped() {
        let store = MemoryStore::new();
        let declared = IndexSpec::new("time_1", KeyPattern::new().asc("time"));
        store.create_index("request", &declared).unwrap();
        let catalog = Catalog::new("trident")
            .with_collection(crate::schema::CollectionSpec::new("request").with_index(declared));

        let err = TtlManager::new(&store)
            .with_catalog(&catalog)
            .ensure_ttl("request", "time", 3600)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::SchemaConflict { .. }));
        let live = store.list_indexes("request").unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "time_1");

        // 不在声明表里的同键索引仍按影子处理
        let outcome = TtlManager::new(&store).ensure_ttl("request", "time", 3600).unwrap();
        assert_eq!(outcome, TtlOutcome::Created);
        assert_eq!(store.list_indexes("request").unwrap()[0].name, "time");
    }
}
