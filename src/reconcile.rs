use std::collections::HashSet;
use std::fmt;

use crate::error::{LifecycleError, Result, StoreError};
use crate::schema::{Catalog, CollectionSpec, IndexSpec, ID_INDEX_NAME};
use crate::store::DocumentStore;

/// 声明索引相对线上目录的状态（按名字识别）
#[derive(Clone, Debug, PartialEq)]
pub enum IndexState {
    Absent,
    PresentMatching,
    PresentConflicting {
        live: IndexSpec,
        differences: Vec<String>,
    },
}

/// 单步迁移动作
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    Keep(String),
    Create(IndexSpec),
    /// present-conflicting -> absent (drop) -> present-matching (create)
    Recreate {
        live: IndexSpec,
        declared: IndexSpec,
        differences: Vec<String>,
    },
    /// 未声明、但与声明索引同键的线上索引，会阻止声明索引创建
    DropShadow { live: String, declared: String },
    /// prune 模式下删除未声明索引
    Prune(String),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Keep(name) => write!(f, "keep      {}", name),
            Step::Create(spec) => write!(f, "create    {}", spec),
            Step::Recreate {
                declared,
                differences,
                ..
            } => write!(f, "recreate  {} ({})", declared, differences.join("; ")),
            Step::DropShadow { live, declared } => {
                write!(f, "drop      {} (same key as declared {})", live, declared)
            }
            Step::Prune(name) => write!(f, "drop      {} (undeclared)", name),
        }
    }
}

/// 一个集合的迁移计划（dry run 时只打印不执行）
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcilePlan {
    pub collection: String,
    pub create_collection: bool,
    pub steps: Vec<Step>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        !self.create_collection && self.steps.iter().all(|s| matches!(s, Step::Keep(_)))
    }
}

impl fmt::Display for ReconcilePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.create_collection {
            writeln!(f, "{}: create collection", self.collection)?;
        }
        for step in &self.steps {
            writeln!(f, "{}: {}", self.collection, step)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileReport {
    pub collection: String,
    pub collection_created: bool,
    pub created: Vec<String>,
    pub recreated: Vec<String>,
    pub dropped: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileReport {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Default::default()
        }
    }

    pub fn changed(&self) -> bool {
        self.collection_created
            || !self.created.is_empty()
            || !self.recreated.is_empty()
            || !self.dropped.is_empty()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} created, {} recreated, {} dropped, {} unchanged",
            self.collection,
            self.created.len(),
            self.recreated.len(),
            self.dropped.len(),
            self.unchanged.len()
        )?;
        if self.collection_created {
            write!(f, " (new collection)")?;
        }
        Ok(())
    }
}

/// 按名字在线上目录中给声明索引定位状态
pub fn classify(declared: &IndexSpec, live: &[IndexSpec]) -> IndexState {
    match live.iter().find(|l| l.name == declared.name) {
        None => IndexState::Absent,
        Some(l) => {
            let differences = declared.differences(l);
            if differences.is_empty() {
                IndexState::PresentMatching
            } else {
                IndexState::PresentConflicting {
                    live: l.clone(),
                    differences,
                }
            }
        }
    }
}

fn plan_index(declared: &IndexSpec, live: &[IndexSpec], declared_names: &HashSet<&str>) -> (Vec<Step>, Step) {
    let state = classify(declared, live);
    let mut drops = Vec::new();
    if state != IndexState::PresentMatching {
        for shadow in live.iter().filter(|l| {
            l.name != declared.name
                && !declared_names.contains(l.name.as_str())
                && l.key.equivalent(&declared.key)
        }) {
            drops.push(Step::DropShadow {
                live: shadow.name.clone(),
                declared: declared.name.clone(),
            });
        }
    }
    let step = match state {
        IndexState::Absent => Step::Create(declared.clone()),
        IndexState::PresentMatching => Step::Keep(declared.name.clone()),
        IndexState::PresentConflicting { live, differences } => Step::Recreate {
            live,
            declared: declared.clone(),
            differences,
        },
    };
    (drops, step)
}

/// 索引协调器：确保每个声明索引以声明的选项存在。
///
/// 顺序执行、不加锁；同一数据库上同时只能有一个协调器在跑。
pub struct IndexReconciler<'a, S: DocumentStore + ?Sized> {
    store: &'a S,
    prune: bool,
}

impl<'a, S: DocumentStore + ?Sized> IndexReconciler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            prune: false,
        }
    }

    /// 删除未声明的线上索引（`_id_` 除外）
    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// 计算迁移计划，不做任何修改
    pub fn plan(&self, spec: &CollectionSpec) -> Result<ReconcilePlan> {
        let name = spec.name.as_str();
        let exists = self
            .store
            .list_collections()
            .map_err(|e| LifecycleError::from_store(name, e))?
            .iter()
            .any(|c| c == name);
        let live = if exists {
            self.store
                .list_indexes(name)
                .map_err(|e| LifecycleError::from_store(name, e))?
        } else {
            Vec::new()
        };

        let declared_names: HashSet<&str> = spec.indexes.iter().map(|i| i.name.as_str()).collect();
        let mut drops = Vec::new();
        let mut builds = Vec::new();
        for declared in &spec.indexes {
            let (mut d, step) = plan_index(declared, &live, &declared_names);
            drops.append(&mut d);
            builds.push(step);
        }
        if self.prune {
            let scheduled: HashSet<String> = drops
                .iter()
                .filter_map(|s| match s {
                    Step::DropShadow { live, .. } => Some(live.clone()),
                    _ => None,
                })
                .collect();
            for l in &live {
                if l.name != ID_INDEX_NAME
                    && !declared_names.contains(l.name.as_str())
                    && !scheduled.contains(&l.name)
                {
                    drops.push(Step::Prune(l.name.clone()));
                }
            }
        }
        // 同一个影子索引可能挡住多个声明索引（理论上声明层已排除），只删一次
        let mut seen = HashSet::new();
        drops.retain(|s| match s {
            Step::DropShadow { live, .. } | Step::Prune(live) => seen.insert(live.clone()),
            _ => true,
        });

        drops.extend(builds);
        Ok(ReconcilePlan {
            collection: spec.name.clone(),
            create_collection: !exists,
            steps: drops,
        })
    }

    /// 执行计划。先删后建；任何致命错误立即返回。
    pub fn apply(&self, plan: &ReconcilePlan) -> Result<ReconcileReport> {
        let coll = plan.collection.as_str();
        let fail = |e: StoreError| LifecycleError::from_store(coll, e);
        let mut report = ReconcileReport::new(coll);

        if plan.create_collection {
            report.collection_created = self.store.create_collection(coll).map_err(fail)?;
            if report.collection_created {
                tracing::info!("{}: collection created", coll);
            }
        }

        for step in &plan.steps {
            match step {
                Step::Keep(name) => {
                    tracing::debug!("{}: index {} up to date", coll, name);
                    report.unchanged.push(name.clone());
                }
                Step::Create(spec) => {
                    self.create(coll, spec)?;
                    tracing::info!("{}: index created: {}", coll, spec);
                    report.created.push(spec.name.clone());
                }
                Step::Recreate {
                    live,
                    declared,
                    differences,
                } => {
                    tracing::warn!(
                        "{}: index {} differs from declaration ({}), dropping and recreating",
                        coll,
                        live.name,
                        differences.join("; ")
                    );
                    self.store.drop_index(coll, &live.name).map_err(fail)?;
                    if let Err(e) = self.create(coll, declared) {
                        self.restore(coll, live);
                        return Err(e);
                    }
                    report.recreated.push(declared.name.clone());
                }
                Step::DropShadow { live, declared } => {
                    tracing::warn!(
                        "{}: dropping index {} that shadows declared index {}",
                        coll,
                        live,
                        declared
                    );
                    self.store.drop_index(coll, live).map_err(fail)?;
                    report.dropped.push(live.clone());
                }
                Step::Prune(name) => {
                    tracing::info!("{}: dropping undeclared index {}", coll, name);
                    self.store.drop_index(coll, name).map_err(fail)?;
                    report.dropped.push(name.clone());
                }
            }
        }
        Ok(report)
    }

    /// 建索引；若仍被拒为“同名不同选项”（计划之后被其他写者改过），按名删除后重建一次
    fn create(&self, coll: &str, spec: &IndexSpec) -> Result<()> {
        match self.store.create_index(coll, spec) {
            Ok(()) => Ok(()),
            Err(StoreError::IndexConflict { detail, .. }) => {
                tracing::warn!(
                    "{}: create {} rejected ({}), dropping by name and retrying",
                    coll,
                    spec.name,
                    detail
                );
                match self.store.drop_index(coll, &spec.name) {
                    Ok(()) => {}
                    Err(StoreError::IndexNotFound { .. }) => {
                        // 冲突来自别名索引，按名删除无从下手
                        return Err(LifecycleError::SchemaConflict {
                            collection: coll.to_string(),
                            index: spec.name.clone(),
                            detail,
                        });
                    }
                    Err(e) => return Err(LifecycleError::from_store(coll, e)),
                }
                self.store
                    .create_index(coll, spec)
                    .map_err(|e| LifecycleError::from_store(coll, e))
            }
            Err(e) => Err(LifecycleError::from_store(coll, e)),
        }
    }

    /// 重建失败后尽力恢复原索引，恢复失败只记日志，调用方返回原错误
    fn restore(&self, coll: &str, live: &IndexSpec) {
        match self.store.create_index(coll, live) {
            Ok(()) => tracing::warn!("{}: restored previous index {}", coll, live),
            Err(e) => tracing::error!(
                "{}: failed to restore previous index {}: {}",
                coll,
                live.name,
                e
            ),
        }
    }

    /// 协调单个集合：建集合 -> 计划 -> 执行
    pub fn reconcile(&self, spec: &CollectionSpec) -> Result<ReconcileReport> {
        spec.validate()?;
        let plan = self.plan(spec)?;
        let report = self.apply(&plan)?;
        if report.changed() {
            tracing::info!("{}", report);
        } else {
            tracing::debug!("{}", report);
        }
        Ok(report)
    }

    /// 协调整个声明表
    pub fn reconcile_catalog(&self, catalog: &Catalog) -> Result<Vec<ReconcileReport>> {
        catalog.validate()?;
        tracing::info!(
            "Reconciling {} collections in {} ({} backend)",
            catalog.collections.len(),
            catalog.database,
            self.store.backend()
        );
        catalog
            .collections
            .iter()
            .map(|spec| self.reconcile(spec))
            .collect()
    }

    pub fn plan_catalog(&self, catalog: &Catalog) -> Result<Vec<ReconcilePlan>> {
        catalog.validate()?;
        catalog.collections.iter().map(|spec| self.plan(spec)).collect()
    }

    /// 确保单个索引存在且一致（TTL 管理器复用），返回执行前的状态
    pub fn ensure_index(&self, collection: &str, declared: &IndexSpec) -> Result<IndexState> {
        self.ensure_index_keeping(collection, declared, &[])
    }

    /// 同 `ensure_index`，`keep` 中的索引即使与 `declared` 同键也不当作影子删除。
    ///
    /// 同键不同名的受保护索引会让建索引失败并报 `SchemaConflict`。
    pub fn ensure_index_keeping(
        &self,
        collection: &str,
        declared: &IndexSpec,
        keep: &[&str],
    ) -> Result<IndexState> {
        declared
            .validate()
            .map_err(|e| LifecycleError::InvalidSchema(format!("{}: {}", collection, e)))?;
        self.store
            .create_collection(collection)
            .map_err(|e| LifecycleError::from_store(collection, e))?;
        let live = self
            .store
            .list_indexes(collection)
            .map_err(|e| LifecycleError::from_store(collection, e))?;

        let names: HashSet<&str> = std::iter::once(declared.name.as_str())
            .chain(keep.iter().copied())
            .collect();
        let state = classify(declared, &live);
        let (mut steps, step) = plan_index(declared, &live, &names);
        steps.push(step);
        self.apply(&ReconcilePlan {
            collection: collection.to_string(),
            create_collection: false,
            steps,
        })?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, Filter};
    use crate::schema::{trident, KeyPattern};
    use crate::store::{MemoryStore, UpsertOutcome};
    use crate::ttl::default_policies;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn index_names(store: &MemoryStore, coll: &str) -> Vec<String> {
        let mut v: Vec<String> = store
            .list_indexes(coll)
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        v.sort();
        v
    }

    #[test]
    fn reconciling_twice_is_idempotent() {
        let store = MemoryStore::new();
        let catalog = trident::catalog().with_retention(&default_policies());
        let reconciler = IndexReconciler::new(&store);

        let first = reconciler.reconcile_catalog(&catalog).unwrap();
        assert!(first.iter().any(|r| r.changed()));
        let before = store.state();

        let second = reconciler.reconcile_catalog(&catalog).unwrap();
        assert!(second.iter().all(|r| !r.changed()), "{:?}", second);
        for (name, coll) in &before.collections {
            assert_eq!(store.list_indexes(name).unwrap(), coll.indexes);
        }
        assert!(reconciler
            .plan_catalog(&catalog)
            .unwrap()
            .iter()
            .all(|p| p.is_noop()));
    }

    #[test]
    fn conflicting_options_are_dropped_and_recreated() {
        let store = MemoryStore::new();
        store
            .create_index("tracks", &IndexSpec::new("time", KeyPattern::new().asc("time")))
            .unwrap();

        let spec = CollectionSpec::new("tracks").with_index(IndexSpec::ttl("time", 864_000));
        let report = IndexReconciler::new(&store).reconcile(&spec).unwrap();
        assert_eq!(report.recreated, vec!["time".to_string()]);
        let live = store.list_indexes("tracks").unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].options.expire_after_seconds, Some(864_000));
    }

    #[test]
    fn unique_violation_aborts_and_leaves_no_index() {
        let store = MemoryStore::new();
        store.create_collection("sites").unwrap();
        store.insert("sites", doc(json!({"siteid": 1, "name": "Vagrant"}))).unwrap();
        store.insert("sites", doc(json!({"siteid": 2, "name": "Vagrant"}))).unwrap();

        let spec = trident::catalog().collection("sites").cloned().unwrap();
        let err = IndexReconciler::new(&store).reconcile(&spec).unwrap_err();
        match err {
            LifecycleError::UniquenessViolation { collection, index, .. } => {
                assert_eq!(collection, "sites");
                assert_eq!(index, "nameUnique");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!index_names(&store, "sites").contains(&"nameUnique".to_string()));
    }

    #[test]
    fn shadowing_index_is_replaced_by_declared_name() {
        let store = MemoryStore::new();
        store
            .create_index("sites", &IndexSpec::new("name_1", KeyPattern::new().asc("name")))
            .unwrap();

        let spec = CollectionSpec::new("sites")
            .with_index(IndexSpec::new("nameUnique", KeyPattern::new().asc("name")).unique());
        let report = IndexReconciler::new(&store).reconcile(&spec).unwrap();
        assert_eq!(report.dropped, vec!["name_1".to_string()]);
        assert_eq!(report.created, vec!["nameUnique".to_string()]);
        assert_eq!(index_names(&store, "sites"), vec!["nameUnique".to_string()]);
    }

    #[test]
    fn prune_is_opt_in() {
        let store = MemoryStore::new();
        store
            .create_index("notices", &IndexSpec::new("legacy", KeyPattern::new().asc("old")))
            .unwrap();
        let spec = CollectionSpec::new("notices")
            .with_index(IndexSpec::new("ctime", KeyPattern::new().asc("ctime")).background());

        IndexReconciler::new(&store).reconcile(&spec).unwrap();
        assert_eq!(index_names(&store, "notices"), vec!["ctime", "legacy"]);

        let report = IndexReconciler::new(&store)
            .with_prune(true)
            .reconcile(&spec)
            .unwrap();
        assert_eq!(report.dropped, vec!["legacy".to_string()]);
        assert_eq!(index_names(&store, "notices"), vec!["ctime"]);
    }

    #[test]
    fn dry_run_plan_does_not_mutate() {
        let store = MemoryStore::new();
        let spec = trident::catalog().collection("vessels").cloned().unwrap();
        let plan = IndexReconciler::new(&store).plan(&spec).unwrap();
        assert!(plan.create_collection);
        assert_eq!(plan.steps.len(), 3);
        assert!(store.list_collections().unwrap().is_empty());
        assert!(plan.to_string().contains("create    deviceid-type"));
    }

    #[test]
    fn partial_unique_index_admits_documents_without_field() {
        let store = MemoryStore::new();
        let spec = trident::catalog().collection("devices").cloned().unwrap();
        IndexReconciler::new(&store).reconcile(&spec).unwrap();

        store.insert("devices", doc(json!({"deviceid": "1", "type": "ais"}))).unwrap();
        store.insert("devices", doc(json!({"deviceid": "2", "type": "ais"}))).unwrap();
        assert_eq!(store.count("devices", &Filter::all()).unwrap(), 2);
    }

    /// 列索引时看不到线上索引的存储，用来触发“创建被拒 -> 按名删除重建”
    struct StaleCatalog(MemoryStore);

    impl DocumentStore for StaleCatalog {
        fn backend(&self) -> &'static str {
            "stale"
        }
        fn create_collection(&self, name: &str) -> std::result::Result<bool, StoreError> {
            self.0.create_collection(name)
        }
        fn list_collections(&self) -> std::result::Result<Vec<String>, StoreError> {
            self.0.list_collections()
        }
        fn list_indexes(&self, _collection: &str) -> std::result::Result<Vec<IndexSpec>, StoreError> {
            Ok(Vec::new())
        }
        fn create_index(&self, c: &str, i: &IndexSpec) -> std::result::Result<(), StoreError> {
            self.0.create_index(c, i)
        }
        fn drop_index(&self, c: &str, n: &str) -> std::result::Result<(), StoreError> {
            self.0.drop_index(c, n)
        }
        fn insert(&self, c: &str, d: Document) -> std::result::Result<String, StoreError> {
            self.0.insert(c, d)
        }
        fn upsert(&self, c: &str, f: &Filter, d: Document) -> std::result::Result<UpsertOutcome, StoreError> {
            self.0.upsert(c, f, d)
        }
        fn find(&self, c: &str, f: &Filter) -> std::result::Result<Vec<Document>, StoreError> {
            self.0.find(c, f)
        }
        fn delete_many(&self, c: &str, f: &Filter) -> std::result::Result<u64, StoreError> {
            self.0.delete_many(c, f)
        }
    }

    #[test]
    fn rejected_create_falls_back_to_drop_and_recreate() {
        let inner = MemoryStore::new();
        inner.create_index("activity", &IndexSpec::ttl("time", 60)).unwrap();
        let store = StaleCatalog(inner);

        let spec = CollectionSpec::new("activity").with_index(IndexSpec::ttl("time", 120));
        let report = IndexReconciler::new(&store).reconcile(&spec).unwrap();
        assert_eq!(report.created, vec!["time".to_string()]);
        let live = store.0.list_indexes("activity").unwrap();
        assert_eq!(live[0].options.expire_after_seconds, Some(120));
    }

    #[test]
    fn failed_unique_upgrade_restores_previous_index() {
        let store = MemoryStore::new();
        let plain = IndexSpec::new(
            "activity_id_time",
            KeyPattern::new().asc("activity_id").asc("time"),
        );
        store.create_index("activity", &plain).unwrap();
        for _ in 0..2 {
            store
                .insert("activity", doc(json!({"activity_id": 7, "time": 1000})))
                .unwrap();
        }

        let spec = CollectionSpec::new("activity").with_index(plain.clone().unique());
        let err = IndexReconciler::new(&store).reconcile(&spec).unwrap_err();
        assert!(matches!(err, LifecycleError::UniquenessViolation { ref index, .. } if index == "activity_id_time"));

        let live = store.list_indexes("activity").unwrap();
        assert_eq!(live.len(), 1);
        assert!(plain.matches(&live[0]));
    }

    /// 建/删索引一律返回连接错误，并记录调用次数
    struct Unreachable {
        inner: MemoryStore,
        creates: std::cell::Cell<usize>,
        drops: std::cell::Cell<usize>,
    }

    impl Unreachable {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                creates: std::cell::Cell::new(0),
                drops: std::cell::Cell::new(0),
            }
        }
    }

    impl DocumentStore for Unreachable {
        fn backend(&self) -> &'static str {
            "unreachable"
        }
        fn create_collection(&self, name: &str) -> std::result::Result<bool, StoreError> {
            self.inner.create_collection(name)
        }
        fn list_collections(&self) -> std::result::Result<Vec<String>, StoreError> {
            self.inner.list_collections()
        }
        fn list_indexes(&self, c: &str) -> std::result::Result<Vec<IndexSpec>, StoreError> {
            self.inner.list_indexes(c)
        }
        fn create_index(&self, _c: &str, _i: &IndexSpec) -> std::result::Result<(), StoreError> {
            self.creates.set(self.creates.get() + 1);
            Err(StoreError::Transient("connection reset by peer".into()))
        }
        fn drop_index(&self, _c: &str, _n: &str) -> std::result::Result<(), StoreError> {
            self.drops.set(self.drops.get() + 1);
            Err(StoreError::Transient("connection reset by peer".into()))
        }
        fn insert(&self, c: &str, d: Document) -> std::result::Result<String, StoreError> {
            self.inner.insert(c, d)
        }
        fn upsert(&self, c: &str, f: &Filter, d: Document) -> std::result::Result<UpsertOutcome, StoreError> {
            self.inner.upsert(c, f, d)
        }
        fn find(&self, c: &str, f: &Filter) -> std::result::Result<Vec<Document>, StoreError> {
            self.inner.find(c, f)
        }
        fn delete_many(&self, c: &str, f: &Filter) -> std::result::Result<u64, StoreError> {
            self.inner.delete_many(c, f)
        }
    }

    #[test]
    fn transient_errors_surface_without_retry() {
        let store = Unreachable::new(MemoryStore::new());
        let spec = trident::catalog().collection("sites").cloned().unwrap();
        let err = IndexReconciler::new(&store).reconcile(&spec).unwrap_err();
        assert!(matches!(err, LifecycleError::TransientStorage { ref collection, .. } if collection == "sites"));
        assert_eq!(store.creates.get(), 1);
        assert_eq!(store.drops.get(), 0);
    }

    #[test]
    fn transient_drop_during_ttl_update_is_not_retried() {
        let inner = MemoryStore::new();
        inner.create_index("tracks", &IndexSpec::ttl("time", 60)).unwrap();
        let store = Unreachable::new(inner);

        let err = crate::ttl::TtlManager::new(&store)
            .ensure_ttl("tracks", "time", 120)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::TransientStorage { ref collection, .. } if collection == "tracks"));
        assert_eq!(store.drops.get(), 1);
        assert_eq!(store.creates.get(), 0);
        assert_eq!(
            store.inner.list_indexes("tracks").unwrap()[0].options.expire_after_seconds,
            Some(60)
        );
    }
}
