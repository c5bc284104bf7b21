use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{index_values, Document, Filter, ID_FIELD};
use crate::error::StoreError;
use crate::schema::{IndexKey, IndexSpec, ID_INDEX_NAME};
use crate::store::{new_identifier, DocumentStore, UpsertOutcome};

/// 单个集合的状态：索引目录 + 文档
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectionState {
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub documents: Vec<Document>,
}

/// 整个数据库的状态（FileStore 直接序列化它）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionState>,
}

/// 内存存储：与数据库一致的索引语义（唯一 / sparse / partial filter / multikey / TTL）
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// 当前状态的副本
    pub fn state(&self) -> StoreState {
        self.state.lock().clone()
    }

    /// TTL 清理：删除 TTL 字段（epoch 毫秒）早于 `now - expireAfterSeconds` 的文档。
    ///
    /// 数组字段按最早的时间点计算；非数值字段不会过期。
    pub fn purge_expired(&self, now: SystemTime) -> usize {
        let now_ms = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let mut state = self.state.lock();
        let mut purged = 0usize;
        for (name, coll) in state.collections.iter_mut() {
            let rules: Vec<(String, i64)> = coll
                .indexes
                .iter()
                .filter_map(|i| {
                    let secs = i.options.expire_after_seconds?;
                    let field = i.key.single_field()?;
                    let ttl_ms = i64::try_from(secs).ok()?.checked_mul(1000)?;
                    Some((field.to_string(), ttl_ms))
                })
                .collect();
            if rules.is_empty() {
                continue;
            }
            let before = coll.documents.len();
            coll.documents.retain(|doc| {
                !rules.iter().any(|(field, ttl_ms)| {
                    index_values(doc, field)
                        .iter()
                        .filter_map(|v| v.as_i64())
                        .min()
                        .and_then(|t| t.checked_add(*ttl_ms))
                        .map(|expires| expires <= now_ms)
                        .unwrap_or(false)
                })
            });
            let removed = before - coll.documents.len();
            if removed > 0 {
                tracing::debug!("{}: expired {} documents", name, removed);
            }
            purged += removed;
        }
        purged
    }
}

/// 文档在某索引上的全部键（multikey 做笛卡尔积）。空表示该文档不进入索引。
fn index_entries(index: &IndexSpec, doc: &Document) -> Vec<Vec<Value>> {
    if let Some(filter) = &index.options.partial_filter_expression {
        if !filter.matches(doc) {
            return Vec::new();
        }
    }
    let per_field: Vec<Vec<Value>> = index
        .key
        .fields()
        .filter(|(_, k)| *k != IndexKey::Text)
        .map(|(f, _)| index_values(doc, f))
        .collect();
    if index.options.sparse && per_field.iter().all(|v| v.is_empty()) {
        return Vec::new();
    }

    let mut combos: Vec<Vec<Value>> = vec![Vec::new()];
    for values in per_field {
        // 缺失字段按 null 建索引
        let values = if values.is_empty() {
            vec![Value::Null]
        } else {
            values
        };
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut entry = prefix.clone();
                    entry.push(v.clone());
                    entry
                })
            })
            .collect();
    }
    combos
}

fn entry_key(entry: &[Value]) -> String {
    Value::Array(entry.to_vec()).to_string()
}

fn entry_keys(index: &IndexSpec, doc: &Document) -> HashSet<String> {
    index_entries(index, doc)
        .iter()
        .map(|e| entry_key(e))
        .collect()
}

fn render_entry(index: &IndexSpec, key: &str) -> String {
    let values: Vec<Value> = serde_json::from_str(key).unwrap_or_default();
    let parts: Vec<String> = index
        .key
        .fields()
        .filter(|(_, k)| *k != IndexKey::Text)
        .zip(values.iter())
        .map(|((f, _), v)| format!("{}: {}", f, v))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

fn check_unique(
    collection: &str,
    coll: &CollectionState,
    candidate: &Document,
    skip: Option<usize>,
) -> Result<(), StoreError> {
    let others = || {
        coll.documents
            .iter()
            .enumerate()
            .filter(move |(pos, _)| Some(*pos) != skip)
            .map(|(_, d)| d)
    };

    if let Some(id) = candidate.get(ID_FIELD) {
        if others().any(|d| d.get(ID_FIELD) == Some(id)) {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                index: ID_INDEX_NAME.to_string(),
                key: format!("{{_id: {}}}", id),
            });
        }
    }

    for index in coll.indexes.iter().filter(|i| i.options.unique) {
        let mine = entry_keys(index, candidate);
        if mine.is_empty() {
            continue;
        }
        for other in others() {
            if let Some(hit) = entry_keys(index, other).intersection(&mine).next() {
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    index: index.name.clone(),
                    key: render_entry(index, hit),
                });
            }
        }
    }
    Ok(())
}

/// 唯一索引构建前的全量检查
fn check_buildable(collection: &str, coll: &CollectionState, index: &IndexSpec) -> Result<(), StoreError> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (pos, doc) in coll.documents.iter().enumerate() {
        for key in entry_keys(index, doc) {
            if let Some(first) = seen.insert(key.clone(), pos) {
                tracing::debug!(
                    "{}: documents #{} and #{} collide on {}",
                    collection,
                    first,
                    pos,
                    index.name
                );
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    index: index.name.clone(),
                    key: render_entry(index, &key),
                });
            }
        }
    }
    Ok(())
}

/// `_id` 放在首位
fn with_id_first(doc: Document, id: Value) -> Document {
    let mut out = Document::with_capacity(doc.len() + 1);
    out.insert(ID_FIELD.to_string(), id);
    for (k, v) in doc {
        if k != ID_FIELD {
            out.insert(k, v);
        }
    }
    out
}

fn id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn create_collection(&self, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if state.collections.contains_key(name) {
            return Ok(false);
        }
        state
            .collections
            .insert(name.to_string(), CollectionState::default());
        Ok(true)
    }

    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.lock().collections.keys().cloned().collect())
    }

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        self.state
            .lock()
            .collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))
    }

    fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        let conflict = |detail: String| StoreError::IndexConflict {
            collection: collection.to_string(),
            index: index.name.clone(),
            detail,
        };
        if index.name == ID_INDEX_NAME {
            return Err(conflict("reserved index name".to_string()));
        }
        if let Err(reason) = index.validate() {
            return Err(StoreError::InvalidDocument {
                collection: collection.to_string(),
                reason,
            });
        }

        let mut state = self.state.lock();
        let coll = state.collections.entry(collection.to_string()).or_default();

        if let Some(live) = coll.indexes.iter().find(|i| i.name == index.name) {
            let diff = index.differences(live);
            return if diff.is_empty() {
                Ok(())
            } else {
                Err(conflict(diff.join("; ")))
            };
        }
        if let Some(live) = coll.indexes.iter().find(|i| i.key.equivalent(&index.key)) {
            return Err(conflict(format!(
                "key pattern {} already indexed as {}",
                index.key, live.name
            )));
        }
        if index.key.is_text() && coll.indexes.iter().any(|i| i.key.is_text()) {
            return Err(conflict("only one text index per collection".to_string()));
        }
        if index.options.unique {
            check_buildable(collection, coll, index)?;
        }
        coll.indexes.push(index.clone());
        Ok(())
    }

    fn drop_index(&self, collection: &str, name: &str) -> Result<(), StoreError> {
        let not_found = || StoreError::IndexNotFound {
            collection: collection.to_string(),
            index: name.to_string(),
        };
        let mut state = self.state.lock();
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        let pos = coll
            .indexes
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(not_found)?;
        coll.indexes.remove(pos);
        Ok(())
    }

    fn insert(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        let id = doc
            .get(ID_FIELD)
            .cloned()
            .unwrap_or_else(|| Value::String(new_identifier()));
        let doc = with_id_first(doc, id.clone());

        let mut state = self.state.lock();
        let coll = state.collections.entry(collection.to_string()).or_default();
        check_unique(collection, coll, &doc, None)?;
        coll.documents.push(doc);
        Ok(id_string(&id))
    }

    fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Document,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock();
        let coll = state.collections.entry(collection.to_string()).or_default();

        match coll.documents.iter().position(|d| filter.matches(d)) {
            Some(pos) => {
                let live_id = coll.documents[pos]
                    .get(ID_FIELD)
                    .cloned()
                    .unwrap_or(Value::Null);
                if let Some(new_id) = doc.get(ID_FIELD) {
                    if *new_id != live_id {
                        return Err(StoreError::InvalidDocument {
                            collection: collection.to_string(),
                            reason: format!("_id is immutable ({} -> {})", live_id, new_id),
                        });
                    }
                }
                let doc = with_id_first(doc, live_id);
                check_unique(collection, coll, &doc, Some(pos))?;
                coll.documents[pos] = doc;
                Ok(UpsertOutcome::Replaced)
            }
            None => {
                let id = doc
                    .get(ID_FIELD)
                    .cloned()
                    .unwrap_or_else(|| Value::String(new_identifier()));
                let doc = with_id_first(doc, id);
                check_unique(collection, coll, &doc, None)?;
                coll.documents.push(doc);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .state
            .lock()
            .collections
            .get(collection)
            .map(|c| {
                c.documents
                    .iter()
                    .filter(|d| filter.matches(d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        let Some(coll) = state.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = coll.documents.len();
        coll.documents.retain(|d| !filter.matches(d));
        Ok((before - coll.documents.len()) as u64)
    }
}
