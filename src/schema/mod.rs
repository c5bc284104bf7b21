pub mod matcher;
pub mod trident;

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::document::Filter;
use crate::error::{LifecycleError, Result};
use crate::ttl::{ttl_index_name, RetentionPolicy};

pub use matcher::{create_matcher, CollectionMatcher};

/// 主键索引名，保留，不可声明 / 删除
pub const ID_INDEX_NAME: &str = "_id_";

/// expireAfterSeconds 上限（服务端按 32 位有符号整数存储）
pub const MAX_EXPIRE_AFTER_SECS: u64 = i32::MAX as u64;

fn index_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("static regex"))
}

fn collection_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// 键模式中单个字段的方向 / 文本标记
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Asc,
    Desc,
    Text,
}

impl Serialize for IndexKey {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            IndexKey::Asc => s.serialize_i32(1),
            IndexKey::Desc => s.serialize_i32(-1),
            IndexKey::Text => s.serialize_str("text"),
        }
    }
}

impl<'de> Deserialize<'de> for IndexKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(f64),
            Str(String),
        }
        match Raw::deserialize(d)? {
            Raw::Num(n) if n > 0.0 => Ok(IndexKey::Asc),
            Raw::Num(n) if n < 0.0 => Ok(IndexKey::Desc),
            Raw::Str(s) if s == "text" => Ok(IndexKey::Text),
            Raw::Num(n) => Err(serde::de::Error::custom(format!("invalid key direction {}", n))),
            Raw::Str(s) => Err(serde::de::Error::custom(format!("unsupported index type {:?}", s))),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Asc => write!(f, "1"),
            IndexKey::Desc => write!(f, "-1"),
            IndexKey::Text => write!(f, "\"text\""),
        }
    }
}

/// 有序键模式：字段路径 -> 方向。字段顺序即索引语义。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPattern(IndexMap<String, IndexKey>);

impl KeyPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: &str) -> Self {
        self.0.insert(field.to_string(), IndexKey::Asc);
        self
    }

    pub fn desc(mut self, field: &str) -> Self {
        self.0.insert(field.to_string(), IndexKey::Desc);
        self
    }

    pub fn text(mut self, field: &str) -> Self {
        self.0.insert(field.to_string(), IndexKey::Text);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, IndexKey)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_text(&self) -> bool {
        self.0.values().any(|k| *k == IndexKey::Text)
    }

    /// 单字段非文本索引的字段名（TTL 只能落在这种索引上）
    pub fn single_field(&self) -> Option<&str> {
        match (self.0.len(), self.0.iter().next()) {
            (1, Some((field, key))) if *key != IndexKey::Text => Some(field.as_str()),
            _ => None,
        }
    }

    /// 语义等价：普通字段按顺序比较，文本字段按集合比较（服务端不保留文本字段顺序）
    pub fn equivalent(&self, other: &KeyPattern) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let plain = |p: &KeyPattern| -> Vec<(String, IndexKey)> {
            p.0.iter()
                .filter(|(_, k)| **k != IndexKey::Text)
                .map(|(f, k)| (f.clone(), *k))
                .collect()
        };
        let text = |p: &KeyPattern| -> HashSet<String> {
            p.0.iter()
                .filter(|(_, k)| **k == IndexKey::Text)
                .map(|(f, _)| f.clone())
                .collect()
        };
        plain(self) == plain(other) && text(self) == text(other)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (field, key)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field, key)?;
        }
        write!(f, "}}")
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// 索引选项。`background` 只是构建提示，不参与等价比较。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexOptions {
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sparse: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub background: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_filter_expression: Option<Filter>,
    /// shell 创建的索引以 double 存储（`864000.0`），读回时接受整数值的浮点
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "integral_secs"
    )]
    pub expire_after_seconds: Option<u64>,
}

fn integral_secs<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    let Some(n) = Option::<f64>::deserialize(d)? else {
        return Ok(None);
    };
    if n < 0.0 || n.fract() != 0.0 || n > u64::MAX as f64 {
        return Err(serde::de::Error::custom(format!(
            "expireAfterSeconds must be a non-negative integer, got {}",
            n
        )));
    }
    Ok(Some(n as u64))
}

impl IndexOptions {
    /// 与 `other` 不一致的持久化选项（用于冲突描述）
    pub fn differences(&self, other: &IndexOptions) -> Vec<String> {
        let mut out = Vec::new();
        if self.unique != other.unique {
            out.push(format!("unique {} != {}", self.unique, other.unique));
        }
        if self.sparse != other.sparse {
            out.push(format!("sparse {} != {}", self.sparse, other.sparse));
        }
        if self.partial_filter_expression != other.partial_filter_expression {
            out.push(format!(
                "partialFilterExpression {} != {}",
                display_opt(&self.partial_filter_expression),
                display_opt(&other.partial_filter_expression)
            ));
        }
        if self.expire_after_seconds != other.expire_after_seconds {
            out.push(format!(
                "expireAfterSeconds {} != {}",
                display_opt(&self.expire_after_seconds),
                display_opt(&other.expire_after_seconds)
            ));
        }
        out
    }
}

fn display_opt<T: fmt::Display>(v: &Option<T>) -> String {
    v.as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// 二级索引声明。名字是协调时的稳定身份，而不是键模式。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub key: KeyPattern,
    #[serde(flatten)]
    pub options: IndexOptions,
}

impl IndexSpec {
    pub fn new(name: &str, key: KeyPattern) -> Self {
        Self {
            name: name.to_string(),
            key,
            options: IndexOptions::default(),
        }
    }

    /// TTL 索引：单字段升序，名字由字段确定
    pub fn ttl(field: &str, duration_secs: u64) -> Self {
        Self::new(&ttl_index_name(field), KeyPattern::new().asc(field))
            .background()
            .expire_after(duration_secs)
    }

    pub fn unique(mut self) -> Self {
        self.options.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.options.sparse = true;
        self
    }

    pub fn background(mut self) -> Self {
        self.options.background = true;
        self
    }

    pub fn partial(mut self, filter: Filter) -> Self {
        self.options.partial_filter_expression = Some(filter);
        self
    }

    pub fn expire_after(mut self, secs: u64) -> Self {
        self.options.expire_after_seconds = Some(secs);
        self
    }

    /// 与线上索引是否完全一致（同名前提下）
    pub fn matches(&self, live: &IndexSpec) -> bool {
        self.key.equivalent(&live.key) && self.options.differences(&live.options).is_empty()
    }

    /// 人类可读的差异列表；空表示一致
    pub fn differences(&self, live: &IndexSpec) -> Vec<String> {
        let mut out = Vec::new();
        if !self.key.equivalent(&live.key) {
            out.push(format!("key {} != {}", self.key, live.key));
        }
        out.extend(self.options.differences(&live.options));
        out
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !index_name_re().is_match(&self.name) {
            return Err(format!("invalid index name {:?}", self.name));
        }
        if self.name == ID_INDEX_NAME {
            return Err(format!("{} is reserved", ID_INDEX_NAME));
        }
        if self.key.is_empty() {
            return Err(format!("index {} has an empty key pattern", self.name));
        }
        if let Some(secs) = self.options.expire_after_seconds {
            let Some(field) = self.key.single_field() else {
                return Err(format!(
                    "index {}: expireAfterSeconds requires a single non-text field, got {}",
                    self.name, self.key
                ));
            };
            if field == crate::document::ID_FIELD {
                return Err(format!("index {}: TTL cannot be placed on _id", self.name));
            }
            if secs > MAX_EXPIRE_AFTER_SECS {
                return Err(format!(
                    "index {}: expireAfterSeconds {} exceeds {}",
                    self.name, secs, MAX_EXPIRE_AFTER_SECS
                ));
            }
        }
        if self.key.is_text() && self.options.unique {
            return Err(format!("index {}: text indexes cannot be unique", self.name));
        }
        Ok(())
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.key)?;
        let o = &self.options;
        if o.unique {
            write!(f, " unique")?;
        }
        if o.sparse {
            write!(f, " sparse")?;
        }
        if let Some(p) = &o.partial_filter_expression {
            write!(f, " partial={}", p)?;
        }
        if let Some(secs) = o.expire_after_seconds {
            write!(f, " ttl={}s", secs)?;
        }
        Ok(())
    }
}

/// 集合声明：名字 + 有序索引列表
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| LifecycleError::InvalidSchema(format!("{}: {}", self.name, msg));

        if !collection_name_re().is_match(&self.name) {
            return Err(invalid("invalid collection name".to_string()));
        }
        let mut names = HashSet::new();
        let mut text_indexes = 0usize;
        for (i, index) in self.indexes.iter().enumerate() {
            index.validate().map_err(invalid)?;
            if !names.insert(index.name.as_str()) {
                return Err(invalid(format!("duplicate index name {}", index.name)));
            }
            if index.key.is_text() {
                text_indexes += 1;
            }
            // 同键不同名会被服务端拒绝，提前在声明层挡住
            if let Some(other) = self.indexes[..i]
                .iter()
                .find(|o| o.key.equivalent(&index.key))
            {
                return Err(invalid(format!(
                    "indexes {} and {} share key pattern {}",
                    other.name, index.name, index.key
                )));
            }
        }
        if text_indexes > 1 {
            return Err(invalid("at most one text index per collection".to_string()));
        }
        Ok(())
    }
}

/// 一个逻辑数据库下的全部集合声明
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub database: String,
    pub collections: Vec<CollectionSpec>,
}

impl Catalog {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            collections: Vec::new(),
        }
    }

    pub fn with_collection(mut self, collection: CollectionSpec) -> Self {
        self.collections.push(collection);
        self
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for c in &self.collections {
            if !names.insert(c.name.as_str()) {
                return Err(LifecycleError::InvalidSchema(format!(
                    "duplicate collection {} in database {}",
                    c.name, self.database
                )));
            }
            c.validate()?;
        }
        Ok(())
    }

    /// 只保留名字匹配的集合（`--only` 选择）
    pub fn select(&self, matcher: &dyn CollectionMatcher) -> Catalog {
        Catalog {
            database: self.database.clone(),
            collections: self
                .collections
                .iter()
                .filter(|c| matcher.matches(&c.name))
                .cloned()
                .collect(),
        }
    }

    /// 把保留策略叠加到声明上。
    ///
    /// 与 TTL 索引同名的声明索引改为携带 expireAfterSeconds，
    /// 这样协调器与 TTL 管理器对同一个索引的期望一致，不会互相 drop。
    pub fn with_retention(&self, policies: &[RetentionPolicy]) -> Catalog {
        let mut out = self.clone();
        for policy in policies {
            let ttl = policy.index_spec();
            let pos = match out.collections.iter().position(|c| c.name == policy.collection) {
                Some(pos) => pos,
                None => {
                    out.collections.push(CollectionSpec::new(&policy.collection));
                    out.collections.len() - 1
                }
            };
            let collection = &mut out.collections[pos];
            match collection.indexes.iter().position(|i| i.name == ttl.name) {
                Some(i) if collection.indexes[i].key.equivalent(&ttl.key) => {
                    collection.indexes[i].options.expire_after_seconds =
                        Some(policy.duration_secs);
                }
                Some(i) => {
                    tracing::warn!(
                        "{}: declared index {} {} replaced by TTL index on {}",
                        policy.collection,
                        collection.indexes[i].name,
                        collection.indexes[i].key,
                        policy.field
                    );
                    collection.indexes[i] = ttl;
                }
                None => {
                    // 同键不同名的声明索引会与 TTL 索引冲突，由 TTL 取代
                    collection.indexes.retain(|i| !i.key.equivalent(&ttl.key));
                    collection.indexes.push(ttl);
                }
            }
        }
        out
    }
}
