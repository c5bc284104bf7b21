use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// 文档：字段有序的 JSON 对象（与数据库端 BSON 文档一一对应）
pub type Document = Map<String, Value>;

/// 主键字段名
pub const ID_FIELD: &str = "_id";

/// 过滤条件中的单个谓词
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(Value),
    Exists(bool),
}

/// 合取过滤器：`{path: value}` / `{path: {"$exists": bool}}`
///
/// 只覆盖生命周期管理用得到的子集：partial filter、upsert 键、计数与清理。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Filter {
    clauses: Vec<(String, Condition)>,
}

impl Filter {
    /// 空过滤器匹配所有文档
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((path.to_string(), Condition::Eq(value.into())));
        self
    }

    pub fn exists(mut self, path: &str) -> Self {
        self.clauses.push((path.to_string(), Condition::Exists(true)));
        self
    }

    pub fn missing(mut self, path: &str) -> Self {
        self.clauses.push((path.to_string(), Condition::Exists(false)));
        self
    }

    pub fn clauses(&self) -> &[(String, Condition)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|(path, cond)| {
            let found = resolve_path(doc, path);
            match cond {
                Condition::Exists(want) => !found.is_empty() == *want,
                // {a: null} 同时匹配缺失字段
                Condition::Eq(Value::Null) => found.is_empty() || found.iter().any(|v| v.is_null()),
                Condition::Eq(expected) => found.iter().any(|v| *v == expected),
            }
        })
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (path, cond) in &self.clauses {
            let v = match cond {
                Condition::Eq(v) => v.clone(),
                Condition::Exists(b) => {
                    let mut m = Map::new();
                    m.insert("$exists".to_string(), Value::Bool(*b));
                    Value::Object(m)
                }
            };
            out.insert(path.clone(), v);
        }
        Value::Object(out)
    }
}

impl TryFrom<Value> for Filter {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(map) = value else {
            return Err(format!("filter must be an object, got {}", value));
        };
        let mut clauses = Vec::with_capacity(map.len());
        for (path, v) in map {
            if path.starts_with('$') {
                return Err(format!("unsupported filter operator {}", path));
            }
            let cond = match v {
                Value::Object(ref inner) if inner.keys().any(|k| k.starts_with('$')) => {
                    match (inner.len(), inner.get("$exists")) {
                        (1, Some(flag)) => Condition::Exists(exists_flag(flag)),
                        _ => return Err(format!("unsupported condition on {}: {}", path, v)),
                    }
                }
                other => Condition::Eq(other),
            };
            clauses.push((path, cond));
        }
        Ok(Self { clauses })
    }
}

// 服务端回读时 `$exists: 1` 与 `$exists: true` 等价
fn exists_flag(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

impl From<Filter> for Value {
    fn from(f: Filter) -> Self {
        f.to_json()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// 按点路径解析字段，数组逐元素展开。
///
/// 末端为数组时，同时返回数组本身与其元素（与查询语义一致）。
pub fn resolve_path<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(v) = doc.get(*head) {
            collect(v, rest, &mut out, true);
        }
    }
    out
}

/// 索引键取值：末端数组只展开为元素（multikey），缺失字段返回空。
pub fn index_values(doc: &Document, path: &str) -> Vec<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(v) = doc.get(*head) {
            collect(v, rest, &mut out, false);
        }
    }
    out.into_iter().cloned().collect()
}

fn collect<'a>(value: &'a Value, rest: &[&str], out: &mut Vec<&'a Value>, keep_array: bool) {
    match rest.split_first() {
        None => match value {
            Value::Array(items) => {
                if keep_array {
                    out.push(value);
                }
                out.extend(items.iter());
            }
            _ => out.push(value),
        },
        Some((head, tail)) => match value {
            Value::Object(map) => {
                if let Some(v) = map.get(*head) {
                    collect(v, tail, out, keep_array);
                }
            }
            Value::Array(items) => {
                for item in items.iter().filter(|i| i.is_object()) {
                    collect(item, rest, out, keep_array);
                }
            }
            _ => {}
        },
    }
}

/// 读取文档主键（字符串形式）
pub fn document_id(doc: &Document) -> Option<String> {
    doc.get(ID_FIELD).and_then(identifier_string)
}

/// 主键的字符串形式：ObjectId 取十六进制串（同 shell 的 `_id.str`）
pub fn identifier_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Object(m) => m.get("$oid").and_then(|v| v.as_str()).map(str::to_string),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn nested_array_paths_resolve_per_element() {
        let d = doc(json!({
            "devices": [
                {"deviceid": "A1", "networks": [{"subscriberid": "s1"}, {"subscriberid": "s2"}]},
                {"deviceid": "B2"}
            ]
        }));
        assert_eq!(index_values(&d, "devices.deviceid"), vec![json!("A1"), json!("B2")]);
        assert_eq!(
            index_values(&d, "devices.networks.subscriberid"),
            vec![json!("s1"), json!("s2")]
        );
        assert!(index_values(&d, "devices.missing").is_empty());
    }

    #[test]
    fn exists_and_null_equality() {
        let d = doc(json!({"name": "Vagrant", "networks": []}));
        assert!(Filter::all().exists("networks").matches(&d));
        assert!(Filter::all().missing("point").matches(&d));
        assert!(Filter::all().eq("point", Value::Null).matches(&d));
        assert!(!Filter::all().eq("name", "Other").matches(&d));
        assert!(Filter::all().eq("name", "Vagrant").matches(&d));
    }

    #[test]
    fn filter_json_shape_is_stable() {
        let f = Filter::all().exists("devices.networks");
        let v = f.to_json();
        assert_eq!(v, json!({"devices.networks": {"$exists": true}}));
        let back = Filter::try_from(json!({"devices.networks": {"$exists": 1}})).unwrap();
        assert_eq!(back, f);
        assert!(Filter::try_from(json!({"a": {"$gt": 3}})).is_err());
    }
}
