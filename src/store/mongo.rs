use mongodb::bson::{doc, Bson, Document as BsonDocument};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::ReplaceOptions;
use mongodb::sync::{Client, Collection, Database};
use serde_json::{Map, Value};

use crate::document::{document_id, Document, Filter};
use crate::error::StoreError;
use crate::schema::{IndexSpec, KeyPattern, ID_INDEX_NAME};
use crate::store::{new_identifier, DocumentStore, UpsertOutcome};

// 服务端错误码
const NAMESPACE_NOT_FOUND: i32 = 26;
const INDEX_NOT_FOUND: i32 = 27;
const NAMESPACE_EXISTS: i32 = 48;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
const DUPLICATE_KEY: i32 = 11000;

/// MongoDB 后端（同步驱动）
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).map_err(|e| StoreError::Transient(e.to_string()))?;
        tracing::info!("Connected to MongoDB, database {}", database);
        Ok(Self {
            db: client.database(database),
        })
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.db.collection::<BsonDocument>(name)
    }

    fn command(&self, collection: &str, index: Option<&str>, cmd: BsonDocument) -> Result<BsonDocument, StoreError> {
        self.db
            .run_command(cmd, None)
            .map_err(|e| map_error(collection, index, e))
    }
}

fn map_error(collection: &str, index: Option<&str>, err: MongoError) -> StoreError {
    let index_name = || index.unwrap_or_default().to_string();
    match err.kind.as_ref() {
        ErrorKind::Command(cmd) => match cmd.code {
            INDEX_OPTIONS_CONFLICT | INDEX_KEY_SPECS_CONFLICT => StoreError::IndexConflict {
                collection: collection.to_string(),
                index: index_name(),
                detail: cmd.message.clone(),
            },
            DUPLICATE_KEY => StoreError::DuplicateKey {
                collection: collection.to_string(),
                index: duplicate_index(&cmd.message).unwrap_or_else(index_name),
                key: duplicate_key(&cmd.message),
            },
            INDEX_NOT_FOUND => StoreError::IndexNotFound {
                collection: collection.to_string(),
                index: index_name(),
            },
            NAMESPACE_NOT_FOUND => StoreError::CollectionNotFound(collection.to_string()),
            _ => StoreError::Transient(err.to_string()),
        },
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY => {
            StoreError::DuplicateKey {
                collection: collection.to_string(),
                index: duplicate_index(&we.message).unwrap_or_else(index_name),
                key: duplicate_key(&we.message),
            }
        }
        _ => StoreError::Transient(err.to_string()),
    }
}

// "E11000 duplicate key error collection: trident.sites index: nameUnique dup key: { name: \"X\" }"
fn duplicate_index(message: &str) -> Option<String> {
    let rest = message.split("index: ").nth(1)?;
    let name = rest.split_whitespace().next()?;
    Some(name.to_string())
}

fn duplicate_key(message: &str) -> String {
    message
        .split("dup key: ")
        .nth(1)
        .unwrap_or(message)
        .trim()
        .to_string()
}

/// 按扩展 JSON 解析（`{"$oid": ...}` 还原为 ObjectId），与 `from_bson_doc` 对称
fn to_bson_doc(collection: &str, value: &Value) -> Result<BsonDocument, StoreError> {
    let invalid = |reason: String| StoreError::InvalidDocument {
        collection: collection.to_string(),
        reason,
    };
    match Bson::try_from(value.clone()).map_err(|e| invalid(e.to_string()))? {
        Bson::Document(d) => Ok(d),
        other => Err(invalid(format!("expected a document, got {}", other))),
    }
}

fn from_bson_doc(doc: BsonDocument) -> Document {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// listIndexes 结果 -> IndexSpec。文本索引以 `_fts/_ftsx + weights` 形式存储，这里还原成字段列表。
fn parse_live_index(raw: Document) -> Result<IndexSpec, StoreError> {
    let mut raw = raw;
    let is_text = raw
        .get("key")
        .and_then(|k| k.get("_fts"))
        .map(|v| v == "text")
        .unwrap_or(false);
    if is_text {
        let mut key = Map::new();
        if let Some(Value::Object(weights)) = raw.get("weights") {
            for field in weights.keys() {
                key.insert(field.clone(), Value::String("text".into()));
            }
        }
        raw.insert("key".to_string(), Value::Object(key));
    }
    Ok(serde_json::from_value(Value::Object(raw))?)
}

impl DocumentStore for MongoStore {
    fn backend(&self) -> &'static str {
        "mongo"
    }

    fn create_collection(&self, name: &str) -> Result<bool, StoreError> {
        match self.db.create_collection(name, None) {
            Ok(()) => Ok(true),
            Err(e) => match e.kind.as_ref() {
                ErrorKind::Command(cmd) if cmd.code == NAMESPACE_EXISTS => Ok(false),
                _ => Err(map_error(name, None, e)),
            },
        }
    }

    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.db
            .list_collection_names(None)
            .map_err(|e| StoreError::Transient(e.to_string()))
    }

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        let reply = self.command(collection, None, doc! { "listIndexes": collection })?;
        let batch = reply
            .get_document("cursor")
            .and_then(|c| c.get_array("firstBatch"))
            .map_err(|e| StoreError::Transient(format!("unexpected listIndexes reply: {}", e)))?;

        let mut out = Vec::with_capacity(batch.len());
        for item in batch {
            let Bson::Document(d) = item else { continue };
            let raw = from_bson_doc(d.clone());
            if raw.get("name").and_then(|n| n.as_str()) == Some(ID_INDEX_NAME) {
                continue;
            }
            out.push(parse_live_index(raw)?);
        }
        Ok(out)
    }

    fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        let spec = to_bson_doc(collection, &serde_json::to_value(index)?)?;
        self.command(
            collection,
            Some(&index.name),
            doc! { "createIndexes": collection, "indexes": [spec] },
        )?;
        Ok(())
    }

    fn drop_index(&self, collection: &str, name: &str) -> Result<(), StoreError> {
        self.command(
            collection,
            Some(name),
            doc! { "dropIndexes": collection, "index": name },
        )?;
        Ok(())
    }

    fn insert(&self, collection: &str, mut doc: Document) -> Result<String, StoreError> {
        if !doc.contains_key("_id") {
            doc.insert("_id".to_string(), Value::String(new_identifier()));
        }
        let id = document_id(&doc).unwrap_or_default();
        let bdoc = to_bson_doc(collection, &Value::Object(doc))?;
        self.collection(collection)
            .insert_one(bdoc, None)
            .map_err(|e| map_error(collection, None, e))?;
        Ok(id)
    }

    fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Document,
    ) -> Result<UpsertOutcome, StoreError> {
        let filter = to_bson_doc(collection, &filter.to_json())?;
        let replacement = to_bson_doc(collection, &Value::Object(doc))?;
        let options = ReplaceOptions::builder().upsert(true).build();
        let result = self
            .collection(collection)
            .replace_one(filter, replacement, options)
            .map_err(|e| map_error(collection, None, e))?;
        Ok(if result.upserted_id.is_some() {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Replaced
        })
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let filter = to_bson_doc(collection, &filter.to_json())?;
        let cursor = self
            .collection(collection)
            .find(filter, None)
            .map_err(|e| map_error(collection, None, e))?;
        let mut out = Vec::new();
        for item in cursor {
            let d = item.map_err(|e| map_error(collection, None, e))?;
            out.push(from_bson_doc(d));
        }
        Ok(out)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let filter = to_bson_doc(collection, &filter.to_json())?;
        self.collection(collection)
            .count_documents(filter, None)
            .map_err(|e| map_error(collection, None, e))
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let filter = to_bson_doc(collection, &filter.to_json())?;
        let result = self
            .collection(collection)
            .delete_many(filter, None)
            .map_err(|e| map_error(collection, None, e))?;
        Ok(result.deleted_count)
    }
}
