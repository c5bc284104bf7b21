pub mod file;
pub mod memory;
#[cfg(feature = "mongo")]
pub mod mongo;

use crate::document::{Document, Filter};
use crate::error::StoreError;
use crate::schema::IndexSpec;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "mongo")]
pub use mongo::MongoStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// 存储客户端句柄：所有组件显式接收它，没有全局数据库对象。
///
/// ## 契约
/// - 调用是同步阻塞的，要么完成要么失败；实现不做内部重试。
/// - `create_index` 同名同选项为 no-op；同名不同选项返回 `IndexConflict`。
/// - 唯一索引建在违例数据上返回 `DuplicateKey`，且不留下索引。
/// - `list_indexes` 不包含主键索引 `_id_`。
/// - 写入与建索引时隐式创建不存在的集合。
pub trait DocumentStore {
    /// 后端名（日志用）
    fn backend(&self) -> &'static str;

    /// 返回 true 表示本次新建
    fn create_collection(&self, name: &str) -> Result<bool, StoreError>;

    fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError>;

    fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError>;

    fn drop_index(&self, collection: &str, name: &str) -> Result<(), StoreError>;

    /// 插入；缺少 `_id` 时由存储层分配，返回最终 `_id`
    fn insert(&self, collection: &str, doc: Document) -> Result<String, StoreError>;

    /// 按过滤器整体替换第一条匹配文档，没有匹配则插入
    fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Document,
    ) -> Result<UpsertOutcome, StoreError>;

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        Ok(self.find(collection, filter)?.len() as u64)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;
}

impl<S: DocumentStore + ?Sized> DocumentStore for Box<S> {
    fn backend(&self) -> &'static str {
        (**self).backend()
    }
    fn create_collection(&self, name: &str) -> Result<bool, StoreError> {
        (**self).create_collection(name)
    }
    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        (**self).list_collections()
    }
    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        (**self).list_indexes(collection)
    }
    fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        (**self).create_index(collection, index)
    }
    fn drop_index(&self, collection: &str, name: &str) -> Result<(), StoreError> {
        (**self).drop_index(collection, name)
    }
    fn insert(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        (**self).insert(collection, doc)
    }
    fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Document,
    ) -> Result<UpsertOutcome, StoreError> {
        (**self).upsert(collection, filter, doc)
    }
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        (**self).find(collection, filter)
    }
    fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        (**self).count(collection, filter)
    }
    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        (**self).delete_many(collection, filter)
    }
}

/// 新的文档标识（ULID 字符串）
pub fn new_identifier() -> String {
    ulid::Ulid::new().to_string()
}
