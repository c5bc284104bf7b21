use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::document::{identifier_string, Filter, ID_FIELD};
use crate::error::{LifecycleError, Result, StoreError};
use crate::schema::trident::SITES;
use crate::store::{new_identifier, DocumentStore, UpsertOutcome};

fn incident_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9_-]{1,16}$").expect("static regex"))
}

/// 站点类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SiteType {
    Rcc,
    Mrcc,
    Jrcc,
    Mcc,
    Spoc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(default)]
    pub inputincident: bool,
    #[serde(default)]
    pub outputincident: bool,
}

/// 救援协调站点（RCC / MRCC ...）
///
/// `_id` 与 `id` 由加载器分配：事件转交依赖一个与存储内部无关的稳定字符串标识。
/// `_id` 保留存储中的原始形式（现网为 ObjectId，即 `{"$oid": ...}`）。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Site {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub siteid: u32,
    #[serde(rename = "type")]
    pub site_type: SiteType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub point: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectionstatus: Option<i32>,
    /// 上级站点；现网以空串表示无
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        serialize_with = "none_as_empty"
    )]
    pub parentid: Option<String>,
    pub incidentidprefix: String,
    #[serde(default)]
    pub devices: Vec<Value>,
    #[serde(default)]
    pub capability: Capability,
}

fn empty_as_none<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.filter(|s| !s.trim().is_empty()))
}

fn none_as_empty<S: Serializer>(v: &Option<String>, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(v.as_deref().unwrap_or(""))
}

impl Site {
    /// 入库前校验并规范化（名字 trim + NFC）
    fn normalized(mut self, position: usize) -> Result<Site> {
        let invalid = |reason: String| LifecycleError::InvalidSite { position, reason };

        self.name = self.name.trim().nfc().collect();
        if self.name.is_empty() {
            return Err(invalid("empty name".to_string()));
        }
        if self.siteid == 0 {
            return Err(invalid(format!("{}: siteid must be positive", self.name)));
        }
        if !incident_prefix_re().is_match(&self.incidentidprefix) {
            return Err(invalid(format!(
                "{}: incident id prefix {:?} must match {}",
                self.name,
                self.incidentidprefix,
                incident_prefix_re().as_str()
            )));
        }
        if let Some(p) = &self.point {
            if !(-90.0..=90.0).contains(&p.latitude) || !(-180.0..=180.0).contains(&p.longitude) {
                return Err(invalid(format!(
                    "{}: point ({}, {}) out of range",
                    self.name, p.latitude, p.longitude
                )));
            }
        }
        Ok(self)
    }
}

/// 解析种子文件（JSON 数组）
pub fn parse_sites(json: &str) -> Result<Vec<Site>> {
    Ok(serde_json::from_str(json)?)
}

/// 标识分配策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SeedMode {
    /// 按 siteid upsert，已有文档沿用原标识；重复执行等价于一次
    #[default]
    NaturalKey,
    /// 每次执行都生成新标识并按它 upsert。重复执行会产生重复文档（除非唯一索引拦截）
    FreshIdentifier,
}

#[derive(Clone, Debug)]
pub struct SeedOptions {
    pub collection: String,
    pub mode: SeedMode,
    /// 加载前清空目标集合
    pub replace: bool,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            collection: SITES.to_string(),
            mode: SeedMode::default(),
            replace: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub removed: u64,
    pub inserted: usize,
    pub updated: usize,
}

impl fmt::Display for SeedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} inserted, {} updated, {} removed",
            self.inserted, self.updated, self.removed
        )
    }
}

/// 种子加载器：在 schema 建好之后、系统接流量之前执行一次
pub struct SeedLoader<'a, S: DocumentStore + ?Sized> {
    store: &'a S,
    options: SeedOptions,
}

impl<'a, S: DocumentStore + ?Sized> SeedLoader<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self::with_options(store, SeedOptions::default())
    }

    pub fn with_options(store: &'a S, options: SeedOptions) -> Self {
        Self { store, options }
    }

    fn validate_batch(records: Vec<Site>) -> Result<Vec<Site>> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        let mut out = Vec::with_capacity(records.len());
        for (position, site) in records.into_iter().enumerate() {
            let site = site.normalized(position)?;
            if !ids.insert(site.siteid) {
                return Err(LifecycleError::InvalidSite {
                    position,
                    reason: format!("duplicate siteid {} in batch", site.siteid),
                });
            }
            if !names.insert(site.name.clone()) {
                return Err(LifecycleError::InvalidSite {
                    position,
                    reason: format!("duplicate name {:?} in batch", site.name),
                });
            }
            out.push(site);
        }
        Ok(out)
    }

    /// 给每条记录分配标识、镜像到 `id`，再 upsert。
    ///
    /// 整批先校验，任何一条不合法都不会写入。
    pub fn load_sites(&self, records: Vec<Site>) -> Result<SeedReport> {
        let coll = self.options.collection.as_str();
        let fail = |e: StoreError| LifecycleError::from_store(coll, e);
        let sites = Self::validate_batch(records)?;
        let mut report = SeedReport::default();

        if self.options.replace {
            report.removed = self.store.delete_many(coll, &Filter::all()).map_err(fail)?;
            tracing::info!("{}: removed {} existing documents", coll, report.removed);
        }

        for mut site in sites {
            let (object_id, filter) = match self.options.mode {
                SeedMode::NaturalKey => {
                    let key = Filter::all().eq("siteid", site.siteid);
                    let existing = self
                        .store
                        .find(coll, &key)
                        .map_err(fail)?
                        .into_iter()
                        .next()
                        .and_then(|mut d| d.remove(ID_FIELD));
                    (existing.unwrap_or_else(|| Value::String(new_identifier())), key)
                }
                SeedMode::FreshIdentifier => {
                    let id = Value::String(new_identifier());
                    let key = Filter::all().eq(ID_FIELD, id.clone());
                    (id, key)
                }
            };
            site.id = identifier_string(&object_id);
            site.object_id = Some(object_id);

            let doc = match serde_json::to_value(&site)? {
                Value::Object(doc) => doc,
                other => {
                    return Err(fail(StoreError::InvalidDocument {
                        collection: coll.to_string(),
                        reason: format!("site serialized to {}", other),
                    }))
                }
            };

            match self.store.upsert(coll, &filter, doc) {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::Replaced) => report.updated += 1,
                Err(StoreError::DuplicateKey { index, key, .. }) => {
                    return Err(LifecycleError::DuplicateSeedKey {
                        collection: coll.to_string(),
                        siteid: site.siteid,
                        index,
                        key,
                    });
                }
                Err(e) => return Err(fail(e)),
            }
            tracing::debug!("{}: seeded site {} ({})", coll, site.siteid, site.name);
        }

        tracing::info!("{}: {}", coll, report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::IndexReconciler;
    use crate::schema::trident;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn site(siteid: u32, name: &str) -> Site {
        Site {
            object_id: None,
            id: None,
            siteid,
            site_type: SiteType::Rcc,
            name: name.to_string(),
            description: name.to_string(),
            address: String::new(),
            country: String::new(),
            point: None,
            connectionstatus: Some(0),
            parentid: None,
            incidentidprefix: format!("RCC{}", siteid),
            devices: Vec::new(),
            capability: Capability {
                inputincident: true,
                outputincident: true,
            },
        }
    }

    #[test]
    fn parses_deployment_records() {
        let sites = parse_sites(
            r#"[{
                "siteid": 1, "type": "RCC", "name": "RCC1 Iquique", "description": "RCC1 Iquique",
                "address": "", "country": "", "point": null, "parentid": "",
                "incidentidprefix": "RCC1", "devices": [],
                "capability": {"inputincident": true, "outputincident": true}
            }]"#,
        )
        .unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].parentid, None);
        assert_eq!(sites[0].connectionstatus, None);

        let v = serde_json::to_value(&sites[0]).unwrap();
        assert_eq!(v["parentid"], json!(""));
        assert!(v.get("_id").is_none());
    }

    #[test]
    fn identifier_is_mirrored_into_id_field() {
        let store = MemoryStore::new();
        SeedLoader::new(&store).load_sites(vec![site(1, "RCC1 Iquique")]).unwrap();
        let docs = store.find(SITES, &Filter::all()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["_id"], docs[0]["id"]);
        assert!(docs[0]["id"].as_str().map(|s| !s.is_empty()).unwrap_or(false));
    }

    #[test]
    fn natural_key_mode_is_idempotent_and_keeps_identifier() {
        let store = MemoryStore::new();
        let loader = SeedLoader::new(&store);
        loader.load_sites(vec![site(7, "Vagrant")]).unwrap();
        let first_id = store.find(SITES, &Filter::all()).unwrap()[0]["id"].clone();

        let report = loader.load_sites(vec![site(7, "Vagrant")]).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(store.count(SITES, &Filter::all().eq("name", "Vagrant")).unwrap(), 1);
        assert_eq!(store.find(SITES, &Filter::all()).unwrap()[0]["id"], first_id);
    }

    #[test]
    fn reseeding_over_object_id_keeps_raw_identifier() {
        // 现网由 shell 脚本写入，_id 为 ObjectId
        let store = MemoryStore::new();
        let oid = json!({"$oid": "5f1d7c2e9b1e8a3d4c6f0a12"});
        store
            .insert(
                SITES,
                json!({"_id": oid.clone(), "siteid": 1, "name": "RCC1 Iquique"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .unwrap();

        let report = SeedLoader::new(&store)
            .load_sites(vec![site(1, "RCC1 Iquique")])
            .unwrap();
        assert_eq!(report.updated, 1);

        let docs = store.find(SITES, &Filter::all()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["_id"], oid);
        assert_eq!(docs[0]["id"], json!("5f1d7c2e9b1e8a3d4c6f0a12"));
    }

    #[test]
    fn fresh_identifier_mode_duplicates_on_rerun() {
        // 集合上没有唯一索引时，旧行为会留下两份
        let store = MemoryStore::new();
        let loader = SeedLoader::with_options(
            &store,
            SeedOptions {
                mode: SeedMode::FreshIdentifier,
                ..Default::default()
            },
        );
        loader.load_sites(vec![site(7, "Vagrant")]).unwrap();
        loader.load_sites(vec![site(7, "Vagrant")]).unwrap();

        let docs = store.find(SITES, &Filter::all().eq("name", "Vagrant")).unwrap();
        assert_eq!(docs.len(), 2);
        assert_ne!(docs[0]["id"], docs[1]["id"]);
    }

    #[test]
    fn fresh_identifier_rerun_is_stopped_by_unique_indexes() {
        let store = MemoryStore::new();
        let spec = trident::catalog().collection(SITES).cloned().unwrap();
        IndexReconciler::new(&store).reconcile(&spec).unwrap();
        let loader = SeedLoader::with_options(
            &store,
            SeedOptions {
                mode: SeedMode::FreshIdentifier,
                ..Default::default()
            },
        );
        loader.load_sites(vec![site(7, "Vagrant")]).unwrap();
        let err = loader.load_sites(vec![site(7, "Vagrant")]).unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateSeedKey { siteid: 7, .. }));
    }

    #[test]
    fn replace_clears_collection_first() {
        let store = MemoryStore::new();
        store
            .insert(SITES, json!({"siteid": 99, "name": "stale"}).as_object().cloned().unwrap())
            .unwrap();
        let loader = SeedLoader::with_options(
            &store,
            SeedOptions {
                replace: true,
                ..Default::default()
            },
        );
        let report = loader.load_sites(vec![site(1, "RCC1 Iquique")]).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(store.count(SITES, &Filter::all()).unwrap(), 1);
    }

    #[test]
    fn invalid_batches_write_nothing() {
        let store = MemoryStore::new();
        let loader = SeedLoader::new(&store);

        let mut bad_prefix = site(2, "RCC2 Antofagasta");
        bad_prefix.incidentidprefix = "rcc 2".to_string();
        let err = loader
            .load_sites(vec![site(1, "RCC1 Iquique"), bad_prefix])
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidSite { position: 1, .. }));

        let err = loader
            .load_sites(vec![site(1, "A"), site(1, "B")])
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidSite { .. }));

        let mut off_map = site(3, "RCC3 Santiago");
        off_map.point = Some(GeoPoint {
            latitude: -133.4,
            longitude: -70.6,
            altitude: None,
        });
        assert!(loader.load_sites(vec![off_map]).is_err());
        assert_eq!(store.count(SITES, &Filter::all()).unwrap(), 0);
    }

    #[test]
    fn names_are_nfc_normalized_before_uniqueness() {
        let store = MemoryStore::new();
        let spec = trident::catalog().collection(SITES).cloned().unwrap();
        IndexReconciler::new(&store).reconcile(&spec).unwrap();
        let loader = SeedLoader::new(&store);

        loader.load_sites(vec![site(1, "Concepci\u{f3}n")]).unwrap();
        let err = loader
            .load_sites(vec![site(2, "Concepcio\u{301}n ")])
            .unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateSeedKey { ref index, .. } if index == "nameUnique"));
    }
}
