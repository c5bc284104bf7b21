use std::fmt;

use crate::error::Result;
use crate::reconcile::{IndexReconciler, ReconcileReport};
use crate::schema::Catalog;
use crate::seed::{SeedLoader, SeedOptions, SeedReport, Site};
use crate::store::DocumentStore;
use crate::ttl::{RetentionPolicy, TtlManager, TtlOutcome};

/// 一次完整部署的汇总
#[derive(Clone, Debug, Default)]
pub struct ProvisionReport {
    pub database: String,
    pub backend: &'static str,
    pub collections: Vec<ReconcileReport>,
    pub retention: Vec<(RetentionPolicy, TtlOutcome)>,
    pub seed: Option<SeedReport>,
}

impl ProvisionReport {
    pub fn indexes_created(&self) -> usize {
        self.collections.iter().map(|r| r.created.len()).sum()
    }

    pub fn indexes_recreated(&self) -> usize {
        self.collections.iter().map(|r| r.recreated.len()).sum()
    }

    pub fn indexes_dropped(&self) -> usize {
        self.collections.iter().map(|r| r.dropped.len()).sum()
    }

    pub fn collections_created(&self) -> usize {
        self.collections.iter().filter(|r| r.collection_created).count()
    }

    /// 二次执行应当为 false
    pub fn changed(&self) -> bool {
        self.collections.iter().any(ReconcileReport::changed)
            || self
                .retention
                .iter()
                .any(|(_, o)| *o != TtlOutcome::Unchanged)
            || self
                .seed
                .as_ref()
                .map(|s| s.inserted > 0 || s.removed > 0)
                .unwrap_or(false)
    }
}

impl fmt::Display for ProvisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           trident Provision Report               ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Database: {:>38} ║", self.database)?;
        writeln!(f, "║ Backend:  {:>38} ║", self.backend)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Collections:                                     ║")?;
        writeln!(
            f,
            "║   declared:     {:>10}                       ║",
            self.collections.len()
        )?;
        writeln!(
            f,
            "║   created:      {:>10}                       ║",
            self.collections_created()
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Indexes:                                         ║")?;
        writeln!(
            f,
            "║   created:      {:>10}                       ║",
            self.indexes_created()
        )?;
        writeln!(
            f,
            "║   recreated:    {:>10}                       ║",
            self.indexes_recreated()
        )?;
        writeln!(
            f,
            "║   dropped:      {:>10}                       ║",
            self.indexes_dropped()
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Retention:                                       ║")?;
        for (policy, outcome) in &self.retention {
            writeln!(
                f,
                "║   {:<22} {:>8}s {:>12} ║",
                format!("{}.{}", policy.collection, policy.field),
                policy.duration_secs,
                match outcome {
                    TtlOutcome::Created => "created",
                    TtlOutcome::Unchanged => "unchanged",
                    TtlOutcome::Updated { .. } => "updated",
                }
            )?;
        }
        if let Some(seed) = &self.seed {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ Seed:                                            ║")?;
            writeln!(
                f,
                "║   inserted:     {:>10}                       ║",
                seed.inserted
            )?;
            writeln!(
                f,
                "║   updated:      {:>10}                       ║",
                seed.updated
            )?;
            writeln!(
                f,
                "║   removed:      {:>10}                       ║",
                seed.removed
            )?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

/// 部署流水线：声明表校验 -> 索引协调 -> TTL -> 种子数据。
///
/// 任何一步失败即停止，后续步骤不执行。
pub struct Provisioner<'a, S: DocumentStore + ?Sized> {
    store: &'a S,
    catalog: Catalog,
    retention: Vec<RetentionPolicy>,
    prune: bool,
}

impl<'a, S: DocumentStore + ?Sized> Provisioner<'a, S> {
    pub fn new(store: &'a S, catalog: Catalog, retention: Vec<RetentionPolicy>) -> Self {
        Self {
            store,
            catalog,
            retention,
            prune: false,
        }
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// 协调器实际使用的声明表（叠加了保留策略）
    pub fn effective_catalog(&self) -> Catalog {
        self.catalog.with_retention(&self.retention)
    }

    pub fn run(&self, seed: Option<(Vec<Site>, SeedOptions)>) -> Result<ProvisionReport> {
        for p in &self.retention {
            p.validate()?;
        }
        let catalog = self.effective_catalog();
        tracing::info!(
            "Provisioning {} on {} backend",
            catalog.database,
            self.store.backend()
        );

        let collections = IndexReconciler::new(self.store)
            .with_prune(self.prune)
            .reconcile_catalog(&catalog)?;
        let retention = TtlManager::new(self.store)
            .with_catalog(&catalog)
            .apply(&self.retention)?;
        let seed = match seed {
            Some((sites, options)) => {
                Some(SeedLoader::with_options(self.store, options).load_sites(sites)?)
            }
            None => None,
        };

        Ok(ProvisionReport {
            database: catalog.database,
            backend: self.store.backend(),
            collections,
            retention,
            seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Filter;
    use crate::error::LifecycleError;
    use crate::schema::trident;
    use crate::seed::{Capability, SiteType};
    use crate::store::MemoryStore;
    use crate::ttl::default_policies;

    fn rcc(siteid: u32, name: &str) -> Site {
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
            connectionstatus: None,
            parentid: None,
            incidentidprefix: format!("RCC{}", siteid),
            devices: Vec::new(),
            capability: Capability {
                inputincident: true,
                outputincident: true,
            },
        }
    }

    fn chile() -> Vec<Site> {
        [
            "RCC1 Iquique",
            "RCC2 Antofagasta",
            "RCC3 Santiago",
            "RCC4 Puerto Montt",
            "RCC5 Punta Arenas",
            "RCC6 Isla de Pascua",
        ]
        .iter()
        .enumerate()
        .map(|(i, name)| rcc(i as u32 + 1, name))
        .collect()
    }

    #[test]
    fn full_provision_then_rerun_is_quiet() {
        let store = MemoryStore::new();
        let p = Provisioner::new(&store, trident::catalog(), default_policies());

        let first = p.run(Some((chile(), SeedOptions::default()))).unwrap();
        assert!(first.changed());
        assert_eq!(first.seed.as_ref().unwrap().inserted, 6);
        assert!(first.to_string().contains("Provision Report"));

        let second = p.run(Some((chile(), SeedOptions::default()))).unwrap();
        assert!(!second.changed(), "{}", second);
        assert_eq!(second.seed.as_ref().unwrap().updated, 6);
        assert_eq!(store.count(trident::SITES, &Filter::all()).unwrap(), 6);
    }

    #[test]
    fn seventh_site_with_duplicate_name_fails() {
        let store = MemoryStore::new();
        let p = Provisioner::new(&store, trident::catalog(), default_policies());
        p.run(Some((chile(), SeedOptions::default()))).unwrap();

        let err = p
            .run(Some((vec![rcc(7, "RCC3 Santiago")], SeedOptions::default())))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateSeedKey { siteid: 7, ref index, .. } if index == "nameUnique"));
        assert_eq!(store.count(trident::SITES, &Filter::all()).unwrap(), 6);
    }

    #[test]
    fn retention_overlay_keeps_reconciler_and_ttl_in_agreement() {
        let store = MemoryStore::new();
        Provisioner::new(&store, trident::catalog(), default_policies())
            .run(None)
            .unwrap();

        let shorter: Vec<_> = default_policies()
            .into_iter()
            .map(|mut p| {
                if p.collection == trident::TRACKS {
                    p.duration_secs = 3600;
                }
                p
            })
            .collect();
        let report = Provisioner::new(&store, trident::catalog(), shorter.clone())
            .run(None)
            .unwrap();
        // 协调器已按新时长重建，TTL 管理器看到的是一致状态
        assert_eq!(report.indexes_recreated(), 1);
        assert!(report.retention.iter().all(|(_, o)| *o == TtlOutcome::Unchanged));

        let again = Provisioner::new(&store, trident::catalog(), shorter)
            .run(None)
            .unwrap();
        assert!(!again.changed());
    }
}
