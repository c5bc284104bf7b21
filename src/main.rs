use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use trident_lifecycle::config::{open_store, Backend, Config};
use trident_lifecycle::provision::Provisioner;
use trident_lifecycle::reconcile::IndexReconciler;
use trident_lifecycle::schema::matcher::create_matcher;
use trident_lifecycle::schema::trident;
use trident_lifecycle::seed::{parse_sites, SeedLoader, SeedMode, SeedOptions, Site};
use trident_lifecycle::store::FileStore;
use trident_lifecycle::ttl::TtlManager;
use trident_lifecycle::DocumentStore;

#[derive(Parser, Debug)]
#[command(
    name = "trident-lifecycle",
    version,
    about = "Schema, index and TTL lifecycle manager for the trident database"
)]
struct Cli {
    /// 配置文件路径（默认 $XDG_CONFIG_HOME/trident-lifecycle/config.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 输出 debug 日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 按声明表协调集合与索引
    Migrate {
        /// 只打印计划，不执行
        #[arg(long)]
        dry_run: bool,
        /// 删除未声明的索引
        #[arg(long)]
        prune: bool,
        /// 只处理匹配的集合（glob，逗号分隔）
        #[arg(long)]
        only: Option<String>,
    },
    /// 应用保留策略（TTL 索引）
    Ttl,
    /// 加载站点种子数据
    Seed {
        file: PathBuf,
        /// 加载前清空 sites
        #[arg(long)]
        replace: bool,
        /// 每次生成新标识（旧行为，重复执行会产生重复文档）
        #[arg(long)]
        legacy_ids: bool,
    },
    /// 协调 + TTL + 可选种子数据
    Provision {
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// 列出线上索引
    Indexes { collection: Option<String> },
    /// 立即执行一次 TTL 清理（仅 file 后端）
    Expire,
}

fn read_sites(path: &Path) -> anyhow::Result<Vec<Site>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {:?}", path))?;
    Ok(parse_sites(&text)?)
}

fn list_indexes(store: &dyn DocumentStore, collection: Option<String>) -> anyhow::Result<()> {
    let collections = match collection {
        Some(c) => vec![c],
        None => {
            let mut v = store.list_collections()?;
            v.sort();
            v
        }
    };
    for coll in collections {
        let indexes = store.list_indexes(&coll)?;
        println!("{} ({} indexes)", coll, indexes.len());
        for idx in indexes {
            println!("  {}", idx);
        }
    }
    Ok(())
}

/// memory / mongo 后端由数据库自己过期，这里只处理快照文件
fn expire(cfg: &Config) -> anyhow::Result<()> {
    if cfg.store.backend != Backend::File {
        bail!("expire is only supported by the file backend");
    }
    let store = FileStore::open(&cfg.store.path)?;
    let purged = store.purge_expired(SystemTime::now())?;
    info!("Expired {} documents from {:?}", purged, store.path());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = Config::load(cli.config.as_deref())?;

    let catalog = trident::catalog();

    match cli.command {
        Command::Migrate {
            dry_run,
            prune,
            only,
        } => {
            let mut catalog = catalog.with_retention(&cfg.retention);
            if let Some(pattern) = only.as_deref() {
                catalog = catalog.select(create_matcher(pattern).as_ref());
                if catalog.collections.is_empty() {
                    bail!("no declared collection matches {:?}", pattern);
                }
            }
            let store = open_store(&cfg)?;
            let reconciler = IndexReconciler::new(&store).with_prune(prune);
            if dry_run {
                let plans = reconciler.plan_catalog(&catalog)?;
                for plan in plans.iter().filter(|p| !p.is_noop()) {
                    print!("{}", plan);
                }
                info!(
                    "Dry run: {} of {} collections need changes",
                    plans.iter().filter(|p| !p.is_noop()).count(),
                    plans.len()
                );
            } else {
                let reports = reconciler.reconcile_catalog(&catalog)?;
                let changed = reports.iter().filter(|r| r.changed()).count();
                info!("Migration done: {} of {} collections changed", changed, reports.len());
            }
        }
        Command::Ttl => {
            let store = open_store(&cfg)?;
            let ttl = TtlManager::new(&store).with_catalog(&catalog.with_retention(&cfg.retention));
            for (policy, outcome) in ttl.apply(&cfg.retention)? {
                println!("{}: {}", policy, outcome);
            }
        }
        Command::Seed {
            file,
            replace,
            legacy_ids,
        } => {
            let sites = read_sites(&file)?;
            let options = SeedOptions {
                replace,
                mode: if legacy_ids {
                    SeedMode::FreshIdentifier
                } else {
                    SeedMode::NaturalKey
                },
                ..Default::default()
            };
            let store = open_store(&cfg)?;
            let report = SeedLoader::with_options(&store, options).load_sites(sites)?;
            println!("{}", report);
        }
        Command::Provision { seed } => {
            let seed = match seed {
                Some(path) => Some((read_sites(&path)?, SeedOptions::default())),
                None => None,
            };
            let store = open_store(&cfg)?;
            let report = Provisioner::new(&store, catalog, cfg.retention.clone()).run(seed)?;
            print!("{}", report);
        }
        Command::Indexes { collection } => {
            let store = open_store(&cfg)?;
            list_indexes(store.as_ref(), collection)?
        }
        Command::Expire => expire(&cfg)?,
    }

    Ok(())
}
