//! trident 数据库的集合与索引声明。
//!
//! 纯数据：与协调逻辑一同版本化，本身没有行为。

use super::{Catalog, CollectionSpec, IndexSpec, KeyPattern};
use crate::document::Filter;

pub const DATABASE: &str = "trident";

pub const SITES: &str = "sites";
pub const TRACKS: &str = "tracks";
pub const ACTIVITY: &str = "activity";
pub const NOTICES: &str = "notices";

/// 没有二级索引、只需存在的集合
const PLAIN_COLLECTIONS: &[&str] = &[
    "config",
    "remoteSites",
    "notes",
    "markers",
    "markerImages",
    "icons",
    "iconImages",
    "referenceSequence",
    "transmissions",
    "multicasts",
    "zones",
    "sit915",
    "mapconfig",
    "filtertracks",
];

fn asc(field: &str) -> KeyPattern {
    KeyPattern::new().asc(field)
}

fn sites() -> CollectionSpec {
    CollectionSpec::new(SITES)
        .with_index(IndexSpec::new("siteIdUnique", asc("siteid")).unique())
        .with_index(IndexSpec::new("nameUnique", asc("name")).unique())
}

fn fleets() -> CollectionSpec {
    CollectionSpec::new("fleets")
        .with_index(IndexSpec::new("fleetNameUnique", asc("name")).unique())
        .with_index(IndexSpec::new(
            "text-search",
            KeyPattern::new().text("person.name").text("name"),
        ))
}

fn incidents() -> CollectionSpec {
    CollectionSpec::new("incidents")
        .with_index(IndexSpec::new("incidentIdUnique", asc("me.incidentId")).unique())
}

fn activity() -> CollectionSpec {
    CollectionSpec::new(ACTIVITY)
        .with_index(IndexSpec::new("time", asc("time")).background())
        .with_index(IndexSpec::new("request_id", asc("request_id")).background())
        .with_index(
            IndexSpec::new("activity_id_time", asc("activity_id").asc("time")).unique(),
        )
}

fn request() -> CollectionSpec {
    CollectionSpec::new("request")
        .with_index(IndexSpec::new("time", asc("time")).background())
        .with_index(IndexSpec::new("request_id_time", asc("request_id").asc("time")).unique())
}

fn notices() -> CollectionSpec {
    CollectionSpec::new(NOTICES)
        .with_index(IndexSpec::new("ctime", asc("ctime")).background())
        .with_index(IndexSpec::new("track_id", asc("track_id")).background())
}

fn vessels() -> CollectionSpec {
    CollectionSpec::new("vessels")
        .with_index(IndexSpec::new(
            "text-search",
            KeyPattern::new().text("type").text("name"),
        ))
        .with_index(
            IndexSpec::new("deviceid-type", asc("devices.deviceid").asc("devices.type"))
                .unique()
                .partial(Filter::all().exists("devices.deviceid")),
        )
        .with_index(
            IndexSpec::new(
                "network-subscriberid-providerid",
                asc("devices.networks.subscriberid").asc("devices.networks.providerid"),
            )
            .unique()
            .partial(Filter::all().exists("devices.networks")),
        )
}

fn devices() -> CollectionSpec {
    CollectionSpec::new("devices")
        .with_index(IndexSpec::new("deviceid-type", asc("deviceid").asc("type")).unique())
        .with_index(
            IndexSpec::new(
                "network-subscriberid-providerid",
                asc("networks.subscriberid").asc("networks.providerid"),
            )
            .unique()
            .partial(Filter::all().exists("networks")),
        )
}

fn registry() -> CollectionSpec {
    CollectionSpec::new("registry")
        .with_index(IndexSpec::new("registry_id", asc("me.registry_id")).unique())
}

fn tracks() -> CollectionSpec {
    CollectionSpec::new(TRACKS)
        .with_index(IndexSpec::new("time", asc("time")).background())
        .with_index(IndexSpec::new("update_time", asc("update_time")).background())
        .with_index(
            IndexSpec::new(
                "track_id_time",
                asc("track_id").asc("time").asc("update_time"),
            )
            .unique(),
        )
        .with_index(
            IndexSpec::new("track_id_time_desc", asc("track_id").desc("time")).background(),
        )
        .with_index(IndexSpec::new("registry_id", asc("registry_id")).background())
}

/// trident 完整声明表
pub fn catalog() -> Catalog {
    let mut catalog = Catalog::new(DATABASE)
        .with_collection(CollectionSpec::new("config"))
        .with_collection(sites())
        .with_collection(fleets())
        .with_collection(incidents())
        .with_collection(activity())
        .with_collection(request())
        .with_collection(notices())
        .with_collection(vessels())
        .with_collection(devices())
        .with_collection(registry())
        .with_collection(tracks());

    for name in PLAIN_COLLECTIONS {
        if catalog.collection(name).is_none() {
            catalog = catalog.with_collection(CollectionSpec::new(name));
        }
    }
    catalog
}
