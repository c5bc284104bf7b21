#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod document;
pub mod error;
pub mod provision;
pub mod reconcile;
pub mod schema;
pub mod seed;
pub mod store;
pub mod ttl;

pub use error::{LifecycleError, Result, StoreError};
pub use store::DocumentStore;
