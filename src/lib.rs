#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod core;
pub mod server;
pub mod store;
pub mod telemetry;

mod error;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the graph vocabulary at the crate root for convenience
pub use crate::core::{
    ChangeType, Link, LinkKey, LinkPattern, LinkWithResources, Resource, ResourceChange,
    ResourceGroup, ResourceGroupAndResource, ResourceGroupChange, ResourceGroupKey, ResourceRef,
    ResourceRefPattern,
};
pub use crate::store::{Branch, BranchOps, Store, StoreError};
