//! Graph data model shared by the store backends and the server surface.

mod model;
mod path;

pub use model::{
    ChangeType, Link, LinkKey, LinkPattern, LinkWithResources, Resource, ResourceChange,
    ResourceGroup, ResourceGroupAndResource, ResourceGroupChange, ResourceGroupKey, ResourceRef,
    ResourceRefPattern, SourceDirtiness,
};
pub use path::{covers, normalize_url, DEFAULT_PATH_SEPARATOR};
