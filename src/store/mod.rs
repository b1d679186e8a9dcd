//! Branch/tag store contract shared by the in-memory and relational backends.
//!
//! A [`Store`] owns named branches and tags. A [`Branch`] handle hands out a
//! [`BranchOps`] guard: acquiring it takes the per-branch mutex, and every
//! query or mutation on the branch goes through it, so callers see a
//! consistent view for the duration of an operation. Writing through a tag
//! fails with `WrongKind`.

pub mod dolt;
pub mod mem;

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::core::{
    Link, LinkPattern, LinkWithResources, Resource, ResourceGroup, ResourceGroupAndResource,
    ResourceGroupChange, ResourceGroupKey, ResourceRef, ResourceRefPattern,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("{kind} {name} does not exist")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    DuplicateName { kind: &'static str, name: String },

    #[error("{name} is a {actual}, not a {expected}")]
    WrongKind {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn branch_not_found(name: &str) -> Self {
        StoreError::NotFound {
            kind: "branch",
            name: name.to_string(),
        }
    }

    pub fn tag_not_found(name: &str) -> Self {
        StoreError::NotFound {
            kind: "tag",
            name: name.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A `(link, source)` pair reported by cleaning operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedLink {
    pub link: Link,
    pub source: ResourceRef,
}

pub type ResourceSink<'a> = &'a mut dyn FnMut(ResourceGroupAndResource);
pub type LinkSink<'a> = &'a mut dyn FnMut(LinkWithResources);

/// Branch/tag lifecycle.
pub trait Store: Send + Sync {
    /// Branch handle; `WrongKind` if `name` names a tag.
    fn get_branch(&self, name: &str) -> StoreResult<Arc<dyn Branch>>;
    /// Tag handle; `WrongKind` if `name` names a branch.
    fn get_tag(&self, name: &str) -> StoreResult<Arc<dyn Branch>>;
    fn branch_exists(&self, name: &str) -> bool;
    fn tag_exists(&self, name: &str) -> bool;
    /// Deep-copy snapshot of `from_branch` under a new name.
    fn create_branch(&self, name: &str, from_branch: &str) -> StoreResult<Arc<dyn Branch>>;
    fn create_branch_from_tag(&self, name: &str, from_tag: &str) -> StoreResult<Arc<dyn Branch>>;
    /// Like `create_branch` but the copy is frozen and a tag pointer persisted.
    fn create_tag(&self, name: &str, from_branch: &str) -> StoreResult<Arc<dyn Branch>>;
    fn branch_list(&self) -> StoreResult<Vec<String>>;
    fn tag_list(&self) -> StoreResult<Vec<String>>;
}

/// A named branch (or frozen tag) of the graph.
pub trait Branch: Send + Sync + std::fmt::Debug {
    fn name(&self) -> String;
    fn is_tag(&self) -> bool;
    /// Acquire the per-branch guard. Blocks until the branch is free.
    fn ops(&self) -> StoreResult<Box<dyn BranchOps + '_>>;
}

/// The per-branch operation set, executed under the branch guard.
pub trait BranchOps {
    // queries
    fn get_resource_group(&mut self, tool_id: &str, url: &str) -> StoreResult<Option<ResourceGroup>>;
    fn get_resource_group_version(&mut self, tool_id: &str, url: &str) -> StoreResult<String>;
    fn get_resource_groups(&mut self) -> StoreResult<Vec<ResourceGroup>>;
    fn get_resource(
        &mut self,
        rr: &ResourceRef,
        include_deleted: bool,
    ) -> StoreResult<Option<ResourceGroupAndResource>>;
    fn get_resource_by_ref(&mut self, rr: &ResourceRef) -> StoreResult<Option<Resource>>;
    fn is_resource_deleted(&mut self, rr: &ResourceRef) -> StoreResult<bool>;
    fn get_resources(
        &mut self,
        patterns: &[ResourceRefPattern],
        include_deleted: bool,
    ) -> StoreResult<Vec<ResourceGroupAndResource>>;
    fn get_resources_stream(
        &mut self,
        patterns: &[ResourceRefPattern],
        include_deleted: bool,
        sink: ResourceSink<'_>,
    ) -> StoreResult<()>;
    fn get_links(&mut self, patterns: &[LinkPattern]) -> StoreResult<Vec<LinkWithResources>>;
    fn get_links_stream(&mut self, patterns: &[LinkPattern], sink: LinkSink<'_>) -> StoreResult<()>;
    /// Resolve bare link keys into links with endpoint resources.
    fn expand_links(&mut self, links: &[Link]) -> StoreResult<Vec<LinkWithResources>>;
    fn get_all_links(&mut self, include_deleted: bool) -> StoreResult<Vec<LinkWithResources>>;
    fn get_all_links_stream(&mut self, include_deleted: bool, sink: LinkSink<'_>)
        -> StoreResult<()>;
    /// Links into `group` that are dirty, or carry inferred dirtiness when
    /// `with_inferred` is set.
    fn get_dirty_links(
        &mut self,
        group: &ResourceGroupKey,
        with_inferred: bool,
    ) -> StoreResult<Vec<LinkWithResources>>;
    fn get_dirty_links_stream(
        &mut self,
        group: &ResourceGroupKey,
        with_inferred: bool,
        sink: LinkSink<'_>,
    ) -> StoreResult<()>;
    /// BFS over non-deleted links incident on `rr`: incoming when `upstream`,
    /// outgoing otherwise. `max_depth <= 0` means unlimited.
    fn get_dependency_graph(
        &mut self,
        rr: &ResourceRef,
        upstream: bool,
        max_depth: i32,
    ) -> StoreResult<Vec<LinkWithResources>>;

    // mutations
    fn add_resource(&mut self, rg: &ResourceGroup, res: Option<&Resource>) -> StoreResult<bool>;
    fn add_resources(&mut self, resources: &[ResourceGroupAndResource]) -> StoreResult<bool>;
    fn add_link(&mut self, link: &LinkWithResources) -> StoreResult<bool>;
    fn add_links(&mut self, links: &[LinkWithResources]) -> StoreResult<bool>;
    fn remove_resource_ref(&mut self, rr: &ResourceRef) -> StoreResult<bool>;
    fn remove_link(&mut self, link: &Link) -> StoreResult<bool>;
    /// Apply a tool's change set; returns the links whose dirty state or
    /// shape changed, for notification fan-out.
    fn update_resource_group(&mut self, change: &ResourceGroupChange) -> StoreResult<Vec<Link>>;
    fn edit_resource_group(
        &mut self,
        old: &ResourceGroup,
        new: &ResourceGroup,
    ) -> StoreResult<()>;
    fn remove_resource_group(&mut self, tool_id: &str, url: &str) -> StoreResult<()>;
    fn mark_resources_clean(
        &mut self,
        refs: &[ResourceRef],
        propagate: bool,
    ) -> StoreResult<()>;
    /// Clean listed links; returns the inferred-dirtiness `(link, source)`
    /// pairs removed by propagation.
    fn mark_links_clean(&mut self, links: &[Link], propagate: bool)
        -> StoreResult<Vec<CleanedLink>>;
    fn mark_inferred_dirtiness_clean(
        &mut self,
        link: &Link,
        source: &ResourceRef,
        propagate: bool,
    ) -> StoreResult<Vec<CleanedLink>>;
    /// Durability point: commit the transaction or write a snapshot and bump
    /// the branch version.
    fn save_branch_state(&mut self) -> StoreResult<()>;
}

pub(crate) struct CompiledPattern {
    pub pattern: ResourceRefPattern,
    pub regex: Regex,
}

pub(crate) fn compile_patterns(
    patterns: &[ResourceRefPattern],
) -> StoreResult<Vec<CompiledPattern>> {
    patterns
        .iter()
        .map(|pattern| {
            Ok(CompiledPattern {
                pattern: pattern.clone(),
                regex: Regex::new(&pattern.url_pattern)?,
            })
        })
        .collect()
}

pub(crate) struct CompiledLinkPattern {
    pub pattern: LinkPattern,
    pub from_regex: Regex,
    pub to_regex: Regex,
}

pub(crate) fn compile_link_patterns(
    patterns: &[LinkPattern],
) -> StoreResult<Vec<CompiledLinkPattern>> {
    patterns
        .iter()
        .map(|pattern| {
            Ok(CompiledLinkPattern {
                pattern: pattern.clone(),
                from_regex: Regex::new(&pattern.from.url_pattern)?,
                to_regex: Regex::new(&pattern.to.url_pattern)?,
            })
        })
        .collect()
}

impl CompiledLinkPattern {
    /// Group keys must match exactly; the regexes apply to the endpoint URLs.
    pub fn matches(&self, link: &Link) -> bool {
        link.from_res.tool_id == self.pattern.from.tool_id
            && link.from_res.resource_group_url == self.pattern.from.resource_group_url
            && link.to_res.tool_id == self.pattern.to.tool_id
            && link.to_res.resource_group_url == self.pattern.to.resource_group_url
            && self.from_regex.is_match(&link.from_res.url)
            && self.to_regex.is_match(&link.to_res.url)
    }
}
