//! Conversions between the graph model and the wire payload types.

use crate::core::{
    ChangeType, Link, LinkWithResources, Resource, ResourceChange, ResourceGroup, ResourceRef,
};

use super::{InferredDirtinessInfo, LinkInfo, ResourceInfo, Update};

impl ResourceInfo {
    pub fn from_parts(rg: &ResourceGroup, res: &Resource) -> Self {
        ResourceInfo {
            tool_id: rg.tool_id.clone(),
            resource_group_url: rg.url.clone(),
            resource_group_name: rg.name.clone(),
            resource_group_version: rg.version.clone(),
            name: res.name.clone(),
            url: res.url.clone(),
            id: res.id.clone(),
            deleted: res.deleted,
        }
    }

    /// A bare ref carries no names or versions; only the key fields are set.
    pub fn from_ref(rr: &ResourceRef) -> Self {
        ResourceInfo {
            tool_id: rr.tool_id.clone(),
            resource_group_url: rr.resource_group_url.clone(),
            url: rr.url.clone(),
            ..ResourceInfo::default()
        }
    }
}

impl From<&LinkWithResources> for LinkInfo {
    fn from(link: &LinkWithResources) -> Self {
        let inferred = link
            .inferred_dirtiness
            .iter()
            .map(|inf| InferredDirtinessInfo {
                resource: ResourceInfo::from_parts(&inf.resource_group, &inf.resource),
                last_clean_version: inf.last_clean_version.clone(),
            })
            .collect();
        LinkInfo {
            from_res: ResourceInfo::from_parts(&link.from_group, &link.from_res),
            to_res: ResourceInfo::from_parts(&link.to_group, &link.to_res),
            dirty: link.dirty,
            deleted: link.deleted,
            last_clean_version: link.last_clean_version.clone(),
            inferred_dirtiness: inferred,
        }
    }
}

impl From<&Link> for LinkInfo {
    fn from(link: &Link) -> Self {
        let inferred = link
            .inferred_dirtiness
            .iter()
            .map(|(rr, version)| InferredDirtinessInfo {
                resource: ResourceInfo::from_ref(rr),
                last_clean_version: version.clone(),
            })
            .collect();
        LinkInfo {
            from_res: ResourceInfo::from_ref(&link.from_res),
            to_res: ResourceInfo::from_ref(&link.to_res),
            dirty: link.dirty,
            deleted: link.deleted,
            last_clean_version: link.last_clean_version.clone(),
            inferred_dirtiness: inferred,
        }
    }
}

/// Expand a change entry into the resource it describes, in group context.
pub fn expand_change(rg: &ResourceGroup, change: &ResourceChange) -> ResourceInfo {
    ResourceInfo::from_parts(rg, &change.to_resource())
}

/// Map a resource change to the update kind watchers receive.
pub fn change_update(rg: &ResourceGroup, change: &ResourceChange) -> Update {
    match change.change_type {
        ChangeType::Added => Update::AddResource(expand_change(rg, change)),
        ChangeType::Modified => Update::ChangeResource(change.clone()),
        ChangeType::Renamed => Update::RenameResource(change.clone()),
        ChangeType::Removed => Update::RemoveResource(expand_change(rg, change)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SourceDirtiness;

    fn group(tool: &str, url: &str) -> ResourceGroup {
        ResourceGroup::new(tool, url, "g", "v1")
    }

    fn res(url: &str) -> Resource {
        Resource {
            name: url.trim_start_matches('/').to_string(),
            id: url.to_string(),
            url: url.to_string(),
            deleted: false,
        }
    }

    #[test]
    fn link_info_expands_inferred_entries() {
        let link = LinkWithResources {
            from_group: group("git", "repoA"),
            from_res: res("/a.c"),
            to_group: group("mdl", "modelM"),
            to_res: res("/m1"),
            dirty: true,
            deleted: false,
            last_clean_version: "v1".into(),
            inferred_dirtiness: vec![SourceDirtiness {
                resource_group: group("git", "repoB"),
                resource: res("/x.c"),
                last_clean_version: "v9".into(),
            }],
        };
        let info = LinkInfo::from(&link);
        assert!(info.dirty);
        assert_eq!(info.from_res.url, "/a.c");
        assert_eq!(info.inferred_dirtiness.len(), 1);
        assert_eq!(info.inferred_dirtiness[0].resource.resource_group_url, "repoB");
        assert_eq!(info.inferred_dirtiness[0].last_clean_version, "v9");
    }

    #[test]
    fn bare_ref_info_has_empty_names() {
        let info = ResourceInfo::from_ref(&ResourceRef::new("git", "repoA", "/a.c"));
        assert_eq!(info.tool_id, "git");
        assert_eq!(info.url, "/a.c");
        assert!(info.name.is_empty());
        assert!(info.resource_group_version.is_empty());
    }
}
