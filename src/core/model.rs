//! Resources, resource groups and links.
//!
//! Links reference their endpoints through value keys (`ResourceRef`), never
//! owning handles, so cycles in the link graph stay representable. `ResourceRef`
//! and `LinkKey` compare component-wise and serve as map keys everywhere.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a tool reported a resource changed in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Renamed,
    Removed,
}

/// An identifiable artifact inside a resource group.
///
/// `deleted` is a tombstone: the entry survives until no live link
/// references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub id: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub deleted: bool,
}

/// One resource entry of a [`ResourceGroupChange`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub name: String,
    pub id: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub new_name: String,
    #[serde(default)]
    pub new_id: String,
    #[serde(rename = "newURL", default)]
    pub new_url: String,
    pub change_type: ChangeType,
}

impl ResourceChange {
    pub fn to_resource(&self) -> Resource {
        Resource {
            name: self.name.clone(),
            id: self.id.clone(),
            url: self.url.clone(),
            deleted: false,
        }
    }

    /// Whether this change renames the resource identity in place.
    pub fn renames(&self) -> bool {
        match self.change_type {
            ChangeType::Renamed => true,
            ChangeType::Modified => {
                self.url != self.new_url || self.name != self.new_name || self.id != self.new_id
            }
            _ => false,
        }
    }
}

/// Primary key of a resource group within a branch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceGroupKey {
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// A tool-defined container of resources sharing one version.
///
/// `version` is an opaque tool-supplied string; no ordering is assumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ResourceGroupJson", into = "ResourceGroupJson")]
pub struct ResourceGroup {
    pub name: String,
    pub tool_id: String,
    pub url: String,
    pub version: String,
    pub resources: BTreeMap<String, Resource>,
}

/// Snapshot-file shape of a resource group: resources flattened to a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResourceGroupJson {
    name: String,
    #[serde(rename = "toolId")]
    tool_id: String,
    #[serde(rename = "URL")]
    url: String,
    version: String,
    resources: Vec<Resource>,
}

impl From<ResourceGroupJson> for ResourceGroup {
    fn from(j: ResourceGroupJson) -> Self {
        let resources = j
            .resources
            .into_iter()
            .map(|r| (r.url.clone(), r))
            .collect();
        ResourceGroup {
            name: j.name,
            tool_id: j.tool_id,
            url: j.url,
            version: j.version,
            resources,
        }
    }
}

impl From<ResourceGroup> for ResourceGroupJson {
    fn from(rg: ResourceGroup) -> Self {
        ResourceGroupJson {
            name: rg.name,
            tool_id: rg.tool_id,
            url: rg.url,
            version: rg.version,
            resources: rg.resources.into_values().collect(),
        }
    }
}

impl ResourceGroup {
    pub fn new(tool_id: &str, url: &str, name: &str, version: &str) -> Self {
        ResourceGroup {
            name: name.to_string(),
            tool_id: tool_id.to_string(),
            url: url.to_string(),
            version: version.to_string(),
            resources: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ResourceGroupKey {
        ResourceGroupKey {
            tool_id: self.tool_id.clone(),
            url: self.url.clone(),
        }
    }

    /// Insert a resource unless its URL is already present.
    pub fn add_resource(&mut self, res: Resource) -> bool {
        if self.resources.contains_key(&res.url) {
            return false;
        }
        self.resources.insert(res.url.clone(), res);
        true
    }

    pub fn remove_resource(&mut self, url: &str) -> bool {
        self.resources.remove(url).is_some()
    }

    pub fn resource_ref(&self, res: &Resource) -> ResourceRef {
        ResourceRef {
            tool_id: self.tool_id.clone(),
            resource_group_url: self.url.clone(),
            url: res.url.clone(),
        }
    }
}

/// A change set for one resource group, as pushed by a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupChange {
    pub name: String,
    pub tool_id: String,
    pub url: String,
    pub version: String,
    pub resources: BTreeMap<String, ResourceChange>,
}

impl ResourceGroupChange {
    pub fn key(&self) -> ResourceGroupKey {
        ResourceGroupKey {
            tool_id: self.tool_id.clone(),
            url: self.url.clone(),
        }
    }

    pub fn to_resource_group(&self) -> ResourceGroup {
        let resources = self
            .resources
            .iter()
            .map(|(url, change)| (url.clone(), change.to_resource()))
            .collect();
        ResourceGroup {
            name: self.name.clone(),
            tool_id: self.tool_id.clone(),
            url: self.url.clone(),
            version: self.version.clone(),
            resources,
        }
    }
}

/// Value key of a resource: `(toolId, resourceGroupURL, URL)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "toolId")]
    pub tool_id: String,
    #[serde(rename = "resourceGroupURL")]
    pub resource_group_url: String,
    #[serde(rename = "URL")]
    pub url: String,
}

impl ResourceRef {
    pub fn new(tool_id: &str, resource_group_url: &str, url: &str) -> Self {
        ResourceRef {
            tool_id: tool_id.to_string(),
            resource_group_url: resource_group_url.to_string(),
            url: url.to_string(),
        }
    }

    pub fn group_key(&self) -> ResourceGroupKey {
        ResourceGroupKey {
            tool_id: self.tool_id.clone(),
            url: self.resource_group_url.clone(),
        }
    }

    pub fn in_group(&self, key: &ResourceGroupKey) -> bool {
        self.tool_id == key.tool_id && self.resource_group_url == key.url
    }
}

/// Link identity: the pair of endpoint refs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    #[serde(rename = "fromRes")]
    pub from: ResourceRef,
    #[serde(rename = "toRes")]
    pub to: ResourceRef,
}

/// A directed dependency edge between two resources.
///
/// `inferred_dirtiness[s] = v` records that upstream source `s` changed at
/// version `v` and the change has not been reconciled along this link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "LinkJson", into = "LinkJson")]
pub struct Link {
    pub from_res: ResourceRef,
    pub to_res: ResourceRef,
    pub dirty: bool,
    pub deleted: bool,
    pub last_clean_version: String,
    pub inferred_dirtiness: BTreeMap<ResourceRef, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InferredDirtinessJson {
    #[serde(rename = "Resource")]
    resource: ResourceRef,
    #[serde(rename = "lastCleanVersion")]
    last_clean_version: String,
}

/// Snapshot-file shape of a link. `last_clean_version` is not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinkJson {
    #[serde(rename = "fromRes")]
    from_res: ResourceRef,
    #[serde(rename = "toRes")]
    to_res: ResourceRef,
    dirty: bool,
    deleted: bool,
    #[serde(rename = "inferredDirtiness")]
    inferred_dirtiness: Vec<InferredDirtinessJson>,
}

impl From<LinkJson> for Link {
    fn from(j: LinkJson) -> Self {
        let inferred = j
            .inferred_dirtiness
            .into_iter()
            .map(|e| (e.resource, e.last_clean_version))
            .collect();
        Link {
            from_res: j.from_res,
            to_res: j.to_res,
            dirty: j.dirty,
            deleted: j.deleted,
            last_clean_version: String::new(),
            inferred_dirtiness: inferred,
        }
    }
}

impl From<Link> for LinkJson {
    fn from(link: Link) -> Self {
        let inferred = link
            .inferred_dirtiness
            .into_iter()
            .map(|(resource, last_clean_version)| InferredDirtinessJson {
                resource,
                last_clean_version,
            })
            .collect();
        LinkJson {
            from_res: link.from_res,
            to_res: link.to_res,
            dirty: link.dirty,
            deleted: link.deleted,
            inferred_dirtiness: inferred,
        }
    }
}

impl Link {
    pub fn new(from_res: ResourceRef, to_res: ResourceRef) -> Self {
        Link {
            from_res,
            to_res,
            dirty: false,
            deleted: false,
            last_clean_version: String::new(),
            inferred_dirtiness: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> LinkKey {
        LinkKey {
            from: self.from_res.clone(),
            to: self.to_res.clone(),
        }
    }

    pub fn has_from_ref(&self, rr: &ResourceRef) -> bool {
        self.from_res == *rr
    }

    pub fn has_to_ref(&self, rr: &ResourceRef) -> bool {
        self.to_res == *rr
    }
}

/// One entry of an expanded link's inferred-dirtiness list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDirtiness {
    pub resource_group: ResourceGroup,
    pub resource: Resource,
    pub last_clean_version: String,
}

impl SourceDirtiness {
    pub fn resource_ref(&self) -> ResourceRef {
        self.resource_group.resource_ref(&self.resource)
    }
}

/// A link with its endpoint groups and resources resolved.
///
/// This is the response shape: endpoints carry names and versions, and the
/// inferred-dirtiness map is expanded into resolved entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkWithResources {
    pub from_group: ResourceGroup,
    pub from_res: Resource,
    pub to_group: ResourceGroup,
    pub to_res: Resource,
    pub dirty: bool,
    pub deleted: bool,
    pub last_clean_version: String,
    pub inferred_dirtiness: Vec<SourceDirtiness>,
}

impl LinkWithResources {
    pub fn key(&self) -> LinkKey {
        LinkKey {
            from: self.from_group.resource_ref(&self.from_res),
            to: self.to_group.resource_ref(&self.to_res),
        }
    }

    pub fn to_link(&self) -> Link {
        let inferred = self
            .inferred_dirtiness
            .iter()
            .map(|inf| (inf.resource_ref(), inf.last_clean_version.clone()))
            .collect();
        Link {
            from_res: self.from_group.resource_ref(&self.from_res),
            to_res: self.to_group.resource_ref(&self.to_res),
            dirty: self.dirty,
            deleted: self.deleted,
            last_clean_version: self.last_clean_version.clone(),
            inferred_dirtiness: inferred,
        }
    }
}

/// A (group, resource) pair as returned by resource queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroupAndResource {
    pub resource_group: ResourceGroup,
    pub resource: Resource,
}

impl ResourceGroupAndResource {
    pub fn resource_ref(&self) -> ResourceRef {
        self.resource_group.resource_ref(&self.resource)
    }
}

/// Resource query pattern: the regex applies only to resources inside the
/// exact `(toolId, resourceGroupURL)` group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRefPattern {
    #[serde(rename = "toolId")]
    pub tool_id: String,
    #[serde(rename = "resourceGroupURL")]
    pub resource_group_url: String,
    #[serde(rename = "URLPattern")]
    pub url_pattern: String,
}

/// Link query pattern: both endpoints must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPattern {
    #[serde(rename = "fromRes")]
    pub from: ResourceRefPattern,
    #[serde(rename = "toRes")]
    pub to: ResourceRefPattern,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with(url: &str, resources: &[&str]) -> ResourceGroup {
        let mut rg = ResourceGroup::new("git", url, "repo", "v1");
        for res in resources {
            rg.add_resource(Resource {
                name: res.trim_start_matches('/').to_string(),
                id: res.to_string(),
                url: res.to_string(),
                deleted: false,
            });
        }
        rg
    }

    #[test]
    fn resource_group_json_roundtrip() {
        let rg = group_with("repoA", &["/a.c", "/b.c"]);
        let json = serde_json::to_string(&rg).unwrap();
        let back: ResourceGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(rg, back);
        // the wire shape carries resources as a list
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["resources"].is_array());
        assert_eq!(value["toolId"], "git");
        assert_eq!(value["URL"], "repoA");
    }

    #[test]
    fn link_json_roundtrip_keeps_inferred_dirtiness() {
        let mut link = Link::new(
            ResourceRef::new("git", "repoA", "/a.c"),
            ResourceRef::new("mdl", "modelM", "/m1"),
        );
        link.dirty = true;
        link.inferred_dirtiness
            .insert(ResourceRef::new("git", "repoB", "/x.c"), "v3".to_string());

        let json = serde_json::to_string(&link).unwrap();
        let back: Link = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key(), link.key());
        assert!(back.dirty);
        assert_eq!(
            back.inferred_dirtiness
                .get(&ResourceRef::new("git", "repoB", "/x.c")),
            Some(&"v3".to_string())
        );
        // last_clean_version is not part of the snapshot layout
        assert!(back.last_clean_version.is_empty());
    }

    #[test]
    fn link_key_compares_componentwise() {
        let a = LinkKey {
            from: ResourceRef::new("git", "repoA", "/a.c"),
            to: ResourceRef::new("mdl", "modelM", "/m1"),
        };
        let b = LinkKey {
            from: ResourceRef::new("git", "repoA", "/a.c"),
            to: ResourceRef::new("mdl", "modelM", "/m1"),
        };
        assert_eq!(a, b);
        let c = LinkKey {
            from: ResourceRef::new("git", "repoA", "/a.c"),
            to: ResourceRef::new("mdl", "modelM", "/m2"),
        };
        assert_ne!(a, c);
    }

    #[test]
    fn duplicate_resource_is_not_added() {
        let mut rg = group_with("repoA", &["/a.c"]);
        let added = rg.add_resource(Resource {
            name: "a.c".into(),
            id: "/a.c".into(),
            url: "/a.c".into(),
            deleted: false,
        });
        assert!(!added);
        assert_eq!(rg.resources.len(), 1);
    }

    #[test]
    fn renames_detects_identity_change_on_modified() {
        let mut change = ResourceChange {
            name: "a.c".into(),
            id: "1".into(),
            url: "/a.c".into(),
            new_name: "a.c".into(),
            new_id: "1".into(),
            new_url: "/a.c".into(),
            change_type: ChangeType::Modified,
        };
        assert!(!change.renames());
        change.new_url = "/a2.c".into();
        assert!(change.renames());
        change.change_type = ChangeType::Renamed;
        assert!(change.renames());
    }
}
