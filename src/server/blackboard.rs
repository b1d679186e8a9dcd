//! Per-user blackboard: privately staged resources and links.
//!
//! A blackboard accumulates additions and deletions until `SaveBlackboard`
//! folds them into the shared graph. Staged groups carry only the staged
//! resources, never the full server-side group contents.

use std::collections::BTreeMap;

use crate::api::{LinkInfo, Update};
use crate::core::{
    LinkKey, LinkWithResources, Resource, ResourceGroup, ResourceGroupAndResource, ResourceRef,
};

#[derive(Default)]
pub struct Blackboard {
    pub resources: BTreeMap<String, BTreeMap<String, ResourceGroup>>,
    pub changed_links: BTreeMap<LinkKey, LinkWithResources>,
    pub deleted_links: BTreeMap<LinkKey, LinkWithResources>,
}

impl Blackboard {
    pub fn new() -> Self {
        Blackboard::default()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.values().all(|tool| {
            tool.values().all(|rg| rg.resources.is_empty())
        }) && self.changed_links.is_empty()
            && self.deleted_links.is_empty()
    }

    /// Stage a resource; returns false when it was already staged.
    pub fn add_resource(&mut self, rg: &ResourceGroup, res: &Resource) -> bool {
        let tool = self.resources.entry(rg.tool_id.clone()).or_default();
        let staged = tool
            .entry(rg.url.clone())
            .or_insert_with(|| ResourceGroup::new(&rg.tool_id, &rg.url, &rg.name, &rg.version));
        staged.add_resource(Resource {
            name: res.name.clone(),
            id: res.id.clone(),
            url: res.url.clone(),
            deleted: false,
        })
    }

    pub fn remove_resource(&mut self, rr: &ResourceRef) -> bool {
        let Some(tool) = self.resources.get_mut(&rr.tool_id) else {
            return false;
        };
        let Some(rg) = tool.get_mut(&rr.resource_group_url) else {
            return false;
        };
        rg.remove_resource(&rr.url)
    }

    /// Resolve a staged ref into its (group, resource) pair.
    pub fn expand_resource(
        &self,
        tool_id: &str,
        resource_group_url: &str,
        url: &str,
    ) -> Option<ResourceGroupAndResource> {
        let rg = self.resources.get(tool_id)?.get(resource_group_url)?;
        let res = rg.resources.get(url)?;
        Some(ResourceGroupAndResource {
            resource_group: rg.clone(),
            resource: res.clone(),
        })
    }

    pub fn get_resources(&self) -> Vec<ResourceGroupAndResource> {
        let mut out = Vec::new();
        for tool in self.resources.values() {
            for rg in tool.values() {
                for res in rg.resources.values() {
                    out.push(ResourceGroupAndResource {
                        resource_group: rg.clone(),
                        resource: res.clone(),
                    });
                }
            }
        }
        out
    }

    /// Stage link additions. Already-staged links produce no update; a link
    /// staged for deletion is revived.
    pub fn link_resources(&mut self, links: Vec<LinkWithResources>) -> Vec<Update> {
        let mut updates = Vec::new();
        for link in links {
            let key = link.key();
            let was_deleted = self.deleted_links.remove(&key).is_some();
            if !self.changed_links.contains_key(&key) || was_deleted {
                updates.push(Update::AddLink(LinkInfo::from(&link)));
                self.changed_links.insert(key, link);
            }
        }
        updates
    }

    /// Stage link deletions. The link stays in `changed_links` to represent
    /// its edited state and is flagged in `deleted_links` for removal on
    /// save.
    pub fn unlink_resources(&mut self, links: Vec<LinkWithResources>) -> Vec<Update> {
        let mut updates = Vec::new();
        for link in links {
            let key = link.key();
            let newly_deleted = !self.deleted_links.contains_key(&key);
            self.changed_links.insert(key.clone(), link.clone());
            self.deleted_links.insert(key, link.clone());
            if newly_deleted {
                updates.push(Update::RemoveLink(LinkInfo::from(&link)));
            }
        }
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(tool: &str, url: &str) -> ResourceGroup {
        ResourceGroup::new(tool, url, url, "v1")
    }

    fn res(url: &str) -> Resource {
        Resource {
            name: url.trim_start_matches('/').to_string(),
            id: url.to_string(),
            url: url.to_string(),
            deleted: false,
        }
    }

    fn staged_link(from_url: &str, to_url: &str) -> LinkWithResources {
        LinkWithResources {
            from_group: group("git", "repoA"),
            from_res: res(from_url),
            to_group: group("mdl", "modelM"),
            to_res: res(to_url),
            dirty: false,
            deleted: false,
            last_clean_version: String::new(),
            inferred_dirtiness: Vec::new(),
        }
    }

    #[test]
    fn add_resource_dedupes() {
        let mut bb = Blackboard::new();
        assert!(bb.add_resource(&group("git", "repoA"), &res("/a.c")));
        assert!(!bb.add_resource(&group("git", "repoA"), &res("/a.c")));
        assert_eq!(bb.get_resources().len(), 1);
    }

    #[test]
    fn remove_resource_reports_presence() {
        let mut bb = Blackboard::new();
        bb.add_resource(&group("git", "repoA"), &res("/a.c"));
        assert!(bb.remove_resource(&ResourceRef::new("git", "repoA", "/a.c")));
        assert!(!bb.remove_resource(&ResourceRef::new("git", "repoA", "/a.c")));
    }

    #[test]
    fn link_then_unlink_then_relink() {
        let mut bb = Blackboard::new();
        let link = staged_link("/a.c", "/m1");

        let updates = bb.link_resources(vec![link.clone()]);
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0], Update::AddLink(_)));

        // linking again is a no-op
        assert!(bb.link_resources(vec![link.clone()]).is_empty());

        let updates = bb.unlink_resources(vec![link.clone()]);
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0], Update::RemoveLink(_)));
        // repeated unlink produces no further update
        assert!(bb.unlink_resources(vec![link.clone()]).is_empty());

        // re-linking revives the staged link
        let updates = bb.link_resources(vec![link.clone()]);
        assert_eq!(updates.len(), 1);
        assert!(bb.deleted_links.is_empty());
    }

    #[test]
    fn expand_resource_finds_staged_pair() {
        let mut bb = Blackboard::new();
        bb.add_resource(&group("git", "repoA"), &res("/a.c"));
        let found = bb.expand_resource("git", "repoA", "/a.c").expect("staged");
        assert_eq!(found.resource.url, "/a.c");
        assert!(bb.expand_resource("git", "repoA", "/missing").is_none());
    }
}
