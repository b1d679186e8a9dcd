//! Blackboard handlers: staging RPCs, the save fold-in, and the
//! reconciliation that runs when `main` moves under staged state.

use std::collections::{BTreeMap, HashSet};

use crate::api::{
    BlackboardResourcesResponse, BlackboardUpdate, DepiUpdate, GenericResponse, LinkInfo,
    LinkRename, ResourceGroupVersionChange, ResourceInfo, Update,
};
use crate::core::{
    normalize_url, LinkKey, LinkWithResources, ResourceGroupChange, ResourceGroupAndResource,
    ResourceGroupKey, ResourceRef,
};
use crate::server::access::CAP_RESOURCE_ADD;

use super::blackboard::Blackboard;
use super::{Server, MAIN_BRANCH};

const SAVE_BATCH: usize = 1000;

impl Server {
    pub fn add_resources_to_blackboard(
        &self,
        session_id: &str,
        resources: Vec<ResourceInfo>,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        let user = session.user.name.clone();

        let mut updates = Vec::new();
        {
            let mut boards = self.boards();
            let board = boards.entry(user.clone()).or_default();
            for info in resources {
                let rg = crate::core::ResourceGroup::new(
                    &info.tool_id,
                    &info.resource_group_url,
                    &info.resource_group_name,
                    &info.resource_group_version,
                );
                let res = crate::core::Resource {
                    name: info.name.clone(),
                    id: info.id.clone(),
                    url: info.url.clone(),
                    deleted: false,
                };
                if board.add_resource(&rg, &res) {
                    updates.push(Update::AddResource(info));
                }
            }
        }

        if !updates.is_empty() {
            self.push_blackboard(&user, BlackboardUpdate::of(updates));
        }
        GenericResponse::success()
    }

    pub fn remove_resources_from_blackboard(
        &self,
        session_id: &str,
        resource_refs: Vec<ResourceRef>,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        let user = session.user.name.clone();

        let mut updates = Vec::new();
        {
            let mut boards = self.boards();
            let board = boards.entry(user.clone()).or_default();
            for rr in resource_refs {
                let expanded = board.expand_resource(&rr.tool_id, &rr.resource_group_url, &rr.url);
                if board.remove_resource(&rr) {
                    if let Some(expanded) = expanded {
                        updates.push(Update::RemoveResource(ResourceInfo::from_parts(
                            &expanded.resource_group,
                            &expanded.resource,
                        )));
                    }
                }
            }
        }

        if !updates.is_empty() {
            self.push_blackboard(&user, BlackboardUpdate::of(updates));
        }
        GenericResponse::success()
    }

    fn expand_staged_links(board: &Blackboard, links: Vec<LinkKey>) -> Vec<LinkWithResources> {
        let mut expanded = Vec::with_capacity(links.len());
        for key in links {
            let from = board.expand_resource(
                &key.from.tool_id,
                &key.from.resource_group_url,
                &key.from.url,
            );
            let Some(from) = from else {
                tracing::warn!(tool_id = %key.from.tool_id, rg_url = %key.from.resource_group_url,
                    url = %key.from.url, "invalid from resource in staged link");
                continue;
            };
            let to = board.expand_resource(
                &key.to.tool_id,
                &key.to.resource_group_url,
                &key.to.url,
            );
            let Some(to) = to else {
                tracing::warn!(tool_id = %key.to.tool_id, rg_url = %key.to.resource_group_url,
                    url = %key.to.url, "invalid to resource in staged link");
                continue;
            };
            expanded.push(LinkWithResources {
                from_group: from.resource_group,
                from_res: from.resource,
                to_group: to.resource_group,
                to_res: to.resource,
                dirty: false,
                deleted: false,
                last_clean_version: String::new(),
                inferred_dirtiness: Vec::new(),
            });
        }
        expanded
    }

    pub fn link_blackboard_resources(
        &self,
        session_id: &str,
        links: Vec<LinkKey>,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        let user = session.user.name.clone();
        let updates = {
            let mut boards = self.boards();
            let board = boards.entry(user.clone()).or_default();
            let expanded = Self::expand_staged_links(board, links);
            board.link_resources(expanded)
        };
        if !updates.is_empty() {
            self.push_blackboard(&user, BlackboardUpdate::of(updates));
        }
        GenericResponse::success()
    }

    pub fn unlink_blackboard_resources(
        &self,
        session_id: &str,
        links: Vec<LinkKey>,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        let user = session.user.name.clone();
        let updates = {
            let mut boards = self.boards();
            let board = boards.entry(user.clone()).or_default();
            let expanded = Self::expand_staged_links(board, links);
            board.unlink_resources(expanded)
        };
        if !updates.is_empty() {
            self.push_blackboard(&user, BlackboardUpdate::of(updates));
        }
        GenericResponse::success()
    }

    pub fn get_blackboard_resources(&self, session_id: &str) -> BlackboardResourcesResponse {
        let Some(session) = self.session(session_id) else {
            return BlackboardResourcesResponse {
                ok: false,
                msg: format!("invalid session: {session_id}"),
                resources: Vec::new(),
                links: Vec::new(),
            };
        };
        let boards = self.boards();
        let Some(board) = boards.get(&session.user.name) else {
            return BlackboardResourcesResponse {
                ok: true,
                msg: String::new(),
                resources: Vec::new(),
                links: Vec::new(),
            };
        };

        let links: Vec<LinkInfo> = board.changed_links.values().map(LinkInfo::from).collect();

        // link endpoints plus the individually staged resources, deduplicated
        let mut resources: BTreeMap<ResourceRef, ResourceInfo> = BTreeMap::new();
        for link in board.changed_links.values() {
            resources.insert(
                link.from_group.resource_ref(&link.from_res),
                ResourceInfo::from_parts(&link.from_group, &link.from_res),
            );
            resources.insert(
                link.to_group.resource_ref(&link.to_res),
                ResourceInfo::from_parts(&link.to_group, &link.to_res),
            );
        }
        for item in board.get_resources() {
            resources.insert(
                item.resource_ref(),
                ResourceInfo::from_parts(&item.resource_group, &item.resource),
            );
        }

        BlackboardResourcesResponse {
            ok: true,
            msg: String::new(),
            resources: resources.into_values().collect(),
            links,
        }
    }

    /// Fold the staged state into the target branch, then clear the board.
    pub fn save_blackboard(&self, session_id: &str) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        let user = session.user.name.clone();

        let branch = if self.blackboard_always_main {
            match self.store().get_branch(MAIN_BRANCH) {
                Ok(branch) => branch,
                Err(e) => {
                    return GenericResponse::failure(format!("error fetching main branch: {e}"))
                }
            }
        } else {
            session.branch()
        };

        let mut ops = match branch.ops() {
            Ok(ops) => ops,
            Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
        };

        let (to_add, link_additions, link_deletions) = {
            let mut boards = self.boards();
            let board = boards.entry(user.clone()).or_default();
            let staged = board.get_resources();

            if !staged.is_empty() && !self.has_capability(&session.user, CAP_RESOURCE_ADD) {
                return Self::not_authorized(&user, "add resources");
            }

            // optimistic version check per distinct staged group
            let mut checked: HashSet<ResourceGroupKey> = HashSet::new();
            for item in &staged {
                let key = item.resource_group.key();
                if !checked.insert(key) {
                    continue;
                }
                let server_version = match ops
                    .get_resource_group_version(&item.resource_group.tool_id, &item.resource_group.url)
                {
                    Ok(version) => version,
                    Err(e) => {
                        return GenericResponse::failure(format!(
                            "error checking resource group version: {e}"
                        ))
                    }
                };
                let staged_version = &item.resource_group.version;
                if !server_version.is_empty()
                    && !staged_version.is_empty()
                    && server_version != *staged_version
                {
                    // the server version moved after the client staged
                    return GenericResponse::failure(format!(
                        "version conflict: resource group version in blackboard {staged_version} \
                         does not match version in server {server_version}"
                    ));
                }
            }

            // normalize URLs; unauthorized additions are dropped, not fatal
            let mut to_add: Vec<ResourceGroupAndResource> = Vec::new();
            for mut item in staged {
                let sep = self.config().path_separator(&item.resource_group.tool_id);
                item.resource.url = normalize_url(&item.resource.url, sep);
                if self.is_authorized(
                    &session.user,
                    CAP_RESOURCE_ADD,
                    &[
                        &item.resource_group.tool_id,
                        &item.resource_group.url,
                        &item.resource.url,
                    ],
                ) {
                    to_add.push(item);
                } else {
                    tracing::warn!(user = %user, url = %item.resource.url,
                        "dropping unauthorized staged resource");
                }
            }

            let link_additions: Vec<LinkWithResources> = board
                .changed_links
                .iter()
                .filter(|(key, _)| !board.deleted_links.contains_key(key))
                .map(|(_, link)| link.clone())
                .collect();
            let link_deletions: Vec<LinkWithResources> =
                board.deleted_links.values().cloned().collect();
            (to_add, link_additions, link_deletions)
        };

        for chunk in to_add.chunks(SAVE_BATCH) {
            if let Err(e) = ops.add_resources(chunk) {
                return GenericResponse::failure(format!("error adding resources: {e}"));
            }
        }
        if let Err(e) = ops.add_links(&link_additions) {
            return GenericResponse::failure(format!("error adding links: {e}"));
        }
        for link in &link_deletions {
            if let Err(e) = ops.remove_link(&link.to_link()) {
                return GenericResponse::failure(format!("error removing link: {e}"));
            }
        }
        if let Err(e) = ops.save_branch_state() {
            return GenericResponse::failure(format!("error saving branch state: {e}"));
        }
        drop(ops);

        let mut depi_updates: Vec<Update> = Vec::new();
        for item in &to_add {
            depi_updates.push(Update::AddResource(ResourceInfo::from_parts(
                &item.resource_group,
                &item.resource,
            )));
        }
        for link in &link_additions {
            depi_updates.push(Update::AddLink(LinkInfo::from(link)));
        }
        for link in &link_deletions {
            depi_updates.push(Update::RemoveLink(LinkInfo::from(link)));
        }

        self.clear_blackboard_for(&user);

        if !depi_updates.is_empty() {
            self.push_depi(&branch.name(), DepiUpdate::of(depi_updates));
        }

        for item in &to_add {
            self.audit(
                &user,
                "AddResource",
                format!(
                    "toolId={};rgURL={};URL={}",
                    item.resource_group.tool_id, item.resource_group.url, item.resource.url
                ),
            );
        }
        for link in &link_additions {
            self.audit(
                &user,
                "LinkResources",
                format!(
                    "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                    link.from_group.tool_id,
                    link.from_group.url,
                    link.from_res.url,
                    link.to_group.tool_id,
                    link.to_group.url,
                    link.to_res.url
                ),
            );
        }
        for link in &link_deletions {
            self.audit(
                &user,
                "UnlinkResources",
                format!(
                    "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                    link.from_group.tool_id,
                    link.from_group.url,
                    link.from_res.url,
                    link.to_group.tool_id,
                    link.to_group.url,
                    link.to_res.url
                ),
            );
        }
        GenericResponse::success()
    }

    pub fn clear_blackboard(&self, session_id: &str) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        self.clear_blackboard_for(&session.user.name);
        GenericResponse::success()
    }

    /// Reset the user's board, streaming compensating updates so watching
    /// clients converge back to the shared view.
    fn clear_blackboard_for(&self, user: &str) {
        let updates = {
            let mut boards = self.boards();
            let Some(board) = boards.get(user) else {
                boards.insert(user.to_string(), Blackboard::new());
                return;
            };
            let mut updates = Vec::new();
            for item in board.get_resources() {
                updates.push(Update::RemoveResource(ResourceInfo::from_parts(
                    &item.resource_group,
                    &item.resource,
                )));
            }
            // deletion-flagged links reappear; staged additions disappear
            for link in board.deleted_links.values() {
                updates.push(Update::AddLink(LinkInfo::from(link)));
            }
            for link in board.changed_links.values() {
                updates.push(Update::RemoveLink(LinkInfo::from(link)));
            }
            boards.insert(user.to_string(), Blackboard::new());
            updates
        };

        if !updates.is_empty() {
            self.push_blackboard(user, BlackboardUpdate::of(updates));
        }
    }

    /// A change landed on `main`: rewrite overlapping staged state and
    /// stream the reconciliation to the owner's blackboard watchers.
    pub(crate) fn reconcile_blackboards(&self, change: &ResourceGroupChange) {
        let mut pushes: Vec<(String, Vec<Update>)> = Vec::new();
        {
            let mut boards = self.boards();
            for (user, board) in boards.iter_mut() {
                let mut updates = Vec::new();

                let staged_version = board
                    .resources
                    .get(&change.tool_id)
                    .and_then(|tool| tool.get(&change.url))
                    .map(|rg| rg.version.clone());
                let Some(staged_version) = staged_version else {
                    continue;
                };
                if staged_version == change.version {
                    continue;
                }

                updates.push(Update::ResourceGroupVersionChanged(
                    ResourceGroupVersionChange {
                        name: change.name.clone(),
                        url: change.url.clone(),
                        tool_id: change.tool_id.clone(),
                        version: staged_version,
                        new_version: change.version.clone(),
                    },
                ));
                if let Some(rg) = board
                    .resources
                    .get_mut(&change.tool_id)
                    .and_then(|tool| tool.get_mut(&change.url))
                {
                    rg.version = change.version.clone();
                }

                for (url, res_change) in &change.resources {
                    let staged_ref = ResourceRef::new(&change.tool_id, &change.url, url);
                    let has_staged = board
                        .resources
                        .get(&change.tool_id)
                        .and_then(|tool| tool.get(&change.url))
                        .map(|rg| rg.resources.contains_key(url))
                        .unwrap_or(false);
                    if !has_staged {
                        continue;
                    }

                    if res_change.change_type == crate::core::ChangeType::Removed {
                        if let Some(rg) = board
                            .resources
                            .get_mut(&change.tool_id)
                            .and_then(|tool| tool.get_mut(&change.url))
                        {
                            if let Some(res) = rg.resources.remove(url) {
                                updates.push(Update::RemoveResource(ResourceInfo::from_parts(
                                    rg, &res,
                                )));
                            }
                        }
                        // staged links over the removed resource flip to deleted
                        let touching: Vec<LinkKey> = board
                            .changed_links
                            .keys()
                            .filter(|key| key.from == staged_ref || key.to == staged_ref)
                            .cloned()
                            .collect();
                        for key in touching {
                            if let Some(link) = board.changed_links.remove(&key) {
                                if !board.deleted_links.contains_key(&key) {
                                    updates.push(Update::RemoveLink(LinkInfo::from(&link)));
                                    board.deleted_links.insert(key, link);
                                }
                            }
                        }
                    } else if res_change.renames() {
                        // rewrite staged links touching the renamed resource
                        let touching: Vec<LinkKey> = board
                            .changed_links
                            .keys()
                            .filter(|key| key.from == staged_ref || key.to == staged_ref)
                            .cloned()
                            .collect();
                        for key in touching {
                            let Some(mut link) = board.changed_links.remove(&key) else {
                                continue;
                            };
                            let old_from = ResourceInfo::from_parts(&link.from_group, &link.from_res);
                            let old_to = ResourceInfo::from_parts(&link.to_group, &link.to_res);
                            if key.from == staged_ref {
                                link.from_res.url = res_change.new_url.clone();
                                link.from_res.name = res_change.new_name.clone();
                                link.from_res.id = res_change.new_id.clone();
                            }
                            if key.to == staged_ref {
                                link.to_res.url = res_change.new_url.clone();
                                link.to_res.name = res_change.new_name.clone();
                                link.to_res.id = res_change.new_id.clone();
                            }
                            updates.push(Update::RenameLink(LinkRename {
                                from_res: old_from,
                                from_res_new: ResourceInfo::from_parts(
                                    &link.from_group,
                                    &link.from_res,
                                ),
                                to_res: old_to,
                                to_res_new: ResourceInfo::from_parts(&link.to_group, &link.to_res),
                            }));
                            let new_key = link.key();
                            if board.deleted_links.remove(&key).is_some() {
                                board.deleted_links.insert(new_key.clone(), link.clone());
                            }
                            board.changed_links.insert(new_key, link);
                        }

                        if let Some(rg) = board
                            .resources
                            .get_mut(&change.tool_id)
                            .and_then(|tool| tool.get_mut(&change.url))
                        {
                            if let Some(mut res) = rg.resources.remove(url) {
                                res.url = res_change.new_url.clone();
                                res.name = res_change.new_name.clone();
                                res.id = res_change.new_id.clone();
                                rg.resources.insert(res_change.new_url.clone(), res);
                            }
                        }
                        updates.push(Update::RenameResource(res_change.clone()));
                    }
                }

                if !updates.is_empty() {
                    pushes.push((user.clone(), updates));
                }
            }
        }

        for (user, updates) in pushes {
            self.push_blackboard(&user, BlackboardUpdate::of(updates));
        }
    }
}
