//! Graph handlers: resource-group updates, direct graph edits, cleaning and
//! queries.

use std::collections::BTreeMap;

use crate::api::{
    change_update, DependenciesKind, DependencyGraphResponse, DepiUpdate, DirtyLinksResponse,
    GenericResponse, InferredLinkClean, LinkInfo, LinkStreamItem, LinksResponse,
    ResourceGroupChangeInfo, ResourceGroupEdit, ResourceGroupInfo, ResourceGroupsResponse,
    ResourceInfo, ResourceStreamItem, ResourceUpdate, ResourcesResponse, Update,
};
use crate::core::{
    Link, LinkPattern, LinkWithResources, Resource, ResourceChange, ResourceGroup,
    ResourceGroupChange, ResourceGroupKey, ResourceRef, ResourceRefPattern,
};
use crate::server::access::{
    CAP_LINK_ADD, CAP_LINK_MARK_CLEAN, CAP_LINK_READ, CAP_LINK_REMOVE, CAP_RESOURCE_ADD,
    CAP_RESOURCE_CHANGE, CAP_RESOURCE_READ, CAP_RESOURCE_REMOVE, CAP_RES_GROUP_ADD,
    CAP_RES_GROUP_CHANGE, CAP_RES_GROUP_READ, CAP_RES_GROUP_REMOVE,
};
use crate::server::session::User;
use crate::store::Branch;

use super::Server;

fn link_auth_args(link: &LinkWithResources) -> [String; 6] {
    [
        link.from_group.tool_id.clone(),
        link.from_group.url.clone(),
        link.from_res.url.clone(),
        link.to_group.tool_id.clone(),
        link.to_group.url.clone(),
        link.to_res.url.clone(),
    ]
}

fn as_str_args(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

impl Server {
    /// Apply a tool's change set to its resource group, dirtying and
    /// notifying downstream links.
    pub fn update_resource_group(
        &self,
        session_id: &str,
        update_branch: &str,
        change: &ResourceGroupChangeInfo,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        let mut branch = session.branch();
        if !update_branch.is_empty() && update_branch != branch.name() {
            branch = match self.store().get_branch(update_branch) {
                Ok(branch) => branch,
                Err(e) => return GenericResponse::failure(format!("error retrieving branch: {e}")),
            };
        }

        if !self.has_capability(&session.user, CAP_RES_GROUP_CHANGE) {
            return Self::not_authorized(&session.user.name, "change resource groups");
        }
        if !self.has_capability(&session.user, CAP_RESOURCE_CHANGE) {
            return Self::not_authorized(&session.user.name, "change resources");
        }
        if !self.is_authorized(
            &session.user,
            CAP_RES_GROUP_CHANGE,
            &[&change.tool_id, &change.url],
        ) {
            return Self::not_authorized(&session.user.name, "change this resource group");
        }

        // unauthorized sub-items are dropped, the rest proceeds
        let mut allowed: BTreeMap<String, ResourceChange> = BTreeMap::new();
        for resource in &change.resources {
            let capability = match resource.change_type {
                crate::core::ChangeType::Added => CAP_RESOURCE_ADD,
                crate::core::ChangeType::Modified | crate::core::ChangeType::Renamed => {
                    CAP_RESOURCE_CHANGE
                }
                crate::core::ChangeType::Removed => CAP_RESOURCE_REMOVE,
            };
            if self.is_authorized(
                &session.user,
                capability,
                &[&change.tool_id, &change.url, &resource.url],
            ) {
                allowed.insert(resource.url.clone(), resource.clone());
            } else {
                tracing::warn!(user = %session.user.name, tool_id = %change.tool_id,
                    rg_url = %change.url, url = %resource.url,
                    "dropping unauthorized resource change");
            }
        }

        let group_change = ResourceGroupChange {
            name: change.name.clone(),
            tool_id: change.tool_id.clone(),
            url: change.url.clone(),
            version: change.version.clone(),
            resources: allowed,
        };
        let group_view = group_change.to_resource_group();

        let mut depi_updates: Vec<Update> = group_change
            .resources
            .values()
            .map(|resource| change_update(&group_view, resource))
            .collect();

        let effects = {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            let effects = match ops.update_resource_group(&group_change) {
                Ok(effects) => effects,
                Err(e) => {
                    return GenericResponse::failure(format!("error updating resource group: {e}"))
                }
            };
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
            effects
        };

        if branch.name() == super::MAIN_BRANCH {
            self.reconcile_blackboards(&group_change);
        }

        let branch_name = branch.name();
        for link in &effects {
            let update = ResourceUpdate {
                watched_resource: link.to_res.clone(),
                updated_resource: link.from_res.clone(),
            };
            self.push_resource_update(&branch_name, &link.to_res.group_key(), &update);
            depi_updates.push(Update::MarkLinkDirty(link.key()));
        }
        if !depi_updates.is_empty() {
            self.push_depi(&branch_name, DepiUpdate::of(depi_updates));
        }

        for (url, resource) in &group_change.resources {
            let change_type = match resource.change_type {
                crate::core::ChangeType::Added => "add",
                crate::core::ChangeType::Modified => "modify",
                crate::core::ChangeType::Renamed => "rename",
                crate::core::ChangeType::Removed => "remove",
            };
            self.audit(
                &session.user.name,
                "UpdateResourceGroupResource",
                format!(
                    "toolId={};rgURL={};URL={url};changeType={change_type}",
                    change.tool_id, change.url
                ),
            );
        }

        GenericResponse::success()
    }

    /// Apply a batch of direct graph edits.
    pub fn update_depi(&self, session_id: &str, updates: Vec<Update>) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        let branch = session.branch();
        let mut applied: Vec<Update> = Vec::new();

        {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };

            for update in updates {
                match &update {
                    Update::AddResource(info) => {
                        if !self.is_authorized(
                            &session.user,
                            CAP_RESOURCE_ADD,
                            &[&info.tool_id, &info.resource_group_url, &info.url],
                        ) {
                            tracing::warn!(user = %session.user.name,
                                "dropping unauthorized resource addition");
                            continue;
                        }
                        let rg = ResourceGroup::new(
                            &info.tool_id,
                            &info.resource_group_url,
                            &info.resource_group_name,
                            &info.resource_group_version,
                        );
                        let res = Resource {
                            name: info.name.clone(),
                            id: info.id.clone(),
                            url: info.url.clone(),
                            deleted: false,
                        };
                        match ops.add_resource(&rg, Some(&res)) {
                            Ok(true) => applied.push(update.clone()),
                            Ok(false) => {}
                            Err(e) => {
                                return GenericResponse::failure(format!(
                                    "error adding resource: {e}"
                                ))
                            }
                        }
                        self.audit(
                            &session.user.name,
                            "AddResource",
                            format!(
                                "toolId={};rgURL={};URL={};name={};id={}",
                                info.tool_id, info.resource_group_url, info.url, info.name, info.id
                            ),
                        );
                    }
                    Update::RemoveResource(info) => {
                        if !self.is_authorized(
                            &session.user,
                            CAP_RESOURCE_REMOVE,
                            &[&info.tool_id, &info.resource_group_url, &info.url],
                        ) {
                            tracing::warn!(user = %session.user.name,
                                "dropping unauthorized resource removal");
                            continue;
                        }
                        match ops.remove_resource_ref(&info.resource_ref()) {
                            Ok(true) => applied.push(update.clone()),
                            Ok(false) => {}
                            Err(e) => {
                                return GenericResponse::failure(format!(
                                    "error removing resource: {e}"
                                ))
                            }
                        }
                        self.audit(
                            &session.user.name,
                            "RemoveResource",
                            format!(
                                "toolId={};rgURL={};URL={};name={};id={}",
                                info.tool_id, info.resource_group_url, info.url, info.name, info.id
                            ),
                        );
                    }
                    Update::AddLink(link_info) => {
                        let args = [
                            link_info.from_res.tool_id.clone(),
                            link_info.from_res.resource_group_url.clone(),
                            link_info.from_res.url.clone(),
                            link_info.to_res.tool_id.clone(),
                            link_info.to_res.resource_group_url.clone(),
                            link_info.to_res.url.clone(),
                        ];
                        if !self.is_authorized(&session.user, CAP_LINK_ADD, &as_str_args(&args)) {
                            tracing::warn!(user = %session.user.name,
                                "dropping unauthorized link addition");
                            continue;
                        }
                        let link = link_from_info(link_info);
                        match ops.add_link(&link) {
                            Ok(true) => {
                                applied.push(update.clone());
                                self.audit(
                                    &session.user.name,
                                    "LinkResources",
                                    format!(
                                        "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                                        args[0], args[1], args[2], args[3], args[4], args[5]
                                    ),
                                );
                            }
                            Ok(false) => {}
                            Err(e) => {
                                return GenericResponse::failure(format!("error adding link: {e}"))
                            }
                        }
                    }
                    Update::RemoveLink(link_info) => {
                        let args = [
                            link_info.from_res.tool_id.clone(),
                            link_info.from_res.resource_group_url.clone(),
                            link_info.from_res.url.clone(),
                            link_info.to_res.tool_id.clone(),
                            link_info.to_res.resource_group_url.clone(),
                            link_info.to_res.url.clone(),
                        ];
                        if !self.is_authorized(&session.user, CAP_LINK_REMOVE, &as_str_args(&args))
                        {
                            tracing::warn!(user = %session.user.name,
                                "dropping unauthorized link removal");
                            continue;
                        }
                        let link = Link::new(
                            link_info.from_res.resource_ref(),
                            link_info.to_res.resource_ref(),
                        );
                        match ops.remove_link(&link) {
                            Ok(true) => {
                                applied.push(update.clone());
                                self.audit(
                                    &session.user.name,
                                    "UnlinkResources",
                                    format!(
                                        "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                                        args[0], args[1], args[2], args[3], args[4], args[5]
                                    ),
                                );
                            }
                            Ok(false) => {}
                            Err(e) => {
                                return GenericResponse::failure(format!(
                                    "error removing link: {e}"
                                ))
                            }
                        }
                    }
                    _ => {
                        tracing::warn!("unsupported update kind in UpdateDepi");
                    }
                }
            }

            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
        }

        if !applied.is_empty() {
            self.push_depi(&branch.name(), DepiUpdate::of(applied));
        }
        GenericResponse::success()
    }

    // --- resource groups --------------------------------------------------

    pub fn add_resource_group(&self, session_id: &str, group: &ResourceGroupInfo) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_RES_GROUP_ADD) {
            return Self::not_authorized(&session.user.name, "add a resource group");
        }
        if !self.is_authorized(
            &session.user,
            CAP_RES_GROUP_ADD,
            &[&group.tool_id, &group.url],
        ) {
            return Self::not_authorized(&session.user.name, "add this resource group");
        }

        let branch = session.branch();
        let mut rg = ResourceGroup::new(&group.tool_id, &group.url, &group.name, &group.version);
        for res in &group.resources {
            rg.add_resource(Resource {
                name: res.name.clone(),
                id: res.id.clone(),
                url: res.url.clone(),
                deleted: false,
            });
        }
        {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            if let Err(e) = ops.add_resource(&rg, None) {
                return GenericResponse::failure(format!("error adding resource group: {e}"));
            }
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
        }

        self.push_depi(
            &branch.name(),
            DepiUpdate::of(vec![Update::AddResourceGroup(ResourceGroupKey {
                tool_id: group.tool_id.clone(),
                url: group.url.clone(),
            })]),
        );
        self.audit(
            &session.user.name,
            "AddResourceGroup",
            format!(
                "toolId={};URL={};name={};version={}",
                group.tool_id, group.url, group.name, group.version
            ),
        );
        GenericResponse::success()
    }

    pub fn edit_resource_group(&self, session_id: &str, edit: &ResourceGroupEdit) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_RES_GROUP_CHANGE) {
            return Self::not_authorized(&session.user.name, "change a resource group");
        }
        if !self.is_authorized(
            &session.user,
            CAP_RES_GROUP_CHANGE,
            &[&edit.tool_id, &edit.url],
        ) {
            return Self::not_authorized(&session.user.name, "change this resource group");
        }

        let branch = session.branch();
        {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            let old = ResourceGroup::new(&edit.tool_id, &edit.url, "", "");
            let new = ResourceGroup::new(
                &edit.new_tool_id,
                &edit.new_url,
                &edit.new_name,
                &edit.new_version,
            );
            if let Err(e) = ops.edit_resource_group(&old, &new) {
                return GenericResponse::failure(format!("error editing resource group: {e}"));
            }
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
        }

        self.push_depi(
            &branch.name(),
            DepiUpdate::of(vec![Update::EditResourceGroup(edit.clone())]),
        );
        self.audit(
            &session.user.name,
            "EditResourceGroup",
            format!(
                "toolId={};URL={};newToolId={};newURL={};newName={};newVersion={}",
                edit.tool_id, edit.url, edit.new_tool_id, edit.new_url, edit.new_name,
                edit.new_version
            ),
        );
        GenericResponse::success()
    }

    pub fn remove_resource_group(
        &self,
        session_id: &str,
        group: &ResourceGroupKey,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_RES_GROUP_REMOVE) {
            return Self::not_authorized(&session.user.name, "remove a resource group");
        }
        if !self.is_authorized(
            &session.user,
            CAP_RES_GROUP_REMOVE,
            &[&group.tool_id, &group.url],
        ) {
            return Self::not_authorized(&session.user.name, "remove this resource group");
        }

        let branch = session.branch();
        {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            if let Err(e) = ops.remove_resource_group(&group.tool_id, &group.url) {
                return GenericResponse::failure(format!("error removing resource group: {e}"));
            }
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
        }

        self.push_depi(
            &branch.name(),
            DepiUpdate::of(vec![Update::RemoveResourceGroup(group.clone())]),
        );
        self.audit(
            &session.user.name,
            "RemoveResourceGroup",
            format!("toolId={};URL={}", group.tool_id, group.url),
        );
        GenericResponse::success()
    }

    // --- direct resource/link edits ---------------------------------------

    pub fn add_resource(
        &self,
        session_id: &str,
        tool_id: &str,
        resource_group_url: &str,
        url: &str,
        name: &str,
        id: &str,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_RESOURCE_ADD) {
            return Self::not_authorized(&session.user.name, "add a resource");
        }
        if !self.is_authorized(
            &session.user,
            CAP_RESOURCE_ADD,
            &[tool_id, resource_group_url, url],
        ) {
            return Self::not_authorized(&session.user.name, "add this resource");
        }

        let branch = session.branch();
        {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            let rg = match ops.get_resource_group(tool_id, resource_group_url) {
                Ok(Some(rg)) => rg,
                Ok(None) => {
                    return GenericResponse::failure(format!(
                        "no resource group {resource_group_url} in tool {tool_id}"
                    ))
                }
                Err(e) => {
                    return GenericResponse::failure(format!(
                        "error retrieving resource group: {e}"
                    ))
                }
            };
            let res = Resource {
                name: name.to_string(),
                id: id.to_string(),
                url: url.to_string(),
                deleted: false,
            };
            if let Err(e) = ops.add_resource(&rg, Some(&res)) {
                return GenericResponse::failure(format!("error adding resource: {e}"));
            }
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
        }

        self.push_depi(
            &branch.name(),
            DepiUpdate::of(vec![Update::AddResource(ResourceInfo {
                tool_id: tool_id.to_string(),
                resource_group_url: resource_group_url.to_string(),
                url: url.to_string(),
                name: name.to_string(),
                id: id.to_string(),
                ..ResourceInfo::default()
            })]),
        );
        self.audit(
            &session.user.name,
            "AddResource",
            format!("toolId={tool_id};rgURL={resource_group_url};URL={url};name={name};id={id}"),
        );
        GenericResponse::success()
    }

    pub fn link_resources(&self, session_id: &str, link: &crate::core::LinkKey) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_LINK_ADD) {
            return Self::not_authorized(&session.user.name, "create links");
        }
        if !self.is_authorized(
            &session.user,
            CAP_LINK_ADD,
            &[
                &link.from.tool_id,
                &link.from.resource_group_url,
                &link.from.url,
                &link.to.tool_id,
                &link.to.resource_group_url,
                &link.to.url,
            ],
        ) {
            return Self::not_authorized(&session.user.name, "create this link");
        }

        let branch = session.branch();
        let expanded = {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            let from = match ops.get_resource(&link.from, false) {
                Ok(Some(from)) => from,
                Ok(None) => {
                    return GenericResponse::failure(format!(
                        "no resource {} in {} {}",
                        link.from.url, link.from.tool_id, link.from.resource_group_url
                    ))
                }
                Err(e) => {
                    return GenericResponse::failure(format!("error retrieving resource: {e}"))
                }
            };
            let to = match ops.get_resource(&link.to, false) {
                Ok(Some(to)) => to,
                Ok(None) => {
                    return GenericResponse::failure(format!(
                        "no resource {} in {} {}",
                        link.to.url, link.to.tool_id, link.to.resource_group_url
                    ))
                }
                Err(e) => {
                    return GenericResponse::failure(format!("error retrieving resource: {e}"))
                }
            };
            let expanded = LinkWithResources {
                from_group: from.resource_group,
                from_res: from.resource,
                to_group: to.resource_group,
                to_res: to.resource,
                dirty: false,
                deleted: false,
                last_clean_version: String::new(),
                inferred_dirtiness: Vec::new(),
            };
            if let Err(e) = ops.add_link(&expanded) {
                return GenericResponse::failure(format!("error adding link: {e}"));
            }
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
            expanded
        };

        self.push_depi(
            &branch.name(),
            DepiUpdate::of(vec![Update::AddLink(LinkInfo::from(&expanded))]),
        );
        self.audit(
            &session.user.name,
            "AddLink",
            format!(
                "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                link.from.tool_id,
                link.from.resource_group_url,
                link.from.url,
                link.to.tool_id,
                link.to.resource_group_url,
                link.to.url
            ),
        );
        GenericResponse::success()
    }

    pub fn unlink_resources(&self, session_id: &str, link: &crate::core::LinkKey) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_LINK_REMOVE) {
            return Self::not_authorized(&session.user.name, "remove links");
        }
        if !self.is_authorized(
            &session.user,
            CAP_LINK_REMOVE,
            &[
                &link.from.tool_id,
                &link.from.resource_group_url,
                &link.from.url,
                &link.to.tool_id,
                &link.to.resource_group_url,
                &link.to.url,
            ],
        ) {
            return Self::not_authorized(&session.user.name, "remove this link");
        }

        let branch = session.branch();
        let target = Link::new(link.from.clone(), link.to.clone());
        {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            if let Err(e) = ops.remove_link(&target) {
                return GenericResponse::failure(format!("error removing link: {e}"));
            }
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
        }

        self.push_depi(
            &branch.name(),
            DepiUpdate::of(vec![Update::RemoveLink(LinkInfo::from(&target))]),
        );
        self.audit(
            &session.user.name,
            "RemoveLink",
            format!(
                "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                link.from.tool_id,
                link.from.resource_group_url,
                link.from.url,
                link.to.tool_id,
                link.to.resource_group_url,
                link.to.url
            ),
        );
        GenericResponse::success()
    }

    // --- cleaning ---------------------------------------------------------

    pub fn mark_links_clean(
        &self,
        session_id: &str,
        links: Vec<crate::core::LinkKey>,
        propagate: bool,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_LINK_MARK_CLEAN) {
            return Self::not_authorized(&session.user.name, "mark links clean");
        }

        let mut to_clean: Vec<Link> = Vec::new();
        for key in links {
            if self.is_authorized(
                &session.user,
                CAP_LINK_MARK_CLEAN,
                &[
                    &key.from.tool_id,
                    &key.from.resource_group_url,
                    &key.from.url,
                    &key.to.tool_id,
                    &key.to.resource_group_url,
                    &key.to.url,
                ],
            ) {
                to_clean.push(Link::new(key.from, key.to));
            } else {
                tracing::warn!(user = %session.user.name, "dropping unauthorized link clean");
            }
        }

        let branch = session.branch();
        {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            if let Err(e) = ops.mark_links_clean(&to_clean, propagate) {
                return GenericResponse::failure(format!("error cleaning links: {e}"));
            }
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
        }

        if !to_clean.is_empty() {
            let updates = to_clean
                .iter()
                .map(|link| Update::MarkLinkClean(LinkInfo::from(link)))
                .collect();
            self.push_depi(&branch.name(), DepiUpdate::of(updates));
            for link in &to_clean {
                self.audit(
                    &session.user.name,
                    "CleanedLink",
                    format!(
                        "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                        link.from_res.tool_id,
                        link.from_res.resource_group_url,
                        link.from_res.url,
                        link.to_res.tool_id,
                        link.to_res.resource_group_url,
                        link.to_res.url
                    ),
                );
            }
        }
        GenericResponse::success()
    }

    pub fn mark_resources_clean(
        &self,
        session_id: &str,
        refs: Vec<ResourceRef>,
        propagate: bool,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_LINK_MARK_CLEAN) {
            return Self::not_authorized(&session.user.name, "mark links clean");
        }

        let branch = session.branch();
        {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            if let Err(e) = ops.mark_resources_clean(&refs, propagate) {
                return GenericResponse::failure(format!("error cleaning resources: {e}"));
            }
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
        }

        for rr in &refs {
            self.audit(
                &session.user.name,
                "CleanedResource",
                format!(
                    "toolId={};rgURL={};URL={};propagate={propagate}",
                    rr.tool_id, rr.resource_group_url, rr.url
                ),
            );
        }
        GenericResponse::success()
    }

    pub fn mark_inferred_dirtiness_clean(
        &self,
        session_id: &str,
        link: &crate::core::LinkKey,
        dirtiness_source: &ResourceRef,
        propagate: bool,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_LINK_MARK_CLEAN) {
            return Self::not_authorized(&session.user.name, "mark links clean");
        }
        if !self.is_authorized(
            &session.user,
            CAP_LINK_MARK_CLEAN,
            &[
                &link.from.tool_id,
                &link.from.resource_group_url,
                &link.from.url,
                &link.to.tool_id,
                &link.to.resource_group_url,
                &link.to.url,
            ],
        ) {
            return Self::not_authorized(&session.user.name, "mark this link clean");
        }

        let target = Link::new(link.from.clone(), link.to.clone());
        let branch = session.branch();
        let cleaned = {
            let mut ops = match branch.ops() {
                Ok(ops) => ops,
                Err(e) => return GenericResponse::failure(format!("error locking branch: {e}")),
            };
            let cleaned =
                match ops.mark_inferred_dirtiness_clean(&target, dirtiness_source, propagate) {
                    Ok(cleaned) => cleaned,
                    Err(e) => {
                        return GenericResponse::failure(format!("error cleaning links: {e}"))
                    }
                };
            if let Err(e) = ops.save_branch_state() {
                return GenericResponse::failure(format!("error saving branch state: {e}"));
            }
            cleaned
        };

        if !cleaned.is_empty() {
            let updates = cleaned
                .iter()
                .map(|item| {
                    Update::MarkInferredLinkClean(InferredLinkClean {
                        link: item.link.key(),
                        resource: item.source.clone(),
                    })
                })
                .collect();
            self.push_depi(&branch.name(), DepiUpdate::of(updates));
            for item in &cleaned {
                self.audit(
                    &session.user.name,
                    "CleanedInferredLink",
                    format!(
                        "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={};sourceToolId={};sourceRgURL={};sourceURL={};propagate={propagate}",
                        item.link.from_res.tool_id,
                        item.link.from_res.resource_group_url,
                        item.link.from_res.url,
                        item.link.to_res.tool_id,
                        item.link.to_res.resource_group_url,
                        item.link.to_res.url,
                        item.source.tool_id,
                        item.source.resource_group_url,
                        item.source.url
                    ),
                );
            }
        }
        GenericResponse::success()
    }

    // --- queries ----------------------------------------------------------

    pub fn get_dirty_links(
        &self,
        session_id: &str,
        tool_id: &str,
        url: &str,
        with_inferred: bool,
    ) -> DirtyLinksResponse {
        let failure = |msg: String| DirtyLinksResponse {
            ok: false,
            msg,
            links: Vec::new(),
            resources: Vec::new(),
        };
        let Some(session) = self.session(session_id) else {
            return failure(format!("invalid session: {session_id}"));
        };
        if !self.has_capability(&session.user, CAP_LINK_READ) {
            return failure(format!("user {} cannot read links", session.user.name));
        }

        let branch = session.branch();
        let group = ResourceGroupKey {
            tool_id: tool_id.to_string(),
            url: url.to_string(),
        };
        let dirty = branch
            .ops()
            .and_then(|mut ops| ops.get_dirty_links(&group, with_inferred));
        let dirty = match dirty {
            Ok(dirty) => dirty,
            Err(e) => return failure(format!("error reading dirty links: {e}")),
        };

        let mut links = Vec::new();
        let mut resources = Vec::new();
        for link in &dirty {
            let args = link_auth_args(link);
            if self.is_authorized(&session.user, CAP_LINK_READ, &as_str_args(&args)) {
                resources.push(ResourceInfo::from_parts(&link.to_group, &link.to_res));
                links.push(LinkInfo::from(link));
            }
        }
        DirtyLinksResponse {
            ok: true,
            msg: String::new(),
            links,
            resources,
        }
    }

    pub fn get_dirty_links_stream(
        &self,
        session_id: &str,
        tool_id: &str,
        url: &str,
        with_inferred: bool,
        sink: &mut dyn FnMut(LinkStreamItem),
    ) {
        let response = self.get_dirty_links(session_id, tool_id, url, with_inferred);
        if !response.ok {
            sink(LinkStreamItem {
                ok: false,
                msg: response.msg,
                resource_link: None,
            });
            return;
        }
        for link in response.links {
            sink(LinkStreamItem {
                ok: true,
                msg: String::new(),
                resource_link: Some(link),
            });
        }
    }

    pub fn get_resource_groups(&self, session_id: &str) -> ResourceGroupsResponse {
        let failure = |msg: String| ResourceGroupsResponse {
            ok: false,
            msg,
            resource_groups: Vec::new(),
        };
        let Some(session) = self.session(session_id) else {
            return failure(format!("invalid session: {session_id}"));
        };
        if !self.has_capability(&session.user, CAP_RES_GROUP_READ) {
            return failure(format!(
                "user {} not authorized to read any resource group",
                session.user.name
            ));
        }
        let branch = session.branch();
        self.resource_groups_of(branch.as_ref(), failure)
    }

    pub fn get_resource_groups_for_tag(&self, session_id: &str, tag: &str) -> ResourceGroupsResponse {
        let failure = |msg: String| ResourceGroupsResponse {
            ok: false,
            msg,
            resource_groups: Vec::new(),
        };
        let Some(session) = self.session(session_id) else {
            return failure(format!("invalid session: {session_id}"));
        };
        if !self.has_capability(&session.user, CAP_RES_GROUP_READ) {
            return failure(format!(
                "user {} not authorized to read any resource group",
                session.user.name
            ));
        }
        let tag = match self.store().get_tag(tag) {
            Ok(tag) => tag,
            Err(e) => return failure(format!("unable to access tag: {e}")),
        };
        self.resource_groups_of(tag.as_ref(), failure)
    }

    fn resource_groups_of(
        &self,
        branch: &dyn Branch,
        failure: impl Fn(String) -> ResourceGroupsResponse,
    ) -> ResourceGroupsResponse {
        let groups = branch.ops().and_then(|mut ops| ops.get_resource_groups());
        match groups {
            Ok(groups) => ResourceGroupsResponse {
                ok: true,
                msg: String::new(),
                resource_groups: groups
                    .into_iter()
                    .map(|rg| ResourceGroupInfo {
                        tool_id: rg.tool_id,
                        url: rg.url,
                        name: rg.name,
                        version: rg.version,
                        resources: Vec::new(),
                    })
                    .collect(),
            },
            Err(e) => failure(format!("error reading resource groups: {e}")),
        }
    }

    fn authorized_patterns(
        &self,
        user: &User,
        patterns: Vec<ResourceRefPattern>,
    ) -> Vec<ResourceRefPattern> {
        patterns
            .into_iter()
            .filter(|pattern| {
                self.is_authorized(
                    user,
                    CAP_RES_GROUP_READ,
                    &[&pattern.tool_id, &pattern.resource_group_url],
                )
            })
            .collect()
    }

    pub fn get_resources(
        &self,
        session_id: &str,
        patterns: Vec<ResourceRefPattern>,
        include_deleted: bool,
    ) -> ResourcesResponse {
        let failure = |msg: String| ResourcesResponse {
            ok: false,
            msg,
            resources: Vec::new(),
        };
        let Some(session) = self.session(session_id) else {
            return failure(format!("invalid session: {session_id}"));
        };
        if !self.has_capability(&session.user, CAP_RESOURCE_READ) {
            return failure(format!(
                "user {} not authorized to read any resource",
                session.user.name
            ));
        }

        let patterns = self.authorized_patterns(&session.user, patterns);
        let branch = session.branch();
        let found = branch
            .ops()
            .and_then(|mut ops| ops.get_resources(&patterns, include_deleted));
        let found = match found {
            Ok(found) => found,
            Err(e) => return failure(format!("error reading resources: {e}")),
        };

        let resources = found
            .iter()
            .filter(|item| {
                self.is_authorized(
                    &session.user,
                    CAP_RESOURCE_READ,
                    &[
                        &item.resource_group.tool_id,
                        &item.resource_group.url,
                        &item.resource.url,
                    ],
                )
            })
            .map(|item| ResourceInfo::from_parts(&item.resource_group, &item.resource))
            .collect();
        ResourcesResponse {
            ok: true,
            msg: String::new(),
            resources,
        }
    }

    pub fn get_resources_stream(
        &self,
        session_id: &str,
        patterns: Vec<ResourceRefPattern>,
        include_deleted: bool,
        sink: &mut dyn FnMut(ResourceStreamItem),
    ) {
        let response = self.get_resources(session_id, patterns, include_deleted);
        if !response.ok {
            sink(ResourceStreamItem {
                ok: false,
                msg: response.msg,
                resource: None,
            });
            return;
        }
        for resource in response.resources {
            sink(ResourceStreamItem {
                ok: true,
                msg: String::new(),
                resource: Some(resource),
            });
        }
    }

    pub fn get_links(&self, session_id: &str, patterns: Vec<LinkPattern>) -> LinksResponse {
        let failure = |msg: String| LinksResponse {
            ok: false,
            msg,
            resource_links: Vec::new(),
        };
        let Some(session) = self.session(session_id) else {
            return failure(format!("invalid session: {session_id}"));
        };
        if !self.has_capability(&session.user, CAP_LINK_READ) {
            return failure(format!(
                "user {} not authorized to read any link",
                session.user.name
            ));
        }
        let branch = session.branch();
        let found = branch.ops().and_then(|mut ops| ops.get_links(&patterns));
        let found = match found {
            Ok(found) => found,
            Err(e) => return failure(format!("error fetching links: {e}")),
        };
        LinksResponse {
            ok: true,
            msg: String::new(),
            resource_links: self.filter_readable(&session.user, found),
        }
    }

    pub fn get_all_links(&self, session_id: &str, include_deleted: bool) -> LinksResponse {
        let failure = |msg: String| LinksResponse {
            ok: false,
            msg,
            resource_links: Vec::new(),
        };
        let Some(session) = self.session(session_id) else {
            return failure(format!("invalid session: {session_id}"));
        };
        if !self.has_capability(&session.user, CAP_LINK_READ) {
            return failure(format!(
                "user {} not authorized to read any link",
                session.user.name
            ));
        }
        let branch = session.branch();
        let found = branch
            .ops()
            .and_then(|mut ops| ops.get_all_links(include_deleted));
        let found = match found {
            Ok(found) => found,
            Err(e) => return failure(format!("error reading links: {e}")),
        };
        LinksResponse {
            ok: true,
            msg: String::new(),
            resource_links: self.filter_readable(&session.user, found),
        }
    }

    pub fn get_links_stream(
        &self,
        session_id: &str,
        patterns: Vec<LinkPattern>,
        sink: &mut dyn FnMut(LinkStreamItem),
    ) {
        let response = self.get_links(session_id, patterns);
        Self::stream_links(response, sink);
    }

    pub fn get_all_links_stream(
        &self,
        session_id: &str,
        include_deleted: bool,
        sink: &mut dyn FnMut(LinkStreamItem),
    ) {
        let response = self.get_all_links(session_id, include_deleted);
        Self::stream_links(response, sink);
    }

    fn stream_links(response: LinksResponse, sink: &mut dyn FnMut(LinkStreamItem)) {
        if !response.ok {
            sink(LinkStreamItem {
                ok: false,
                msg: response.msg,
                resource_link: None,
            });
            return;
        }
        for link in response.resource_links {
            sink(LinkStreamItem {
                ok: true,
                msg: String::new(),
                resource_link: Some(link),
            });
        }
    }

    fn filter_readable(&self, user: &User, links: Vec<LinkWithResources>) -> Vec<LinkInfo> {
        links
            .iter()
            .filter(|link| {
                let args = link_auth_args(link);
                let readable =
                    self.is_authorized(user, CAP_LINK_READ, &as_str_args(&args));
                if !readable {
                    tracing::warn!(user = %user.name, "dropping unreadable link from response");
                }
                readable
            })
            .map(LinkInfo::from)
            .collect()
    }

    pub fn get_dependency_graph(
        &self,
        session_id: &str,
        resource: &ResourceRef,
        dependencies_type: DependenciesKind,
        max_depth: i32,
    ) -> DependencyGraphResponse {
        let failure = |msg: String| DependencyGraphResponse {
            ok: false,
            msg,
            resource: None,
            links: Vec::new(),
        };
        let Some(session) = self.session(session_id) else {
            return failure(format!("invalid session: {session_id}"));
        };
        if !self.has_capability(&session.user, CAP_LINK_READ) {
            return failure(format!(
                "user {} not authorized to read any link",
                session.user.name
            ));
        }

        let branch = session.branch();
        let mut ops = match branch.ops() {
            Ok(ops) => ops,
            Err(e) => return failure(format!("error locking branch: {e}")),
        };
        let root = match ops.get_resource(resource, false) {
            Ok(Some(root)) => root,
            Ok(None) => return failure("parent resource not found".to_string()),
            Err(e) => return failure(format!("error retrieving resource: {e}")),
        };
        let upstream = matches!(dependencies_type, DependenciesKind::Dependencies);
        let links = match ops.get_dependency_graph(resource, upstream, max_depth) {
            Ok(links) => links,
            Err(e) => return failure(format!("error fetching dependency graph: {e}")),
        };
        drop(ops);

        DependencyGraphResponse {
            ok: true,
            msg: String::new(),
            resource: Some(ResourceInfo::from_parts(
                &root.resource_group,
                &root.resource,
            )),
            links: self.filter_readable(&session.user, links),
        }
    }
}

fn link_from_info(info: &LinkInfo) -> LinkWithResources {
    LinkWithResources {
        from_group: ResourceGroup::new(
            &info.from_res.tool_id,
            &info.from_res.resource_group_url,
            &info.from_res.resource_group_name,
            &info.from_res.resource_group_version,
        ),
        from_res: Resource {
            name: info.from_res.name.clone(),
            id: info.from_res.id.clone(),
            url: info.from_res.url.clone(),
            deleted: false,
        },
        to_group: ResourceGroup::new(
            &info.to_res.tool_id,
            &info.to_res.resource_group_url,
            &info.to_res.resource_group_name,
            &info.to_res.resource_group_version,
        ),
        to_res: Resource {
            name: info.to_res.name.clone(),
            id: info.to_res.id.clone(),
            url: info.to_res.url.clone(),
            deleted: false,
        },
        dirty: false,
        deleted: false,
        last_clean_version: String::new(),
        inferred_dirtiness: Vec::new(),
    }
}

