//! Payload types the RPC transport serializes.
//!
//! The transport itself is an external collaborator; these types carry the
//! wire field names. Every mutating operation answers a [`GenericResponse`],
//! every query a typed payload that itself carries `ok`/`msg`.

mod convert;

pub use convert::{change_update, expand_change};

use serde::{Deserialize, Serialize};

use crate::core::{LinkKey, ResourceChange, ResourceGroupKey, ResourceRef};

/// Response to a mutating operation. `ok` is false whenever `msg` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericResponse {
    pub ok: bool,
    pub msg: String,
}

impl GenericResponse {
    pub fn success() -> Self {
        GenericResponse {
            ok: true,
            msg: String::new(),
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        GenericResponse {
            ok: false,
            msg: msg.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub ok: bool,
    pub msg: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "loginToken")]
    pub login_token: String,
    pub user: String,
}

impl LoginResponse {
    pub fn failure(msg: impl Into<String>) -> Self {
        LoginResponse {
            ok: false,
            msg: msg.into(),
            session_id: String::new(),
            login_token: String::new(),
            user: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub ok: bool,
    pub msg: String,
    #[serde(rename = "loginToken")]
    pub login_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentBranchResponse {
    pub ok: bool,
    pub msg: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchListResponse {
    pub ok: bool,
    pub msg: String,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastKnownVersionResponse {
    pub ok: bool,
    pub msg: String,
    pub version: String,
}

/// A resource with its group context flattened in, the query response shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    #[serde(rename = "toolId")]
    pub tool_id: String,
    #[serde(rename = "resourceGroupURL")]
    pub resource_group_url: String,
    #[serde(rename = "resourceGroupName")]
    pub resource_group_name: String,
    #[serde(rename = "resourceGroupVersion")]
    pub resource_group_version: String,
    pub name: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub id: String,
    pub deleted: bool,
}

impl ResourceInfo {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            tool_id: self.tool_id.clone(),
            resource_group_url: self.resource_group_url.clone(),
            url: self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupInfo {
    #[serde(rename = "toolId")]
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub name: String,
    pub version: String,
    pub resources: Vec<ResourceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredDirtinessInfo {
    #[serde(rename = "Resource")]
    pub resource: ResourceInfo,
    #[serde(rename = "lastCleanVersion")]
    pub last_clean_version: String,
}

/// An expanded link, endpoints resolved to [`ResourceInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    #[serde(rename = "fromRes")]
    pub from_res: ResourceInfo,
    #[serde(rename = "toRes")]
    pub to_res: ResourceInfo,
    pub dirty: bool,
    pub deleted: bool,
    #[serde(rename = "lastCleanVersion")]
    pub last_clean_version: String,
    #[serde(rename = "inferredDirtiness")]
    pub inferred_dirtiness: Vec<InferredDirtinessInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupEdit {
    #[serde(rename = "toolId")]
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "newToolId")]
    pub new_tool_id: String,
    #[serde(rename = "newURL")]
    pub new_url: String,
    #[serde(rename = "newName")]
    pub new_name: String,
    #[serde(rename = "newVersion")]
    pub new_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupVersionChange {
    pub name: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "toolId")]
    pub tool_id: String,
    pub version: String,
    #[serde(rename = "newVersion")]
    pub new_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRename {
    #[serde(rename = "fromRes")]
    pub from_res: ResourceInfo,
    #[serde(rename = "fromResNew")]
    pub from_res_new: ResourceInfo,
    #[serde(rename = "toRes")]
    pub to_res: ResourceInfo,
    #[serde(rename = "toResNew")]
    pub to_res_new: ResourceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredLinkClean {
    pub link: LinkKey,
    pub resource: ResourceRef,
}

/// The event taxonomy fanned out to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "updateType", content = "update")]
pub enum Update {
    AddResource(ResourceInfo),
    RemoveResource(ResourceInfo),
    RenameResource(ResourceChange),
    ChangeResource(ResourceChange),
    AddLink(LinkInfo),
    RemoveLink(LinkInfo),
    RenameLink(LinkRename),
    MarkLinkDirty(LinkKey),
    MarkLinkClean(LinkInfo),
    MarkInferredLinkClean(InferredLinkClean),
    AddResourceGroup(ResourceGroupKey),
    EditResourceGroup(ResourceGroupEdit),
    RemoveResourceGroup(ResourceGroupKey),
    ResourceGroupVersionChanged(ResourceGroupVersionChange),
}

/// One per-resource notification: a watched resource's upstream changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUpdate {
    #[serde(rename = "watchedResource")]
    pub watched_resource: ResourceRef,
    #[serde(rename = "updatedResource")]
    pub updated_resource: ResourceRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesUpdatedNotification {
    pub ok: bool,
    pub msg: String,
    pub updates: Vec<ResourceUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackboardUpdate {
    pub ok: bool,
    pub msg: String,
    pub updates: Vec<Update>,
}

impl BlackboardUpdate {
    pub fn of(updates: Vec<Update>) -> Self {
        BlackboardUpdate {
            ok: true,
            msg: String::new(),
            updates,
        }
    }

    pub fn timeout() -> Self {
        BlackboardUpdate {
            ok: false,
            msg: "timeout".to_string(),
            updates: Vec::new(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        !self.ok && self.msg == "timeout"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepiUpdate {
    pub ok: bool,
    pub msg: String,
    pub updates: Vec<Update>,
}

impl DepiUpdate {
    pub fn of(updates: Vec<Update>) -> Self {
        DepiUpdate {
            ok: true,
            msg: String::new(),
            updates,
        }
    }

    pub fn timeout() -> Self {
        DepiUpdate {
            ok: false,
            msg: "timeout".to_string(),
            updates: Vec::new(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        !self.ok && self.msg == "timeout"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupsResponse {
    pub ok: bool,
    pub msg: String,
    #[serde(rename = "resourceGroups")]
    pub resource_groups: Vec<ResourceGroupInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesResponse {
    pub ok: bool,
    pub msg: String,
    pub resources: Vec<ResourceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinksResponse {
    pub ok: bool,
    pub msg: String,
    #[serde(rename = "resourceLinks")]
    pub resource_links: Vec<LinkInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyLinksResponse {
    pub ok: bool,
    pub msg: String,
    pub links: Vec<LinkInfo>,
    pub resources: Vec<ResourceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraphResponse {
    pub ok: bool,
    pub msg: String,
    pub resource: Option<ResourceInfo>,
    pub links: Vec<LinkInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackboardResourcesResponse {
    pub ok: bool,
    pub msg: String,
    pub resources: Vec<ResourceInfo>,
    pub links: Vec<LinkInfo>,
}

/// One element of a resource query stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStreamItem {
    pub ok: bool,
    pub msg: String,
    pub resource: Option<ResourceInfo>,
}

/// One element of a link query stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStreamItem {
    pub ok: bool,
    pub msg: String,
    #[serde(rename = "resourceLink")]
    pub resource_link: Option<LinkInfo>,
}

/// Direction selector for `GetDependencyGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependenciesKind {
    /// Upstream: what the resource depends on (incoming edges).
    Dependencies,
    /// Downstream: what depends on the resource (outgoing edges).
    Dependants,
}

/// The change set for `UpdateResourceGroup`, resources carried as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupChangeInfo {
    #[serde(rename = "toolId")]
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub name: String,
    pub version: String,
    pub resources: Vec<ResourceChange>,
}
