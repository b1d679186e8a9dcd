//! In-memory store with JSON snapshot durability.
//!
//! Branches are live maps mutated in place under the branch guard.
//! `save_branch_state` is the only durability point: it bumps the branch
//! version and writes `<stateDir>/<branch>/<version>`. Tags are deep copies
//! marked immutable, persisted as `<stateDir>/tags/<tag>` pointer files.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::{
    covers, normalize_url, Link, LinkKey, LinkPattern, LinkWithResources, Resource, ResourceGroup,
    ResourceGroupAndResource, ResourceGroupChange, ResourceGroupKey, ResourceRef,
    ResourceRefPattern, SourceDirtiness,
};

use super::{
    compile_link_patterns, compile_patterns, Branch, BranchOps, CleanedLink, LinkSink,
    ResourceSink, Store, StoreError, StoreResult,
};

const MAIN_BRANCH: &str = "main";
const TAGS_DIR: &str = "tags";

pub struct MemStore {
    state_dir: PathBuf,
    config: Arc<Config>,
    catalog: Mutex<Catalog>,
}

struct Catalog {
    branches: BTreeMap<String, Arc<MemBranch>>,
    tags: BTreeMap<String, Arc<MemBranch>>,
}

#[derive(Debug)]
pub struct MemBranch {
    name: String,
    is_tag: bool,
    state_dir: PathBuf,
    config: Arc<Config>,
    state: Mutex<BranchState>,
}

#[derive(Debug, Clone, Default)]
struct BranchState {
    last_version: i64,
    parent_name: String,
    parent_version: i64,
    tools: BTreeMap<String, BTreeMap<String, ResourceGroup>>,
    links: BTreeMap<LinkKey, Link>,
}

/// On-disk snapshot shape.
#[derive(Debug, Serialize, Deserialize)]
struct BranchSnapshot {
    name: String,
    #[serde(rename = "lastVersion")]
    last_version: i64,
    #[serde(rename = "parentName", default)]
    parent_name: String,
    #[serde(rename = "parentVersion", default)]
    parent_version: i64,
    tools: BTreeMap<String, BTreeMap<String, ResourceGroup>>,
    links: Vec<Link>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TagPointer {
    branch: String,
    version: i64,
}

impl MemStore {
    /// Open the store, reconstructing branches and tags from the state
    /// directory. `main` always exists.
    pub fn open(config: Arc<Config>) -> StoreResult<Self> {
        let state_dir = PathBuf::from(config.state_dir());
        fs::create_dir_all(&state_dir)
            .map_err(|e| StoreError::Backend(format!("cannot create state dir: {e}")))?;

        let store = MemStore {
            state_dir: state_dir.clone(),
            config: config.clone(),
            catalog: Mutex::new(Catalog {
                branches: BTreeMap::new(),
                tags: BTreeMap::new(),
            }),
        };

        {
            let mut catalog = store.lock_catalog()?;
            store.load_all_state(&mut catalog);
            if !catalog.branches.contains_key(MAIN_BRANCH) {
                catalog.branches.insert(
                    MAIN_BRANCH.to_string(),
                    Arc::new(store.new_branch(MAIN_BRANCH, BranchState::default(), false)),
                );
            }
        }
        Ok(store)
    }

    fn new_branch(&self, name: &str, state: BranchState, is_tag: bool) -> MemBranch {
        MemBranch {
            name: name.to_string(),
            is_tag,
            state_dir: self.state_dir.clone(),
            config: self.config.clone(),
            state: Mutex::new(state),
        }
    }

    fn lock_catalog(&self) -> StoreResult<MutexGuard<'_, Catalog>> {
        self.catalog
            .lock()
            .map_err(|_| StoreError::Backend("store catalog lock poisoned".to_string()))
    }

    fn load_all_state(&self, catalog: &mut Catalog) {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let branch_name = entry.file_name().to_string_lossy().to_string();
            if branch_name == TAGS_DIR || !entry.path().is_dir() {
                continue;
            }
            match latest_snapshot_version(&entry.path()) {
                Some(version) => match self.load_branch_state(&branch_name, version) {
                    Ok(state) => {
                        catalog.branches.insert(
                            branch_name.clone(),
                            Arc::new(self.new_branch(&branch_name, state, false)),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(branch = %branch_name, error = %e, "skipping unloadable branch");
                    }
                },
                None => continue,
            }
        }

        let tags_dir = self.state_dir.join(TAGS_DIR);
        let entries = match fs::read_dir(&tags_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let tag_name = entry.file_name().to_string_lossy().to_string();
            let pointer: TagPointer = match fs::read(entry.path())
                .map_err(|e| StoreError::Backend(e.to_string()))
                .and_then(|data| {
                    serde_json::from_slice(&data).map_err(|e| StoreError::Backend(e.to_string()))
                }) {
                Ok(pointer) => pointer,
                Err(e) => {
                    tracing::warn!(tag = %tag_name, error = %e, "skipping unreadable tag pointer");
                    continue;
                }
            };
            match self.load_branch_state(&pointer.branch, pointer.version) {
                Ok(state) => {
                    catalog
                        .tags
                        .insert(tag_name.clone(), Arc::new(self.new_branch(&tag_name, state, true)));
                }
                Err(e) => {
                    tracing::warn!(tag = %tag_name, branch = %pointer.branch,
                        version = pointer.version, error = %e, "skipping unloadable tag");
                }
            }
        }
    }

    fn load_branch_state(&self, branch: &str, version: i64) -> StoreResult<BranchState> {
        let path = self.state_dir.join(branch).join(version.to_string());
        let data = fs::read(&path)
            .map_err(|e| StoreError::Backend(format!("cannot read {}: {e}", path.display())))?;
        let snapshot: BranchSnapshot = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Backend(format!("cannot parse {}: {e}", path.display())))?;
        let links = snapshot
            .links
            .into_iter()
            .map(|link| (link.key(), link))
            .collect();
        Ok(BranchState {
            last_version: snapshot.last_version,
            parent_name: snapshot.parent_name,
            parent_version: snapshot.parent_version,
            tools: snapshot.tools,
            links,
        })
    }
}

fn latest_snapshot_version(branch_dir: &Path) -> Option<i64> {
    let mut latest = 0;
    for entry in fs::read_dir(branch_dir).ok()?.flatten() {
        if let Ok(version) = entry.file_name().to_string_lossy().parse::<i64>() {
            if version > latest {
                latest = version;
            }
        }
    }
    (latest > 0).then_some(latest)
}

impl Store for MemStore {
    fn get_branch(&self, name: &str) -> StoreResult<Arc<dyn Branch>> {
        let catalog = self.lock_catalog()?;
        if let Some(branch) = catalog.branches.get(name) {
            return Ok(branch.clone());
        }
        if catalog.tags.contains_key(name) {
            return Err(StoreError::WrongKind {
                name: name.to_string(),
                expected: "branch",
                actual: "tag",
            });
        }
        Err(StoreError::branch_not_found(name))
    }

    fn get_tag(&self, name: &str) -> StoreResult<Arc<dyn Branch>> {
        let catalog = self.lock_catalog()?;
        if let Some(tag) = catalog.tags.get(name) {
            return Ok(tag.clone());
        }
        if catalog.branches.contains_key(name) {
            return Err(StoreError::WrongKind {
                name: name.to_string(),
                expected: "tag",
                actual: "branch",
            });
        }
        Err(StoreError::tag_not_found(name))
    }

    fn branch_exists(&self, name: &str) -> bool {
        self.lock_catalog()
            .map(|catalog| catalog.branches.contains_key(name))
            .unwrap_or(false)
    }

    fn tag_exists(&self, name: &str) -> bool {
        self.lock_catalog()
            .map(|catalog| catalog.tags.contains_key(name))
            .unwrap_or(false)
    }

    fn create_branch(&self, name: &str, from_branch: &str) -> StoreResult<Arc<dyn Branch>> {
        let mut catalog = self.lock_catalog()?;
        if catalog.branches.contains_key(name) {
            return Err(StoreError::DuplicateName {
                kind: "branch",
                name: name.to_string(),
            });
        }
        let source = catalog
            .branches
            .get(from_branch)
            .cloned()
            .ok_or_else(|| StoreError::branch_not_found(from_branch))?;
        // Persist the source first so the recorded parent version names an
        // on-disk snapshot matching the forked content.
        source.persist_snapshot()?;
        let state = source.fork_state(from_branch)?;
        let branch = Arc::new(self.new_branch(name, state, false));
        catalog.branches.insert(name.to_string(), branch.clone());
        Ok(branch)
    }

    fn create_branch_from_tag(&self, name: &str, from_tag: &str) -> StoreResult<Arc<dyn Branch>> {
        let mut catalog = self.lock_catalog()?;
        if catalog.branches.contains_key(name) {
            return Err(StoreError::DuplicateName {
                kind: "branch",
                name: name.to_string(),
            });
        }
        let source = catalog
            .tags
            .get(from_tag)
            .cloned()
            .ok_or_else(|| StoreError::tag_not_found(from_tag))?;
        let state = source.fork_state(from_tag)?;
        let branch = Arc::new(self.new_branch(name, state, false));
        catalog.branches.insert(name.to_string(), branch.clone());
        Ok(branch)
    }

    fn create_tag(&self, name: &str, from_branch: &str) -> StoreResult<Arc<dyn Branch>> {
        let mut catalog = self.lock_catalog()?;
        if catalog.tags.contains_key(name) {
            return Err(StoreError::DuplicateName {
                kind: "tag",
                name: name.to_string(),
            });
        }
        let source = catalog
            .branches
            .get(from_branch)
            .cloned()
            .ok_or_else(|| StoreError::branch_not_found(from_branch))?;
        // Persist the source first so the pointer names an existing snapshot.
        source.persist_snapshot()?;
        let (state, source_version) = {
            let state = source.lock_state()?;
            (state.clone(), state.last_version)
        };
        let tag = Arc::new(self.new_branch(name, state, true));

        let tags_dir = self.state_dir.join(TAGS_DIR);
        fs::create_dir_all(&tags_dir)
            .map_err(|e| StoreError::Backend(format!("cannot create tags dir: {e}")))?;
        let pointer = TagPointer {
            branch: from_branch.to_string(),
            version: source_version,
        };
        let data = serde_json::to_vec(&pointer)
            .map_err(|e| StoreError::Backend(format!("cannot encode tag pointer: {e}")))?;
        fs::write(tags_dir.join(name), data)
            .map_err(|e| StoreError::Backend(format!("cannot write tag pointer: {e}")))?;

        catalog.tags.insert(name.to_string(), tag.clone());
        Ok(tag)
    }

    fn branch_list(&self) -> StoreResult<Vec<String>> {
        Ok(self.lock_catalog()?.branches.keys().cloned().collect())
    }

    fn tag_list(&self) -> StoreResult<Vec<String>> {
        Ok(self.lock_catalog()?.tags.keys().cloned().collect())
    }
}

impl MemBranch {
    fn lock_state(&self) -> StoreResult<MutexGuard<'_, BranchState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend(format!("branch {} lock poisoned", self.name)))
    }

    /// Deep copy for a new branch: fresh version counter, parent recorded.
    fn fork_state(&self, parent_name: &str) -> StoreResult<BranchState> {
        let state = self.lock_state()?;
        Ok(BranchState {
            last_version: 0,
            parent_name: parent_name.to_string(),
            parent_version: state.last_version,
            tools: state.tools.clone(),
            links: state.links.clone(),
        })
    }

    /// Bump the version and write a snapshot. Used at fork points so the
    /// snapshot referenced by the child exists on disk.
    fn persist_snapshot(&self) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        state.last_version += 1;
        write_snapshot(&self.state_dir, &self.name, &state)
    }
}

fn write_snapshot(state_dir: &Path, name: &str, state: &BranchState) -> StoreResult<()> {
    let dir = state_dir.join(name);
    fs::create_dir_all(&dir)
        .map_err(|e| StoreError::Backend(format!("cannot create branch dir: {e}")))?;
    let snapshot = BranchSnapshot {
        name: name.to_string(),
        last_version: state.last_version,
        parent_name: state.parent_name.clone(),
        parent_version: state.parent_version,
        tools: state.tools.clone(),
        links: state.links.values().cloned().collect(),
    };
    let path = dir.join(state.last_version.to_string());
    let data = serde_json::to_vec(&snapshot)
        .map_err(|e| StoreError::Backend(format!("cannot encode snapshot: {e}")))?;
    fs::write(&path, data)
        .map_err(|e| StoreError::Backend(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

impl Branch for MemBranch {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_tag(&self) -> bool {
        self.is_tag
    }

    fn ops(&self) -> StoreResult<Box<dyn BranchOps + '_>> {
        Ok(Box::new(MemBranchOps {
            branch: self,
            state: self.lock_state()?,
        }))
    }
}

struct MemBranchOps<'a> {
    branch: &'a MemBranch,
    state: MutexGuard<'a, BranchState>,
}

impl MemBranchOps<'_> {
    fn check_writable(&self) -> StoreResult<()> {
        if self.branch.is_tag {
            return Err(StoreError::WrongKind {
                name: self.branch.name.clone(),
                expected: "branch",
                actual: "tag",
            });
        }
        Ok(())
    }

    fn separator(&self, tool_id: &str) -> String {
        self.branch.config.path_separator(tool_id).to_string()
    }

    fn lookup(&self, rr: &ResourceRef) -> Option<(&ResourceGroup, &Resource)> {
        let rg = self
            .state
            .tools
            .get(&rr.tool_id)?
            .get(&rr.resource_group_url)?;
        let res = rg.resources.get(&rr.url)?;
        Some((rg, res))
    }

    fn expand_link(&self, link: &Link) -> StoreResult<LinkWithResources> {
        let (from_group, from_res) = self.lookup(&link.from_res).ok_or_else(|| {
            StoreError::NotFound {
                kind: "resource",
                name: format!(
                    "{} {} {}",
                    link.from_res.tool_id, link.from_res.resource_group_url, link.from_res.url
                ),
            }
        })?;
        let (to_group, to_res) = self.lookup(&link.to_res).ok_or_else(|| {
            StoreError::NotFound {
                kind: "resource",
                name: format!(
                    "{} {} {}",
                    link.to_res.tool_id, link.to_res.resource_group_url, link.to_res.url
                ),
            }
        })?;

        let mut inferred = Vec::new();
        for (source, last_clean_version) in &link.inferred_dirtiness {
            // A dangling source ref means the upstream entry was already
            // dropped; skip it rather than failing the expansion.
            if let Some((rg, res)) = self.lookup(source) {
                inferred.push(SourceDirtiness {
                    resource_group: strip_resources(rg),
                    resource: res.clone(),
                    last_clean_version: last_clean_version.clone(),
                });
            }
        }

        Ok(LinkWithResources {
            from_group: strip_resources(from_group),
            from_res: from_res.clone(),
            to_group: strip_resources(to_group),
            to_res: to_res.clone(),
            dirty: link.dirty,
            deleted: link.deleted,
            last_clean_version: link.last_clean_version.clone(),
            inferred_dirtiness: inferred,
        })
    }

    /// Whether the change to `change_url` reaches a link rooted at
    /// `link_from_url` under the tool's separator.
    fn change_reaches(&self, change_url: &str, link_from_url: &str, sep: &str) -> bool {
        if change_url == link_from_url {
            return true;
        }
        covers(&normalize_url(change_url, sep), link_from_url, sep)
    }

    /// Mark one link dirty and seed inferred dirtiness through its
    /// transitive downstream.
    fn mark_link_dirty(&mut self, key: &LinkKey, old_version: &str) {
        let source = {
            let Some(link) = self.state.links.get_mut(key) else {
                return;
            };
            if !link.dirty {
                link.last_clean_version = old_version.to_string();
            }
            link.dirty = true;
            link.from_res.clone()
        };

        let from_index = self.from_index();
        let mut visited: HashSet<ResourceRef> = HashSet::new();
        let mut frontier: VecDeque<ResourceRef> = VecDeque::new();
        frontier.push_back(key.to.clone());

        while let Some(node) = frontier.pop_front() {
            if !visited.insert(node.clone()) {
                continue;
            }
            let Some(out_keys) = from_index.get(&node) else {
                continue;
            };
            for out_key in out_keys {
                if out_key == key {
                    continue;
                }
                let Some(out_link) = self.state.links.get_mut(out_key) else {
                    continue;
                };
                if !out_link.inferred_dirtiness.contains_key(&source) {
                    out_link
                        .inferred_dirtiness
                        .insert(source.clone(), old_version.to_string());
                    if !visited.contains(&out_link.to_res) {
                        frontier.push_back(out_link.to_res.clone());
                    }
                }
            }
        }
    }

    fn from_index(&self) -> HashMap<ResourceRef, Vec<LinkKey>> {
        let mut index: HashMap<ResourceRef, Vec<LinkKey>> = HashMap::new();
        for (key, link) in &self.state.links {
            index
                .entry(link.from_res.clone())
                .or_default()
                .push(key.clone());
        }
        index
    }

    /// Remove `source` from the inferred dirtiness of every link reachable
    /// downstream of `start`, collecting the modified pairs.
    fn clean_inferred_downstream(
        &mut self,
        start: &ResourceRef,
        source: &ResourceRef,
        cleaned: &mut Vec<CleanedLink>,
    ) {
        let from_index = self.from_index();
        let mut visited: HashSet<LinkKey> = HashSet::new();
        let mut frontier: VecDeque<ResourceRef> = VecDeque::new();
        frontier.push_back(start.clone());
        let mut seen_nodes: HashSet<ResourceRef> = HashSet::new();

        while let Some(node) = frontier.pop_front() {
            if !seen_nodes.insert(node.clone()) {
                continue;
            }
            let Some(out_keys) = from_index.get(&node) else {
                continue;
            };
            for out_key in out_keys {
                if !visited.insert(out_key.clone()) {
                    continue;
                }
                let Some(link) = self.state.links.get_mut(out_key) else {
                    continue;
                };
                if link.inferred_dirtiness.remove(source).is_some() {
                    cleaned.push(CleanedLink {
                        link: link.clone(),
                        source: source.clone(),
                    });
                }
                frontier.push_back(link.to_res.clone());
            }
        }
    }

    /// Physically drop a tombstoned resource once no link references it,
    /// along with inferred entries naming it.
    fn sweep_orphaned_resource(&mut self, rr: &ResourceRef) {
        let referenced = self
            .state
            .links
            .values()
            .any(|link| link.has_from_ref(rr) || link.has_to_ref(rr));
        if referenced {
            return;
        }
        let deleted = self
            .lookup(rr)
            .map(|(_, res)| res.deleted)
            .unwrap_or(false);
        if !deleted {
            return;
        }
        if let Some(tool) = self.state.tools.get_mut(&rr.tool_id) {
            if let Some(rg) = tool.get_mut(&rr.resource_group_url) {
                rg.resources.remove(&rr.url);
            }
        }
        for link in self.state.links.values_mut() {
            link.inferred_dirtiness.remove(rr);
        }
    }
}

fn strip_resources(rg: &ResourceGroup) -> ResourceGroup {
    ResourceGroup {
        name: rg.name.clone(),
        tool_id: rg.tool_id.clone(),
        url: rg.url.clone(),
        version: rg.version.clone(),
        resources: BTreeMap::new(),
    }
}

impl BranchOps for MemBranchOps<'_> {
    fn get_resource_group(
        &mut self,
        tool_id: &str,
        url: &str,
    ) -> StoreResult<Option<ResourceGroup>> {
        Ok(self
            .state
            .tools
            .get(tool_id)
            .and_then(|tool| tool.get(url))
            .cloned())
    }

    fn get_resource_group_version(&mut self, tool_id: &str, url: &str) -> StoreResult<String> {
        Ok(self
            .state
            .tools
            .get(tool_id)
            .and_then(|tool| tool.get(url))
            .map(|rg| rg.version.clone())
            .unwrap_or_default())
    }

    fn get_resource_groups(&mut self) -> StoreResult<Vec<ResourceGroup>> {
        Ok(self
            .state
            .tools
            .values()
            .flat_map(|tool| tool.values().cloned())
            .collect())
    }

    fn get_resource(
        &mut self,
        rr: &ResourceRef,
        include_deleted: bool,
    ) -> StoreResult<Option<ResourceGroupAndResource>> {
        match self.lookup(rr) {
            Some((rg, res)) => {
                if res.deleted && !include_deleted {
                    return Ok(None);
                }
                Ok(Some(ResourceGroupAndResource {
                    resource_group: strip_resources(rg),
                    resource: res.clone(),
                }))
            }
            None => Ok(None),
        }
    }

    fn get_resource_by_ref(&mut self, rr: &ResourceRef) -> StoreResult<Option<Resource>> {
        Ok(self.lookup(rr).map(|(_, res)| res.clone()))
    }

    fn is_resource_deleted(&mut self, rr: &ResourceRef) -> StoreResult<bool> {
        Ok(self.lookup(rr).map(|(_, res)| res.deleted).unwrap_or(true))
    }

    fn get_resources(
        &mut self,
        patterns: &[ResourceRefPattern],
        include_deleted: bool,
    ) -> StoreResult<Vec<ResourceGroupAndResource>> {
        let mut out = Vec::new();
        self.get_resources_stream(patterns, include_deleted, &mut |item| out.push(item))?;
        Ok(out)
    }

    fn get_resources_stream(
        &mut self,
        patterns: &[ResourceRefPattern],
        include_deleted: bool,
        sink: ResourceSink<'_>,
    ) -> StoreResult<()> {
        let compiled = compile_patterns(patterns)?;
        for (tool_id, tool) in &self.state.tools {
            for rg in tool.values() {
                for pattern in &compiled {
                    if pattern.pattern.tool_id != *tool_id
                        || pattern.pattern.resource_group_url != rg.url
                    {
                        continue;
                    }
                    for res in rg.resources.values() {
                        if res.deleted && !include_deleted {
                            continue;
                        }
                        if pattern.regex.is_match(&res.url) {
                            sink(ResourceGroupAndResource {
                                resource_group: strip_resources(rg),
                                resource: res.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn get_links(&mut self, patterns: &[LinkPattern]) -> StoreResult<Vec<LinkWithResources>> {
        let mut out = Vec::new();
        self.get_links_stream(patterns, &mut |link| out.push(link))?;
        Ok(out)
    }

    fn get_links_stream(
        &mut self,
        patterns: &[LinkPattern],
        sink: LinkSink<'_>,
    ) -> StoreResult<()> {
        let compiled = compile_link_patterns(patterns)?;
        let links: Vec<Link> = self.state.links.values().cloned().collect();
        for link in links {
            if link.deleted {
                continue;
            }
            if compiled.iter().any(|pattern| pattern.matches(&link)) {
                sink(self.expand_link(&link)?);
            }
        }
        Ok(())
    }

    fn expand_links(&mut self, links: &[Link]) -> StoreResult<Vec<LinkWithResources>> {
        links.iter().map(|link| self.expand_link(link)).collect()
    }

    fn get_all_links(&mut self, include_deleted: bool) -> StoreResult<Vec<LinkWithResources>> {
        let mut out = Vec::new();
        self.get_all_links_stream(include_deleted, &mut |link| out.push(link))?;
        Ok(out)
    }

    fn get_all_links_stream(
        &mut self,
        include_deleted: bool,
        sink: LinkSink<'_>,
    ) -> StoreResult<()> {
        let links: Vec<Link> = self.state.links.values().cloned().collect();
        for link in links {
            if link.deleted && !include_deleted {
                continue;
            }
            sink(self.expand_link(&link)?);
        }
        Ok(())
    }

    fn get_dirty_links(
        &mut self,
        group: &ResourceGroupKey,
        with_inferred: bool,
    ) -> StoreResult<Vec<LinkWithResources>> {
        let mut out = Vec::new();
        self.get_dirty_links_stream(group, with_inferred, &mut |link| out.push(link))?;
        Ok(out)
    }

    fn get_dirty_links_stream(
        &mut self,
        group: &ResourceGroupKey,
        with_inferred: bool,
        sink: LinkSink<'_>,
    ) -> StoreResult<()> {
        let links: Vec<Link> = self.state.links.values().cloned().collect();
        for link in links {
            if link.deleted || !link.to_res.in_group(group) {
                continue;
            }
            let live_target = self
                .lookup(&link.to_res)
                .map(|(_, res)| !res.deleted)
                .unwrap_or(false);
            if !live_target {
                continue;
            }
            if link.dirty || (with_inferred && !link.inferred_dirtiness.is_empty()) {
                sink(self.expand_link(&link)?);
            }
        }
        Ok(())
    }

    fn get_dependency_graph(
        &mut self,
        rr: &ResourceRef,
        upstream: bool,
        max_depth: i32,
    ) -> StoreResult<Vec<LinkWithResources>> {
        let incident = |state: &BranchState, node: &ResourceRef| -> Vec<LinkKey> {
            state
                .links
                .values()
                .filter(|link| !link.deleted)
                .filter(|link| {
                    if upstream {
                        link.has_to_ref(node)
                    } else {
                        link.has_from_ref(node)
                    }
                })
                .map(Link::key)
                .collect()
        };

        let mut visited: HashSet<LinkKey> = HashSet::new();
        let mut ordered: Vec<LinkKey> = Vec::new();
        let mut frontier: VecDeque<(LinkKey, i32)> = incident(&self.state, rr)
            .into_iter()
            .map(|key| (key, 1))
            .collect();

        while let Some((key, depth)) = frontier.pop_front() {
            if visited.contains(&key) || (max_depth > 0 && depth > max_depth) {
                continue;
            }
            visited.insert(key.clone());
            ordered.push(key.clone());
            // step across the link via its far endpoint
            let next_node = if upstream { key.from } else { key.to };
            for next_key in incident(&self.state, &next_node) {
                if !visited.contains(&next_key) {
                    frontier.push_back((next_key, depth + 1));
                }
            }
        }

        let mut out = Vec::new();
        for key in ordered {
            let Some(link) = self.state.links.get(&key).cloned() else {
                continue;
            };
            match self.expand_link(&link) {
                Ok(expanded) => out.push(expanded),
                Err(_) => continue,
            }
        }
        Ok(out)
    }

    fn add_resource(&mut self, rg: &ResourceGroup, res: Option<&Resource>) -> StoreResult<bool> {
        self.check_writable()?;
        let tool = self.state.tools.entry(rg.tool_id.clone()).or_default();
        let group = tool.entry(rg.url.clone()).or_insert_with(|| rg.clone());

        let Some(res) = res else {
            return Ok(false);
        };

        match group.resources.get_mut(&res.url) {
            None => {
                group.resources.insert(res.url.clone(), res.clone());
                Ok(true)
            }
            Some(existing) => {
                let was_deleted = existing.deleted;
                existing.deleted = false;
                Ok(was_deleted)
            }
        }
    }

    fn add_resources(&mut self, resources: &[ResourceGroupAndResource]) -> StoreResult<bool> {
        let mut added_some = false;
        for item in resources {
            let added = self.add_resource(&item.resource_group, Some(&item.resource))?;
            added_some = added_some || added;
        }
        Ok(added_some)
    }

    fn add_link(&mut self, link: &LinkWithResources) -> StoreResult<bool> {
        self.check_writable()?;
        self.add_resource(&link.from_group, Some(&link.from_res))?;
        self.add_resource(&link.to_group, Some(&link.to_res))?;

        let mut new_link = link.to_link();
        new_link.dirty = false;
        new_link.deleted = false;
        new_link.last_clean_version = link.from_group.version.clone();
        let key = new_link.key();

        match self.state.links.get_mut(&key) {
            Some(existing) => {
                let was_deleted = existing.deleted;
                existing.deleted = false;
                Ok(was_deleted)
            }
            None => {
                self.state.links.insert(key, new_link);
                Ok(true)
            }
        }
    }

    fn add_links(&mut self, links: &[LinkWithResources]) -> StoreResult<bool> {
        let mut added_some = false;
        for link in links {
            let added = self.add_link(link)?;
            added_some = added_some || added;
        }
        Ok(added_some)
    }

    fn remove_resource_ref(&mut self, rr: &ResourceRef) -> StoreResult<bool> {
        self.check_writable()?;
        let Some(tool) = self.state.tools.get_mut(&rr.tool_id) else {
            return Ok(false);
        };
        let Some(rg) = tool.get_mut(&rr.resource_group_url) else {
            return Ok(false);
        };
        let Some(res) = rg.resources.get_mut(&rr.url) else {
            return Ok(false);
        };
        if res.deleted {
            return Ok(false);
        }
        res.deleted = true;

        for link in self.state.links.values_mut() {
            if link.has_from_ref(rr) || link.has_to_ref(rr) {
                link.deleted = true;
            }
            link.inferred_dirtiness.remove(rr);
        }
        Ok(true)
    }

    fn remove_link(&mut self, target: &Link) -> StoreResult<bool> {
        self.check_writable()?;
        let keys: Vec<LinkKey> = self
            .state
            .links
            .values()
            .filter(|link| link.from_res == target.from_res && link.to_res == target.to_res)
            .map(Link::key)
            .collect();
        let mut removed = false;
        for key in keys {
            removed = true;
            let dirty = self
                .state
                .links
                .get(&key)
                .map(|link| link.dirty)
                .unwrap_or(false);
            if dirty {
                if let Some(link) = self.state.links.get_mut(&key) {
                    link.deleted = true;
                }
            } else {
                self.state.links.remove(&key);
            }
        }
        Ok(removed)
    }

    fn update_resource_group(&mut self, change: &ResourceGroupChange) -> StoreResult<Vec<Link>> {
        self.check_writable()?;
        let sep = self.separator(&change.tool_id);

        let tool = self.state.tools.entry(change.tool_id.clone()).or_default();
        if !tool.contains_key(&change.url) {
            tool.insert(change.url.clone(), change.to_resource_group());
            return Ok(Vec::new());
        }

        let old_version = match tool.get_mut(&change.url) {
            Some(group) => {
                let old = group.version.clone();
                group.version = change.version.clone();
                old
            }
            None => return Ok(Vec::new()),
        };

        let mut affected: HashSet<LinkKey> = HashSet::new();
        let group_key = change.key();

        for res_change in change.resources.values() {
            use crate::core::ChangeType::{Added, Modified, Removed};

            // Added/Modified (and the modify half of a rename): dirty every
            // non-deleted, non-dirty link the changed URL reaches.
            if matches!(res_change.change_type, Added | Modified) {
                let keys: Vec<LinkKey> = self
                    .state
                    .links
                    .values()
                    .filter(|link| {
                        !link.deleted
                            && !link.dirty
                            && link.from_res.in_group(&group_key)
                            && self.change_reaches(&res_change.url, &link.from_res.url, &sep)
                    })
                    .map(Link::key)
                    .collect();
                for key in keys {
                    self.mark_link_dirty(&key, &old_version);
                    affected.insert(key);
                }
            }

            if res_change.renames() {
                let old_ref =
                    ResourceRef::new(&change.tool_id, &change.url, &res_change.url);

                // rewrite link endpoints matching the old URL exactly
                let mut rekeyed: BTreeMap<LinkKey, Link> = BTreeMap::new();
                let links = std::mem::take(&mut self.state.links);
                for (key, mut link) in links {
                    let mut changed = false;
                    if link.from_res == old_ref {
                        link.from_res.url = res_change.new_url.clone();
                        changed = true;
                    }
                    if link.to_res == old_ref {
                        link.to_res.url = res_change.new_url.clone();
                        changed = true;
                    }
                    // rewrite inferred sources naming the renamed resource
                    if let Some(version) = link.inferred_dirtiness.remove(&old_ref) {
                        let mut renamed = old_ref.clone();
                        renamed.url = res_change.new_url.clone();
                        link.inferred_dirtiness.insert(renamed, version);
                        changed = true;
                    }
                    let new_key = link.key();
                    if changed {
                        affected.remove(&key);
                        affected.insert(new_key.clone());
                    }
                    rekeyed.insert(new_key, link);
                }
                self.state.links = rekeyed;

                // rename the resource entry itself
                if let Some(rg) = self
                    .state
                    .tools
                    .get_mut(&change.tool_id)
                    .and_then(|tool| tool.get_mut(&change.url))
                {
                    if let Some(mut res) = rg.resources.remove(&res_change.url) {
                        res.url = res_change.new_url.clone();
                        res.name = res_change.new_name.clone();
                        res.id = res_change.new_id.clone();
                        rg.resources.insert(res_change.new_url.clone(), res);
                    }
                }
            } else if res_change.change_type == Removed {
                let removed_ref =
                    ResourceRef::new(&change.tool_id, &change.url, &res_change.url);

                // dirty-mark as for a modification, then tombstone
                let keys: Vec<LinkKey> = self
                    .state
                    .links
                    .values()
                    .filter(|link| {
                        !link.deleted
                            && !link.dirty
                            && link.from_res.in_group(&group_key)
                            && self.change_reaches(&res_change.url, &link.from_res.url, &sep)
                    })
                    .map(Link::key)
                    .collect();
                for key in keys {
                    self.mark_link_dirty(&key, &old_version);
                    affected.insert(key);
                }

                if let Some(rg) = self
                    .state
                    .tools
                    .get_mut(&change.tool_id)
                    .and_then(|tool| tool.get_mut(&change.url))
                {
                    if let Some(res) = rg.resources.get_mut(&res_change.url) {
                        res.deleted = true;
                    }
                }

                let mut incoming: Vec<LinkKey> = Vec::new();
                for link in self.state.links.values_mut() {
                    if link.from_res == removed_ref {
                        link.deleted = true;
                        link.dirty = true;
                        affected.insert(link.key());
                    } else if link.to_res == removed_ref {
                        incoming.push(link.key());
                    }
                    link.inferred_dirtiness.remove(&removed_ref);
                }
                for key in incoming {
                    affected.remove(&key);
                    self.state.links.remove(&key);
                }
                self.sweep_orphaned_resource(&removed_ref);
            }
        }

        Ok(affected
            .into_iter()
            .filter_map(|key| self.state.links.get(&key).cloned())
            .collect())
    }

    fn edit_resource_group(
        &mut self,
        old: &ResourceGroup,
        new: &ResourceGroup,
    ) -> StoreResult<()> {
        self.check_writable()?;
        let Some(tool) = self.state.tools.get_mut(&old.tool_id) else {
            return Ok(());
        };
        let Some(rg) = tool.get_mut(&old.url) else {
            return Ok(());
        };

        rg.tool_id = new.tool_id.clone();
        rg.url = new.url.clone();
        rg.name = new.name.clone();
        rg.version = new.version.clone();

        if old.tool_id != new.tool_id || old.url != new.url {
            if let Some(moved) = tool.remove(&old.url) {
                self.state
                    .tools
                    .entry(new.tool_id.clone())
                    .or_default()
                    .insert(new.url.clone(), moved);
            }
        }
        Ok(())
    }

    fn remove_resource_group(&mut self, tool_id: &str, url: &str) -> StoreResult<()> {
        self.check_writable()?;
        if let Some(tool) = self.state.tools.get_mut(tool_id) {
            tool.remove(url);
        }
        let group_key = ResourceGroupKey {
            tool_id: tool_id.to_string(),
            url: url.to_string(),
        };
        self.state
            .links
            .retain(|_, link| !link.from_res.in_group(&group_key) && !link.to_res.in_group(&group_key));
        Ok(())
    }

    fn mark_resources_clean(&mut self, refs: &[ResourceRef], propagate: bool) -> StoreResult<()> {
        self.check_writable()?;
        for rr in refs {
            let keys: Vec<LinkKey> = self
                .state
                .links
                .values()
                .filter(|link| link.has_to_ref(rr))
                .map(Link::key)
                .collect();
            for key in keys {
                let from = {
                    let Some(link) = self.state.links.get_mut(&key) else {
                        continue;
                    };
                    link.dirty = false;
                    link.last_clean_version.clear();
                    link.inferred_dirtiness.remove(rr);
                    link.from_res.clone()
                };
                if propagate {
                    let mut cleaned = Vec::new();
                    self.clean_inferred_downstream(rr, &from, &mut cleaned);
                }
            }
        }
        Ok(())
    }

    fn mark_links_clean(
        &mut self,
        links: &[Link],
        propagate: bool,
    ) -> StoreResult<Vec<CleanedLink>> {
        self.check_writable()?;
        let mut all_cleaned = Vec::new();
        for target in links {
            let keys: Vec<LinkKey> = self
                .state
                .links
                .values()
                .filter(|link| {
                    link.has_from_ref(&target.from_res) && link.has_to_ref(&target.to_res)
                })
                .map(Link::key)
                .collect();

            let mut tombstoned: Vec<LinkKey> = Vec::new();
            for key in &keys {
                let Some(link) = self.state.links.get_mut(key) else {
                    continue;
                };
                link.dirty = false;
                link.last_clean_version.clear();
                if link.deleted {
                    tombstoned.push(key.clone());
                }
            }

            // tombstoned and now clean: physically remove, then sweep
            // endpoint resources that lost their last reference
            for key in tombstoned {
                self.state.links.remove(&key);
                self.sweep_orphaned_resource(&key.from);
                self.sweep_orphaned_resource(&key.to);
            }

            if propagate {
                let source = target.from_res.clone();
                let mut cleaned = self.mark_inferred_dirtiness_clean(target, &source, true)?;
                all_cleaned.append(&mut cleaned);
            }
        }
        Ok(all_cleaned)
    }

    fn mark_inferred_dirtiness_clean(
        &mut self,
        link: &Link,
        source: &ResourceRef,
        propagate: bool,
    ) -> StoreResult<Vec<CleanedLink>> {
        self.check_writable()?;
        let target_key = self
            .state
            .links
            .values()
            .find(|candidate| {
                candidate.has_from_ref(&link.from_res) && candidate.has_to_ref(&link.to_res)
            })
            .map(Link::key);
        let Some(target_key) = target_key else {
            return Ok(Vec::new());
        };

        let mut cleaned = Vec::new();
        if let Some(target) = self.state.links.get_mut(&target_key) {
            if target.inferred_dirtiness.remove(source).is_some() {
                cleaned.push(CleanedLink {
                    link: target.clone(),
                    source: source.clone(),
                });
            }
        }
        if propagate {
            self.clean_inferred_downstream(&target_key.to.clone(), source, &mut cleaned);
        }
        Ok(cleaned)
    }

    fn save_branch_state(&mut self) -> StoreResult<()> {
        self.check_writable()?;
        self.state.last_version += 1;
        write_snapshot(&self.branch.state_dir, &self.branch.name, &self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChangeType, ResourceChange};

    fn test_store() -> (tempfile::TempDir, MemStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.db.state_dir = dir.path().join("state").to_string_lossy().to_string();
        let store = MemStore::open(Arc::new(config)).expect("open store");
        (dir, store)
    }

    fn resource(url: &str) -> Resource {
        Resource {
            name: url.trim_start_matches('/').to_string(),
            id: url.to_string(),
            url: url.to_string(),
            deleted: false,
        }
    }

    fn group(tool: &str, url: &str, version: &str) -> ResourceGroup {
        ResourceGroup::new(tool, url, url, version)
    }

    fn link(
        from: (&str, &str, &str, &str),
        to: (&str, &str, &str, &str),
    ) -> LinkWithResources {
        LinkWithResources {
            from_group: group(from.0, from.1, from.3),
            from_res: resource(from.2),
            to_group: group(to.0, to.1, to.3),
            to_res: resource(to.2),
            dirty: false,
            deleted: false,
            last_clean_version: String::new(),
            inferred_dirtiness: Vec::new(),
        }
    }

    fn change(url: &str, change_type: ChangeType) -> ResourceChange {
        ResourceChange {
            name: url.trim_start_matches('/').to_string(),
            id: url.to_string(),
            url: url.to_string(),
            new_name: String::new(),
            new_id: String::new(),
            new_url: String::new(),
            change_type,
        }
    }

    fn group_change(
        tool: &str,
        url: &str,
        version: &str,
        changes: Vec<ResourceChange>,
    ) -> ResourceGroupChange {
        ResourceGroupChange {
            name: url.to_string(),
            tool_id: tool.to_string(),
            url: url.to_string(),
            version: version.to_string(),
            resources: changes.into_iter().map(|c| (c.url.clone(), c)).collect(),
        }
    }

    #[test]
    fn add_link_initializes_clean_with_group_version() {
        let (_dir, store) = test_store();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        let added = ops
            .add_link(&link(
                ("git", "repoA", "/a.c", "v1"),
                ("mdl", "modelM", "/m1", "v1"),
            ))
            .unwrap();
        assert!(added);

        let links = ops.get_all_links(false).unwrap();
        assert_eq!(links.len(), 1);
        assert!(!links[0].dirty);
        assert_eq!(links[0].last_clean_version, "v1");
    }

    #[test]
    fn duplicate_link_is_not_added_but_resurrects_tombstone() {
        let (_dir, store) = test_store();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        let l = link(("git", "repoA", "/a.c", "v1"), ("mdl", "modelM", "/m1", "v1"));
        assert!(ops.add_link(&l).unwrap());
        assert!(!ops.add_link(&l).unwrap());

        // dirty it so removal tombstones instead of deleting
        let update = group_change(
            "git",
            "repoA",
            "v2",
            vec![change("/a.c", ChangeType::Modified)],
        );
        ops.update_resource_group(&update).unwrap();
        ops.remove_link(&l.to_link()).unwrap();
        assert!(ops.get_all_links(true).unwrap()[0].deleted);
        assert!(ops.add_link(&l).unwrap());
        assert!(!ops.get_all_links(false).unwrap()[0].deleted);
    }

    #[test]
    fn update_marks_downstream_dirty_with_old_version() {
        let (_dir, store) = test_store();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        ops.update_resource_group(&group_change(
            "git",
            "repoA",
            "v1",
            vec![change("/a.c", ChangeType::Added)],
        ))
        .unwrap();
        ops.add_link(&link(
            ("git", "repoA", "/a.c", "v1"),
            ("mdl", "modelM", "/m1", "v1"),
        ))
        .unwrap();

        let effects = ops
            .update_resource_group(&group_change(
                "git",
                "repoA",
                "v2",
                vec![change("/a.c", ChangeType::Modified)],
            ))
            .unwrap();
        assert_eq!(effects.len(), 1);
        assert!(effects[0].dirty);
        assert_eq!(effects[0].last_clean_version, "v1");

        let dirty = ops
            .get_dirty_links(
                &ResourceGroupKey {
                    tool_id: "mdl".into(),
                    url: "modelM".into(),
                },
                false,
            )
            .unwrap();
        assert_eq!(dirty.len(), 1);

        // source side has no dirty incoming links
        let none = ops
            .get_dirty_links(
                &ResourceGroupKey {
                    tool_id: "git".into(),
                    url: "repoA".into(),
                },
                false,
            )
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn inferred_dirtiness_propagates_and_cleans() {
        let (_dir, store) = test_store();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        // chain A -> B -> C
        ops.add_link(&link(("t", "A", "/a", "v1"), ("t", "B", "/b", "v1")))
            .unwrap();
        ops.add_link(&link(("t", "B", "/b", "v1"), ("t", "C", "/c", "v1")))
            .unwrap();

        ops.update_resource_group(&group_change(
            "t",
            "A",
            "v2",
            vec![change("/a", ChangeType::Modified)],
        ))
        .unwrap();

        let source = ResourceRef::new("t", "A", "/a");
        let downstream = ops
            .get_dirty_links(
                &ResourceGroupKey {
                    tool_id: "t".into(),
                    url: "C".into(),
                },
                true,
            )
            .unwrap();
        assert_eq!(downstream.len(), 1);
        assert_eq!(downstream[0].inferred_dirtiness.len(), 1);
        assert_eq!(downstream[0].inferred_dirtiness[0].resource_ref(), source);

        let mut cleaned_link = Link::new(
            ResourceRef::new("t", "A", "/a"),
            ResourceRef::new("t", "B", "/b"),
        );
        cleaned_link.dirty = true;
        ops.mark_links_clean(std::slice::from_ref(&cleaned_link), true)
            .unwrap();

        let downstream = ops
            .get_dirty_links(
                &ResourceGroupKey {
                    tool_id: "t".into(),
                    url: "C".into(),
                },
                true,
            )
            .unwrap();
        assert!(downstream.is_empty());

        // idempotent
        ops.mark_links_clean(std::slice::from_ref(&cleaned_link), true)
            .unwrap();
        assert!(ops
            .get_dirty_links(
                &ResourceGroupKey {
                    tool_id: "t".into(),
                    url: "B".into(),
                },
                true,
            )
            .unwrap()
            .is_empty());
    }

    #[test]
    fn rename_rewrites_links_and_inferred_sources() {
        let (_dir, store) = test_store();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        ops.add_link(&link(
            ("git", "repoA", "/a.c", "v1"),
            ("mdl", "modelM", "/m1", "v1"),
        ))
        .unwrap();
        ops.add_link(&link(
            ("mdl", "modelM", "/m1", "v1"),
            ("mdl", "modelM", "/m2", "v1"),
        ))
        .unwrap();

        // dirty first so the downstream link carries an inferred entry for /a.c
        ops.update_resource_group(&group_change(
            "git",
            "repoA",
            "v2",
            vec![change("/a.c", ChangeType::Modified)],
        ))
        .unwrap();

        let mut rename = change("/a.c", ChangeType::Renamed);
        rename.new_url = "/a2.c".to_string();
        rename.new_name = "a2.c".to_string();
        rename.new_id = "/a2.c".to_string();
        ops.update_resource_group(&group_change("git", "repoA", "v3", vec![rename]))
            .unwrap();

        let links = ops
            .get_links(&[LinkPattern {
                from: ResourceRefPattern {
                    tool_id: "git".into(),
                    resource_group_url: "repoA".into(),
                    url_pattern: ".*".into(),
                },
                to: ResourceRefPattern {
                    tool_id: "mdl".into(),
                    resource_group_url: "modelM".into(),
                    url_pattern: ".*".into(),
                },
            }])
            .unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].from_res.url, "/a2.c");

        // the old resource key is gone from the group
        let rg = ops.get_resource_group("git", "repoA").unwrap().unwrap();
        assert!(!rg.resources.contains_key("/a.c"));
        assert!(rg.resources.contains_key("/a2.c"));

        // inferred source refs were rewritten too
        let downstream = ops
            .get_dirty_links(
                &ResourceGroupKey {
                    tool_id: "mdl".into(),
                    url: "modelM".into(),
                },
                true,
            )
            .unwrap();
        let inferred: Vec<ResourceRef> = downstream
            .iter()
            .flat_map(|l| l.inferred_dirtiness.iter().map(|i| i.resource_ref()))
            .collect();
        assert!(inferred.contains(&ResourceRef::new("git", "repoA", "/a2.c")));
    }

    #[test]
    fn removed_resource_tombstones_outgoing_and_drops_incoming() {
        let (_dir, store) = test_store();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        ops.add_link(&link(("t", "A", "/a", "v1"), ("t", "B", "/b", "v1")))
            .unwrap();
        ops.add_link(&link(("t", "B", "/b", "v1"), ("t", "C", "/c", "v1")))
            .unwrap();

        ops.update_resource_group(&group_change(
            "t",
            "B",
            "v2",
            vec![change("/b", ChangeType::Removed)],
        ))
        .unwrap();

        let all = ops.get_all_links(true).unwrap();
        // incoming A->B hard-removed, outgoing B->C tombstoned dirty
        assert_eq!(all.len(), 1);
        assert!(all[0].deleted);
        assert!(all[0].dirty);
        assert_eq!(all[0].from_res.url, "/b");
        assert!(ops
            .is_resource_deleted(&ResourceRef::new("t", "B", "/b"))
            .unwrap());
    }

    #[test]
    fn branch_fork_is_isolated() {
        let (_dir, store) = test_store();
        let main = store.get_branch("main").unwrap();
        main.ops()
            .unwrap()
            .add_link(&link(("t", "A", "/a", "v1"), ("t", "B", "/b", "v1")))
            .unwrap();

        store.create_branch("b2", "main").unwrap();
        main.ops()
            .unwrap()
            .add_link(&link(("t", "A", "/a2", "v1"), ("t", "B", "/b", "v1")))
            .unwrap();

        let b2 = store.get_branch("b2").unwrap();
        assert_eq!(b2.ops().unwrap().get_all_links(false).unwrap().len(), 1);
        assert_eq!(main.ops().unwrap().get_all_links(false).unwrap().len(), 2);
    }

    #[test]
    fn snapshot_roundtrip_restores_graph() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.db.state_dir = dir.path().join("state").to_string_lossy().to_string();
        let config = Arc::new(config);

        {
            let store = MemStore::open(config.clone()).unwrap();
            let branch = store.get_branch("main").unwrap();
            let mut ops = branch.ops().unwrap();
            ops.add_link(&link(("t", "A", "/a", "v1"), ("t", "B", "/b", "v1")))
                .unwrap();
            ops.add_link(&link(("t", "B", "/b", "v1"), ("t", "C", "/c", "v1")))
                .unwrap();
            ops.update_resource_group(&group_change(
                "t",
                "A",
                "v2",
                vec![change("/a", ChangeType::Modified)],
            ))
            .unwrap();
            ops.save_branch_state().unwrap();
        }

        let store = MemStore::open(config).unwrap();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        let links = ops.get_all_links(false).unwrap();
        assert_eq!(links.len(), 2);
        let downstream = links
            .iter()
            .find(|l| l.to_group.url == "C")
            .expect("B->C link");
        assert_eq!(downstream.inferred_dirtiness.len(), 1);
        assert_eq!(
            downstream.inferred_dirtiness[0].resource_ref(),
            ResourceRef::new("t", "A", "/a")
        );
        let groups = ops.get_resource_groups().unwrap();
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn tag_is_immutable_and_forkable() {
        let (_dir, store) = test_store();
        let main = store.get_branch("main").unwrap();
        main.ops()
            .unwrap()
            .add_link(&link(("t", "A", "/a", "v1"), ("t", "B", "/b", "v1")))
            .unwrap();

        store.create_tag("t1", "main").unwrap();
        let tag = store.get_tag("t1").unwrap();
        assert!(tag.is_tag());

        let err = tag
            .ops()
            .unwrap()
            .update_resource_group(&group_change(
                "t",
                "A",
                "v2",
                vec![change("/a", ChangeType::Modified)],
            ))
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongKind { .. }));

        // reads still work
        assert_eq!(tag.ops().unwrap().get_all_links(false).unwrap().len(), 1);

        // a branch forked from the tag is writable
        store.create_branch_from_tag("b3", "t1").unwrap();
        let b3 = store.get_branch("b3").unwrap();
        b3.ops()
            .unwrap()
            .add_link(&link(("t", "A", "/a2", "v1"), ("t", "B", "/b", "v1")))
            .unwrap();
        assert_eq!(b3.ops().unwrap().get_all_links(false).unwrap().len(), 2);
    }

    #[test]
    fn get_branch_on_tag_name_is_wrong_kind() {
        let (_dir, store) = test_store();
        store.create_tag("t1", "main").unwrap();
        assert!(matches!(
            store.get_branch("t1").unwrap_err(),
            StoreError::WrongKind { .. }
        ));
        assert!(matches!(
            store.get_tag("main").unwrap_err(),
            StoreError::WrongKind { .. }
        ));
        assert!(matches!(
            store.get_branch("nope").unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[test]
    fn dependency_graph_respects_direction_and_depth() {
        let (_dir, store) = test_store();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        // A -> B -> C -> D
        ops.add_link(&link(("t", "A", "/a", "v1"), ("t", "B", "/b", "v1")))
            .unwrap();
        ops.add_link(&link(("t", "B", "/b", "v1"), ("t", "C", "/c", "v1")))
            .unwrap();
        ops.add_link(&link(("t", "C", "/c", "v1"), ("t", "D", "/d", "v1")))
            .unwrap();

        let d = ResourceRef::new("t", "D", "/d");
        let upstream_all = ops.get_dependency_graph(&d, true, 0).unwrap();
        assert_eq!(upstream_all.len(), 3);

        let upstream_two = ops.get_dependency_graph(&d, true, 2).unwrap();
        assert_eq!(upstream_two.len(), 2);

        let a = ResourceRef::new("t", "A", "/a");
        let downstream = ops.get_dependency_graph(&a, false, 1).unwrap();
        assert_eq!(downstream.len(), 1);
        assert_eq!(downstream[0].to_group.url, "B");
    }

    #[test]
    fn invalid_regex_is_invalid_pattern() {
        let (_dir, store) = test_store();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        let err = ops
            .get_resources(
                &[ResourceRefPattern {
                    tool_id: "t".into(),
                    resource_group_url: "A".into(),
                    url_pattern: "[".into(),
                }],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPattern(_)));
    }

    #[test]
    fn path_coverage_dirties_links_under_changed_directory() {
        let (_dir, store) = test_store();
        let branch = store.get_branch("main").unwrap();
        let mut ops = branch.ops().unwrap();
        ops.add_link(&link(
            ("git", "repoA", "/src/a.c", "v1"),
            ("mdl", "modelM", "/m1", "v1"),
        ))
        .unwrap();

        // a change to the directory /src covers /src/a.c
        let effects = ops
            .update_resource_group(&group_change(
                "git",
                "repoA",
                "v2",
                vec![change("/src", ChangeType::Modified)],
            ))
            .unwrap();
        assert_eq!(effects.len(), 1);
        assert!(effects[0].dirty);
    }
}
