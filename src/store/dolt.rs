//! Relational store over a branch-capable MySQL-protocol engine (Dolt).
//!
//! Branch and tag semantics defer to the engine: `DOLT_CHECKOUT` selects the
//! branch context on a pooled connection, `DOLT_BRANCH`/`DOLT_TAG` create
//! branches and tags, and `DOLT_COMMIT` is the durability point. The schema
//! is provisioned externally:
//!
//! ```text
//! resource_group(tool_id, url, name, version)
//! resource(tool_id, rg_url, url, name, id, deleted)
//! link(from_tool_id, from_rg_url, from_url,
//!      to_tool_id, to_rg_url, to_url, dirty, deleted, last_clean_version)
//! inferred_dirtiness(from_*, to_*, source_tool_id, source_rg_url,
//!                    source_url, source_last_clean_version)
//! ```
//!
//! Bulk insertions run through a prepared statement in batches of 1 000 with
//! an `on duplicate key update` resurrect clause.

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};

use mysql::prelude::*;
use mysql::{Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, PooledConn};

use crate::config::Config;
use crate::core::{
    normalize_url, Link, LinkKey, LinkPattern, LinkWithResources, Resource, ResourceGroup,
    ResourceGroupAndResource, ResourceGroupChange, ResourceGroupKey, ResourceRef,
    ResourceRefPattern, SourceDirtiness,
};

use super::{
    compile_link_patterns, compile_patterns, Branch, BranchOps, CleanedLink, LinkSink,
    ResourceSink, Store, StoreError, StoreResult,
};

const BATCH_SIZE: usize = 1000;

fn backend(err: impl Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

pub struct DoltStore {
    pool: Pool,
    database: String,
    config: Arc<Config>,
    // One shared handle per name so the per-branch mutex is actually
    // per-branch, not per-caller.
    handles: Mutex<std::collections::HashMap<String, Arc<DoltBranch>>>,
}

impl DoltStore {
    pub fn open(config: Arc<Config>) -> StoreResult<Self> {
        let db = &config.db;
        let host = if db.host.is_empty() {
            "127.0.0.1"
        } else {
            &db.host
        };
        let port = if db.port == 0 { 3306 } else { db.port };
        let user = if db.user.is_empty() { "depi" } else { &db.user };
        let password = if db.password.is_empty() {
            "depi"
        } else {
            &db.password
        };
        let database = if db.database.is_empty() {
            "depi".to_string()
        } else {
            db.database.clone()
        };
        let pool_size = if db.pool_size == 0 { 10 } else { db.pool_size };
        let constraints = PoolConstraints::new(1, pool_size)
            .ok_or_else(|| StoreError::Backend("invalid pool size".to_string()))?;

        let opts: Opts = OptsBuilder::new()
            .ip_or_hostname(Some(host))
            .tcp_port(port)
            .user(Some(user))
            .pass(Some(password))
            .db_name(Some(database.clone()))
            .pool_opts(PoolOpts::default().with_constraints(constraints))
            .into();
        let pool = Pool::new(opts).map_err(backend)?;

        Ok(DoltStore {
            pool,
            database,
            config,
            handles: Mutex::new(std::collections::HashMap::new()),
        })
    }

    fn conn(&self) -> StoreResult<PooledConn> {
        self.pool.get_conn().map_err(backend)
    }

    fn is_tag_name(&self, name: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let row: Option<String> = conn
            .exec_first("select tag_name from dolt_tags where tag_name=?", (name,))
            .map_err(backend)?;
        Ok(row.is_some())
    }

    fn branch_handle(&self, name: &str, is_tag: bool) -> Arc<DoltBranch> {
        let mut handles = match self.handles.lock() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        handles
            .entry(format!("{}:{}", if is_tag { "tag" } else { "branch" }, name))
            .or_insert_with(|| {
                Arc::new(DoltBranch {
                    name: name.to_string(),
                    is_tag,
                    database: self.database.clone(),
                    pool: self.pool.clone(),
                    config: self.config.clone(),
                    guard: Mutex::new(()),
                })
            })
            .clone()
    }
}

impl Store for DoltStore {
    fn get_branch(&self, name: &str) -> StoreResult<Arc<dyn Branch>> {
        if self.is_tag_name(name)? {
            return Err(StoreError::WrongKind {
                name: name.to_string(),
                expected: "branch",
                actual: "tag",
            });
        }
        if !self.branch_exists(name) {
            return Err(StoreError::branch_not_found(name));
        }
        Ok(self.branch_handle(name, false))
    }

    fn get_tag(&self, name: &str) -> StoreResult<Arc<dyn Branch>> {
        if !self.is_tag_name(name)? {
            if self.branch_exists(name) {
                return Err(StoreError::WrongKind {
                    name: name.to_string(),
                    expected: "tag",
                    actual: "branch",
                });
            }
            return Err(StoreError::tag_not_found(name));
        }
        Ok(self.branch_handle(name, true))
    }

    fn branch_exists(&self, name: &str) -> bool {
        self.conn()
            .and_then(|mut conn| {
                conn.exec_first::<String, _, _>(
                    "select name from dolt_branches where name=?",
                    (name,),
                )
                .map_err(backend)
            })
            .map(|row| row.is_some())
            .unwrap_or(false)
    }

    fn tag_exists(&self, name: &str) -> bool {
        self.is_tag_name(name).unwrap_or(false)
    }

    fn create_branch(&self, name: &str, from_branch: &str) -> StoreResult<Arc<dyn Branch>> {
        if self.branch_exists(name) {
            return Err(StoreError::DuplicateName {
                kind: "branch",
                name: name.to_string(),
            });
        }
        if !self.branch_exists(from_branch) {
            return Err(StoreError::branch_not_found(from_branch));
        }
        let mut conn = self.conn()?;
        conn.exec_drop("CALL DOLT_BRANCH(?, ?)", (name, from_branch))
            .map_err(backend)?;
        Ok(self.branch_handle(name, false))
    }

    fn create_branch_from_tag(&self, name: &str, from_tag: &str) -> StoreResult<Arc<dyn Branch>> {
        if self.branch_exists(name) {
            return Err(StoreError::DuplicateName {
                kind: "branch",
                name: name.to_string(),
            });
        }
        if !self.is_tag_name(from_tag)? {
            return Err(StoreError::tag_not_found(from_tag));
        }
        let mut conn = self.conn()?;
        conn.exec_drop("CALL DOLT_BRANCH(?, ?)", (name, from_tag))
            .map_err(backend)?;
        Ok(self.branch_handle(name, false))
    }

    fn create_tag(&self, name: &str, from_branch: &str) -> StoreResult<Arc<dyn Branch>> {
        if self.is_tag_name(name)? {
            return Err(StoreError::DuplicateName {
                kind: "tag",
                name: name.to_string(),
            });
        }
        if !self.branch_exists(from_branch) {
            return Err(StoreError::branch_not_found(from_branch));
        }
        let mut conn = self.conn()?;
        conn.exec_drop("CALL DOLT_TAG(?, ?)", (name, from_branch))
            .map_err(backend)?;
        Ok(self.branch_handle(name, true))
    }

    fn branch_list(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn()?;
        conn.query("select name from dolt_branches").map_err(backend)
    }

    fn tag_list(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn()?;
        conn.query("select tag_name from dolt_tags").map_err(backend)
    }
}

#[derive(Debug)]
pub struct DoltBranch {
    name: String,
    is_tag: bool,
    database: String,
    pool: Pool,
    config: Arc<Config>,
    guard: Mutex<()>,
}

impl Branch for DoltBranch {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_tag(&self) -> bool {
        self.is_tag
    }

    fn ops(&self) -> StoreResult<Box<dyn BranchOps + '_>> {
        let guard = self
            .guard
            .lock()
            .map_err(|_| StoreError::Backend(format!("branch {} lock poisoned", self.name)))?;
        let mut conn = self.pool.get_conn().map_err(backend)?;
        if self.is_tag {
            // Tags are read through the engine's revision-database syntax.
            conn.query_drop(format!("USE `{}/{}`", self.database, self.name))
                .map_err(backend)?;
        } else {
            conn.exec_drop("CALL DOLT_CHECKOUT(?)", (self.name.as_str(),))
                .map_err(backend)?;
        }
        Ok(Box::new(DoltBranchOps {
            branch: self,
            _guard: guard,
            conn,
            dirty_tx: false,
        }))
    }
}

struct DoltBranchOps<'a> {
    branch: &'a DoltBranch,
    _guard: MutexGuard<'a, ()>,
    conn: PooledConn,
    dirty_tx: bool,
}

impl Drop for DoltBranchOps<'_> {
    fn drop(&mut self) {
        // Uncommitted working-set changes are rolled back so a failed
        // operation leaves the branch unmodified.
        if self.dirty_tx {
            if let Err(e) = self.conn.query_drop("CALL DOLT_RESET('--hard')") {
                tracing::warn!(branch = %self.branch.name, error = %e, "rollback failed");
            }
        }
    }
}

/// One joined link row: the link columns plus both endpoint resources and
/// groups. Wider than the crate's tuple conversions allow, so fields are
/// pulled out of the raw row by position.
struct LinkRow {
    link: Link,
    from_group: ResourceGroup,
    from_res: Resource,
    to_group: ResourceGroup,
    to_res: Resource,
}

impl LinkRow {
    fn from_row(mut row: mysql::Row) -> Option<LinkRow> {
        let from_tool_id: String = row.take(0)?;
        let from_rg_url: String = row.take(1)?;
        let from_url: String = row.take(2)?;
        let to_tool_id: String = row.take(3)?;
        let to_rg_url: String = row.take(4)?;
        let to_url: String = row.take(5)?;
        let dirty: bool = row.take(6)?;
        let deleted: bool = row.take(7)?;
        let last_clean_version: String = row.take(8)?;
        let from_name: String = row.take(9)?;
        let from_id: String = row.take(10)?;
        let to_name: String = row.take(11)?;
        let to_id: String = row.take(12)?;
        let from_rg_name: String = row.take(13)?;
        let from_rg_version: String = row.take(14)?;
        let to_rg_name: String = row.take(15)?;
        let to_rg_version: String = row.take(16)?;

        let mut link = Link::new(
            ResourceRef::new(&from_tool_id, &from_rg_url, &from_url),
            ResourceRef::new(&to_tool_id, &to_rg_url, &to_url),
        );
        link.dirty = dirty;
        link.deleted = deleted;
        link.last_clean_version = last_clean_version;

        Some(LinkRow {
            link,
            from_group: ResourceGroup::new(
                &from_tool_id,
                &from_rg_url,
                &from_rg_name,
                &from_rg_version,
            ),
            from_res: Resource {
                name: from_name,
                id: from_id,
                url: from_url,
                deleted: false,
            },
            to_group: ResourceGroup::new(&to_tool_id, &to_rg_url, &to_rg_name, &to_rg_version),
            to_res: Resource {
                name: to_name,
                id: to_id,
                url: to_url,
                deleted: false,
            },
        })
    }
}

const LINK_SELECT: &str = "select l.from_tool_id, l.from_rg_url, l.from_url, \
     l.to_tool_id, l.to_rg_url, l.to_url, l.dirty, l.deleted, l.last_clean_version, \
     fr.name, fr.id, tr.name, tr.id, \
     frg.name, frg.version, trg.name, trg.version \
     from link l, resource_group frg, resource_group trg, resource fr, resource tr \
     where l.from_tool_id = frg.tool_id and l.from_rg_url = frg.url \
     and l.to_tool_id = trg.tool_id and l.to_rg_url = trg.url \
     and l.from_tool_id = fr.tool_id and l.from_rg_url = fr.rg_url and l.from_url = fr.url \
     and l.to_tool_id = tr.tool_id and l.to_rg_url = tr.rg_url and l.to_url = tr.url";

impl DoltBranchOps<'_> {
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

    /// SQL clause matching links whose `from_url` the changed URL covers.
    fn path_match(&self, tool_id: &str, change_url: &str, field: &str) -> (String, Vec<String>) {
        let sep = self.separator(tool_id);
        let normalized = normalize_url(change_url, &sep);
        let mut clause = format!("({field} = ? or {field} = ? or {field} like ?");
        let mut params = vec![
            change_url.to_string(),
            normalized.clone(),
            format!("{}%", like_escape(&format!("{normalized}{sep}"))),
        ];
        if normalized.ends_with(&sep) {
            clause.push_str(&format!(" or {field} like ?"));
            params.push(format!("{}%", like_escape(&normalized)));
        }
        clause.push(')');
        (clause, params)
    }

    fn fetch_inferred(
        &mut self,
        key: &LinkKey,
    ) -> StoreResult<Vec<SourceDirtiness>> {
        let rows: Vec<(String, String, String, String, String, String, String, String)> = self
            .conn
            .exec(
                "select infd.source_tool_id, infd.source_rg_url, infd.source_url, \
                 infd.source_last_clean_version, rg.name, rg.version, res.name, res.id \
                 from inferred_dirtiness infd, resource res, resource_group rg \
                 where infd.from_tool_id=? and infd.from_rg_url=? and infd.from_url=? \
                 and infd.to_tool_id=? and infd.to_rg_url=? and infd.to_url=? \
                 and res.tool_id=infd.source_tool_id and res.rg_url=infd.source_rg_url \
                 and res.url=infd.source_url \
                 and rg.tool_id=infd.source_tool_id and rg.url=infd.source_rg_url",
                (
                    &key.from.tool_id,
                    &key.from.resource_group_url,
                    &key.from.url,
                    &key.to.tool_id,
                    &key.to.resource_group_url,
                    &key.to.url,
                ),
            )
            .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(
                |(tool_id, rg_url, url, last_clean, rg_name, rg_version, name, id)| {
                    SourceDirtiness {
                        resource_group: ResourceGroup::new(&tool_id, &rg_url, &rg_name, &rg_version),
                        resource: Resource {
                            name,
                            id,
                            url,
                            deleted: false,
                        },
                        last_clean_version: last_clean,
                    }
                },
            )
            .collect())
    }

    fn expand_row(&mut self, row: LinkRow) -> StoreResult<LinkWithResources> {
        let inferred = self.fetch_inferred(&row.link.key())?;
        Ok(LinkWithResources {
            from_group: row.from_group,
            from_res: row.from_res,
            to_group: row.to_group,
            to_res: row.to_res,
            dirty: row.link.dirty,
            deleted: row.link.deleted,
            last_clean_version: row.link.last_clean_version,
            inferred_dirtiness: inferred,
        })
    }

    fn fetch_links(
        &mut self,
        extra_where: &str,
        params: Vec<String>,
    ) -> StoreResult<Vec<LinkWithResources>> {
        let query = if extra_where.is_empty() {
            LINK_SELECT.to_string()
        } else {
            format!("{LINK_SELECT} and {extra_where}")
        };
        let raw_rows: Vec<mysql::Row> = self.conn.exec(query, params).map_err(backend)?;
        let mut out = Vec::with_capacity(raw_rows.len());
        let mut seen: HashSet<LinkKey> = HashSet::new();
        for raw in raw_rows {
            let Some(row) = LinkRow::from_row(raw) else {
                return Err(StoreError::Backend("malformed link row".to_string()));
            };
            if !seen.insert(row.link.key()) {
                continue;
            }
            out.push(self.expand_row(row)?);
        }
        Ok(out)
    }

    fn upsert_group(&mut self, rg: &ResourceGroup) -> StoreResult<()> {
        self.conn
            .exec_drop(
                "insert into resource_group (tool_id, url, name, version) values (?,?,?,?) \
                 on duplicate key update url=url",
                (&rg.tool_id, &rg.url, &rg.name, &rg.version),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn outgoing_keys(&mut self, node: &ResourceRef) -> StoreResult<Vec<ResourceRef>> {
        let rows: Vec<(String, String, String)> = self
            .conn
            .exec(
                "select to_tool_id, to_rg_url, to_url from link \
                 where from_tool_id=? and from_rg_url=? and from_url=?",
                (&node.tool_id, &node.resource_group_url, &node.url),
            )
            .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|(tool_id, rg_url, url)| ResourceRef::new(&tool_id, &rg_url, &url))
            .collect())
    }

    /// Seed inferred dirtiness through the transitive downstream of a link.
    fn add_inferred_dirtiness(
        &mut self,
        start: &ResourceRef,
        source: &ResourceRef,
        last_clean_version: &str,
    ) -> StoreResult<()> {
        let mut frontier: VecDeque<ResourceRef> = VecDeque::new();
        frontier.push_back(start.clone());
        let mut processed: HashSet<ResourceRef> = HashSet::new();

        while let Some(node) = frontier.pop_front() {
            if !processed.insert(node.clone()) {
                continue;
            }
            for next in self.outgoing_keys(&node)? {
                self.conn
                    .exec_drop(
                        "insert into inferred_dirtiness (from_tool_id, from_rg_url, from_url, \
                         to_tool_id, to_rg_url, to_url, source_tool_id, source_rg_url, \
                         source_url, source_last_clean_version) \
                         values (?,?,?,?,?,?,?,?,?,?) \
                         on duplicate key update from_tool_id=from_tool_id",
                        (
                            &node.tool_id,
                            &node.resource_group_url,
                            &node.url,
                            &next.tool_id,
                            &next.resource_group_url,
                            &next.url,
                            &source.tool_id,
                            &source.resource_group_url,
                            &source.url,
                            last_clean_version,
                        ),
                    )
                    .map_err(backend)?;
                if !processed.contains(&next) {
                    frontier.push_back(next);
                }
            }
        }
        Ok(())
    }

    /// Remove `source` from inferred dirtiness downstream of `start`.
    fn clean_inferred_downstream(
        &mut self,
        start: &LinkKey,
        source: &ResourceRef,
        cleaned: &mut Vec<CleanedLink>,
    ) -> StoreResult<()> {
        let mut frontier: VecDeque<LinkKey> = VecDeque::new();
        frontier.push_back(start.clone());
        let mut processed: HashSet<LinkKey> = HashSet::new();

        while let Some(key) = frontier.pop_front() {
            if !processed.insert(key.clone()) {
                continue;
            }
            for next_to in self.outgoing_keys(&key.to)? {
                let next = LinkKey {
                    from: key.to.clone(),
                    to: next_to,
                };
                if !processed.contains(&next) {
                    frontier.push_back(next);
                }
            }
            self.conn
                .exec_drop(
                    "delete from inferred_dirtiness where from_tool_id=? and from_rg_url=? \
                     and from_url=? and to_tool_id=? and to_rg_url=? and to_url=? \
                     and source_tool_id=? and source_rg_url=? and source_url=?",
                    (
                        &key.from.tool_id,
                        &key.from.resource_group_url,
                        &key.from.url,
                        &key.to.tool_id,
                        &key.to.resource_group_url,
                        &key.to.url,
                        &source.tool_id,
                        &source.resource_group_url,
                        &source.url,
                    ),
                )
                .map_err(backend)?;
            if self.conn.affected_rows() > 0 {
                cleaned.push(CleanedLink {
                    link: Link::new(key.from.clone(), key.to.clone()),
                    source: source.clone(),
                });
            }
        }
        Ok(())
    }

    /// Drop tombstoned clean links, then resources no live link references.
    fn clean_deleted(&mut self) -> StoreResult<()> {
        self.conn
            .query_drop("delete from link where deleted=true and dirty=false")
            .map_err(backend)?;
        let orphans: Vec<(String, String, String)> = self
            .conn
            .query(
                "select r.tool_id, r.rg_url, r.url from resource r \
                 where r.deleted=true and not exists \
                 (select l.from_url from link l where l.from_tool_id=r.tool_id \
                  and l.from_rg_url=r.rg_url and l.from_url=r.url)",
            )
            .map_err(backend)?;
        for (tool_id, rg_url, url) in orphans {
            self.conn
                .exec_drop(
                    "delete from resource where tool_id=? and rg_url=? and url=?",
                    (&tool_id, &rg_url, &url),
                )
                .map_err(backend)?;
        }
        Ok(())
    }
}

fn like_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

impl BranchOps for DoltBranchOps<'_> {
    fn get_resource_group(
        &mut self,
        tool_id: &str,
        url: &str,
    ) -> StoreResult<Option<ResourceGroup>> {
        let row: Option<(String, String)> = self
            .conn
            .exec_first(
                "select name, version from resource_group where tool_id=? and url=?",
                (tool_id, url),
            )
            .map_err(backend)?;
        Ok(row.map(|(name, version)| ResourceGroup::new(tool_id, url, &name, &version)))
    }

    fn get_resource_group_version(&mut self, tool_id: &str, url: &str) -> StoreResult<String> {
        let row: Option<String> = self
            .conn
            .exec_first(
                "select version from resource_group where tool_id=? and url=?",
                (tool_id, url),
            )
            .map_err(backend)?;
        Ok(row.unwrap_or_default())
    }

    fn get_resource_groups(&mut self) -> StoreResult<Vec<ResourceGroup>> {
        let rows: Vec<(String, String, String, String)> = self
            .conn
            .query("select tool_id, url, name, version from resource_group")
            .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|(tool_id, url, name, version)| ResourceGroup::new(&tool_id, &url, &name, &version))
            .collect())
    }

    fn get_resource(
        &mut self,
        rr: &ResourceRef,
        include_deleted: bool,
    ) -> StoreResult<Option<ResourceGroupAndResource>> {
        let deleted_clause = if include_deleted {
            ""
        } else {
            " and r.deleted=false"
        };
        let row: Option<(String, String, String, String, bool)> = self
            .conn
            .exec_first(
                format!(
                    "select rg.name, rg.version, r.name, r.id, r.deleted \
                     from resource r, resource_group rg \
                     where r.tool_id=? and r.rg_url=? and r.url=?{deleted_clause} \
                     and r.tool_id=rg.tool_id and r.rg_url=rg.url"
                ),
                (&rr.tool_id, &rr.resource_group_url, &rr.url),
            )
            .map_err(backend)?;
        Ok(row.map(|(rg_name, rg_version, name, id, deleted)| ResourceGroupAndResource {
            resource_group: ResourceGroup::new(
                &rr.tool_id,
                &rr.resource_group_url,
                &rg_name,
                &rg_version,
            ),
            resource: Resource {
                name,
                id,
                url: rr.url.clone(),
                deleted,
            },
        }))
    }

    fn get_resource_by_ref(&mut self, rr: &ResourceRef) -> StoreResult<Option<Resource>> {
        let row: Option<(String, String, bool)> = self
            .conn
            .exec_first(
                "select name, id, deleted from resource where tool_id=? and rg_url=? and url=?",
                (&rr.tool_id, &rr.resource_group_url, &rr.url),
            )
            .map_err(backend)?;
        Ok(row.map(|(name, id, deleted)| Resource {
            name,
            id,
            url: rr.url.clone(),
            deleted,
        }))
    }

    fn is_resource_deleted(&mut self, rr: &ResourceRef) -> StoreResult<bool> {
        Ok(self
            .get_resource_by_ref(rr)?
            .map(|res| res.deleted)
            .unwrap_or(true))
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
        for pattern in &compiled {
            let deleted_clause = if include_deleted {
                ""
            } else {
                " and r.deleted=false"
            };
            let rows: Vec<(String, String, String, String, String, bool)> = self
                .conn
                .exec(
                    format!(
                        "select rg.name, rg.version, r.url, r.name, r.id, r.deleted \
                         from resource r, resource_group rg \
                         where r.tool_id=? and r.rg_url=?{deleted_clause} \
                         and r.tool_id=rg.tool_id and r.rg_url=rg.url"
                    ),
                    (&pattern.pattern.tool_id, &pattern.pattern.resource_group_url),
                )
                .map_err(backend)?;
            for (rg_name, rg_version, url, name, id, deleted) in rows {
                if pattern.regex.is_match(&url) {
                    sink(ResourceGroupAndResource {
                        resource_group: ResourceGroup::new(
                            &pattern.pattern.tool_id,
                            &pattern.pattern.resource_group_url,
                            &rg_name,
                            &rg_version,
                        ),
                        resource: Resource {
                            name,
                            id,
                            url,
                            deleted,
                        },
                    });
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
        let links = self.fetch_links("l.deleted=false", Vec::new())?;
        for link in links {
            let bare = link.to_link();
            if compiled.iter().any(|pattern| pattern.matches(&bare)) {
                sink(link);
            }
        }
        Ok(())
    }

    fn expand_links(&mut self, links: &[Link]) -> StoreResult<Vec<LinkWithResources>> {
        let mut out = Vec::new();
        for link in links {
            let mut expanded = self.fetch_links(
                "l.from_tool_id=? and l.from_rg_url=? and l.from_url=? \
                 and l.to_tool_id=? and l.to_rg_url=? and l.to_url=?",
                vec![
                    link.from_res.tool_id.clone(),
                    link.from_res.resource_group_url.clone(),
                    link.from_res.url.clone(),
                    link.to_res.tool_id.clone(),
                    link.to_res.resource_group_url.clone(),
                    link.to_res.url.clone(),
                ],
            )?;
            out.append(&mut expanded);
        }
        Ok(out)
    }

    fn get_all_links(&mut self, include_deleted: bool) -> StoreResult<Vec<LinkWithResources>> {
        if include_deleted {
            self.fetch_links("", Vec::new())
        } else {
            self.fetch_links("l.deleted=false", Vec::new())
        }
    }

    fn get_all_links_stream(
        &mut self,
        include_deleted: bool,
        sink: LinkSink<'_>,
    ) -> StoreResult<()> {
        for link in self.get_all_links(include_deleted)? {
            sink(link);
        }
        Ok(())
    }

    fn get_dirty_links(
        &mut self,
        group: &ResourceGroupKey,
        with_inferred: bool,
    ) -> StoreResult<Vec<LinkWithResources>> {
        let dirty_clause = if with_inferred {
            "l.to_tool_id=? and l.to_rg_url=? and l.deleted=false and tr.deleted=false and \
             (l.dirty=true or exists (select 1 from inferred_dirtiness infd \
              where infd.from_tool_id=l.from_tool_id and infd.from_rg_url=l.from_rg_url \
              and infd.from_url=l.from_url and infd.to_tool_id=l.to_tool_id \
              and infd.to_rg_url=l.to_rg_url and infd.to_url=l.to_url))"
        } else {
            "l.to_tool_id=? and l.to_rg_url=? and l.deleted=false and tr.deleted=false \
             and l.dirty=true"
        };
        self.fetch_links(
            dirty_clause,
            vec![group.tool_id.clone(), group.url.clone()],
        )
    }

    fn get_dirty_links_stream(
        &mut self,
        group: &ResourceGroupKey,
        with_inferred: bool,
        sink: LinkSink<'_>,
    ) -> StoreResult<()> {
        for link in self.get_dirty_links(group, with_inferred)? {
            sink(link);
        }
        Ok(())
    }

    fn get_dependency_graph(
        &mut self,
        rr: &ResourceRef,
        upstream: bool,
        max_depth: i32,
    ) -> StoreResult<Vec<LinkWithResources>> {
        let incident_clause = if upstream {
            "l.deleted=false and l.to_tool_id=? and l.to_rg_url=? and l.to_url=?"
        } else {
            "l.deleted=false and l.from_tool_id=? and l.from_rg_url=? and l.from_url=?"
        };

        let mut visited: HashSet<LinkKey> = HashSet::new();
        let mut out: Vec<LinkWithResources> = Vec::new();
        let mut frontier: VecDeque<(ResourceRef, i32)> = VecDeque::new();
        frontier.push_back((rr.clone(), 1));
        let mut seen_nodes: HashSet<ResourceRef> = HashSet::new();

        while let Some((node, depth)) = frontier.pop_front() {
            if max_depth > 0 && depth > max_depth {
                continue;
            }
            if !seen_nodes.insert(node.clone()) {
                continue;
            }
            let links = self.fetch_links(
                incident_clause,
                vec![
                    node.tool_id.clone(),
                    node.resource_group_url.clone(),
                    node.url.clone(),
                ],
            )?;
            for link in links {
                let key = link.key();
                if !visited.insert(key.clone()) {
                    continue;
                }
                let far = if upstream { key.from } else { key.to };
                frontier.push_back((far, depth + 1));
                out.push(link);
            }
        }
        Ok(out)
    }

    fn add_resource(&mut self, rg: &ResourceGroup, res: Option<&Resource>) -> StoreResult<bool> {
        self.check_writable()?;
        self.dirty_tx = true;
        self.upsert_group(rg)?;
        let Some(res) = res else {
            return Ok(false);
        };
        self.conn
            .exec_drop(
                "insert into resource (tool_id, rg_url, url, name, id, deleted) \
                 values (?,?,?,?,?,false) on duplicate key update deleted=false",
                (&rg.tool_id, &rg.url, &res.url, &res.name, &res.id),
            )
            .map_err(backend)?;
        Ok(self.conn.affected_rows() > 0)
    }

    fn add_resources(&mut self, resources: &[ResourceGroupAndResource]) -> StoreResult<bool> {
        self.check_writable()?;
        if resources.is_empty() {
            return Ok(false);
        }
        self.dirty_tx = true;

        let mut group_keys: HashSet<ResourceGroupKey> = HashSet::new();
        let mut groups: Vec<&ResourceGroup> = Vec::new();
        for item in resources {
            if group_keys.insert(item.resource_group.key()) {
                groups.push(&item.resource_group);
            }
        }
        for chunk in groups.chunks(BATCH_SIZE) {
            self.conn
                .exec_batch(
                    "insert into resource_group (tool_id, url, name, version) values (?,?,?,?) \
                     on duplicate key update name=name",
                    chunk
                        .iter()
                        .map(|rg| (&rg.tool_id, &rg.url, &rg.name, &rg.version)),
                )
                .map_err(backend)?;
        }

        for chunk in resources.chunks(BATCH_SIZE) {
            self.conn
                .exec_batch(
                    "insert into resource (tool_id, rg_url, url, name, id, deleted) \
                     values (?,?,?,?,?,false) on duplicate key update deleted=false",
                    chunk.iter().map(|item| {
                        (
                            &item.resource_group.tool_id,
                            &item.resource_group.url,
                            &item.resource.url,
                            &item.resource.name,
                            &item.resource.id,
                        )
                    }),
                )
                .map_err(backend)?;
        }
        Ok(true)
    }

    fn add_link(&mut self, link: &LinkWithResources) -> StoreResult<bool> {
        self.check_writable()?;
        self.dirty_tx = true;
        self.add_resource(&link.from_group, Some(&link.from_res))?;
        self.add_resource(&link.to_group, Some(&link.to_res))?;
        self.conn
            .exec_drop(
                "insert into link (from_tool_id, from_rg_url, from_url, \
                 to_tool_id, to_rg_url, to_url, dirty, deleted, last_clean_version) \
                 values (?,?,?,?,?,?,false,false,?) on duplicate key update deleted=false",
                (
                    &link.from_group.tool_id,
                    &link.from_group.url,
                    &link.from_res.url,
                    &link.to_group.tool_id,
                    &link.to_group.url,
                    &link.to_res.url,
                    &link.from_group.version,
                ),
            )
            .map_err(backend)?;
        Ok(self.conn.affected_rows() > 0)
    }

    fn add_links(&mut self, links: &[LinkWithResources]) -> StoreResult<bool> {
        self.check_writable()?;
        if links.is_empty() {
            return Ok(false);
        }
        self.dirty_tx = true;

        let endpoints: Vec<ResourceGroupAndResource> = links
            .iter()
            .flat_map(|link| {
                [
                    ResourceGroupAndResource {
                        resource_group: link.from_group.clone(),
                        resource: link.from_res.clone(),
                    },
                    ResourceGroupAndResource {
                        resource_group: link.to_group.clone(),
                        resource: link.to_res.clone(),
                    },
                ]
            })
            .collect();
        self.add_resources(&endpoints)?;

        for chunk in links.chunks(BATCH_SIZE) {
            self.conn
                .exec_batch(
                    "insert into link (from_tool_id, from_rg_url, from_url, \
                     to_tool_id, to_rg_url, to_url, dirty, deleted, last_clean_version) \
                     values (?,?,?,?,?,?,false,false,?) on duplicate key update deleted=false",
                    chunk.iter().map(|link| {
                        (
                            &link.from_group.tool_id,
                            &link.from_group.url,
                            &link.from_res.url,
                            &link.to_group.tool_id,
                            &link.to_group.url,
                            &link.to_res.url,
                            &link.from_group.version,
                        )
                    }),
                )
                .map_err(backend)?;
        }
        Ok(true)
    }

    fn remove_resource_ref(&mut self, rr: &ResourceRef) -> StoreResult<bool> {
        self.check_writable()?;
        self.dirty_tx = true;
        self.conn
            .exec_drop(
                "update link set deleted=true where \
                 (from_tool_id=? and from_rg_url=? and from_url=?) or \
                 (to_tool_id=? and to_rg_url=? and to_url=?)",
                (
                    &rr.tool_id,
                    &rr.resource_group_url,
                    &rr.url,
                    &rr.tool_id,
                    &rr.resource_group_url,
                    &rr.url,
                ),
            )
            .map_err(backend)?;
        self.conn
            .exec_drop(
                "delete from inferred_dirtiness where \
                 source_tool_id=? and source_rg_url=? and source_url=?",
                (&rr.tool_id, &rr.resource_group_url, &rr.url),
            )
            .map_err(backend)?;
        self.conn
            .exec_drop(
                "update resource set deleted=true where tool_id=? and rg_url=? and url=? \
                 and deleted=false",
                (&rr.tool_id, &rr.resource_group_url, &rr.url),
            )
            .map_err(backend)?;
        Ok(self.conn.affected_rows() > 0)
    }

    fn remove_link(&mut self, target: &Link) -> StoreResult<bool> {
        self.check_writable()?;
        self.dirty_tx = true;
        let key_params = (
            &target.from_res.tool_id,
            &target.from_res.resource_group_url,
            &target.from_res.url,
            &target.to_res.tool_id,
            &target.to_res.resource_group_url,
            &target.to_res.url,
        );
        self.conn
            .exec_drop(
                "delete from inferred_dirtiness where from_tool_id=? and from_rg_url=? \
                 and from_url=? and to_tool_id=? and to_rg_url=? and to_url=?",
                key_params,
            )
            .map_err(backend)?;
        self.conn
            .exec_drop(
                "update link set deleted=true where dirty=true and \
                 from_tool_id=? and from_rg_url=? and from_url=? \
                 and to_tool_id=? and to_rg_url=? and to_url=?",
                key_params,
            )
            .map_err(backend)?;
        let tombstoned = self.conn.affected_rows();
        self.conn
            .exec_drop(
                "delete from link where dirty=false and \
                 from_tool_id=? and from_rg_url=? and from_url=? \
                 and to_tool_id=? and to_rg_url=? and to_url=?",
                key_params,
            )
            .map_err(backend)?;
        Ok(tombstoned + self.conn.affected_rows() > 0)
    }

    fn update_resource_group(&mut self, change: &ResourceGroupChange) -> StoreResult<Vec<Link>> {
        self.check_writable()?;
        let old_version: Option<String> = self
            .conn
            .exec_first(
                "select version from resource_group where tool_id=? and url=?",
                (&change.tool_id, &change.url),
            )
            .map_err(backend)?;
        let Some(old_version) = old_version else {
            // first sight of the group: insert it with its resources
            self.dirty_tx = true;
            let rg = change.to_resource_group();
            let items: Vec<ResourceGroupAndResource> = rg
                .resources
                .values()
                .map(|res| ResourceGroupAndResource {
                    resource_group: rg.clone(),
                    resource: res.clone(),
                })
                .collect();
            if items.is_empty() {
                self.upsert_group(&rg)?;
            } else {
                self.add_resources(&items)?;
            }
            return Ok(Vec::new());
        };

        self.dirty_tx = true;
        self.conn
            .exec_drop(
                "update resource_group set version=? where tool_id=? and url=?",
                (&change.version, &change.tool_id, &change.url),
            )
            .map_err(backend)?;

        let mut effects: Vec<Link> = Vec::new();
        let mut affected: HashSet<LinkKey> = HashSet::new();

        for res_change in change.resources.values() {
            use crate::core::ChangeType::{Added, Modified, Removed};

            if matches!(res_change.change_type, Added | Modified) || res_change.change_type == Removed
            {
                let (clause, path_params) =
                    self.path_match(&change.tool_id, &res_change.url, "from_url");
                let mut params = vec![change.tool_id.clone(), change.url.clone()];
                params.extend(path_params);
                let rows: Vec<(String, String, String, String, String, String)> = self
                    .conn
                    .exec(
                        format!(
                            "select from_tool_id, from_rg_url, from_url, \
                             to_tool_id, to_rg_url, to_url from link \
                             where from_tool_id=? and from_rg_url=? and dirty=false \
                             and deleted=false and {clause}"
                        ),
                        params,
                    )
                    .map_err(backend)?;

                let source = ResourceRef::new(&change.tool_id, &change.url, &res_change.url);
                for (ftool, frg, furl, ttool, trg, turl) in rows {
                    let key = LinkKey {
                        from: ResourceRef::new(&ftool, &frg, &furl),
                        to: ResourceRef::new(&ttool, &trg, &turl),
                    };
                    if !affected.insert(key.clone()) {
                        continue;
                    }
                    self.conn
                        .exec_drop(
                            "update link set dirty=true, last_clean_version=? \
                             where from_tool_id=? and from_rg_url=? and from_url=? \
                             and to_tool_id=? and to_rg_url=? and to_url=? and dirty=false",
                            (
                                &old_version,
                                &key.from.tool_id,
                                &key.from.resource_group_url,
                                &key.from.url,
                                &key.to.tool_id,
                                &key.to.resource_group_url,
                                &key.to.url,
                            ),
                        )
                        .map_err(backend)?;
                    self.add_inferred_dirtiness(&key.to, &source, &old_version)?;
                    let mut link = Link::new(key.from.clone(), key.to.clone());
                    link.dirty = true;
                    link.last_clean_version = old_version.clone();
                    effects.push(link);
                }
            }

            if res_change.renames() {
                self.conn
                    .exec_drop(
                        "update link set from_url=? where from_tool_id=? and from_rg_url=? \
                         and from_url=?",
                        (
                            &res_change.new_url,
                            &change.tool_id,
                            &change.url,
                            &res_change.url,
                        ),
                    )
                    .map_err(backend)?;
                self.conn
                    .exec_drop(
                        "update link set to_url=? where to_tool_id=? and to_rg_url=? \
                         and to_url=?",
                        (
                            &res_change.new_url,
                            &change.tool_id,
                            &change.url,
                            &res_change.url,
                        ),
                    )
                    .map_err(backend)?;
                self.conn
                    .exec_drop(
                        "update inferred_dirtiness set source_url=? where source_tool_id=? \
                         and source_rg_url=? and source_url=?",
                        (
                            &res_change.new_url,
                            &change.tool_id,
                            &change.url,
                            &res_change.url,
                        ),
                    )
                    .map_err(backend)?;
                self.conn
                    .exec_drop(
                        "update resource set id=?, name=?, url=? where tool_id=? and rg_url=? \
                         and url=?",
                        (
                            &res_change.new_id,
                            &res_change.new_name,
                            &res_change.new_url,
                            &change.tool_id,
                            &change.url,
                            &res_change.url,
                        ),
                    )
                    .map_err(backend)?;
            } else if res_change.change_type == crate::core::ChangeType::Removed {
                self.conn
                    .exec_drop(
                        "update link set deleted=true, dirty=true where from_tool_id=? \
                         and from_rg_url=? and from_url=?",
                        (&change.tool_id, &change.url, &res_change.url),
                    )
                    .map_err(backend)?;
                self.conn
                    .exec_drop(
                        "delete from link where to_tool_id=? and to_rg_url=? and to_url=?",
                        (&change.tool_id, &change.url, &res_change.url),
                    )
                    .map_err(backend)?;
                self.conn
                    .exec_drop(
                        "delete from inferred_dirtiness where source_tool_id=? \
                         and source_rg_url=? and source_url=?",
                        (&change.tool_id, &change.url, &res_change.url),
                    )
                    .map_err(backend)?;
                self.conn
                    .exec_drop(
                        "update resource set deleted=true where tool_id=? and rg_url=? and url=?",
                        (&change.tool_id, &change.url, &res_change.url),
                    )
                    .map_err(backend)?;
            }
        }
        Ok(effects)
    }

    fn edit_resource_group(
        &mut self,
        old: &ResourceGroup,
        new: &ResourceGroup,
    ) -> StoreResult<()> {
        self.check_writable()?;
        self.dirty_tx = true;
        self.conn
            .exec_drop(
                "update resource_group set tool_id=?, url=?, name=?, version=? \
                 where tool_id=? and url=?",
                (
                    &new.tool_id,
                    &new.url,
                    &new.name,
                    &new.version,
                    &old.tool_id,
                    &old.url,
                ),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn remove_resource_group(&mut self, tool_id: &str, url: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.dirty_tx = true;
        self.conn
            .exec_drop(
                "delete from link where (from_tool_id=? and from_rg_url=?) or \
                 (to_tool_id=? and to_rg_url=?)",
                (tool_id, url, tool_id, url),
            )
            .map_err(backend)?;
        self.conn
            .exec_drop(
                "delete from inferred_dirtiness where (from_tool_id=? and from_rg_url=?) or \
                 (to_tool_id=? and to_rg_url=?) or (source_tool_id=? and source_rg_url=?)",
                (tool_id, url, tool_id, url, tool_id, url),
            )
            .map_err(backend)?;
        self.conn
            .exec_drop(
                "delete from resource where tool_id=? and rg_url=?",
                (tool_id, url),
            )
            .map_err(backend)?;
        self.conn
            .exec_drop(
                "delete from resource_group where tool_id=? and url=?",
                (tool_id, url),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn mark_resources_clean(&mut self, refs: &[ResourceRef], propagate: bool) -> StoreResult<()> {
        self.check_writable()?;
        self.dirty_tx = true;
        for rr in refs {
            let incoming: Vec<(String, String, String)> = self
                .conn
                .exec(
                    "select from_tool_id, from_rg_url, from_url from link \
                     where to_tool_id=? and to_rg_url=? and to_url=?",
                    (&rr.tool_id, &rr.resource_group_url, &rr.url),
                )
                .map_err(backend)?;
            self.conn
                .exec_drop(
                    "update link set dirty=false, last_clean_version='' \
                     where to_tool_id=? and to_rg_url=? and to_url=?",
                    (&rr.tool_id, &rr.resource_group_url, &rr.url),
                )
                .map_err(backend)?;
            self.conn
                .exec_drop(
                    "delete from inferred_dirtiness where to_tool_id=? and to_rg_url=? \
                     and to_url=? and source_tool_id=? and source_rg_url=? and source_url=?",
                    (
                        &rr.tool_id,
                        &rr.resource_group_url,
                        &rr.url,
                        &rr.tool_id,
                        &rr.resource_group_url,
                        &rr.url,
                    ),
                )
                .map_err(backend)?;
            if propagate {
                for (ftool, frg, furl) in incoming {
                    let key = LinkKey {
                        from: ResourceRef::new(&ftool, &frg, &furl),
                        to: rr.clone(),
                    };
                    let source = key.from.clone();
                    let mut cleaned = Vec::new();
                    self.clean_inferred_downstream(&key, &source, &mut cleaned)?;
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
        self.dirty_tx = true;
        let mut all_cleaned = Vec::new();
        for link in links {
            self.conn
                .exec_drop(
                    "update link set dirty=false, last_clean_version='' \
                     where from_tool_id=? and from_rg_url=? and from_url=? \
                     and to_tool_id=? and to_rg_url=? and to_url=?",
                    (
                        &link.from_res.tool_id,
                        &link.from_res.resource_group_url,
                        &link.from_res.url,
                        &link.to_res.tool_id,
                        &link.to_res.resource_group_url,
                        &link.to_res.url,
                    ),
                )
                .map_err(backend)?;
            if propagate {
                self.clean_inferred_downstream(&link.key(), &link.from_res, &mut all_cleaned)?;
            }
            self.clean_deleted()?;
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
        self.dirty_tx = true;
        let mut cleaned = Vec::new();
        if !propagate {
            self.conn
                .exec_drop(
                    "delete from inferred_dirtiness where from_tool_id=? and from_rg_url=? \
                     and from_url=? and to_tool_id=? and to_rg_url=? and to_url=? \
                     and source_tool_id=? and source_rg_url=? and source_url=?",
                    (
                        &link.from_res.tool_id,
                        &link.from_res.resource_group_url,
                        &link.from_res.url,
                        &link.to_res.tool_id,
                        &link.to_res.resource_group_url,
                        &link.to_res.url,
                        &source.tool_id,
                        &source.resource_group_url,
                        &source.url,
                    ),
                )
                .map_err(backend)?;
            if self.conn.affected_rows() > 0 {
                cleaned.push(CleanedLink {
                    link: link.clone(),
                    source: source.clone(),
                });
            }
            return Ok(cleaned);
        }
        self.clean_inferred_downstream(&link.key(), source, &mut cleaned)?;
        Ok(cleaned)
    }

    fn save_branch_state(&mut self) -> StoreResult<()> {
        self.check_writable()?;
        self.conn
            .exec_drop(
                "CALL DOLT_COMMIT('-a', '--skip-empty', '-m', ?)",
                ("depi state update",),
            )
            .map_err(backend)?;
        self.dirty_tx = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::like_escape;

    #[test]
    fn like_escape_guards_wildcards() {
        assert_eq!(like_escape("/a_b%c"), "/a\\_b\\%c");
        assert_eq!(like_escape("plain/path"), "plain/path");
    }
}
