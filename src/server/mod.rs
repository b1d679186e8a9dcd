//! The server surface the RPC transport binds to.
//!
//! Every handler validates the session, answers the access gate's two
//! questions, runs the store operation under the branch guard, fans the
//! resulting events out to watching sessions, and writes the audit trail.
//! Handlers never fail at the Rust level for domain errors; those become
//! `ok=false` responses.

pub mod access;
pub mod audit;
pub mod blackboard;
pub mod queue;
pub mod session;
pub mod token;

mod board;
mod graph;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use crate::api::{
    BlackboardUpdate, BranchListResponse, CurrentBranchResponse, DepiUpdate, GenericResponse,
    LastKnownVersionResponse, LoginResponse, PingResponse, ResourceUpdate,
    ResourcesUpdatedNotification,
};
use crate::config::Config;
use crate::core::ResourceGroupKey;
use crate::store::{Store, StoreError};

use access::{AccessGate, Authorization, CAP_BRANCH_CREATE, CAP_BRANCH_LIST, CAP_BRANCH_SWITCH,
    CAP_BRANCH_TAG};
use audit::{AuditSink, DailyFileAudit, NullAudit};
use blackboard::Blackboard;
use session::{Session, SessionRegistry, Sweeper, User};
use token::{TokenCodec, KEY_FILE};

const MAIN_BRANCH: &str = "main";
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct Server {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    sessions: Arc<SessionRegistry>,
    blackboards: Mutex<HashMap<String, Blackboard>>,
    logins: HashMap<String, Arc<User>>,
    gate: AccessGate,
    tokens: TokenCodec,
    audit: Box<dyn AuditSink>,
    blackboard_always_main: bool,
    session_timeout: Duration,
    token_timeout_secs: i64,
}

impl Server {
    /// Build the server with the process-local token key file.
    pub fn new(config: Arc<Config>, store: Arc<dyn Store>) -> crate::Result<Server> {
        let tokens = TokenCodec::load_or_create(Path::new(KEY_FILE))?;
        Server::with_token_codec(config, store, tokens)
    }

    pub fn with_token_codec(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        tokens: TokenCodec,
    ) -> crate::Result<Server> {
        let audit: Box<dyn AuditSink> = if config.audit.directory.is_empty() {
            Box::new(NullAudit)
        } else {
            Box::new(
                DailyFileAudit::new(&config.audit.directory)
                    .map_err(|e| StoreError::Backend(format!("cannot open audit dir: {e}")))?,
            )
        };

        let authorization_enabled = config.server.authorization_enabled;
        let mut logins = HashMap::new();
        for user_config in &config.users {
            let authorization = if authorization_enabled {
                Some(Authorization::from_rules(
                    &user_config.auth_rules,
                    &user_config.name,
                ))
            } else {
                None
            };
            logins.insert(
                user_config.name.clone(),
                Arc::new(User {
                    name: user_config.name.clone(),
                    password: user_config.password.clone(),
                    authorization,
                }),
            );
        }

        Ok(Server {
            session_timeout: config.session_timeout(),
            token_timeout_secs: config.token_timeout_secs(),
            gate: AccessGate::new(authorization_enabled),
            config,
            store,
            sessions: Arc::new(SessionRegistry::new()),
            blackboards: Mutex::new(HashMap::new()),
            logins,
            tokens,
            audit,
            blackboard_always_main: true,
        })
    }

    /// Start the background session-expiry sweeper (wakes every 300 s).
    pub fn start_sweeper(&self) -> Sweeper {
        Sweeper::spawn(self.sessions.clone(), self.session_timeout, SWEEP_INTERVAL)
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    fn now_unix() -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }

    pub(crate) fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id)
    }

    pub(crate) fn invalid_session(session_id: &str) -> GenericResponse {
        GenericResponse::failure(format!("invalid session: {session_id}"))
    }

    pub(crate) fn not_authorized(user: &str, action: &str) -> GenericResponse {
        GenericResponse::failure(format!("user {user} is not authorized to {action}"))
    }

    pub(crate) fn has_capability(&self, user: &User, capability: &str) -> bool {
        self.gate
            .has_capability(user.authorization.as_ref(), capability)
    }

    pub(crate) fn is_authorized(&self, user: &User, capability: &str, args: &[&str]) -> bool {
        self.gate
            .is_authorized(user.authorization.as_ref(), capability, args)
    }

    pub(crate) fn audit(&self, user: &str, operation: &str, data: String) {
        self.audit.record(user, operation, &data);
    }

    pub(crate) fn boards(&self) -> MutexGuard<'_, HashMap<String, Blackboard>> {
        match self.blackboards.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --- fan-out ----------------------------------------------------------

    pub(crate) fn push_depi(&self, branch_name: &str, update: DepiUpdate) {
        for session in self.sessions.snapshot() {
            if session.branch_name() != branch_name {
                continue;
            }
            if session.watching_depi() {
                session.depi_updates.push(update.clone());
            }
        }
    }

    pub(crate) fn push_resource_update(
        &self,
        branch_name: &str,
        group: &ResourceGroupKey,
        update: &ResourceUpdate,
    ) {
        for session in self.sessions.snapshot() {
            if session.branch_name() != branch_name {
                continue;
            }
            if session.watching_resources() && session.watches_group(group) {
                session.resource_updates.push(update.clone());
            }
        }
    }

    pub(crate) fn push_blackboard(&self, user: &str, update: BlackboardUpdate) {
        for session in self.sessions.snapshot() {
            if session.user.name != user {
                continue;
            }
            if session.watching_blackboard() {
                session.blackboard_updates.push(update.clone());
            }
        }
    }

    // --- session lifecycle ------------------------------------------------

    pub fn login(&self, user: &str, password: &str) -> LoginResponse {
        let Some(known) = self.logins.get(user) else {
            return LoginResponse::failure("Invalid login");
        };
        if known.password != password {
            return LoginResponse::failure("Invalid login");
        }
        let main = match self.store.get_branch(MAIN_BRANCH) {
            Ok(branch) => branch,
            Err(e) => {
                return LoginResponse::failure(format!("error fetching main branch: {e}"));
            }
        };

        let session_id = Uuid::new_v4().to_string();
        self.sessions
            .insert(Arc::new(Session::new(session_id.clone(), known.clone(), main)));
        self.boards().entry(user.to_string()).or_default();

        let token = self.tokens.generate(&session_id, user, Self::now_unix());
        tracing::info!(user, "login");
        LoginResponse {
            ok: true,
            msg: String::new(),
            session_id,
            login_token: token,
            user: user.to_string(),
        }
    }

    pub fn login_with_token(&self, login_token: &str) -> LoginResponse {
        let claims = match self.tokens.decode(login_token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(error = %e, "token decode failed");
                return LoginResponse::failure("Invalid token");
            }
        };
        if Self::now_unix() - claims.issued_at_secs > self.token_timeout_secs {
            return LoginResponse::failure("Token expired");
        }
        let Some(known) = self.logins.get(&claims.user) else {
            return LoginResponse::failure("Invalid token");
        };

        let session_id = match self.sessions.get(&claims.session_id) {
            Some(existing) => existing.session_id.clone(),
            None => {
                let main = match self.store.get_branch(MAIN_BRANCH) {
                    Ok(branch) => branch,
                    Err(e) => {
                        return LoginResponse::failure(format!("error fetching main branch: {e}"));
                    }
                };
                let session_id = Uuid::new_v4().to_string();
                self.sessions.insert(Arc::new(Session::new(
                    session_id.clone(),
                    known.clone(),
                    main,
                )));
                self.boards().entry(claims.user.clone()).or_default();
                session_id
            }
        };

        let token = self
            .tokens
            .generate(&session_id, &claims.user, Self::now_unix());
        LoginResponse {
            ok: true,
            msg: String::new(),
            session_id,
            login_token: token,
            user: claims.user,
        }
    }

    pub fn logout(&self, session_id: &str) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        session.close();
        self.sessions.remove(session_id);
        GenericResponse::success()
    }

    /// Renews the session implicitly and hands back a fresh token.
    pub fn ping(&self, session_id: &str) -> PingResponse {
        let Some(session) = self.session(session_id) else {
            return PingResponse {
                ok: false,
                msg: format!("invalid session: {session_id}"),
                login_token: String::new(),
            };
        };
        let token = self
            .tokens
            .generate(&session.session_id, &session.user.name, Self::now_unix());
        PingResponse {
            ok: true,
            msg: String::new(),
            login_token: token,
        }
    }

    // --- branches ---------------------------------------------------------

    pub fn current_branch(&self, session_id: &str) -> CurrentBranchResponse {
        let Some(session) = self.session(session_id) else {
            return CurrentBranchResponse {
                ok: false,
                msg: format!("invalid session: {session_id}"),
                branch: String::new(),
            };
        };
        CurrentBranchResponse {
            ok: true,
            msg: String::new(),
            branch: session.branch_name(),
        }
    }

    pub fn set_branch(&self, session_id: &str, branch: &str) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if !self.has_capability(&session.user, CAP_BRANCH_SWITCH) {
            return Self::not_authorized(&session.user.name, "switch branches");
        }
        match self.store.get_branch(branch) {
            Ok(handle) => {
                session.set_branch(handle);
                GenericResponse::success()
            }
            Err(StoreError::NotFound { .. }) => GenericResponse::failure("Unknown branch"),
            Err(e) => GenericResponse::failure(format!("error fetching branch: {e}")),
        }
    }

    pub fn create_branch(
        &self,
        session_id: &str,
        branch_name: &str,
        from_branch: Option<&str>,
        from_tag: Option<&str>,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        if self.store.branch_exists(branch_name) {
            return GenericResponse::failure("Branch already exists");
        }

        let (from_name, is_from_tag) = match (from_branch, from_tag) {
            (Some(branch), _) if !branch.is_empty() => {
                if !self.store.branch_exists(branch) {
                    return GenericResponse::failure("Unknown branch");
                }
                (branch.to_string(), false)
            }
            (_, Some(tag)) if !tag.is_empty() => {
                if !self.store.tag_exists(tag) {
                    return GenericResponse::failure("Unknown tag");
                }
                (tag.to_string(), true)
            }
            _ => (session.branch_name(), false),
        };

        if !self.has_capability(&session.user, CAP_BRANCH_CREATE) {
            return Self::not_authorized(&session.user.name, "create a branch");
        }

        let (result, operation) = if is_from_tag {
            (
                self.store.create_branch_from_tag(branch_name, &from_name),
                "CreateBranchFromTag",
            )
        } else {
            (
                self.store.create_branch(branch_name, &from_name),
                "CreateBranch",
            )
        };
        if let Err(e) = result {
            return GenericResponse::failure(format!("error creating branch: {e}"));
        }
        self.audit(
            &session.user.name,
            operation,
            format!("from={from_name};to={branch_name}"),
        );
        GenericResponse::success()
    }

    pub fn create_tag(
        &self,
        session_id: &str,
        tag_name: &str,
        from_branch: Option<&str>,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        let from_name = match from_branch {
            Some(branch) if !branch.is_empty() => {
                if !self.store.branch_exists(branch) {
                    return GenericResponse::failure("Unknown branch");
                }
                branch.to_string()
            }
            _ => session.branch_name(),
        };
        if !self.has_capability(&session.user, CAP_BRANCH_TAG) {
            return Self::not_authorized(&session.user.name, "tag a branch");
        }
        if let Err(e) = self.store.create_tag(tag_name, &from_name) {
            return GenericResponse::failure(format!("error creating tag: {e}"));
        }
        self.audit(
            &session.user.name,
            "CreateTag",
            format!("from={from_name};to={tag_name}"),
        );
        GenericResponse::success()
    }

    pub fn get_branch_list(&self, session_id: &str) -> BranchListResponse {
        let failure = |msg: String| BranchListResponse {
            ok: false,
            msg,
            branches: Vec::new(),
            tags: Vec::new(),
        };
        let Some(session) = self.session(session_id) else {
            return failure(format!("invalid session: {session_id}"));
        };
        if !self.has_capability(&session.user, CAP_BRANCH_LIST) {
            return failure(format!(
                "user {} is not authorized to list branches",
                session.user.name
            ));
        }
        let branches = match self.store.branch_list() {
            Ok(branches) => branches,
            Err(e) => return failure(format!("error retrieving branch list: {e}")),
        };
        let tags = match self.store.tag_list() {
            Ok(tags) => tags,
            Err(e) => return failure(format!("error retrieving tag list: {e}")),
        };
        BranchListResponse {
            ok: true,
            msg: String::new(),
            branches,
            tags,
        }
    }

    pub fn get_last_known_version(
        &self,
        session_id: &str,
        tool_id: &str,
        url: &str,
    ) -> LastKnownVersionResponse {
        let failure = |msg: String| LastKnownVersionResponse {
            ok: false,
            msg,
            version: String::new(),
        };
        let Some(session) = self.session(session_id) else {
            return failure(format!("invalid session: {session_id}"));
        };
        let branch = session.branch();
        let version = branch
            .ops()
            .and_then(|mut ops| ops.get_resource_group_version(tool_id, url));
        match version {
            Ok(version) => LastKnownVersionResponse {
                ok: true,
                msg: String::new(),
                version,
            },
            Err(e) => failure(format!("error getting last known version: {e}")),
        }
    }

    // --- watch management -------------------------------------------------

    pub fn watch_resource_group(
        &self,
        session_id: &str,
        tool_id: &str,
        url: &str,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        session.watch_group(ResourceGroupKey {
            tool_id: tool_id.to_string(),
            url: url.to_string(),
        });
        GenericResponse::success()
    }

    pub fn unwatch_resource_group(
        &self,
        session_id: &str,
        tool_id: &str,
        url: &str,
    ) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        session.unwatch_group(&ResourceGroupKey {
            tool_id: tool_id.to_string(),
            url: url.to_string(),
        });
        GenericResponse::success()
    }

    pub fn unwatch_blackboard(&self, session_id: &str) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        session.set_watching_blackboard(false);
        session.blackboard_updates.push(BlackboardUpdate::timeout());
        GenericResponse::success()
    }

    pub fn unwatch_depi(&self, session_id: &str) -> GenericResponse {
        let Some(session) = self.session(session_id) else {
            return Self::invalid_session(session_id);
        };
        session.set_watching_depi(false);
        session.depi_updates.push(DepiUpdate::timeout());
        GenericResponse::success()
    }

    // --- subscriber loops -------------------------------------------------

    /// Forward per-resource updates into `sink` until the client cancels
    /// (sink returns false), the queue closes, or the session ends.
    pub fn register_callback(
        &self,
        session_id: &str,
        sink: &mut dyn FnMut(ResourcesUpdatedNotification) -> bool,
    ) {
        let Some(session) = self.session(session_id) else {
            sink(ResourcesUpdatedNotification {
                ok: false,
                msg: format!("invalid session: {session_id}"),
                updates: Vec::new(),
            });
            return;
        };
        session.set_watching_resources(true);
        while session.watching_resources() {
            let Ok(item) = session.resource_updates.pop_wait() else {
                break;
            };
            let forwarded = sink(ResourcesUpdatedNotification {
                ok: true,
                msg: String::new(),
                updates: vec![item],
            });
            if !forwarded {
                break;
            }
        }
        session.set_watching_resources(false);
    }

    pub fn watch_blackboard(
        &self,
        session_id: &str,
        sink: &mut dyn FnMut(BlackboardUpdate) -> bool,
    ) {
        let Some(session) = self.session(session_id) else {
            sink(BlackboardUpdate {
                ok: false,
                msg: format!("invalid session: {session_id}"),
                updates: Vec::new(),
            });
            return;
        };
        session.set_watching_blackboard(true);
        while session.watching_blackboard() {
            let Ok(item) = session.blackboard_updates.pop_wait() else {
                break;
            };
            if item.is_timeout() {
                break;
            }
            if !sink(item) {
                break;
            }
        }
        session.set_watching_blackboard(false);
    }

    pub fn watch_depi(&self, session_id: &str, sink: &mut dyn FnMut(DepiUpdate) -> bool) {
        let Some(session) = self.session(session_id) else {
            sink(DepiUpdate {
                ok: false,
                msg: format!("invalid session: {session_id}"),
                updates: Vec::new(),
            });
            return;
        };
        session.set_watching_depi(true);
        while session.watching_depi() {
            let Ok(item) = session.depi_updates.pop_wait() else {
                break;
            };
            if item.is_timeout() {
                break;
            }
            if !sink(item) {
                break;
            }
        }
        session.set_watching_depi(false);
    }
}
