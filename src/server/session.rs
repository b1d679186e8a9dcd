//! Sessions and the registry that owns them.
//!
//! A session binds a user to a branch and carries the three notification
//! queues. The registry holds all live sessions behind one mutex with short
//! critical sections; a background sweeper removes sessions idle past the
//! configured timeout and closes their queues, which terminates any
//! subscriber loops.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Sender};

use crate::api::{BlackboardUpdate, DepiUpdate, ResourceUpdate};
use crate::core::ResourceGroupKey;
use crate::store::Branch;

use super::access::Authorization;
use super::queue::UpdateQueue;

/// A configured user. Credential verification itself is the transport's
/// concern; the core compares the config-file password on login.
pub struct User {
    pub name: String,
    pub password: String,
    pub authorization: Option<Authorization>,
}

pub struct Session {
    pub session_id: String,
    pub user: Arc<User>,
    pub resource_updates: UpdateQueue<ResourceUpdate>,
    pub blackboard_updates: UpdateQueue<BlackboardUpdate>,
    pub depi_updates: UpdateQueue<DepiUpdate>,
    state: Mutex<SessionState>,
}

struct SessionState {
    branch: Arc<dyn Branch>,
    watched_groups: HashSet<ResourceGroupKey>,
    watching_resources: bool,
    watching_blackboard: bool,
    watching_depi: bool,
    last_request: Instant,
}

impl Session {
    pub fn new(session_id: String, user: Arc<User>, branch: Arc<dyn Branch>) -> Self {
        Session {
            session_id,
            user,
            resource_updates: UpdateQueue::new(),
            blackboard_updates: UpdateQueue::new(),
            depi_updates: UpdateQueue::new(),
            state: Mutex::new(SessionState {
                branch,
                watched_groups: HashSet::new(),
                watching_resources: false,
                watching_blackboard: false,
                watching_depi: false,
                last_request: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn branch(&self) -> Arc<dyn Branch> {
        self.lock().branch.clone()
    }

    pub fn branch_name(&self) -> String {
        self.lock().branch.name()
    }

    pub fn set_branch(&self, branch: Arc<dyn Branch>) {
        self.lock().branch = branch;
    }

    pub fn touch(&self) {
        self.lock().last_request = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_request.elapsed()
    }

    pub fn watch_group(&self, key: ResourceGroupKey) {
        let mut state = self.lock();
        state.watching_resources = true;
        state.watched_groups.insert(key);
    }

    pub fn unwatch_group(&self, key: &ResourceGroupKey) {
        self.lock().watched_groups.remove(key);
    }

    pub fn watches_group(&self, key: &ResourceGroupKey) -> bool {
        self.lock().watched_groups.contains(key)
    }

    pub fn watching_resources(&self) -> bool {
        self.lock().watching_resources
    }

    pub fn set_watching_resources(&self, on: bool) {
        self.lock().watching_resources = on;
    }

    pub fn watching_blackboard(&self) -> bool {
        self.lock().watching_blackboard
    }

    pub fn set_watching_blackboard(&self, on: bool) {
        self.lock().watching_blackboard = on;
    }

    pub fn watching_depi(&self) -> bool {
        self.lock().watching_depi
    }

    pub fn set_watching_depi(&self, on: bool) {
        self.lock().watching_depi = on;
    }

    /// Drop all three queues, waking any subscriber loops.
    pub fn close(&self) {
        self.resource_updates.close();
        self.blackboard_updates.close();
        self.depi_updates.close();
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.lock().insert(session.session_id.clone(), session);
    }

    /// Fetch a session, renewing its idle clock.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.lock().get(session_id).cloned()?;
        session.touch();
        Some(session)
    }

    /// Fetch without renewing; used by the sweeper and tests.
    pub fn peek(&self, session_id: &str) -> Option<Arc<Session>> {
        self.lock().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.lock().remove(session_id)
    }

    /// Snapshot of all sessions for fan-out, taken under the lock.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and close every session idle longer than `timeout`.
    pub fn expire_idle(&self, timeout: Duration) -> Vec<Arc<Session>> {
        let expired: Vec<Arc<Session>> = {
            let sessions = self.lock();
            sessions
                .values()
                .filter(|session| session.idle_for() > timeout)
                .cloned()
                .collect()
        };
        let mut removed = Vec::with_capacity(expired.len());
        for session in expired {
            if self.lock().remove(&session.session_id).is_some() {
                session.close();
                tracing::info!(session_id = %session.session_id, user = %session.user.name,
                    "session expired");
                removed.push(session);
            }
        }
        removed
    }
}

pub struct Sweeper {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start the expiry sweeper. It wakes every `interval` (300 s in
    /// production) and expires idle sessions.
    pub fn spawn(registry: Arc<SessionRegistry>, timeout: Duration, interval: Duration) -> Sweeper {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::spawn(move || loop {
            crossbeam::select! {
                recv(stop_rx) -> _ => break,
                default(interval) => {
                    registry.expire_idle(timeout);
                }
            }
        });
        Sweeper {
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::mem::MemStore;
    use crate::store::Store;

    fn test_session(id: &str) -> (tempfile::TempDir, Arc<Session>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.db.state_dir = dir.path().join("state").to_string_lossy().to_string();
        let store = MemStore::open(Arc::new(config)).expect("store");
        let branch = store.get_branch("main").expect("main");
        let user = Arc::new(User {
            name: "mark".to_string(),
            password: "pw".to_string(),
            authorization: None,
        });
        (
            dir,
            Arc::new(Session::new(id.to_string(), user, branch)),
        )
    }

    #[test]
    fn get_touches_last_request() {
        let (_dir, session) = test_session("s1");
        let registry = SessionRegistry::new();
        registry.insert(session.clone());

        std::thread::sleep(Duration::from_millis(15));
        assert!(session.idle_for() >= Duration::from_millis(10));
        registry.get("s1").expect("session");
        assert!(session.idle_for() < Duration::from_millis(10));
    }

    #[test]
    fn expire_idle_closes_queues() {
        let (_dir, session) = test_session("s1");
        let registry = SessionRegistry::new();
        registry.insert(session.clone());

        let removed = registry.expire_idle(Duration::from_secs(3600));
        assert!(removed.is_empty());

        std::thread::sleep(Duration::from_millis(10));
        let removed = registry.expire_idle(Duration::from_millis(1));
        assert_eq!(removed.len(), 1);
        assert!(registry.is_empty());
        assert!(session.depi_updates.is_closed());
        assert!(session.resource_updates.is_closed());
        assert!(session.blackboard_updates.is_closed());
    }

    #[test]
    fn sweeper_expires_in_background() {
        let (_dir, session) = test_session("s1");
        let registry = Arc::new(SessionRegistry::new());
        registry.insert(session.clone());

        let sweeper = Sweeper::spawn(
            registry.clone(),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        // the blocked take returns once the sweeper closes the queues
        let err = session.depi_updates.pop_wait();
        assert!(err.is_err());
        assert!(registry.is_empty());
        sweeper.stop();
    }

    #[test]
    fn watch_flags_and_groups() {
        let (_dir, session) = test_session("s1");
        let key = ResourceGroupKey {
            tool_id: "git".into(),
            url: "repoA".into(),
        };
        assert!(!session.watching_resources());
        session.watch_group(key.clone());
        assert!(session.watching_resources());
        assert!(session.watches_group(&key));
        session.unwatch_group(&key);
        assert!(!session.watches_group(&key));
    }
}
