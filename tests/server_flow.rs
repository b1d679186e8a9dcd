//! End-to-end handler scenarios against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use depi::api::{DepiUpdate, ResourceGroupChangeInfo, ResourceGroupEdit, ResourceInfo, Update};
use depi::config::{Config, UserConfig};
use depi::core::{ChangeType, LinkKey, ResourceChange, ResourceRef};
use depi::server::token::TokenCodec;
use depi::server::Server;
use depi::store::mem::MemStore;
use depi::store::Store;

const TEST_KEY: [u8; 32] = [7u8; 32];

struct Rig {
    _dir: tempfile::TempDir,
    server: Server,
    store: Arc<MemStore>,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.db.state_dir = dir.path().join("state").to_string_lossy().to_string();
    config.users = vec![
        UserConfig {
            name: "mark".to_string(),
            password: "pw".to_string(),
            auth_rules: Vec::new(),
        },
        UserConfig {
            name: "pat".to_string(),
            password: "pw2".to_string(),
            auth_rules: Vec::new(),
        },
    ];
    let config = Arc::new(config);
    let store = Arc::new(MemStore::open(config.clone()).expect("store"));
    let server = Server::with_token_codec(config, store.clone(), TokenCodec::new(TEST_KEY))
        .expect("server");
    Rig {
        _dir: dir,
        server,
        store,
    }
}

fn login(rig: &Rig, user: &str, password: &str) -> String {
    let response = rig.server.login(user, password);
    assert!(response.ok, "login failed: {}", response.msg);
    response.session_id
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

fn group_change(tool: &str, url: &str, version: &str, changes: Vec<ResourceChange>) -> ResourceGroupChangeInfo {
    ResourceGroupChangeInfo {
        tool_id: tool.to_string(),
        url: url.to_string(),
        name: url.to_string(),
        version: version.to_string(),
        resources: changes,
    }
}

fn staged_resource(tool: &str, rg_url: &str, version: &str, url: &str) -> ResourceInfo {
    ResourceInfo {
        tool_id: tool.to_string(),
        resource_group_url: rg_url.to_string(),
        resource_group_name: rg_url.to_string(),
        resource_group_version: version.to_string(),
        name: url.trim_start_matches('/').to_string(),
        url: url.to_string(),
        id: url.to_string(),
        deleted: false,
    }
}

#[test]
fn login_rejects_bad_credentials() {
    let rig = rig();
    assert!(!rig.server.login("mark", "wrong").ok);
    assert!(!rig.server.login("nobody", "pw").ok);
    assert!(rig.server.login("mark", "pw").ok);
}

#[test]
fn token_login_roundtrip_and_expiry() {
    let rig = rig();
    let first = rig.server.login("mark", "pw");
    assert!(first.ok);

    let relogin = rig.server.login_with_token(&first.login_token);
    assert!(relogin.ok, "token login failed: {}", relogin.msg);
    assert_eq!(relogin.user, "mark");
    // the existing session is reused
    assert_eq!(relogin.session_id, first.session_id);

    assert!(!rig.server.login_with_token("garbage-token").ok);

    // a token issued far in the past is refused
    let codec = TokenCodec::new(TEST_KEY);
    let stale = codec.generate(&first.session_id, "mark", 0);
    let response = rig.server.login_with_token(&stale);
    assert!(!response.ok);
    assert_eq!(response.msg, "Token expired");
}

#[test]
fn ping_returns_fresh_token() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");
    let response = rig.server.ping(&session_id);
    assert!(response.ok);
    assert!(!response.login_token.is_empty());
    assert!(!rig.server.ping("no-such-session").ok);
}

#[test]
fn logout_invalidates_session() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");
    assert!(rig.server.logout(&session_id).ok);
    let again = rig.server.logout(&session_id);
    assert!(!again.ok);
    assert!(again.msg.contains("invalid session"));
}

#[test]
fn dirty_cascade_marks_downstream_link() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");

    let response = rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v1", vec![change("/a.c", ChangeType::Added)]),
    );
    assert!(response.ok, "{}", response.msg);
    let response = rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("mdl", "modelM", "v1", vec![change("/m1", ChangeType::Added)]),
    );
    assert!(response.ok, "{}", response.msg);

    let response = rig.server.link_resources(
        &session_id,
        &LinkKey {
            from: ResourceRef::new("git", "repoA", "/a.c"),
            to: ResourceRef::new("mdl", "modelM", "/m1"),
        },
    );
    assert!(response.ok, "{}", response.msg);

    let response = rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v2", vec![change("/a.c", ChangeType::Modified)]),
    );
    assert!(response.ok, "{}", response.msg);

    let upstream = rig.server.get_dirty_links(&session_id, "git", "repoA", false);
    assert!(upstream.ok);
    assert!(upstream.links.is_empty());

    let downstream = rig.server.get_dirty_links(&session_id, "mdl", "modelM", false);
    assert!(downstream.ok);
    assert_eq!(downstream.links.len(), 1);
    assert!(downstream.links[0].dirty);
    assert_eq!(downstream.links[0].last_clean_version, "v1");
    assert_eq!(downstream.resources.len(), 1);
    assert_eq!(downstream.resources[0].url, "/m1");
}

#[test]
fn depi_watchers_receive_dirty_mark_updates() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");
    let watcher_id = login(&rig, "pat", "pw2");

    // watch without running the subscriber loop; inspect the queue directly
    let watcher = rig.server.sessions().peek(&watcher_id).expect("session");
    watcher.set_watching_depi(true);

    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v1", vec![change("/a.c", ChangeType::Added)]),
    );
    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("mdl", "modelM", "v1", vec![change("/m1", ChangeType::Added)]),
    );
    rig.server.link_resources(
        &session_id,
        &LinkKey {
            from: ResourceRef::new("git", "repoA", "/a.c"),
            to: ResourceRef::new("mdl", "modelM", "/m1"),
        },
    );
    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v2", vec![change("/a.c", ChangeType::Modified)]),
    );

    let mut saw_dirty_mark = false;
    let mut saw_add_link = false;
    while let Ok(Some(update)) = watcher.depi_updates.try_pop() {
        for item in update.updates {
            match item {
                Update::MarkLinkDirty(_) => saw_dirty_mark = true,
                Update::AddLink(_) => saw_add_link = true,
                _ => {}
            }
        }
    }
    assert!(saw_add_link);
    assert!(saw_dirty_mark);
}

#[test]
fn resource_watchers_get_per_group_updates() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");
    let watcher_id = login(&rig, "pat", "pw2");

    assert!(rig
        .server
        .watch_resource_group(&watcher_id, "mdl", "modelM")
        .ok);
    let watcher = rig.server.sessions().peek(&watcher_id).expect("session");

    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v1", vec![change("/a.c", ChangeType::Added)]),
    );
    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("mdl", "modelM", "v1", vec![change("/m1", ChangeType::Added)]),
    );
    rig.server.link_resources(
        &session_id,
        &LinkKey {
            from: ResourceRef::new("git", "repoA", "/a.c"),
            to: ResourceRef::new("mdl", "modelM", "/m1"),
        },
    );
    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v2", vec![change("/a.c", ChangeType::Modified)]),
    );

    let update = watcher
        .resource_updates
        .try_pop()
        .expect("queue open")
        .expect("one update");
    assert_eq!(update.watched_resource, ResourceRef::new("mdl", "modelM", "/m1"));
    assert_eq!(update.updated_resource, ResourceRef::new("git", "repoA", "/a.c"));

    // unwatching stops further deliveries
    rig.server.unwatch_resource_group(&watcher_id, "mdl", "modelM");
    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v3", vec![change("/a.c", ChangeType::Modified)]),
    );
    assert!(watcher.resource_updates.try_pop().expect("queue open").is_none());
}

#[test]
fn blackboard_stage_save_and_clear() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");

    let response = rig.server.add_resources_to_blackboard(
        &session_id,
        vec![
            staged_resource("git", "repoA", "", "/a.c"),
            staged_resource("mdl", "modelM", "", "/m1"),
        ],
    );
    assert!(response.ok, "{}", response.msg);

    let response = rig.server.link_blackboard_resources(
        &session_id,
        vec![LinkKey {
            from: ResourceRef::new("git", "repoA", "/a.c"),
            to: ResourceRef::new("mdl", "modelM", "/m1"),
        }],
    );
    assert!(response.ok, "{}", response.msg);

    let staged = rig.server.get_blackboard_resources(&session_id);
    assert!(staged.ok);
    assert_eq!(staged.resources.len(), 2);
    assert_eq!(staged.links.len(), 1);

    let response = rig.server.save_blackboard(&session_id);
    assert!(response.ok, "{}", response.msg);

    // the board is cleared and the graph now carries the link
    let staged = rig.server.get_blackboard_resources(&session_id);
    assert!(staged.resources.is_empty());
    assert!(staged.links.is_empty());

    let links = rig.server.get_all_links(&session_id, false);
    assert!(links.ok);
    assert_eq!(links.resource_links.len(), 1);
    assert_eq!(links.resource_links[0].from_res.url, "/a.c");
    assert!(!links.resource_links[0].dirty);
}

#[test]
fn blackboard_save_conflicts_when_server_version_moved() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");

    // the group exists at v1 on main
    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v1", vec![change("/a.c", ChangeType::Added)]),
    );

    // the client stages against v1
    let response = rig.server.add_resources_to_blackboard(
        &session_id,
        vec![staged_resource("git", "repoA", "v1", "/b.c")],
    );
    assert!(response.ok);

    // meanwhile the server-side version advances without touching boards
    let response = rig.server.edit_resource_group(
        &session_id,
        &ResourceGroupEdit {
            tool_id: "git".to_string(),
            url: "repoA".to_string(),
            new_tool_id: "git".to_string(),
            new_url: "repoA".to_string(),
            new_name: "repoA".to_string(),
            new_version: "v2".to_string(),
        },
    );
    assert!(response.ok, "{}", response.msg);

    let response = rig.server.save_blackboard(&session_id);
    assert!(!response.ok);
    assert!(response.msg.contains("conflict"), "{}", response.msg);

    // the blackboard is preserved for the user
    let staged = rig.server.get_blackboard_resources(&session_id);
    assert_eq!(staged.resources.len(), 1);
}

#[test]
fn blackboard_reconciles_when_main_moves() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");

    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v1", vec![change("/a.c", ChangeType::Added)]),
    );
    rig.server.add_resources_to_blackboard(
        &session_id,
        vec![staged_resource("git", "repoA", "v1", "/a.c")],
    );

    let session = rig.server.sessions().peek(&session_id).expect("session");
    session.set_watching_blackboard(true);

    // a removal lands on main for the staged resource
    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v2", vec![change("/a.c", ChangeType::Removed)]),
    );

    let update = session
        .blackboard_updates
        .try_pop()
        .expect("queue open")
        .expect("reconciliation update");
    assert!(update
        .updates
        .iter()
        .any(|u| matches!(u, Update::ResourceGroupVersionChanged(_))));
    assert!(update
        .updates
        .iter()
        .any(|u| matches!(u, Update::RemoveResource(_))));

    // the staged resource is gone from the board
    let staged = rig.server.get_blackboard_resources(&session_id);
    assert!(staged.resources.is_empty());
}

#[test]
fn tag_is_immutable_through_a_session() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");

    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v1", vec![change("/a.c", ChangeType::Added)]),
    );
    let response = rig.server.create_tag(&session_id, "t1", Some("main"));
    assert!(response.ok, "{}", response.msg);

    // point the session at the tag and try to mutate through it
    let tag = rig.store.get_tag("t1").expect("tag");
    let session = rig.server.sessions().peek(&session_id).expect("session");
    session.set_branch(tag);

    let response = rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v2", vec![change("/a.c", ChangeType::Modified)]),
    );
    assert!(!response.ok);
    assert!(response.msg.contains("tag"), "{}", response.msg);

    // reads through the tag still work
    let groups = rig.server.get_resource_groups(&session_id);
    assert!(groups.ok);
    assert_eq!(groups.resource_groups.len(), 1);
}

#[test]
fn branch_lifecycle_and_switching() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");

    let response = rig.server.create_branch(&session_id, "feature", None, None);
    assert!(response.ok, "{}", response.msg);
    let duplicate = rig.server.create_branch(&session_id, "feature", None, None);
    assert!(!duplicate.ok);

    let list = rig.server.get_branch_list(&session_id);
    assert!(list.ok);
    assert!(list.branches.contains(&"main".to_string()));
    assert!(list.branches.contains(&"feature".to_string()));

    assert!(rig.server.set_branch(&session_id, "feature").ok);
    let current = rig.server.current_branch(&session_id);
    assert_eq!(current.branch, "feature");

    // mutations on the feature branch stay off main
    rig.server.update_resource_group(
        &session_id,
        "",
        &group_change("git", "repoA", "v1", vec![change("/a.c", ChangeType::Added)]),
    );
    assert!(rig.server.set_branch(&session_id, "main").ok);
    let groups = rig.server.get_resource_groups(&session_id);
    assert!(groups.resource_groups.is_empty());

    assert!(!rig.server.set_branch(&session_id, "nope").ok);
}

#[test]
fn session_expiry_terminates_watch_streams() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");

    let server = &rig.server;
    let registry = server.sessions().clone();
    let watcher_session = session_id.clone();

    std::thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let mut received: Vec<DepiUpdate> = Vec::new();
            server.watch_depi(&watcher_session, &mut |update| {
                received.push(update);
                true
            });
            received
        });

        // wait until the subscriber loop has registered itself
        let session = registry.peek(&session_id).expect("session");
        while !session.watching_depi() {
            std::thread::sleep(Duration::from_millis(5));
        }

        std::thread::sleep(Duration::from_millis(10));
        let removed = registry.expire_idle(Duration::from_millis(1));
        assert_eq!(removed.len(), 1);

        // the stream terminates cleanly with nothing delivered
        let received = handle.join().expect("watcher thread");
        assert!(received.is_empty());
    });
}

#[test]
fn unwatch_depi_pushes_sentinel_that_ends_stream() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");

    let registry = rig.server.sessions().clone();
    std::thread::scope(|scope| {
        let server = &rig.server;
        let watcher_session = session_id.clone();
        let handle = scope.spawn(move || {
            let mut count = 0usize;
            server.watch_depi(&watcher_session, &mut |_| {
                count += 1;
                true
            });
            count
        });

        let session = registry.peek(&session_id).expect("session");
        while !session.watching_depi() {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(rig.server.unwatch_depi(&session_id).ok);
        let forwarded = handle.join().expect("watcher thread");
        // the sentinel itself is not forwarded
        assert_eq!(forwarded, 0);
    });
}

#[test]
fn dependency_graph_walks_upstream() {
    let rig = rig();
    let session_id = login(&rig, "mark", "pw");

    for (group, url) in [("A", "/a"), ("B", "/b"), ("C", "/c")] {
        rig.server.update_resource_group(
            &session_id,
            "",
            &group_change("t", group, "v1", vec![change(url, ChangeType::Added)]),
        );
    }
    rig.server.link_resources(
        &session_id,
        &LinkKey {
            from: ResourceRef::new("t", "A", "/a"),
            to: ResourceRef::new("t", "B", "/b"),
        },
    );
    rig.server.link_resources(
        &session_id,
        &LinkKey {
            from: ResourceRef::new("t", "B", "/b"),
            to: ResourceRef::new("t", "C", "/c"),
        },
    );

    let response = rig.server.get_dependency_graph(
        &session_id,
        &ResourceRef::new("t", "C", "/c"),
        depi::api::DependenciesKind::Dependencies,
        0,
    );
    assert!(response.ok, "{}", response.msg);
    assert_eq!(response.links.len(), 2);
    assert_eq!(response.resource.expect("root").url, "/c");

    let missing = rig.server.get_dependency_graph(
        &session_id,
        &ResourceRef::new("t", "C", "/nope"),
        depi::api::DependenciesKind::Dependencies,
        0,
    );
    assert!(!missing.ok);
}
