//! Store-level scenarios exercised against the in-memory backend.

use std::sync::Arc;

use depi::config::Config;
use depi::store::mem::MemStore;
use depi::store::Store;
use depi::{
    ChangeType, Link, LinkWithResources, Resource, ResourceChange, ResourceGroup,
    ResourceGroupChange, ResourceGroupKey, ResourceRef,
};

fn open_store(dir: &tempfile::TempDir) -> MemStore {
    let mut config = Config::default();
    config.db.state_dir = dir.path().join("state").to_string_lossy().to_string();
    MemStore::open(Arc::new(config)).expect("open store")
}

fn resource(url: &str) -> Resource {
    Resource {
        name: url.trim_start_matches('/').to_string(),
        id: url.to_string(),
        url: url.to_string(),
        deleted: false,
    }
}

fn link(from: (&str, &str, &str), to: (&str, &str, &str)) -> LinkWithResources {
    LinkWithResources {
        from_group: ResourceGroup::new(from.0, from.1, from.1, "v1"),
        from_res: resource(from.2),
        to_group: ResourceGroup::new(to.0, to.1, to.1, "v1"),
        to_res: resource(to.2),
        dirty: false,
        deleted: false,
        last_clean_version: String::new(),
        inferred_dirtiness: Vec::new(),
    }
}

fn modified(url: &str) -> ResourceChange {
    ResourceChange {
        name: url.trim_start_matches('/').to_string(),
        id: url.to_string(),
        url: url.to_string(),
        new_name: String::new(),
        new_id: String::new(),
        new_url: String::new(),
        change_type: ChangeType::Modified,
    }
}

fn change_set(tool: &str, url: &str, version: &str, changes: Vec<ResourceChange>) -> ResourceGroupChange {
    ResourceGroupChange {
        name: url.to_string(),
        tool_id: tool.to_string(),
        url: url.to_string(),
        version: version.to_string(),
        resources: changes.into_iter().map(|c| (c.url.clone(), c)).collect(),
    }
}

fn group_key(tool: &str, url: &str) -> ResourceGroupKey {
    ResourceGroupKey {
        tool_id: tool.to_string(),
        url: url.to_string(),
    }
}

#[test]
fn branch_created_before_mutation_does_not_see_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);

    store.create_branch("b1", "main").expect("create b1");

    let main = store.get_branch("main").expect("main");
    main.ops()
        .unwrap()
        .add_link(&link(("t", "A", "/a"), ("t", "B", "/b")))
        .unwrap();

    store.create_branch("b2", "main").expect("create b2");

    // b1 predates the link, b2 postdates it
    let b1 = store.get_branch("b1").unwrap();
    assert!(b1.ops().unwrap().get_all_links(false).unwrap().is_empty());
    let b2 = store.get_branch("b2").unwrap();
    assert_eq!(b2.ops().unwrap().get_all_links(false).unwrap().len(), 1);
}

#[test]
fn all_links_without_deleted_returns_only_live_links() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let main = store.get_branch("main").unwrap();
    let mut ops = main.ops().unwrap();

    ops.add_link(&link(("t", "A", "/a"), ("t", "B", "/b"))).unwrap();
    ops.add_link(&link(("t", "A", "/a2"), ("t", "B", "/b"))).unwrap();

    // dirty /a2's link so removal tombstones it
    ops.update_resource_group(&change_set("t", "A", "v2", vec![modified("/a2")]))
        .unwrap();
    ops.remove_link(&Link::new(
        ResourceRef::new("t", "A", "/a2"),
        ResourceRef::new("t", "B", "/b"),
    ))
    .unwrap();

    let live = ops.get_all_links(false).unwrap();
    assert_eq!(live.len(), 1);
    assert!(live.iter().all(|l| !l.deleted));
    assert_eq!(ops.get_all_links(true).unwrap().len(), 2);
}

#[test]
fn remove_resource_ref_tombstones_and_clears_inferred() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let main = store.get_branch("main").unwrap();
    let mut ops = main.ops().unwrap();

    ops.add_link(&link(("t", "A", "/a"), ("t", "B", "/b"))).unwrap();
    ops.add_link(&link(("t", "B", "/b"), ("t", "C", "/c"))).unwrap();
    ops.update_resource_group(&change_set("t", "A", "v2", vec![modified("/a")]))
        .unwrap();

    // downstream link carries inferred dirtiness for /a before removal
    let downstream = ops.get_dirty_links(&group_key("t", "C"), true).unwrap();
    assert_eq!(downstream.len(), 1);

    let removed = ops
        .remove_resource_ref(&ResourceRef::new("t", "A", "/a"))
        .unwrap();
    assert!(removed);
    assert!(ops.is_resource_deleted(&ResourceRef::new("t", "A", "/a")).unwrap());

    let downstream = ops.get_dirty_links(&group_key("t", "C"), true).unwrap();
    assert!(downstream.is_empty());

    // repeated removal reports nothing removed
    assert!(!ops
        .remove_resource_ref(&ResourceRef::new("t", "A", "/a"))
        .unwrap());
}

#[test]
fn mark_resources_clean_clears_incoming_links() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let main = store.get_branch("main").unwrap();
    let mut ops = main.ops().unwrap();

    ops.add_link(&link(("t", "A", "/a"), ("t", "B", "/b"))).unwrap();
    ops.add_link(&link(("t", "B", "/b"), ("t", "C", "/c"))).unwrap();
    ops.update_resource_group(&change_set("t", "A", "v2", vec![modified("/a")]))
        .unwrap();
    assert_eq!(ops.get_dirty_links(&group_key("t", "B"), false).unwrap().len(), 1);

    ops.mark_resources_clean(&[ResourceRef::new("t", "B", "/b")], true)
        .unwrap();

    assert!(ops.get_dirty_links(&group_key("t", "B"), true).unwrap().is_empty());
    // propagation removed the inferred entry downstream as well
    assert!(ops.get_dirty_links(&group_key("t", "C"), true).unwrap().is_empty());
}

#[test]
fn expand_links_resolves_endpoint_resources() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let main = store.get_branch("main").unwrap();
    let mut ops = main.ops().unwrap();

    ops.add_link(&link(("git", "repoA", "/a.c"), ("mdl", "modelM", "/m1")))
        .unwrap();
    let bare = Link::new(
        ResourceRef::new("git", "repoA", "/a.c"),
        ResourceRef::new("mdl", "modelM", "/m1"),
    );
    let expanded = ops.expand_links(std::slice::from_ref(&bare)).unwrap();
    assert_eq!(expanded.len(), 1);
    assert_eq!(expanded[0].from_res.name, "a.c");
    assert_eq!(expanded[0].to_group.tool_id, "mdl");
}

#[test]
fn resource_patterns_scope_to_exact_group() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let main = store.get_branch("main").unwrap();
    let mut ops = main.ops().unwrap();

    ops.add_link(&link(("git", "repoA", "/src/a.c"), ("mdl", "modelM", "/m1")))
        .unwrap();
    ops.add_link(&link(("git", "repoB", "/src/b.c"), ("mdl", "modelM", "/m1")))
        .unwrap();

    let found = ops
        .get_resources(
            &[depi::ResourceRefPattern {
                tool_id: "git".to_string(),
                resource_group_url: "repoA".to_string(),
                url_pattern: r"\.c$".to_string(),
            }],
            false,
        )
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].resource.url, "/src/a.c");
    assert_eq!(found[0].resource_group.url, "repoA");
}

#[test]
fn streamed_and_collected_queries_agree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let main = store.get_branch("main").unwrap();
    let mut ops = main.ops().unwrap();

    ops.add_link(&link(("t", "A", "/a"), ("t", "B", "/b"))).unwrap();
    ops.add_link(&link(("t", "A", "/a2"), ("t", "B", "/b"))).unwrap();

    let collected = ops.get_all_links(false).unwrap();
    let mut streamed = Vec::new();
    ops.get_all_links_stream(false, &mut |link| streamed.push(link))
        .unwrap();
    assert_eq!(collected.len(), streamed.len());
}
