//! Connection behavior end to end: page ordering, leader resets, page mode,
//! duplicate-node folding, optimistic connection edits, and watch re-keying.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use lagoon::{
    Cache, CacheConfig, ConnectionRef, ReadRequest, TreeNode, WatchQuery, WriteRequest,
};
use plan::{field, variables, ConnectionMode, Document};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn cache() -> Cache {
    Cache::new(CacheConfig::new()).unwrap()
}

fn posts_plan() -> Arc<Document> {
    Document::query([field("posts")
        .arg_var("category", "category")
        .arg_var("first", "first")
        .arg_var("last", "last")
        .arg_var("after", "after")
        .arg_var("before", "before")
        .connection_filters(["category"])
        .select([
            field("__typename"),
            field("edges").select([
                field("cursor"),
                field("node").select([field("__typename"), field("id"), field("title")]),
            ]),
            field("pageInfo").select([
                field("startCursor"),
                field("endCursor"),
                field("hasPreviousPage"),
                field("hasNextPage"),
            ]),
        ])])
}

fn page(edges: &[(&str, &str)], start: &str, end: &str, has_next: bool) -> Value {
    json!({
        "posts": {
            "__typename": "PostConnection",
            "edges": edges.iter().map(|(id, cursor)| json!({
                "cursor": cursor,
                "node": {"__typename": "Post", "id": id, "title": format!("title-{id}")},
            })).collect::<Vec<_>>(),
            "pageInfo": {
                "startCursor": start,
                "endCursor": end,
                "hasPreviousPage": false,
                "hasNextPage": has_next,
            },
        }
    })
}

fn write(cache: &Cache, plan: &Arc<Document>, vars: Value, data: Value) {
    cache
        .normalize(WriteRequest::new(plan.clone(), data).variables(variables(vars)))
        .unwrap();
}

fn read(cache: &Cache, plan: &Arc<Document>, vars: Value) -> TreeNode {
    cache
        .materialize(ReadRequest::new(plan.clone()).variables(variables(vars)))
        .unwrap()
        .data
}

fn edge_ids(data: &TreeNode) -> Vec<String> {
    edge_field(data, "id")
}

fn edge_cursors(data: &TreeNode) -> Vec<String> {
    data.get("posts")
        .unwrap()
        .get("edges")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|edge| match edge.get("cursor").unwrap() {
            TreeNode::String(cursor) => cursor.clone(),
            other => panic!("unexpected cursor {other:?}"),
        })
        .collect()
}

fn edge_field(data: &TreeNode, name: &str) -> Vec<String> {
    data.get("posts")
        .unwrap()
        .get("edges")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|edge| match edge.get("node").unwrap().get(name).unwrap() {
            TreeNode::String(value) => value.clone(),
            other => panic!("unexpected node field {other:?}"),
        })
        .collect()
}

#[test]
fn before_pages_order_ahead_of_the_leader() {
    let cache = cache();
    let plan = posts_plan();

    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("p3", "p3")], "p3", "p3", true),
    );
    write(
        &cache,
        &plan,
        json!({"category": "tech", "last": 2, "before": "p3"}),
        page(&[("p1", "p1"), ("p2", "p2")], "p1", "p2", true),
    );

    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    assert_eq!(edge_ids(&data), vec!["p1", "p2", "p3"]);

    let info = data.get("posts").unwrap().get("pageInfo").unwrap();
    assert_eq!(info.get("startCursor"), Some(&TreeNode::String("p1".into())));
    assert_eq!(info.get("endCursor"), Some(&TreeNode::String("p3".into())));
}

#[test]
fn a_leader_refetch_resets_the_union() {
    let cache = cache();
    let plan = posts_plan();

    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("p1", "p1"), ("p2", "p2")], "p1", "p2", true),
    );
    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2, "after": "p2"}),
        page(&[("p3", "p3"), ("p4", "p4")], "p3", "p4", false),
    );
    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    assert_eq!(edge_ids(&data), vec!["p1", "p2", "p3", "p4"]);

    // Refetching from the start discards the accumulated pages.
    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("p9", "p9")], "p9", "p9", false),
    );
    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    assert_eq!(edge_ids(&data), vec!["p9"]);
}

#[test]
fn prewarm_writes_never_reset_the_union() {
    let cache = cache();
    let plan = posts_plan();

    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("p1", "p1"), ("p2", "p2")], "p1", "p2", true),
    );
    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2, "after": "p2"}),
        page(&[("p3", "p3"), ("p4", "p4")], "p3", "p4", false),
    );

    // Hydrating the leader page again from a cache dump is non-destructive.
    cache
        .normalize(
            WriteRequest::new(
                plan.clone(),
                page(&[("p1", "p1"), ("p2", "p2")], "p1", "p2", true),
            )
            .variables(variables(json!({"category": "tech", "first": 2})))
            .prewarm(),
        )
        .unwrap();

    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    assert_eq!(edge_ids(&data), vec!["p1", "p2", "p3", "p4"]);
}

#[test]
fn duplicate_nodes_fold_into_the_first_edge() {
    let cache = cache();
    let plan = posts_plan();

    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("p1", "a1"), ("p2", "a2")], "a1", "a2", true),
    );
    // The second page re-delivers p2 under a fresh cursor.
    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2, "after": "a2"}),
        page(&[("p2", "b2"), ("p3", "b3")], "b2", "b3", false),
    );

    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    assert_eq!(edge_ids(&data), vec!["p1", "p2", "p3"]);
    // The duplicate's cursor won on the kept edge.
    assert_eq!(edge_cursors(&data), vec!["a1", "b2", "b3"]);
}

#[test]
fn page_mode_tracks_the_latest_page() {
    let cache = cache();
    let plan = Document::query([field("items")
        .arg_var("page", "page")
        .connection_filters(Vec::<String>::new())
        .connection_mode(ConnectionMode::Page)
        .alias("posts")
        .select([
            field("edges").select([
                field("cursor"),
                field("node").select([field("__typename"), field("id"), field("title")]),
            ]),
            field("pageInfo").select([field("startCursor"), field("endCursor")]),
        ])]);

    let page_data = |ids: &[&str]| {
        json!({
            "posts": {
                "edges": ids.iter().map(|id| json!({
                    "cursor": id,
                    "node": {"__typename": "Post", "id": id, "title": id},
                })).collect::<Vec<_>>(),
                "pageInfo": {"startCursor": ids[0], "endCursor": ids[ids.len() - 1]},
            }
        })
    };

    write(&cache, &plan, json!({"page": 1}), page_data(&["a1", "a2"]));
    write(&cache, &plan, json!({"page": 2}), page_data(&["b1", "b2"]));
    let data = read(&cache, &plan, json!({"page": 2}));
    assert_eq!(edge_ids(&data), vec!["b1", "b2"]);

    // Going back re-points the canonical view at the page just written.
    write(&cache, &plan, json!({"page": 1}), page_data(&["a1", "a2"]));
    let data = read(&cache, &plan, json!({"page": 1}));
    assert_eq!(edge_ids(&data), vec!["a1", "a2"]);
}

#[test]
fn optimistic_append_and_remove_revert_together() {
    let cache = cache();
    let plan = posts_plan();

    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("p1", "p1"), ("p2", "p2")], "p1", "p2", true),
    );
    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2, "after": "p2"}),
        page(&[("p3", "p3"), ("p4", "p4")], "p3", "p4", false),
    );

    let txn = cache.begin_optimistic(|b| {
        b.connection(
            ConnectionRef::on("Query", "posts").filters(json!({"category": "tech"})),
        )
        .append_with(
            json!({"__typename": "Post", "id": "p5", "title": "five"}),
            json!({"cursor": "p5"}),
        )
        .remove("Post:p2");
    });

    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    assert_eq!(edge_ids(&data), vec!["p1", "p3", "p4", "p5"]);

    cache.revert_optimistic(txn).unwrap();
    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    assert_eq!(edge_ids(&data), vec!["p1", "p2", "p3", "p4"]);
}

#[test]
fn optimistic_page_info_patch_reverts() {
    let cache = cache();
    let plan = posts_plan();

    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("p1", "p1"), ("p2", "p2")], "p1", "p2", false),
    );

    let txn = cache.begin_optimistic(|b| {
        b.connection(
            ConnectionRef::on("Query", "posts").filters(json!({"category": "tech"})),
        )
        .patch(json!({"pageInfo": {"hasNextPage": true}}));
    });

    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    let info = data.get("posts").unwrap().get("pageInfo").unwrap();
    assert_eq!(info.get("hasNextPage"), Some(&TreeNode::Bool(true)));

    cache.revert_optimistic(txn).unwrap();
    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    let info = data.get("posts").unwrap().get("pageInfo").unwrap();
    assert_eq!(info.get("hasNextPage"), Some(&TreeNode::Bool(false)));
}

#[test]
fn committed_connection_edits_survive_refetches() {
    let cache = cache();
    let plan = posts_plan();

    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("p1", "p1"), ("p2", "p2")], "p1", "p2", true),
    );

    let txn = cache.begin_optimistic(|b| {
        b.connection(
            ConnectionRef::on("Query", "posts").filters(json!({"category": "tech"})),
        )
        .prepend_with(
            json!({"__typename": "Post", "id": "p0", "title": "zero"}),
            json!({"cursor": "p0"}),
        );
    });
    cache.commit_optimistic(txn).unwrap();

    // A network refetch of the leader rebuilds the canonical view; the
    // committed overlay replays on top of it.
    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("p1", "p1"), ("p2", "p2")], "p1", "p2", true),
    );
    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    assert_eq!(edge_ids(&data), vec!["p0", "p1", "p2"]);

    // Reverting the committed layer removes the overlay for good.
    cache.revert_optimistic(txn).unwrap();
    let data = read(&cache, &plan, json!({"category": "tech", "first": 2}));
    assert_eq!(edge_ids(&data), vec!["p1", "p2"]);
}

#[test]
fn update_watch_rekeys_to_new_variables() {
    let cache = Rc::new(cache());
    let plan = posts_plan();

    write(
        &cache,
        &plan,
        json!({"category": "tech", "first": 2}),
        page(&[("t1", "t1"), ("t2", "t2")], "t1", "t2", false),
    );
    write(
        &cache,
        &plan,
        json!({"category": "news", "first": 2}),
        page(&[("n1", "n1")], "n1", "n1", false),
    );

    let seen: Rc<RefCell<Vec<Vec<String>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let handle = cache
        .watch_query(WatchQuery {
            query: plan.clone(),
            variables: variables(json!({"category": "tech", "first": 2})),
            on_data: Box::new(move |result| {
                sink.borrow_mut().push(edge_ids(&result.data));
            }),
        })
        .unwrap();

    cache
        .update_watch(handle, variables(json!({"category": "news", "first": 2})))
        .unwrap();

    assert_eq!(
        &*seen.borrow(),
        &vec![
            vec!["t1".to_string(), "t2".to_string()],
            vec!["n1".to_string()],
        ]
    );

    // After re-keying, only news writes trigger deliveries.
    write(
        &cache,
        &plan,
        json!({"category": "news", "first": 2, "after": "n1"}),
        page(&[("n2", "n2")], "n2", "n2", false),
    );
    assert_eq!(seen.borrow().len(), 3);
    assert_eq!(
        seen.borrow()[2],
        vec!["n1".to_string(), "n2".to_string()]
    );

    cache.unwatch(handle);
}
