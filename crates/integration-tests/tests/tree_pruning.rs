mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{comment, find_uri, TestApp};
use serde_json::Value;

fn ids(nodes: &Value) -> Vec<String> {
    nodes
        .as_array()
        .map(|a| a.iter().filter_map(|n| n["comment"]["id"].as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn deleted_subtrees_are_pruned() {
    let app = TestApp::new();
    let start = Utc::now() - Duration::hours(1);
    let layout = [
        ("1", "", false),
        ("11", "1", false),
        ("111", "11", false),
        ("112", "11", true),
        ("1121", "112", true),
        ("2", "", false),
        ("21", "2", true),
        ("211", "21", true),
        ("22", "2", false),
        ("221", "22", false),
        ("3", "", true),
    ];
    for (i, (id, parent, deleted)) in layout.into_iter().enumerate() {
        let mut c = comment(id, "alice", start + Duration::seconds(i as i64));
        c.parent_id = parent.to_string();
        c.deleted = deleted;
        app.seed(c).await;
    }

    let (status, tree) = app.send(Method::GET, &find_uri(), None, false).await;
    assert_eq!(status, StatusCode::OK, "{tree}");

    let roots = &tree["comments"];
    assert_eq!(ids(roots), vec!["1", "2"]);
    assert_eq!(ids(&roots[0]["replies"]), vec!["11"]);
    assert_eq!(ids(&roots[0]["replies"][0]["replies"]), vec!["111"]);
    assert_eq!(ids(&roots[1]["replies"]), vec!["22"]);
    assert_eq!(ids(&roots[1]["replies"][0]["replies"]), vec!["221"]);
    assert_eq!(tree["info"]["count"], 6);
}

#[tokio::test]
async fn plain_format_lists_soft_deleted_flat() {
    let app = TestApp::new();
    let now = Utc::now();
    let mut gone = comment("x", "alice", now - Duration::minutes(2));
    gone.deleted = true;
    app.seed(gone).await;
    let mut reply = comment("y", "bob", now - Duration::minutes(1));
    reply.parent_id = "x".to_string();
    app.seed(reply).await;

    let (_, tree) = app.send(Method::GET, &find_uri(), None, false).await;
    assert_eq!(ids(&tree["comments"]), vec!["x"]);
    assert_eq!(ids(&tree["comments"][0]["replies"]), vec!["y"]);

    let (status, plain) = app.send(Method::GET, &format!("{}&format=plain", find_uri()), None, false).await;
    assert_eq!(status, StatusCode::OK);
    let flat: Vec<&str> = plain["comments"].as_array().unwrap().iter().filter_map(|c| c["id"].as_str()).collect();
    assert_eq!(flat, vec!["x", "y"]);
    assert_eq!(plain["comments"][0]["delete"], true);
}
