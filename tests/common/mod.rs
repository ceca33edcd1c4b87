//! Mock forum shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;

use discourse_thread_archiver::config::Config;
use discourse_thread_archiver::events::{ArchiveEvent, EventReporter};
use discourse_thread_archiver::Archiver;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// A post as the forum returns it.
pub fn post(id: u64, username: &str, cooked: &str) -> Value {
    json!({
        "id": id,
        "post_number": id,
        "user_id": id * 100,
        "username": username,
        "name": null,
        "avatar_template": null,
        "created_at": "2024-03-01T12:00:00Z",
        "cooked": cooked,
        "actions_summary": [{"id": 2, "count": 1}],
    })
}

/// Plain posts `1..=count`, no embedded resources.
pub fn plain_posts(count: u64) -> Vec<Value> {
    (1..=count)
        .map(|id| post(id, "poster", &format!("<p>Post number {id}</p>")))
        .collect()
}

/// Serve `/t/{thread_id}.json`.
pub async fn mount_topic(server: &MockServer, thread_id: u64, title: &str, posts: &[Value]) {
    let stream: Vec<u64> = posts.iter().filter_map(|p| p["id"].as_u64()).collect();
    let first: Vec<Value> = posts.iter().take(1).cloned().collect();
    Mock::given(method("GET"))
        .and(path(format!("/t/{thread_id}.json")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "title": title,
            "fancy_title": title,
            "category_id": null,
            "tags": [],
            "post_stream": { "posts": first, "stream": stream },
        })))
        .mount(server)
        .await;
}

/// Serve `/t/{thread_id}/posts.json`, answering with whichever of `posts`
/// the request names in `post_ids[]`.
pub async fn mount_posts(server: &MockServer, thread_id: u64, posts: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(format!("/t/{thread_id}/posts.json")))
        .respond_with(move |request: &Request| {
            let wanted = requested_ids(request);
            let selected: Vec<Value> = posts
                .iter()
                .filter(|p| p["id"].as_u64().is_some_and(|id| wanted.contains(&id)))
                .cloned()
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({ "post_stream": { "posts": selected } }))
        })
        .mount(server)
        .await;
}

pub fn requested_ids(request: &Request) -> HashSet<u64> {
    request
        .url
        .query_pairs()
        .filter(|(key, _)| key == "post_ids[]")
        .filter_map(|(_, value)| value.parse().ok())
        .collect()
}

pub fn archiver_for(server: &MockServer, chunk_size: usize) -> (Archiver, UnboundedReceiver<ArchiveEvent>) {
    let config = Config {
        chunk_size,
        ..Config::for_testing(&server.uri())
    };
    let (reporter, events) = EventReporter::channel();
    let archiver = Archiver::new(config, reporter).expect("valid test config");
    (archiver, events)
}

pub fn drain(events: &mut UnboundedReceiver<ArchiveEvent>) -> Vec<ArchiveEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub fn read_json(path: &std::path::Path) -> Value {
    let bytes = std::fs::read(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
    serde_json::from_slice(&bytes).expect("valid json")
}
