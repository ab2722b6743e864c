//! Cross-run scenarios: cache writeback, rerun fast-path, and deferred
//! exit with resumption.

use batchling::{
    batchify, fingerprint, BatcherConfig, BatchingClient, BatchlingError, HttpClient,
    HttpRequest, HttpResponse, MockHttpClient, QueueKey, RequestCacheStore,
};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

static SCOPE_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn chat_request(prompt: &str) -> HttpRequest {
    HttpRequest::new("POST", "https://api.openai.com/v1/chat/completions")
        .with_json(&json!({
            "model": "m1",
            "messages": [{"role": "user", "content": prompt}],
        }))
        .unwrap()
        .with_header("authorization", "Bearer sk-test")
        .unwrap()
}

fn cached_config(cache_path: &Path) -> BatcherConfig {
    BatcherConfig {
        batch_window: Duration::from_millis(50),
        poll_interval: Duration::from_millis(30),
        cache: true,
        cache_path: Some(cache_path.to_path_buf()),
        close_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

fn uploaded_custom_ids(mock: &MockHttpClient) -> Vec<(String, String)> {
    let mut parsed = Vec::new();
    for call in mock.calls_for("POST /v1/files") {
        let text = String::from_utf8_lossy(call.body.as_ref().unwrap()).into_owned();
        for line in text.lines() {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                continue;
            };
            if let Some(custom_id) = value.get("custom_id").and_then(|v| v.as_str()) {
                let prompt = value["body"]["messages"][0]["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                parsed.push((custom_id.to_string(), prompt));
            }
        }
    }
    parsed
}

fn result_lines(ids: &[(String, String)]) -> Vec<String> {
    ids.iter()
        .map(|(custom_id, prompt)| {
            json!({
                "custom_id": custom_id,
                "response": {"status_code": 200, "body": {"prompt": prompt}},
            })
            .to_string()
        })
        .collect()
}

fn jsonl_response(lines: &[String]) -> HttpResponse {
    HttpResponse::new(200, HeaderMap::new(), Bytes::from(lines.join("\n")))
}

/// Run the full submit-poll-resolve flow once, returning the submitted
/// `(custom_id, prompt)` pairs.
async fn run_initial_batch(cache_path: &Path, prompts: &[&str]) -> Vec<(String, String)> {
    let mock = Arc::new(MockHttpClient::new());
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-in"}));
    mock.add_json_response("POST /v1/batches", 200, json!({"id": "batch_1"}));

    let expected = prompts.len();
    let wiring = {
        let mock = mock.clone();
        tokio::spawn(async move {
            loop {
                let ids = uploaded_custom_ids(&mock);
                if ids.len() >= expected {
                    mock.add_json_response(
                        "GET /v1/batches/batch_1",
                        200,
                        json!({"status": "completed", "output_file_id": "file-out"}),
                    );
                    mock.add_response(
                        "GET /v1/files/file-out/content",
                        Ok(jsonl_response(&result_lines(&ids))),
                    );
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let client = BatchingClient::new(mock.clone());
    let prompts: Vec<String> = prompts.iter().map(|p| p.to_string()).collect();
    batchify(cached_config(cache_path))
        .with_transport(mock.clone())
        .run(async {
            let requests: Vec<HttpRequest> = prompts.iter().map(|p| chat_request(p)).collect();
            let handles = requests.iter().map(|request| client.execute(request));
            for result in futures::future::join_all(handles).await {
                assert_eq!(result.unwrap().status, 200);
            }
        })
        .await
        .unwrap();
    wiring.await.unwrap();

    uploaded_custom_ids(&mock)
}

#[test_log::test(tokio::test)]
async fn test_rerun_resolves_from_cache_without_submission() {
    let _serial = SCOPE_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.sqlite3");

    let submitted = run_initial_batch(&cache_path, &["a", "b"]).await;
    assert_eq!(submitted.len(), 2);

    // New process, same cache: both requests re-attach to batch_1's poll.
    let mock = Arc::new(MockHttpClient::new());
    let lines = result_lines(&submitted);
    for _ in 0..3 {
        mock.add_json_response(
            "GET /v1/batches/batch_1",
            200,
            json!({"status": "completed", "output_file_id": "file-out"}),
        );
        mock.add_response("GET /v1/files/file-out/content", Ok(jsonl_response(&lines)));
    }

    let client = BatchingClient::new(mock.clone());
    batchify(cached_config(&cache_path))
        .with_transport(mock.clone())
        .run(async {
            let __req0 = chat_request("a");
            let __req1 = chat_request("b");
            let (first, second) = tokio::join!(
                client.execute(&__req0),
                client.execute(&__req1),
            );
            assert_eq!(first.unwrap().json_body().unwrap()["prompt"], "a");
            assert_eq!(second.unwrap().json_body().unwrap()["prompt"], "b");
        })
        .await
        .unwrap();

    // Zero new submissions: the prior batch was resumed from cache.
    assert_eq!(mock.calls_for("POST /v1/files").len(), 0);
    assert_eq!(mock.calls_for("POST /v1/batches").len(), 0);
}

#[test_log::test(tokio::test)]
async fn test_identical_requests_in_one_run_share_a_cache_row() {
    let _serial = SCOPE_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.sqlite3");

    let submitted = run_initial_batch(&cache_path, &["same", "same"]).await;
    assert_eq!(submitted.len(), 2);

    let queue_key = QueueKey {
        provider: "openai".to_string(),
        endpoint: "/v1/chat/completions".to_string(),
        model: "m1".to_string(),
    };
    let body = json!({
        "model": "m1",
        "messages": [{"role": "user", "content": "same"}],
    })
    .to_string();
    let hash = fingerprint::request_fingerprint(
        &queue_key,
        "api.openai.com",
        Some(body.as_bytes()),
    )
    .unwrap();

    let store = RequestCacheStore::open(Some(&cache_path)).await.unwrap();
    let row = store.get_by_hash(&hash).await.unwrap().expect("row written");
    assert_eq!(row.batch_id, "batch_1");
    // The upsert keeps exactly one row for the fingerprint; its custom id
    // is one of the two submitted.
    assert!(submitted.iter().any(|(id, _)| *id == row.custom_id));
}

#[test_log::test(tokio::test)]
async fn test_stale_row_for_other_provider_is_ignored() {
    let _serial = SCOPE_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.sqlite3");

    let queue_key = QueueKey {
        provider: "openai".to_string(),
        endpoint: "/v1/chat/completions".to_string(),
        model: "m1".to_string(),
    };
    let body = json!({
        "model": "m1",
        "messages": [{"role": "user", "content": "a"}],
    })
    .to_string();
    let hash = fingerprint::request_fingerprint(
        &queue_key,
        "api.openai.com",
        Some(body.as_bytes()),
    )
    .unwrap();

    // Seed a row that claims another provider owns this fingerprint.
    let store = RequestCacheStore::open(Some(&cache_path)).await.unwrap();
    store
        .upsert_many(&[batchling::CacheEntry {
            request_hash: hash,
            provider: "mistral".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            model: "m1".to_string(),
            host: "api.mistral.ai".to_string(),
            batch_id: "job-unrelated".to_string(),
            custom_id: "cid-unrelated".to_string(),
            created_at: chrono::Utc::now(),
        }])
        .await
        .unwrap();
    drop(store);

    // The row must not be honored: a fresh submission happens instead.
    let submitted = run_initial_batch(&cache_path, &["a"]).await;
    assert_eq!(submitted.len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_deferred_exit_then_resume_from_cache() {
    let _serial = SCOPE_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.sqlite3");

    // Run 1: the batch never finishes; deferred mode exits once only
    // polling activity remains.
    let mock = Arc::new(MockHttpClient::new());
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-in"}));
    mock.add_json_response("POST /v1/batches", 200, json!({"id": "batch_1"}));
    for _ in 0..64 {
        mock.add_json_response(
            "GET /v1/batches/batch_1",
            200,
            json!({"status": "in_progress"}),
        );
    }

    let config = BatcherConfig {
        deferred: true,
        deferred_idle: Duration::from_millis(300),
        ..cached_config(&cache_path)
    };
    let client = BatchingClient::new(mock.clone());
    let outcome = batchify(config)
        .with_transport(mock.clone())
        .run(async {
            // Never resolves in this run; the deferred signal wins the race.
            let _ = client.execute(&chat_request("slow")).await;
        })
        .await;
    assert!(matches!(outcome, Err(BatchlingError::DeferredExit)));

    let submitted = uploaded_custom_ids(&mock);
    assert_eq!(submitted.len(), 1);

    // Run 2: no deferred mode; the request resolves from the resumed poll
    // with zero new submissions.
    let mock = Arc::new(MockHttpClient::new());
    let lines = result_lines(&submitted);
    for _ in 0..2 {
        mock.add_json_response(
            "GET /v1/batches/batch_1",
            200,
            json!({"status": "completed", "output_file_id": "file-out"}),
        );
        mock.add_response("GET /v1/files/file-out/content", Ok(jsonl_response(&lines)));
    }

    let client = BatchingClient::new(mock.clone());
    batchify(cached_config(&cache_path))
        .with_transport(mock.clone())
        .run(async {
            let response = client.execute(&chat_request("slow")).await.unwrap();
            assert_eq!(response.json_body().unwrap()["prompt"], "slow");
        })
        .await
        .unwrap();

    assert_eq!(mock.calls_for("POST /v1/files").len(), 0);
    assert_eq!(mock.calls_for("POST /v1/batches").len(), 0);
}
