//! End-to-end scenarios driven through the public scope and the
//! interception hook, with all provider traffic scripted on a mock client.

use batchling::{
    batchify, BatcherConfig, BatchingClient, BatchlingError, HttpClient, HttpRequest,
    HttpResponse, MockHttpClient, DRY_RUN_HEADER,
};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// The active-engine slot is process-ambient; serialize every test that
// enters a scope.
static SCOPE_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn chat_request(model: &str, prompt: &str) -> HttpRequest {
    HttpRequest::new("POST", "https://api.openai.com/v1/chat/completions")
        .with_json(&json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
        }))
        .unwrap()
        .with_header("authorization", "Bearer sk-test")
        .unwrap()
}

fn fast_config() -> BatcherConfig {
    BatcherConfig {
        batch_window: Duration::from_millis(100),
        poll_interval: Duration::from_millis(20),
        cache: false,
        close_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

/// Parse the JSONL lines out of an uploaded multipart body:
/// `(custom_id, prompt)` per line.
fn uploaded_requests(mock: &MockHttpClient, upload_key: &str) -> Vec<(String, String)> {
    let mut parsed = Vec::new();
    for call in mock.calls_for(upload_key) {
        let text = String::from_utf8_lossy(call.body.as_ref().unwrap()).into_owned();
        for line in text.lines() {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                continue;
            };
            let Some(custom_id) = value.get("custom_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let prompt = value["body"]["messages"][0]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            parsed.push((custom_id.to_string(), prompt));
        }
    }
    parsed
}

fn jsonl_response(lines: &[String]) -> HttpResponse {
    HttpResponse::new(200, HeaderMap::new(), Bytes::from(lines.join("\n")))
}

/// Background task: once the upload for `upload_key` lands, publish a
/// `completed` poll for `batch_id` and a results file echoing each
/// request's prompt.
fn wire_openai_results(
    mock: Arc<MockHttpClient>,
    upload_key: &'static str,
    batch_id: &'static str,
    expected_requests: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let requests = uploaded_requests(&mock, upload_key);
            if requests.len() >= expected_requests {
                let lines: Vec<String> = requests
                    .iter()
                    .map(|(custom_id, prompt)| {
                        json!({
                            "custom_id": custom_id,
                            "response": {"status_code": 200, "body": {"prompt": prompt}},
                        })
                        .to_string()
                    })
                    .collect();
                mock.add_json_response(
                    &format!("GET /v1/batches/{batch_id}"),
                    200,
                    json!({"status": "completed", "output_file_id": "file-out"}),
                );
                mock.add_response("GET /v1/files/file-out/content", Ok(jsonl_response(&lines)));
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

#[test_log::test(tokio::test)]
async fn test_window_drain_submits_one_batch_for_two_requests() {
    let _serial = SCOPE_LOCK.lock().await;
    let mock = Arc::new(MockHttpClient::new());
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-in"}));
    mock.add_json_response(
        "POST /v1/batches",
        200,
        json!({"id": "batch_1", "status": "validating"}),
    );
    let wiring = wire_openai_results(mock.clone(), "POST /v1/files", "batch_1", 2);

    let client = BatchingClient::new(mock.clone());
    batchify(fast_config())
        .with_transport(mock.clone())
        .run(async {
            let __req0 = chat_request("m1", "a");
            let __req1 = chat_request("m1", "b");
            let (first, second) = tokio::join!(
                client.execute(&__req0),
                client.execute(&__req1),
            );
            let first = first.unwrap();
            let second = second.unwrap();
            assert_eq!(first.status, 200);
            assert_eq!(second.status, 200);
            assert_eq!(first.json_body().unwrap()["prompt"], "a");
            assert_eq!(second.json_body().unwrap()["prompt"], "b");
        })
        .await
        .unwrap();
    wiring.await.unwrap();

    // Exactly one submission containing both requests.
    assert_eq!(mock.calls_for("POST /v1/files").len(), 1);
    assert_eq!(mock.calls_for("POST /v1/batches").len(), 1);
    assert_eq!(uploaded_requests(&mock, "POST /v1/files").len(), 2);

    let create = mock.calls_for("POST /v1/batches")[0].json_body().unwrap();
    assert_eq!(create["endpoint"], "/v1/chat/completions");
    assert_eq!(create["completion_window"], "24h");
}

#[test_log::test(tokio::test)]
async fn test_size_trigger_skips_the_window() {
    let _serial = SCOPE_LOCK.lock().await;
    let mock = Arc::new(MockHttpClient::new());
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-in"}));
    mock.add_json_response("POST /v1/batches", 200, json!({"id": "batch_1"}));
    let wiring = wire_openai_results(mock.clone(), "POST /v1/files", "batch_1", 3);

    let config = BatcherConfig {
        batch_size: 3,
        batch_window: Duration::from_secs(60),
        ..fast_config()
    };

    let started = tokio::time::Instant::now();
    let client = BatchingClient::new(mock.clone());
    batchify(config)
        .with_transport(mock.clone())
        .run(async {
            let __req0 = chat_request("m1", "a");
            let __req1 = chat_request("m1", "b");
            let __req2 = chat_request("m1", "c");
            let (a, b, c) = tokio::join!(
                client.execute(&__req0),
                client.execute(&__req1),
                client.execute(&__req2),
            );
            assert!(a.is_ok() && b.is_ok() && c.is_ok());
        })
        .await
        .unwrap();
    wiring.await.unwrap();

    // The 60s window never elapsed: submission happened on the size trigger.
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(mock.calls_for("POST /v1/files").len(), 1);
    assert_eq!(uploaded_requests(&mock, "POST /v1/files").len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_size_overflow_starts_a_fresh_window() {
    let _serial = SCOPE_LOCK.lock().await;
    let mock = Arc::new(MockHttpClient::new());
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-1"}));
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-2"}));
    mock.add_json_response("POST /v1/batches", 200, json!({"id": "batch_a"}));
    mock.add_json_response("POST /v1/batches", 200, json!({"id": "batch_b"}));

    // Results for both batches: respond to either poll with the same
    // output file carrying every line; pollers ignore lines they don't own.
    let wiring = {
        let mock = mock.clone();
        tokio::spawn(async move {
            loop {
                let requests = uploaded_requests(&mock, "POST /v1/files");
                if requests.len() >= 3 {
                    let lines: Vec<String> = requests
                        .iter()
                        .map(|(custom_id, prompt)| {
                            json!({
                                "custom_id": custom_id,
                                "response": {"status_code": 200, "body": {"prompt": prompt}},
                            })
                            .to_string()
                        })
                        .collect();
                    for batch_id in ["batch_a", "batch_b"] {
                        mock.add_json_response(
                            &format!("GET /v1/batches/{batch_id}"),
                            200,
                            json!({"status": "completed", "output_file_id": "file-out"}),
                        );
                        mock.add_response(
                            "GET /v1/files/file-out/content",
                            Ok(jsonl_response(&lines)),
                        );
                    }
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let config = BatcherConfig {
        batch_size: 2,
        batch_window: Duration::from_millis(100),
        ..fast_config()
    };
    let client = BatchingClient::new(mock.clone());
    batchify(config)
        .with_transport(mock.clone())
        .run(async {
            let __req0 = chat_request("m1", "a");
            let __req1 = chat_request("m1", "b");
            let __req2 = chat_request("m1", "c");
            let (a, b, c) = tokio::join!(
                client.execute(&__req0),
                client.execute(&__req1),
                client.execute(&__req2),
            );
            assert!(a.is_ok() && b.is_ok() && c.is_ok());
        })
        .await
        .unwrap();
    wiring.await.unwrap();

    // First two drain on the size trigger; the third rides a fresh window.
    let uploads = mock.calls_for("POST /v1/files");
    assert_eq!(uploads.len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_mixed_models_submit_separate_batches() {
    let _serial = SCOPE_LOCK.lock().await;
    let mock = Arc::new(MockHttpClient::new());
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-1"}));
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-2"}));
    mock.add_json_response("POST /v1/batches", 200, json!({"id": "batch_a"}));
    mock.add_json_response("POST /v1/batches", 200, json!({"id": "batch_b"}));

    let wiring = {
        let mock = mock.clone();
        tokio::spawn(async move {
            loop {
                let requests = uploaded_requests(&mock, "POST /v1/files");
                if requests.len() >= 2 {
                    let lines: Vec<String> = requests
                        .iter()
                        .map(|(custom_id, prompt)| {
                            json!({
                                "custom_id": custom_id,
                                "response": {"status_code": 200, "body": {"prompt": prompt}},
                            })
                            .to_string()
                        })
                        .collect();
                    for batch_id in ["batch_a", "batch_b"] {
                        mock.add_json_response(
                            &format!("GET /v1/batches/{batch_id}"),
                            200,
                            json!({"status": "completed", "output_file_id": "file-out"}),
                        );
                        mock.add_response(
                            "GET /v1/files/file-out/content",
                            Ok(jsonl_response(&lines)),
                        );
                    }
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let client = BatchingClient::new(mock.clone());
    batchify(fast_config())
        .with_transport(mock.clone())
        .run(async {
            let __req0 = chat_request("m1", "a");
            let __req1 = chat_request("m2", "b");
            let (a, b) = tokio::join!(
                client.execute(&__req0),
                client.execute(&__req1),
            );
            assert!(a.is_ok() && b.is_ok());
        })
        .await
        .unwrap();
    wiring.await.unwrap();

    // One submission per queue key.
    assert_eq!(mock.calls_for("POST /v1/files").len(), 2);
    assert_eq!(mock.calls_for("POST /v1/batches").len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_dry_run_makes_no_provider_calls() {
    let _serial = SCOPE_LOCK.lock().await;
    let mock = Arc::new(MockHttpClient::new());
    let client = BatchingClient::new(mock.clone());

    let config = BatcherConfig {
        dry_run: true,
        ..fast_config()
    };
    batchify(config)
        .with_transport(mock.clone())
        .run(async {
            let __req0 = chat_request("m1", "a");
            let __req1 = chat_request("m1", "b");
            let __req2 = chat_request("m1", "c");
            let __req3 = chat_request("m1", "d");
            let __req4 = chat_request("m1", "e");
            let responses = tokio::join!(
                client.execute(&__req0),
                client.execute(&__req1),
                client.execute(&__req2),
                client.execute(&__req3),
                client.execute(&__req4),
            );
            for response in [
                responses.0, responses.1, responses.2, responses.3, responses.4,
            ] {
                let response = response.unwrap();
                assert_eq!(response.status, 200);
                assert_eq!(response.headers.get(DRY_RUN_HEADER).unwrap(), "1");
                assert_eq!(response.json_body().unwrap()["dry_run"], true);
            }
        })
        .await
        .unwrap();

    assert_eq!(mock.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_per_line_provider_errors_resolve_as_responses() {
    let _serial = SCOPE_LOCK.lock().await;
    let mock = Arc::new(MockHttpClient::new());
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-in"}));
    mock.add_json_response("POST /v1/batches", 200, json!({"id": "batch_1"}));

    let wiring = {
        let mock = mock.clone();
        tokio::spawn(async move {
            loop {
                let requests = uploaded_requests(&mock, "POST /v1/files");
                if requests.len() >= 2 {
                    let lines: Vec<String> = requests
                        .iter()
                        .map(|(custom_id, prompt)| {
                            if prompt == "bad" {
                                json!({
                                    "custom_id": custom_id,
                                    "response": null,
                                    "error": {"status_code": 429, "message": "rate limited"},
                                })
                                .to_string()
                            } else {
                                json!({
                                    "custom_id": custom_id,
                                    "response": {"status_code": 200, "body": {"prompt": prompt}},
                                })
                                .to_string()
                            }
                        })
                        .collect();
                    mock.add_json_response(
                        "GET /v1/batches/batch_1",
                        200,
                        json!({"status": "completed", "output_file_id": "file-out"}),
                    );
                    mock.add_response(
                        "GET /v1/files/file-out/content",
                        Ok(jsonl_response(&lines)),
                    );
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let client = BatchingClient::new(mock.clone());
    batchify(fast_config())
        .with_transport(mock.clone())
        .run(async {
            let __req0 = chat_request("m1", "good");
            let __req1 = chat_request("m1", "bad");
            let (good, bad) = tokio::join!(
                client.execute(&__req0),
                client.execute(&__req1),
            );
            // A provider-side per-request failure is still a response, with
            // the provider's error envelope, not an engine error.
            let good = good.unwrap();
            assert_eq!(good.status, 200);
            let bad = bad.unwrap();
            assert_eq!(bad.status, 429);
            assert_eq!(bad.json_body().unwrap()["message"], "rate limited");
        })
        .await
        .unwrap();
    wiring.await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_missing_result_line_is_provider_incomplete() {
    let _serial = SCOPE_LOCK.lock().await;
    let mock = Arc::new(MockHttpClient::new());
    mock.add_json_response("POST /v1/files", 200, json!({"id": "file-in"}));
    mock.add_json_response("POST /v1/batches", 200, json!({"id": "batch_1"}));

    let wiring = {
        let mock = mock.clone();
        tokio::spawn(async move {
            loop {
                let requests = uploaded_requests(&mock, "POST /v1/files");
                if requests.len() >= 2 {
                    // Only the first request gets a result line.
                    let (custom_id, prompt) = &requests[0];
                    let line = json!({
                        "custom_id": custom_id,
                        "response": {"status_code": 200, "body": {"prompt": prompt}},
                    })
                    .to_string();
                    mock.add_json_response(
                        "GET /v1/batches/batch_1",
                        200,
                        json!({"status": "expired", "output_file_id": "file-out"}),
                    );
                    mock.add_response(
                        "GET /v1/files/file-out/content",
                        Ok(jsonl_response(std::slice::from_ref(&line))),
                    );
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let client = BatchingClient::new(mock.clone());
    batchify(fast_config())
        .with_transport(mock.clone())
        .run(async {
            let __req0 = chat_request("m1", "a");
            let __req1 = chat_request("m1", "b");
            let (first, second) = tokio::join!(
                client.execute(&__req0),
                client.execute(&__req1),
            );
            let outcomes = [first, second];
            let resolved = outcomes.iter().filter(|r| r.is_ok()).count();
            assert_eq!(resolved, 1);
            let incomplete = outcomes
                .into_iter()
                .find_map(|outcome| match outcome {
                    Err(BatchlingError::ProviderIncomplete { batch_id, state }) => {
                        Some((batch_id, state))
                    }
                    _ => None,
                })
                .expect("one request must resolve as incomplete");
            assert_eq!(incomplete.0, "batch_1");
            assert_eq!(incomplete.1, "expired");
        })
        .await
        .unwrap();
    wiring.await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_missing_credential_is_auth_error() {
    let _serial = SCOPE_LOCK.lock().await;
    let mock = Arc::new(MockHttpClient::new());
    let client = BatchingClient::new(mock.clone());

    // No auth header and DOUBLEWORD_API_KEY is not set in the test
    // environment, so submission fails for the whole batch.
    let request = HttpRequest::new("POST", "https://api.doubleword.ai/v1/chat/completions")
        .with_json(&json!({"model": "m1", "messages": []}))
        .unwrap();

    batchify(fast_config())
        .with_transport(mock.clone())
        .run(async {
            let result = client.execute(&request).await;
            assert!(matches!(result, Err(BatchlingError::Auth(_))));
        })
        .await
        .unwrap();
    assert_eq!(mock.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_non_batchable_requests_pass_through_inside_scope() {
    let _serial = SCOPE_LOCK.lock().await;
    let mock = Arc::new(MockHttpClient::new());
    mock.add_json_response("GET /v1/models", 200, json!({"data": []}));
    let client = BatchingClient::new(mock.clone());

    batchify(fast_config())
        .with_transport(mock.clone())
        .run(async {
            let request = HttpRequest::new("GET", "https://api.openai.com/v1/models");
            let response = client.execute(&request).await.unwrap();
            assert_eq!(response.status, 200);
        })
        .await
        .unwrap();

    assert_eq!(mock.calls_for("GET /v1/models").len(), 1);
}
