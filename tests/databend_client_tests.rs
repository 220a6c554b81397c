//! Warehouse HTTP client and ingester behavior against a mock Databend:
//! query paging, error classification, and the retry-on-transient path.

use std::sync::Arc;

use bend_archiver::config::Config;
use bend_archiver::databend::{DatabendClient, DatabendError};
use bend_archiver::ingest::{DatabendIngester, Ingester};
use bend_archiver::source::Value;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ingester_config(dsn: &str) -> Arc<Config> {
    let cfg_json = format!(
        r#"{{
            "databaseType": "csv",
            "sourceCSVPath": "/tmp/unused.csv",
            "databendDSN": "{dsn}",
            "databendTable": "default.archive_target",
            "batchSize": 10
        }}"#
    );
    Arc::new(serde_json::from_str(&cfg_json).unwrap())
}

fn sample_batch() -> (Vec<String>, Vec<Vec<Value>>) {
    (
        vec!["id".to_string(), "name".to_string()],
        vec![
            vec![Value::Int(1), Value::Text("Alice".to_string())],
            vec![Value::Int(2), Value::Null],
        ],
    )
}

#[tokio::test]
async fn test_exec_succeeded_statement() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "Succeeded"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = DatabendClient::from_dsn(&server.uri()).unwrap();
    client.exec("SELECT 1").await.unwrap();
}

#[tokio::test]
async fn test_exec_follows_next_uri_while_running() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": "Running",
            "next_uri": "/v1/query/q1/page/1"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/query/q1/page/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "Succeeded"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = DatabendClient::from_dsn(&server.uri()).unwrap();
    client.exec("COPY INTO t FROM @~/f.csv").await.unwrap();
}

#[tokio::test]
async fn test_exec_surfaces_query_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": "Failed",
            "error": {"code": 1065, "message": "syntax error"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = DatabendClient::from_dsn(&server.uri()).unwrap();
    let err = client.exec("COPY INTO nope").await.unwrap_err();
    match &err {
        DatabendError::Query { code, message } => {
            assert_eq!(*code, 1065);
            assert!(message.contains("syntax"));
        }
        other => panic!("expected query error, got {other:?}"),
    }
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_upload_to_stage_puts_file() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/upload_to_stage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "upload-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("batch.csv");
    std::fs::write(&file, "id\n1\n").unwrap();

    let client = DatabendClient::from_dsn(&server.uri()).unwrap();
    client.upload_to_stage("~", "batch.csv", &file).await.unwrap();
}

#[tokio::test]
async fn test_ingest_retries_transient_copy_failures() {
    let server = MockServer::start().await;

    // Uploads succeed on every attempt
    Mock::given(method("PUT"))
        .and(path("/v1/upload_to_stage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "upload"})))
        .expect(3)
        .mount(&server)
        .await;

    // COPY INTO: 503 twice, then success
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "Succeeded"})))
        .expect(1)
        .mount(&server)
        .await;

    let staging = tempfile::tempdir().unwrap();
    let ingester = DatabendIngester::new(ingester_config(&server.uri()))
        .unwrap()
        .staging_dir(staging.path().to_path_buf());

    let (columns, rows) = sample_batch();
    ingester.ingest_data(&columns, rows).await.unwrap();

    // The batch landed exactly once and the local temp file is gone
    assert_eq!(ingester.load_rows_count(), 2);
    let leftovers: Vec<_> = std::fs::read_dir(staging.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "staging dir should be empty");
}

#[tokio::test]
async fn test_ingest_fails_fast_on_query_error() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/upload_to_stage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "upload"})))
        .expect(1)
        .mount(&server)
        .await;

    // Schema mismatch is not retryable
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": "Failed",
            "error": {"code": 1006, "message": "number of columns does not match"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let staging = tempfile::tempdir().unwrap();
    let ingester = DatabendIngester::new(ingester_config(&server.uri()))
        .unwrap()
        .staging_dir(staging.path().to_path_buf());

    let (columns, rows) = sample_batch();
    let err = ingester.ingest_data(&columns, rows).await.unwrap_err();
    assert!(err.to_string().contains("1006"));

    assert_eq!(ingester.load_rows_count(), 0);
    let leftovers: Vec<_> = std::fs::read_dir(staging.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "temp file is dropped on terminal failure");
}

#[tokio::test]
async fn test_ingest_skips_empty_batches() {
    // No server interaction at all for an empty batch
    let ingester = DatabendIngester::new(ingester_config("http://u:p@localhost:1")).unwrap();
    ingester
        .ingest_data(&["id".to_string()], Vec::new())
        .await
        .unwrap();
    assert_eq!(ingester.load_rows_count(), 0);
}
