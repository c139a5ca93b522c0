use reqwest::multipart::{Form, Part};
use serde_json::json;

use crate::common::HookRelayEnv;

#[tokio::test]
async fn json_request_is_recorded() {
    let env = HookRelayEnv::start().await;

    let file = env
        .capture(
            env.client
                .post(env.url("/hook/abc123?x=1&tag=a&tag=b"))
                .header("content-type", "application/json")
                .header("user-agent", "Midtrans/1.0")
                .header("x-signature", "abc")
                .body(r#"{"event":"ping"}"#),
        )
        .await;

    let (status, record) = env
        .get_json(&format!("/view/abc123/records/{}", file))
        .await;

    assert_eq!(status, 200);
    assert_eq!(record["id"], "abc123");
    assert_eq!(record["method"], "POST");
    assert_eq!(record["path"], "/hook/abc123?x=1&tag=a&tag=b");
    assert_eq!(record["remote_addr"], "127.0.0.1");
    assert_eq!(record["content_type"], "application/json");
    assert_eq!(record["ua"], "Midtrans/1.0");
    assert_eq!(record["json"], json!({"event": "ping"}));
    assert_eq!(record["form"], json!({}));
    assert_eq!(record["raw"], r#"{"event":"ping"}"#);
    assert_eq!(record["query"], json!({"x": "1", "tag": ["a", "b"]}));
    assert_eq!(record["headers"]["X-Signature"], "abc");
    assert_eq!(record["headers"]["Content-Length"], "16");
    assert!(record["timestamp"].is_string());
}

#[tokio::test]
async fn repeated_headers_are_kept_as_lists() {
    let env = HookRelayEnv::start().await;

    let file = env
        .capture(
            env.client
                .post(env.url("/hook/abc123"))
                .header("x-tag", "a")
                .header("x-tag", "b")
                .body("hi"),
        )
        .await;

    let (_, record) = env
        .get_json(&format!("/view/abc123/records/{}", file))
        .await;

    assert_eq!(record["headers"]["X-Tag"], json!(["a", "b"]));
}

#[tokio::test]
async fn urlencoded_form_is_parsed_for_any_method() {
    let env = HookRelayEnv::start().await;

    let file = env
        .capture(
            env.client
                .put(env.url("/hook/abc123"))
                .header("content-type", "application/x-www-form-urlencoded")
                .body("name=Peter+Griffin&addr%5Bcity%5D=Quahog&items%5B%5D=a&items%5B%5D=b"),
        )
        .await;

    let (_, record) = env
        .get_json(&format!("/view/abc123/records/{}", file))
        .await;

    assert_eq!(record["method"], "PUT");
    assert_eq!(
        record["form"],
        json!({"name": "Peter Griffin", "addr": {"city": "Quahog"}, "items": ["a", "b"]})
    );
    assert_eq!(record["json"], json!(null));
}

#[tokio::test]
async fn multipart_fields_and_files_are_split() {
    let env = HookRelayEnv::start().await;

    let form = Form::new()
        .text("addr[city]", "X")
        .text("note", "hello")
        .part(
            "docs[]",
            Part::bytes(b"first".to_vec())
                .file_name("one.txt")
                .mime_str("text/plain")
                .unwrap(),
        )
        .part(
            "docs[]",
            Part::bytes(b"second".to_vec()).file_name("my report.pdf"),
        );

    let file = env
        .capture(env.client.post(env.url("/hook/abc123")).multipart(form))
        .await;

    let (_, record) = env
        .get_json(&format!("/view/abc123/records/{}", file))
        .await;

    assert_eq!(record["form"], json!({"addr": {"city": "X"}, "note": "hello"}));
    assert_eq!(record["raw"], "");

    let files = record["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0]["field"], "docs");
    assert_eq!(files[0]["name"], "one.txt");
    assert_eq!(files[0]["type"], "text/plain");
    assert_eq!(files[0]["size"], 5);
    assert_eq!(files[1]["name"], "my_report.pdf");

    let stored = files[1]["path"].as_str().unwrap();
    assert!(stored.ends_with("_my_report.pdf"));
    let res = env
        .client
        .get(env.url(&format!("/view/abc123/uploads/{}", stored)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-type"], "application/octet-stream");
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"second");
}

#[tokio::test]
async fn oversized_uploads_are_recorded_as_failed() {
    let env = HookRelayEnv::start_with(|b| b.max_upload_size(4)).await;

    let form = Form::new()
        .part("small", Part::bytes(b"ok".to_vec()).file_name("a.txt"))
        .part("big", Part::bytes(vec![b'x'; 64]).file_name("b.txt"));

    let file = env
        .capture(env.client.post(env.url("/hook/abc123")).multipart(form))
        .await;

    let (_, record) = env
        .get_json(&format!("/view/abc123/records/{}", file))
        .await;

    let files = record["files"].as_array().unwrap();
    assert_eq!(files[0]["size"], 2);
    assert_eq!(files[1], json!({"field": "big", "name": "b.txt", "error": 1}));
}

#[tokio::test]
async fn binary_bodies_are_kept_byte_exact() {
    let env = HookRelayEnv::start().await;
    let body = vec![0u8, 159, 146, 150, 255];

    let file = env
        .capture(
            env.client
                .post(env.url("/hook/abc123"))
                .header("content-type", "application/octet-stream")
                .body(body.clone()),
        )
        .await;

    let (_, record) = env
        .get_json(&format!("/view/abc123/records/{}", file))
        .await;

    assert_eq!(record["raw_base64"], true);
    assert_eq!(record["raw"], "AJ+Slv8=");
}
