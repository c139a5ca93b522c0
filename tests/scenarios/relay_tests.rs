use reqwest::multipart::{Form, Part};
use serde_json::json;
use std::time::Duration;

use crate::common::{parse_multipart, HookRelayEnv, ReceivedPart, TargetResponse, TargetServer};

#[tokio::test]
async fn ping_is_relayed_as_json() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(200, "thanks")).await;

    let (_, listing) = env.get_json("/view/abc123").await;
    assert_eq!(listing["records"], json!([]));

    let file = env
        .capture(
            env.client
                .post(env.url("/hook/abc123"))
                .header("content-type", "application/json")
                .body(r#"{"event":"ping"}"#),
        )
        .await;

    let (_, listing) = env.get_json("/view/abc123").await;
    assert_eq!(listing["records"], json!([file.clone()]));

    let summary = env
        .relay("abc123", json!({"url": target.url("/cb?x=1"), "f": file}))
        .await;

    assert_eq!(summary["ok"], true);
    assert_eq!(summary["status"], 200);
    assert_eq!(summary["bytes"], 6);
    assert_eq!(summary["response_preview"], "thanks");
    assert_eq!(summary["sent"]["url"], target.url("/cb?x=1"));
    assert_eq!(summary["sent"]["method"], "POST");
    assert_eq!(summary["sent"]["content_type"], "application/json");

    let received = target.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].method, "POST");
    assert_eq!(received[0].uri, "/cb?x=1");
    assert_eq!(received[0].headers["content-type"], "application/json");
    assert_eq!(received[0].body.as_ref(), br#"{"event":"ping"}"#);
}

#[tokio::test]
async fn recorded_query_is_merged_below_the_target_query() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(204, "")).await;

    let file = env
        .capture(env.client.get(env.url("/hook/abc123?a=2&b=3")))
        .await;

    let summary = env
        .relay("abc123", json!({"url": target.url("/cb?a=1"), "f": file}))
        .await;

    assert_eq!(summary["status"], 204);
    assert_eq!(target.received()[0].uri, "/cb?a=1&b=3");
}

#[tokio::test]
async fn cookies_and_host_are_never_forwarded() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(200, "")).await;

    let file = env
        .capture(
            env.client
                .post(env.url("/hook/abc123"))
                .header("cookie", "session=secret")
                .header("x-signature", "abc")
                .header("sec-fetch-mode", "cors")
                .header("user-agent", "Midtrans/1.0")
                .body("hello"),
        )
        .await;

    for mode in ["server", "browser"] {
        env.relay(
            "abc123",
            json!({"url": target.url("/cb"), "f": file, "mode": mode}),
        )
        .await;
    }

    let received = target.received();
    assert_eq!(received.len(), 2);
    for req in &received {
        assert!(req.headers.get("cookie").is_none());
        assert_eq!(req.headers["host"], target.addr.to_string());
        assert_eq!(req.headers["x-signature"], "abc");
        assert_eq!(req.headers["content-type"], "text/plain");
        assert_eq!(req.body.as_ref(), b"hello");
    }

    let server_mode = &received[0].headers;
    assert!(server_mode["user-agent"]
        .to_str()
        .unwrap()
        .starts_with("hookrelay/"));
    assert_eq!(server_mode["sec-fetch-mode"], "cors");

    let browser_mode = &received[1].headers;
    assert!(browser_mode.get("sec-fetch-mode").is_none());
    assert_ne!(
        browser_mode.get("user-agent").map(|v| v.to_str().unwrap()),
        Some("Midtrans/1.0")
    );
}

#[tokio::test]
async fn form_is_relayed_urlencoded() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(200, "")).await;

    let file = env
        .capture(
            env.client
                .post(env.url("/hook/abc123"))
                .header("content-type", "application/x-www-form-urlencoded")
                .body("addr%5Bcity%5D=X&items%5B%5D=a&items%5B%5D=b"),
        )
        .await;

    env.relay("abc123", json!({"url": target.url("/cb"), "f": file}))
        .await;

    let received = &target.received()[0];
    assert_eq!(
        received.headers["content-type"],
        "application/x-www-form-urlencoded"
    );
    assert_eq!(
        received.body.as_ref(),
        b"addr%5Bcity%5D=X&items%5B0%5D=a&items%5B1%5D=b"
    );
}

#[tokio::test]
async fn uploads_are_relayed_as_multipart() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(200, "")).await;

    let form = Form::new()
        .text("addr[city]", "X")
        .text("items[]", "a")
        .text("items[]", "b")
        .part("docs[]", Part::bytes(b"one".to_vec()).file_name("1.txt"))
        .part("docs[]", Part::bytes(b"two".to_vec()).file_name("2.txt"))
        .part("avatar", Part::bytes(vec![0u8, 255]).file_name("me.png"));
    let file = env
        .capture(env.client.post(env.url("/hook/abc123")).multipart(form))
        .await;

    let summary = env
        .relay("abc123", json!({"url": target.url("/upload"), "f": file}))
        .await;
    assert_eq!(summary["sent"]["content_type"], "multipart/form-data");

    let received = &target.received()[0];
    assert!(received.headers["content-type"]
        .to_str()
        .unwrap()
        .starts_with("multipart/form-data; boundary="));

    let part = |name: &str, file_name: Option<&str>, data: &[u8]| ReceivedPart {
        name: name.to_string(),
        file_name: file_name.map(str::to_string),
        data: bytes::Bytes::copy_from_slice(data),
    };
    assert_eq!(
        parse_multipart(received).await,
        vec![
            part("addr[city]", None, b"X"),
            part("items[0]", None, b"a"),
            part("items[1]", None, b"b"),
            part("docs[0]", Some("1.txt"), b"one"),
            part("docs[1]", Some("2.txt"), b"two"),
            part("avatar", Some("me.png"), &[0, 255]),
        ]
    );
}

#[tokio::test]
async fn browser_mode_relays_fields_without_files() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(200, "")).await;

    let form = Form::new()
        .text("note", "hi")
        .part("doc", Part::bytes(b"data".to_vec()).file_name("d.txt"));
    let file = env
        .capture(env.client.post(env.url("/hook/abc123")).multipart(form))
        .await;

    env.relay(
        "abc123",
        json!({"url": target.url("/cb"), "f": file, "mode": "browser"}),
    )
    .await;

    let parts = parse_multipart(&target.received()[0]).await;
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].name, "note");
}

#[tokio::test]
async fn binary_bodies_are_relayed_unchanged() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(200, "")).await;
    let body = vec![0u8, 159, 146, 150, 255];

    let file = env
        .capture(
            env.client
                .post(env.url("/hook/abc123"))
                .header("content-type", "application/octet-stream")
                .body(body.clone()),
        )
        .await;

    env.relay("abc123", json!({"url": target.url("/cb"), "f": file}))
        .await;

    let received = &target.received()[0];
    assert_eq!(received.headers["content-type"], "application/octet-stream");
    assert_eq!(received.body.as_ref(), body.as_slice());
}

#[tokio::test]
async fn large_responses_are_previewed() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(500, vec![b'x'; 5000])).await;

    let file = env
        .capture(env.client.post(env.url("/hook/abc123")).body("x"))
        .await;

    let summary = env
        .relay("abc123", json!({"url": target.url("/cb"), "f": file}))
        .await;

    assert_eq!(summary["ok"], true);
    assert_eq!(summary["status"], 500);
    assert_eq!(summary["bytes"], 5000);
    assert_eq!(summary["response_preview"].as_str().unwrap().len(), 4000);
}

#[tokio::test]
async fn redirects_are_followed() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(200, "final")).await;

    let file = env
        .capture(
            env.client
                .post(env.url("/hook/abc123"))
                .header("content-type", "application/json")
                .body(r#"{"event":"ping"}"#),
        )
        .await;

    let summary = env
        .relay("abc123", json!({"url": target.url("/redirect"), "f": file}))
        .await;

    assert_eq!(summary["status"], 200);
    assert_eq!(summary["response_preview"], "final");

    let received = target.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].uri, "/final");
    assert_eq!(received[0].method, "POST");
    assert_eq!(received[0].headers["content-type"], "application/json");
    assert_eq!(received[0].body.as_ref(), br#"{"event":"ping"}"#);
}

#[tokio::test]
async fn redirect_loops_are_cut_off() {
    let env = HookRelayEnv::start().await;
    let target = TargetServer::start(TargetResponse::new(200, "")).await;

    let file = env
        .capture(env.client.post(env.url("/hook/abc123")).body("x"))
        .await;

    let summary = env
        .relay("abc123", json!({"url": target.url("/loop"), "f": file}))
        .await;

    assert_eq!(summary["ok"], false);
    assert!(summary["error"].as_str().unwrap().contains("redirects"));
    assert!(target.received().is_empty());
}

#[tokio::test]
async fn slow_targets_time_out() {
    let env = HookRelayEnv::start_with(|b| b.relay_timeout(Duration::from_millis(200))).await;
    let target = TargetServer::start(
        TargetResponse::new(200, "late").delayed(Duration::from_secs(2)),
    )
    .await;

    let file = env
        .capture(env.client.post(env.url("/hook/abc123")).body("x"))
        .await;

    let summary = env
        .relay("abc123", json!({"url": target.url("/cb"), "f": file}))
        .await;

    assert_eq!(summary["ok"], false);
    assert!(summary["error"].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn invalid_relay_input_is_reported() {
    let env = HookRelayEnv::start().await;
    let file = env
        .capture(env.client.post(env.url("/hook/abc123")).body("x"))
        .await;

    let summary = env.relay("abc123", json!({"url": "", "f": file})).await;
    assert_eq!(summary, json!({"ok": false, "error": "URL is required"}));

    let summary = env
        .relay("abc123", json!({"url": "ftp://example.test/", "f": file}))
        .await;
    assert_eq!(summary["ok"], false);

    let summary = env
        .relay(
            "abc123",
            json!({"url": "http://example.test/", "f": "../../etc/passwd"}),
        )
        .await;
    assert_eq!(summary["ok"], false);

    let res = env
        .client
        .post(env.url("/view/abc123/relay"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("url=http%3A%2F%2F127.0.0.1%3A9%2F&f=missing.json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let summary: serde_json::Value = serde_json::from_slice(&res.bytes().await.unwrap()).unwrap();
    assert_eq!(summary["ok"], false);
}

#[tokio::test]
async fn unreachable_targets_are_reported() {
    let env = HookRelayEnv::start().await;
    let file = env
        .capture(env.client.post(env.url("/hook/abc123")).body("x"))
        .await;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);

    let summary = env
        .relay(
            "abc123",
            json!({"url": format!("http://{}/cb", closed), "f": file}),
        )
        .await;

    assert_eq!(summary["ok"], false);
    assert!(summary["error"].as_str().unwrap().starts_with("cannot send request"));
}
