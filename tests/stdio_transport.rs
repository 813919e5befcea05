//! Stdio transport against real child processes
//!
//! Each test writes a small POSIX shell MCP server to a temp file and
//! spawns it with `sh`.

#![cfg(unix)]

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp_conduit::{CallContext, StdioConfig, StdioTransport, Transport, TransportError, TransportExt};
use serde_json::{json, Value};
use tempfile::NamedTempFile;

/// Answers every request with `{"method": <method>}`
const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  method=$(printf '%s\n' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
  [ -z "$id" ] && continue
  printf '{"jsonrpc":"2.0","id":%s,"result":{"method":"%s"}}\n' "$id" "$method"
done
"#;

fn script(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn spawn_script(file: &NamedTempFile) -> StdioTransport {
    let path = file.path().to_str().unwrap();
    StdioTransport::spawn("sh", &[path]).unwrap()
}

#[tokio::test]
async fn test_call_against_echo_server() {
    let server = script(ECHO_SERVER);
    let transport = spawn_script(&server);
    let ctx = CallContext::background();

    let result: Value = transport
        .call(&ctx, "tools/list", Some(json!({"cursor": "x"})))
        .await
        .unwrap();
    assert_eq!(result, json!({"method": "tools/list"}));

    let raw = transport.call_raw(&ctx, "ping", None).await.unwrap();
    assert_eq!(raw.get("method"), Some(&json!("ping")));

    assert!(transport.session_id().is_none());
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_against_echo_server() {
    let server = script(ECHO_SERVER);
    let transport = Arc::new(spawn_script(&server));
    let ctx = CallContext::background();

    let calls = (0..20).map(|i| {
        let transport = transport.clone();
        let ctx = ctx.clone();
        async move {
            let method = format!("method/{}", i);
            let result = transport.call_value(&ctx, &method, None).await.unwrap();
            assert_eq!(result["method"], json!(method));
        }
    });
    futures::future::join_all(calls).await;

    assert_eq!(transport.pending_count(), 0);
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_stderr_output_does_not_block() {
    let server = script(&format!(
        "i=0\nwhile [ $i -lt 2000 ]; do echo \"log line $i\" >&2; i=$((i+1)); done\n{}",
        ECHO_SERVER
    ));
    let transport = spawn_script(&server);

    let result = transport
        .call_value(&CallContext::background(), "after/logs", None)
        .await
        .unwrap();
    assert_eq!(result["method"], json!("after/logs"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_server_that_never_answers_times_out() {
    let server = script("while IFS= read -r line; do :; done\n");
    let path = server.path().to_str().unwrap().to_string();
    let transport = StdioTransport::with_config(
        StdioConfig::new("sh")
            .with_args([path])
            .with_timeout(Duration::from_millis(200)),
    )
    .unwrap();

    let err = transport
        .call_value(&CallContext::background(), "slow", None)
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got {:?}", err);
    assert_eq!(transport.pending_count(), 0);
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_exited_server_fails_calls() {
    let server = script("exit 0\n");
    let transport = spawn_script(&server);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = transport
        .call_value(&CallContext::background(), "anything", None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::Closed | TransportError::Io(_)),
        "unexpected error: {:?}",
        err
    );

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_command_is_spawn_error() {
    let err = StdioTransport::spawn("/nonexistent/mcp-server-binary", &[]).unwrap_err();
    match err {
        TransportError::Spawn { command, .. } => {
            assert!(command.contains("mcp-server-binary"));
        }
        other => panic!("expected spawn error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_working_directory_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let server = script(
        r#"
IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{"cwd":"%s"}}\n' "$(pwd)"
while IFS= read -r line; do :; done
"#,
    );
    let path = server.path().to_str().unwrap().to_string();
    let transport = StdioTransport::with_config(
        StdioConfig::new("sh")
            .with_args([path])
            .with_working_dir(dir.path()),
    )
    .unwrap();

    let result = transport
        .call_value(&CallContext::background(), "cwd", None)
        .await
        .unwrap();

    let reported = std::fs::canonicalize(result["cwd"].as_str().unwrap()).unwrap();
    assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_environment_is_replaced() {
    std::env::set_var("MCP_CONDUIT_TEST_LEAK", "leaked");
    let server = script(
        r#"
IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{"greeting":"%s","leak":"%s"}}\n' "$GREETING" "${MCP_CONDUIT_TEST_LEAK:-absent}"
while IFS= read -r line; do :; done
"#,
    );
    let path = server.path().to_str().unwrap().to_string();
    let transport = StdioTransport::with_config(
        StdioConfig::new("/bin/sh")
            .with_args([path])
            .with_env_var("GREETING", "hello"),
    )
    .unwrap();

    let result = transport
        .call_value(&CallContext::background(), "env", None)
        .await
        .unwrap();

    assert_eq!(result["greeting"], json!("hello"));
    assert_eq!(result["leak"], json!("absent"));
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_server_notification_reaches_handler() {
    let server = script(
        r#"
IFS= read -r line
printf '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info","data":"hi"}}\n'
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
while IFS= read -r line; do :; done
"#,
    );
    let transport = spawn_script(&server);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    transport.set_notification_handler(move |method: &str, params: Option<Value>| {
        let _ = tx.send((method.to_string(), params));
    });

    transport
        .call_value(&CallContext::background(), "trigger", None)
        .await
        .unwrap();

    let (method, params) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(method, "notifications/message");
    assert_eq!(params.unwrap()["data"], json!("hi"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_server_request_is_answered() {
    // The server asks for roots, then returns our reply as its result
    let server = script(
        r#"
IFS= read -r line
id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":"srv-1","method":"roots/list"}\n'
IFS= read -r reply
printf '{"jsonrpc":"2.0","id":%s,"result":{"reply":%s}}\n' "$id" "$reply"
while IFS= read -r line; do :; done
"#,
    );
    let transport = spawn_script(&server);
    transport.set_request_handler(|method: &str, _params: Option<Value>| {
        assert_eq!(method, "roots/list");
        Ok(json!({"roots": [{"uri": "file:///work"}]}))
    });

    let result = transport
        .call_value(&CallContext::background(), "start", None)
        .await
        .unwrap();

    let reply = &result["reply"];
    assert_eq!(reply["id"], json!("srv-1"));
    assert_eq!(reply["result"]["roots"][0]["uri"], json!("file:///work"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_close_reaps_child_promptly() {
    let server = script(ECHO_SERVER);
    let transport = spawn_script(&server);

    transport
        .call_value(&CallContext::background(), "warmup", None)
        .await
        .unwrap();

    let started = Instant::now();
    transport.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));

    let err = transport
        .call_value(&CallContext::background(), "after", None)
        .await
        .unwrap_err();
    assert!(err.is_closed());
}
