//! Tests for telemetry

use super::*;
use crate::obfuscation;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn mismatch_event() -> TelemetryEvent {
    TelemetryEvent::hash_mismatch(1_700_000_000, "0123abcd", PathBuf::from("/opt/game/app.exe"))
}

/// Accept one HTTP request, answer with `status`, and return the raw request text
async fn serve_once(listener: TcpListener, status: &'static str) -> String {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&request).to_string();
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let lower = line.to_ascii_lowercase();
                    lower
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap())
                })
                .unwrap_or(0);
            if request.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }

    let response = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
    socket.write_all(response.as_bytes()).await.unwrap();
    String::from_utf8_lossy(&request).to_string()
}

async fn local_config() -> (TelemetryConfig, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = TelemetryConfig::new().with_host(addr.to_string(), false);
    (config, listener)
}

#[test]
fn test_telemetry_config_default() {
    let config = TelemetryConfig::default();
    assert!(config.enabled);
    assert!(config.secure);
    assert!(!config.encrypt_payload);
    assert_eq!(config.api_version, (1, 3));
    assert_eq!(config.user_agent, "Forc-Watchdog/1.0");
    assert_eq!(config.base_url(), "https://api.orerve.net");
}

#[test]
fn test_config_deserializes_with_defaults() {
    let config: TelemetryConfig = serde_json::from_str(r#"{"encrypt_payload": true}"#).unwrap();
    assert!(config.encrypt_payload);
    assert!(config.enabled);
    assert_eq!(config.timeout_ms, 5000);
}

#[test]
fn test_event_path_and_body() {
    let config = TelemetryConfig::default();
    let event = mismatch_event();

    assert_eq!(
        event.path(&config),
        "/1.3/watchdog/event?eventTime=1700000000&event=HashMismatch"
    );
    assert_eq!(
        event.url(&config),
        "https://api.orerve.net/1.3/watchdog/event?eventTime=1700000000&event=HashMismatch"
    );
    assert_eq!(event.body(), "hash=0123abcd&exe=/opt/game/app.exe");
}

#[test]
fn test_wire_body_clear_by_default() {
    let config = TelemetryConfig::default();
    let event = mismatch_event();
    assert_eq!(event.wire_body(&config), event.body());
}

#[test]
fn test_wire_body_encrypted_when_enabled() {
    let config = TelemetryConfig::default().with_encrypted_payload(true);
    let event = mismatch_event();

    let wire = event.wire_body(&config);
    assert_ne!(wire, event.body());
    assert_eq!(wire.len(), event.body().len() * 2);

    let decoded = obfuscation::decode_and_decrypt(&config.payload_key, &wire).unwrap();
    assert_eq!(decoded, event.body().into_bytes());
}

#[test]
fn test_sink_from_config_disabled_is_null() {
    let config = TelemetryConfig::default().with_enabled(false);
    assert!(sink_from_config(&config).is_ok());
}

#[tokio::test]
async fn test_null_sink_accepts_events() {
    assert!(NullTelemetry.send(&mismatch_event()).await.is_ok());
}

#[tokio::test]
async fn test_http_disabled_refuses() {
    let client = HttpTelemetry::new(TelemetryConfig::default().with_enabled(false)).unwrap();
    let result = client.send(&mismatch_event()).await;
    assert!(matches!(result, Err(TelemetryError::Disabled)));
}

#[tokio::test]
async fn test_http_posts_clear_body() {
    let (config, listener) = local_config().await;
    let server = tokio::spawn(serve_once(listener, "200 OK"));

    let client = HttpTelemetry::new(config).unwrap();
    client.send(&mismatch_event()).await.unwrap();

    let request = server.await.unwrap();
    assert!(request
        .starts_with("POST /1.3/watchdog/event?eventTime=1700000000&event=HashMismatch HTTP/1.1"));
    assert!(request.to_ascii_lowercase().contains("user-agent: forc-watchdog/1.0"));
    assert!(request.ends_with("hash=0123abcd&exe=/opt/game/app.exe"));
}

#[tokio::test]
async fn test_http_posts_encrypted_body() {
    let (config, listener) = local_config().await;
    let config = config.with_encrypted_payload(true);
    let key = config.payload_key.clone();
    let server = tokio::spawn(serve_once(listener, "200 OK"));

    let client = HttpTelemetry::new(config).unwrap();
    client.send(&mismatch_event()).await.unwrap();

    let request = server.await.unwrap();
    let body = request.rsplit("\r\n\r\n").next().unwrap();
    let decoded = obfuscation::decode_and_decrypt(&key, body).unwrap();
    assert_eq!(decoded, b"hash=0123abcd&exe=/opt/game/app.exe".to_vec());
}

#[tokio::test]
async fn test_http_reports_server_status() {
    let (config, listener) = local_config().await;
    let server = tokio::spawn(serve_once(listener, "503 Service Unavailable"));

    let client = HttpTelemetry::new(config).unwrap();
    let result = client.send(&mismatch_event()).await;
    server.await.unwrap();

    assert!(matches!(result, Err(TelemetryError::Status(503))));
}
