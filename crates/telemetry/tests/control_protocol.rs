#![forbid(unsafe_code)]

use std::path::Path;

use onion_telemetry::{ControlAddr, ControlConn, TelemetryError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

/// Minimal control endpoint speaking just enough of the protocol for the
/// client under test.
async fn serve_one(listener: UnixListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let (r, mut w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let reply: String = match line.trim() {
            "AUTHENTICATE \"\"" => "250 OK\r\n".into(),
            "GETINFO traffic/read" => "250-traffic/read=1234\r\n250 OK\r\n".into(),
            "GETINFO traffic/written" => "250-traffic/written=not-a-number\r\n250 OK\r\n".into(),
            "GETINFO circuit-status" => "250+circuit-status=\r\n\
                 c1 BUILT $fp,$fp PURPOSE=GENERAL\r\n\
                 c2 LAUNCHED $fp PURPOSE=GENERAL\r\n\
                 c3 BUILT $fp,$fp PURPOSE=GENERAL\r\n\
                 .\r\n250 OK\r\n"
                .into(),
            "GETINFO stream-status" => "250+stream-status=\r\n.\r\n250 OK\r\n".into(),
            _ => "552 Unrecognized key\r\n".into(),
        };
        w.write_all(reply.as_bytes()).await.unwrap();
        w.flush().await.unwrap();
    }
}

async fn connect(path: &Path) -> ControlConn {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(serve_one(listener));
    let mut conn = ControlConn::connect(&ControlAddr::Unix(path.to_path_buf())).await.unwrap();
    conn.authenticate().await.unwrap();
    conn
}

#[tokio::test]
async fn reads_scalar_info_value() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = connect(&dir.path().join("control.sock")).await;
    let v = conn.get_info_value("traffic/read").await.unwrap();
    assert_eq!(v, 1234.0);
}

#[tokio::test]
async fn counts_matching_lines_in_multiline_reply() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = connect(&dir.path().join("control.sock")).await;
    let built = conn.count_matching("circuit-status", " BUILT ").await.unwrap();
    assert_eq!(built, 2);

    // Empty tabular body counts as zero, not an error.
    let streams = conn.count_matching("stream-status", "SUCCEEDED").await.unwrap();
    assert_eq!(streams, 0);
}

#[tokio::test]
async fn malformed_value_fails_only_that_query() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = connect(&dir.path().join("control.sock")).await;

    let err = conn.get_info_value("traffic/written").await.unwrap_err();
    assert!(matches!(err, TelemetryError::Malformed(_)));

    // The session stays usable for the next metric.
    let v = conn.get_info_value("traffic/read").await.unwrap();
    assert_eq!(v, 1234.0);
}

#[tokio::test]
async fn error_status_is_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = connect(&dir.path().join("control.sock")).await;
    let err = conn.request("GETINFO nope").await.unwrap_err();
    assert!(matches!(err, TelemetryError::Status(552)));
}
