//! Control-port client scraping daemon-internal counters into metrics.
//!
//! The control protocol is line oriented: a single-line request, then one
//! or more reply lines. `250-key=value` carries a single value,
//! `250+key=` opens a multiline block terminated by a lone `.`, and a
//! `250 OK` (or an error status) finishes the reply.

#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use metrics::{absolute_counter, gauge};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the daemon's control endpoint lives. Unix socket and TCP are
/// mutually exclusive; the binary enforces that at flag parse time.
#[derive(Debug, Clone)]
pub enum ControlAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl fmt::Display for ControlAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAddr::Unix(p) => write!(f, "unix://{}", p.display()),
            ControlAddr::Tcp(a) => write!(f, "tcp://{a}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("control connection i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("control protocol violation: {0}")]
    Protocol(String),
    #[error("control command failed with status {0}")]
    Status(u16),
    #[error("malformed value for {0}")]
    Malformed(String),
}

/// A parsed control reply. `data` holds the payload of `250-` lines in
/// order; a multiline block contributes its header and then its joined
/// body as the following element.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub data: Vec<String>,
}

pub struct ControlConn {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ControlConn {
    pub async fn connect(addr: &ControlAddr) -> Result<Self, TelemetryError> {
        let (reader, writer): (Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>) =
            match addr {
                ControlAddr::Unix(path) => {
                    let (r, w) = UnixStream::connect(path).await?.into_split();
                    (Box::new(r), Box::new(w))
                }
                ControlAddr::Tcp(addr) => {
                    let (r, w) = TcpStream::connect(addr.as_str()).await?.into_split();
                    (Box::new(r), Box::new(w))
                }
            };
        Ok(Self { reader: BufReader::new(reader), writer })
    }

    /// Null authentication, as used when the control port is protected by
    /// filesystem permissions rather than a password.
    pub async fn authenticate(&mut self) -> Result<(), TelemetryError> {
        self.request("AUTHENTICATE \"\"").await.map(drop)
    }

    pub async fn request(&mut self, cmd: &str) -> Result<Response, TelemetryError> {
        self.writer.write_all(cmd.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let mut data = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.len() < 4 {
                return Err(TelemetryError::Protocol(format!("short reply line {line:?}")));
            }
            let status: u16 = line[..3]
                .parse()
                .map_err(|_| TelemetryError::Protocol(format!("bad status in {line:?}")))?;
            match line.as_bytes()[3] {
                b'-' => data.push(line[4..].to_string()),
                b'+' => {
                    data.push(line[4..].to_string());
                    let mut body = String::new();
                    loop {
                        let l = self.read_line().await?;
                        if l == "." {
                            break;
                        }
                        if !body.is_empty() {
                            body.push('\n');
                        }
                        body.push_str(&l);
                    }
                    data.push(body);
                }
                b' ' => {
                    if status != 250 {
                        return Err(TelemetryError::Status(status));
                    }
                    return Ok(Response { status, data });
                }
                sep => {
                    return Err(TelemetryError::Protocol(format!(
                        "unexpected separator {:?} in {line:?}",
                        sep as char
                    )));
                }
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, TelemetryError> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Err(TelemetryError::Protocol("connection closed mid-reply".into()));
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(buf)
    }

    /// `GETINFO key` where the reply is a single `key=value` line.
    pub async fn get_info_value(&mut self, key: &str) -> Result<f64, TelemetryError> {
        let resp = self.request(&format!("GETINFO {key}")).await?;
        if resp.data.len() != 1 {
            return Err(TelemetryError::Protocol(format!(
                "GETINFO {key}: expected one data line, got {}",
                resp.data.len()
            )));
        }
        let (_, value) = resp.data[0]
            .split_once('=')
            .ok_or_else(|| TelemetryError::Malformed(key.to_string()))?;
        value.parse().map_err(|_| TelemetryError::Malformed(key.to_string()))
    }

    /// `GETINFO key` with a tabular reply; counts body lines containing
    /// `needle`. An empty body (no block) counts as zero.
    pub async fn count_matching(&mut self, key: &str, needle: &str) -> Result<usize, TelemetryError> {
        let resp = self.request(&format!("GETINFO {key}")).await?;
        if resp.data.len() < 2 {
            return Ok(0);
        }
        Ok(resp.data[1].lines().filter(|l| l.contains(needle)).count())
    }
}

/// Periodically scrapes the control endpoint into gauges and counters.
pub struct Collector {
    addr: ControlAddr,
    interval: Duration,
    conn: Option<ControlConn>,
}

impl Collector {
    pub fn new(addr: ControlAddr, interval: Duration) -> Self {
        Self { addr, interval, conn: None }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(addr = %self.addr, interval_secs = self.interval.as_secs(), "telemetry collector started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
        info!("telemetry collector stopped");
    }

    async fn tick(&mut self) {
        if self.conn.is_none() {
            match Self::session(&self.addr).await {
                Ok(conn) => {
                    debug!(addr = %self.addr, "control session established");
                    self.conn = Some(conn);
                }
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "control connect failed; retrying next tick");
                    return;
                }
            }
        }
        let Some(conn) = self.conn.as_mut() else { return };
        if let Err(e) = scrape(conn).await {
            // Next tick re-establishes the session from scratch.
            warn!(error = %e, "scrape failed; dropping control session");
            self.conn = None;
        }
    }

    async fn session(addr: &ControlAddr) -> Result<ControlConn, TelemetryError> {
        let mut conn = ControlConn::connect(addr).await?;
        conn.authenticate().await?;
        Ok(conn)
    }
}

/// One scrape pass. A malformed reply fails only that metric's sample;
/// an I/O error aborts the pass so the session gets rebuilt.
async fn scrape(conn: &mut ControlConn) -> Result<(), TelemetryError> {
    record_count(conn, "circuit-status", " BUILT ", "circuits").await?;
    record_count(conn, "stream-status", "SUCCEEDED", "streams").await?;
    record_count(conn, "orconn-status", " CONNECTED", "orconns").await?;
    record_total(conn, "traffic/read", "traffic_read").await?;
    record_total(conn, "traffic/written", "traffic_written").await?;
    Ok(())
}

async fn record_count(
    conn: &mut ControlConn,
    key: &str,
    needle: &str,
    metric: &'static str,
) -> Result<(), TelemetryError> {
    match conn.count_matching(key, needle).await {
        Ok(n) => {
            gauge!(metric, n as f64);
            Ok(())
        }
        Err(e) => skip_unless_io(e, metric),
    }
}

async fn record_total(
    conn: &mut ControlConn,
    key: &str,
    metric: &'static str,
) -> Result<(), TelemetryError> {
    match conn.get_info_value(key).await {
        Ok(v) => {
            // The daemon reports running totals; record them as-is.
            absolute_counter!(metric, v as u64);
            Ok(())
        }
        Err(e) => skip_unless_io(e, metric),
    }
}

fn skip_unless_io(e: TelemetryError, metric: &'static str) -> Result<(), TelemetryError> {
    match e {
        TelemetryError::Io(_) => Err(e),
        other => {
            warn!(metric, error = %other, "skipping metric this tick");
            Ok(())
        }
    }
}
