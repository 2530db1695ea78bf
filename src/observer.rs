//! Observer contracts (C7): a structured per-request log line with
//! size-based file rotation, and an in-process metrics counter exposing the
//! snapshot fields described below.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;

use crate::config::{LOG_ROTATE_BACKUPS, LOG_ROTATE_MAX_BYTES};

/// `action` field of a log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Cached,
    Allowed,
    Blocked,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Cached => "CACHED",
            Action::Allowed => "ALLOWED",
            Action::Blocked => "BLOCKED",
        }
    }
}

/// Emits the one structured event per request. Blocked
/// events log at `warn`; everything else logs at `info`.
pub fn log_request(
    client_addr: &str,
    host: &str,
    port: u16,
    request_line: &str,
    action: Action,
    status_code: u16,
    bytes_transferred: usize,
) {
    let action_str = action.as_str();
    if action == Action::Blocked {
        warn!(
            client = %client_addr,
            origin = %format!("{host}:{port}"),
            request = %request_line,
            action = action_str,
            status = status_code,
            bytes = bytes_transferred,
            "{client_addr} | {host}:{port} | \"{request_line}\" | {action_str} | {status_code} | {bytes_transferred} bytes"
        );
    } else {
        info!(
            client = %client_addr,
            origin = %format!("{host}:{port}"),
            request = %request_line,
            action = action_str,
            status = status_code,
            bytes = bytes_transferred,
            "{client_addr} | {host}:{port} | \"{request_line}\" | {action_str} | {status_code} | {bytes_transferred} bytes"
        );
    }
}

/// A `Write` sink that rotates the underlying file once it crosses
/// `max_bytes`, keeping up to `backups` numbered copies — the same
/// backup-count semantics as `logging.handlers.RotatingFileHandler` in the
/// reference implementation, ported as a small manual `io::Write`.
pub struct RotatingFile {
    inner: Mutex<RotatingFileInner>,
}

struct RotatingFileInner {
    path: PathBuf,
    file: File,
    size: u64,
    max_bytes: u64,
    backups: u32,
}

impl RotatingFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::with_limits(path, LOG_ROTATE_MAX_BYTES, LOG_ROTATE_BACKUPS)
    }

    pub fn with_limits(path: impl AsRef<Path>, max_bytes: u64, backups: u32) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(RotatingFileInner {
                path,
                file,
                size,
                max_bytes,
                backups,
            }),
        })
    }
}

impl RotatingFileInner {
    fn rotate(&mut self) -> io::Result<()> {
        // proxy.log.(n-1) -> proxy.log.n, ..., proxy.log -> proxy.log.1
        for i in (1..self.backups).rev() {
            let src = backup_path(&self.path, i);
            let dst = backup_path(&self.path, i + 1);
            if src.exists() {
                let _ = fs::rename(&src, &dst);
            }
        }
        if self.backups > 0 {
            let dst = backup_path(&self.path, 1);
            let _ = fs::rename(&self.path, &dst);
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

fn backup_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        if inner.max_bytes > 0 && inner.size + buf.len() as u64 > inner.max_bytes {
            inner.rotate()?;
        }
        let n = inner.file.write(buf)?;
        inner.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

impl Write for &RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        if inner.max_bytes > 0 && inner.size + buf.len() as u64 > inner.max_bytes {
            inner.rotate()?;
        }
        let n = inner.file.write(buf)?;
        inner.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFile {
    type Writer = &'a RotatingFile;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

/// Per-host request counters, a 300s sliding window, total/blocked totals,
/// and process uptime — the fields exposed via `summary()`.
pub struct Metrics {
    inner: Mutex<MetricsInner>,
    started_at: Instant,
}

struct MetricsInner {
    total_requests: u64,
    blocked_requests: u64,
    host_counts: HashMap<String, u64>,
    request_times: VecDeque<Instant>,
}

#[derive(Clone, Debug)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub allowed_requests: u64,
    pub requests_per_minute: u64,
    pub top_hosts: Vec<(String, u64)>,
}

const SLIDING_WINDOW: Duration = Duration::from_secs(300);

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                total_requests: 0,
                blocked_requests: 0,
                host_counts: HashMap::new(),
                request_times: VecDeque::new(),
            }),
            started_at: Instant::now(),
        }
    }

    pub fn record_request(&self, host: &str, blocked: bool) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        if blocked {
            inner.blocked_requests += 1;
        }
        *inner.host_counts.entry(host.to_string()).or_insert(0) += 1;

        let now = Instant::now();
        inner.request_times.push_back(now);
        let cutoff = now.checked_sub(SLIDING_WINDOW).unwrap_or(now);
        while matches!(inner.request_times.front(), Some(t) if *t < cutoff) {
            inner.request_times.pop_front();
        }
    }

    pub fn requests_in_last_60s(&self) -> u64 {
        let inner = self.inner.lock();
        let cutoff = Instant::now()
            .checked_sub(Duration::from_secs(60))
            .unwrap_or_else(Instant::now);
        inner.request_times.iter().filter(|t| **t >= cutoff).count() as u64
    }

    pub fn top_hosts(&self, n: usize) -> Vec<(String, u64)> {
        let inner = self.inner.lock();
        let mut hosts: Vec<(String, u64)> = inner
            .host_counts
            .iter()
            .map(|(h, c)| (h.clone(), *c))
            .collect();
        hosts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hosts.truncate(n);
        hosts
    }

    pub fn summary(&self) -> MetricsSummary {
        let (total, blocked) = {
            let inner = self.inner.lock();
            (inner.total_requests, inner.blocked_requests)
        };
        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            total_requests: total,
            blocked_requests: blocked,
            allowed_requests: total - blocked,
            requests_per_minute: self.requests_in_last_60s(),
            top_hosts: self.top_hosts(5),
        }
    }
}
