//! NDJSON log file for a single transfer or discovery run.
//!
//! Tracing is installed once per process and routes every event to the file
//! of the run currently open. Events emitted while no run is open are dropped.
//! Each event is formatted into its own buffer and appended to the file with a
//! single write, so concurrent workers never interleave partial lines and
//! never wait on each other while formatting.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_ENV: &str = "BLOBFERRY_LOG";
const LOG_DIR_ENV: &str = "BLOBFERRY_LOG_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Transfer,
    Discover,
}

impl RunKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "transfer" => Some(Self::Transfer),
            "discover" => Some(Self::Discover),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Discover => "discover",
        }
    }
}

/// Shared handle to the open run file; cloned into the fmt layer.
#[derive(Debug, Clone, Default)]
struct RunFileRouter {
    current: Arc<RwLock<Option<Arc<File>>>>,
}

impl RunFileRouter {
    fn attach(&self, file: File) -> std::io::Result<()> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a run log is already open",
            ));
        }
        *current = Some(Arc::new(file));
        Ok(())
    }

    fn detach(&self) -> Option<Arc<File>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn file(&self) -> Option<Arc<File>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One formatted event; appended to the run file when dropped.
struct EventLine {
    file: Option<Arc<File>>,
    buf: Vec<u8>,
}

impl Write for EventLine {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.file.is_some() {
            self.buf.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for EventLine {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            if !self.buf.is_empty() {
                let _ = (&**file).write_all(&self.buf);
            }
        }
    }
}

impl<'a> MakeWriter<'a> for RunFileRouter {
    type Writer = EventLine;

    fn make_writer(&'a self) -> Self::Writer {
        EventLine {
            file: self.file(),
            buf: Vec::new(),
        }
    }
}

static ROUTER: OnceLock<RunFileRouter> = OnceLock::new();

fn router() -> &'static RunFileRouter {
    ROUTER.get_or_init(|| {
        let router = RunFileRouter::default();
        let filter = env_filter_from(
            std::env::var(LOG_ENV).ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(router.clone());
        // Another global subscriber may already be set (tests, embedding apps).
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .try_init();
        router
    })
}

fn env_filter_from(app_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let fallback = || EnvFilter::new("info");
    app_log
        .or(rust_log)
        .map(|v| EnvFilter::try_new(v).unwrap_or_else(|_| fallback()))
        .unwrap_or_else(fallback)
}

/// Keeps the run log open; syncs it to disk on drop.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(file) = router().detach() {
            let _ = file.sync_all();
        }
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("logs"))
}

/// Opens `run-<kind>-<utc>-<run_id>.ndjson` in the log dir and routes all
/// tracing events to it until the guard drops. Only one run log is open at a
/// time.
pub fn start_run_log(kind: &str, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    let kind = RunKind::parse(kind).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported run kind: {kind}"),
        )
    })?;

    let dir = log_dir(data_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!(
        "run-{}-{}-{}.ndjson",
        kind.as_str(),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        file_safe(run_id)
    ));

    let file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)?;
    router().attach(file)?;
    Ok(RunLogGuard { path })
}

fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
