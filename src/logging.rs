//! Process-wide structured logging (§9 Design Note "global logger"): one
//! `tracing` subscriber installed once at startup. Every module just calls
//! `tracing::info!`/`warn!`/`error!`; no logger handle is threaded through
//! constructors. Log persistence/rotation to disk is an out-of-scope
//! external collaborator (§1) — the only sink shipped here is stderr,
//! which also keeps stdout clean for anything that might need it.

use std::io;
use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub trait LogSink: Send + Sync {
    fn writer(&self) -> Box<dyn io::Write + Send>;
}

#[derive(Default)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn writer(&self) -> Box<dyn io::Write + Send> {
        Box::new(io::stderr())
    }
}

/// Installs the global subscriber. Idempotent: only the first call takes
/// effect, so tests and the real binary can share this without racing to
/// install a subscriber twice.
pub fn init(log_level: &str, sink: Arc<dyn LogSink>) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
        let make_writer = move || sink.writer();
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(make_writer)
            .with_ansi(false)
            .init();
    });
}
