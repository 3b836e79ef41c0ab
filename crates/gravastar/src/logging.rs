use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Layer, Registry};

use crate::config::LogLevel;
use crate::rotate::RotatingFile;

pub const CONTROLLER_LOG_NAME: &str = "controller.log";

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Runtime control over the process-wide log level.
pub struct LogLevelHandle {
    handle: reload::Handle<LevelFilter, Registry>,
}

impl LogLevelHandle {
    pub fn set(&self, level: LogLevel) {
        if let Err(e) = self.handle.modify(|filter| *filter = level.into()) {
            eprintln!("failed to update the log level: {}", e);
        }
    }
}

/// The controller log sink: a rotating file shared by every subscriber
/// thread. Line breaks inside messages are flattened to spaces so that one
/// event always stays one line.
#[derive(Clone)]
pub struct ControllerSink {
    file: Arc<Mutex<RotatingFile>>,
}

impl ControllerSink {
    pub fn new(dir: &Path, max_bytes: u64) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log dir {}", dir.display()))?;
        Ok(ControllerSink {
            file: Arc::new(Mutex::new(RotatingFile::new(dir, CONTROLLER_LOG_NAME, max_bytes))),
        })
    }
}

impl io::Write for ControllerSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sanitized = buf.to_vec();
        let keep_trailing_newline = sanitized.last() == Some(&b'\n');
        let payload_len = sanitized.len() - keep_trailing_newline as usize;
        for byte in &mut sanitized[..payload_len] {
            if *byte == b'\n' || *byte == b'\r' {
                *byte = b' ';
            }
        }

        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned controller log lock"))?;
        file.write_bytes(&sanitized)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ControllerSink {
    type Writer = ControllerSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Installs the global subscriber: a reloadable level filter in front of a
/// single fmt layer. The layer writes to `controller.log` in `log_dir`, or
/// falls back to stderr when the directory cannot be created.
pub fn setup_logging(log_dir: &Path, max_bytes: u64) -> anyhow::Result<LogLevelHandle> {
    let (filter, handle) = reload::Layer::new(LevelFilter::DEBUG);

    let file_layer = match ControllerSink::new(log_dir, max_bytes) {
        Ok(sink) => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(sink)
            .boxed(),
        Err(e) => {
            eprintln!("controller log disabled, falling back to stderr: {:#}", e);
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(io::stderr)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .context("failed to initialize the tracing subscriber")?;

    Ok(LogLevelHandle { handle })
}
