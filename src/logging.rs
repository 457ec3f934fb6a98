use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

use crate::platform::{NativePlatform, Platform};

pub(crate) const LOG_ENV: &str = "GRASSBOT_LOG";

/// Appends every log line to the bot's log file and optionally echoes it
/// to stdout.
#[derive(Clone)]
pub(crate) struct TeeMakeWriter {
    pub file: Arc<Mutex<File>>,
    pub echo_stdout: bool,
}

impl TeeMakeWriter {
    pub fn open(path: &Path, echo_stdout: bool) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        NativePlatform::restrict_file_permissions(path);
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            echo_stdout,
        })
    }
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.clone(),
            echo_stdout: self.echo_stdout,
        }
    }
}

pub(crate) struct TeeWriter {
    file: Arc<Mutex<File>>,
    echo_stdout: bool,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut file) = self.file.lock() {
            file.write_all(buf)?;
        }
        if self.echo_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut file) = self.file.lock() {
            file.flush()?;
        }
        if self.echo_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. INFO by default; `GRASSBOT_LOG` takes an
/// `EnvFilter` directive such as `grassbot=debug`.
pub(crate) fn init(log_file: &Path, echo_stdout: bool) -> std::io::Result<()> {
    let make_writer = TeeMakeWriter::open(log_file, echo_stdout)?;
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // Already set in tests
    Ok(())
}
