use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Deserialize;
use tracing_subscriber::{
    filter::LevelFilter, fmt, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
    EnvFilter,
};

use crate::settings::Settings;

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// rotation threshold; 0 disables rotation
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

fn default_level() -> String {
    "info".to_owned()
}

fn default_log_dir() -> String {
    "logs".to_owned()
}

fn default_log_file() -> String {
    "foghorn.log".to_owned()
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_backup_count() -> usize {
    5
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            max_bytes: default_max_bytes(),
            backup_count: default_backup_count(),
        }
    }
}

impl LogSettings {
    pub fn global() -> &'static Self {
        &Settings::global().log
    }
}

pub fn setup_logging() -> Result<()> {
    let settings = LogSettings::global();
    let level =
        tracing::Level::from_str(settings.level.as_str()).unwrap_or(tracing::Level::INFO);

    let filter_layer = EnvFilter::default()
        .add_directive(LevelFilter::from_level(level).into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    let file_writer = RotatingWriter::open(
        &settings.log_dir,
        &settings.log_file,
        settings.max_bytes,
        settings.backup_count,
    )?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(())
}

/// Size-based rotating log sink: when the active file would grow past
/// `max_bytes` it is renamed to `<file>.1` (shifting older backups up) and a
/// fresh file is opened. `backup_count` bounds how many renamed files stay
/// around; 0 disables rotation entirely.
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    file: File,
    written: u64,
}

impl RotatingWriter {
    pub fn open(
        dir: impl AsRef<Path>,
        file_name: &str,
        max_bytes: u64,
        backup_count: usize,
    ) -> io::Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(file_name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFile {
                path,
                max_bytes,
                backup_count,
                file,
                written,
            })),
        })
    }
}

impl RotatingFile {
    fn backup_path(&self, index: usize) -> PathBuf {
        PathBuf::from(format!("{}.{index}", self.path.display()))
    }

    fn rollover(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for index in (1..self.backup_count).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                let _ = fs::rename(&from, self.backup_path(index + 1));
            }
        }
        let _ = fs::rename(&self.path, self.backup_path(1));
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let overflows = self.max_bytes > 0
            && self.backup_count > 0
            && self.written > 0
            && self.written + buf.len() as u64 > self.max_bytes;
        if overflows {
            self.rollover()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.file.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
