use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use flate2::write::GzEncoder;
use flate2::Compression;

pub const DEFAULT_MAX_LOG_BYTES: u64 = 100 * 1024 * 1024;

/// How many rotated `.gz` archives are kept per stream.
const MAX_ROTATED_FILES: usize = 10;

/// An append-only log file that rotates itself away once it grows past
/// `max_bytes`: the full file is renamed to `<epoch>_<name>`, compressed to
/// `.gz`, and the base name is reopened. Old archives beyond the retention
/// cap are deleted oldest-first.
pub struct RotatingFile {
    dir: PathBuf,
    name: String,
    path: PathBuf,
    max_bytes: u64,
    file: Option<File>,
}

impl RotatingFile {
    pub fn new(dir: &Path, name: &str, max_bytes: u64) -> Self {
        RotatingFile {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            path: dir.join(name),
            max_bytes,
            file: None,
        }
    }

    pub fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write_bytes(&data)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.rotate_if_needed()?;
        self.ensure_open()?;
        let file = self.file.as_mut().context("bug: log file should be open")?;
        file.write_all(data)
            .with_context(|| format!("error while writing to {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("error while flushing {}", self.path.display()))?;
        Ok(())
    }

    fn ensure_open(&mut self) -> anyhow::Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("failed to open log file {}", self.path.display()))?;
            self.file = Some(file);
        }
        Ok(())
    }

    fn rotate_if_needed(&mut self) -> anyhow::Result<()> {
        let Ok(metadata) = fs::metadata(&self.path) else {
            // Nothing to rotate yet
            return Ok(());
        };
        if metadata.len() < self.max_bytes {
            return Ok(());
        }

        self.file = None;
        let rotated = self.unique_rotated_name();
        fs::rename(&self.path, &rotated)
            .with_context(|| format!("failed to rotate log file {}", self.path.display()))?;
        if let Err(e) = compress_file(&rotated) {
            tracing::warn!(path = ?rotated, "failed to compress a rotated log file: {:#}", e);
        }
        self.cleanup_rotated();
        Ok(())
    }

    /// `<epoch>_<name>`, with a numeric infix when that name is taken
    /// (several rotations within the same second).
    fn unique_rotated_name(&self) -> PathBuf {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let candidate = self.dir.join(format!("{}_{}", epoch, self.name));
        if !candidate.exists() && !with_gz_suffix(&candidate).exists() {
            return candidate;
        }
        for n in 1..1000 {
            let alternative = self.dir.join(format!("{}_{}_{}", epoch, n, self.name));
            if !alternative.exists() && !with_gz_suffix(&alternative).exists() {
                return alternative;
            }
        }
        candidate
    }

    fn cleanup_rotated(&self) {
        let suffix = format!("_{}.gz", self.name);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };

        let mut archives: Vec<(u64, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if !file_name.ends_with(&suffix) {
                    return None;
                }
                let epoch: u64 = file_name.split('_').next()?.parse().ok()?;
                Some((epoch, entry.path()))
            })
            .collect();

        if archives.len() <= MAX_ROTATED_FILES {
            return;
        }
        archives.sort();
        for (_, path) in &archives[..archives.len() - MAX_ROTATED_FILES] {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = ?path, "failed to delete an old rotated log file: {}", e);
            }
        }
    }
}

fn with_gz_suffix(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".gz");
    PathBuf::from(os)
}

fn compress_file(path: &Path) -> anyhow::Result<()> {
    let input = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let gz_path = with_gz_suffix(path);
    let output = File::create(&gz_path).with_context(|| format!("failed to create {}", gz_path.display()))?;

    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    io::copy(&mut BufReader::new(input), &mut encoder).context("compression error")?;
    encoder.finish().context("compression error")?;

    fs::remove_file(path).with_context(|| format!("failed to delete {}", path.display()))?;
    Ok(())
}
