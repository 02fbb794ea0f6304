use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::fetch::WorkingCopy;

/// `<name>-YYYY-MM-DD.zip`
pub fn archive_file_name(name: &str, date: NaiveDate) -> String {
    format!("{}-{}.zip", name, date.format("%Y-%m-%d"))
}

/// Packs working copies into dated zip files
#[derive(Debug, Clone)]
pub struct Archiver {
    compression_level: i64,
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new(9)
    }
}

impl Archiver {
    pub fn new(compression_level: i64) -> Self {
        Self {
            compression_level: compression_level.clamp(0, 9),
        }
    }

    /// Zip `copy` into `out_dir` under today's UTC date, replacing any file of the same name
    pub async fn archive(&self, name: &str, copy: &WorkingCopy, out_dir: &Path) -> Result<PathBuf> {
        let target = out_dir.join(archive_file_name(name, Utc::now().date_naive()));
        let source = copy.path.clone();
        let level = self.compression_level;

        let dest = target.clone();
        let entries = tokio::task::spawn_blocking(move || write_zip(&source, &dest, level))
            .await
            .context("Archive task panicked")??;

        info!("Archived {} entries into {}", entries, target.display());
        Ok(target)
    }
}

/// Write every entry under `source` (relative paths, `/` separators) into `dest`
pub fn write_zip(source: &Path, dest: &Path, level: i64) -> Result<usize> {
    let file = File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let base = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(level));

    let mut count = 0usize;
    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name().min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("Walked outside the working copy")?;
        let name = entry_name(relative)?;

        let metadata = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        let options = match unix_mode(&metadata) {
            Some(mode) => base.unix_permissions(mode),
            None => base,
        };

        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            writer.add_symlink(name, target.to_string_lossy().into_owned(), options)?;
        } else if file_type.is_dir() {
            writer.add_directory(format!("{}/", name), options)?;
        } else {
            writer.start_file(name, options)?;
            let mut input = File::open(entry.path())
                .with_context(|| format!("Failed to open {}", entry.path().display()))?;
            std::io::copy(&mut input, &mut writer)?;
        }
        count += 1;
    }

    let mut inner = writer.finish().context("Failed to finalize archive")?;
    inner.flush()?;
    debug!("Wrote {} ({} entries)", dest.display(), count);
    Ok(count)
}

fn entry_name(relative: &Path) -> Result<String> {
    let parts = relative
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .ok_or_else(|| anyhow!("Non UTF-8 path: {}", relative.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn unix_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

/// Unpack a zip archive into `dest` on the blocking pool
pub async fn extract(archive: PathBuf, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = File::open(&archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;
        let mut zip = ZipArchive::new(file).context("Not a valid zip archive")?;
        zip.extract(&dest)
            .with_context(|| format!("Failed to extract into {}", dest.display()))?;
        Ok(())
    })
    .await
    .context("Extract task panicked")?
}
