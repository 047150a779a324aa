//! Snapshot source: FTP fetch plus archive unpacking
//!
//! A snapshot is a single zip archive containing one CSV file per
//! table. The archive's MDTM timestamp identifies the dataset version;
//! unknown files inside the archive are ignored.

pub mod ftp;

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use odp_common::{OdpError, RawFileDescriptor, Result, TableKind};

use crate::config::{PipelineConfig, SourceConfig};

pub use ftp::{DownloadResult, FtpClient};

/// One fetched and unpacked dataset version
pub struct Snapshot {
    pub version: odp_common::DatasetVersion,
    /// Whitelisted table files, extracted into the work directory
    pub files: Vec<RawFileDescriptor>,
}

/// Upstream feed handle used by the connector stage and the scheduler
pub struct FeedSource {
    config: SourceConfig,
    client: FtpClient,
    work_dir: PathBuf,
}

impl FeedSource {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            config: config.source.clone(),
            client: FtpClient::new(config.source.clone()),
            work_dir: config.work_dir.clone(),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.config.dataset
    }

    /// Publication time of the current upstream snapshot
    pub async fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        self.client.modified_time().await
    }

    /// Download and unpack the current snapshot
    pub async fn fetch_snapshot(&self) -> Result<Snapshot> {
        let download = self.client.fetch_archive().await?;
        // Servers without MDTM get a wall-clock version; it still orders
        // correctly against previously imported MDTM stamps.
        let last_modified = download.modified.unwrap_or_else(Utc::now);
        let version = odp_common::DatasetVersion::new(&self.config.dataset, last_modified);

        let out_dir = self.work_dir.join(version.id());
        let files = unpack_snapshot(&download.data, &out_dir, last_modified)?;

        info!(
            version = %version,
            tables = files.len(),
            "unpacked snapshot"
        );
        Ok(Snapshot { version, files })
    }
}

/// Extract whitelisted table files from a zip archive into `out_dir`
///
/// Entries whose names do not match the table registry are skipped.
/// Entry timestamps fall back to `default_mtime` when the zip header
/// carries none that chrono accepts.
pub fn unpack_snapshot(
    archive: &[u8],
    out_dir: &Path,
    default_mtime: DateTime<Utc>,
) -> Result<Vec<RawFileDescriptor>> {
    let mut zip = ZipArchive::new(Cursor::new(archive))
        .map_err(|e| OdpError::SourceUnavailable(format!("snapshot archive unreadable: {e}")))?;

    fs::create_dir_all(out_dir)?;

    let mut files = Vec::new();
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| OdpError::SourceUnavailable(format!("bad archive entry: {e}")))?;
        if entry.is_dir() {
            continue;
        }

        let file_name = match Path::new(entry.name()).file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let Some(table) = TableKind::from_file_name(&file_name) else {
            debug!(file = %file_name, "skipping non-whitelisted archive entry");
            continue;
        };

        let path = out_dir.join(&file_name);
        let mut out = fs::File::create(&path)?;
        std::io::copy(&mut entry, &mut out)?;

        let mtime = entry_mtime(&entry).unwrap_or(default_mtime);
        files.push(RawFileDescriptor { table, path, mtime });
    }

    if files.is_empty() {
        warn!("snapshot archive contained no whitelisted table files");
    }
    Ok(files)
}

fn entry_mtime(entry: &zip::read::ZipFile<'_>) -> Option<DateTime<Utc>> {
    let dt = entry.last_modified();
    Utc.with_ymd_and_hms(
        dt.year() as i32,
        dt.month() as u32,
        dt.day() as u32,
        dt.hour() as u32,
        dt.minute() as u32,
        dt.second() as u32,
    )
    .single()
}
