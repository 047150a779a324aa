//! FTP access to the upstream feed
//!
//! suppaftp is a blocking client, so every operation runs on the
//! blocking pool with bounded retries. All sessions use Extended
//! Passive Mode for NAT/Docker compatibility.

use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use suppaftp::FtpStream;
use tracing::{debug, info, warn};

use odp_common::{OdpError, Result};

use crate::config::SourceConfig;

/// Maximum number of retry attempts for FTP operations
pub const MAX_RETRIES: u32 = 3;

/// Base delay between retry attempts, multiplied by the attempt number
pub const RETRY_DELAY_SECS: u64 = 5;

/// Archive bytes plus the server-reported modification time
pub struct DownloadResult {
    pub data: Vec<u8>,
    /// MDTM timestamp, when the server supports it
    pub modified: Option<DateTime<Utc>>,
}

/// FTP client with retry logic
pub struct FtpClient {
    config: SourceConfig,
}

impl FtpClient {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    /// Download the snapshot archive
    pub async fn fetch_archive(&self) -> Result<DownloadResult> {
        self.with_retries("download", |config| {
            let mut ftp = Self::open_session(config)?;
            let modified = Self::mdtm(&mut ftp, &config.archive_name);
            debug!(file = %config.archive_name, "downloading archive");
            let mut reader = ftp.retr_as_buffer(&config.archive_name).map_err(|e| {
                OdpError::SourceUnavailable(format!(
                    "failed to download {}: {e}",
                    config.archive_name
                ))
            })?;
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .map_err(|e| OdpError::SourceUnavailable(format!("failed to read archive: {e}")))?;
            Self::close_session(ftp);

            info!(
                file = %config.archive_name,
                bytes = data.len(),
                "downloaded snapshot archive"
            );
            Ok(DownloadResult { data, modified })
        })
        .await
    }

    /// Modification time of the snapshot archive, without downloading it
    pub async fn modified_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_retries("mdtm", |config| {
            let mut ftp = Self::open_session(config)?;
            let modified = Self::mdtm(&mut ftp, &config.archive_name);
            Self::close_session(ftp);
            Ok(modified)
        })
        .await
    }

    async fn with_retries<T, F>(&self, op: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&SourceConfig) -> Result<T> + Clone + Send + 'static,
    {
        for attempt in 1..=MAX_RETRIES {
            debug!(op, attempt, max = MAX_RETRIES, host = %self.config.host, "ftp attempt");

            let config = self.config.clone();
            let f = f.clone();
            match tokio::task::spawn_blocking(move || f(&config)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    if attempt < MAX_RETRIES {
                        let delay = RETRY_DELAY_SECS * attempt as u64;
                        warn!(op, attempt, %e, delay_secs = delay, "ftp attempt failed, retrying");
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    } else {
                        return Err(OdpError::SourceUnavailable(format!(
                            "{op} failed after {MAX_RETRIES} attempts: {e}"
                        )));
                    }
                }
                Err(e) => {
                    return Err(OdpError::SourceUnavailable(format!("ftp task panicked: {e}")));
                }
            }
        }

        unreachable!("retry loop always returns")
    }

    fn open_session(config: &SourceConfig) -> Result<FtpStream> {
        debug!(host = %config.host, port = config.port, "connecting to ftp server");
        let mut ftp = FtpStream::connect(format!("{}:{}", config.host, config.port))
            .map_err(|e| OdpError::SourceUnavailable(format!("ftp connect failed: {e}")))?;

        ftp.set_mode(suppaftp::Mode::ExtendedPassive);
        ftp.login(&config.username, &config.password)
            .map_err(|e| OdpError::SourceUnavailable(format!("ftp login failed: {e}")))?;
        ftp.transfer_type(suppaftp::types::FileType::Binary)
            .map_err(|e| OdpError::SourceUnavailable(format!("binary mode failed: {e}")))?;
        ftp.cwd(&config.remote_dir).map_err(|e| {
            OdpError::SourceUnavailable(format!("cwd {} failed: {e}", config.remote_dir))
        })?;
        Ok(ftp)
    }

    fn mdtm(ftp: &mut FtpStream, file: &str) -> Option<DateTime<Utc>> {
        // MDTM is optional; servers that lack it just force a download.
        ftp.mdtm(file).ok().map(|naive| naive.and_utc())
    }

    fn close_session(mut ftp: FtpStream) {
        if let Err(e) = ftp.quit() {
            warn!("failed to quit ftp session gracefully: {}", e);
        }
    }
}
