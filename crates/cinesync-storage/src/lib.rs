//! External collaborators for the sync pipeline: dataset archive retrieval,
//! the gzipped TSV row source, and the catalog store contract.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use cinesync_core::{Header, RawRow, Work};
use flate2::read::GzDecoder;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cinesync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing archive: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ArchiveFetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ArchiveFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Downloads the source dataset archive to a date-stamped local path.
///
/// Archives land under `<dest_dir>/<YYYYMMDD>/<file name from url>`; a file
/// already present for the current day is reused without refetching. Writes
/// stream to a temp file and are published by atomic rename, so a crashed
/// download never leaves a partial archive at the final path.
#[derive(Debug)]
pub struct ArchiveFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl ArchiveFetcher {
    pub fn new(config: ArchiveFetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building http client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, FetchError> {
        let file_name = url.rsplit('/').next().unwrap_or("archive.bin");
        let stamp = Utc::now().format("%Y%m%d").to_string();
        let dest = dest_dir.join(stamp).join(file_name);

        if fs::try_exists(&dest).await? {
            info!(path = %dest.display(), "reusing archive downloaded earlier today");
            return Ok(dest);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut last_request_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            match self.try_download(url, &dest).await {
                Ok(()) => return Ok(dest),
                Err(FetchError::Request(err))
                    if classify_request_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    warn!(attempt, error = %err, "archive download failed, retrying");
                    last_request_error = Some(err);
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                }
                Err(FetchError::HttpStatus { status, url })
                    if classify_status(
                        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    ) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    warn!(attempt, status, "archive download rejected, retrying");
                    let _ = url;
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(match last_request_error {
            Some(err) => FetchError::Request(err),
            None => FetchError::HttpStatus {
                status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                url: url.to_string(),
            },
        })
    }

    async fn try_download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = dest
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;

        let write_result: Result<(), FetchError> = async {
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);

        match write_result {
            Ok(()) => {
                fs::rename(&temp_path, dest).await?;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
            }
        }
    }
}

/// Lazy, single-pass row source over a tab-separated dataset file, gzipped
/// or plain. The header row describes the columns; restarting means
/// reopening. Rows the reader cannot decode are skipped with a warning,
/// matching the row-level failure policy of the normalizer.
pub struct TsvRowSource {
    header: Arc<Header>,
    records: csv::StringRecordsIntoIter<Box<dyn Read + Send>>,
}

impl TsvRowSource {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening dataset {}", path.display()))?;
        let reader: Box<dyn Read + Send> =
            if path.extension().is_some_and(|ext| ext == "gz") {
                Box::new(GzDecoder::new(BufReader::new(file)))
            } else {
                Box::new(BufReader::new(file))
            };

        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .flexible(true)
            .has_headers(true)
            .from_reader(reader);

        let header = Arc::new(Header::new(
            csv_reader
                .headers()
                .with_context(|| format!("reading dataset header {}", path.display()))?
                .iter()
                .map(str::to_string),
        ));

        Ok(Self {
            header,
            records: csv_reader.into_records(),
        })
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }
}

impl Iterator for TsvRowSource {
    type Item = RawRow;

    fn next(&mut self) -> Option<RawRow> {
        loop {
            match self.records.next()? {
                Ok(record) => {
                    let values = record.iter().map(str::to_string).collect();
                    return Some(RawRow::new(self.header.clone(), values));
                }
                Err(err) => {
                    warn!(error = %err, "skipping unreadable dataset row");
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog read failed: {0}")]
    Read(String),
    #[error("catalog insert failed: {0}")]
    Insert(String),
    #[error("catalog delete failed: {0}")]
    Delete(String),
}

/// Bulk read/insert/delete contract the sync orchestrator drives. The store
/// enforces uniqueness of the `(title, year, runtime, genres)` tuple; the
/// pipeline's dedup exists to satisfy that constraint before insertion.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn read_all(&self) -> Result<Vec<Work>, CatalogError>;

    /// Insert the given works, returning how many were inserted. May fail
    /// partially; already-inserted works stay inserted.
    async fn bulk_insert(&self, works: &[Work]) -> Result<usize, CatalogError>;

    async fn delete(&self, work: &Work) -> Result<(), CatalogError>;
}

/// In-memory catalog used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    works: tokio::sync::Mutex<Vec<Work>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_works(works: Vec<Work>) -> Self {
        Self {
            works: tokio::sync::Mutex::new(works),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn read_all(&self) -> Result<Vec<Work>, CatalogError> {
        Ok(self.works.lock().await.clone())
    }

    async fn bulk_insert(&self, works: &[Work]) -> Result<usize, CatalogError> {
        let mut stored = self.works.lock().await;
        let mut inserted = 0usize;
        for work in works {
            if stored.iter().any(|existing| existing.same_key(work)) {
                return Err(CatalogError::Insert(format!(
                    "uniqueness violation for title {:?}",
                    work.title
                )));
            }
            stored.push(work.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn delete(&self, work: &Work) -> Result<(), CatalogError> {
        let mut stored = self.works.lock().await;
        let before = stored.len();
        stored.retain(|existing| !existing.same_key(work));
        if stored.len() == before {
            return Err(CatalogError::Delete(format!(
                "no catalog record for title {:?}",
                work.title
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    const FIXTURE: &str = "tconst\ttitleType\tprimaryTitle\toriginalTitle\tisAdult\tstartYear\tendYear\truntimeMinutes\tgenres\n\
        tt0000001\tmovie\tAlpha\tAlpha\t0\t2000\t\\N\t90\tDrama\n\
        tt0000002\ttvSeries\tSkipped\tSkipped\t0\t2001\t\\N\t30\tComedy\n\
        tt0000003\tmovie\tBeta\tBeta\t0\t1999\t\\N\t120\tComedy\n";

    #[test]
    fn reads_plain_tsv_rows_by_column_name() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("titles.tsv");
        std::fs::write(&path, FIXTURE).expect("writing fixture");

        let rows: Vec<RawRow> = TsvRowSource::open(&path).expect("opening fixture").collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("primaryTitle"), Some("Alpha"));
        assert_eq!(rows[1].get("titleType"), Some("tvSeries"));
        assert_eq!(rows[2].get("runtimeMinutes"), Some("120"));
        assert_eq!(rows[2].get("noSuchColumn"), None);
    }

    #[test]
    fn reads_gzipped_tsv_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("titles.tsv.gz");
        let file = std::fs::File::create(&path).expect("creating fixture");
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(FIXTURE.as_bytes()).expect("writing fixture");
        encoder.finish().expect("finishing gzip stream");

        let rows: Vec<RawRow> = TsvRowSource::open(&path).expect("opening fixture").collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("startYear"), Some("2000"));
    }

    fn work(title: &str) -> Work {
        Work {
            title: title.to_string(),
            year: Some(2000),
            runtime_minutes: Some(90),
            genres: "Drama".to_string(),
        }
    }

    #[tokio::test]
    async fn memory_catalog_enforces_key_uniqueness() {
        let catalog = MemoryCatalog::new();
        let inserted = catalog
            .bulk_insert(&[work("Alpha"), work("Beta")])
            .await
            .expect("first insert");
        assert_eq!(inserted, 2);

        let duplicate = Work {
            title: "alpha".to_string(),
            ..work("Alpha")
        };
        assert!(catalog.bulk_insert(&[duplicate]).await.is_err());
    }

    #[tokio::test]
    async fn memory_catalog_delete_reports_missing_records() {
        let catalog = MemoryCatalog::with_works(vec![work("Alpha")]);
        catalog.delete(&work("Alpha")).await.expect("delete existing");
        assert!(catalog.delete(&work("Alpha")).await.is_err());
        assert!(catalog.read_all().await.expect("read").is_empty());
    }

    #[test]
    fn backoff_delay_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn too_many_requests_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
