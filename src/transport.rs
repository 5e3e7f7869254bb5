use crate::config::Config;
use crate::error::UpdaterError;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Runtime;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const STALL_TIMEOUT: Duration = Duration::from_secs(120);
const DELAY_MULTIPLIER: u64 = 2;
const MAX_DELAY: u64 = 60;
/// Upper bound on in-flight requests in one batch.
const MAX_PARALLEL: usize = 8;

/// Transfer failure, classified so callers and the retry loop can tell
/// permanent conditions from transient ones.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("server rejected the range request")]
    Range,
    #[error("transfer ended early")]
    Partial,
    #[error("timed out fetching {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("local write error: {0}")]
    LocalIo(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub dest: PathBuf,
}

/// Content fetch interface the core is written against.
///
/// `get` performs a single transfer with the retry policy applied; `get_batch`
/// fans a set of transfers out concurrently and returns when the whole batch
/// has settled. Implementations own connection lifecycle.
pub trait Transport {
    fn get(&self, url: &str, dest: &Path) -> Result<(), TransportError>;

    fn get_batch(&self, jobs: Vec<DownloadJob>) -> Vec<(DownloadJob, Result<(), TransportError>)>;
}

/// Pick a transport for the configured content URL. `file://` endpoints are
/// served straight from the local filesystem, which the test suites use as
/// an offline content server.
pub fn create_transport(config: &Config) -> Result<Box<dyn Transport>, UpdaterError> {
    let url = Url::parse(&config.content_url)
        .map_err(|err| UpdaterError::InvalidOption(format!("invalid content URL: {err}")))?;
    if url.scheme() == "file" {
        Ok(Box::new(FileTransport))
    } else {
        Ok(Box::new(HttpTransport::new(config)?))
    }
}

enum Retry {
    No,
    Now,
    Delayed,
}

/// HTTP(S) transport over a shared blocking client, with bounded retries,
/// exponential backoff and range-resume of interrupted transfers.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    identity_pem: Option<Vec<u8>>,
    max_retries: u32,
    retry_delay: u64,
    /// Once a server rejects a range request, resume stays off for the rest
    /// of the session.
    resume_disabled: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, UpdaterError> {
        let mut identity_pem = None;
        let cert_path = config.cert_path();
        if cert_path.exists() {
            let pem = fs::read(&cert_path).map_err(|_| UpdaterError::BadCert(cert_path.clone()))?;
            // fail early on an unusable certificate
            reqwest::Identity::from_pem(&pem).map_err(|_| UpdaterError::BadCert(cert_path.clone()))?;
            identity_pem = Some(pem);
        }

        let client = blocking_client(identity_pem.as_deref())?;

        Ok(Self {
            client,
            identity_pem,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            resume_disabled: AtomicBool::new(false),
        })
    }

    fn try_get(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        let temp = partial_path(dest);

        let mut request = self.client.get(url);
        let mut resume_from = 0u64;
        if !self.resume_disabled.load(Ordering::Relaxed) {
            if let Ok(meta) = fs::metadata(&temp) {
                if meta.len() > 0 {
                    resume_from = meta.len();
                    request = request.header(RANGE, format!("bytes={resume_from}-"));
                }
            }
        }

        let mut response = request.send().map_err(classify_send_error(url))?;

        let append = match response.status() {
            StatusCode::OK => false,
            StatusCode::PARTIAL_CONTENT => resume_from > 0,
            StatusCode::NOT_FOUND => return Err(TransportError::NotFound(url.to_string())),
            StatusCode::FORBIDDEN => return Err(TransportError::Forbidden(url.to_string())),
            StatusCode::RANGE_NOT_SATISFIABLE => {
                fs::remove_file(&temp).ok();
                return Err(TransportError::Range);
            }
            status => {
                return Err(TransportError::Network(format!("{url} returned {status}")))
            }
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = if append {
            OpenOptions::new().append(true).open(&temp)?
        } else {
            File::create(&temp)?
        };

        // Copy by hand so a failed read (network) and a failed write (disk)
        // classify differently.
        let mut buffer = [0u8; 8192];
        loop {
            let read = match response.read(&mut buffer) {
                Ok(read) => read,
                Err(err) => {
                    tracing::debug!(url, error = %err, "transfer interrupted");
                    return Err(TransportError::Partial);
                }
            };
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])?;
        }
        file.flush()?;
        drop(file);

        fs::rename(&temp, dest)?;
        Ok(())
    }

    fn classify(&self, error: &TransportError) -> Retry {
        match error {
            TransportError::NotFound(_)
            | TransportError::Forbidden(_)
            | TransportError::LocalIo(_) => Retry::No,
            TransportError::Partial => Retry::Now,
            TransportError::Range => {
                self.resume_disabled.store(true, Ordering::Relaxed);
                Retry::Now
            }
            TransportError::Timeout(_) | TransportError::Network(_) => Retry::Delayed,
        }
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        let mut attempt = 0u32;
        let mut delay = self.retry_delay;

        loop {
            let error = match self.try_get(url, dest) {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            attempt += 1;
            match self.classify(&error) {
                Retry::No => return Err(error),
                Retry::Now | Retry::Delayed if attempt > self.max_retries => return Err(error),
                Retry::Now => {
                    tracing::debug!(url, attempt, "retrying immediately");
                }
                Retry::Delayed => {
                    tracing::debug!(url, attempt, delay, "retrying after backoff");
                    std::thread::sleep(Duration::from_secs(delay));
                    delay = (delay * DELAY_MULTIPLIER).min(MAX_DELAY);
                }
            }
        }
    }

    fn get_batch(&self, jobs: Vec<DownloadJob>) -> Vec<(DownloadJob, Result<(), TransportError>)> {
        let runtime = match Runtime::new() {
            Ok(runtime) => runtime,
            Err(err) => {
                return jobs
                    .into_iter()
                    .map(|job| {
                        let error = TransportError::Network(format!("runtime: {err}"));
                        (job, Err(error))
                    })
                    .collect()
            }
        };

        runtime.block_on(async {
            let client = match async_client(self.identity_pem.as_deref()) {
                Ok(client) => client,
                Err(err) => {
                    return jobs
                        .into_iter()
                        .map(|job| {
                            let error = TransportError::Network(format!("client: {err}"));
                            (job, Err(error))
                        })
                        .collect()
                }
            };

            let mut results = Vec::with_capacity(jobs.len());
            for chunk in jobs.chunks(MAX_PARALLEL) {
                let mut handles = Vec::with_capacity(chunk.len());
                for job in chunk {
                    let client = client.clone();
                    let job = job.clone();
                    handles.push((
                        job.clone(),
                        tokio::spawn(async move { fetch_once(&client, &job).await }),
                    ));
                }
                for (job, handle) in handles {
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(err) => Err(TransportError::Network(format!("task failed: {err}"))),
                    };
                    results.push((job, result));
                }
            }
            results
        })
    }
}

async fn fetch_once(client: &reqwest::Client, job: &DownloadJob) -> Result<(), TransportError> {
    let response = client
        .get(&job.url)
        .send()
        .await
        .map_err(classify_send_error(&job.url))?;

    match response.status() {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND => return Err(TransportError::NotFound(job.url.clone())),
        StatusCode::FORBIDDEN => return Err(TransportError::Forbidden(job.url.clone())),
        status => return Err(TransportError::Network(format!("{} returned {status}", job.url))),
    }

    let body = response.bytes().await.map_err(|err| {
        if err.is_timeout() {
            TransportError::Timeout(job.url.clone())
        } else {
            TransportError::Partial
        }
    })?;

    if let Some(parent) = job.dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = partial_path(&job.dest);
    fs::write(&temp, &body)?;
    fs::rename(&temp, &job.dest)?;
    Ok(())
}

fn blocking_client(identity_pem: Option<&[u8]>) -> Result<reqwest::blocking::Client, UpdaterError> {
    let mut builder = reqwest::blocking::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(STALL_TIMEOUT);
    if let Some(pem) = identity_pem {
        let identity = reqwest::Identity::from_pem(pem)
            .map_err(|err| UpdaterError::Unexpected(format!("client identity: {err}")))?;
        builder = builder.identity(identity);
    }
    builder
        .build()
        .map_err(|err| UpdaterError::Unexpected(format!("failed to build HTTP client: {err}")))
}

fn async_client(identity_pem: Option<&[u8]>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(STALL_TIMEOUT);
    if let Some(pem) = identity_pem {
        builder = builder.identity(reqwest::Identity::from_pem(pem)?);
    }
    builder.build()
}

fn classify_send_error(url: &str) -> impl Fn(reqwest::Error) -> TransportError + '_ {
    move |err| {
        if err.is_timeout() {
            TransportError::Timeout(url.to_string())
        } else {
            TransportError::Network(format!("{url}: {err}"))
        }
    }
}

/// In-flight transfers land next to their destination under a `.download`
/// suffix and are renamed into place once complete.
fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{name}.download"))
}

/// Serves `file://` content URLs from the local filesystem. Used for mirror
/// directories and as the offline content server in tests.
pub struct FileTransport;

impl FileTransport {
    fn source_path(url: &str) -> Result<PathBuf, TransportError> {
        Url::parse(url)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| TransportError::Network(format!("bad file URL: {url}")))
    }
}

impl Transport for FileTransport {
    fn get(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        let source = Self::source_path(url)?;
        if !source.is_file() {
            return Err(TransportError::NotFound(url.to_string()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = partial_path(dest);
        fs::copy(&source, &temp)?;
        fs::rename(&temp, dest)?;
        Ok(())
    }

    fn get_batch(&self, jobs: Vec<DownloadJob>) -> Vec<(DownloadJob, Result<(), TransportError>)> {
        jobs.into_iter()
            .map(|job| {
                let result = self.get(&job.url, &job.dest);
                (job, result)
            })
            .collect()
    }
}
