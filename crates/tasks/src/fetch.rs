//! Downloading panorama images.

use crate::error::StageError;

/// Anything that can put the contents of a URL in a file.
pub trait Fetcher: Sync {
    /// Download `url` to `destination`. Must not leave a partial file at `destination`.
    fn fetch(&self, url: &str, destination: &std::path::Path) -> Result<(), StageError>;
}

/// Fetches over HTTP with a blocking client.
pub struct HttpFetcher {
    /// The client.
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    /// Instantiate.
    pub fn new() -> color_eyre::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination: &std::path::Path) -> Result<(), StageError> {
        let transient = |reason: String| StageError::TransientNetwork {
            url: url.to_owned(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|error| transient(error.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(StageError::PermanentFetchFailure {
                url: url.to_owned(),
                attempts: 1,
                reason: format!("HTTP status {status}"),
            });
        }
        if !status.is_success() {
            return Err(transient(format!("HTTP status {status}")));
        }

        let bytes = response
            .bytes()
            .map_err(|error| transient(error.to_string()))?;
        crate::store::write_atomically(destination, &bytes)?;

        Ok(())
    }
}

/// Bounded retries with a fixed pause.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of attempts.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: std::time::Duration::from_secs(3),
        }
    }
}

/// Download `url` unless `destination` already exists, retrying transient failures.
pub fn fetch_with_retries(
    fetcher: &dyn Fetcher,
    policy: RetryPolicy,
    url: &str,
    destination: &std::path::Path,
) -> Result<(), StageError> {
    if destination.exists() {
        tracing::trace!("Already downloaded: {destination:?}");
        return Ok(());
    }

    let mut last_failure = String::new();
    for attempt in 1..=policy.attempts {
        match fetcher.fetch(url, destination) {
            Ok(()) => return Ok(()),
            Err(error) if error.is_transient() => {
                tracing::debug!("Attempt {attempt}/{} failed: {error}", policy.attempts);
                last_failure = error.to_string();
                if attempt < policy.attempts {
                    std::thread::sleep(policy.backoff);
                }
            }
            Err(error) => return Err(error),
        }
    }

    Err(StageError::PermanentFetchFailure {
        url: url.to_owned(),
        attempts: policy.attempts,
        reason: last_failure,
    })
}

/// A fetcher that writes the URL into the file, optionally failing the first few times.
#[cfg(test)]
pub struct FakeFetcher {
    /// How many calls fail transiently before one succeeds.
    pub failures: u32,
    /// Fail every call permanently.
    pub broken: bool,
    /// Number of `fetch()` calls so far.
    pub calls: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl FakeFetcher {
    /// Instantiate a fetcher that always works.
    pub const fn new() -> Self {
        Self {
            failures: 0,
            broken: false,
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Number of calls so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str, destination: &std::path::Path) -> Result<(), StageError> {
        let call = self
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.broken {
            return Err(StageError::PermanentFetchFailure {
                url: url.to_owned(),
                attempts: 1,
                reason: "HTTP status 404 Not Found".to_owned(),
            });
        }
        if call < self.failures {
            return Err(StageError::TransientNetwork {
                url: url.to_owned(),
                reason: "connection reset".to_owned(),
            });
        }
        crate::store::write_atomically(destination, url.as_bytes())?;
        Ok(())
    }
}
