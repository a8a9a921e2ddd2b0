//! Retrieval of licence daemon reports over HTTP(S).

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::LAST_MODIFIED;
use reqwest::{Certificate, Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(8);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
    #[error("reading CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CA bundle {path} holds no usable certificate: {source}")]
    Certificate {
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    /// Worth another attempt: timeouts, refused connections, 5xx and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            FetchError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    /// Accept any server certificate.
    pub skip_verify: bool,
    /// Extra PEM roots trusted alongside the built-in ones.
    pub ca_bundle: Option<PathBuf>,
    /// Attempts after the first for transient failures.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            skip_verify: false,
            ca_bundle: None,
            retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Delay before retry `attempt` (1-based): doubles each time, capped.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << doublings).min(MAX_RETRY_DELAY)
}

#[derive(Debug, Clone)]
pub struct FetchedReport {
    pub url: String,
    /// Parsed `Last-Modified`, when the daemon sent a valid one.
    pub last_modified: Option<DateTime<Utc>>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LicenceFetcher {
    client: Client,
    retries: u32,
    retry_delay: Duration,
}

impl LicenceFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(settings.timeout)
            .user_agent(concat!("udr/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(settings.skip_verify);

        if let Some(path) = &settings.ca_bundle {
            let pem = std::fs::read(path).map_err(|source| FetchError::CaBundle {
                path: path.clone(),
                source,
            })?;
            let roots = Certificate::from_pem_bundle(&pem).map_err(|source| {
                FetchError::Certificate {
                    path: path.clone(),
                    source,
                }
            })?;
            builder = roots
                .into_iter()
                .fold(builder, |b, cert| b.add_root_certificate(cert));
        }

        Ok(Self {
            client: builder.build().map_err(FetchError::Client)?,
            retries: settings.retries,
            retry_delay: settings.retry_delay,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedReport, FetchError> {
        let span = info_span!("licence_fetch", url);
        async {
            let mut attempt = 0;
            loop {
                match self.get_once(url).await {
                    Ok(report) => return Ok(report),
                    Err(err) if err.is_transient() && attempt < self.retries => {
                        attempt += 1;
                        let delay = retry_delay(self.retry_delay, attempt);
                        warn!(error = %err, attempt, ?delay, "fetch failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, url: &str) -> Result<FetchedReport, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: resp.url().to_string(),
                status: status.as_u16(),
            });
        }
        let last_modified = resp
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        let final_url = resp.url().to_string();
        let body = resp.bytes().await.map_err(transport)?.to_vec();
        debug!(bytes = body.len(), "report downloaded");
        Ok(FetchedReport {
            url: final_url,
            last_modified,
            body,
        })
    }
}

/// `Wed, 21 Oct 2015 07:28:00 GMT`
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let base = Duration::from_millis(500);
        assert_eq!(retry_delay(base, 1), Duration::from_millis(500));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(1));
        assert_eq!(retry_delay(base, 3), Duration::from_secs(2));
        assert_eq!(retry_delay(base, 30), MAX_RETRY_DELAY);
    }

    #[test]
    fn only_throttling_and_server_errors_are_transient() {
        let status = |status| FetchError::Status {
            url: "http://lic:7041".to_string(),
            status,
        };
        assert!(status(502).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(401).is_transient());
    }

    #[test]
    fn last_modified_parses_http_dates() {
        let parsed = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").expect("date");
        assert_eq!(parsed.to_rfc3339(), "2015-10-21T07:28:00+00:00");
        assert!(parse_http_date("yesterday").is_none());
    }

    #[test]
    fn missing_ca_bundle_is_reported() {
        let settings = FetchSettings {
            ca_bundle: Some(PathBuf::from("/nonexistent/udr-ca.pem")),
            ..FetchSettings::default()
        };
        assert!(matches!(
            LicenceFetcher::new(settings),
            Err(FetchError::CaBundle { .. })
        ));
    }
}
