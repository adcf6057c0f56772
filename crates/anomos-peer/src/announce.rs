//! Tracker client
//!
//! Announces go out over HTTPS with the peer certificate as client identity,
//! so the tracker can bind the request to our peer id.

use crate::config::{expand_path, TrackerConfig};
use anomos_core::announce::{b64_encode, AnnounceRequest, AnnounceResponse, ScrapeResponse};
use anomos_core::{tls, Identity, InfoHash, PeerCertificate};
use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use std::time::{Duration, Instant};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct TrackerClient {
    http: reqwest::Client,
    announce_url: Url,
}

impl TrackerClient {
    pub fn new(identity: &Identity, config: &TrackerConfig) -> Result<Self> {
        let announce_url = Url::parse(&config.url)
            .with_context(|| format!("invalid tracker url {:?}", config.url))?;
        if announce_url.scheme() != "https" {
            bail!("tracker url must use https: {}", announce_url);
        }

        let tls_config = match &config.certificate {
            Some(path) => {
                let path = expand_path(path);
                let pem = std::fs::read(&path)
                    .with_context(|| format!("reading tracker certificate {}", path.display()))?;
                let tracker_id = PeerCertificate::from_pem(&pem)?.peer_id();
                tracing::info!("Tracker pinned to {}", tracker_id);
                tls::pinned_client_config(identity, tracker_id)?
            }
            None => {
                tracing::warn!("No tracker certificate configured; accepting any self-signed tracker");
                tls::client_config(identity)?
            }
        };

        let http = reqwest::Client::builder()
            .use_preconfigured_tls((*tls_config).clone())
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, announce_url })
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let mut url = self.announce_url.clone();
        url.set_query(Some(&request.to_query()));
        tracing::debug!("Announcing to {}", self.announce_url);

        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let response = AnnounceResponse::decode(&body)?;

        if let Some(reason) = &response.failure_reason {
            bail!("tracker refused announce: {}", reason);
        }
        if let Some(warning) = &response.warning_message {
            tracing::warn!("Tracker warning: {}", warning);
        }
        Ok(response)
    }

    /// Seeder and leecher counts for one swarm, or for all of them
    pub async fn scrape(&self, info_hash: Option<&InfoHash>) -> Result<ScrapeResponse> {
        let mut url = scrape_url(&self.announce_url)?;
        if let Some(info_hash) = info_hash {
            url.query_pairs_mut()
                .append_pair("info_hash", &b64_encode(info_hash));
        }
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(ScrapeResponse::decode(&body)?)
    }
}

/// The scrape URL sits next to the announce URL
pub fn scrape_url(announce: &Url) -> Result<Url> {
    let path = announce.path();
    let Some(prefix) = path.strip_suffix("announce") else {
        bail!("cannot derive scrape url from {}", announce);
    };
    let mut url = announce.clone();
    url.set_path(&format!("{}scrape", prefix));
    url.set_query(None);
    Ok(url)
}

/// Retry schedule for failed announces
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    window: Duration,
    current: Option<Duration>,
    failing_since: Option<Instant>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, window: Duration) -> Self {
        Self {
            min,
            max,
            window,
            current: None,
            failing_since: None,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.min_announce_retry),
            Duration::from_secs(config.max_announce_retry_interval),
            Duration::from_secs(config.announce_retry_window),
        )
    }

    pub fn success(&mut self) {
        self.current = None;
        self.failing_since = None;
    }

    /// Delay before the next attempt.
    ///
    /// Errors once announces have failed for longer than the retry window;
    /// the caller may keep retrying at the returned cap.
    pub fn failure(&mut self, now: Instant) -> Result<Duration> {
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        self.failure_with(now, jitter)
    }

    pub fn failure_with(&mut self, now: Instant, jitter: f64) -> Result<Duration> {
        let since = *self.failing_since.get_or_insert(now);
        let next = match self.current {
            None => self.min,
            Some(current) => current.mul_f64(1.4 + jitter).min(self.max),
        };
        self.current = Some(next);

        let failing_for = now.duration_since(since);
        if failing_for > self.window {
            return Err(anyhow!(
                "tracker unreachable for {}s, retrying every {}s",
                failing_for.as_secs(),
                next.as_secs()
            ));
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_url() {
        let url = Url::parse("https://tracker.example:5555/announce").unwrap();
        assert_eq!(
            scrape_url(&url).unwrap().as_str(),
            "https://tracker.example:5555/scrape"
        );
        let nested = Url::parse("https://t.example/anomos/announce?x=1").unwrap();
        assert_eq!(
            scrape_url(&nested).unwrap().as_str(),
            "https://t.example/anomos/scrape"
        );
        assert!(scrape_url(&Url::parse("https://t.example/tracker").unwrap()).is_err());
    }

    fn secs(d: Duration) -> u64 {
        d.as_secs_f64().round() as u64
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let now = Instant::now();
        let mut backoff = Backoff::new(
            Duration::from_secs(50),
            Duration::from_secs(120),
            Duration::from_secs(3600),
        );
        assert_eq!(secs(backoff.failure_with(now, 0.0).unwrap()), 50);
        assert_eq!(secs(backoff.failure_with(now, 0.0).unwrap()), 70);
        assert_eq!(secs(backoff.failure_with(now, 0.1).unwrap()), 105);
        assert_eq!(secs(backoff.failure_with(now, 0.0).unwrap()), 120);

        backoff.success();
        assert_eq!(secs(backoff.failure_with(now, 0.0).unwrap()), 50);
    }

    #[test]
    fn test_backoff_window_escalates() {
        let start = Instant::now();
        let mut backoff = Backoff::new(
            Duration::from_secs(50),
            Duration::from_secs(1800),
            Duration::from_secs(3600),
        );
        assert!(backoff.failure_with(start, 0.0).is_ok());
        assert!(backoff
            .failure_with(start + Duration::from_secs(3000), 0.0)
            .is_ok());
        assert!(backoff
            .failure_with(start + Duration::from_secs(3601), 0.0)
            .is_err());

        backoff.success();
        assert!(backoff
            .failure_with(start + Duration::from_secs(4000), 0.0)
            .is_ok());
    }

    #[test]
    fn test_client_rejects_plain_http() {
        let identity = anomos_core::testing::test_identity(0);
        let config = TrackerConfig {
            url: "http://tracker.example/announce".to_string(),
            ..Default::default()
        };
        assert!(TrackerClient::new(&identity, &config).is_err());
    }
}
