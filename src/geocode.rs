use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{trace, warn};

use crate::cache::GeocodeCache;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

/// A resolved latitude/longitude pair. Used uniformly for cache hits and
/// network results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionSource {
    Cache,
    Network,
}

#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    pub source: ResolutionSource,
    pub coordinates: Coordinates,
}

/// External geocoding lookup. `Ok(None)` is a definitive "address unknown"
/// answer and is never retried; `Err` is a transient failure.
#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn geocode(&self, query: &str) -> AppResult<Option<Coordinates>>;
}

#[derive(Clone)]
pub struct GeocoderService {
    inner: Arc<dyn GeocodeLookup>,
}

impl GeocoderService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let client = HttpGeocodeClient::new(config)?;
        Ok(Self {
            inner: Arc::new(client),
        })
    }

    #[cfg(test)]
    pub fn from_lookup(lookup: Arc<dyn GeocodeLookup>) -> Self {
        Self { inner: lookup }
    }

    pub async fn geocode(&self, query: &str) -> AppResult<Option<Coordinates>> {
        self.inner.geocode(query).await
    }
}

/// Serializes all geocoding traffic: cache-first lookup, paced network
/// calls, bounded retries with a fixed backoff.
pub struct Resolver {
    service: GeocoderService,
    rate_limiter: RateLimiter,
    attempts: u32,
    retry_backoff: Duration,
}

impl Resolver {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let service = GeocoderService::new(config)?;
        Ok(Self::with_service(service, config))
    }

    pub fn with_service(service: GeocoderService, config: &AppConfig) -> Self {
        Self {
            service,
            rate_limiter: RateLimiter::new(Duration::from_millis(config.geocoder_pacing_ms)),
            attempts: config.geocoder_retry_attempts.max(1),
            retry_backoff: Duration::from_millis(config.geocoder_retry_backoff_ms),
        }
    }

    /// Cache-first resolution. A cached key never reaches the network;
    /// successful network answers are written through before returning.
    pub async fn resolve(
        &self,
        cache: &mut GeocodeCache,
        query: &str,
    ) -> AppResult<Option<Resolution>> {
        if let Some(coordinates) = cache.lookup(query) {
            trace!(query, "cache hit");
            return Ok(Some(Resolution {
                source: ResolutionSource::Cache,
                coordinates,
            }));
        }

        match self.resolve_via_network(cache, query).await? {
            Some(coordinates) => Ok(Some(Resolution {
                source: ResolutionSource::Network,
                coordinates,
            })),
            None => Ok(None),
        }
    }

    /// Network path without the cache read; the refinement pass uses this
    /// after inspecting the cache itself. Answers are still written through.
    pub async fn resolve_via_network(
        &self,
        cache: &mut GeocodeCache,
        query: &str,
    ) -> AppResult<Option<Coordinates>> {
        let resolved = self.lookup_with_retry(query).await?;
        if let Some(coordinates) = resolved {
            cache.store(query, coordinates)?;
        }
        Ok(resolved)
    }

    async fn lookup_with_retry(&self, query: &str) -> AppResult<Option<Coordinates>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.wait().await;
            match self.service.geocode(query).await {
                Ok(answer) => return Ok(answer),
                Err(err) if attempt < self.attempts => {
                    warn!(
                        ?err,
                        attempt,
                        "geocode lookup failed; retrying after {:?}",
                        self.retry_backoff
                    );
                    sleep(self.retry_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Enforces a fixed minimum interval between network calls. The external
/// service throttles aggressive clients, so calls are never issued
/// back-to-back.
struct RateLimiter {
    interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

struct HttpGeocodeClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpGeocodeClient {
    fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.geocoder_timeout_secs))
            .user_agent(config.geocoder_user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            endpoint: config.geocoder_endpoint.clone(),
        })
    }
}

#[async_trait]
impl GeocodeLookup for HttpGeocodeClient {
    async fn geocode(&self, query: &str) -> AppResult<Option<Coordinates>> {
        #[derive(Deserialize)]
        struct SearchHit {
            lat: String,
            lon: String,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "jsonv2"), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?;

        let mut hits: Vec<SearchHit> = response.json().await?;
        let Some(hit) = hits.pop() else {
            return Ok(None);
        };

        let lat = hit
            .lat
            .parse::<f64>()
            .map_err(|err| AppError::Parse(format!("invalid latitude {:?}: {err}", hit.lat)))?;
        let lon = hit
            .lon
            .parse::<f64>()
            .map_err(|err| AppError::Parse(format!("invalid longitude {:?}: {err}", hit.lon)))?;
        Ok(Some(Coordinates { lat, lon }))
    }
}
