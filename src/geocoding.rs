use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const SERVICE: &str = "geocoding";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LocationType {
    Rooftop,
    RangeInterpolated,
    GeometricCenter,
    Approximate,
    Other(String),
}

impl LocationType {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "ROOFTOP" => LocationType::Rooftop,
            "RANGE_INTERPOLATED" => LocationType::RangeInterpolated,
            "GEOMETRIC_CENTER" => LocationType::GeometricCenter,
            "APPROXIMATE" => LocationType::Approximate,
            _ => LocationType::Other(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeCandidate {
    pub location_type: LocationType,
    pub lat: f64,
    pub lng: f64,
}

impl GeocodeCandidate {
    pub fn new(location_type: LocationType, lat: f64, lng: f64) -> Self {
        Self {
            location_type,
            lat,
            lng,
        }
    }
}

/// Address plus country filter in, ordered candidates out.
#[async_trait]
pub trait GeocodingService: Send + Sync {
    async fn geocode(&self, address: &str, country: &str) -> AppResult<Vec<GeocodeCandidate>>;
}

pub struct GoogleGeocodingClient {
    http: Client,
    endpoint: String,
    api_key: SecretString,
    rate_limiter: RateLimiter,
}

impl GoogleGeocodingClient {
    pub fn new(
        endpoint: &str,
        api_key: SecretString,
        timeout: Duration,
        qps: u32,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("batch-geocoder/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_key,
            rate_limiter: RateLimiter::new(qps),
        })
    }

    pub fn from_config(config: &AppConfig, api_key: SecretString) -> AppResult<Self> {
        Self::new(
            &config.geocoding_endpoint,
            api_key,
            Duration::from_secs(config.http_timeout_secs),
            config.geocode_rate_limit_qps,
        )
    }
}

#[async_trait]
impl GeocodingService for GoogleGeocodingClient {
    async fn geocode(&self, address: &str, country: &str) -> AppResult<Vec<GeocodeCandidate>> {
        self.rate_limiter.wait().await;

        let components = format!("country:{country}");
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("address", address),
                ("components", components.as_str()),
                ("key", self.api_key.expose_secret()),
            ])
            .send()
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited { service: SERVICE });
        }
        let parsed: GeocodeResponse = response.error_for_status()?.json().await?;
        trace!(status = %parsed.status, results = parsed.results.len(), "geocode response");
        parsed.into_candidates()
    }
}

#[derive(Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Deserialize)]
struct Geometry {
    location: LatLng,
    #[serde(default)]
    location_type: String,
}

#[derive(Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

impl GeocodeResponse {
    fn into_candidates(self) -> AppResult<Vec<GeocodeCandidate>> {
        match self.status.as_str() {
            "OK" => Ok(self
                .results
                .into_iter()
                .map(|result| {
                    GeocodeCandidate::new(
                        LocationType::parse(&result.geometry.location_type),
                        result.geometry.location.lat,
                        result.geometry.location.lng,
                    )
                })
                .collect()),
            "ZERO_RESULTS" => Ok(Vec::new()),
            "OVER_QUERY_LIMIT" => Err(AppError::RateLimited { service: SERVICE }),
            other => Err(AppError::Service {
                service: SERVICE,
                status: other.to_string(),
                message: self
                    .error_message
                    .unwrap_or_else(|| "no error detail".to_string()),
            }),
        }
    }
}

/// Spaces successive calls at least `1/qps` apart. Calls are delayed, never dropped.
struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        (1000_f64 / safe_qps as f64).ceil() as u64
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
