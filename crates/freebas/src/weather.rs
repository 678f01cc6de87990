//! Outside air temperature gateway
//!
//! [`TemperatureSource`] is what the sync loop consumes. [`OpenMeteoClient`]
//! is the production source, reading the current 2 m temperature in °F from
//! the Open-Meteo forecast API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::WeatherConfig;

/// Temperature in degrees Fahrenheit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature(pub f32);

impl Temperature {
    pub fn fahrenheit(self) -> f32 {
        self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_decode() {
            FetchError::Malformed(e.to_string())
        } else {
            FetchError::Http(e)
        }
    }
}

#[async_trait]
pub trait TemperatureSource: Send + Sync {
    async fn fetch_outside_air_temperature(&self) -> Result<Temperature, FetchError>;
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentWeather,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    temperature_2m: Option<f32>,
}

/// Open-Meteo client
///
/// A good reading is reused for `cache_ttl`; Open-Meteo only refreshes its
/// current conditions every 15 minutes.
pub struct OpenMeteoClient {
    client: Client,
    url: String,
    latitude: f64,
    longitude: f64,
    cache_ttl: Duration,
    last: Mutex<Option<(Instant, Temperature)>>,
}

impl OpenMeteoClient {
    pub fn new(config: &WeatherConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(FetchError::Http)?;

        Ok(Self {
            client,
            url: config.url.clone(),
            latitude: config.latitude,
            longitude: config.longitude,
            cache_ttl: Duration::from_secs(config.cache_secs),
            last: Mutex::new(None),
        })
    }

    fn cached(&self) -> Option<Temperature> {
        let last = self.last.lock();
        (*last).and_then(|(at, temp)| (at.elapsed() < self.cache_ttl).then_some(temp))
    }

    async fn request(&self) -> Result<Temperature, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
                ("current", "temperature_2m".to_string()),
                ("temperature_unit", "fahrenheit".to_string()),
            ])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            status => return Err(FetchError::Status(status.as_u16())),
        }

        let body: ForecastResponse = response.json().await?;
        match body.current.temperature_2m {
            Some(t) if t.is_finite() => Ok(Temperature(t)),
            Some(t) => Err(FetchError::Malformed(format!("non-finite temperature {t}"))),
            None => Err(FetchError::Malformed("missing current.temperature_2m".into())),
        }
    }
}

#[async_trait]
impl TemperatureSource for OpenMeteoClient {
    async fn fetch_outside_air_temperature(&self) -> Result<Temperature, FetchError> {
        if let Some(temp) = self.cached() {
            trace!(temperature = temp.0, "Using cached outside air temperature");
            return Ok(temp);
        }

        let temp = self.request().await?;
        debug!(temperature = temp.0, "Fetched outside air temperature");
        *self.last.lock() = Some((Instant::now(), temp));
        Ok(temp)
    }
}
