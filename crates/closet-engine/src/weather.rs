use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::http::{build_client, response_json_or_error, trim_base_url};

pub const OPEN_METEO_FORECAST_URL: &str = "https://api.open-meteo.com/v1";
pub const OPEN_METEO_GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1";

/// Tomorrow's temperature range in °C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub city: String,
    pub t_min: f64,
    pub t_max: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
}

impl Location {
    pub fn toronto() -> Self {
        Self {
            latitude: 43.7,
            longitude: -79.4,
            timezone: "America/Toronto".to_string(),
        }
    }
}

pub trait WeatherProvider: Send + Sync {
    fn name(&self) -> &str;
    fn forecast(&self, city: &str) -> Result<Forecast>;
}

/// Open-Meteo daily forecast. Cities are geocoded first; a city the geocoder
/// does not know, or a failed lookup, uses the fallback location.
pub struct OpenMeteoProvider {
    forecast_url: String,
    geocoding_url: String,
    fallback: Location,
    http: HttpClient,
}

impl OpenMeteoProvider {
    pub fn new(fallback: Location, timeout: Duration) -> Result<Self> {
        Ok(Self {
            forecast_url: OPEN_METEO_FORECAST_URL.to_string(),
            geocoding_url: OPEN_METEO_GEOCODING_URL.to_string(),
            fallback,
            http: build_client(timeout)?,
        })
    }

    pub fn with_base_urls(mut self, forecast_url: &str, geocoding_url: &str) -> Self {
        self.forecast_url = trim_base_url(forecast_url);
        self.geocoding_url = trim_base_url(geocoding_url);
        self
    }

    fn locate(&self, city: &str) -> Location {
        let city = city.trim();
        if city.is_empty() {
            return self.fallback.clone();
        }
        match self.geocode(city) {
            Ok(Some(location)) => location,
            Ok(None) => {
                debug!(city, "city not geocoded, using fallback location");
                self.fallback.clone()
            }
            Err(err) => {
                warn!(city, "geocoding failed, using fallback location: {err:#}");
                self.fallback.clone()
            }
        }
    }

    fn geocode(&self, city: &str) -> Result<Option<Location>> {
        let endpoint = format!("{}/search", self.geocoding_url);
        let response = self
            .http
            .get(&endpoint)
            .query(&[("name", city), ("count", "1"), ("format", "json")])
            .send()
            .with_context(|| format!("Open-Meteo geocoding request failed ({endpoint})"))?;
        let payload = response_json_or_error("Open-Meteo geocoding", response)?;
        Ok(parse_geocoding(&payload, &self.fallback.timezone))
    }
}

impl WeatherProvider for OpenMeteoProvider {
    fn name(&self) -> &str {
        "open-meteo"
    }

    fn forecast(&self, city: &str) -> Result<Forecast> {
        let location = self.locate(city);
        let endpoint = format!("{}/forecast", self.forecast_url);
        let latitude = location.latitude.to_string();
        let longitude = location.longitude.to_string();
        let response = self
            .http
            .get(&endpoint)
            .query(&[
                ("latitude", latitude.as_str()),
                ("longitude", longitude.as_str()),
                ("daily", "temperature_2m_min,temperature_2m_max"),
                ("timezone", location.timezone.as_str()),
            ])
            .send()
            .with_context(|| format!("Open-Meteo forecast request failed ({endpoint})"))?;
        let payload = response_json_or_error("Open-Meteo forecast", response)?;
        parse_tomorrow(city, &payload)
    }
}

fn parse_geocoding(payload: &Value, default_timezone: &str) -> Option<Location> {
    let first = payload.get("results")?.as_array()?.first()?;
    let latitude = first.get("latitude")?.as_f64()?;
    let longitude = first.get("longitude")?.as_f64()?;
    let timezone = first
        .get("timezone")
        .and_then(Value::as_str)
        .filter(|tz| !tz.trim().is_empty())
        .unwrap_or(default_timezone)
        .to_string();
    Some(Location {
        latitude,
        longitude,
        timezone,
    })
}

/// Reads index 1 (tomorrow) of the daily min/max series.
fn parse_tomorrow(city: &str, payload: &Value) -> Result<Forecast> {
    let daily = payload
        .get("daily")
        .context("Open-Meteo forecast carried no daily block")?;
    let series = |key: &str| -> Result<f64> {
        let Some(value) = daily
            .get(key)
            .and_then(Value::as_array)
            .and_then(|rows| rows.get(1))
            .and_then(Value::as_f64)
        else {
            bail!("Open-Meteo forecast carried no value for tomorrow in {key}");
        };
        Ok(value)
    };
    Ok(Forecast {
        city: city.to_string(),
        t_min: series("temperature_2m_min")?,
        t_max: series("temperature_2m_max")?,
    })
}

/// Offline forecast: the same range for every city.
#[derive(Debug, Clone, Copy)]
pub struct FixedWeatherProvider {
    pub t_min: f64,
    pub t_max: f64,
}

impl Default for FixedWeatherProvider {
    fn default() -> Self {
        Self {
            t_min: 12.0,
            t_max: 21.0,
        }
    }
}

impl WeatherProvider for FixedWeatherProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    fn forecast(&self, city: &str) -> Result<Forecast> {
        Ok(Forecast {
            city: city.to_string(),
            t_min: self.t_min,
            t_max: self.t_max,
        })
    }
}
