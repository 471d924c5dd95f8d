//! Sunrise/sunset lookup
//!
//! The controller only needs today's sunrise and sunset. They come from an
//! external weather service and are cached as a [`SunWindow`].

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Default OpenWeatherMap API root
pub const OPENWEATHER_URL: &str = "https://api.openweathermap.org";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Sunrise and sunset for the current day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunTimes {
    pub sunrise: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
}

/// Cached [`SunTimes`] plus the time they were fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunWindow {
    pub sunrise: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

impl SunWindow {
    pub fn new(times: SunTimes, fetched_at: DateTime<Utc>) -> Self {
        Self {
            sunrise: times.sunrise,
            sunset: times.sunset,
            fetched_at,
        }
    }

    /// True between sunrise and sunset, both inclusive
    pub fn is_daylight(&self, now: DateTime<Utc>) -> bool {
        self.sunrise <= now && now <= self.sunset
    }

    /// True once the window is older than `max_age`
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.fetched_at)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

/// Source of sunrise/sunset times
#[async_trait::async_trait]
pub trait SunOracle: Send + Sync {
    async fn sun_times(&self) -> Result<SunTimes>;
}

/// A string that never shows up in Debug output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct RedactedString(pub String);

impl fmt::Debug for RedactedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"***\"")
    }
}

impl From<String> for RedactedString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RedactedString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// OpenWeatherMap current-weather lookup by city id
#[derive(Debug, Clone)]
pub struct OpenWeatherOracle {
    client: reqwest::Client,
    base_url: String,
    location: String,
    api_key: RedactedString,
}

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    sys: WeatherSys,
}

#[derive(Debug, Deserialize)]
struct WeatherSys {
    sunrise: i64,
    sunset: i64,
}

impl OpenWeatherOracle {
    pub fn new(location: impl Into<String>, api_key: impl Into<RedactedString>) -> Result<Self> {
        Self::with_base_url(OPENWEATHER_URL, location, api_key)
    }

    /// Point the oracle at a different API root (proxies, tests)
    pub fn with_base_url(
        base_url: impl Into<String>,
        location: impl Into<String>,
        api_key: impl Into<RedactedString>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            location: location.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait::async_trait]
impl SunOracle for OpenWeatherOracle {
    async fn sun_times(&self) -> Result<SunTimes> {
        let url = format!("{}/data/2.5/weather", self.base_url);
        let body: WeatherResponse = self
            .client
            .get(&url)
            .query(&[("id", self.location.as_str()), ("appid", self.api_key.0.as_str())])
            .send()
            .await
            .context("Sun time request failed")?
            .error_for_status()
            .context("Sun time request returned error status")?
            .json()
            .await
            .context("Malformed sun time response")?;

        Ok(SunTimes {
            sunrise: epoch(body.sys.sunrise)?,
            sunset: epoch(body.sys.sunset)?,
        })
    }
}

fn epoch(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).with_context(|| format!("Timestamp out of range: {}", secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Json;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    async fn spawn_weather_stub(app: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn daylight_bounds_are_inclusive() {
        let sunrise = Utc.with_ymd_and_hms(2024, 6, 1, 4, 30, 0).unwrap();
        let sunset = Utc.with_ymd_and_hms(2024, 6, 1, 20, 15, 0).unwrap();
        let window = SunWindow::new(SunTimes { sunrise, sunset }, sunrise);

        assert!(window.is_daylight(sunrise));
        assert!(window.is_daylight(sunset));
        assert!(!window.is_daylight(sunset + chrono::Duration::seconds(1)));
        assert!(!window.is_daylight(sunrise - chrono::Duration::seconds(1)));
    }

    #[test]
    fn staleness_after_max_age() {
        let fetched = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let times = SunTimes { sunrise: fetched, sunset: fetched };
        let window = SunWindow::new(times, fetched);
        let four_hours = Duration::from_secs(4 * 3600);

        assert!(!window.is_stale(fetched + chrono::Duration::hours(4), four_hours));
        assert!(window.is_stale(fetched + chrono::Duration::minutes(241), four_hours));
        // Clock stepping backwards never counts as stale
        assert!(!window.is_stale(fetched - chrono::Duration::hours(1), four_hours));
    }

    #[test]
    fn api_key_is_redacted() {
        let oracle = OpenWeatherOracle::new("2643743", "secret-key").unwrap();
        let debug = format!("{:?}", oracle);
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("***"));
    }

    #[tokio::test]
    async fn parses_sunrise_and_sunset() {
        let app = axum::Router::new().route(
            "/data/2.5/weather",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("id").map(String::as_str), Some("2643743"));
                assert_eq!(params.get("appid").map(String::as_str), Some("k"));
                Json(serde_json::json!({
                    "name": "London",
                    "sys": { "country": "GB", "sunrise": 1717214400, "sunset": 1717273800 }
                }))
            }),
        );
        let addr = spawn_weather_stub(app).await;

        let oracle =
            OpenWeatherOracle::with_base_url(format!("http://{}/", addr), "2643743", "k").unwrap();
        let times = oracle.sun_times().await.unwrap();

        assert_eq!(times.sunrise.timestamp(), 1717214400);
        assert_eq!(times.sunset.timestamp(), 1717273800);
    }

    #[tokio::test]
    async fn error_status_is_an_error() {
        let app = axum::Router::new().route(
            "/data/2.5/weather",
            get(|| async { (StatusCode::UNAUTHORIZED, "Invalid API key") }),
        );
        let addr = spawn_weather_stub(app).await;

        let oracle =
            OpenWeatherOracle::with_base_url(format!("http://{}", addr), "1", "bad").unwrap();
        assert!(oracle.sun_times().await.is_err());
    }

    #[tokio::test]
    async fn malformed_body_is_an_error() {
        let app = axum::Router::new()
            .route("/data/2.5/weather", get(|| async { Json(serde_json::json!({ "sys": {} })) }));
        let addr = spawn_weather_stub(app).await;

        let oracle =
            OpenWeatherOracle::with_base_url(format!("http://{}", addr), "1", "k").unwrap();
        assert!(oracle.sun_times().await.is_err());
    }
}
