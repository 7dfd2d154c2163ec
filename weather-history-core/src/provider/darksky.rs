use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;

use crate::{LocationSummary, WeatherSummary};

use super::{ProviderId, WeatherSource, endpoint, fields, get_body, http_client, normalize_base_url};

/// Blocks Dark Sky can skip for a historical day request.
const EXCLUDE: &str = "exclude=currently,minutely,alerts,flags";

const HOURLY: &str = "/hourly/data";

/// Dark Sky "time machine" requests. Responses carry an hourly series for the
/// day, so means and totals are computed from it; highs and lows come from
/// the daily block.
#[derive(Debug, Clone)]
pub struct DarkSkySource {
    api_key: String,
    base_url: String,
    http: Client,
}

impl DarkSkySource {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, ProviderId::DarkSky.default_base_url())
    }

    pub fn with_base_url(api_key: String, base_url: &str) -> Result<Self> {
        Ok(Self {
            api_key,
            base_url: normalize_base_url(base_url)?,
            http: http_client()?,
        })
    }
}

/// Map a Dark Sky response onto a summary, one field at a time.
pub fn normalize(body: &Value) -> WeatherSummary {
    let hourly = |field: &str| fields::samples(body, HOURLY, field);
    let daily = |field: &str| fields::number_at(body, &format!("/daily/data/0/{field}"));

    WeatherSummary {
        mean_temp: fields::mean(&hourly("temperature")),
        max_temp: daily("temperatureHigh"),
        min_temp: daily("temperatureLow"),
        precipitation: fields::total(&hourly("precipIntensity")),
        apparent_mean_temp: fields::mean(&hourly("apparentTemperature")),
        apparent_max_temp: daily("apparentTemperatureHigh"),
        apparent_min_temp: daily("apparentTemperatureLow"),
    }
}

#[async_trait]
impl WeatherSource for DarkSkySource {
    fn id(&self) -> ProviderId {
        ProviderId::DarkSky
    }

    fn build_request(&self, key: &LocationSummary) -> Result<Url> {
        let point = format!(
            "{},{},{}T00:00:00",
            key.latitude,
            key.longitude,
            key.date.format("%Y-%m-%d"),
        );

        let mut url = endpoint(&self.base_url, &["forecast", &self.api_key, &point])
            .context("Failed to build Dark Sky request URL")?;
        url.set_query(Some(EXCLUDE));
        Ok(url)
    }

    fn normalize(&self, body: &Value) -> WeatherSummary {
        normalize(body)
    }

    async fn fetch_raw(&self, key: &LocationSummary) -> Result<String> {
        let url = self.build_request(key)?;
        get_body(&self.http, url, self.id()).await
    }
}
