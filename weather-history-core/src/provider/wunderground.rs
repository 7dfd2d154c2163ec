use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;

use crate::{LocationSummary, WeatherSummary};

use super::{ProviderId, WeatherSource, endpoint, fields, get_body, http_client, normalize_base_url};

const DAILY_SUMMARY: &str = "/history/dailysummary/0";

/// Weather Underground history API. Only daily aggregates (imperial units)
/// are available, and no apparent temperatures.
#[derive(Debug, Clone)]
pub struct WundergroundSource {
    api_key: String,
    base_url: String,
    http: Client,
}

impl WundergroundSource {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, ProviderId::WeatherUnderground.default_base_url())
    }

    pub fn with_base_url(api_key: String, base_url: &str) -> Result<Self> {
        Ok(Self {
            api_key,
            base_url: normalize_base_url(base_url)?,
            http: http_client()?,
        })
    }
}

pub fn normalize(body: &Value) -> WeatherSummary {
    let daily = |field: &str| fields::number_at(body, &format!("{DAILY_SUMMARY}/{field}"));

    WeatherSummary {
        mean_temp: daily("meantempi"),
        max_temp: daily("maxtempi"),
        min_temp: daily("mintempi"),
        precipitation: daily("precipi"),
        ..Default::default()
    }
}

#[async_trait]
impl WeatherSource for WundergroundSource {
    fn id(&self) -> ProviderId {
        ProviderId::WeatherUnderground
    }

    fn build_request(&self, key: &LocationSummary) -> Result<Url> {
        let day = format!("history_{}", key.date.format("%Y%m%d"));
        let point = format!("{},{}.json", key.latitude, key.longitude);

        endpoint(&self.base_url, &["api", &self.api_key, &day, "q", &point])
            .context("Failed to build Weather Underground request URL")
    }

    fn normalize(&self, body: &Value) -> WeatherSummary {
        normalize(body)
    }

    async fn fetch_raw(&self, key: &LocationSummary) -> Result<String> {
        let url = self.build_request(key)?;
        get_body(&self.http, url, self.id()).await
    }
}
