use crate::{
    Config, LocationSummary, WeatherSummary,
    provider::{darksky::DarkSkySource, wunderground::WundergroundSource},
};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::{fmt::Debug, time::Duration};
use tracing::debug;

pub mod darksky;
pub mod fields;
pub mod wunderground;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    DarkSky,
    WeatherUnderground,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::DarkSky => "darksky",
            ProviderId::WeatherUnderground => "wunderground",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderId::DarkSky => "https://api.darksky.net",
            ProviderId::WeatherUnderground => "http://api.wunderground.com",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::DarkSky, ProviderId::WeatherUnderground]
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "darksky" => Ok(ProviderId::DarkSky),
            "wunderground" => Ok(ProviderId::WeatherUnderground),
            _ => Err(anyhow!(
                "Unknown provider '{value}'. Supported providers: darksky, wunderground."
            )),
        }
    }
}

/// One historical weather provider.
///
/// Implementations own everything provider-specific: the URL layout, the
/// credential placement and the response shape. What comes out is always a
/// [`WeatherSummary`].
#[async_trait]
pub trait WeatherSource: Send + Sync + Debug {
    fn id(&self) -> ProviderId;

    /// Request URI for `key`, credential included. No I/O.
    fn build_request(&self, key: &LocationSummary) -> anyhow::Result<Url>;

    /// Extract a summary from a parsed response. Never fails; fields the
    /// response does not carry come back as `None`.
    fn normalize(&self, body: &Value) -> WeatherSummary;

    /// Issue the request for `key` and return the raw body. Transport errors
    /// and non-2xx statuses are errors; nothing is retried.
    async fn fetch_raw(&self, key: &LocationSummary) -> anyhow::Result<String>;

    fn parse_and_normalize(&self, raw: &str) -> anyhow::Result<WeatherSummary> {
        let body: Value = serde_json::from_str(raw)
            .with_context(|| format!("Failed to parse {} response as JSON", self.id()))?;

        Ok(self.normalize(&body))
    }

    async fn fetch_and_normalize(&self, key: &LocationSummary) -> anyhow::Result<WeatherSummary> {
        let raw = self.fetch_raw(key).await?;
        self.parse_and_normalize(&raw)
    }
}

/// Construct a source from config and explicit ProviderId.
pub fn source_from_config(id: ProviderId, config: &Config) -> anyhow::Result<Box<dyn WeatherSource>> {
    let provider = config.provider_config(id).ok_or_else(|| {
        anyhow!(
            "No API key configured for provider '{id}'.\n\
                 Hint: run `weather-history configure {id}` or pass --api-key."
        )
    })?;

    let base_url = provider.base_url.as_deref().unwrap_or(id.default_base_url());

    let boxed: Box<dyn WeatherSource> = match id {
        ProviderId::DarkSky => Box::new(DarkSkySource::with_base_url(provider.api_key.clone(), base_url)?),
        ProviderId::WeatherUnderground => {
            Box::new(WundergroundSource::with_base_url(provider.api_key.clone(), base_url)?)
        }
    };

    Ok(boxed)
}

/// Construct the default source from config, using `default_provider` field.
pub fn default_source_from_config(config: &Config) -> anyhow::Result<Box<dyn WeatherSource>> {
    let id = config.default_provider_id()?;
    source_from_config(id, config)
}

pub(crate) fn http_client() -> anyhow::Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

pub(crate) fn normalize_base_url(base_url: &str) -> anyhow::Result<String> {
    let trimmed = base_url.trim_end_matches('/');
    Url::parse(trimmed).with_context(|| format!("Invalid provider base URL: {base_url}"))?;
    Ok(trimmed.to_string())
}

/// `base_url` with `segments` appended, each percent-encoded as a single
/// path segment.
pub(crate) fn endpoint(base_url: &str, segments: &[&str]) -> anyhow::Result<Url> {
    let mut url = Url::parse(base_url).with_context(|| format!("Invalid provider base URL: {base_url}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("Provider base URL cannot have a path: {base_url}"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// GET `url` and return the body of a successful response.
///
/// The URL carries the API key, so it is stripped from transport errors and
/// never logged.
pub(crate) async fn get_body(http: &Client, url: Url, provider: ProviderId) -> anyhow::Result<String> {
    debug!(%provider, host = url.host_str().unwrap_or_default(), "requesting weather history");

    let res = http
        .get(url)
        .send()
        .await
        .map_err(reqwest::Error::without_url)
        .with_context(|| format!("Failed to send request to {provider}"))?;

    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(reqwest::Error::without_url)
        .with_context(|| format!("Failed to read {provider} response body"))?;

    if !status.is_success() {
        return Err(anyhow!(
            "{provider} request failed with status {}: {}",
            status,
            truncate_body(&body),
        ));
    }

    Ok(body)
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
