//! Reference Provider Adapter implementation.
//!
//! Structurally lifted from the teacher's `scrapers::dome_tracker::DomeClient`:
//! a bearer-token `reqwest::Client`, a request-spaced rate limiter, and
//! exponential-backoff retry on 5xx/network errors with an immediate bail on
//! 4xx. Generalized from a single wallet-orders endpoint to a paginated
//! venue-availability listing.

use super::{expand_anchor_window, ProviderAdapter};
use crate::pipeline::error::PipelineError;
use crate::pipeline::fingerprint::slot_id;
use crate::pipeline::model::{NormalizedSlot, SlotPayload};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;

pub struct SeatedProvider {
    client: Client,
    api_key: String,
    base_url: String,
    per_page: u32,
    max_pages: u32,
}

impl SeatedProvider {
    pub fn new(api_key: String, per_page: u32, max_pages: u32, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building http client: {e}"))?;

        Ok(Self {
            client,
            api_key,
            base_url: "https://api.seated-reservations.example/v1".to_string(),
            per_page,
            max_pages,
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    async fn fetch_page(
        &self,
        date_str: &str,
        window_start_min: i64,
        window_end_min: i64,
        party_sizes: &[u32],
        page: u32,
    ) -> Result<Vec<RawVenue>, PipelineError> {
        let url = format!("{}/availability", self.base_url);
        let party_csv = party_sizes
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut backoff = Duration::from_millis(150);
        for attempt in 1..=MAX_RETRIES {
            let result = self
                .client
                .get(&url)
                .bearer_auth(&self.api_key)
                .query(&[
                    ("date", date_str),
                    ("window_start_min", &window_start_min.to_string()),
                    ("window_end_min", &window_end_min.to_string()),
                    ("party_sizes", &party_csv),
                    ("page", &page.to_string()),
                    ("per_page", &self.per_page.to_string()),
                ])
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: RawAvailabilityPage = response
                            .json()
                            .await
                            .map_err(|e| PipelineError::ProviderParse(e.to_string()))?;
                        return Ok(parsed.venues);
                    } else if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(PipelineError::ProviderFatal(format!(
                            "auth error {status}"
                        )));
                    } else if status.is_server_error() || status.as_u16() == 429 {
                        warn!(%status, attempt, "provider transient error, backing off");
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(4));
                    } else {
                        return Err(PipelineError::ProviderFatal(format!(
                            "client error {status}"
                        )));
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!(error = %e, attempt, "provider network error, backing off");
                    if attempt == MAX_RETRIES {
                        return Err(PipelineError::ProviderTransient(e.to_string()));
                    }
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(4));
                }
                Err(e) => {
                    return Err(PipelineError::ProviderTransient(e.to_string()));
                }
            }
        }

        Err(PipelineError::ProviderTransient(
            "max retries exceeded".to_string(),
        ))
    }
}

#[async_trait]
impl ProviderAdapter for SeatedProvider {
    fn provider_id(&self) -> &'static str {
        "seated"
    }

    async fn fetch(
        &self,
        date_str: &str,
        time_anchor: &str,
        party_sizes: &[u32],
    ) -> Result<Vec<NormalizedSlot>, PipelineError> {
        let (window_start_min, window_end_min) = expand_anchor_window(time_anchor)
            .ok_or_else(|| PipelineError::ProviderParse(format!("bad anchor {time_anchor}")))?;

        let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .map_err(|e| PipelineError::ProviderParse(e.to_string()))?;

        let mut slots = Vec::new();
        for page in 0..self.max_pages {
            let venues = self
                .fetch_page(date_str, window_start_min, window_end_min, party_sizes, page)
                .await?;

            let page_len = venues.len();
            for venue in venues {
                for time_str in &venue.available_times {
                    let Some(naive_time) = parse_hhmm(time_str) else {
                        continue;
                    };
                    let minutes = naive_time.0 * 60 + naive_time.1;
                    if minutes < window_start_min || minutes >= window_end_min {
                        continue;
                    }
                    let actual_time = Utc
                        .from_utc_datetime(&date.and_hms_opt(naive_time.0 as u32, naive_time.1 as u32, 0).unwrap());

                    let id = slot_id(self.provider_id(), venue.id, actual_time);
                    slots.push(NormalizedSlot {
                        slot_id: id,
                        venue_id: venue.id,
                        venue_name: venue.name.clone(),
                        actual_time,
                        payload: SlotPayload {
                            availability_times: venue.available_times.clone(),
                            booking_url: venue.booking_url.clone(),
                            neighborhood: venue.neighborhood.clone(),
                            image: venue.image.clone(),
                            price_band: venue.price_band.clone(),
                            rating: venue.rating,
                        },
                    });
                }
            }

            debug!(page, page_len, "fetched provider page");
            if (page_len as u32) < self.per_page {
                break;
            }
        }

        Ok(slots)
    }
}

fn parse_hhmm(s: &str) -> Option<(i64, i64)> {
    let mut parts = s.splitn(2, ':');
    let h: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    Some((h, m))
}

#[derive(Debug, Deserialize)]
struct RawAvailabilityPage {
    venues: Vec<RawVenue>,
}

#[derive(Debug, Deserialize)]
struct RawVenue {
    id: i64,
    name: String,
    available_times: Vec<String>,
    #[serde(default)]
    booking_url: Option<String>,
    #[serde(default)]
    neighborhood: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    price_band: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
}
