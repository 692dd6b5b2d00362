//! Plain record types shared across the pipeline.
//!
//! Following the teacher's "object-per-row active-record → plain records +
//! repository functions" idiom: every type here is a dumb data holder with
//! `serde` derives; all DB access happens through free functions in the
//! sibling `bucket_registry` / `projection` / `events` / `sessions` /
//! `aggregator` modules that take an explicit connection.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Open,
    Closed,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    NewDrop,
    Closed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewDrop => "NEW_DROP",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "NEW_DROP" => Self::NewDrop,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeBucket {
    Prime,
    OffPeak,
}

impl TimeBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prime => "prime",
            Self::OffPeak => "off_peak",
        }
    }

    /// Prime time is dinner-adjacent, 18:00-20:59 local-naive hour of the
    /// anchor. Classifies on the naive hour rather than venue-local time so
    /// it needs no per-venue timezone data.
    pub fn classify(hour: u32) -> Self {
        if (18..21).contains(&hour) {
            Self::Prime
        } else {
            Self::OffPeak
        }
    }
}

/// The fixed query key unit of polling.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub bucket_id: String,
    pub date_str: String,
    pub time_slot: String,
    pub baseline_slot_ids: Option<HashSet<String>>,
    pub prev_slot_ids: Option<HashSet<String>>,
    /// Venue ids with at least one slot in the baseline snapshot. Used to
    /// apply the "venue had zero slots, now has one" emit rule at venue
    /// granularity rather than slot granularity -- see `DESIGN.md` for why
    /// this is tracked as a derived field alongside `baseline_slot_ids`.
    pub baseline_venue_ids: Option<HashSet<i64>>,
    pub scanned_at: Option<i64>,
    pub baseline_scanned_at: Option<i64>,
    pub last_error: Option<String>,
}

impl Bucket {
    pub fn is_initialized(&self) -> bool {
        self.baseline_slot_ids.is_some()
    }

    /// Builds the zero-padded `bucket_id` from its two components.
    pub fn make_id(date_str: &str, time_slot: &str) -> String {
        format!("{date_str}_{time_slot}")
    }
}

/// Health summary for a single bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketHealth {
    pub bucket_id: String,
    pub scanned_at: Option<i64>,
    pub baseline_count: i64,
    pub stale: bool,
}

/// One row as returned by the Provider Adapter, before any diffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedSlot {
    pub slot_id: String,
    pub venue_id: i64,
    pub venue_name: String,
    pub actual_time: chrono::DateTime<chrono::Utc>,
    pub payload: SlotPayload,
}

/// Optional, provider-specific fields. Persisted as an opaque JSON blob on
/// the event row; parsed into this typed shape in-code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotPayload {
    pub availability_times: Vec<String>,
    pub booking_url: Option<String>,
    pub neighborhood: Option<String>,
    pub image: Option<String>,
    pub price_band: Option<String>,
    pub rating: Option<f64>,
}

/// Projection row: "what is currently open".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionRow {
    pub bucket_id: String,
    pub slot_id: String,
    pub venue_id: i64,
    pub state: SlotState,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub last_seen_at: i64,
    pub updated_at: i64,
}

/// Append-only drop event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropEvent {
    pub dedupe_key: String,
    pub bucket_id: String,
    pub slot_id: String,
    pub venue_id: i64,
    pub venue_name: String,
    pub opened_at: i64,
    pub event_type: EventType,
    pub closed_at: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub time_bucket: TimeBucket,
    pub slot_date: String,
    pub slot_time: String,
    pub payload: String,
}

/// One row per contiguous open window for a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilitySession {
    pub id: String,
    pub bucket_id: String,
    pub slot_id: String,
    pub venue_id: i64,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub aggregated_at: Option<i64>,
}

/// Rolling per-venue metrics over an N-day window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueMetrics {
    pub venue_id: i64,
    pub as_of_date: String,
    pub new_drop_count: i64,
    pub prime_time_drops: i64,
    pub avg_duration_seconds: f64,
    pub rarity_score: f64,
    pub availability_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMetrics {
    pub window_date: String,
    pub metric_type: String,
    pub value: f64,
}

/// Outcome of one poll worker pass, used for invariant logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollInvariants {
    pub baseline_echo: usize,
    pub prev_echo: usize,
}
