// =============================================================================
// models.rs - THE SACRED DATA STRUCTURES OF SIMULATED TELEMETRY
// =============================================================================
//
// These structs represent the fundamental building blocks of the fleet
// simulator. A device identity, the telemetry it fabricates, and the
// append-only event records that let you reconstruct exactly what every
// one of a thousand imaginary sensors was doing at 03:12 in the morning.
//
// Is it overkill to give a fake temperature reading a sequence number,
// a wall-clock timestamp, and an operational status? Yes. Do we care?
// Absolutely not.
// =============================================================================

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current UTC time. One function so every timestamp in the engine agrees
/// on where "now" comes from.
pub fn utcnow() -> DateTime<Utc> {
    Utc::now()
}

/// ISO-8601 rendering used for every serialized timestamp. Microsecond
/// precision, explicit offset, lexicographically sortable.
pub fn iso_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Identity of one simulated device: the name ThingsBoard knows it by and
/// the access token it authenticates with. Immutable once provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub device_id: String,
    pub token: String,
}

impl DeviceToken {
    pub fn new(device_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            token: token.into(),
        }
    }
}

/// Lifecycle state of a simulated device as the aggregator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Provisioned but not yet heard from.
    Pending,
    /// Currently holding an MQTT session.
    Connected,
    /// Left the broker on its own terms.
    Disconnected,
    /// Left the broker on the broker's terms, or never made it there.
    Failed,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Pending => write!(f, "pending"),
            DeviceStatus::Connected => write!(f, "connected"),
            DeviceStatus::Disconnected => write!(f, "disconnected"),
            DeviceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The stage of the device lifecycle where the most recent noteworthy
/// thing happened. Feeds the per-device health table on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Startup,
    Connect,
    Publish,
    Disconnect,
    Exception,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Startup => write!(f, "startup"),
            FailureStage::Connect => write!(f, "connect"),
            FailureStage::Publish => write!(f, "publish"),
            FailureStage::Disconnect => write!(f, "disconnect"),
            FailureStage::Exception => write!(f, "exception"),
        }
    }
}

/// Operational mode reported inside the fabricated telemetry payload.
/// Real fleets are mostly idle. Ours is too, statistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Idle,
    Active,
    Maintenance,
}

/// One fabricated telemetry reading. Published as UTF-8 JSON on
/// `v1/devices/me/telemetry`. The value ranges are bounded so the broker
/// side can sanity-check ingestion without ever seeing a 400-degree
/// greenhouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub seq: u64,
    pub timestamp: String,
    pub temperature: f64,
    pub humidity: f64,
    pub voltage: f64,
    pub status: DeviceMode,
    pub device_id: String,
}

impl TelemetryPayload {
    /// Fabricate the next reading for a device. Randomized but
    /// deterministic-looking telemetry fields.
    pub fn sample(device_id: &str, seq: u64) -> Self {
        let mut rng = rand::thread_rng();
        let status = match rng.gen_range(0..3) {
            0 => DeviceMode::Idle,
            1 => DeviceMode::Active,
            _ => DeviceMode::Maintenance,
        };
        Self {
            seq,
            timestamp: iso_timestamp(utcnow()),
            temperature: round2(rng.gen_range(18.0..32.0)),
            humidity: round2(rng.gen_range(30.0..70.0)),
            voltage: round2(rng.gen_range(210.0..230.0)),
            status,
            device_id: device_id.to_string(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// What kind of thing happened to a device. Matches the `event` field of
/// the JSONL log, one value per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Publish,
    Disconnected,
    ConnectionError,
    UnexpectedError,
}

/// One line of the append-only JSONL event log. Optional fields are
/// omitted from the serialized record entirely rather than written as
/// nulls, so each line carries only what its event kind actually knows.
/// Records are never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: String,
    pub device: String,
    pub event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<TelemetryPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl EventRecord {
    fn base(device: &str, event: EventKind) -> Self {
        Self {
            timestamp: iso_timestamp(utcnow()),
            device: device.to_string(),
            event,
            status: None,
            latency_ms: None,
            payload: None,
            error: None,
            reason: None,
            host: None,
            port: None,
        }
    }

    pub fn connected(device: &str, host: &str, port: u16) -> Self {
        let mut record = Self::base(device, EventKind::Connected);
        record.host = Some(host.to_string());
        record.port = Some(port);
        record
    }

    pub fn publish_success(device: &str, latency_ms: f64, payload: TelemetryPayload) -> Self {
        let mut record = Self::base(device, EventKind::Publish);
        record.status = Some("success".to_string());
        record.latency_ms = Some(round4(latency_ms));
        record.payload = Some(payload);
        record
    }

    pub fn publish_failure(device: &str, error: &str, latency_ms: f64) -> Self {
        let mut record = Self::base(device, EventKind::Publish);
        record.status = Some("failure".to_string());
        record.latency_ms = Some(round4(latency_ms));
        record.error = Some(error.to_string());
        record
    }

    pub fn connection_error(device: &str, error: &str) -> Self {
        let mut record = Self::base(device, EventKind::ConnectionError);
        record.error = Some(error.to_string());
        record
    }

    pub fn unexpected_error(device: &str, error: &str) -> Self {
        let mut record = Self::base(device, EventKind::UnexpectedError);
        record.error = Some(error.to_string());
        record
    }

    pub fn disconnected(device: &str, reason: &str) -> Self {
        let mut record = Self::base(device, EventKind::Disconnected);
        record.reason = Some(reason.to_string());
        record
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Per-device totals as served by `/api/metrics` and merged across shards
/// by the global aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBreakdownEntry {
    pub device: String,
    pub messages: u64,
    pub failed_messages: u64,
    pub bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_fields_stay_in_range() {
        for seq in 1..=50 {
            let payload = TelemetryPayload::sample("sim-0", seq);
            assert_eq!(payload.seq, seq);
            assert_eq!(payload.device_id, "sim-0");
            assert!((18.0..=32.0).contains(&payload.temperature));
            assert!((30.0..=70.0).contains(&payload.humidity));
            assert!((210.0..=230.0).contains(&payload.voltage));
        }
    }

    #[test]
    fn test_event_record_omits_absent_fields() {
        let record = EventRecord::disconnected("sim-3", "graceful");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"event\":\"disconnected\""));
        assert!(json.contains("\"reason\":\"graceful\""));
        assert!(!json.contains("latency_ms"));
        assert!(!json.contains("payload"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_publish_event_carries_latency_and_payload() {
        let payload = TelemetryPayload::sample("sim-7", 1);
        let record = EventRecord::publish_success("sim-7", 12.34567, payload);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"status\":\"success\""));
        assert!(json.contains("\"latency_ms\":12.3457"));
        assert!(json.contains("\"device_id\":\"sim-7\""));
    }

    #[test]
    fn test_device_mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&DeviceMode::Maintenance).unwrap(),
            "\"maintenance\""
        );
        assert_eq!(serde_json::to_string(&DeviceStatus::Failed).unwrap(), "\"failed\"");
        assert_eq!(
            serde_json::to_string(&FailureStage::Exception).unwrap(),
            "\"exception\""
        );
    }
}
