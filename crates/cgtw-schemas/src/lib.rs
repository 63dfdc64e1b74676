//! Wire-level types shared across the telemetry writer: topic parsing and the
//! two JSON payload shapes published under `cg/v1/telemetry/...` and
//! `cg/v1/decoded/...`.

use serde::Deserialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// One of the two recognized topic shapes, with the serial number (and panel
/// id, for decoded messages) already extracted.
///
/// Parsing is prefix-then-split, not regex: both shapes have a fixed number
/// of `/`-separated segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// `cg/v1/telemetry/SN/<sn>`
    Telemetry { router_sn: String },
    /// `cg/v1/decoded/SN/<sn>/pcc/<panel_id>`
    Decoded { router_sn: String, panel_id: i32 },
}

/// Parse a topic string into its recognized shape.
///
/// Returns `None` for anything else — callers log at debug and drop.
pub fn parse_topic(topic: &str) -> Option<Topic> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() == 5
        && parts[0] == "cg"
        && parts[1] == "v1"
        && parts[2] == "telemetry"
        && parts[3] == "SN"
        && !parts[4].is_empty()
    {
        return Some(Topic::Telemetry {
            router_sn: parts[4].to_string(),
        });
    }

    if parts.len() == 7
        && parts[0] == "cg"
        && parts[1] == "v1"
        && parts[2] == "decoded"
        && parts[3] == "SN"
        && !parts[4].is_empty()
        && parts[5] == "pcc"
    {
        let panel_id = parts[6].parse::<i32>().ok()?;
        return Some(Topic::Decoded {
            router_sn: parts[4].to_string(),
            panel_id,
        });
    }

    None
}

/// Equipment kind for decoded messages. Only `"pcc"` is produced today; kept
/// as a type (not a bare literal) so a second equipment kind is a one-line
/// addition.
pub const EQUIP_TYPE_PCC: &str = "pcc";

// ---------------------------------------------------------------------------
// Telemetry (GPS) payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryPayload {
    #[serde(rename = "GPS")]
    pub gps: Option<GpsBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpsBlock {
    pub latitude: Value,
    pub longitude: Value,
    #[serde(default)]
    pub satellites: Option<Value>,
    #[serde(default)]
    pub fix_status: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub date_iso_8601: Option<String>,
}

// ---------------------------------------------------------------------------
// Decoded (register) payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DecodedPayload {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub router_sn: Option<String>,
    #[serde(default)]
    pub bserver_id: Option<i64>,
    #[serde(default)]
    pub registers: Option<Vec<RegisterSample>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterSample {
    pub addr: Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub raw: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A marker substring identifying an "unknown register" reason. Registers
/// decoded without a catalog match carry this in their `reason` field.
pub const UNKNOWN_REGISTER_MARKER: &str = "Неизвестный регистр";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_telemetry_topic() {
        let t = parse_topic("cg/v1/telemetry/SN/R1").unwrap();
        assert_eq!(
            t,
            Topic::Telemetry {
                router_sn: "R1".to_string()
            }
        );
    }

    #[test]
    fn parses_decoded_topic() {
        let t = parse_topic("cg/v1/decoded/SN/R1/pcc/7").unwrap();
        assert_eq!(
            t,
            Topic::Decoded {
                router_sn: "R1".to_string(),
                panel_id: 7,
            }
        );
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(parse_topic("cg/v1/telemetry/SN").is_none());
        assert!(parse_topic("cg/v2/decoded/SN/R1/pcc/7").is_none());
        assert!(parse_topic("not/a/cg/topic").is_none());
        assert!(parse_topic("cg/v1/decoded/SN/R1/pcc/not-a-number").is_none());
    }

    #[test]
    fn deserializes_telemetry_payload() {
        let raw = r#"{"GPS":{"latitude":59.85,"longitude":30.47,"satellites":8,"fix_status":1}}"#;
        let p: TelemetryPayload = serde_json::from_str(raw).unwrap();
        assert!(p.gps.is_some());
    }

    #[test]
    fn deserializes_decoded_payload() {
        let raw = r#"{"timestamp":"2026-01-01T00:00:00Z","registers":[{"addr":40034,"value":150.0}]}"#;
        let p: DecodedPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(p.registers.unwrap().len(), 1);
    }
}
