//! Decides whether an incoming register sample is admitted into `history`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryDefaults {
    pub tolerance_analog: f64,
    pub min_interval_sec: i64,
    pub heartbeat_sec: i64,
    pub store_history: bool,
    pub value_kind: String,
}

impl Default for HistoryDefaults {
    fn default() -> Self {
        Self {
            tolerance_analog: 0.5,
            min_interval_sec: 10,
            heartbeat_sec: 900,
            store_history: true,
            value_kind: "analog".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KpiRegister {
    pub addr: i64,
    #[serde(default = "default_kpi_heartbeat")]
    pub heartbeat_sec: i64,
    #[serde(default = "default_kpi_tolerance")]
    pub tolerance: f64,
}

fn default_kpi_heartbeat() -> i64 {
    60
}

fn default_kpi_tolerance() -> f64 {
    0.1
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryPolicyConfig {
    pub defaults: HistoryDefaults,
    pub kpi_registers: Vec<KpiRegister>,
}

impl HistoryPolicyConfig {
    /// addr -> KpiRegister, for fast lookup during register processing.
    pub fn kpi_map(&self) -> HashMap<i64, &KpiRegister> {
        self.kpi_registers.iter().map(|k| (k.addr, k)).collect()
    }
}

/// A `register_catalog` row, as read from storage. All fields are nullable
/// in the table; `None` means "no override from this field".
#[derive(Debug, Clone, Default)]
pub struct CatalogRow {
    pub tolerance: Option<f64>,
    pub min_interval_sec: Option<i64>,
    pub heartbeat_sec: Option<i64>,
    /// Unlike the other fields, a present catalog row always overrides
    /// `store_history` — a NULL in this column means "do not store" rather
    /// than "no override", matching the behavior this policy was ported from.
    pub store_history: Option<bool>,
    pub value_kind: Option<String>,
}

// ---------------------------------------------------------------------------
// Parameter resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RegParams {
    pub tolerance: Option<f64>,
    pub min_interval_sec: i64,
    pub heartbeat_sec: i64,
    pub store_history: bool,
    pub value_kind: String,
}

/// Resolve effective parameters for a register address: catalog overrides
/// defaults, then the KPI table overrides heartbeat/tolerance on top of that.
pub fn resolve_params(
    defaults: &HistoryDefaults,
    kpi_map: &HashMap<i64, &KpiRegister>,
    addr: i64,
    catalog_row: Option<&CatalogRow>,
) -> RegParams {
    let mut tolerance = Some(defaults.tolerance_analog);
    let mut min_interval_sec = defaults.min_interval_sec;
    let mut heartbeat_sec = defaults.heartbeat_sec;
    let mut store_history = defaults.store_history;
    let mut value_kind = defaults.value_kind.clone();

    if let Some(row) = catalog_row {
        if let Some(t) = row.tolerance {
            tolerance = Some(t);
        }
        if let Some(mi) = row.min_interval_sec {
            min_interval_sec = mi;
        }
        if let Some(hb) = row.heartbeat_sec {
            heartbeat_sec = hb;
        }
        // A catalog row always dictates store_history, NULL included.
        store_history = row.store_history.unwrap_or(false);
        if let Some(vk) = row.value_kind.as_ref().filter(|s| !s.is_empty()) {
            value_kind = vk.clone();
        }
    }

    if let Some(kpi) = kpi_map.get(&addr) {
        heartbeat_sec = kpi.heartbeat_sec;
        tolerance = Some(kpi.tolerance);
    }

    if matches!(value_kind.as_str(), "discrete" | "enum" | "text") {
        tolerance = None;
    }

    RegParams {
        tolerance,
        min_interval_sec,
        heartbeat_sec,
        store_history,
        value_kind,
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryDecision {
    pub write: bool,
    pub write_reason: &'static str,
}

impl HistoryDecision {
    fn no() -> Self {
        HistoryDecision {
            write: false,
            write_reason: "",
        }
    }

    fn change() -> Self {
        HistoryDecision {
            write: true,
            write_reason: "change",
        }
    }

    fn heartbeat() -> Self {
        HistoryDecision {
            write: true,
            write_reason: "heartbeat",
        }
    }
}

/// Register sample fields compared for the change rule. `value` is compared
/// via `params.tolerance`, not exact equality.
pub struct SampleDelta<'a> {
    pub new_value: Option<Decimal>,
    pub new_raw: Option<i64>,
    pub new_text: Option<&'a str>,
    pub new_reason: Option<&'a str>,
    pub prev_value: Option<Decimal>,
    pub prev_raw: Option<i64>,
    pub prev_text: Option<&'a str>,
    pub prev_reason: Option<&'a str>,
}

pub fn should_write_history(
    params: &RegParams,
    delta: &SampleDelta<'_>,
    last_history_ts: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> HistoryDecision {
    if !params.store_history {
        return HistoryDecision::no();
    }

    let elapsed = last_history_ts.map(|ts| (now - ts).num_milliseconds() as f64 / 1000.0);

    // Min-interval suppresses even real changes.
    if let Some(e) = elapsed {
        if e < params.min_interval_sec as f64 {
            return HistoryDecision::no();
        }
    }

    let mut changed = delta.new_raw != delta.prev_raw
        || delta.new_text != delta.prev_text
        || delta.new_reason != delta.prev_reason;

    if !changed {
        if let Some(tolerance) = params.tolerance {
            match (delta.new_value, delta.prev_value) {
                (Some(nv), Some(pv)) => {
                    let nv_f = nv.to_string().parse::<f64>().unwrap_or(f64::NAN);
                    let pv_f = pv.to_string().parse::<f64>().unwrap_or(f64::NAN);
                    if (nv_f - pv_f).abs() > tolerance {
                        changed = true;
                    }
                }
                (None, None) => {}
                _ => changed = true,
            }
        }
    }

    if changed {
        return HistoryDecision::change();
    }

    if elapsed.is_none() || elapsed.unwrap() >= params.heartbeat_sec as f64 {
        return HistoryDecision::heartbeat();
    }

    HistoryDecision::no()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn defaults() -> HistoryDefaults {
        HistoryDefaults {
            tolerance_analog: 0.5,
            min_interval_sec: 10,
            heartbeat_sec: 900,
            store_history: true,
            value_kind: "analog".to_string(),
        }
    }

    #[test]
    fn resolve_params_catalog_store_history_overrides_unconditionally() {
        let kpi_map = HashMap::new();
        let row = CatalogRow {
            store_history: None,
            ..Default::default()
        };
        let p = resolve_params(&defaults(), &kpi_map, 1, Some(&row));
        assert!(!p.store_history);
    }

    #[test]
    fn resolve_params_discrete_forces_null_tolerance() {
        let kpi_map = HashMap::new();
        let row = CatalogRow {
            value_kind: Some("discrete".to_string()),
            store_history: Some(true),
            ..Default::default()
        };
        let p = resolve_params(&defaults(), &kpi_map, 1, Some(&row));
        assert_eq!(p.tolerance, None);
    }

    #[test]
    fn no_write_when_store_history_false() {
        let params = RegParams {
            tolerance: Some(0.5),
            min_interval_sec: 10,
            heartbeat_sec: 900,
            store_history: false,
            value_kind: "analog".to_string(),
        };
        let delta = SampleDelta {
            new_value: Some(Decimal::new(1500, 1)),
            new_raw: None,
            new_text: None,
            new_reason: None,
            prev_value: None,
            prev_raw: None,
            prev_text: None,
            prev_reason: None,
        };
        let d = should_write_history(&params, &delta, None, t(0));
        assert!(!d.write);
    }

    #[test]
    fn change_then_min_interval_then_heartbeat_scenario() {
        let params = RegParams {
            tolerance: Some(0.5),
            min_interval_sec: 10,
            heartbeat_sec: 900,
            store_history: true,
            value_kind: "analog".to_string(),
        };

        // t=0: first value -> change (prev None, new Some => changed)
        let d0 = should_write_history(
            &params,
            &SampleDelta {
                new_value: Some(Decimal::new(1500, 1)),
                new_raw: None,
                new_text: None,
                new_reason: None,
                prev_value: None,
                prev_raw: None,
                prev_text: None,
                prev_reason: None,
            },
            None,
            t(0),
        );
        assert_eq!(d0, HistoryDecision::change());

        // t=3: changed value but within min_interval -> no write
        let d1 = should_write_history(
            &params,
            &SampleDelta {
                new_value: Some(Decimal::new(1510, 1)),
                new_raw: None,
                new_text: None,
                new_reason: None,
                prev_value: Some(Decimal::new(1500, 1)),
                prev_raw: None,
                prev_text: None,
                prev_reason: None,
            },
            Some(t(0)),
            t(3),
        );
        assert!(!d1.write);

        // t=12: no change, heartbeat not due -> no write
        let d2 = should_write_history(
            &params,
            &SampleDelta {
                new_value: Some(Decimal::new(1510, 1)),
                new_raw: None,
                new_text: None,
                new_reason: None,
                prev_value: Some(Decimal::new(1510, 1)),
                prev_raw: None,
                prev_text: None,
                prev_reason: None,
            },
            Some(t(0)),
            t(12),
        );
        assert!(!d2.write);

        // t=20: change beyond tolerance -> write
        let d3 = should_write_history(
            &params,
            &SampleDelta {
                new_value: Some(Decimal::new(1520, 1)),
                new_raw: None,
                new_text: None,
                new_reason: None,
                prev_value: Some(Decimal::new(1510, 1)),
                prev_raw: None,
                prev_text: None,
                prev_reason: None,
            },
            Some(t(0)),
            t(20),
        );
        assert_eq!(d3, HistoryDecision::change());

        // t=920: no change, heartbeat elapsed -> write
        let d4 = should_write_history(
            &params,
            &SampleDelta {
                new_value: Some(Decimal::new(1520, 1)),
                new_raw: None,
                new_text: None,
                new_reason: None,
                prev_value: Some(Decimal::new(1520, 1)),
                prev_raw: None,
                prev_text: None,
                prev_reason: None,
            },
            Some(t(20)),
            t(920),
        );
        assert_eq!(d4, HistoryDecision::heartbeat());
    }

    #[test]
    fn min_interval_of_zero_never_suppresses() {
        let params = RegParams {
            tolerance: Some(0.5),
            min_interval_sec: 0,
            heartbeat_sec: 900,
            store_history: true,
            value_kind: "analog".to_string(),
        };
        let d = should_write_history(
            &params,
            &SampleDelta {
                new_value: Some(Decimal::new(10, 0)),
                new_raw: None,
                new_text: None,
                new_reason: None,
                prev_value: Some(Decimal::new(5, 0)),
                prev_raw: None,
                prev_text: None,
                prev_reason: None,
            },
            Some(t(0)),
            t(0),
        );
        assert_eq!(d, HistoryDecision::change());
    }
}
