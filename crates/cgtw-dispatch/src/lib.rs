//! Turns one inbound MQTT message (topic + raw payload) into database writes.
//!
//! One [`DispatchState`] is shared across workers; it owns the per-router GPS
//! filter cache and the per-register last-history-write-time cache, the two
//! pieces of process-local state the handlers need between messages.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::PgPool;

use cgtw_config::AppConfig;
use cgtw_db as db;
use cgtw_geo::{GpsFilter, GpsPoint};
use cgtw_history::{resolve_params, should_write_history, CatalogRow, SampleDelta};
use cgtw_schemas::{parse_topic, DecodedPayload, RegisterSample, TelemetryPayload, Topic, EQUIP_TYPE_PCC};

type HistoryKey = (String, String, i32, i32);

pub struct DispatchState {
    gps_filters: DashMap<String, GpsFilter>,
    last_history_ts: DashMap<HistoryKey, DateTime<Utc>>,
}

impl DispatchState {
    pub fn new() -> Self {
        Self {
            gps_filters: DashMap::new(),
            last_history_ts: DashMap::new(),
        }
    }

    /// Populate the GPS filter cache from `gps_latest_filtered` so a restart
    /// doesn't briefly treat the device's real position as a fresh boot.
    pub async fn warm_start_gps(&self, pool: &PgPool, cfg: &AppConfig) -> Result<usize> {
        let rows = db::list_gps_latest(pool).await?;
        let n = rows.len();
        for row in rows {
            let mut filter = GpsFilter::new(cfg.gps_filter.clone());
            filter.set_initial(GpsPoint {
                lat: row.lat,
                lon: row.lon,
                satellites: row.satellites,
                fix_status: row.fix_status,
                gps_time: row.gps_time,
                received_at: row.received_at,
            });
            self.gps_filters.insert(row.router_sn, filter);
        }
        Ok(n)
    }
}

impl Default for DispatchState {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the topic and route the payload to the telemetry or decoded
/// handler. Unknown topics and malformed JSON are logged and dropped.
pub async fn dispatch(
    topic: &str,
    payload: &[u8],
    cfg: &AppConfig,
    pool: &PgPool,
    state: &DispatchState,
) -> Result<()> {
    let Some(parsed) = parse_topic(topic) else {
        tracing::debug!(topic, "unknown topic");
        return Ok(());
    };

    match parsed {
        Topic::Telemetry { router_sn } => {
            let data: TelemetryPayload = match serde_json::from_slice(payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(topic, error = %e, "bad JSON on telemetry topic");
                    return Ok(());
                }
            };
            handle_telemetry(&router_sn, data, cfg, pool, state).await
        }
        Topic::Decoded { router_sn, panel_id } => {
            let data: DecodedPayload = match serde_json::from_slice(payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(topic, error = %e, "bad JSON on decoded topic");
                    return Ok(());
                }
            };
            handle_decoded(&router_sn, panel_id, data, cfg, pool, state).await
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry (GPS)
// ---------------------------------------------------------------------------

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_to_i32(v: &Value) -> Option<i32> {
    match v {
        Value::Number(n) => n.as_i64().map(|n| n as i32),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_gps_time(gps: &cgtw_schemas::GpsBlock) -> Option<DateTime<Utc>> {
    if let Some(iso) = gps.date_iso_8601.as_deref() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(iso) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    if let Some(ts) = gps.timestamp.as_ref().and_then(value_to_i32) {
        return Utc.timestamp_opt(ts as i64, 0).single();
    }
    None
}

async fn handle_telemetry(
    router_sn: &str,
    data: TelemetryPayload,
    cfg: &AppConfig,
    pool: &PgPool,
    state: &DispatchState,
) -> Result<()> {
    let Some(gps) = data.gps else {
        tracing::debug!(router_sn, "telemetry has no GPS block");
        return Ok(());
    };

    let (Some(lat), Some(lon)) = (value_to_f64(&gps.latitude), value_to_f64(&gps.longitude)) else {
        tracing::warn!(router_sn, "GPS block missing latitude/longitude");
        return Ok(());
    };

    let satellites = gps.satellites.as_ref().and_then(value_to_i32);
    let fix_status = gps.fix_status.as_ref().and_then(value_to_i32);
    let gps_time = parse_gps_time(&gps);
    let now = Utc::now();

    let pt = GpsPoint {
        lat,
        lon,
        satellites,
        fix_status,
        gps_time,
        received_at: now,
    };

    let verdict = {
        let mut filter = state
            .gps_filters
            .entry(router_sn.to_string())
            .or_insert_with(|| GpsFilter::new(cfg.gps_filter.clone()));
        filter.check(pt)
    };

    let mut tx = pool.begin().await.context("begin gps transaction")?;

    db::upsert_object(&mut *tx, router_sn).await?;
    db::insert_gps_raw(
        &mut *tx,
        &db::NewGpsRaw {
            router_sn,
            gps_time,
            lat,
            lon,
            satellites,
            fix_status,
            accepted: verdict.accepted,
            reject_reason: verdict.reject_reason.as_deref(),
        },
    )
    .await?;

    if verdict.accepted {
        let mut update_latest = true;
        if let Some(prev) = db::get_gps_latest(&mut *tx, router_sn).await? {
            let d = cgtw_geo::haversine_m(prev.lat, prev.lon, lat, lon);
            if d < cfg.gps_filter.deadband_m {
                update_latest = false;
            }
        }
        if update_latest {
            db::upsert_gps_latest(&mut *tx, router_sn, gps_time, lat, lon, satellites, fix_status).await?;
        }
    } else if cfg.events_policy.enable_gps_reject_events {
        db::insert_event(
            &mut *tx,
            &db::NewEvent {
                router_sn: router_sn.to_string(),
                equip_type: None,
                panel_id: None,
                event_type: "gps_jump_rejected".to_string(),
                description: Some(format!(
                    "reason={:?} lat={lat} lon={lon}",
                    verdict.reject_reason
                )),
                payload: Some(serde_json::json!({
                    "lat": lat,
                    "lon": lon,
                    "reject_reason": verdict.reject_reason,
                    "satellites": satellites,
                })),
            },
        )
        .await?;
    }

    tx.commit().await.context("commit gps transaction")?;

    tracing::debug!(
        router_sn,
        accepted = verdict.accepted,
        reject_reason = ?verdict.reject_reason,
        lat,
        lon,
        "gps processed"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoded (registers)
// ---------------------------------------------------------------------------

fn value_to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_to_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

async fn handle_decoded(
    router_sn: &str,
    panel_id: i32,
    data: DecodedPayload,
    cfg: &AppConfig,
    pool: &PgPool,
    state: &DispatchState,
) -> Result<()> {
    let equip_type = EQUIP_TYPE_PCC;

    let ts = data
        .timestamp
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let Some(registers) = data.registers else {
        tracing::warn!(router_sn, panel_id, "decoded message has no registers[]");
        return Ok(());
    };

    let mut addrs: Vec<i32> = registers
        .iter()
        .filter_map(|r| value_to_i32(&r.addr))
        .collect();
    addrs.sort_unstable();
    addrs.dedup();

    let now = Utc::now();

    let mut tx = pool.begin().await.context("begin decoded transaction")?;
    db::upsert_object(&mut *tx, router_sn).await?;
    db::upsert_equipment(&mut *tx, router_sn, equip_type, panel_id).await?;

    let prev_map = db::get_latest_state_rows_many(&mut *tx, router_sn, equip_type, panel_id, &addrs).await?;
    let catalog_map = db::get_register_catalog_rows_many(&mut *tx, equip_type, &addrs).await?;

    let mut latest_rows: HashMap<i32, db::LatestStateRow> = HashMap::new();
    let mut history_batch: Vec<db::NewHistory> = Vec::new();
    let mut event_rows: Vec<db::NewEvent> = Vec::new();

    for reg in &registers {
        process_register(
            cfg,
            router_sn,
            equip_type,
            panel_id,
            reg,
            ts,
            now,
            &prev_map,
            &catalog_map,
            state,
            &mut latest_rows,
            &mut history_batch,
            &mut event_rows,
        );
    }

    let latest_count = latest_rows.len();
    let history_count = history_batch.len();
    let events_count = event_rows.len();

    if !latest_rows.is_empty() {
        let rows: Vec<_> = latest_rows.into_values().collect();
        db::upsert_latest_state_batch(&mut *tx, &rows).await?;
    }
    if !history_batch.is_empty() {
        db::insert_history_batch(&mut *tx, &history_batch).await?;
    }
    if !event_rows.is_empty() {
        db::insert_event_batch(&mut *tx, &event_rows).await?;
    }

    tx.commit().await.context("commit decoded transaction")?;

    tracing::debug!(
        router_sn,
        panel_id,
        regs = registers.len(),
        latest = latest_count,
        history = history_count,
        events = events_count,
        "decoded processed"
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_register(
    cfg: &AppConfig,
    router_sn: &str,
    equip_type: &str,
    panel_id: i32,
    reg: &RegisterSample,
    ts: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    prev_map: &HashMap<i32, db::LatestStateRow>,
    catalog_map: &HashMap<i32, CatalogRow>,
    state: &DispatchState,
    latest_rows: &mut HashMap<i32, db::LatestStateRow>,
    history_batch: &mut Vec<db::NewHistory>,
    event_rows: &mut Vec<db::NewEvent>,
) {
    let Some(addr) = value_to_i32(&reg.addr) else {
        tracing::warn!(router_sn, panel_id, "register without addr");
        return;
    };

    let raw_val = reg.raw.as_ref().and_then(value_to_i64);
    let mut text = reg.text.clone();
    let dec_value = reg.value.as_ref().and_then(|v| {
        let d = value_to_decimal(v);
        if d.is_none() && text.is_none() {
            text = Some(v.to_string());
        }
        d
    });

    latest_rows.insert(
        addr,
        db::LatestStateRow {
            router_sn: router_sn.to_string(),
            equip_type: equip_type.to_string(),
            panel_id,
            addr,
            ts,
            value: dec_value,
            raw: raw_val,
            text: text.clone(),
            unit: reg.unit.clone(),
            name: reg.name.clone(),
            reason: reg.reason.clone(),
        },
    );

    if let Some(reason) = &reg.reason {
        if reason.contains(cgtw_schemas::UNKNOWN_REGISTER_MARKER)
            && cfg.events_policy.enable_unknown_register_events
        {
            event_rows.push(db::NewEvent {
                router_sn: router_sn.to_string(),
                equip_type: Some(equip_type.to_string()),
                panel_id: Some(panel_id),
                event_type: "unknown_register".to_string(),
                description: Some(format!("addr={addr} reason={reason}")),
                payload: Some(serde_json::json!({ "addr": addr, "reason": reason })),
            });
        }
    }

    let catalog_row = catalog_map.get(&addr);
    let kpi_map = cfg.history_policy.kpi_map();
    let params = resolve_params(&cfg.history_policy.defaults, &kpi_map, addr as i64, catalog_row);

    let key = (router_sn.to_string(), equip_type.to_string(), panel_id, addr);
    let last_h_ts = state.last_history_ts.get(&key).map(|v| *v);

    let prev = prev_map.get(&addr);
    let delta = SampleDelta {
        new_value: dec_value,
        new_raw: raw_val,
        new_text: text.as_deref(),
        new_reason: reg.reason.as_deref(),
        prev_value: prev.and_then(|p| p.value),
        prev_raw: prev.and_then(|p| p.raw),
        prev_text: prev.and_then(|p| p.text.as_deref()),
        prev_reason: prev.and_then(|p| p.reason.as_deref()),
    };

    let decision = should_write_history(&params, &delta, last_h_ts, now);
    if decision.write {
        history_batch.push(db::NewHistory {
            router_sn: router_sn.to_string(),
            equip_type: equip_type.to_string(),
            panel_id,
            addr,
            ts,
            value: dec_value,
            raw: raw_val,
            text,
            reason: reg.reason.clone(),
            write_reason: decision.write_reason,
        });
        state.last_history_ts.insert(key, now);
    }
}
