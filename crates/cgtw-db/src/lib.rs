//! Storage gateway: every SQL statement the telemetry writer issues lives
//! here, behind typed functions. Callers never see raw SQL.
//!
//! Most functions are generic over `sqlx::PgExecutor` so callers can pass
//! either a `&PgPool` or a `&mut Transaction<'_, Postgres>` — the dispatcher
//! wraps each inbound message in one transaction.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};

use cgtw_config::PostgresCfg;
use cgtw_history::CatalogRow;

pub const ENV_DB_URL: &str = "CGTW_DATABASE_URL";

/// Connect using an explicit config (preferred — `PostgresCfg::dsn` builds
/// the URL, so the password never needs to round-trip through env vars).
pub async fn connect(cfg: &PostgresCfg) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(cfg.pool_min)
        .max_connections(cfg.pool_max)
        .connect(&cfg.dsn())
        .await
        .context("failed to connect to Postgres")?;
    tracing::info!(pool_min = cfg.pool_min, pool_max = cfg.pool_max, "pg pool created");
    Ok(pool)
}

/// Connect using `CGTW_DATABASE_URL`, for CLI/test use where no YAML config
/// has been loaded.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_history_table: bool,
}

pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from information_schema.tables
            where table_schema = 'public' and table_name = 'history'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_history_table: exists,
    })
}

// ---------------------------------------------------------------------------
// Objects / equipment
// ---------------------------------------------------------------------------

pub async fn upsert_object<'e, E>(executor: E, router_sn: &str) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO objects (router_sn) VALUES ($1)
        ON CONFLICT (router_sn) DO UPDATE SET updated_at = now()
        "#,
    )
    .bind(router_sn)
    .execute(executor)
    .await
    .context("upsert_object failed")?;
    Ok(())
}

pub async fn upsert_equipment<'e, E>(
    executor: E,
    router_sn: &str,
    equip_type: &str,
    panel_id: i32,
) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO equipment (router_sn, equip_type, panel_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (router_sn, equip_type, panel_id)
        DO UPDATE SET last_seen_at = now()
        "#,
    )
    .bind(router_sn)
    .bind(equip_type)
    .bind(panel_id)
    .execute(executor)
    .await
    .context("upsert_equipment failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// GPS
// ---------------------------------------------------------------------------

pub struct NewGpsRaw<'a> {
    pub router_sn: &'a str,
    pub gps_time: Option<DateTime<Utc>>,
    pub lat: f64,
    pub lon: f64,
    pub satellites: Option<i32>,
    pub fix_status: Option<i32>,
    pub accepted: bool,
    pub reject_reason: Option<&'a str>,
}

pub async fn insert_gps_raw<'e, E>(executor: E, row: &NewGpsRaw<'_>) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO gps_raw_history
          (router_sn, gps_time, lat, lon, satellites, fix_status, accepted, reject_reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(row.router_sn)
    .bind(row.gps_time)
    .bind(row.lat)
    .bind(row.lon)
    .bind(row.satellites)
    .bind(row.fix_status)
    .bind(row.accepted)
    .bind(row.reject_reason)
    .execute(executor)
    .await
    .context("insert_gps_raw failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct GpsLatestRow {
    pub router_sn: String,
    pub gps_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub satellites: Option<i32>,
    pub fix_status: Option<i32>,
}

pub async fn upsert_gps_latest<'e, E>(
    executor: E,
    router_sn: &str,
    gps_time: Option<DateTime<Utc>>,
    lat: f64,
    lon: f64,
    satellites: Option<i32>,
    fix_status: Option<i32>,
) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO gps_latest_filtered
          (router_sn, gps_time, received_at, lat, lon, satellites, fix_status)
        VALUES ($1, $2, now(), $3, $4, $5, $6)
        ON CONFLICT (router_sn) DO UPDATE SET
          gps_time    = EXCLUDED.gps_time,
          received_at = EXCLUDED.received_at,
          lat         = EXCLUDED.lat,
          lon         = EXCLUDED.lon,
          satellites  = EXCLUDED.satellites,
          fix_status  = EXCLUDED.fix_status
        "#,
    )
    .bind(router_sn)
    .bind(gps_time)
    .bind(lat)
    .bind(lon)
    .bind(satellites)
    .bind(fix_status)
    .execute(executor)
    .await
    .context("upsert_gps_latest failed")?;
    Ok(())
}

pub async fn get_gps_latest<'e, E>(executor: E, router_sn: &str) -> Result<Option<GpsLatestRow>>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query("SELECT * FROM gps_latest_filtered WHERE router_sn = $1")
        .bind(router_sn)
        .fetch_optional(executor)
        .await
        .context("get_gps_latest failed")?;

    row.map(|r| {
        Ok(GpsLatestRow {
            router_sn: r.try_get("router_sn")?,
            gps_time: r.try_get("gps_time")?,
            received_at: r.try_get("received_at")?,
            lat: r.try_get("lat")?,
            lon: r.try_get("lon")?,
            satellites: r.try_get("satellites")?,
            fix_status: r.try_get("fix_status")?,
        })
    })
    .transpose()
    .context("decode gps_latest_filtered row")
}

/// Every row in `gps_latest_filtered`, for warm-starting the in-memory
/// per-router GPS filters at boot.
pub async fn list_gps_latest(pool: &PgPool) -> Result<Vec<GpsLatestRow>> {
    let rows = sqlx::query("SELECT * FROM gps_latest_filtered")
        .fetch_all(pool)
        .await
        .context("list_gps_latest failed")?;

    rows.into_iter()
        .map(|r| {
            Ok(GpsLatestRow {
                router_sn: r.try_get("router_sn")?,
                gps_time: r.try_get("gps_time")?,
                received_at: r.try_get("received_at")?,
                lat: r.try_get("lat")?,
                lon: r.try_get("lon")?,
                satellites: r.try_get("satellites")?,
                fix_status: r.try_get("fix_status")?,
            })
        })
        .collect::<Result<Vec<_>>>()
        .context("decode gps_latest_filtered rows")
}

// ---------------------------------------------------------------------------
// Latest state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LatestStateRow {
    pub router_sn: String,
    pub equip_type: String,
    pub panel_id: i32,
    pub addr: i32,
    pub ts: Option<DateTime<Utc>>,
    pub value: Option<Decimal>,
    pub raw: Option<i64>,
    pub text: Option<String>,
    pub unit: Option<String>,
    pub name: Option<String>,
    pub reason: Option<String>,
}

/// Batch upsert; every row always overwrites `latest_state`, independent of
/// the history-admission policy.
pub async fn upsert_latest_state_batch<'e, E>(executor: E, rows: &[LatestStateRow]) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    if rows.is_empty() {
        return Ok(());
    }

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        "INSERT INTO latest_state (router_sn, equip_type, panel_id, addr, ts, value, raw, text, unit, name, reason, updated_at) ",
    );

    qb.push_values(rows, |mut b, row| {
        b.push_bind(&row.router_sn)
            .push_bind(&row.equip_type)
            .push_bind(row.panel_id)
            .push_bind(row.addr)
            .push_bind(row.ts)
            .push_bind(row.value)
            .push_bind(row.raw)
            .push_bind(&row.text)
            .push_bind(&row.unit)
            .push_bind(&row.name)
            .push_bind(&row.reason)
            .push("now()");
    });

    qb.push(
        r#"
        ON CONFLICT (router_sn, equip_type, panel_id, addr) DO UPDATE SET
          ts = EXCLUDED.ts,
          value = EXCLUDED.value,
          raw = EXCLUDED.raw,
          text = EXCLUDED.text,
          unit = EXCLUDED.unit,
          name = EXCLUDED.name,
          reason = EXCLUDED.reason,
          updated_at = now()
        "#,
    );

    qb.build()
        .execute(executor)
        .await
        .context("upsert_latest_state_batch failed")?;
    Ok(())
}

pub async fn get_latest_state_rows_many<'e, E>(
    executor: E,
    router_sn: &str,
    equip_type: &str,
    panel_id: i32,
    addrs: &[i32],
) -> Result<HashMap<i32, LatestStateRow>>
where
    E: sqlx::PgExecutor<'e>,
{
    if addrs.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT * FROM latest_state
        WHERE router_sn = $1 AND equip_type = $2 AND panel_id = $3 AND addr = ANY($4)
        "#,
    )
    .bind(router_sn)
    .bind(equip_type)
    .bind(panel_id)
    .bind(addrs)
    .fetch_all(executor)
    .await
    .context("get_latest_state_rows_many failed")?;

    let mut out = HashMap::with_capacity(rows.len());
    for r in rows {
        let addr: i32 = r.try_get("addr")?;
        out.insert(
            addr,
            LatestStateRow {
                router_sn: r.try_get("router_sn")?,
                equip_type: r.try_get("equip_type")?,
                panel_id: r.try_get("panel_id")?,
                addr,
                ts: r.try_get("ts")?,
                value: r.try_get("value")?,
                raw: r.try_get("raw")?,
                text: r.try_get("text")?,
                unit: r.try_get("unit")?,
                name: r.try_get("name")?,
                reason: r.try_get("reason")?,
            },
        );
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewHistory {
    pub router_sn: String,
    pub equip_type: String,
    pub panel_id: i32,
    pub addr: i32,
    pub ts: Option<DateTime<Utc>>,
    pub value: Option<Decimal>,
    pub raw: Option<i64>,
    pub text: Option<String>,
    pub reason: Option<String>,
    pub write_reason: &'static str,
}

pub async fn insert_history_batch<'e, E>(executor: E, rows: &[NewHistory]) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    if rows.is_empty() {
        return Ok(());
    }

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        "INSERT INTO history (router_sn, equip_type, panel_id, addr, ts, value, raw, text, reason, write_reason) ",
    );
    qb.push_values(rows, |mut b, row| {
        b.push_bind(&row.router_sn)
            .push_bind(&row.equip_type)
            .push_bind(row.panel_id)
            .push_bind(row.addr)
            .push_bind(row.ts)
            .push_bind(row.value)
            .push_bind(row.raw)
            .push_bind(&row.text)
            .push_bind(&row.reason)
            .push_bind(row.write_reason);
    });

    qb.build()
        .execute(executor)
        .await
        .context("insert_history_batch failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub router_sn: String,
    pub equip_type: Option<String>,
    pub panel_id: Option<i32>,
    pub event_type: String,
    pub description: Option<String>,
    pub payload: Option<serde_json::Value>,
}

pub async fn insert_event<'e, E>(executor: E, ev: &NewEvent) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO events (router_sn, equip_type, panel_id, type, description, payload)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&ev.router_sn)
    .bind(&ev.equip_type)
    .bind(ev.panel_id)
    .bind(&ev.event_type)
    .bind(&ev.description)
    .bind(&ev.payload)
    .execute(executor)
    .await
    .context("insert_event failed")?;
    Ok(())
}

pub async fn insert_event_batch<'e, E>(executor: E, rows: &[NewEvent]) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    if rows.is_empty() {
        return Ok(());
    }

    let mut qb: QueryBuilder<sqlx::Postgres> =
        QueryBuilder::new("INSERT INTO events (router_sn, equip_type, panel_id, type, description, payload) ");
    qb.push_values(rows, |mut b, row| {
        b.push_bind(&row.router_sn)
            .push_bind(&row.equip_type)
            .push_bind(row.panel_id)
            .push_bind(&row.event_type)
            .push_bind(&row.description)
            .push_bind(&row.payload);
    });

    qb.build()
        .execute(executor)
        .await
        .context("insert_event_batch failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

async fn cleanup_loop(pool: &PgPool, sql: &str, n: i64, batch: i64) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let result = sqlx::query(sql)
            .bind(n)
            .bind(batch)
            .execute(pool)
            .await
            .with_context(|| format!("cleanup query failed: {sql}"))?;
        let affected = result.rows_affected();
        total += affected;
        if affected < batch as u64 {
            break;
        }
    }
    Ok(total)
}

pub async fn cleanup_gps_raw(pool: &PgPool, hours: i64, batch: i64) -> Result<u64> {
    cleanup_loop(
        pool,
        r#"
        DELETE FROM gps_raw_history WHERE id IN (
          SELECT id FROM gps_raw_history
          WHERE received_at < now() - make_interval(hours => $1)
          ORDER BY id
          LIMIT $2
        )
        "#,
        hours,
        batch,
    )
    .await
}

pub async fn cleanup_history(pool: &PgPool, days: i64, batch: i64) -> Result<u64> {
    cleanup_loop(
        pool,
        r#"
        DELETE FROM history WHERE id IN (
          SELECT id FROM history
          WHERE received_at < now() - make_interval(days => $1)
          ORDER BY id
          LIMIT $2
        )
        "#,
        days,
        batch,
    )
    .await
}

pub async fn cleanup_events(pool: &PgPool, days: i64, batch: i64) -> Result<u64> {
    cleanup_loop(
        pool,
        r#"
        DELETE FROM events WHERE id IN (
          SELECT id FROM events
          WHERE created_at < now() - make_interval(days => $1)
          ORDER BY id
          LIMIT $2
        )
        "#,
        days,
        batch,
    )
    .await
}

// ---------------------------------------------------------------------------
// Register catalog
// ---------------------------------------------------------------------------

pub async fn get_register_catalog_rows_many<'e, E>(
    executor: E,
    equip_type: &str,
    addrs: &[i32],
) -> Result<HashMap<i32, CatalogRow>>
where
    E: sqlx::PgExecutor<'e>,
{
    if addrs.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT * FROM register_catalog
        WHERE equip_type = $1 AND addr = ANY($2)
        "#,
    )
    .bind(equip_type)
    .bind(addrs)
    .fetch_all(executor)
    .await
    .context("get_register_catalog_rows_many failed")?;

    let mut out = HashMap::with_capacity(rows.len());
    for r in rows {
        let addr: i32 = r.try_get("addr")?;
        out.insert(
            addr,
            CatalogRow {
                tolerance: r.try_get("tolerance")?,
                min_interval_sec: r
                    .try_get::<Option<i32>, _>("min_interval_sec")?
                    .map(i64::from),
                heartbeat_sec: r.try_get::<Option<i32>, _>("heartbeat_sec")?.map(i64::from),
                store_history: r.try_get("store_history")?,
                value_kind: r.try_get("value_kind")?,
            },
        );
    }
    Ok(out)
}
