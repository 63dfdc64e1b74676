use cgtw_config::AppConfig;
use cgtw_dispatch::{dispatch, DispatchState};

async fn test_pool() -> Option<sqlx::PgPool> {
    let url = std::env::var(cgtw_db::ENV_DB_URL).ok()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .ok()?;
    cgtw_db::migrate(&pool).await.ok()?;
    Some(pool)
}

macro_rules! skip_without_db {
    ($pool:ident) => {
        let $pool = match test_pool().await {
            Some(p) => p,
            None => {
                eprintln!("SKIP: CGTW_DATABASE_URL not set");
                return Ok(());
            }
        };
    };
}

fn decoded_topic(sn: &str, panel: i32) -> String {
    format!("cg/v1/decoded/SN/{sn}/pcc/{panel}")
}

/// A register whose catalog row sets `store_history = NULL` never writes to
/// `history`, regardless of how much its value changes.
#[tokio::test]
async fn store_history_false_suppresses_all_history_writes() -> anyhow::Result<()> {
    skip_without_db!(pool);
    let cfg = AppConfig::default();
    let state = DispatchState::new();

    sqlx::query(
        "INSERT INTO register_catalog (equip_type, addr, store_history) VALUES ('pcc', 50001, NULL)",
    )
    .execute(&pool)
    .await?;

    let topic = decoded_topic("TEST-D1", 1);
    let payload = serde_json::json!({
        "registers": [{ "addr": 50001, "value": 10.0 }]
    })
    .to_string()
    .into_bytes();
    dispatch(&topic, &payload, &cfg, &pool, &state).await?;

    let payload2 = serde_json::json!({
        "registers": [{ "addr": 50001, "value": 999.0 }]
    })
    .to_string()
    .into_bytes();
    dispatch(&topic, &payload2, &cfg, &pool, &state).await?;

    let hist: Vec<(i64,)> = sqlx::query_as(
        "SELECT count(*) FROM history WHERE router_sn = $1 AND addr = 50001",
    )
    .bind("TEST-D1")
    .fetch_all(&pool)
    .await?;
    assert_eq!(hist[0].0, 0);

    let latest = cgtw_db::get_latest_state_rows_many(&pool, "TEST-D1", "pcc", 1, &[50001]).await?;
    assert_eq!(latest[&50001].value.unwrap().to_string(), "999.0");

    Ok(())
}

/// Duplicate addresses within a single decoded message collapse to one
/// `latest_state` row — the later entry wins.
#[tokio::test]
async fn duplicate_addr_in_one_message_keeps_last_value_only() -> anyhow::Result<()> {
    skip_without_db!(pool);
    let cfg = AppConfig::default();
    let state = DispatchState::new();

    let topic = decoded_topic("TEST-D2", 1);
    let payload = serde_json::json!({
        "registers": [
            { "addr": 40050, "value": 1.0 },
            { "addr": 40050, "value": 2.0 },
        ]
    })
    .to_string()
    .into_bytes();
    dispatch(&topic, &payload, &cfg, &pool, &state).await?;

    let rows = cgtw_db::get_latest_state_rows_many(&pool, "TEST-D2", "pcc", 1, &[40050]).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[&40050].value.unwrap().to_string(), "2.0");

    Ok(())
}
