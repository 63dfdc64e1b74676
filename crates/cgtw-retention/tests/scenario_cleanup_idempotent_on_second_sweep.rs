use cgtw_config::RetentionCfg;

/// Running a sweep twice with no new data in between deletes zero rows the
/// second time.
///
/// DB-backed test, skipped if CGTW_DATABASE_URL is not set.
#[tokio::test]
async fn cleanup_idempotent_on_second_sweep() -> anyhow::Result<()> {
    let url = match std::env::var(cgtw_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: CGTW_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await?;
    cgtw_db::migrate(&pool).await?;
    cgtw_db::upsert_object(&pool, "TEST-RET-1").await?;

    sqlx::query(
        "INSERT INTO gps_raw_history (router_sn, lat, lon, accepted, received_at) \
         VALUES ($1, 0, 0, true, now() - interval '1000 hours')",
    )
    .bind("TEST-RET-1")
    .execute(&pool)
    .await?;

    let cfg = RetentionCfg {
        gps_raw_hours: 1,
        history_days: 1,
        events_days: 1,
        cleanup_interval_hours: 24,
        batch_size: 500,
    };

    let first = cgtw_retention::cleanup_once(&pool, &cfg).await?;
    assert_eq!(first.gps_raw, 1);

    let second = cgtw_retention::cleanup_once(&pool, &cfg).await?;
    assert_eq!(second.gps_raw, 0);
    assert_eq!(second.history, 0);
    assert_eq!(second.events, 0);

    Ok(())
}
