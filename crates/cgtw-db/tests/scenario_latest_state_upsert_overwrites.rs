use cgtw_db::LatestStateRow;
use rust_decimal::Decimal;

/// A second upsert for the same (router, equip, panel, addr) must overwrite
/// the row in place, not create a second one.
///
/// DB-backed test, skipped if CGTW_DATABASE_URL is not set.
#[tokio::test]
async fn upsert_overwrites_existing_row() -> anyhow::Result<()> {
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
    cgtw_db::upsert_object(&pool, "TEST-SN-1").await?;

    let row = |value: Decimal| LatestStateRow {
        router_sn: "TEST-SN-1".to_string(),
        equip_type: "pcc".to_string(),
        panel_id: 1,
        addr: 40034,
        ts: None,
        value: Some(value),
        raw: None,
        text: None,
        unit: None,
        name: None,
        reason: None,
    };

    cgtw_db::upsert_latest_state_batch(&pool, &[row(Decimal::new(150, 0))]).await?;
    cgtw_db::upsert_latest_state_batch(&pool, &[row(Decimal::new(160, 0))]).await?;

    let got = cgtw_db::get_latest_state_rows_many(&pool, "TEST-SN-1", "pcc", 1, &[40034]).await?;
    assert_eq!(got.len(), 1);
    assert_eq!(got[&40034].value, Some(Decimal::new(160, 0)));

    Ok(())
}
