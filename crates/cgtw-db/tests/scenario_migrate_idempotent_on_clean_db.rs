/// Migrating twice on a clean DB must be idempotent.
///
/// DB-backed test, skipped if CGTW_DATABASE_URL is not set.
#[tokio::test]
async fn migrate_idempotent_on_clean_db() -> anyhow::Result<()> {
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
    cgtw_db::migrate(&pool).await?;

    let st = cgtw_db::status(&pool).await?;
    assert!(st.ok);
    assert!(st.has_history_table);

    Ok(())
}
