use celoe_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::Executor;
use tracing::info;

/// Runs database migrations on the reporting database `celoeapi` schema.
///
/// Creates a connection pool to the reporting database, sets up the `celoeapi`
/// schema, and applies all pending migrations. The `search_path` is set so the
/// `_sqlx_migrations` metadata table also lands inside that schema instead of
/// cluttering the public schema.
pub async fn apply_target_migrations(
    connection_config: &PgConnectionConfig,
) -> Result<(), sqlx::Error> {
    let options = connection_config.with_db();

    let pool = PgPoolOptions::new()
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists celoeapi;").await?;
                conn.execute("set search_path = 'celoeapi';").await?;

                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    info!("applying reporting schema migrations");

    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await?;

    info!("reporting schema migrations successfully applied");

    Ok(())
}
