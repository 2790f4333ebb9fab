use refinery::{AsyncMigrate, Report};

/// Embeds the migrations folder into the binary.
/// Note: this macro cannot see if the migrations folder has changed, so cargo
/// will usually reuse the cached build; run cargo clean to force a rebuild.
mod embedded_migrations {
    use refinery::embed_migrations;
    embed_migrations!("src/postgres/migrations");
}

/// Runs the migrations in /src/postgres/migrations in version order.
/// Refinery tracks applied versions in refinery_schema_history.
pub async fn run_migrations_async<C>(conn: &'_ mut C) -> Result<Report, Box<dyn std::error::Error>>
where
    C: AsyncMigrate + Send,
{
    Ok(embedded_migrations::migrations::runner().run_async(conn).await?)
}
