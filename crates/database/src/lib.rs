pub mod error;
pub mod mock_database_service;
pub mod postgres;
pub mod traits;

pub use error::DatabaseError;
pub use mock_database_service::MockDatabaseService;
pub use postgres::PostgresDatabaseService;
pub use traits::DatabaseService;

use mevscope_common::PostgresConfig;

/// Connects the pool and runs migrations. Fatal at startup on failure.
pub async fn start_db_service(
    config: &PostgresConfig,
) -> Result<PostgresDatabaseService, DatabaseError> {
    let db = PostgresDatabaseService::new(config)?;
    db.run_migrations().await?;
    Ok(db)
}
