use deadpool_postgres::PoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("postgres pool error: {0}")]
    PostgresPool(#[from] PoolError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("row parsing error: {0}")]
    RowParsing(Box<dyn std::error::Error + Send + Sync>),

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),
}

impl DatabaseError {
    pub fn row_parsing(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        DatabaseError::RowParsing(Box::new(err))
    }
}
