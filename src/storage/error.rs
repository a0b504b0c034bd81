use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("delivery not found: {0}")]
    NotFound(String),

    #[error("delivery already exists: {0}")]
    Duplicate(String),

    /// A stored row could not be mapped back into the domain model.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StorageError::Duplicate(db_err.message().to_string())
            }
            _ => StorageError::Database(err.to_string()),
        }
    }
}
