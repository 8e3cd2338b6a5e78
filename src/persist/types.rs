#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("format mismatch: {0}")]
    Format(String),
    #[error("listing {0} not found")]
    NotFound(String),
}

pub type PersistResult<T> = Result<T, PersistError>;

impl From<sqlx::Error> for PersistError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
                PersistError::Format(e.to_string())
            }
            other => PersistError::Io(other.to_string()),
        }
    }
}
