use thiserror::Error;

#[derive(Error, Debug)]
pub enum GaldrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Invalid password: page authentication failed")]
    InvalidPassword,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Write conflict on {collection}:{id}")]
    WriteConflict { collection: String, id: i64 },

    #[error("Unique constraint violation on index '{index}'")]
    UniqueViolation { index: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transaction has already ended")]
    TransactionEnded,

    #[error("Database handle is poisoned after a fatal error: {0}")]
    Poisoned(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, GaldrError>;
