use thiserror::Error;

/// Failure reported by a [`KeyValueStore`](crate::persist::KeyValueStore) backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store backend error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync + 'static>),
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Encode(bincode::Error),
    #[error("Deserialization error: {0}")]
    Decode(bincode::Error),
}
