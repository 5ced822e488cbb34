use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("node not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}
