use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("policy not found")]
    NotFound,

    #[error("policy name `{0}` already exists")]
    PolicyExists(String),

    #[error("invalid policy: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for PolicyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PolicyExists(n) => PolicyError::PolicyExists(n),
            other => PolicyError::Store(other),
        }
    }
}
