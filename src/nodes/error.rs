use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("node not found")]
    NotFound,

    #[error("hostname `{0}` is already registered to a different public key")]
    HostnameConflict(String),

    #[error("no free address in the node pool")]
    PoolExhausted,

    #[error("node is not active")]
    NotActive,

    #[error(transparent)]
    Store(StoreError),
}

/// Reclassifies the two `StoreError` variants the HTTP layer cares about
/// (409 `HOSTNAME_EXISTS`, 503 `IP_POOL_EXHAUSTED`); everything else passes
/// through as an opaque store failure (§7).
impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::HostnameConflict(h) => NodeError::HostnameConflict(h),
            StoreError::PoolExhausted => NodeError::PoolExhausted,
            other => NodeError::Store(other),
        }
    }
}
