use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("device not found")]
    NotFound,

    #[error("device `{0}` is already registered for this user")]
    DeviceNameExists(String),

    /// Covers both sub-pool exhaustion and a user at `CLIENT_MAX_DEVICES_PER_USER`
    /// — the store maps both conditions to the same underlying failure since
    /// both mean "no slot available for this device" (§4.1 `allocate` contract).
    #[error("no free address in the client pool, or the user is at its device limit")]
    PoolExhausted,

    #[error("config token is invalid or has already been consumed")]
    InvalidToken,

    #[error("device configuration has expired")]
    Expired,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DeviceNameExists(n) => ClientError::DeviceNameExists(n),
            StoreError::PoolExhausted => ClientError::PoolExhausted,
            other => ClientError::Store(other),
        }
    }
}
