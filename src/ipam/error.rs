use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpamError {
    #[error("no free address in pool")]
    PoolExhausted,

    #[error("address is outside the configured network")]
    OutsideNetwork,

    #[error("address is in the reserved set")]
    Reserved,

    #[error("address could not be parsed")]
    InvalidAddress,
}
