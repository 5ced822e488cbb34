use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("overlay driver subprocess failed: `{0}`")]
    SubprocessFailed(String),

    #[error("overlay interface is down")]
    InterfaceDown,
}
