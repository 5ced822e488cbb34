use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::format::PrettyFields;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInitError(String),
}

/// Process-wide logging bootstrap. Controller components log through `tracing`;
/// this is the single place the subscriber is installed.
pub struct Logging;

impl Logging {
    pub fn try_init() -> Result<(), LoggingError> {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(Level::INFO.into())
                    .from_env_lossy(),
            )
            .fmt_fields(PrettyFields::new())
            .try_init()
            .map_err(|_| {
                LoggingError::TryInitError(
                    "unable to set controller global logging subscriber".to_string(),
                )
            })
    }
}
