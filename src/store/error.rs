use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: `{0}`")]
    Database(String),

    #[error("hostname `{0}` is already registered to a different public key")]
    HostnameConflict(String),

    #[error("policy name `{0}` already exists")]
    PolicyExists(String),

    #[error("device name `{0}` already exists for this user")]
    DeviceNameExists(String),

    #[error("config token already in use")]
    TokenExists,

    #[error("group hierarchy would contain a cycle")]
    GroupCycle,

    #[error("no free address in pool")]
    PoolExhausted,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // Postgres unique_violation: callers that care about *which* constraint
        // fired (hostname vs. policy name vs. device name) catch it earlier via
        // a SELECT before INSERT; this is the last-resort mapping for races.
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                return StoreError::Database(format!("unique violation: {db_err}"));
            }
        }
        StoreError::Database(err.to_string())
    }
}
