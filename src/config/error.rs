use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading config file: `{0}`")]
    IOError(#[from] std::io::Error),

    #[error("error parsing config YAML: `{0}`")]
    SerdeYamlError(#[from] serde_yaml::Error),

    #[error("ADMIN_SECRET is not set (env var or config file)")]
    MissingAdminSecret,

    #[error("DATABASE_URL is not set (env var or config file)")]
    MissingDatabaseUrl,

    #[error("overlay_gateway is not within overlay_network")]
    GatewayOutsideNetwork,

    #[error("client_ip_pool_start must be <= client_ip_pool_end")]
    InvalidClientPool,
}
