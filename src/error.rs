#[derive(Debug, thiserror::Error)]
pub enum RateGateError {
    //redis connection or operation error
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
    //config error (unknown policy name, bad parameters)
    #[error("Invalid configuration: {0}")]
    Config(String),
}

// result type alias for convenience
pub type Result<T> = std::result::Result<T, RateGateError>;
