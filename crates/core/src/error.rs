/// Errors raised by core domain checks.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A request was rejected before it reached the network.
    #[error("Validation failed: {0}")]
    Validation(String),
}
