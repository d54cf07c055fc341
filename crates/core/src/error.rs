#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Setting {namespace}.{key} has an unexpected shape: {reason}")]
    Setting {
        namespace: String,
        key: String,
        reason: String,
    },

    #[error("Settings store error: {0}")]
    Store(String),
}
