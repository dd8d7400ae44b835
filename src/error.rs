//! Error types for rtpscribe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScribeError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Media plane errors
    #[error("Failed to bind media socket on {addr}: {message}")]
    MediaBind { addr: String, message: String },

    #[error("Media socket receive failed: {message}")]
    MediaReceive { message: String },

    // Audio stream registry errors
    #[error("An audio stream is already registered for port {port}")]
    StreamExists { port: u16 },

    // Provider errors
    #[error("Provider {provider} failed to open a session: {message}")]
    ProviderOpen { provider: String, message: String },

    #[error("Provider {provider} session error: {message}")]
    ProviderSession { provider: String, message: String },

    // Control plane errors
    #[error("Invalid control message on {topic}: {message}")]
    ControlMessage { topic: String, message: String },

    // Message bus errors
    #[error("Bus socket error: {message}")]
    BusSocket { message: String },

    #[error("Bus protocol error: {message}")]
    BusProtocol { message: String },

    #[error("Bus connection failed: {message}")]
    BusConnection { message: String },

    #[error("Publish to {topic} failed after {attempts} attempt(s): {message}")]
    PublishExhausted {
        topic: String,
        attempts: u32,
        message: String,
    },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ScribeError>;
