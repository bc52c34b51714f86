//! Extension host error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("invalid entry point: {0}")]
    InvalidEntryPoint(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("execution timeout: extension {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: extension {0}")]
    MemoryExceeded(String),

    #[error("invocation failed: {0}")]
    Invocation(String),

    #[error("request {kind} timed out on channel {channel}")]
    RequestTimeout { kind: String, channel: String },

    #[error("channel closed")]
    ChannelClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    // ── Display messages ──────────────────────────────────────────────

    #[test]
    fn test_display_manifest() {
        let err = ExtensionError::Manifest("missing name field".into());
        assert_eq!(err.to_string(), "manifest error: missing name field");
    }

    #[test]
    fn test_display_discovery() {
        let err = ExtensionError::Discovery("gave up after 3 retries".into());
        assert_eq!(err.to_string(), "discovery failed: gave up after 3 retries");
    }

    #[test]
    fn test_display_invalid_entry_point() {
        let err = ExtensionError::InvalidEntryPoint("no descriptors".into());
        assert_eq!(err.to_string(), "invalid entry point: no descriptors");
    }

    #[test]
    fn test_display_fuel_exhausted() {
        let err = ExtensionError::FuelExhausted("my-ext".into());
        assert_eq!(
            err.to_string(),
            "execution timeout: extension my-ext exceeded fuel limit"
        );
    }

    #[test]
    fn test_display_request_timeout() {
        let err = ExtensionError::RequestTimeout {
            kind: "get-volume".into(),
            channel: "abc".into(),
        };
        assert_eq!(
            err.to_string(),
            "request get-volume timed out on channel abc"
        );
    }

    #[test]
    fn test_display_channel_closed() {
        assert_eq!(ExtensionError::ChannelClosed.to_string(), "channel closed");
    }

    // ── From conversions ──────────────────────────────────────────────

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: ExtensionError = io_err.into();
        assert!(matches!(err, ExtensionError::Io(_)));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("bad json{{{").unwrap_err();
        let err: ExtensionError = json_err.into();
        assert!(matches!(err, ExtensionError::Serialization(_)));
    }

    // ── Error trait source chain ──────────────────────────────────────

    #[test]
    fn test_error_source_io() {
        use std::error::Error;
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broken");
        let err: ExtensionError = io_err.into();
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_source_string_variants() {
        use std::error::Error;
        let err = ExtensionError::Sandbox("trap".into());
        assert!(err.source().is_none());
    }
}
