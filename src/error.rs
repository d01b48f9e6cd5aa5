//! Error taxonomy for the host.
//!
//! Mirrors the six error kinds a client-facing failure can fall into
//! (protocol grammar, auth, resource exhaustion, timeout, transient,
//! fatal) and keeps them attached to concrete sub-errors per subsystem.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HostError>;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("protocol grammar error: {0}")]
    ProtocolGrammar(#[from] ProtocolError),

    #[error("authentication failure: {0}")]
    AuthFail(#[from] AuthError),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(#[from] ResourceError),

    #[error("operation timed out: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("transient error: {0}")]
    Transient(#[from] TransientError),

    #[error("fatal startup error: {0}")]
    Fatal(#[from] FatalError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed RTSP packet")]
    MalformedRtsp,
    #[error("malformed control packet (truncated at {field})")]
    MalformedControlPacket { field: &'static str },
    #[error("malformed pair request: missing {field}")]
    MalformedPairRequest { field: &'static str },
    #[error("unknown RTSP command: {command}")]
    UnknownCommand { command: String },
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("AES-GCM authentication tag mismatch")]
    TagMismatch,
    #[error("RSA signature verification failed")]
    SignatureInvalid,
    #[error("unknown client certificate")]
    UnknownClient,
    #[error("pairing hash mismatch")]
    PairingHashMismatch,
    #[error("TLS handshake failed")]
    TlsHandshakeFailed,
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("no free UDP port in pool starting at {pool_base}")]
    NoFreePort { pool_base: u16 },
    #[error("runner failed to start: {reason}")]
    RunnerStartFailed { reason: String },
    #[error("encoder pipeline failed to build: {reason}")]
    EncoderPipelineFailed { reason: String },
    #[error("resource exhausted: {resource}")]
    Exhausted { resource: String },
}

#[derive(Error, Debug)]
pub enum TimeoutError {
    #[error("RTSP read deadline ({0:?}) exceeded")]
    RtspRead(Duration),
    #[error("RTP ping wait ({0:?}) exceeded")]
    RtpPing(Duration),
    #[error("pairing PIN wait exceeded")]
    PairingPin,
}

#[derive(Error, Debug)]
pub enum TransientError {
    #[error("socket read error: {0}")]
    SocketRead(String),
    #[error("FEC encode failed for oversized frame ({shards} shards)")]
    FecOverflow { shards: usize },
}

#[derive(Error, Debug)]
pub enum FatalError {
    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),
    #[error("failed to bind listener {addr}: {reason}")]
    ListenerBind { addr: String, reason: String },
}

impl HostError {
    /// Stable numeric identifier for logs / REST responses.
    pub fn error_code(&self) -> u32 {
        match self {
            HostError::ProtocolGrammar(_) => 4000,
            HostError::AuthFail(_) => 4010,
            HostError::ResourceUnavailable(_) => 5030,
            HostError::Timeout(_) => 5040,
            HostError::Transient(_) => 5000,
            HostError::Fatal(_) => 5990,
            HostError::Config(_) => 5010,
            HostError::Io(_) => 5020,
            HostError::Internal(_) => 5999,
        }
    }

    /// Whether the caller may retry the same operation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, HostError::Fatal(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HostError::ProtocolGrammar(_) => ErrorSeverity::Low,
            HostError::AuthFail(_) => ErrorSeverity::Medium,
            HostError::ResourceUnavailable(_) => ErrorSeverity::Medium,
            HostError::Timeout(_) => ErrorSeverity::Low,
            HostError::Transient(_) => ErrorSeverity::Low,
            HostError::Fatal(_) => ErrorSeverity::Critical,
            HostError::Config(_) => ErrorSeverity::Critical,
            HostError::Io(_) => ErrorSeverity::Medium,
            HostError::Internal(_) => ErrorSeverity::High,
        }
    }

    /// Never includes which pairing/auth step actually failed.
    pub fn user_message(&self) -> String {
        match self {
            HostError::AuthFail(_) => "authentication failed".to_string(),
            HostError::ProtocolGrammar(_) => "malformed request".to_string(),
            HostError::ResourceUnavailable(_) => "server is busy".to_string(),
            HostError::Timeout(_) => "request timed out".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Context layer used at subsystem boundaries to attach a human-readable
/// cause chain without leaking internal detail to the client.
pub trait ErrorContext<T> {
    fn with_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<HostError>> ErrorContext<T> for std::result::Result<T, E> {
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let inner: HostError = e.into();
            tracing::debug!(context = %context.into(), error = %inner, "error context");
            inner
        })
    }
}
