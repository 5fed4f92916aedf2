//! Error types for HubSpoke

use serde::Serialize;
use thiserror::Error;

/// Result type alias using HubSpoke Error
pub type Result<T> = std::result::Result<T, Error>;

/// HubSpoke error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid CIDR {cidr}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Custom address {address} is not usable in network {network}")]
    InvalidCustomAddress { address: String, network: String },

    #[error("Invalid public key format: must be a 44-character base64 string")]
    InvalidPublicKey,

    #[error("Malformed installation token")]
    InvalidSecret,

    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Installation token not found")]
    CredentialNotFound,

    #[error("Installation token has expired")]
    CredentialExpired,

    #[error("Installation token has already been used")]
    CredentialAlreadyUsed,

    #[error("Group token registration limit reached ({limit})")]
    GroupLimitReached { limit: u32 },

    #[error("This host has already registered with this group token as {existing}")]
    DuplicateEnrollment { existing: String },

    #[error("Public key already registered")]
    DuplicatePublicKey,

    #[error("Address {0} is already in use")]
    AddressInUse(String),

    #[error("No available addresses in {0}")]
    PoolExhausted(String),

    #[error("Cluster still has {count} registered node(s); remove them first")]
    ClusterHasNodes { count: u32 },

    #[error("Hub not initialized")]
    HubNotInitialized,

    #[error("Hub already initialized")]
    AlreadyInitialized,

    #[error("Command `{command}` failed: {detail}")]
    ExternalCommand { command: String, detail: String },

    #[error("Command `{command}` timed out after {seconds}s")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classes exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Exhausted,
    Expired,
    ExternalCommand,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Expired => write!(f, "expired"),
            Self::ExternalCommand => write!(f, "external_command"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Error shape safe to hand to untrusted callers
#[derive(Debug, Clone, Serialize)]
pub struct PublicError {
    pub code: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::InvalidCidr { .. }
            | Error::InvalidAddress(_)
            | Error::InvalidCustomAddress { .. }
            | Error::InvalidPublicKey
            | Error::InvalidSecret
            | Error::Validation { .. } => ErrorKind::Validation,
            Error::NotFound { .. } | Error::CredentialNotFound | Error::HubNotInitialized => {
                ErrorKind::NotFound
            }
            Error::CredentialAlreadyUsed
            | Error::GroupLimitReached { .. }
            | Error::DuplicateEnrollment { .. }
            | Error::DuplicatePublicKey
            | Error::AddressInUse(_)
            | Error::ClusterHasNodes { .. }
            | Error::AlreadyInitialized => ErrorKind::Conflict,
            Error::PoolExhausted(_) => ErrorKind::Exhausted,
            Error::CredentialExpired => ErrorKind::Expired,
            Error::ExternalCommand { .. } | Error::CommandTimeout { .. } => {
                ErrorKind::ExternalCommand
            }
            Error::Io(_) | Error::Database(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) | Error::Database(_) | Error::Serialization(_) | Error::Internal(_) => {
                "INTERNAL_ERROR"
            }
            Error::Config(_) => "INVALID_CONFIG",
            Error::InvalidCidr { .. } => "INVALID_CIDR",
            Error::InvalidAddress(_) => "INVALID_IP",
            Error::InvalidCustomAddress { .. } => "INVALID_CUSTOM_IP",
            Error::InvalidPublicKey => "INVALID_PUBLIC_KEY",
            Error::InvalidSecret => "INVALID_TOKEN",
            Error::Validation { .. } => "VALIDATION_FAILED",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::CredentialNotFound => "TOKEN_NOT_FOUND",
            Error::CredentialExpired => "TOKEN_EXPIRED",
            Error::CredentialAlreadyUsed => "TOKEN_ALREADY_USED",
            Error::GroupLimitReached { .. } => "GROUP_TOKEN_LIMIT_REACHED",
            Error::DuplicateEnrollment { .. } => "DUPLICATE_GROUP_REGISTRATION",
            Error::DuplicatePublicKey => "DUPLICATE_PUBLIC_KEY",
            Error::AddressInUse(_) => "IP_IN_USE",
            Error::PoolExhausted(_) => "IP_POOL_EXHAUSTED",
            Error::ClusterHasNodes { .. } => "CLUSTER_HAS_NODES",
            Error::HubNotInitialized => "HUB_NOT_INITIALIZED",
            Error::AlreadyInitialized => "HUB_ALREADY_INITIALIZED",
            Error::ExternalCommand { .. } => "EXTERNAL_COMMAND_FAILED",
            Error::CommandTimeout { .. } => "EXTERNAL_COMMAND_TIMEOUT",
        }
    }

    /// Convert to the caller-facing shape, dropping internal diagnostics
    pub fn to_public(&self) -> PublicError {
        let message = match self.kind() {
            ErrorKind::Internal => "Internal error".to_string(),
            ErrorKind::ExternalCommand => "Tunnel interface operation failed".to_string(),
            _ => self.to_string(),
        };
        PublicError {
            code: self.code(),
            kind: self.kind(),
            message,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(e: ipnetwork::IpNetworkError) -> Self {
        Error::InvalidAddress(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(Error::PoolExhausted("10.0.0.0/30".into()).kind(), ErrorKind::Exhausted);
        assert_eq!(Error::CredentialAlreadyUsed.kind(), ErrorKind::Conflict);
        assert_eq!(Error::GroupLimitReached { limit: 3 }.kind(), ErrorKind::Conflict);
        assert_eq!(Error::CredentialExpired.kind(), ErrorKind::Expired);
        assert_eq!(Error::InvalidSecret.kind(), ErrorKind::Validation);
        assert_eq!(Error::ClusterHasNodes { count: 2 }.kind(), ErrorKind::Conflict);
        assert_eq!(Error::ClusterHasNodes { count: 2 }.code(), "CLUSTER_HAS_NODES");
        assert_eq!(
            Error::CommandTimeout { command: "wg".into(), seconds: 10 }.kind(),
            ErrorKind::ExternalCommand
        );
    }

    #[test]
    fn test_public_error_hides_command_output() {
        let err = Error::ExternalCommand {
            command: "wg syncconf wg0 /tmp/x".into(),
            detail: "Unable to modify interface: Operation not permitted".into(),
        };
        let public = err.to_public();
        assert_eq!(public.code, "EXTERNAL_COMMAND_FAILED");
        assert!(!public.message.contains("syncconf"));
        assert!(!public.message.contains("not permitted"));

        let public = Error::CredentialExpired.to_public();
        assert_eq!(public.code, "TOKEN_EXPIRED");
        assert_eq!(public.message, "Installation token has expired");
    }
}
