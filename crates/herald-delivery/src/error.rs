//! Error types for dispatch operations.
//!
//! Covers the failures that abort a whole request before any per-device
//! call is made: credential decoding, PEM parsing, and client
//! construction. Per-device failures are not errors here; they travel as
//! [`herald_core::DeviceResponse`] records inside the aggregated response.

use herald_core::PushError;
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Whole-request failure conditions.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The base64 certificate bundle could not be decoded.
    #[error("couldn't decode certificate bundle: {message}")]
    CertificateDecode {
        /// Decoder error description.
        message: String,
    },

    /// The private key block could not be decrypted with the password.
    #[error("failed to decrypt private key")]
    KeyDecrypt,

    /// The (decrypted) key is not a valid PKCS#1 RSA private key.
    #[error("failed to parse PKCS1 private key")]
    Pkcs1Parse,

    /// The bundle carried no certificate block.
    #[error("no certificate")]
    NoCertificate,

    /// The bundle carried no private key block.
    #[error("no private key")]
    NoPrivateKey,

    /// The provider HTTP client could not be constructed.
    #[error("failed to build HTTP client: {message}")]
    ClientBuild {
        /// Builder error description.
        message: String,
    },

    /// The shared worker pool refused new work (shutting down).
    #[error("worker pool unavailable")]
    PoolClosed,
}

impl DeliveryError {
    /// Creates a certificate decode error from a message.
    pub fn certificate_decode(message: impl Into<String>) -> Self {
        Self::CertificateDecode { message: message.into() }
    }

    /// Creates a client build error from a message.
    pub fn client_build(message: impl Into<String>) -> Self {
        Self::ClientBuild { message: message.into() }
    }

    /// Sentinel code reported on the wire for this failure.
    ///
    /// Input-shaped problems map to 422, construction problems to 500,
    /// and pool shutdown to 503.
    pub fn code(&self) -> i64 {
        match self {
            Self::CertificateDecode { .. }
            | Self::KeyDecrypt
            | Self::Pkcs1Parse
            | Self::NoCertificate
            | Self::NoPrivateKey => 422,
            Self::ClientBuild { .. } => 500,
            Self::PoolClosed => 503,
        }
    }

    /// True for transient conditions a caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolClosed)
    }

    /// Converts into the wire error record.
    pub fn to_push_error(&self) -> PushError {
        PushError {
            description: self.to_string(),
            code: self.code(),
            should_retry: self.is_retryable(),
            retry_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_carry_input_sentinel() {
        assert_eq!(DeliveryError::certificate_decode("bad base64").code(), 422);
        assert_eq!(DeliveryError::KeyDecrypt.code(), 422);
        assert_eq!(DeliveryError::Pkcs1Parse.code(), 422);
        assert_eq!(DeliveryError::NoCertificate.code(), 422);
        assert_eq!(DeliveryError::NoPrivateKey.code(), 422);
        assert_eq!(DeliveryError::client_build("boom").code(), 500);
        assert_eq!(DeliveryError::PoolClosed.code(), 503);
    }

    #[test]
    fn only_pool_shutdown_is_retryable() {
        assert!(DeliveryError::PoolClosed.is_retryable());
        assert!(!DeliveryError::NoCertificate.is_retryable());
        assert!(!DeliveryError::client_build("boom").is_retryable());
    }

    #[test]
    fn push_error_conversion_keeps_description() {
        let error = DeliveryError::NoPrivateKey.to_push_error();
        assert_eq!(error.code, 422);
        assert_eq!(error.description, "no private key");
        assert!(!error.should_retry);
        assert!(error.retry_at.is_none());
    }
}
