//! Cluster PKI for ocne
//!
//! Every hypervisor cluster gets its own CA, generated locally before the first
//! node boots, so that admin kubeconfigs can be written before the API server
//! exists. This crate also mints kubeadm bootstrap tokens, computes the CA pin
//! hashes joining nodes verify against, and re-uploads control plane
//! certificates before extra control plane nodes join.

#![deny(missing_docs)]

pub mod ca;
pub mod hashes;
pub mod kubeconfig;
pub mod token;
pub mod upload;

use thiserror::Error;

pub use ca::{generate_pki, CertificateAuthority, PkiBundle};
pub use hashes::cert_hashes_from_kubeconfig;
pub use kubeconfig::KubeconfigRequest;
pub use token::{create_join_token, JoinToken};
pub use upload::{generate_certificate_key, upload_certificates};

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// Certificate or kubeconfig parsing error
    #[error("parse error: {0}")]
    Parse(String),

    /// Secure random source unavailable
    #[error("failed to generate cryptographically secure random bytes")]
    Random,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

impl From<PkiError> for ocne_common::Error {
    fn from(e: PkiError) -> Self {
        match e {
            PkiError::Parse(msg) => ocne_common::Error::validation(msg),
            PkiError::Io(io) => ocne_common::Error::Io(io),
            other => ocne_common::Error::fatal(other.to_string()),
        }
    }
}

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}
