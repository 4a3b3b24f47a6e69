//! Cluster certificate authority and the per-cluster PKI bundle

use std::path::{Path, PathBuf};

use ocne_common::config::CertificateInformation;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose,
};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::kubeconfig::KubeconfigRequest;
use crate::{parse_pem, PkiError, Result};

/// Validity period for the cluster CA (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for admin client certificates (1 year)
pub const CLIENT_CERT_VALIDITY_YEARS: i64 = 1;

/// Common name of the cluster CA, matching what kubeadm generates
pub const CA_COMMON_NAME: &str = "kubernetes";

/// Common name of the admin client certificate
pub const ADMIN_COMMON_NAME: &str = "kubernetes-admin";

/// Group granting cluster-admin through the default RBAC bindings
pub const ADMIN_GROUP: &str = "system:masters";

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn subject(info: &CertificateInformation, common_name: &str, org: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    if !info.org_unit.is_empty() {
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(info.org_unit.clone()),
        );
    }
    if !info.country.is_empty() {
        if let Ok(country) = rcgen::string::PrintableString::try_from(info.country.clone()) {
            dn.push(DnType::CountryName, DnValue::PrintableString(country));
        }
    }
    if !info.state.is_empty() {
        dn.push(
            DnType::StateOrProvinceName,
            DnValue::Utf8String(info.state.clone()),
        );
    }
    dn
}

/// A cluster CA held as PEM
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
    info: CertificateInformation,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &self.info)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA with the configured subject
    pub fn new(info: &CertificateInformation) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(info, CA_COMMON_NAME, &info.org);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate CA key: {}", e)))?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
            info: info.clone(),
        })
    }

    /// Load a CA from PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str, info: &CertificateInformation) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem)?;
        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
            info: info.clone(),
        })
    }

    /// CA certificate PEM
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key PEM
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Issue an admin client certificate; returns (cert PEM, key PEM)
    pub fn generate_admin_cert(&self) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(&self.info, ADMIN_COMMON_NAME, ADMIN_GROUP);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let (not_before, not_after) = compute_validity(CLIENT_CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let client_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate client key: {}", e))
        })?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&client_key, &issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to sign client cert: {}", e))
        })?;
        Ok((cert.pem(), client_key.serialize_pem()))
    }
}

/// CA material plus the kubeconfigs written for one cluster
///
/// The CA files live in a private temporary directory that is removed when the
/// bundle is closed or dropped.
#[derive(Debug)]
pub struct PkiBundle {
    /// The cluster CA
    pub ca: CertificateAuthority,
    /// Path to `ca.crt` inside the temp directory
    pub ca_cert_path: PathBuf,
    /// Path to `ca.key` inside the temp directory
    pub ca_key_path: PathBuf,
    /// Kubeconfig reaching the in-VM API address
    pub kubeconfig_vm: PathBuf,
    /// Kubeconfig reaching the local tunnel (or load balancer)
    pub kubeconfig_local: PathBuf,
    temp_dir: TempDir,
}

impl PkiBundle {
    /// The temporary directory holding the CA files
    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Remove the temporary directory
    pub fn close(self) -> Result<()> {
        let path = self.temp_dir.path().to_path_buf();
        self.temp_dir.close()?;
        debug!(dir = %path.display(), "Removed PKI temp directory");
        Ok(())
    }
}

/// Create a CA and write the VM and local kubeconfigs
pub fn generate_pki(
    info: &CertificateInformation,
    vm: &KubeconfigRequest,
    local: &KubeconfigRequest,
) -> Result<PkiBundle> {
    let ca = CertificateAuthority::new(info)?;
    let temp_dir = tempfile::Builder::new().prefix("ocne-pki-").tempdir()?;

    let ca_cert_path = temp_dir.path().join("ca.crt");
    let ca_key_path = temp_dir.path().join("ca.key");
    crate::kubeconfig::write_private(&ca_cert_path, ca.ca_cert_pem().as_bytes())?;
    crate::kubeconfig::write_private(&ca_key_path, ca.ca_key_pem().as_bytes())?;

    let (cert_pem, key_pem) = ca.generate_admin_cert()?;
    vm.write(ca.ca_cert_pem(), &cert_pem, &key_pem)?;
    local.write(ca.ca_cert_pem(), &cert_pem, &key_pem)?;

    info!(
        cluster = %vm.cluster_name,
        vm = %vm.path.display(),
        local = %local.path.display(),
        "Generated cluster PKI"
    );

    Ok(PkiBundle {
        ca,
        ca_cert_path,
        ca_key_path,
        kubeconfig_vm: vm.path.clone(),
        kubeconfig_local: local.path.clone(),
        temp_dir,
    })
}
