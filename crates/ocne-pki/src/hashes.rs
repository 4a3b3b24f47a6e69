//! CA public key pins for `kubeadm join --discovery-token-ca-cert-hash`

use std::path::Path;

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::STANDARD, Engine};
use kube::config::Kubeconfig;
use x509_parser::prelude::*;

use crate::{PkiError, Result};

/// Pin hash of one certificate: `sha256:<hex of SubjectPublicKeyInfo digest>`
pub fn pin_hash_from_der(der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;
    let spki = cert.tbs_certificate.subject_pki.raw;
    Ok(format!("sha256:{}", hex::encode(digest(&SHA256, spki).as_ref())))
}

/// One pin hash per certificate in a PEM bundle
pub fn pin_hashes_from_pem(bundle: &[u8]) -> Result<Vec<String>> {
    let blocks = ::pem::parse_many(bundle)
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    let hashes = blocks
        .iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| pin_hash_from_der(b.contents()))
        .collect::<Result<Vec<_>>>()?;
    if hashes.is_empty() {
        return Err(PkiError::Parse(
            "no certificates found in CA data".to_string(),
        ));
    }
    Ok(hashes)
}

/// CA certificate bytes of the kubeconfig's current cluster
fn ca_data(kubeconfig: &Kubeconfig, base: &Path) -> Result<Vec<u8>> {
    let cluster_name = kubeconfig.current_context.as_ref().and_then(|ctx| {
        kubeconfig
            .contexts
            .iter()
            .find(|c| &c.name == ctx)
            .and_then(|c| c.context.as_ref())
            .map(|c| c.cluster.clone())
    });
    let cluster = match cluster_name {
        Some(name) => kubeconfig.clusters.iter().find(|c| c.name == name),
        None => kubeconfig.clusters.first(),
    }
    .and_then(|c| c.cluster.as_ref())
    .ok_or_else(|| PkiError::Parse("kubeconfig has no cluster".to_string()))?;

    if let Some(data) = &cluster.certificate_authority_data {
        return STANDARD
            .decode(data.trim())
            .map_err(|e| PkiError::Parse(format!("invalid certificate-authority-data: {}", e)));
    }
    if let Some(file) = &cluster.certificate_authority {
        let path = base.join(file);
        return Ok(std::fs::read(path)?);
    }
    Err(PkiError::Parse(
        "kubeconfig cluster has no certificate authority".to_string(),
    ))
}

/// Pin hashes for every CA certificate embedded in a kubeconfig
pub fn cert_hashes_from_kubeconfig(path: &Path) -> Result<Vec<String>> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| PkiError::Parse(format!("failed to read kubeconfig: {}", e)))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    pin_hashes_from_pem(&ca_data(&kubeconfig, base)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubeconfig::KubeconfigRequest;
    use crate::CertificateAuthority;
    use ocne_common::config::CertificateInformation;

    #[test]
    fn hash_has_sha256_prefix_and_hex_digest() {
        let ca = CertificateAuthority::new(&CertificateInformation::default()).unwrap();
        let hashes = pin_hashes_from_pem(ca.ca_cert_pem().as_bytes()).unwrap();
        assert_eq!(hashes.len(), 1);
        let h = &hashes[0];
        assert!(h.starts_with("sha256:"));
        assert_eq!(h.len(), "sha256:".len() + 64);
    }

    #[test]
    fn one_hash_per_certificate_in_bundle() {
        let a = CertificateAuthority::new(&CertificateInformation::default()).unwrap();
        let b = CertificateAuthority::new(&CertificateInformation::default()).unwrap();
        let bundle = format!("{}{}", a.ca_cert_pem(), b.ca_cert_pem());
        let hashes = pin_hashes_from_pem(bundle.as_bytes()).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_ne!(hashes[0], hashes[1]);
    }

    #[test]
    fn reads_ca_from_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new(&CertificateInformation::default()).unwrap();
        let (cert, key) = ca.generate_admin_cert().unwrap();
        let req = KubeconfigRequest::new(dir.path().join("kc"), "demo", "127.0.0.1", 6443);
        req.write(ca.ca_cert_pem(), &cert, &key).unwrap();

        let from_file = cert_hashes_from_kubeconfig(&req.path).unwrap();
        let direct = pin_hashes_from_pem(ca.ca_cert_pem().as_bytes()).unwrap();
        assert_eq!(from_file, direct);
    }

    #[test]
    fn empty_bundle_is_an_error() {
        assert!(pin_hashes_from_pem(b"").is_err());
    }
}
