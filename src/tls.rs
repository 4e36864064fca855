//! Throwaway PKI for TLS-enabled clusters.

use std::{
    fmt, fs, io,
    net::IpAddr,
    path::{Path, PathBuf},
};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType,
};
use time::OffsetDateTime;

use crate::util::{chmod, write_string_atomic};

pub const TLS_DIR: &str = "tls";
pub const CA_FILE: &str = "ca.pem";
pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCa {
    pub name: String,
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPem {
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug)]
pub enum TlsError {
    Rcgen(rcgen::Error),
    Io { path: PathBuf, source: io::Error },
    Incomplete { missing: PathBuf },
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rcgen(_) => write!(f, "certificate operation failed"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Incomplete { missing } => {
                write!(f, "tls material incomplete: {} missing", missing.display())
            }
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rcgen(e) => Some(e),
            Self::Io { source, .. } => Some(source),
            Self::Incomplete { .. } => None,
        }
    }
}

impl From<rcgen::Error> for TlsError {
    fn from(value: rcgen::Error) -> Self {
        Self::Rcgen(value)
    }
}

impl ClusterCa {
    pub fn generate(name: &str) -> Result<Self, TlsError> {
        let mut params = ca_params(name);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(30);

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key)?;

        Ok(Self {
            name: name.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Issues a leaf usable as both server and client certificate.
    pub fn issue(
        &self,
        common_name: &str,
        dns_names: &[String],
        ips: &[IpAddr],
    ) -> Result<LeafPem, TlsError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let mut sans = Vec::with_capacity(dns_names.len() + ips.len());
        for name in dns_names {
            sans.push(SanType::DnsName(name.as_str().try_into()?));
        }
        sans.extend(ips.iter().copied().map(SanType::IpAddress));
        params.subject_alt_names = sans;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(30);

        let ca_key = KeyPair::from_pem(&self.key_pem)?;
        let issuer = Issuer::new(ca_params(&self.name), ca_key);

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.signed_by(&key, &issuer)?;

        Ok(LeafPem {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

fn ca_params(name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("{name} CA"));
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params
}

/// Writes `ca.pem`, `cert.pem` and `key.pem` under `<node_dir>/tls`.
pub fn write_tls_files(node_dir: &Path, ca: &ClusterCa, leaf: &LeafPem) -> Result<(), TlsError> {
    let dir = node_dir.join(TLS_DIR);
    let files = [
        (CA_FILE, ca.cert_pem.as_str()),
        (CERT_FILE, leaf.cert_pem.as_str()),
        (KEY_FILE, leaf.key_pem.as_str()),
    ];
    for (name, pem) in files {
        let path = dir.join(name);
        write_string_atomic(&path, pem).map_err(|source| TlsError::Io {
            path: path.clone(),
            source,
        })?;
    }

    let key_path = dir.join(KEY_FILE);
    chmod(&key_path, 0o600).map_err(|source| TlsError::Io {
        path: key_path,
        source,
    })
}

pub fn ensure_tls_files(node_dir: &Path) -> Result<(), TlsError> {
    for name in [CA_FILE, CERT_FILE, KEY_FILE] {
        let path = node_dir.join(TLS_DIR).join(name);
        if !path.is_file() {
            return Err(TlsError::Incomplete { missing: path });
        }
    }
    Ok(())
}
