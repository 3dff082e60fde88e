//! Cluster certificate authority operations
//!
//! After `kubeadm init` the leader holds the cluster CA under
//! `/etc/kubernetes/pki`. Keel downloads it into a [`PkiBundle`], loads it
//! once into a [`CertificateAuthority`], and uses it to issue serving
//! certificates for in-cluster services (metrics-server and friends).
//!
//! # Key Handling
//!
//! - The CA key must be RSA (kubeadm's default); PKCS#1 and PKCS#8 are accepted
//! - Leaf certificates get a fresh ECDSA P-256 key per issuance
//! - Issuance borrows the CA immutably, so one `Arc<CertificateAuthority>`
//!   can serve concurrent callers

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256, PKCS_RSA_SHA384, PKCS_RSA_SHA512,
};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::PrivateKeyDer;
use thiserror::Error;
use ::time::{Duration, OffsetDateTime};
use x509_parser::prelude::*;

/// Bundle path of the cluster CA certificate
pub const CA_CERT_PATH: &str = "/etc/kubernetes/pki/ca.crt";
/// Bundle path of the cluster CA private key
pub const CA_KEY_PATH: &str = "/etc/kubernetes/pki/ca.key";

/// Leaf bundle key of the certificate
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Leaf bundle key of the private key
pub const TLS_KEY_KEY: &str = "tls.key";
/// Leaf bundle key of the issuing CA certificate
pub const CA_CERT_KEY: &str = "ca.crt";

/// Validity of issued leaf certificates
pub const LEAF_VALIDITY_DAYS: i64 = 365;

/// PKI files keyed by their path on the leader
pub type PkiBundle = BTreeMap<String, Vec<u8>>;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Required bundle entry missing
    #[error("PKI bundle entry not found: {0}")]
    NotFound(String),

    /// Entry is not valid PEM or DER
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Bundle path of the offending entry
        path: String,
        /// Parser message
        message: String,
    },

    /// Certificate entry holds no certificates
    #[error("no certificates found in {0}")]
    EmptyCertificate(String),

    /// CA key is not an RSA key
    #[error("CA key is not an RSA key: {0}")]
    KeyType(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Cluster certificate authority loaded from the leader
pub struct CertificateAuthority {
    /// First certificate of the CA entry, re-encoded as PEM
    cert_pem: String,
    /// RSA signing key
    key: KeyPair,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the CA from a bundle keyed by [`CA_CERT_PATH`] and [`CA_KEY_PATH`]
    pub fn from_bundle(bundle: &PkiBundle) -> Result<Self> {
        let cert_bytes = bundle
            .get(CA_CERT_PATH)
            .ok_or_else(|| PkiError::NotFound(CA_CERT_PATH.to_string()))?;
        let key_bytes = bundle
            .get(CA_KEY_PATH)
            .ok_or_else(|| PkiError::NotFound(CA_KEY_PATH.to_string()))?;

        let cert_pem = first_certificate(CA_CERT_PATH, cert_bytes)?;
        let key = load_rsa_key(CA_KEY_PATH, key_bytes)?;

        Ok(Self { cert_pem, key })
    }

    /// CA certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Issue a serving certificate for `<name>.<namespace>.svc`
    ///
    /// The certificate is valid for the short service name and for the
    /// fully qualified `<name>.<namespace>.svc.<domain>`, server auth only.
    pub fn issue_service_certificate(
        &self,
        name: &str,
        namespace: &str,
        domain: &str,
    ) -> Result<ServiceCertificate> {
        let service = format!("{name}.{namespace}.svc");
        let fqdn = format!("{service}.{}", domain.trim_end_matches('.'));

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate key for {service}: {e}"))
        })?;

        let mut params = CertificateParams::new(vec![service.clone(), fqdn]).map_err(|e| {
            PkiError::CertificateGeneration(format!("invalid SAN for {service}: {e}"))
        })?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(service.clone()));
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create issuer: {e}"))
        })?;

        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to sign certificate for {service}: {e}"))
        })?;

        Ok(ServiceCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            ca_pem: self.cert_pem.clone(),
        })
    }
}

/// Return the first CERTIFICATE block of `bytes` as PEM
fn first_certificate(path: &str, bytes: &[u8]) -> Result<String> {
    let blocks = ::pem::parse_many(bytes).map_err(|e| PkiError::Parse {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    let first = blocks
        .into_iter()
        .find(|b| b.tag() == "CERTIFICATE")
        .ok_or_else(|| PkiError::EmptyCertificate(path.to_string()))?;

    X509Certificate::from_der(first.contents()).map_err(|e| PkiError::Parse {
        path: path.to_string(),
        message: format!("invalid certificate: {e}"),
    })?;

    Ok(::pem::encode(&first))
}

/// Parse a PEM private key and require it to be RSA
fn load_rsa_key(path: &str, bytes: &[u8]) -> Result<KeyPair> {
    let parse_error = |message: String| PkiError::Parse {
        path: path.to_string(),
        message,
    };

    let der = PrivateKeyDer::from_pem_slice(bytes).map_err(|e| parse_error(e.to_string()))?;

    match der {
        PrivateKeyDer::Pkcs1(ref pkcs1) => {
            let pkcs8 = pkcs1_to_pkcs8(pkcs1.secret_pkcs1_der());
            KeyPair::try_from(pkcs8.as_slice()).map_err(|e| parse_error(e.to_string()))
        }
        PrivateKeyDer::Pkcs8(ref pkcs8) => {
            let key = KeyPair::try_from(pkcs8.secret_pkcs8_der())
                .map_err(|e| parse_error(e.to_string()))?;
            let alg = key.algorithm();
            if alg == &PKCS_RSA_SHA256 || alg == &PKCS_RSA_SHA384 || alg == &PKCS_RSA_SHA512 {
                Ok(key)
            } else {
                Err(PkiError::KeyType(format!("{path} holds a {alg:?} key")))
            }
        }
        PrivateKeyDer::Sec1(_) => Err(PkiError::KeyType(format!("{path} holds an EC key"))),
        _ => Err(PkiError::KeyType(format!("{path} holds an unsupported key"))),
    }
}

/// DER AlgorithmIdentifier for rsaEncryption (1.2.840.113549.1.1.1) with NULL parameters
const RSA_ENCRYPTION_ALGORITHM: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// Wrap a PKCS#1 RSAPrivateKey in a PKCS#8 PrivateKeyInfo
///
/// kubeadm writes `BEGIN RSA PRIVATE KEY` files, which the signing backend
/// only accepts once wrapped.
fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> Vec<u8> {
    let mut body = vec![0x02, 0x01, 0x00];
    body.extend_from_slice(RSA_ENCRYPTION_ALGORITHM);
    push_der(&mut body, 0x04, pkcs1);

    let mut info = Vec::with_capacity(body.len() + 4);
    push_der(&mut info, 0x30, &body);
    info
}

/// Append a DER tag-length-value
fn push_der(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
}

/// Serving certificate issued by the cluster CA
#[derive(Clone, Debug)]
pub struct ServiceCertificate {
    /// Leaf certificate (PEM)
    pub cert_pem: String,
    /// Leaf private key (PEM)
    pub key_pem: String,
    /// Issuing CA certificate (PEM)
    pub ca_pem: String,
}

impl ServiceCertificate {
    /// Bundle keyed by `tls.crt`, `tls.key` and `ca.crt`
    pub fn to_data(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            (TLS_CERT_KEY.to_string(), self.cert_pem.clone().into_bytes()),
            (TLS_KEY_KEY.to_string(), self.key_pem.clone().into_bytes()),
            (CA_CERT_KEY.to_string(), self.ca_pem.clone().into_bytes()),
        ])
    }

    /// Kubernetes TLS secret holding the bundle
    pub fn to_secret(&self, name: &str, namespace: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(
                self.to_data()
                    .into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

/// API server certificate SANs: the endpoint host, then alternative names
///
/// All entries are lower-cased; kubeadm rejects mixed-case DNS SANs.
pub fn certificate_sans(host: &str, alternative_names: &[String]) -> Vec<String> {
    std::iter::once(host)
        .chain(alternative_names.iter().map(String::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}
