//! Certificate resolvers whose private key lives behind the CMC service.
//!
//! The rustls signer hashes the handshake transcript locally and asks the
//! CMC service's TLSSign operation for the signature, so the identity key
//! never leaves the TPM.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rustls::client::ResolvesClientCert;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, Signer, SigningKey};
use rustls::SignatureScheme;
use rustls_pki_types::CertificateDer;
use sha2::Digest;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

use cmc_api::{CmcClient, HashType, PssOpts};

const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_CURVE_P384: &[u64] = &[1, 3, 132, 0, 34];
const OID_CURVE_P521: &[u64] = &[1, 3, 132, 0, 35];

/// Fetch the identity certificate chain from the CMC service and pair it
/// with the remote signer.
pub fn cmc_certified_key(cmc: &CmcClient) -> Result<Arc<CertifiedKey>> {
    let bundle = cmc
        .tls_cert("")
        .context("failed to fetch TLS certificate chain from CMC")?;
    let pems = pem::parse_many(bundle.as_bytes()).context("invalid certificate bundle")?;
    if pems.is_empty() {
        bail!("CMC returned an empty certificate bundle");
    }
    let chain: Vec<CertificateDer<'static>> = pems
        .into_iter()
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect();

    let schemes = supported_schemes(chain[0].as_ref())?;
    debug!("identity key supports {schemes:?}");

    let key = Arc::new(CmcSigningKey {
        cmc: cmc.clone(),
        schemes,
    });
    Ok(Arc::new(CertifiedKey::new(chain, key)))
}

/// Signature schemes the identity key can serve, derived from the leaf
/// certificate's key type. RSA keys prefer PSS, as TLS 1.3 requires.
fn supported_schemes(leaf_der: &[u8]) -> Result<Vec<SignatureScheme>> {
    let (_, cert) = X509Certificate::from_der(leaf_der).context("failed to parse leaf")?;
    let spki = cert.public_key();
    let oid: Vec<u64> = spki
        .algorithm
        .algorithm
        .iter()
        .ok_or_else(|| anyhow!("invalid key algorithm OID"))?
        .collect();

    if oid == OID_RSA_ENCRYPTION {
        return Ok(vec![
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]);
    }
    if oid == OID_EC_PUBLIC_KEY {
        let curve: Vec<u64> = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|p| p.as_oid().ok())
            .and_then(|oid| oid.iter().map(|it| it.collect::<Vec<u64>>()))
            .unwrap_or_default();
        if curve == OID_CURVE_P384 {
            return Ok(vec![SignatureScheme::ECDSA_NISTP384_SHA384]);
        }
        if curve == OID_CURVE_P521 {
            return Ok(vec![SignatureScheme::ECDSA_NISTP521_SHA512]);
        }
        return Ok(vec![SignatureScheme::ECDSA_NISTP256_SHA256]);
    }
    bail!("unsupported identity key algorithm {oid:?}");
}

#[derive(Debug)]
struct CmcSigningKey {
    cmc: CmcClient,
    schemes: Vec<SignatureScheme>,
}

impl SigningKey for CmcSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let scheme = self.schemes.iter().find(|s| offered.contains(s))?;
        Some(Box::new(CmcSigner {
            cmc: self.cmc.clone(),
            scheme: *scheme,
        }))
    }

    fn algorithm(&self) -> rustls::SignatureAlgorithm {
        match self.schemes.first() {
            Some(SignatureScheme::RSA_PSS_SHA256) | Some(SignatureScheme::RSA_PKCS1_SHA256) => {
                rustls::SignatureAlgorithm::RSA
            }
            _ => rustls::SignatureAlgorithm::ECDSA,
        }
    }
}

#[derive(Debug)]
struct CmcSigner {
    cmc: CmcClient,
    scheme: SignatureScheme,
}

impl Signer for CmcSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        let (digest, hashtype, pss) = match self.scheme {
            SignatureScheme::ECDSA_NISTP256_SHA256 => (
                sha2::Sha256::digest(message).to_vec(),
                HashType::Sha256,
                None,
            ),
            SignatureScheme::ECDSA_NISTP384_SHA384 => (
                sha2::Sha384::digest(message).to_vec(),
                HashType::Sha384,
                None,
            ),
            SignatureScheme::ECDSA_NISTP521_SHA512 => (
                sha2::Sha512::digest(message).to_vec(),
                HashType::Sha512,
                None,
            ),
            SignatureScheme::RSA_PKCS1_SHA256 => (
                sha2::Sha256::digest(message).to_vec(),
                HashType::Sha256,
                None,
            ),
            SignatureScheme::RSA_PSS_SHA256 => (
                sha2::Sha256::digest(message).to_vec(),
                HashType::Sha256,
                Some(PssOpts { salt_len: -1 }),
            ),
            other => {
                return Err(rustls::Error::General(format!(
                    "unsupported signature scheme {other:?}"
                )));
            }
        };

        self.cmc
            .tls_sign(&digest, hashtype, pss)
            .map_err(|e| rustls::Error::General(format!("CMC signing failed: {e}")))
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

/// Client certificate resolver backed by the CMC identity key.
#[derive(Debug)]
pub struct CmcClientCertResolver {
    key: Arc<CertifiedKey>,
}

impl CmcClientCertResolver {
    pub fn new(key: Arc<CertifiedKey>) -> Self {
        Self { key }
    }
}

impl ResolvesClientCert for CmcClientCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.key.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Server certificate resolver backed by the CMC identity key.
#[derive(Debug)]
pub struct CmcServerCertResolver {
    key: Arc<CertifiedKey>,
}

impl CmcServerCertResolver {
    pub fn new(key: Arc<CertifiedKey>) -> Self {
        Self { key }
    }
}

impl ResolvesServerCert for CmcServerCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.key.clone())
    }
}
