//! Attestation report engine
//!
//! Generates and verifies signed attestation reports. A report carries a
//! verifier-chosen nonce, the measurements collected from the configured
//! measurers (TPM quote plus hash chain, optionally a software digest list),
//! and the signed manifests the verifier needs to interpret them.
//!
//! Reports and manifests are payload-signed envelopes with a pluggable
//! serialization: a JWS-like JSON envelope or a COSE_Sign1-like CBOR
//! envelope. Both share the same internal value types and differ only at the
//! marshalling edges.
//!
//! Verification runs a fixed tree of checks and never aborts early; every
//! check contributes to the final [`VerificationResult`]. Only an unparsable
//! outer envelope is reported as an error.

pub mod encoding;
mod generate;
mod pki;
mod policy;
mod result;
mod serializer;
mod types;
mod verify;

pub mod tpm;

pub use generate::{generate, sign_report};
pub use policy::PolicyEngineSelect;
pub use result::{CheckResult, TpmVerificationResult, VerificationResult};
pub use serializer::Serializer;
pub use types::*;
pub use verify::verify;

use anyhow::Result;

/// Minimum accepted nonce length in bytes.
pub const MIN_NONCE_LEN: usize = 8;

/// Hash algorithms accepted for signing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn digest(&self, content: &[u8]) -> Vec<u8> {
        use sha2::Digest;
        match self {
            HashAlg::Sha256 => sha2::Sha256::digest(content).to_vec(),
            HashAlg::Sha384 => sha2::Sha384::digest(content).to_vec(),
            HashAlg::Sha512 => sha2::Sha512::digest(content).to_vec(),
        }
    }
}

/// RSA-PSS parameters handed through from the TLS stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PssOpts {
    /// Salt length in bytes. Negative values mean "equal to hash length".
    pub salt_len: i32,
}

/// Options for a single signing operation.
#[derive(Debug, Clone, Copy)]
pub struct SignOpts {
    pub hash: HashAlg,
    pub pss: Option<PssOpts>,
}

impl SignOpts {
    pub fn sha256() -> Self {
        Self {
            hash: HashAlg::Sha256,
            pss: None,
        }
    }
}

/// Signature algorithm of an identity key, taken from its leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    EcdsaP256Sha256,
    EcdsaP384Sha384,
    EcdsaP521Sha512,
    RsaPkcs1Sha256,
    RsaPssSha256,
}

impl SignatureAlgorithm {
    /// JWS-style algorithm label carried in the envelope header.
    pub fn label(&self) -> &'static str {
        match self {
            SignatureAlgorithm::EcdsaP256Sha256 => "ES256",
            SignatureAlgorithm::EcdsaP384Sha384 => "ES384",
            SignatureAlgorithm::EcdsaP521Sha512 => "ES512",
            SignatureAlgorithm::RsaPkcs1Sha256 => "RS256",
            SignatureAlgorithm::RsaPssSha256 => "PS256",
        }
    }

    pub fn hash(&self) -> HashAlg {
        match self {
            SignatureAlgorithm::EcdsaP384Sha384 => HashAlg::Sha384,
            SignatureAlgorithm::EcdsaP521Sha512 => HashAlg::Sha512,
            _ => HashAlg::Sha256,
        }
    }
}

/// A measurement source plugged into report generation.
///
/// Implementations collect evidence bound to the given nonce. The TPM driver
/// and the software driver are the two in-tree implementations.
pub trait Measurer: Send + Sync {
    fn name(&self) -> &str;
    fn measure(&self, nonce: &[u8]) -> Result<Measurement>;
}

/// Signing capability of the identity key.
///
/// `sign_digest` signs a caller-provided digest (the TLS stack hashes its
/// own transcript); `sign` hashes `content` according to `opts` first.
/// ECDSA signatures are returned as ASN.1 DER, RSA signatures as raw
/// PKCS#1 blocks. `cert_chain` returns the identity key certificate chain
/// in DER, leaf first.
pub trait Signer: Send + Sync {
    fn algorithm(&self) -> SignatureAlgorithm;
    fn sign_digest(&self, digest: &[u8], opts: &SignOpts) -> Result<Vec<u8>>;
    fn cert_chain(&self) -> Vec<Vec<u8>>;

    fn sign(&self, content: &[u8], opts: &SignOpts) -> Result<Vec<u8>> {
        self.sign_digest(&opts.hash.digest(content), opts)
    }
}

impl<T: Measurer + ?Sized> Measurer for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn measure(&self, nonce: &[u8]) -> Result<Measurement> {
        (**self).measure(nonce)
    }
}

impl<T: Signer + ?Sized> Signer for std::sync::Arc<T> {
    fn algorithm(&self) -> SignatureAlgorithm {
        (**self).algorithm()
    }

    fn sign_digest(&self, digest: &[u8], opts: &SignOpts) -> Result<Vec<u8>> {
        (**self).sign_digest(digest, opts)
    }

    fn sign(&self, content: &[u8], opts: &SignOpts) -> Result<Vec<u8>> {
        (**self).sign(content, opts)
    }

    fn cert_chain(&self) -> Vec<Vec<u8>> {
        (**self).cert_chain()
    }
}
