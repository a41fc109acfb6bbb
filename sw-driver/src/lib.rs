//! Software driver.
//!
//! Stands in for the TPM driver on hosts without a TPM: generates an
//! in-memory P-256 AK and IK under a freshly created CA, and produces
//! synthetic quotes over a configurable set of PCR values. The evidence has
//! the same shape as hardware evidence and verifies through the same code
//! paths, rooted at this driver's own CA.

use anyhow::{anyhow, Context, Result};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::SigningKey;
use p256::pkcs8::DecodePrivateKey;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
    PKCS_ECDSA_P256_SHA256,
};
use sha2::{Digest, Sha256};
use tracing::debug;

use attestation_report::tpm::{build_attest, composite_digest, fold_hash_chain};
use attestation_report::{
    HashChainElem, Manifest, Measurement, Measurer, ReferenceValue, Serializer, SignOpts,
    SignatureAlgorithm, Signer, TpmMeasurement, TYPE_OS_MANIFEST, TYPE_RTM_MANIFEST,
    TYPE_TPM_REFERENCE_VALUE,
};

/// One emulated PCR: its index and the digest list reported for it.
#[derive(Debug, Clone)]
pub struct SwPcr {
    pub index: u32,
    pub digests: Vec<Vec<u8>>,
}

pub struct SwDriver {
    ak_key: SigningKey,
    ik_key: SigningKey,
    /// DER, leaf first.
    akchain: Vec<Vec<u8>>,
    ikchain: Vec<Vec<u8>>,
    ca_pem: String,
    pcrs: Vec<SwPcr>,
}

impl SwDriver {
    /// Driver with a default two-PCR layout.
    pub fn new() -> Result<Self> {
        Self::with_pcrs(vec![
            SwPcr {
                index: 2,
                digests: vec![Sha256::digest(b"sw-firmware").to_vec()],
            },
            SwPcr {
                index: 3,
                digests: vec![Sha256::digest(b"sw-os").to_vec()],
            },
        ])
    }

    /// Driver emulating the given PCR values.
    pub fn with_pcrs(pcrs: Vec<SwPcr>) -> Result<Self> {
        let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| anyhow!("failed to generate CA key: {e}"))?;
        let mut ca_params =
            CertificateParams::new(Vec::new()).map_err(|e| anyhow!("invalid CA params: {e}"))?;
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "SW Driver CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| anyhow!("failed to self-sign CA: {e}"))?;

        let (ak_der, ak_key) = issue_leaf("SW Driver AK", &ca_cert, &ca_key)?;
        let (ik_der, ik_key) = issue_leaf("SW Driver IK", &ca_cert, &ca_key)?;

        debug!("created software AK and IK under an in-memory CA");
        Ok(Self {
            ak_key,
            ik_key,
            akchain: vec![ak_der, ca_cert.der().to_vec()],
            ikchain: vec![ik_der, ca_cert.der().to_vec()],
            ca_pem: ca_cert.pem(),
            pcrs,
        })
    }

    /// The driver's root CA in PEM. Reports verify against this anchor.
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Signed RTM and OS manifests whose reference values match the
    /// emulated PCRs: the first PCR belongs to the RTM manifest, the rest
    /// to the OS manifest.
    pub fn manifests(&self, serializer: Serializer) -> Result<Vec<Vec<u8>>> {
        let refval = |pcr: &SwPcr, name: String| ReferenceValue {
            kind: TYPE_TPM_REFERENCE_VALUE.to_string(),
            name: Some(name),
            sha256: pcr.digests[0].clone(),
            pcr: Some(pcr.index),
        };

        let (first, rest) = self
            .pcrs
            .split_first()
            .ok_or_else(|| anyhow!("software driver has no PCRs configured"))?;

        let rtm = Manifest {
            kind: TYPE_RTM_MANIFEST.to_string(),
            name: "sw.rtm".to_string(),
            version: "1".to_string(),
            reference_values: vec![refval(first, format!("pcr{}-value", first.index))],
            description: None,
        };
        let os = Manifest {
            kind: TYPE_OS_MANIFEST.to_string(),
            name: "sw.os".to_string(),
            version: "1".to_string(),
            reference_values: rest
                .iter()
                .map(|p| refval(p, format!("pcr{}-value", p.index)))
                .collect(),
            description: None,
        };

        Ok(vec![
            serializer.sign(&serializer.marshal(&rtm)?, self)?,
            serializer.sign(&serializer.marshal(&os)?, self)?,
        ])
    }

    fn sign_with(key: &SigningKey, content: &[u8], opts: &SignOpts) -> Result<Vec<u8>> {
        Self::sign_digest_with(key, &opts.hash.digest(content))
    }

    fn sign_digest_with(key: &SigningKey, digest: &[u8]) -> Result<Vec<u8>> {
        let sig: p256::ecdsa::Signature = key
            .sign_prehash(digest)
            .map_err(|e| anyhow!("software signing failed: {e}"))?;
        Ok(sig.to_der().as_bytes().to_vec())
    }
}

fn issue_leaf(cn: &str, ca_cert: &Certificate, ca_key: &KeyPair) -> Result<(Vec<u8>, SigningKey)> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| anyhow!("failed to generate key: {e}"))?;
    // The IK doubles as a TLS certificate, so it carries local SANs.
    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| anyhow!("invalid params: {e}"))?;
    params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress(std::net::IpAddr::V4(
            std::net::Ipv4Addr::LOCALHOST,
        )));
    params.distinguished_name.push(DnType::CommonName, cn);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    let cert = params
        .signed_by(&key, ca_cert, ca_key)
        .map_err(|e| anyhow!("failed to issue {cn}: {e}"))?;
    let signing_key = SigningKey::from_pkcs8_der(&key.serialize_der())
        .context("failed to convert key for signing")?;
    Ok((cert.der().to_vec(), signing_key))
}

impl Measurer for SwDriver {
    fn name(&self) -> &str {
        "sw"
    }

    fn measure(&self, nonce: &[u8]) -> Result<Measurement> {
        let hash_chain: Vec<HashChainElem> = self
            .pcrs
            .iter()
            .map(|p| HashChainElem::new(p.index, p.digests.clone()))
            .collect();

        let values: Result<Vec<Vec<u8>>> = self
            .pcrs
            .iter()
            .map(|p| fold_hash_chain(&p.digests))
            .collect();
        let indices: Vec<u32> = self.pcrs.iter().map(|p| p.index).collect();
        let message = build_attest(nonce, &indices, &composite_digest(&values?));
        let signature = Self::sign_with(&self.ak_key, &message, &SignOpts::sha256())?;

        let certs = self
            .akchain
            .iter()
            .map(|der| pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())))
            .collect();

        Ok(Measurement::Tpm(TpmMeasurement {
            hash_chain,
            message,
            signature,
            certs,
        }))
    }
}

impl Signer for SwDriver {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::EcdsaP256Sha256
    }

    fn sign_digest(&self, digest: &[u8], _opts: &SignOpts) -> Result<Vec<u8>> {
        Self::sign_digest_with(&self.ik_key, digest)
    }

    fn cert_chain(&self) -> Vec<Vec<u8>> {
        self.ikchain.clone()
    }
}
