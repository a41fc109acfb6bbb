//! Certificate chain and payload signature verification.

use anyhow::{anyhow, bail, Context, Result};
use rustls_pki_types::{CertificateDer, UnixTime};
use sha2::{Digest, Sha256, Sha384, Sha512};
use webpki::EndEntityCert;
use x509_parser::prelude::{FromDer, X509Certificate};

/// id-kp-clientAuth, accepted if the leaf carries extended key usages.
pub const EKU_CLIENT_AUTH: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x02];
/// tcg-kp-AIKCertificate, accepted on attestation key leaves.
pub const EKU_TCG_AIK: &[u8] = &[0x67, 0x81, 0x05, 0x08, 0x03];

const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
const OID_CURVE_P256: &[u64] = &[1, 2, 840, 10045, 3, 1, 7];
const OID_CURVE_P384: &[u64] = &[1, 3, 132, 0, 34];
const OID_CURVE_P521: &[u64] = &[1, 3, 132, 0, 35];

enum PublicKey {
    Rsa(rsa::RsaPublicKey),
    EcP256(p256::ecdsa::VerifyingKey),
    EcP384(p384::ecdsa::VerifyingKey),
    EcP521(p521::ecdsa::VerifyingKey),
}

/// Verify `chain` (DER, leaf first) up to the trust anchor in `ca_pem`.
///
/// The anchor comes from the verifier, never from the evidence itself; the
/// remaining chain elements are used as intermediates. `eku` is only
/// enforced if the leaf carries extended key usages at all.
pub fn verify_cert_chain(chain: &[Vec<u8>], ca_pem: &[u8], eku: &'static [u8]) -> Result<()> {
    if chain.is_empty() {
        bail!("empty certificate chain");
    }

    let roots = pem::parse_many(ca_pem).context("failed to parse CA PEM")?;
    let root_der = roots
        .first()
        .map(|p| CertificateDer::from(p.contents().to_vec()))
        .ok_or_else(|| anyhow!("no certificate in CA PEM"))?;
    let trust_anchor = webpki::anchor_from_trusted_cert(&root_der)
        .context("failed to create trust anchor from CA")?;
    let trust_anchors = [trust_anchor];

    let leaf_der = CertificateDer::from(chain[0].clone());
    let leaf = EndEntityCert::try_from(&leaf_der)
        .map_err(|e| anyhow!("failed to parse leaf certificate: {e:?}"))?;

    let intermediates: Vec<CertificateDer> = chain[1..]
        .iter()
        .map(|c| CertificateDer::from(c.clone()))
        .collect();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("failed to get current time")?;
    let time = UnixTime::since_unix_epoch(now);

    leaf.verify_for_usage(
        webpki::ALL_VERIFICATION_ALGS,
        &trust_anchors,
        &intermediates,
        time,
        webpki::KeyUsage::required_if_present(eku),
        None,
        None,
    )
    .map_err(|e| anyhow!("certificate chain verification failed: {e}"))?;

    Ok(())
}

fn extract_public_key(cert_der: &[u8]) -> Result<PublicKey> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).context("failed to parse certificate")?;
    let spki = cert.public_key();

    let oid: Vec<u64> = spki
        .algorithm
        .algorithm
        .iter()
        .ok_or_else(|| anyhow!("invalid public key algorithm OID"))?
        .collect();

    if oid == OID_RSA_ENCRYPTION {
        use rsa::pkcs1::DecodeRsaPublicKey;
        let key = rsa::RsaPublicKey::from_pkcs1_der(spki.subject_public_key.data.as_ref())
            .context("failed to decode RSA public key")?;
        return Ok(PublicKey::Rsa(key));
    }
    if oid != OID_EC_PUBLIC_KEY {
        bail!("unsupported public key algorithm: {oid:?}");
    }

    // The named curve sits in the algorithm parameters.
    let curve: Vec<u64> = spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|p| p.as_oid().ok())
        .and_then(|oid| oid.iter().map(|it| it.collect::<Vec<u64>>()))
        .ok_or_else(|| anyhow!("EC key without a named curve"))?;
    let point = spki.subject_public_key.data.as_ref();

    if curve == OID_CURVE_P256 {
        let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
            .context("failed to decode P-256 public key")?;
        Ok(PublicKey::EcP256(key))
    } else if curve == OID_CURVE_P384 {
        let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point)
            .context("failed to decode P-384 public key")?;
        Ok(PublicKey::EcP384(key))
    } else if curve == OID_CURVE_P521 {
        let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(point)
            .context("failed to decode P-521 public key")?;
        Ok(PublicKey::EcP521(key))
    } else {
        bail!("unsupported EC curve: {curve:?}");
    }
}

/// Signature algorithm label implied by the leaf certificate's key.
pub fn detect_alg_label(cert_der: &[u8]) -> Result<&'static str> {
    match extract_public_key(cert_der)? {
        PublicKey::Rsa(_) => Ok("RS256"),
        PublicKey::EcP256(_) => Ok("ES256"),
        PublicKey::EcP384(_) => Ok("ES384"),
        PublicKey::EcP521(_) => Ok("ES512"),
    }
}

/// Verify `signature` over `content` under the public key of `cert_der`.
///
/// Returns `Ok(false)` on a well-formed but invalid signature and an error
/// for structural problems (unsupported algorithm, undecodable key, or an
/// algorithm that does not match the key).
pub fn verify_content_signature(
    cert_der: &[u8],
    alg: &str,
    content: &[u8],
    signature: &[u8],
) -> Result<bool> {
    let digest: Vec<u8> = match alg {
        "ES384" => Sha384::digest(content).to_vec(),
        "ES512" => Sha512::digest(content).to_vec(),
        _ => Sha256::digest(content).to_vec(),
    };
    let key = extract_public_key(cert_der)?;

    match (alg, key) {
        ("ES256", PublicKey::EcP256(key)) => {
            use p256::ecdsa::signature::hazmat::PrehashVerifier;
            let sig = p256::ecdsa::Signature::from_der(signature)
                .context("failed to parse ECDSA signature")?;
            Ok(key.verify_prehash(&digest, &sig).is_ok())
        }
        ("ES384", PublicKey::EcP384(key)) => {
            use p384::ecdsa::signature::hazmat::PrehashVerifier;
            let sig = p384::ecdsa::Signature::from_der(signature)
                .context("failed to parse ECDSA signature")?;
            Ok(key.verify_prehash(&digest, &sig).is_ok())
        }
        ("ES512", PublicKey::EcP521(key)) => {
            use p521::ecdsa::signature::hazmat::PrehashVerifier;
            let sig = p521::ecdsa::Signature::from_der(signature)
                .context("failed to parse ECDSA signature")?;
            Ok(key.verify_prehash(&digest, &sig).is_ok())
        }
        ("RS256", PublicKey::Rsa(key)) => {
            let padding = rsa::Pkcs1v15Sign::new::<Sha256>();
            Ok(key.verify(padding, &digest, signature).is_ok())
        }
        ("PS256", PublicKey::Rsa(key)) => {
            let padding = rsa::Pss::new::<Sha256>();
            Ok(key.verify(padding, &digest, signature).is_ok())
        }
        (alg, _) => bail!("signature algorithm {alg} does not match the key type"),
    }
}
