//! Key templates, public-area parsing and signature conversion.

use anyhow::{bail, Context, Result};

use crate::consts::*;
use crate::wire::{Reader, Writer};

/// Identity key algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkAlg {
    EcP256,
    EcP384,
    EcP521,
    Rsa2048,
    Rsa4096,
}

impl std::str::FromStr for IkAlg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EC256" => Ok(IkAlg::EcP256),
            "EC384" => Ok(IkAlg::EcP384),
            "EC521" => Ok(IkAlg::EcP521),
            "RSA2048" => Ok(IkAlg::Rsa2048),
            "RSA4096" => Ok(IkAlg::Rsa4096),
            _ => bail!("unknown key configuration: {s}"),
        }
    }
}

impl IkAlg {
    pub fn is_rsa(&self) -> bool {
        matches!(self, IkAlg::Rsa2048 | IkAlg::Rsa4096)
    }

    /// The hash the key signs with by default.
    pub fn hash_alg(&self) -> u16 {
        match self {
            IkAlg::EcP384 => TPM_ALG_SHA384,
            IkAlg::EcP521 => TPM_ALG_SHA512,
            _ => TPM_ALG_SHA256,
        }
    }
}

/// Signing scheme passed to TPM2_Sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigScheme {
    pub sig_alg: u16,
    pub hash_alg: u16,
}

impl SigScheme {
    pub fn ecdsa_sha256() -> Self {
        Self {
            sig_alg: TPM_ALG_ECDSA,
            hash_alg: TPM_ALG_SHA256,
        }
    }

    pub fn rsassa(hash_alg: u16) -> Self {
        Self {
            sig_alg: TPM_ALG_RSASSA,
            hash_alg,
        }
    }

    pub fn rsapss(hash_alg: u16) -> Self {
        Self {
            sig_alg: TPM_ALG_RSAPSS,
            hash_alg,
        }
    }
}

/// TPMT_PUBLIC templates for the standard key roles.
pub mod templates {
    use super::*;

    fn rsa_restricted(attrs: u32, auth_policy: &[u8], unique_len: usize) -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(TPM_ALG_RSA).u16(TPM_ALG_SHA256).u32(attrs);
        w.sized(auth_policy);
        // TPMS_RSA_PARMS: AES-128-CFB symmetric, NULL scheme, 2048 bit, default exponent
        w.u16(TPM_ALG_AES).u16(128).u16(TPM_ALG_CFB);
        w.u16(TPM_ALG_NULL);
        w.u16(2048);
        w.u32(0);
        // unique
        w.sized(&vec![0u8; unique_len]);
        w.into_vec()
    }

    /// Storage root key (RSA-2048 restricted decrypt under the owner
    /// hierarchy).
    pub fn srk() -> Vec<u8> {
        rsa_restricted(attrs::STORAGE, &[], 0)
    }

    /// Endorsement key per the TCG EK Credential Profile default template.
    pub fn ek_rsa() -> Vec<u8> {
        rsa_restricted(attrs::ENDORSEMENT, &EK_AUTH_POLICY, 256)
    }

    /// Attestation key: restricted ECDSA-P256 signing.
    pub fn ak_ecdsa() -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(TPM_ALG_ECC).u16(TPM_ALG_SHA256).u32(attrs::ATTESTATION);
        w.sized(&[]);
        // TPMS_ECC_PARMS: NULL symmetric, ECDSA/SHA-256 scheme, P-256, NULL KDF
        w.u16(TPM_ALG_NULL);
        w.u16(TPM_ALG_ECDSA).u16(TPM_ALG_SHA256);
        w.u16(TPM_ECC_NIST_P256);
        w.u16(TPM_ALG_NULL);
        // unique: empty x and y
        w.sized(&[]).sized(&[]);
        w.into_vec()
    }

    /// Identity key with the configured algorithm. The scheme is left NULL;
    /// signing operations pass it explicitly.
    pub fn ik(alg: IkAlg) -> Vec<u8> {
        let mut w = Writer::new();
        match alg {
            IkAlg::EcP256 | IkAlg::EcP384 | IkAlg::EcP521 => {
                let curve = match alg {
                    IkAlg::EcP256 => TPM_ECC_NIST_P256,
                    IkAlg::EcP384 => TPM_ECC_NIST_P384,
                    _ => TPM_ECC_NIST_P521,
                };
                w.u16(TPM_ALG_ECC).u16(TPM_ALG_SHA256).u32(attrs::IDENTITY);
                w.sized(&[]);
                w.u16(TPM_ALG_NULL);
                w.u16(TPM_ALG_NULL);
                w.u16(curve);
                w.u16(TPM_ALG_NULL);
                w.sized(&[]).sized(&[]);
            }
            IkAlg::Rsa2048 | IkAlg::Rsa4096 => {
                let bits = if alg == IkAlg::Rsa2048 { 2048 } else { 4096 };
                w.u16(TPM_ALG_RSA).u16(TPM_ALG_SHA256).u32(attrs::IDENTITY);
                w.sized(&[]);
                w.u16(TPM_ALG_NULL);
                w.u16(TPM_ALG_NULL);
                w.u16(bits);
                w.u32(0);
                w.sized(&[]);
            }
        }
        w.into_vec()
    }
}

/// Public key material extracted from a TPMT_PUBLIC area.
#[derive(Debug, Clone)]
pub enum TpmPublicKey {
    Ecc { curve: u16, x: Vec<u8>, y: Vec<u8> },
    Rsa { modulus: Vec<u8>, exponent: u32 },
}

impl TpmPublicKey {
    /// Parse a TPMT_PUBLIC area (without the outer TPM2B size prefix).
    pub fn parse(public_area: &[u8]) -> Result<Self> {
        let mut r = Reader::new(public_area);
        let key_type = r.u16()?;
        let _name_alg = r.u16()?;
        let _attrs = r.u32()?;
        let _auth_policy = r.sized()?;

        match key_type {
            TPM_ALG_ECC => {
                skip_symmetric(&mut r)?;
                skip_scheme(&mut r)?;
                let curve = r.u16()?;
                skip_scheme(&mut r)?; // KDF
                let x = r.sized()?;
                let y = r.sized()?;
                Ok(TpmPublicKey::Ecc { curve, x, y })
            }
            TPM_ALG_RSA => {
                skip_symmetric(&mut r)?;
                skip_scheme(&mut r)?;
                let _key_bits = r.u16()?;
                let exponent = match r.u32()? {
                    0 => 65537,
                    e => e,
                };
                let modulus = r.sized()?;
                Ok(TpmPublicKey::Rsa { modulus, exponent })
            }
            other => bail!("unsupported key type: 0x{other:04x}"),
        }
    }

    /// Uncompressed SEC1 point for ECC keys.
    pub fn ec_point(&self) -> Result<Vec<u8>> {
        match self {
            TpmPublicKey::Ecc { x, y, .. } => {
                let mut point = Vec::with_capacity(1 + x.len() + y.len());
                point.push(0x04);
                point.extend_from_slice(x);
                point.extend_from_slice(y);
                Ok(point)
            }
            TpmPublicKey::Rsa { .. } => bail!("not an ECC key"),
        }
    }
}

fn skip_symmetric(r: &mut Reader) -> Result<()> {
    let alg = r.u16()?;
    if alg != TPM_ALG_NULL {
        let _key_bits = r.u16()?;
        let _mode = r.u16()?;
    }
    Ok(())
}

fn skip_scheme(r: &mut Reader) -> Result<()> {
    let alg = r.u16()?;
    if alg != TPM_ALG_NULL {
        let _hash = r.u16()?;
    }
    Ok(())
}

/// A parsed TPMT_SIGNATURE.
#[derive(Debug, Clone)]
pub struct TpmtSignature {
    pub sig_alg: u16,
    pub hash_alg: u16,
    /// ECDSA: r then s. RSA: the signature block alone.
    parts: Vec<Vec<u8>>,
}

impl TpmtSignature {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let sig_alg = r.u16()?;
        let hash_alg = r.u16()?;
        let parts = match sig_alg {
            TPM_ALG_ECDSA => {
                let sig_r = r.sized().context("missing signatureR")?;
                let sig_s = r.sized().context("missing signatureS")?;
                vec![sig_r, sig_s]
            }
            TPM_ALG_RSASSA | TPM_ALG_RSAPSS => {
                vec![r.sized().context("missing RSA signature block")?]
            }
            other => bail!("unsupported signature algorithm: 0x{other:04x}"),
        };
        Ok(Self {
            sig_alg,
            hash_alg,
            parts,
        })
    }

    /// Render the signature the way the verifiers expect it: ASN.1 DER for
    /// ECDSA, the raw block for RSA.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self.sig_alg {
            TPM_ALG_ECDSA => Ok(ecdsa_der(&self.parts[0], &self.parts[1])),
            TPM_ALG_RSASSA | TPM_ALG_RSAPSS => Ok(self.parts[0].clone()),
            other => bail!("unsupported signature algorithm: 0x{other:04x}"),
        }
    }
}

/// Minimal DER SEQUENCE of two unsigned INTEGERs.
fn ecdsa_der(r: &[u8], s: &[u8]) -> Vec<u8> {
    fn der_integer(v: &[u8]) -> Vec<u8> {
        let stripped: &[u8] = {
            let mut v = v;
            while v.len() > 1 && v[0] == 0 {
                v = &v[1..];
            }
            v
        };
        let mut out = vec![0x02];
        if stripped.first().is_some_and(|b| b & 0x80 != 0) {
            out.push((stripped.len() + 1) as u8);
            out.push(0x00);
        } else {
            out.push(stripped.len() as u8);
        }
        out.extend_from_slice(stripped);
        out
    }

    let ri = der_integer(r);
    let si = der_integer(s);
    let mut out = Vec::with_capacity(ri.len() + si.len() + 4);
    out.push(0x30);
    let content_len = ri.len() + si.len();
    if content_len < 128 {
        out.push(content_len as u8);
    } else {
        out.push(0x81);
        out.push(content_len as u8);
    }
    out.extend_from_slice(&ri);
    out.extend_from_slice(&si);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ak_template_parses_back() {
        let template = templates::ak_ecdsa();
        let key = TpmPublicKey::parse(&template).unwrap();
        match key {
            TpmPublicKey::Ecc { curve, x, y } => {
                assert_eq!(curve, TPM_ECC_NIST_P256);
                assert!(x.is_empty());
                assert!(y.is_empty());
            }
            _ => panic!("expected ECC key"),
        }
    }

    #[test]
    fn rsa_template_parses_back() {
        let template = templates::ik(IkAlg::Rsa4096);
        match TpmPublicKey::parse(&template).unwrap() {
            TpmPublicKey::Rsa { modulus, exponent } => {
                assert!(modulus.is_empty());
                assert_eq!(exponent, 65537);
            }
            _ => panic!("expected RSA key"),
        }
    }

    #[test]
    fn ecdsa_signature_to_der() {
        let mut raw = Writer::new();
        raw.u16(TPM_ALG_ECDSA).u16(TPM_ALG_SHA256);
        raw.sized(&[0x80; 32]);
        raw.sized(&[0x01; 32]);
        let sig = TpmtSignature::parse(raw.as_slice()).unwrap();
        let der = sig.to_bytes().unwrap();

        assert_eq!(der[0], 0x30);
        // r has the high bit set, so it gains a leading zero byte.
        assert_eq!(der[2], 0x02);
        assert_eq!(der[3], 33);
        assert_eq!(der[4], 0x00);
    }

    #[test]
    fn rsa_signature_passthrough() {
        let mut raw = Writer::new();
        raw.u16(TPM_ALG_RSASSA).u16(TPM_ALG_SHA256);
        raw.sized(&[0xcd; 256]);
        let sig = TpmtSignature::parse(raw.as_slice()).unwrap();
        assert_eq!(sig.to_bytes().unwrap(), vec![0xcd; 256]);
    }

    #[test]
    fn key_config_parsing() {
        assert_eq!("EC256".parse::<IkAlg>().unwrap(), IkAlg::EcP256);
        assert_eq!("RSA4096".parse::<IkAlg>().unwrap(), IkAlg::Rsa4096);
        assert!("EC999".parse::<IkAlg>().is_err());
    }
}
