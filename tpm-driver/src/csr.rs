//! PKCS#10 certificate request construction.
//!
//! The private keys never leave the TPM, so the request is assembled as raw
//! DER and the signature over the request info is produced by a caller
//! supplied closure that drives the TPM sign operation.

use anyhow::{Context, Result};
use attestation_report::CsrSubject;
use yasna::models::ObjectIdentifier;
use yasna::{DERWriter, Tag};

const OID_CN: &[u64] = &[2, 5, 4, 3];
const OID_COUNTRY: &[u64] = &[2, 5, 4, 6];
const OID_LOCALITY: &[u64] = &[2, 5, 4, 7];
const OID_PROVINCE: &[u64] = &[2, 5, 4, 8];
const OID_ORG: &[u64] = &[2, 5, 4, 10];
const OID_ORG_UNIT: &[u64] = &[2, 5, 4, 11];

const OID_EXTENSION_REQUEST: &[u64] = &[1, 2, 840, 113549, 1, 9, 14];
const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];

const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
const OID_CURVE_P256: &[u64] = &[1, 2, 840, 10045, 3, 1, 7];
const OID_CURVE_P384: &[u64] = &[1, 3, 132, 0, 34];
const OID_CURVE_P521: &[u64] = &[1, 3, 132, 0, 35];

const OID_ECDSA_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];
const OID_ECDSA_SHA384: &[u64] = &[1, 2, 840, 10045, 4, 3, 3];
const OID_ECDSA_SHA512: &[u64] = &[1, 2, 840, 10045, 4, 3, 4];
const OID_SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];

/// Signature algorithm of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrSigAlg {
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
    RsaSha256,
}

impl CsrSigAlg {
    fn oid(&self) -> &'static [u64] {
        match self {
            CsrSigAlg::EcdsaSha256 => OID_ECDSA_SHA256,
            CsrSigAlg::EcdsaSha384 => OID_ECDSA_SHA384,
            CsrSigAlg::EcdsaSha512 => OID_ECDSA_SHA512,
            CsrSigAlg::RsaSha256 => OID_SHA256_WITH_RSA,
        }
    }

    fn null_params(&self) -> bool {
        matches!(self, CsrSigAlg::RsaSha256)
    }
}

/// Elliptic curves supported for SubjectPublicKeyInfo construction.
#[derive(Debug, Clone, Copy)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl EcCurve {
    fn oid(&self) -> &'static [u64] {
        match self {
            EcCurve::P256 => OID_CURVE_P256,
            EcCurve::P384 => OID_CURVE_P384,
            EcCurve::P521 => OID_CURVE_P521,
        }
    }
}

/// SubjectPublicKeyInfo for an EC key from its uncompressed point.
pub fn ec_spki(curve: EcCurve, point: &[u8]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(OID_EC_PUBLIC_KEY));
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(curve.oid()));
            });
            writer.next().write_bitvec_bytes(point, point.len() * 8);
        });
    })
}

/// SubjectPublicKeyInfo for an RSA key from modulus and public exponent.
pub fn rsa_spki(modulus: &[u8], exponent: u32) -> Vec<u8> {
    let exp_bytes = exponent.to_be_bytes();
    let exp_trimmed: Vec<u8> = {
        let stripped: Vec<u8> = exp_bytes.iter().copied().skip_while(|b| *b == 0).collect();
        if stripped.is_empty() {
            vec![0]
        } else {
            stripped
        }
    };
    let rsa_key = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_bigint_bytes(modulus, true);
            writer.next().write_bigint_bytes(&exp_trimmed, true);
        });
    });
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(OID_RSA_ENCRYPTION));
                writer.next().write_null();
            });
            writer.next().write_bitvec_bytes(&rsa_key, rsa_key.len() * 8);
        });
    })
}

fn write_rdn(writer: DERWriter, oid: &[u64], value: &str) {
    writer.write_set(|writer| {
        writer.next().write_sequence(|writer| {
            writer
                .next()
                .write_oid(&ObjectIdentifier::from_slice(oid));
            writer.next().write_utf8_string(value);
        });
    });
}

fn write_subject(writer: DERWriter, subject: &CsrSubject) {
    writer.write_sequence_of(|writer| {
        let fields: [(&[u64], Option<&String>); 5] = [
            (OID_COUNTRY, subject.country.as_ref()),
            (OID_PROVINCE, subject.province.as_ref()),
            (OID_LOCALITY, subject.locality.as_ref()),
            (OID_ORG, subject.organization.as_ref()),
            (OID_ORG_UNIT, subject.organizational_unit.as_ref()),
        ];
        for (oid, value) in fields {
            if let Some(value) = value {
                write_rdn(writer.next(), oid, value);
            }
        }
        write_rdn(writer.next(), OID_CN, &subject.common_name);
    });
}

/// Build a signed PKCS#10 request. `sign` receives the DER-encoded request
/// info and must return the signature (ECDSA as DER, RSA as a PKCS#1
/// block).
pub fn build_csr<F>(
    subject: &CsrSubject,
    sans: &[String],
    spki_der: &[u8],
    sig_alg: CsrSigAlg,
    sign: F,
) -> Result<Vec<u8>>
where
    F: FnOnce(&[u8]) -> Result<Vec<u8>>,
{
    let cri = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_i64(0); // version
            write_subject(writer.next(), subject);
            writer.next().write_der(spki_der);
            writer
                .next()
                .write_tagged_implicit(Tag::context(0), |writer| {
                    if sans.is_empty() {
                        writer.write_set_of(|_| {});
                        return;
                    }
                    // extensionRequest attribute carrying subjectAltName
                    let san_value = yasna::construct_der(|writer| {
                        writer.write_sequence_of(|writer| {
                            for san in sans {
                                writer
                                    .next()
                                    .write_tagged_implicit(Tag::context(2), |writer| {
                                        writer.write_ia5_string(san)
                                    });
                            }
                        });
                    });
                    writer.write_set_of(|writer| {
                        writer.next().write_sequence(|writer| {
                            writer.next().write_oid(&ObjectIdentifier::from_slice(
                                OID_EXTENSION_REQUEST,
                            ));
                            writer.next().write_set_of(|writer| {
                                writer.next().write_sequence_of(|writer| {
                                    writer.next().write_sequence(|writer| {
                                        writer.next().write_oid(
                                            &ObjectIdentifier::from_slice(OID_SUBJECT_ALT_NAME),
                                        );
                                        writer.next().write_bytes(&san_value);
                                    });
                                });
                            });
                        });
                    });
                });
        });
    });

    let signature = sign(&cri).context("failed to sign certificate request")?;

    Ok(yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_der(&cri);
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(sig_alg.oid()));
                if sig_alg.null_params() {
                    writer.next().write_null();
                }
            });
            writer
                .next()
                .write_bitvec_bytes(&signature, signature.len() * 8);
        });
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use sha2::{Digest, Sha256};
    use x509_parser::certification_request::X509CertificationRequest;
    use x509_parser::prelude::FromDer;

    fn subject() -> CsrSubject {
        CsrSubject {
            common_name: "device.test.example".to_string(),
            country: Some("DE".to_string()),
            organization: Some("Test Org".to_string()),
            ..Default::default()
        }
    }

    fn build_with_p256(sans: &[String]) -> Vec<u8> {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let point = key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let spki = ec_spki(EcCurve::P256, &point);
        build_csr(&subject(), sans, &spki, CsrSigAlg::EcdsaSha256, |cri| {
            let digest = Sha256::digest(cri);
            let sig: p256::ecdsa::Signature = key.sign_prehash(&digest)?;
            Ok(sig.to_der().as_bytes().to_vec())
        })
        .unwrap()
    }

    #[test]
    fn csr_parses_and_signature_checks() {
        let der = build_with_p256(&[]);
        let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();
        assert!(csr.verify_signature().is_ok());

        let cn = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(cn, "device.test.example");
    }

    #[test]
    fn csr_carries_sans() {
        let der = build_with_p256(&["node-a.example".to_string(), "node-b.example".to_string()]);
        let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();
        assert!(csr.verify_signature().is_ok());

        let attrs = csr.certification_request_info.iter_attributes().count();
        assert_eq!(attrs, 1);
    }

    #[test]
    fn rsa_spki_is_wellformed_der() {
        let spki = rsa_spki(&[0x01; 256], 65537);
        // Outer SEQUENCE with a long-form length.
        assert_eq!(spki[0], 0x30);
    }
}
