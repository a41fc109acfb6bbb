//! PKCS#7 (CMS) EnvelopedData with AES-256-GCM content encryption and a
//! pre-shared key.
//!
//! The enrollment server wraps the freshly issued AK certificate in an
//! EnvelopedData whose content is encrypted under the credential-activation
//! secret. Recipient infos are not used; the secret is the content
//! encryption key. The algorithm is checked per decrypt call, nothing is
//! configured globally.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use yasna::models::ObjectIdentifier;
use yasna::Tag;

use crate::EnrollError;

const OID_ENVELOPED_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 3];
const OID_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 1];
const OID_AES256_GCM: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 1, 46];

const GCM_NONCE_LEN: usize = 12;

/// Decrypt an EnvelopedData structure using `psk` as the content key.
pub fn decrypt_enveloped(der: &[u8], psk: &[u8]) -> Result<Vec<u8>, EnrollError> {
    let (content_type, alg, nonce, ciphertext) = yasna::parse_der(der, |reader| {
        reader.read_sequence(|reader| {
            let content_type = reader.next().read_oid()?;
            reader.next().read_tagged(Tag::context(0), |reader| {
                reader.read_sequence(|reader| {
                    let _version = reader.next().read_i64()?;
                    // RecipientInfos are not consumed in PSK mode.
                    let _recipients = reader.next().read_der()?;
                    reader.next().read_sequence(|reader| {
                        let _inner_type = reader.next().read_oid()?;
                        let (alg, nonce) = reader.next().read_sequence(|reader| {
                            let alg = reader.next().read_oid()?;
                            let nonce = reader.next().read_sequence(|reader| {
                                let nonce = reader.next().read_bytes()?;
                                let _icv_len = reader.read_optional(|r| r.read_i64())?;
                                Ok(nonce)
                            })?;
                            Ok((alg, nonce))
                        })?;
                        let ciphertext = reader
                            .next()
                            .read_tagged_implicit(Tag::context(0), |r| r.read_bytes())?;
                        Ok((content_type.clone(), alg, nonce, ciphertext))
                    })
                })
            })
        })
    })
    .map_err(|e| EnrollError::Pkcs7(format!("invalid EnvelopedData: {e}")))?;

    if content_type != ObjectIdentifier::from_slice(OID_ENVELOPED_DATA) {
        return Err(EnrollError::Pkcs7(format!(
            "unexpected content type {content_type}"
        )));
    }
    if alg != ObjectIdentifier::from_slice(OID_AES256_GCM) {
        return Err(EnrollError::Pkcs7(format!(
            "unexpected content encryption algorithm {alg}"
        )));
    }
    if nonce.len() != GCM_NONCE_LEN {
        return Err(EnrollError::Pkcs7(format!(
            "unexpected GCM nonce length {}",
            nonce.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(psk)
        .map_err(|_| EnrollError::Pkcs7("content key must be 32 bytes".to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| EnrollError::Pkcs7("content decryption failed".to_string()))
}

/// Build an EnvelopedData structure around `content`, encrypted with `psk`.
/// This is what the enrollment server does; it lives here so both ends of
/// the protocol share one encoding.
pub fn encrypt_enveloped(
    content: &[u8],
    psk: &[u8],
    nonce: &[u8; GCM_NONCE_LEN],
) -> Result<Vec<u8>, EnrollError> {
    let cipher = Aes256Gcm::new_from_slice(psk)
        .map_err(|_| EnrollError::Pkcs7("content key must be 32 bytes".to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), content)
        .map_err(|_| EnrollError::Pkcs7("content encryption failed".to_string()))?;

    let der = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer
                .next()
                .write_oid(&ObjectIdentifier::from_slice(OID_ENVELOPED_DATA));
            writer.next().write_tagged(Tag::context(0), |writer| {
                writer.write_sequence(|writer| {
                    writer.next().write_i64(0);
                    writer.next().write_set(|_| {});
                    writer.next().write_sequence(|writer| {
                        writer.next().write_oid(&ObjectIdentifier::from_slice(OID_DATA));
                        writer.next().write_sequence(|writer| {
                            writer
                                .next()
                                .write_oid(&ObjectIdentifier::from_slice(OID_AES256_GCM));
                            writer.next().write_sequence(|writer| {
                                writer.next().write_bytes(nonce);
                                writer.next().write_i64(16);
                            });
                        });
                        writer
                            .next()
                            .write_tagged_implicit(Tag::context(0), |writer| {
                                writer.write_bytes(&ciphertext)
                            });
                    });
                });
            });
        });
    });
    Ok(der)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enveloped_roundtrip() {
        let psk = [0x11u8; 32];
        let nonce = [0x22u8; 12];
        let content = b"certificate bytes";

        let der = encrypt_enveloped(content, &psk, &nonce).unwrap();
        let plain = decrypt_enveloped(&der, &psk).unwrap();
        assert_eq!(plain, content);
    }

    #[test]
    fn wrong_psk_fails() {
        let der = encrypt_enveloped(b"secret", &[0x11u8; 32], &[0x22u8; 12]).unwrap();
        let err = decrypt_enveloped(&der, &[0x33u8; 32]).unwrap_err();
        assert!(matches!(err, EnrollError::Pkcs7(_)));
    }

    #[test]
    fn truncated_structure_fails() {
        let der = encrypt_enveloped(b"secret", &[0x11u8; 32], &[0x22u8; 12]).unwrap();
        let err = decrypt_enveloped(&der[..der.len() / 2], &[0x11u8; 32]).unwrap_err();
        assert!(matches!(err, EnrollError::Pkcs7(_)));
    }

    #[test]
    fn short_psk_rejected() {
        let err = encrypt_enveloped(b"x", &[0u8; 16], &[0u8; 12]).unwrap_err();
        assert!(matches!(err, EnrollError::Pkcs7(_)));
    }
}
