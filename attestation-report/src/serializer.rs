//! Pluggable payload serialization.
//!
//! The JSON serializer wraps payloads in a JWS-like envelope, the CBOR
//! serializer in a COSE_Sign1-like one. Both carry the same fields; the
//! signed input is `<alg> || '.' || payload` so the signature also covers
//! the declared algorithm.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::pki;
use crate::result::CheckResult;
use crate::{PssOpts, SignOpts, SignatureAlgorithm, Signer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    Json,
    Cbor,
}

impl std::str::FromStr for Serializer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Serializer::Json),
            "cbor" => Ok(Serializer::Cbor),
            _ => bail!("unknown serializer: {s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Protected {
    alg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    protected: Protected,
    #[serde(with = "crate::encoding::b64_bytes")]
    payload: Vec<u8>,
    #[serde(with = "crate::encoding::b64_bytes")]
    signature: Vec<u8>,
    /// Certificate chain in DER, base64, leaf first.
    x5c: Vec<String>,
}

fn signed_input(alg: &str, payload: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(alg.len() + 1 + payload.len());
    input.extend_from_slice(alg.as_bytes());
    input.push(b'.');
    input.extend_from_slice(payload);
    input
}

impl Serializer {
    pub fn marshal<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serializer::Json => serde_json::to_vec(value).context("JSON marshal failed"),
            Serializer::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(value, &mut buf).context("CBOR marshal failed")?;
                Ok(buf)
            }
        }
    }

    pub fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Serializer::Json => serde_json::from_slice(data).context("JSON unmarshal failed"),
            Serializer::Cbor => ciborium::from_reader(data).context("CBOR unmarshal failed"),
        }
    }

    /// Extract the plain payload from a signed envelope without verifying
    /// the signature.
    pub fn get_payload(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        let env: Envelope = self.unmarshal(envelope)?;
        Ok(env.payload)
    }

    /// Wrap `payload` in a signed envelope.
    pub fn sign(&self, payload: &[u8], signer: &dyn Signer) -> Result<Vec<u8>> {
        let alg = signer.algorithm();
        let input = signed_input(alg.label(), payload);
        let opts = SignOpts {
            hash: alg.hash(),
            pss: matches!(alg, SignatureAlgorithm::RsaPssSha256)
                .then_some(PssOpts { salt_len: -1 }),
        };
        let signature = signer
            .sign(&input, &opts)
            .context("envelope signing failed")?;
        let x5c = signer
            .cert_chain()
            .iter()
            .map(|der| B64.encode(der))
            .collect();
        let env = Envelope {
            protected: Protected {
                alg: alg.label().to_string(),
            },
            payload: payload.to_vec(),
            signature,
            x5c,
        };
        self.marshal(&env)
    }

    /// Verify a signed envelope: the signer certificate chain must verify to
    /// `ca_pem` and the payload signature must verify under the leaf.
    ///
    /// Failures are recorded in the returned check; the payload is returned
    /// whenever the envelope itself was parsable.
    pub fn verify_envelope(
        &self,
        name: &str,
        envelope: &[u8],
        ca_pem: &[u8],
    ) -> (CheckResult, Option<Vec<u8>>) {
        let env: Envelope = match self.unmarshal(envelope) {
            Ok(env) => env,
            Err(e) => {
                return (CheckResult::fail(name, format!("unparsable envelope: {e:#}")), None);
            }
        };

        let chain: Result<Vec<Vec<u8>>> = env
            .x5c
            .iter()
            .map(|b| B64.decode(b).context("invalid x5c encoding"))
            .collect();
        let chain = match chain {
            Ok(chain) if !chain.is_empty() => chain,
            Ok(_) => {
                return (
                    CheckResult::fail(name, "empty certificate chain"),
                    Some(env.payload),
                );
            }
            Err(e) => {
                return (CheckResult::fail(name, format!("{e:#}")), Some(env.payload));
            }
        };

        if let Err(e) = pki::verify_cert_chain(&chain, ca_pem, pki::EKU_CLIENT_AUTH) {
            return (
                CheckResult::fail(name, format!("certificate chain: {e:#}")),
                Some(env.payload),
            );
        }

        let input = signed_input(&env.protected.alg, &env.payload);
        match pki::verify_content_signature(&chain[0], &env.protected.alg, &input, &env.signature) {
            Ok(true) => (CheckResult::ok(name), Some(env.payload)),
            Ok(false) => (
                CheckResult::fail(name, "signature verification failed"),
                Some(env.payload),
            ),
            Err(e) => (CheckResult::fail(name, format!("{e:#}")), Some(env.payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Manifest, ReferenceValue, TYPE_RTM_MANIFEST, TYPE_TPM_REFERENCE_VALUE};

    fn sample_manifest() -> Manifest {
        Manifest {
            kind: TYPE_RTM_MANIFEST.to_string(),
            name: "de.test.rtm".to_string(),
            version: "2024-01-01".to_string(),
            reference_values: vec![ReferenceValue {
                kind: TYPE_TPM_REFERENCE_VALUE.to_string(),
                name: Some("firmware".to_string()),
                sha256: vec![0xab; 32],
                pcr: Some(2),
            }],
            description: None,
        }
    }

    #[test]
    fn manifest_roundtrip_json() {
        let m = sample_manifest();
        let data = Serializer::Json.marshal(&m).unwrap();
        let back: Manifest = Serializer::Json.unmarshal(&data).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn manifest_roundtrip_cbor() {
        let m = sample_manifest();
        let data = Serializer::Cbor.marshal(&m).unwrap();
        let back: Manifest = Serializer::Cbor.unmarshal(&data).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn serializer_from_str() {
        assert_eq!("json".parse::<Serializer>().unwrap(), Serializer::Json);
        assert_eq!("CBOR".parse::<Serializer>().unwrap(), Serializer::Cbor);
        assert!("xml".parse::<Serializer>().is_err());
    }
}
