//! Enrollment client.
//!
//! Stateless HTTP client against an enrollment server with EST-like
//! endpoints: CA chain bootstrap, TPM credential activation (EK → AK) and
//! key certification (AK → IK). Binary fields travel base64-encoded in JSON
//! bodies.
//!
//! The trust bootstrap is deliberate: `ca_certs` may run without server
//! authentication, and the anchor it returns is pinned for all subsequent
//! calls.

mod pkcs7;

pub use pkcs7::{decrypt_enveloped, encrypt_enveloped};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Errors of the enrollment protocol. No retries happen at this layer.
#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    #[error("enrollment server returned status {0}")]
    Status(u16),
    #[error("failed to reach enrollment server")]
    Http(#[from] reqwest::Error),
    #[error("malformed enrollment response: {0}")]
    Malformed(String),
    #[error("PKCS#7 processing failed: {0}")]
    Pkcs7(String),
}

/// AK attestation parameters produced at key creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AkParams {
    pub public: String,
    pub create_data: String,
    pub create_attestation: String,
    pub create_signature: String,
}

impl AkParams {
    pub fn new(
        public: &[u8],
        create_data: &[u8],
        create_attestation: &[u8],
        create_signature: &[u8],
    ) -> Self {
        Self {
            public: B64.encode(public),
            create_data: B64.encode(create_data),
            create_attestation: B64.encode(create_attestation),
            create_signature: B64.encode(create_signature),
        }
    }
}

/// IK certification proof under the AK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertifyParams {
    pub public: String,
    pub certify_info: String,
    pub certify_signature: String,
}

impl CertifyParams {
    pub fn new(public: &[u8], certify_info: &[u8], certify_signature: &[u8]) -> Self {
        Self {
            public: B64.encode(public),
            certify_info: B64.encode(certify_info),
            certify_signature: B64.encode(certify_signature),
        }
    }
}

#[derive(Debug, Serialize)]
struct ActivateEnrollRequest<'a> {
    manufacturer: &'a str,
    firmware_major: u32,
    firmware_minor: u32,
    ek_public: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ek_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ek_cert_url: Option<&'a str>,
    ak_csr: String,
    ak_params: &'a AkParams,
}

#[derive(Debug, Deserialize)]
struct ActivateEnrollResponse {
    enc_credential: String,
    enc_secret: String,
    pkcs7_cert: String,
}

/// The activation challenge returned by the server.
#[derive(Debug, Clone)]
pub struct ActivationChallenge {
    pub enc_credential: Vec<u8>,
    pub enc_secret: Vec<u8>,
    pub pkcs7_cert: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct CertifyEnrollRequest<'a> {
    ik_csr: String,
    ik_params: &'a CertifyParams,
    ak_public: String,
}

#[derive(Debug, Deserialize)]
struct CertifyEnrollResponse {
    certificate: String,
}

pub struct EstClient {
    client: reqwest::blocking::Client,
}

impl EstClient {
    /// Create a client. Without `roots` the server certificate is not
    /// verified; this is only acceptable for the CA bootstrap call, whose
    /// result is then pinned via [`EstClient::with_cas`].
    pub fn new(roots: Option<&[Vec<u8>]>) -> Result<Self, EnrollError> {
        let mut builder = reqwest::blocking::Client::builder().use_rustls_tls();
        match roots {
            Some(roots) => {
                for der in roots {
                    let cert = reqwest::Certificate::from_der(der)?;
                    builder = builder.add_root_certificate(cert);
                }
                builder = builder.tls_built_in_root_certs(false);
            }
            None => {
                warn!("creating enrollment client without server authentication");
                builder = builder.danger_accept_invalid_certs(true);
            }
        }
        let client = builder.build()?;
        Ok(Self { client })
    }

    /// Client pinned to the given trust anchors (DER).
    pub fn with_cas(roots: &[Vec<u8>]) -> Result<Self, EnrollError> {
        Self::new(Some(roots))
    }

    /// Fetch the provisioning CA chain. Returns the certificates in DER,
    /// leaf-most first, exactly as the server's PEM bundle orders them.
    pub fn ca_certs(&self, server: &str) -> Result<Vec<Vec<u8>>, EnrollError> {
        let url = format!("{}/est/cacerts", server.trim_end_matches('/'));
        debug!("fetching CA certificates from {url}");
        let response = self.client.get(&url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnrollError::Status(status.as_u16()));
        }
        let body = response.bytes()?;
        let pems = pem::parse_many(&body)
            .map_err(|e| EnrollError::Malformed(format!("invalid CA PEM bundle: {e}")))?;
        if pems.is_empty() {
            return Err(EnrollError::Malformed("empty CA bundle".to_string()));
        }
        Ok(pems.into_iter().map(|p| p.into_contents()).collect())
    }

    /// Submit AK material and CSR; returns the activation challenge bound
    /// to the EK.
    #[allow(clippy::too_many_arguments)]
    pub fn tpm_activate_enroll(
        &self,
        server: &str,
        manufacturer: &str,
        firmware_major: u32,
        firmware_minor: u32,
        ek_public: &[u8],
        ek_cert: Option<&[u8]>,
        ek_cert_url: Option<&str>,
        ak_csr: &[u8],
        ak_params: &AkParams,
    ) -> Result<ActivationChallenge, EnrollError> {
        let url = format!("{}/est/tpmactivateenroll", server.trim_end_matches('/'));
        let request = ActivateEnrollRequest {
            manufacturer,
            firmware_major,
            firmware_minor,
            ek_public: B64.encode(ek_public),
            ek_cert: ek_cert.map(|c| B64.encode(c)),
            ek_cert_url,
            ak_csr: B64.encode(ak_csr),
            ak_params,
        };
        debug!("performing TPM activate enroll against {url}");
        let response = self.client.post(&url).json(&request).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnrollError::Status(status.as_u16()));
        }
        let body: ActivateEnrollResponse = response
            .json()
            .map_err(|e| EnrollError::Malformed(format!("invalid activation response: {e}")))?;
        Ok(ActivationChallenge {
            enc_credential: decode_field("enc_credential", &body.enc_credential)?,
            enc_secret: decode_field("enc_secret", &body.enc_secret)?,
            pkcs7_cert: decode_field("pkcs7_cert", &body.pkcs7_cert)?,
        })
    }

    /// Submit the IK certification proof; returns the IK certificate (DER).
    pub fn tpm_certify_enroll(
        &self,
        server: &str,
        ik_csr: &[u8],
        ik_params: &CertifyParams,
        ak_public: &[u8],
    ) -> Result<Vec<u8>, EnrollError> {
        let url = format!("{}/est/tpmcertifyenroll", server.trim_end_matches('/'));
        let request = CertifyEnrollRequest {
            ik_csr: B64.encode(ik_csr),
            ik_params,
            ak_public: B64.encode(ak_public),
        };
        debug!("performing TPM certify enroll against {url}");
        let response = self.client.post(&url).json(&request).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnrollError::Status(status.as_u16()));
        }
        let body: CertifyEnrollResponse = response
            .json()
            .map_err(|e| EnrollError::Malformed(format!("invalid certify response: {e}")))?;
        decode_field("certificate", &body.certificate)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, EnrollError> {
    B64.decode(value)
        .map_err(|e| EnrollError::Malformed(format!("field {name}: {e}")))
}
