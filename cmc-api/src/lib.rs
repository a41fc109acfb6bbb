//! CMC service API.
//!
//! Four operations (Attest, Verify, TLSSign, TLSCert) with CBOR message
//! bodies in u32 big-endian length-prefixed frames over TCP. The schemas
//! here are the wire contract; the service and every integration speak
//! exactly these types.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Frames above this size are rejected.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Minimum nonce length accepted by Attest.
pub const MIN_NONCE_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum CmcError {
    #[error("CMC transport failed")]
    Io(#[from] std::io::Error),
    #[error("CMC message encoding failed: {0}")]
    Encode(String),
    #[error("CMC service error: {0}")]
    Remote(String),
    #[error("unexpected CMC response")]
    Unexpected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationRequest {
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationResponse {
    pub attestation_report: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub nonce: Vec<u8>,
    pub attestation_report: Vec<u8>,
    /// Trust anchor, PEM.
    pub ca: Vec<u8>,
    /// Opaque policy blob, empty to skip policy evaluation.
    pub policies: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResponse {
    /// JSON-serialized verification result; this is the stable external
    /// schema regardless of the report serializer.
    pub verification_result: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashType {
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PssOpts {
    pub salt_len: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSignRequest {
    /// The digest to sign (the TLS stack hashes the handshake transcript).
    pub content: Vec<u8>,
    pub hashtype: HashType,
    pub pss_opts: Option<PssOpts>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSignResponse {
    pub signed_content: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCertRequest {
    /// Informational; the service does not filter by it.
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCertResponse {
    /// The identity key certificate chain as a PEM bundle, leaf first.
    pub certificate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Attest(AttestationRequest),
    Verify(VerificationRequest),
    TlsSign(TlsSignRequest),
    TlsCert(TlsCertRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Attest(AttestationResponse),
    Verify(VerificationResponse),
    TlsSign(TlsSignResponse),
    TlsCert(TlsCertResponse),
    Error(String),
}

/// Write one length-prefixed CBOR frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), CmcError> {
    let mut body = Vec::new();
    ciborium::into_writer(value, &mut body).map_err(|e| CmcError::Encode(e.to_string()))?;
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed CBOR frame.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T, CmcError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CmcError::Encode(format!("frame of {len} bytes too large")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    ciborium::from_reader(body.as_slice()).map_err(|e| CmcError::Encode(e.to_string()))
}

/// Blocking client for the CMC service. One connection per call.
#[derive(Debug, Clone)]
pub struct CmcClient {
    addr: String,
    timeout: Option<Duration>,
}

impl CmcClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Some(Duration::from_secs(10)),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn call(&self, request: &Request) -> Result<Response, CmcError> {
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;
        let mut stream = stream;
        write_frame(&mut stream, request)?;
        read_frame(&mut stream)
    }

    /// Request an attestation report over the given nonce.
    pub fn attest(&self, nonce: &[u8]) -> Result<Vec<u8>, CmcError> {
        debug!("requesting attestation report from {}", self.addr);
        match self.call(&Request::Attest(AttestationRequest {
            nonce: nonce.to_vec(),
        }))? {
            Response::Attest(r) => Ok(r.attestation_report),
            Response::Error(e) => Err(CmcError::Remote(e)),
            _ => Err(CmcError::Unexpected),
        }
    }

    /// Verify a peer report; returns the JSON verification result.
    pub fn verify(
        &self,
        nonce: &[u8],
        attestation_report: &[u8],
        ca: &[u8],
        policies: &[u8],
    ) -> Result<Vec<u8>, CmcError> {
        debug!("requesting verification from {}", self.addr);
        match self.call(&Request::Verify(VerificationRequest {
            nonce: nonce.to_vec(),
            attestation_report: attestation_report.to_vec(),
            ca: ca.to_vec(),
            policies: policies.to_vec(),
        }))? {
            Response::Verify(r) => Ok(r.verification_result),
            Response::Error(e) => Err(CmcError::Remote(e)),
            _ => Err(CmcError::Unexpected),
        }
    }

    /// Sign a digest with the identity key.
    pub fn tls_sign(
        &self,
        content: &[u8],
        hashtype: HashType,
        pss_opts: Option<PssOpts>,
    ) -> Result<Vec<u8>, CmcError> {
        match self.call(&Request::TlsSign(TlsSignRequest {
            content: content.to_vec(),
            hashtype,
            pss_opts,
        }))? {
            Response::TlsSign(r) => Ok(r.signed_content),
            Response::Error(e) => Err(CmcError::Remote(e)),
            _ => Err(CmcError::Unexpected),
        }
    }

    /// Fetch the identity key certificate chain as a PEM bundle.
    pub fn tls_cert(&self, id: &str) -> Result<String, CmcError> {
        match self.call(&Request::TlsCert(TlsCertRequest { id: id.to_string() }))? {
            Response::TlsCert(r) => Ok(r.certificate),
            Response::Error(e) => Err(CmcError::Remote(e)),
            _ => Err(CmcError::Unexpected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let request = Request::Attest(AttestationRequest {
            nonce: vec![1, 2, 3, 4, 5, 6, 7, 8],
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();

        let parsed: Request = read_frame(&mut buf.as_slice()).unwrap();
        match parsed {
            Request::Attest(r) => assert_eq!(r.nonce, vec![1, 2, 3, 4, 5, 6, 7, 8]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        let result: Result<Request, _> = read_frame(&mut buf.as_slice());
        assert!(matches!(result, Err(CmcError::Encode(_))));
    }

    #[test]
    fn error_response_roundtrip() {
        let response = Response::Error("nonce too short".to_string());
        let mut buf = Vec::new();
        write_frame(&mut buf, &response).unwrap();
        let parsed: Response = read_frame(&mut buf.as_slice()).unwrap();
        assert!(matches!(parsed, Response::Error(e) if e == "nonce too short"));
    }
}
