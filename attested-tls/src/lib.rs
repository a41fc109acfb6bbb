//! Attested TLS.
//!
//! Wraps a standard rustls connection with a post-handshake attestation
//! exchange. After the handshake both sides derive channel bindings from
//! the TLS exporter; the prover requests an attestation report over those
//! bindings from its CMC service and sends it across the channel, and the
//! verifier checks the peer report against the same bindings. The
//! connection is only handed to the application once verification
//! succeeded, so a report can never be replayed onto another channel.
//!
//! TLS private key operations are delegated to the CMC service as well;
//! the identity key itself never leaves the TPM.

mod atls;
mod signer;

pub use atls::{
    dial, AttestedClientStream, AttestedServerStream, AttestedStream, Listener, TlsParams,
};

use std::time::Duration;

use attestation_report::VerificationResult;

/// Default CMC service endpoint.
pub const CMC_ADDR_DEFAULT: &str = "127.0.0.1:9955";

/// Exporter label for the channel binding nonce.
pub const CHANNEL_BINDING_LABEL: &[u8] = b"EXPORTER-Channel-Binding";

/// Channel binding length in bytes.
pub const CHANNEL_BINDING_LEN: usize = 32;

/// Connection options for attested dial and listen.
#[derive(Debug, Clone, bon::Builder)]
pub struct AtlsConfig {
    /// CMC service endpoint.
    #[builder(default = String::from(CMC_ADDR_DEFAULT))]
    pub cmc_addr: String,
    /// Trust anchor (PEM) the peer report is verified against.
    #[builder(default)]
    pub ca: Vec<u8>,
    /// Opaque policy blob forwarded to Verify.
    #[builder(default)]
    pub policies: Vec<u8>,
    /// When true both sides attest; otherwise only the server does.
    #[builder(default = false)]
    pub mtls: bool,
    /// Deadline for the post-handshake attestation exchange.
    #[builder(default = Duration::from_secs(10))]
    pub attest_timeout: Duration,
}

impl Default for AtlsConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A distinguished connection error carrying the peer's full verification
/// result, so callers can log or report the detailed failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("remote attestation failed")]
pub struct AttestedError {
    result: VerificationResult,
}

impl AttestedError {
    pub fn new(result: VerificationResult) -> Self {
        Self { result }
    }

    pub fn verification_result(&self) -> &VerificationResult {
        &self.result
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AtlsError {
    /// Peer attestation was verified and rejected.
    #[error(transparent)]
    Attestation(#[from] AttestedError),
    /// The attested exchange exceeded its deadline.
    #[error("attestation exchange timed out")]
    Timeout,
    #[error("TLS error")]
    Tls(#[from] rustls::Error),
    #[error("connection error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
