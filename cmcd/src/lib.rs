//! The CMC service.
//!
//! Exposes the attestation and signing primitives over the message set in
//! [`cmc_api`]: Attest and TLSSign touch the measurers and the identity
//! key, Verify and TLSCert are pure functions over the immutable server
//! configuration. Each connection is handled on its own thread; TPM
//! serialization happens inside the driver.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use attestation_report::{
    generate, sign_report, verify, HashAlg, Measurer, PolicyEngineSelect, PssOpts, Serializer,
    SignOpts, Signer,
};
use cmc_api::{
    read_frame, write_frame, AttestationResponse, HashType, Request, Response,
    TlsCertResponse, TlsSignResponse, VerificationResponse, MIN_NONCE_LEN,
};

/// Immutable service configuration, fixed after init.
pub struct ServerConfig {
    pub metadata: Vec<Vec<u8>>,
    pub measurers: Vec<Box<dyn Measurer>>,
    pub signer: Arc<dyn Signer>,
    pub serializer: Serializer,
    pub policy_engine: PolicyEngineSelect,
}

pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn bind(addr: &str, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("failed to bind CMC service to {addr}"))?;
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; one thread per connection.
    pub fn serve(self) -> Result<()> {
        info!("CMC service listening on {}", self.listener.local_addr()?);
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let config = self.config.clone();
                    thread::spawn(move || handle_connection(stream, config));
                }
                Err(e) => warn!("failed to accept connection: {e}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(mut stream: TcpStream, config: Arc<ServerConfig>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    loop {
        let request: Request = match read_frame(&mut stream) {
            Ok(r) => r,
            Err(cmc_api::CmcError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return;
            }
            Err(e) => {
                debug!("closing connection to {peer}: {e}");
                return;
            }
        };
        debug!("request from {peer}: {}", request_name(&request));

        let response = dispatch(&config, request);
        if let Err(e) = write_frame(&mut stream, &response) {
            warn!("failed to respond to {peer}: {e}");
            return;
        }
    }
}

fn request_name(request: &Request) -> &'static str {
    match request {
        Request::Attest(_) => "Attest",
        Request::Verify(_) => "Verify",
        Request::TlsSign(_) => "TLSSign",
        Request::TlsCert(_) => "TLSCert",
    }
}

/// Handle one request. Failures become `Response::Error` diagnostics.
pub fn dispatch(config: &ServerConfig, request: Request) -> Response {
    match request {
        Request::Attest(req) => {
            if req.nonce.len() < MIN_NONCE_LEN {
                return Response::Error(format!(
                    "bad request: nonce of {} bytes, minimum is {MIN_NONCE_LEN}",
                    req.nonce.len()
                ));
            }
            let report = match generate(
                &req.nonce,
                &config.metadata,
                &config.measurers,
                config.serializer,
            ) {
                Ok(r) => r,
                Err(e) => {
                    warn!("failed to generate attestation report: {e:#}");
                    return Response::Error(format!("failed to generate attestation report: {e:#}"));
                }
            };
            match sign_report(&report, config.signer.as_ref(), config.serializer) {
                Ok(data) => Response::Attest(AttestationResponse {
                    attestation_report: data,
                }),
                Err(e) => {
                    warn!("failed to sign attestation report: {e:#}");
                    Response::Error(format!("failed to sign attestation report: {e:#}"))
                }
            }
        }
        Request::Verify(req) => {
            let result = match verify(
                &req.attestation_report,
                &req.nonce,
                &req.ca,
                &req.policies,
                config.policy_engine,
                config.serializer,
            ) {
                Ok(r) => r,
                Err(e) => {
                    warn!("failed to verify attestation report: {e:#}");
                    return Response::Error(format!("failed to verify attestation report: {e:#}"));
                }
            };
            match serde_json::to_vec(&result) {
                Ok(data) => Response::Verify(VerificationResponse {
                    verification_result: data,
                }),
                Err(e) => Response::Error(format!("failed to marshal verification result: {e}")),
            }
        }
        Request::TlsSign(req) => {
            let opts = sign_opts(req.hashtype, req.pss_opts);
            match config.signer.sign_digest(&req.content, &opts) {
                Ok(signed_content) => Response::TlsSign(TlsSignResponse { signed_content }),
                Err(e) => {
                    warn!("failed to sign: {e:#}");
                    Response::Error(format!("failed to sign: {e:#}"))
                }
            }
        }
        Request::TlsCert(req) => {
            // The id is informational only.
            debug!("TLSCert request with id {:?}", req.id);
            let certificate = config
                .signer
                .cert_chain()
                .iter()
                .map(|der| pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())))
                .collect::<String>();
            Response::TlsCert(TlsCertResponse { certificate })
        }
    }
}

fn sign_opts(hashtype: HashType, pss: Option<cmc_api::PssOpts>) -> SignOpts {
    SignOpts {
        hash: match hashtype {
            HashType::Sha256 => HashAlg::Sha256,
            HashType::Sha384 => HashAlg::Sha384,
            HashType::Sha512 => HashAlg::Sha512,
        },
        pss: pss.map(|p| PssOpts {
            salt_len: p.salt_len,
        }),
    }
}

/// Load metadata objects from a local directory, skipping subdirectories.
pub fn load_metadata(dir: &std::path::Path) -> Result<Vec<Vec<u8>>> {
    let mut metadata = Vec::new();
    let entries = fs_err::read_dir(dir)
        .with_context(|| format!("failed to read metadata directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            debug!("skipping directory {}", path.display());
            continue;
        }
        debug!("reading metadata file {}", path.display());
        metadata.push(fs_err::read(&path)?);
    }
    Ok(metadata)
}
