//! Attested dial and listen.
//!
//! Both protocols run the TLS handshake first, derive the channel bindings
//! from the exporter, then exchange length-prefixed attestation reports
//! over the established channel and gate the connection on verification.
//! No application bytes flow before attestation succeeds.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection,
    StreamOwned};
use rustls_pki_types::ServerName;
use tracing::{debug, info};

use attestation_report::VerificationResult;
use cmc_api::CmcClient;

use crate::signer::{cmc_certified_key, CmcClientCertResolver, CmcServerCertResolver};
use crate::{AtlsConfig, AtlsError, AttestedError, CHANNEL_BINDING_LABEL, CHANNEL_BINDING_LEN};

/// Maximum accepted report frame.
const MAX_REPORT_LEN: usize = 16 * 1024 * 1024;

/// Caller-provided TLS parameters: the peer certificate trust roots and,
/// for dialing, the expected server name.
pub struct TlsParams {
    pub roots: RootCertStore,
    pub server_name: String,
}

/// An attested TLS stream. Created only after the peer's attestation (if
/// required by the role and mode) verified successfully.
pub struct AttestedStream<C> {
    inner: StreamOwned<C, TcpStream>,
    peer_result: Option<VerificationResult>,
}

pub type AttestedClientStream = AttestedStream<ClientConnection>;
pub type AttestedServerStream = AttestedStream<ServerConnection>;

impl<C> AttestedStream<C> {
    /// The peer's verification result, when this side verified one.
    pub fn peer_verification(&self) -> Option<&VerificationResult> {
        self.peer_result.as_ref()
    }
}

impl Read for AttestedStream<ClientConnection> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for AttestedStream<ClientConnection> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Read for AttestedStream<ServerConnection> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for AttestedStream<ServerConnection> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Establish an attested TLS connection to `addr`.
///
/// The server always attests; with `mtls` this side sends its own report
/// as well. Fails with [`AtlsError::Attestation`] when the peer report does
/// not verify.
/// Pin the process-wide rustls provider to ring. A no-op once installed.
fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub fn dial(addr: &str, tls: &TlsParams, conf: &AtlsConfig) -> Result<AttestedClientStream, AtlsError> {
    ensure_crypto_provider();
    let cmc = CmcClient::new(conf.cmc_addr.clone());

    let builder = ClientConfig::builder().with_root_certificates(tls.roots.clone());
    let client_config = if conf.mtls {
        let key = cmc_certified_key(&cmc)?;
        builder.with_client_cert_resolver(Arc::new(CmcClientCertResolver::new(key)))
    } else {
        builder.with_no_client_auth()
    };

    let server_name = ServerName::try_from(tls.server_name.clone())
        .map_err(|e| AtlsError::Other(anyhow!("invalid server name: {e}")))?;
    let mut conn = ClientConnection::new(Arc::new(client_config), server_name)?;

    let mut sock = TcpStream::connect(addr)?;
    sock.set_read_timeout(Some(conf.attest_timeout))?;
    sock.set_write_timeout(Some(conf.attest_timeout))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut sock).map_err(map_timeout)?;
    }
    debug!("TLS handshake complete, deriving channel bindings");

    let chbindings = channel_bindings(&conn)?;
    let mut stream = StreamOwned::new(conn, sock);

    // Dial protocol: send own report first when mutually attesting, then
    // receive and verify the server's.
    if conf.mtls {
        let report = cmc
            .attest(&chbindings)
            .context("failed to obtain own attestation report")?;
        write_report(&mut stream, &report).map_err(map_timeout)?;
    }
    let peer_report = read_report(&mut stream).map_err(map_timeout)?;
    let result = verify_peer(&cmc, &chbindings, &peer_report, conf)?;
    info!("peer attestation verified");

    clear_timeouts(&stream)?;
    Ok(AttestedStream {
        inner: stream,
        peer_result: Some(result),
    })
}

/// Listener for attested TLS connections.
pub struct Listener {
    tcp: TcpListener,
    server_config: Arc<ServerConfig>,
    conf: AtlsConfig,
    cmc: CmcClient,
}

impl Listener {
    /// Bind an attested listener. `client_auth_roots` is required in mTLS
    /// mode and used to verify the client certificate during the
    /// handshake; attestation verification uses `conf.ca`.
    pub fn bind(
        addr: &str,
        client_auth_roots: Option<RootCertStore>,
        conf: AtlsConfig,
    ) -> Result<Self, AtlsError> {
        ensure_crypto_provider();
        let cmc = CmcClient::new(conf.cmc_addr.clone());
        let key = cmc_certified_key(&cmc)?;

        let builder = ServerConfig::builder();
        let server_config = if conf.mtls {
            let roots = client_auth_roots
                .ok_or_else(|| AtlsError::Other(anyhow!("mTLS requires client CA roots")))?;
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| AtlsError::Other(anyhow!("invalid client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        }
        .with_cert_resolver(Arc::new(CmcServerCertResolver::new(key)));

        Ok(Self {
            tcp: TcpListener::bind(addr)?,
            server_config: Arc::new(server_config),
            conf,
            cmc,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AtlsError> {
        Ok(self.tcp.local_addr()?)
    }

    /// Accept one connection and run the attested exchange. The server
    /// sends its report first; with mTLS it then verifies the client's.
    pub fn accept(&self) -> Result<(AttestedServerStream, SocketAddr), AtlsError> {
        let (mut sock, peer) = self.tcp.accept()?;
        debug!("accepted TCP connection from {peer}");
        sock.set_read_timeout(Some(self.conf.attest_timeout))?;
        sock.set_write_timeout(Some(self.conf.attest_timeout))?;

        let mut conn = ServerConnection::new(self.server_config.clone())?;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock).map_err(map_timeout)?;
        }

        let chbindings = channel_bindings(&conn)?;
        let mut stream = StreamOwned::new(conn, sock);

        let report = self
            .cmc
            .attest(&chbindings)
            .context("failed to obtain own attestation report")?;
        write_report(&mut stream, &report).map_err(map_timeout)?;

        let peer_result = if self.conf.mtls {
            let peer_report = read_report(&mut stream).map_err(map_timeout)?;
            let result = verify_peer(&self.cmc, &chbindings, &peer_report, &self.conf)?;
            info!("client attestation verified");
            Some(result)
        } else {
            None
        };

        clear_timeouts(&stream)?;
        Ok((
            AttestedStream {
                inner: stream,
                peer_result,
            },
            peer,
        ))
    }
}

/// 32 bytes from the TLS exporter. Fails fatally when the stack cannot
/// export, as required: without bindings there is nothing tying the report
/// to this channel.
fn channel_bindings<C, S>(conn: &C) -> Result<Vec<u8>, AtlsError>
where
    C: std::ops::Deref<Target = rustls::ConnectionCommon<S>>,
{
    let bindings = (**conn)
        .export_keying_material(vec![0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
        .map_err(|e| AtlsError::Other(anyhow!("TLS exporter failed: {e}")))?;
    Ok(bindings)
}

fn verify_peer(
    cmc: &CmcClient,
    chbindings: &[u8],
    peer_report: &[u8],
    conf: &AtlsConfig,
) -> Result<VerificationResult, AtlsError> {
    let result_json = cmc
        .verify(chbindings, peer_report, &conf.ca, &conf.policies)
        .context("verification request failed")?;
    let result: VerificationResult = serde_json::from_slice(&result_json)
        .context("unparsable verification result")?;
    if !result.success {
        return Err(AttestedError::new(result).into());
    }
    Ok(result)
}

fn write_report<W: Write>(writer: &mut W, report: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(report.len() as u32).to_be_bytes())?;
    writer.write_all(report)?;
    writer.flush()
}

fn read_report<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_REPORT_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("report frame of {len} bytes too large"),
        ));
    }
    let mut report = vec![0u8; len];
    reader.read_exact(&mut report)?;
    Ok(report)
}

fn clear_timeouts<C>(stream: &StreamOwned<C, TcpStream>) -> Result<(), AtlsError> {
    stream.sock.set_read_timeout(None)?;
    stream.sock.set_write_timeout(None)?;
    Ok(())
}

fn map_timeout(e: std::io::Error) -> AtlsError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => AtlsError::Timeout,
        _ => AtlsError::Io(e),
    }
}
