//! End-to-end attested TLS: in-process CMC service on the software driver,
//! real sockets, real handshakes.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use attestation_report::{Measurer, PolicyEngineSelect, Serializer};
use attested_tls::{dial, AtlsConfig, AtlsError, Listener, TlsParams};
use cmcd::{Server, ServerConfig};
use rustls::RootCertStore;
use rustls_pki_types::CertificateDer;
use sw_driver::SwDriver;

struct Cmc {
    addr: String,
    ca_pem: Vec<u8>,
}

/// Spin up a CMC service backed by a fresh software driver.
fn start_cmc() -> Cmc {
    let serializer = Serializer::Json;
    let driver = Arc::new(SwDriver::new().unwrap());
    let metadata = driver.manifests(serializer).unwrap();
    let ca_pem = driver.ca_pem().as_bytes().to_vec();

    let server = Server::bind(
        "127.0.0.1:0",
        ServerConfig {
            metadata,
            measurers: vec![Box::new(driver.clone()) as Box<dyn Measurer>],
            signer: driver,
            serializer,
            policy_engine: PolicyEngineSelect::None,
        },
    )
    .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    thread::spawn(move || server.serve());

    Cmc { addr, ca_pem }
}

fn root_store(ca_pem: &[u8]) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for p in pem::parse_many(ca_pem).unwrap() {
        roots
            .add(CertificateDer::from(p.into_contents()))
            .unwrap();
    }
    roots
}

fn conf(cmc: &Cmc, mtls: bool) -> AtlsConfig {
    AtlsConfig::builder()
        .cmc_addr(cmc.addr.clone())
        .ca(cmc.ca_pem.clone())
        .mtls(mtls)
        .build()
}

/// Accept one connection and echo a single line back.
fn spawn_echo_server(
    listener: Listener,
) -> mpsc::Receiver<Result<(), String>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let outcome = (|| {
            let (stream, _peer) = listener.accept().map_err(|e| format!("accept: {e:?}"))?;
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .map_err(|e| format!("read: {e}"))?;
            let stream = reader.get_mut();
            stream
                .write_all(line.as_bytes())
                .map_err(|e| format!("write: {e}"))?;
            stream.flush().map_err(|e| format!("flush: {e}"))?;
            Ok(())
        })();
        let _ = tx.send(outcome);
    });
    rx
}

#[test]
fn server_attestation_echo_roundtrip() {
    let cmc = start_cmc();

    let listener = Listener::bind("127.0.0.1:0", None, conf(&cmc, false)).unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_done = spawn_echo_server(listener);

    let tls = TlsParams {
        roots: root_store(&cmc.ca_pem),
        server_name: "localhost".to_string(),
    };
    let mut stream = dial(&addr, &tls, &conf(&cmc, false)).unwrap();

    // The client verified the server's report.
    let result = stream.peer_verification().expect("verification result");
    assert!(result.success);

    stream.write_all(b"hello\n").unwrap();
    stream.flush().unwrap();
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello\n");

    server_done.recv().unwrap().unwrap();
}

#[test]
fn mutual_attestation_succeeds() {
    let cmc = start_cmc();

    let listener = Listener::bind(
        "127.0.0.1:0",
        Some(root_store(&cmc.ca_pem)),
        conf(&cmc, true),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let outcome = listener.accept().map(|(stream, _)| {
            stream
                .peer_verification()
                .map(|r| r.success)
                .unwrap_or(false)
        });
        let _ = tx.send(outcome.map_err(|e| format!("{e:?}")));
    });

    let tls = TlsParams {
        roots: root_store(&cmc.ca_pem),
        server_name: "localhost".to_string(),
    };
    let stream = dial(&addr, &tls, &conf(&cmc, true)).unwrap();
    assert!(stream.peer_verification().unwrap().success);

    // The server verified the client report too.
    assert!(rx.recv().unwrap().unwrap());
}

#[test]
fn untrusted_attestation_ca_yields_attested_error() {
    let cmc = start_cmc();
    // A second, unrelated driver provides a CA the server's report does not
    // chain to.
    let other = SwDriver::new().unwrap();

    let listener = Listener::bind("127.0.0.1:0", None, conf(&cmc, false)).unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _server = spawn_echo_server(listener);

    let tls = TlsParams {
        roots: root_store(&cmc.ca_pem),
        server_name: "localhost".to_string(),
    };
    let client_conf = AtlsConfig::builder()
        .cmc_addr(cmc.addr.clone())
        .ca(other.ca_pem().as_bytes().to_vec())
        .build();

    match dial(&addr, &tls, &client_conf) {
        Err(AtlsError::Attestation(e)) => {
            let result = e.verification_result();
            assert!(!result.success);
            assert!(!result.report_signature.success);
            assert!(!result.tpm.ak_chain.success);
        }
        other => panic!("expected attestation failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn missing_cmc_service_fails_cleanly() {
    let cmc = start_cmc();
    let listener = Listener::bind("127.0.0.1:0", None, conf(&cmc, false)).unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _server = spawn_echo_server(listener);

    // Client pointed at a CMC endpoint nothing listens on.
    let tls = TlsParams {
        roots: root_store(&cmc.ca_pem),
        server_name: "localhost".to_string(),
    };
    let bad_conf = AtlsConfig::builder()
        .cmc_addr("127.0.0.1:1".to_string())
        .ca(cmc.ca_pem.clone())
        .build();

    assert!(dial(&addr, &tls, &bad_conf).is_err());
}
