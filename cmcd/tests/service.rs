//! CMC service round trips over a real socket, backed by the software
//! driver.

use std::sync::Arc;
use std::thread;

use attestation_report::{Measurer, PolicyEngineSelect, Serializer, VerificationResult};
use cmc_api::{CmcClient, HashType};
use cmcd::{Server, ServerConfig};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use sha2::{Digest, Sha256};
use sw_driver::SwDriver;
use x509_parser::prelude::FromDer;

struct Service {
    client: CmcClient,
    ca_pem: String,
}

fn start_service(policy_engine: PolicyEngineSelect) -> Service {
    let serializer = Serializer::Json;
    let driver = Arc::new(SwDriver::new().unwrap());
    let metadata = driver.manifests(serializer).unwrap();
    let ca_pem = driver.ca_pem().to_string();

    let config = ServerConfig {
        metadata,
        measurers: vec![Box::new(driver.clone()) as Box<dyn Measurer>],
        signer: driver,
        serializer,
        policy_engine,
    };
    let server = Server::bind("127.0.0.1:0", config).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.serve());

    Service {
        client: CmcClient::new(addr.to_string()),
        ca_pem,
    }
}

#[test]
fn attest_then_verify_succeeds() {
    let service = start_service(PolicyEngineSelect::None);
    let nonce = [7u8; 32];

    let report = service.client.attest(&nonce).unwrap();
    let result_json = service
        .client
        .verify(&nonce, &report, service.ca_pem.as_bytes(), &[])
        .unwrap();

    let result: VerificationResult = serde_json::from_slice(&result_json).unwrap();
    assert!(result.success, "{result:?}");
}

#[test]
fn stale_nonce_fails_verification() {
    let service = start_service(PolicyEngineSelect::None);

    let report = service.client.attest(&[1u8; 32]).unwrap();
    let result_json = service
        .client
        .verify(&[2u8; 32], &report, service.ca_pem.as_bytes(), &[])
        .unwrap();

    let result: VerificationResult = serde_json::from_slice(&result_json).unwrap();
    assert!(!result.success);
    assert!(!result.nonce_match.success);
}

#[test]
fn short_nonce_is_a_bad_request() {
    let service = start_service(PolicyEngineSelect::None);
    match service.client.attest(&[1, 2, 3]) {
        Err(cmc_api::CmcError::Remote(msg)) => assert!(msg.contains("nonce")),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[test]
fn policy_denial_propagates() {
    let service = start_service(PolicyEngineSelect::Checks);
    let nonce = [9u8; 32];

    let report = service.client.attest(&nonce).unwrap();
    let result_json = service
        .client
        .verify(
            &nonce,
            &report,
            service.ca_pem.as_bytes(),
            br#"{"require":["no_such_check"]}"#,
        )
        .unwrap();

    let result: VerificationResult = serde_json::from_slice(&result_json).unwrap();
    assert!(result.report_signature.success);
    assert!(!result.policy.as_ref().unwrap().success);
    assert!(!result.success);
}

#[test]
fn tls_cert_returns_ik_chain() {
    let service = start_service(PolicyEngineSelect::None);
    let bundle = service.client.tls_cert("id-ignored").unwrap();
    let pems = pem::parse_many(bundle.as_bytes()).unwrap();
    assert_eq!(pems.len(), 2, "leaf and CA expected");
}

#[test]
fn tls_sign_verifies_under_leaf() {
    let service = start_service(PolicyEngineSelect::None);

    let digest = Sha256::digest(b"tls handshake transcript").to_vec();
    let signature = service
        .client
        .tls_sign(&digest, HashType::Sha256, None)
        .unwrap();

    let bundle = service.client.tls_cert("").unwrap();
    let leaf_der = pem::parse_many(bundle.as_bytes()).unwrap()[0].contents().to_vec();
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(&leaf_der).unwrap();
    let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(
        cert.public_key().subject_public_key.data.as_ref(),
    )
    .unwrap();
    let sig = p256::ecdsa::Signature::from_der(&signature).unwrap();
    key.verify_prehash(&digest, &sig).unwrap();
}

#[test]
fn concurrent_attest_requests_all_succeed() {
    let service = start_service(PolicyEngineSelect::None);
    let client = service.client.clone();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            thread::spawn(move || {
                let nonce = [i as u8 + 1; 32];
                client.attest(&nonce).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert!(!handle.join().unwrap().is_empty());
    }
}
