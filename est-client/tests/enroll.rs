//! Enrollment client against a mock enrollment server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use est_client::{decrypt_enveloped, encrypt_enveloped, AkParams, CertifyParams, EstClient};

/// Minimal single-threaded HTTP responder: for each connection, read one
/// request and answer with a canned response per path.
fn spawn_server(responses: Vec<(&'static str, u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            handle(stream, &responses);
        }
    });
    format!("http://{addr}")
}

fn handle(mut stream: TcpStream, responses: &[(&'static str, u16, String)]) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let request_line = head.lines().next().unwrap_or_default().to_string();
    let content_length: usize = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            if k.eq_ignore_ascii_case("content-length") {
                v.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (status, body) = responses
        .iter()
        .find(|(p, _, _)| path.ends_with(p))
        .map(|(_, s, b)| (*s, b.clone()))
        .unwrap_or((404, String::new()));

    let reason = if status == 200 { "OK" } else { "Error" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}

fn dummy_ak_params() -> AkParams {
    AkParams::new(b"public", b"create-data", b"create-attest", b"create-sig")
}

#[test]
fn ca_certs_parses_pem_bundle() {
    let bundle = pem::encode(&pem::Pem::new("CERTIFICATE", b"intermediate".to_vec()))
        + &pem::encode(&pem::Pem::new("CERTIFICATE", b"root".to_vec()));
    let server = spawn_server(vec![("/est/cacerts", 200, bundle)]);

    let client = EstClient::new(None).unwrap();
    let certs = client.ca_certs(&server).unwrap();
    assert_eq!(certs.len(), 2);
    assert_eq!(certs[0], b"intermediate");
    assert_eq!(certs[1], b"root");
}

#[test]
fn activate_enroll_returns_decryptable_challenge() {
    let secret = [0x5au8; 32];
    let ak_cert_der = b"the AK certificate".to_vec();
    let envelope = encrypt_enveloped(&ak_cert_der, &secret, &[0x01u8; 12]).unwrap();

    let body = serde_json::json!({
        "enc_credential": B64.encode(b"credential"),
        "enc_secret": B64.encode(b"encrypted-seed"),
        "pkcs7_cert": B64.encode(&envelope),
    })
    .to_string();
    let server = spawn_server(vec![("/est/tpmactivateenroll", 200, body)]);

    let client = EstClient::new(None).unwrap();
    let challenge = client
        .tpm_activate_enroll(
            &server,
            "TestVendor",
            2,
            0,
            b"ek-public-der",
            None,
            Some("https://ek.example/cert"),
            b"ak-csr-der",
            &dummy_ak_params(),
        )
        .unwrap();

    assert_eq!(challenge.enc_credential, b"credential");
    // The activation secret unwraps the certificate envelope.
    let cert = decrypt_enveloped(&challenge.pkcs7_cert, &secret).unwrap();
    assert_eq!(cert, ak_cert_der);
}

#[test]
fn certify_enroll_returns_certificate() {
    let body = serde_json::json!({ "certificate": B64.encode(b"ik-cert-der") }).to_string();
    let server = spawn_server(vec![("/est/tpmcertifyenroll", 200, body)]);

    let client = EstClient::new(None).unwrap();
    let params = CertifyParams::new(b"ik-public", b"certify-info", b"certify-sig");
    let cert = client
        .tpm_certify_enroll(&server, b"ik-csr", &params, b"ak-public")
        .unwrap();
    assert_eq!(cert, b"ik-cert-der");
}

#[test]
fn non_2xx_is_a_status_error() {
    let server = spawn_server(vec![("/est/cacerts", 500, String::new())]);
    let client = EstClient::new(None).unwrap();
    match client.ca_certs(&server) {
        Err(est_client::EnrollError::Status(500)) => {}
        other => panic!("expected status error, got {other:?}"),
    }
}

#[test]
fn malformed_body_is_a_malformed_error() {
    let server = spawn_server(vec![("/est/tpmcertifyenroll", 200, "not json".to_string())]);
    let client = EstClient::new(None).unwrap();
    let params = CertifyParams::new(b"p", b"i", b"s");
    match client.tpm_certify_enroll(&server, b"csr", &params, b"ak") {
        Err(est_client::EnrollError::Malformed(_)) => {}
        other => panic!("expected malformed error, got {other:?}"),
    }
}
