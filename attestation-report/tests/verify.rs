//! End-to-end report generation and verification with software keys.

use attestation_report::tpm::{build_attest, composite_digest, fold_hash_chain};
use attestation_report::{
    generate, sign_report, verify, HashChainElem, Manifest, Measurement, Measurer,
    PolicyEngineSelect, ReferenceValue, Serializer, SignOpts, SignatureAlgorithm, Signer,
    TpmMeasurement, TYPE_OS_MANIFEST, TYPE_RTM_MANIFEST, TYPE_TPM_REFERENCE_VALUE,
};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::SigningKey;
use p256::pkcs8::DecodePrivateKey;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
    PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384,
};
use sha2::{Digest, Sha256};

struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

fn test_ca() -> TestCa {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::new(Vec::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, "Test Attestation CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let cert = params.self_signed(&key).unwrap();
    TestCa { cert, key }
}

fn issue_leaf(cn: &str, ca: &TestCa) -> (Vec<u8>, SigningKey) {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::new(Vec::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();
    let signing_key = SigningKey::from_pkcs8_der(&key.serialize_der()).unwrap();
    (cert.der().to_vec(), signing_key)
}

struct TestSigner {
    key: SigningKey,
    chain: Vec<Vec<u8>>,
}

impl Signer for TestSigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::EcdsaP256Sha256
    }

    fn sign_digest(&self, digest: &[u8], _opts: &SignOpts) -> anyhow::Result<Vec<u8>> {
        let sig: p256::ecdsa::Signature = self
            .key
            .sign_prehash(digest)
            .map_err(|e| anyhow::anyhow!("signing failed: {e}"))?;
        Ok(sig.to_der().as_bytes().to_vec())
    }

    fn cert_chain(&self) -> Vec<Vec<u8>> {
        self.chain.clone()
    }
}

struct TestSignerP384 {
    key: p384::ecdsa::SigningKey,
    chain: Vec<Vec<u8>>,
}

impl Signer for TestSignerP384 {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::EcdsaP384Sha384
    }

    fn sign_digest(&self, digest: &[u8], _opts: &SignOpts) -> anyhow::Result<Vec<u8>> {
        use p384::ecdsa::signature::hazmat::PrehashSigner;
        let sig: p384::ecdsa::Signature = self
            .key
            .sign_prehash(digest)
            .map_err(|e| anyhow::anyhow!("signing failed: {e}"))?;
        Ok(sig.to_der().as_bytes().to_vec())
    }

    fn cert_chain(&self) -> Vec<Vec<u8>> {
        self.chain.clone()
    }
}

fn issue_leaf_p384(cn: &str, ca: &TestCa) -> (Vec<u8>, p384::ecdsa::SigningKey) {
    use p384::pkcs8::DecodePrivateKey;
    let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
    let mut params = CertificateParams::new(Vec::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();
    let signing_key = p384::ecdsa::SigningKey::from_pkcs8_der(&key.serialize_der()).unwrap();
    (cert.der().to_vec(), signing_key)
}

/// Measurer emitting a synthetic quote over fixed PCR values, signed by the
/// test AK.
struct TestMeasurer {
    ak: TestSigner,
    ca_pem: String,
    /// (pcr, digest list) pairs, in ascending PCR order.
    pcrs: Vec<(u32, Vec<Vec<u8>>)>,
}

impl Measurer for TestMeasurer {
    fn name(&self) -> &str {
        "test-tpm"
    }

    fn measure(&self, nonce: &[u8]) -> anyhow::Result<Measurement> {
        let hash_chain: Vec<HashChainElem> = self
            .pcrs
            .iter()
            .map(|(pcr, digests)| HashChainElem::new(*pcr, digests.clone()))
            .collect();
        let values: Vec<Vec<u8>> = self
            .pcrs
            .iter()
            .map(|(_, digests)| fold_hash_chain(digests).unwrap())
            .collect();
        let indices: Vec<u32> = self.pcrs.iter().map(|(pcr, _)| *pcr).collect();
        let message = build_attest(nonce, &indices, &composite_digest(&values));
        let signature = self.ak.sign(&message, &SignOpts::sha256())?;

        let leaf_pem = pem::encode(&pem::Pem::new("CERTIFICATE", self.ak.chain[0].clone()));
        Ok(Measurement::Tpm(TpmMeasurement {
            hash_chain,
            message,
            signature,
            certs: vec![leaf_pem, self.ca_pem.clone()],
        }))
    }
}

struct Fixture {
    ca_pem: Vec<u8>,
    ik: TestSigner,
    metadata: Vec<Vec<u8>>,
    measurers: Vec<Box<dyn Measurer>>,
}

fn sha(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

fn fixture(serializer: Serializer) -> Fixture {
    let ca = test_ca();
    let ca_pem = ca.cert.pem();

    let (ak_der, ak_key) = issue_leaf("Test AK", &ca);
    let (ik_der, ik_key) = issue_leaf("Test IK", &ca);

    let ik = TestSigner {
        key: ik_key,
        chain: vec![ik_der, ca.cert.der().to_vec()],
    };
    let ak = TestSigner {
        key: ak_key,
        chain: vec![ak_der, ca.cert.der().to_vec()],
    };

    // PCR 2 carries a single firmware digest (the PCR value itself), PCR 4
    // an event list that folds to the quoted value.
    let firmware = sha(b"firmware");
    let events = vec![sha(b"module-a"), sha(b"module-b"), sha(b"module-c")];

    let rtm = Manifest {
        kind: TYPE_RTM_MANIFEST.to_string(),
        name: "de.test.rtm".to_string(),
        version: "1".to_string(),
        reference_values: vec![ReferenceValue {
            kind: TYPE_TPM_REFERENCE_VALUE.to_string(),
            name: Some("firmware".to_string()),
            sha256: firmware.clone(),
            pcr: Some(2),
        }],
        description: None,
    };
    let os = Manifest {
        kind: TYPE_OS_MANIFEST.to_string(),
        name: "de.test.os".to_string(),
        version: "1".to_string(),
        reference_values: vec![ReferenceValue {
            kind: TYPE_TPM_REFERENCE_VALUE.to_string(),
            name: Some("module-b".to_string()),
            sha256: events[1].clone(),
            pcr: Some(4),
        }],
        description: None,
    };

    let metadata = vec![
        serializer
            .sign(&serializer.marshal(&rtm).unwrap(), &ik)
            .unwrap(),
        serializer
            .sign(&serializer.marshal(&os).unwrap(), &ik)
            .unwrap(),
    ];

    let measurer = TestMeasurer {
        ak,
        ca_pem: ca_pem.clone(),
        pcrs: vec![(2, vec![firmware]), (4, events)],
    };

    Fixture {
        ca_pem: ca_pem.into_bytes(),
        ik,
        metadata,
        measurers: vec![Box::new(measurer)],
    }
}

fn make_report(f: &Fixture, nonce: &[u8], serializer: Serializer) -> Vec<u8> {
    let report = generate(nonce, &f.metadata, &f.measurers, serializer).unwrap();
    sign_report(&report, &f.ik, serializer).unwrap()
}

#[test]
fn fresh_report_verifies_json() {
    let serializer = Serializer::Json;
    let f = fixture(serializer);
    let nonce = [0x42u8; 32];
    let signed = make_report(&f, &nonce, serializer);

    let result = verify(
        &signed,
        &nonce,
        &f.ca_pem,
        &[],
        PolicyEngineSelect::None,
        serializer,
    )
    .unwrap();

    assert!(result.report_signature.success, "{result:?}");
    assert!(result.nonce_match.success);
    assert!(result.tpm.ak_chain.success, "{:?}", result.tpm.ak_chain);
    assert!(result.tpm.quote_signature.success);
    assert!(result.tpm.quote_freshness.success);
    assert!(result.tpm.aggregate_pcr_match.success);
    assert_eq!(result.tpm.reference_values.len(), 2);
    assert!(result.tpm.reference_values.iter().all(|c| c.success));
    assert!(result.success);
}

#[test]
fn fresh_report_verifies_cbor() {
    let serializer = Serializer::Cbor;
    let f = fixture(serializer);
    let nonce = [0x43u8; 32];
    let signed = make_report(&f, &nonce, serializer);

    let result = verify(
        &signed,
        &nonce,
        &f.ca_pem,
        &[],
        PolicyEngineSelect::None,
        serializer,
    )
    .unwrap();
    assert!(result.success, "{result:?}");
}

#[test]
fn distinct_nonce_fails_verification() {
    let serializer = Serializer::Json;
    let f = fixture(serializer);
    let signed = make_report(&f, &[0x01u8; 32], serializer);

    let result = verify(
        &signed,
        &[0x02u8; 32],
        &f.ca_pem,
        &[],
        PolicyEngineSelect::None,
        serializer,
    )
    .unwrap();

    assert!(!result.nonce_match.success);
    assert!(!result.tpm.quote_freshness.success);
    assert!(!result.success);
    // Everything else still holds.
    assert!(result.report_signature.success);
    assert!(result.tpm.aggregate_pcr_match.success);
}

#[test]
fn tampered_pcr_digest_detected() {
    let serializer = Serializer::Json;
    let f = fixture(serializer);
    let nonce = [0x05u8; 32];

    let mut report = generate(&nonce, &f.metadata, &f.measurers, serializer).unwrap();
    if let Measurement::Tpm(tm) = &mut report.measurements[0] {
        tm.hash_chain[0].sha256[0][0] ^= 0xff;
    } else {
        panic!("expected TPM measurement");
    }
    // Re-sign so only the measurement itself is inconsistent.
    let signed = sign_report(&report, &f.ik, serializer).unwrap();

    let result = verify(
        &signed,
        &nonce,
        &f.ca_pem,
        &[],
        PolicyEngineSelect::None,
        serializer,
    )
    .unwrap();

    assert!(!result.tpm.aggregate_pcr_match.success);
    assert!(!result.tpm.reference_values[0].success);
    assert!(!result.success);
}

#[test]
fn tampered_envelope_fails_signature_check() {
    let serializer = Serializer::Json;
    let f = fixture(serializer);
    let nonce = [0x06u8; 32];
    let signed = make_report(&f, &nonce, serializer);

    // Flip a byte inside the base64 payload of the envelope.
    let mut env: serde_json::Value = serde_json::from_slice(&signed).unwrap();
    let payload = env["payload"].as_str().unwrap().to_string();
    use base64::{engine::general_purpose::STANDARD, Engine};
    let mut raw = STANDARD.decode(&payload).unwrap();
    let pos = raw.len() / 2;
    raw[pos] ^= 0x01;
    env["payload"] = serde_json::Value::String(STANDARD.encode(&raw));
    let tampered = serde_json::to_vec(&env).unwrap();

    let result = verify(
        &tampered,
        &nonce,
        &f.ca_pem,
        &[],
        PolicyEngineSelect::None,
        serializer,
    )
    .unwrap();

    assert!(!result.report_signature.success);
    assert!(!result.success);
}

#[test]
fn untrusted_ca_fails_chain_checks() {
    let serializer = Serializer::Json;
    let f = fixture(serializer);
    let other_ca = test_ca();
    let nonce = [0x07u8; 32];
    let signed = make_report(&f, &nonce, serializer);

    let result = verify(
        &signed,
        &nonce,
        other_ca.cert.pem().as_bytes(),
        &[],
        PolicyEngineSelect::None,
        serializer,
    )
    .unwrap();

    assert!(!result.report_signature.success);
    assert!(!result.tpm.ak_chain.success);
    assert!(!result.success);
}

#[test]
fn policy_denial_flips_only_policy_check() {
    let serializer = Serializer::Json;
    let f = fixture(serializer);
    let nonce = [0x08u8; 32];
    let signed = make_report(&f, &nonce, serializer);

    let policy = br#"{"require":["no_such_check"]}"#;
    let result = verify(
        &signed,
        &nonce,
        &f.ca_pem,
        policy,
        PolicyEngineSelect::Checks,
        serializer,
    )
    .unwrap();

    assert!(result.report_signature.success);
    assert!(result.nonce_match.success);
    assert!(result.tpm.aggregate_pcr_match.success);
    let policy_check = result.policy.as_ref().unwrap();
    assert!(!policy_check.success);
    assert!(!result.success);
}

#[test]
fn es384_identity_key_report_verifies() {
    let serializer = Serializer::Json;
    let ca = test_ca();
    let ca_pem = ca.cert.pem();

    let (ak_der, ak_key) = issue_leaf("Test AK", &ca);
    let (ik_der, ik_key) = issue_leaf_p384("Test IK P-384", &ca);

    let ak = TestSigner {
        key: ak_key,
        chain: vec![ak_der, ca.cert.der().to_vec()],
    };
    let ik = TestSignerP384 {
        key: ik_key,
        chain: vec![ik_der, ca.cert.der().to_vec()],
    };

    let firmware = sha(b"firmware-384");
    let rtm = Manifest {
        kind: TYPE_RTM_MANIFEST.to_string(),
        name: "de.test.rtm".to_string(),
        version: "1".to_string(),
        reference_values: vec![ReferenceValue {
            kind: TYPE_TPM_REFERENCE_VALUE.to_string(),
            name: Some("firmware".to_string()),
            sha256: firmware.clone(),
            pcr: Some(2),
        }],
        description: None,
    };
    let os = Manifest {
        kind: TYPE_OS_MANIFEST.to_string(),
        name: "de.test.os".to_string(),
        version: "1".to_string(),
        reference_values: vec![],
        description: None,
    };
    let metadata = vec![
        serializer
            .sign(&serializer.marshal(&rtm).unwrap(), &ik)
            .unwrap(),
        serializer
            .sign(&serializer.marshal(&os).unwrap(), &ik)
            .unwrap(),
    ];

    let measurers: Vec<Box<dyn Measurer>> = vec![Box::new(TestMeasurer {
        ak,
        ca_pem: ca_pem.clone(),
        pcrs: vec![(2, vec![firmware])],
    })];

    let nonce = [0x21u8; 32];
    let report = generate(&nonce, &metadata, &measurers, serializer).unwrap();
    let signed = sign_report(&report, &ik, serializer).unwrap();

    let result = verify(
        &signed,
        &nonce,
        ca_pem.as_bytes(),
        &[],
        PolicyEngineSelect::None,
        serializer,
    )
    .unwrap();
    assert!(result.report_signature.success, "{result:?}");
    assert!(result.success, "{result:?}");
}

#[test]
fn short_nonce_rejected_at_generation() {
    let serializer = Serializer::Json;
    let f = fixture(serializer);
    assert!(generate(&[1, 2, 3], &f.metadata, &f.measurers, serializer).is_err());
}

#[test]
fn garbage_report_is_an_error() {
    assert!(verify(
        b"not a report",
        &[0u8; 32],
        b"",
        &[],
        PolicyEngineSelect::None,
        Serializer::Json,
    )
    .is_err());
}
