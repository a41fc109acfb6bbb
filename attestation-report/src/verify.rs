//! The verification check tree.
//!
//! All checks run and contribute to the result; verification only returns an
//! error for an unparsable outer envelope.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::debug;

use crate::policy::{self, PolicyEngineSelect};
use crate::result::{CheckResult, TpmVerificationResult, VerificationResult, TYPE_VERIFICATION_RESULT};
use crate::serializer::Serializer;
use crate::types::*;
use crate::{pki, tpm};

/// Verify a signed attestation report against the expected nonce, the trust
/// anchor and an optional policy.
pub fn verify(
    report: &[u8],
    nonce: &[u8],
    ca_pem: &[u8],
    policies: &[u8],
    policy_engine: PolicyEngineSelect,
    serializer: Serializer,
) -> Result<VerificationResult> {
    // 1. Envelope signature. The payload is still inspected if the envelope
    // check fails, so a tampered report yields the full check tree.
    let (report_signature, payload) =
        serializer.verify_envelope("report_signature", report, ca_pem);
    let payload = payload.context("unparsable report envelope")?;
    let payload: ReportPayload = serializer
        .unmarshal(&payload)
        .context("unparsable report payload")?;

    // 2. Nonce freshness.
    let nonce_match = CheckResult::of(
        "nonce_match",
        payload.nonce == nonce,
        format!(
            "expected nonce {}, report carries {}",
            hex::encode(nonce),
            hex::encode(&payload.nonce)
        ),
    );

    // 3. Manifest signatures, 4. reference value compilation.
    let mut manifest_signatures = Vec::new();
    let mut reference_values: BTreeMap<u32, Vec<ReferenceValue>> = BTreeMap::new();

    let mut embedded = vec![
        ("rtm_manifest_signature", &payload.rtm_manifest),
        ("os_manifest_signature", &payload.os_manifest),
    ];
    for app in &payload.app_manifests {
        embedded.push(("app_manifest_signature", app));
    }

    for (name, raw) in embedded {
        let (check, manifest_payload) = serializer.verify_envelope(name, raw, ca_pem);
        manifest_signatures.push(check);
        let Some(manifest_payload) = manifest_payload else {
            continue;
        };
        let manifest: Manifest = match serializer.unmarshal(&manifest_payload) {
            Ok(m) => m,
            Err(e) => {
                if let Some(check) = manifest_signatures.last_mut() {
                    check.success = false;
                    check.details = Some(format!("unparsable manifest payload: {e:#}"));
                }
                continue;
            }
        };
        for rv in &manifest.reference_values {
            if rv.kind != TYPE_TPM_REFERENCE_VALUE {
                continue;
            }
            let Some(pcr) = rv.pcr else {
                continue;
            };
            reference_values.entry(pcr).or_default().push(rv.clone());
        }
    }

    // 5. TPM measurement checks.
    let tpm_measurement = payload.measurements.iter().find_map(|m| match m {
        Measurement::Tpm(tm) => Some(tm),
        Measurement::Sw(_) => None,
    });
    let tpm_result = match tpm_measurement {
        Some(tm) => verify_tpm_measurement(tm, &payload.nonce, ca_pem, &reference_values),
        None => TpmVerificationResult::all_failed("no TPM measurement in report"),
    };

    let mut result = VerificationResult {
        kind: TYPE_VERIFICATION_RESULT.to_string(),
        success: false,
        report_signature,
        nonce_match,
        manifest_signatures,
        tpm: tpm_result,
        policy: None,
    };
    result.finalize();

    // 6. Policy engine over the result so far.
    result.policy = policy::evaluate(policy_engine, &result, policies);
    result.finalize();

    debug!(success = result.success, "verification finished");
    Ok(result)
}

fn verify_tpm_measurement(
    tm: &TpmMeasurement,
    report_nonce: &[u8],
    ca_pem: &[u8],
    reference_values: &BTreeMap<u32, Vec<ReferenceValue>>,
) -> TpmVerificationResult {
    // AK certificate chain to the verifier anchor.
    let chain: Vec<Vec<u8>> = tm
        .certs
        .iter()
        .filter_map(|p| pem::parse(p).ok().map(|p| p.contents().to_vec()))
        .collect();
    let ak_chain = match (chain.is_empty(), pki::verify_cert_chain(&chain, ca_pem, pki::EKU_TCG_AIK)) {
        (true, _) => CheckResult::fail("ak_chain", "no AK certificates in measurement"),
        (false, Ok(())) => CheckResult::ok("ak_chain"),
        (false, Err(e)) => CheckResult::fail("ak_chain", format!("{e:#}")),
    };

    // Quote signature under the AK leaf.
    let quote_signature = if chain.is_empty() {
        CheckResult::fail("quote_signature", "no AK certificate to verify against")
    } else {
        let verified = pki::detect_alg_label(&chain[0]).and_then(|alg| {
            pki::verify_content_signature(&chain[0], alg, &tm.message, &tm.signature)
        });
        match verified {
            Ok(true) => CheckResult::ok("quote_signature"),
            Ok(false) => CheckResult::fail("quote_signature", "quote signature invalid"),
            Err(e) => CheckResult::fail("quote_signature", format!("{e:#}")),
        }
    };

    let attest = match tpm::parse_attest(&tm.message) {
        Ok(a) => a,
        Err(e) => {
            let mut result = TpmVerificationResult::all_failed(&format!(
                "unparsable quote structure: {e:#}"
            ));
            result.ak_chain = ak_chain;
            result.quote_signature = quote_signature;
            return result;
        }
    };

    // Quoted nonce must match the nonce in the report body.
    let quote_freshness = CheckResult::of(
        "quote_freshness",
        attest.extra_data == report_nonce,
        format!(
            "quoted nonce {} does not match report nonce {}",
            hex::encode(&attest.extra_data),
            hex::encode(report_nonce)
        ),
    );

    // Reproduce each quoted PCR from the hash chain and compare the
    // composite digest against the quote.
    let mut recomputed: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    for elem in &tm.hash_chain {
        match tpm::fold_hash_chain(&elem.sha256) {
            Ok(value) => {
                recomputed.insert(elem.pcr, value);
            }
            Err(e) => debug!("PCR {}: {e:#}", elem.pcr),
        }
    }

    let aggregate_pcr_match = {
        let mut values = Vec::new();
        let mut missing = Vec::new();
        for sel in &attest.quote_info.pcr_selections {
            for pcr in &sel.pcr_indices {
                match recomputed.get(pcr) {
                    Some(v) => values.push(v.clone()),
                    None => missing.push(*pcr),
                }
            }
        }
        if !missing.is_empty() {
            CheckResult::fail(
                "aggregate_pcr_match",
                format!("quoted PCRs missing from hash chain: {missing:?}"),
            )
        } else {
            let composite = tpm::composite_digest(&values);
            CheckResult::of(
                "aggregate_pcr_match",
                composite == attest.quote_info.pcr_digest,
                format!(
                    "recomputed PCR digest {} does not match quoted {}",
                    hex::encode(&composite),
                    hex::encode(&attest.quote_info.pcr_digest)
                ),
            )
        }
    };

    // Reference value membership: each expected digest must appear in the
    // hash chain digest list of its PCR.
    let mut rv_checks = Vec::new();
    for (pcr, rvs) in reference_values {
        for rv in rvs {
            let name = format!("pcr{pcr}");
            let found = tm
                .hash_chain
                .iter()
                .find(|e| e.pcr == *pcr)
                .map(|e| e.sha256.iter().any(|d| d == &rv.sha256))
                .unwrap_or(false);
            let what = rv.name.as_deref().unwrap_or("reference value");
            rv_checks.push(CheckResult::of(
                &name,
                found,
                format!("{what}: digest {} not measured", hex::encode(&rv.sha256)),
            ));
        }
    }

    TpmVerificationResult {
        ak_chain,
        quote_signature,
        quote_freshness,
        aggregate_pcr_match,
        reference_values: rv_checks,
    }
}
