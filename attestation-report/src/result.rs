//! Verification result tree.
//!
//! The JSON rendering of these types is the stable external schema returned
//! by the CMC Verify operation.

use serde::{Deserialize, Serialize};

/// A single named check with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            details: None,
        }
    }

    pub fn fail(name: &str, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            details: Some(details.into()),
        }
    }

    pub fn of(name: &str, success: bool, details: impl Into<String>) -> Self {
        if success {
            Self::ok(name)
        } else {
            Self::fail(name, details)
        }
    }
}

/// Outcome of the TPM measurement checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpmVerificationResult {
    pub ak_chain: CheckResult,
    pub quote_signature: CheckResult,
    pub quote_freshness: CheckResult,
    pub aggregate_pcr_match: CheckResult,
    pub reference_values: Vec<CheckResult>,
}

impl TpmVerificationResult {
    /// All checks failed with the same reason, used when the measurement is
    /// absent or unparsable.
    pub fn all_failed(details: &str) -> Self {
        Self {
            ak_chain: CheckResult::fail("ak_chain", details),
            quote_signature: CheckResult::fail("quote_signature", details),
            quote_freshness: CheckResult::fail("quote_freshness", details),
            aggregate_pcr_match: CheckResult::fail("aggregate_pcr_match", details),
            reference_values: Vec::new(),
        }
    }

    fn success(&self) -> bool {
        self.ak_chain.success
            && self.quote_signature.success
            && self.quote_freshness.success
            && self.aggregate_pcr_match.success
            && self.reference_values.iter().all(|c| c.success)
    }
}

/// The full verification result. `success` is the conjunction of every
/// check and the policy outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    pub report_signature: CheckResult,
    pub nonce_match: CheckResult,
    pub manifest_signatures: Vec<CheckResult>,
    pub tpm: TpmVerificationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CheckResult>,
}

pub const TYPE_VERIFICATION_RESULT: &str = "Verification Result";

impl VerificationResult {
    /// Recompute the terminal `success` field from the individual checks.
    pub fn finalize(&mut self) {
        self.success = self.report_signature.success
            && self.nonce_match.success
            && self.manifest_signatures.iter().all(|c| c.success)
            && self.tpm.success()
            && self.policy.as_ref().map(|c| c.success).unwrap_or(true);
    }

    /// Look up a check by name across the whole tree.
    pub fn find_check(&self, name: &str) -> Option<&CheckResult> {
        let flat = [
            &self.report_signature,
            &self.nonce_match,
            &self.tpm.ak_chain,
            &self.tpm.quote_signature,
            &self.tpm.quote_freshness,
            &self.tpm.aggregate_pcr_match,
        ];
        flat.into_iter()
            .find(|c| c.name == name)
            .or_else(|| self.manifest_signatures.iter().find(|c| c.name == name))
            .or_else(|| self.tpm.reference_values.iter().find(|c| c.name == name))
            .or_else(|| self.policy.as_ref().filter(|c| c.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_json_roundtrip_preserves_checks() {
        let mut result = VerificationResult {
            kind: TYPE_VERIFICATION_RESULT.to_string(),
            success: false,
            report_signature: CheckResult::ok("report_signature"),
            nonce_match: CheckResult::fail("nonce_match", "nonce mismatch"),
            manifest_signatures: vec![CheckResult::ok("rtm_manifest_signature")],
            tpm: TpmVerificationResult {
                ak_chain: CheckResult::ok("ak_chain"),
                quote_signature: CheckResult::ok("quote_signature"),
                quote_freshness: CheckResult::fail("quote_freshness", "stale"),
                aggregate_pcr_match: CheckResult::ok("aggregate_pcr_match"),
                reference_values: vec![CheckResult::of("pcr2", true, "")],
            },
            policy: Some(CheckResult::ok("policy")),
        };
        result.finalize();
        assert!(!result.success);

        let data = serde_json::to_vec(&result).unwrap();
        let back: VerificationResult = serde_json::from_slice(&data).unwrap();
        assert_eq!(result, back);
        assert_eq!(
            back.find_check("quote_freshness").unwrap().details.as_deref(),
            Some("stale")
        );
    }

    #[test]
    fn finalize_is_conjunction() {
        let mut result = VerificationResult {
            kind: TYPE_VERIFICATION_RESULT.to_string(),
            success: false,
            report_signature: CheckResult::ok("report_signature"),
            nonce_match: CheckResult::ok("nonce_match"),
            manifest_signatures: vec![],
            tpm: TpmVerificationResult {
                ak_chain: CheckResult::ok("ak_chain"),
                quote_signature: CheckResult::ok("quote_signature"),
                quote_freshness: CheckResult::ok("quote_freshness"),
                aggregate_pcr_match: CheckResult::ok("aggregate_pcr_match"),
                reference_values: vec![],
            },
            policy: None,
        };
        result.finalize();
        assert!(result.success);

        result.tpm.ak_chain = CheckResult::fail("ak_chain", "untrusted");
        result.finalize();
        assert!(!result.success);
    }
}
