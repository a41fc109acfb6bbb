//! Policy evaluation over a verification result.
//!
//! The built-in engine evaluates a declarative JSON policy: a list of check
//! names that must have succeeded and a list of PCRs whose reference values
//! must be present in the result.

use serde::Deserialize;
use tracing::debug;

use crate::result::{CheckResult, VerificationResult};

/// Which policy engine to run, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyEngineSelect {
    #[default]
    None,
    Checks,
}

impl std::str::FromStr for PolicyEngineSelect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(PolicyEngineSelect::None),
            "checks" => Ok(PolicyEngineSelect::Checks),
            _ => anyhow::bail!("unknown policy engine: {s}"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChecksPolicy {
    #[serde(default)]
    require: Vec<String>,
    #[serde(default)]
    required_pcrs: Vec<u32>,
}

/// Evaluate `policies` against the result so far. Returns `None` when no
/// engine is configured or the policy blob is empty.
pub fn evaluate(
    select: PolicyEngineSelect,
    result: &VerificationResult,
    policies: &[u8],
) -> Option<CheckResult> {
    if policies.is_empty() || select == PolicyEngineSelect::None {
        return None;
    }

    let policy: ChecksPolicy = match serde_json::from_slice(policies) {
        Ok(p) => p,
        Err(e) => {
            return Some(CheckResult::fail("policy", format!("unparsable policy: {e}")));
        }
    };

    for name in &policy.require {
        match result.find_check(name) {
            Some(check) if check.success => {}
            Some(_) => {
                return Some(CheckResult::fail(
                    "policy",
                    format!("required check failed: {name}"),
                ));
            }
            None => {
                return Some(CheckResult::fail(
                    "policy",
                    format!("required check not present: {name}"),
                ));
            }
        }
    }

    for pcr in &policy.required_pcrs {
        let present = result
            .tpm
            .reference_values
            .iter()
            .any(|c| c.name == format!("pcr{pcr}") && c.success);
        if !present {
            return Some(CheckResult::fail(
                "policy",
                format!("no matching reference value for PCR {pcr}"),
            ));
        }
    }

    debug!("policy evaluation passed");
    Some(CheckResult::ok("policy"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{TpmVerificationResult, TYPE_VERIFICATION_RESULT};

    fn passing_result() -> VerificationResult {
        let mut r = VerificationResult {
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
                reference_values: vec![CheckResult::ok("pcr2")],
            },
            policy: None,
        };
        r.finalize();
        r
    }

    #[test]
    fn empty_policy_skips_engine() {
        assert!(evaluate(PolicyEngineSelect::Checks, &passing_result(), b"").is_none());
        assert!(evaluate(
            PolicyEngineSelect::None,
            &passing_result(),
            br#"{"require":["nonce_match"]}"#
        )
        .is_none());
    }

    #[test]
    fn required_checks_enforced() {
        let ok = evaluate(
            PolicyEngineSelect::Checks,
            &passing_result(),
            br#"{"require":["nonce_match","ak_chain"],"required_pcrs":[2]}"#,
        )
        .unwrap();
        assert!(ok.success);

        let missing = evaluate(
            PolicyEngineSelect::Checks,
            &passing_result(),
            br#"{"require":["no_such_check"]}"#,
        )
        .unwrap();
        assert!(!missing.success);

        let missing_pcr = evaluate(
            PolicyEngineSelect::Checks,
            &passing_result(),
            br#"{"required_pcrs":[17]}"#,
        )
        .unwrap();
        assert!(!missing_pcr.success);
    }
}
