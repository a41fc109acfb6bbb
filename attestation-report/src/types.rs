//! Metadata and report payload types.
//!
//! Every signed payload carries a `type` discriminator at the top so it can
//! be routed by kind without a full parse.

use serde::{Deserialize, Serialize};

pub const TYPE_ATTESTATION_REPORT: &str = "Attestation Report";
pub const TYPE_RTM_MANIFEST: &str = "RTM Manifest";
pub const TYPE_OS_MANIFEST: &str = "OS Manifest";
pub const TYPE_APP_MANIFEST: &str = "App Manifest";
pub const TYPE_APP_DESCRIPTION: &str = "App Description";
pub const TYPE_COMPANY_DESCRIPTION: &str = "Company Description";
pub const TYPE_DEVICE_DESCRIPTION: &str = "Device Description";
pub const TYPE_DEVICE_CONFIG: &str = "Device Config";
pub const TYPE_TPM_REFERENCE_VALUE: &str = "TPM Reference Value";
pub const TYPE_HASH_CHAIN: &str = "Hash Chain";

/// The `type` discriminator alone, for routing payloads by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeTag {
    #[serde(rename = "type")]
    pub kind: String,
}

/// One expected measurement, typed and indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceValue {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub sha256: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcr: Option<u32>,
}

/// Signed metadata describing expected measurements. The `type` field
/// distinguishes the RTM, OS and App manifest kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub reference_values: Vec<ReferenceValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// X.501 subject fields for a CSR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CsrSubject {
    pub common_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
}

/// CSR parameters from the device configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CsrParams {
    pub subject: CsrSubject,
    #[serde(default)]
    pub sans: Vec<String>,
}

/// Device configuration metadata, consumed during provisioning to build the
/// AK and IK certificate signing requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub ak_csr: CsrParams,
    pub ik_csr: CsrParams,
}

/// One element of the measured hash chain. A single digest is the final PCR
/// value; multiple digests are extended in order to reproduce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashChainElem {
    #[serde(rename = "type")]
    pub kind: String,
    pub pcr: u32,
    #[serde(with = "crate::encoding::hex_bytes_vec")]
    pub sha256: Vec<Vec<u8>>,
}

impl HashChainElem {
    pub fn new(pcr: u32, digests: Vec<Vec<u8>>) -> Self {
        Self {
            kind: TYPE_HASH_CHAIN.to_string(),
            pcr,
            sha256: digests,
        }
    }
}

/// TPM evidence: the quoted structure, its signature under the AK, the hash
/// chain covering the quoted PCRs and the AK certificate chain (PEM, leaf
/// first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpmMeasurement {
    pub hash_chain: Vec<HashChainElem>,
    #[serde(with = "crate::encoding::b64_bytes")]
    pub message: Vec<u8>,
    #[serde(with = "crate::encoding::b64_bytes")]
    pub signature: Vec<u8>,
    pub certs: Vec<String>,
}

/// Plain software digest list, for measurers without hardware evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwMeasurement {
    pub name: String,
    #[serde(with = "crate::encoding::hex_bytes_vec")]
    pub digests: Vec<Vec<u8>>,
}

/// Closed set of measurement variants carried in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Measurement {
    #[serde(rename = "TPM Measurement")]
    Tpm(TpmMeasurement),
    #[serde(rename = "SW Measurement")]
    Sw(SwMeasurement),
}

/// The report payload. Manifests and descriptions are embedded as their raw
/// signed envelopes so the verifier can check their signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub nonce: Vec<u8>,
    pub measurements: Vec<Measurement>,
    #[serde(with = "crate::encoding::b64_bytes")]
    pub rtm_manifest: Vec<u8>,
    #[serde(with = "crate::encoding::b64_bytes")]
    pub os_manifest: Vec<u8>,
    #[serde(default, with = "crate::encoding::b64_bytes_vec")]
    pub app_manifests: Vec<Vec<u8>>,
    #[serde(
        default,
        with = "crate::encoding::b64_bytes_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub company_description: Option<Vec<u8>>,
    #[serde(
        default,
        with = "crate::encoding::b64_bytes_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub device_description: Option<Vec<u8>>,
    #[serde(default, with = "crate::encoding::b64_bytes_vec")]
    pub app_descriptions: Vec<Vec<u8>>,
}
