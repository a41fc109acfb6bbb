//! Report assembly and signing.

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::serializer::Serializer;
use crate::types::*;
use crate::{Measurer, Signer, MIN_NONCE_LEN};

/// Assemble a report payload: collect a measurement from every measurer and
/// classify the metadata objects by their type tag.
pub fn generate(
    nonce: &[u8],
    metadata: &[Vec<u8>],
    measurers: &[Box<dyn Measurer>],
    serializer: Serializer,
) -> Result<ReportPayload> {
    if nonce.len() < MIN_NONCE_LEN {
        bail!(
            "nonce too short: {} bytes, minimum is {MIN_NONCE_LEN}",
            nonce.len()
        );
    }

    let mut measurements = Vec::with_capacity(measurers.len());
    for measurer in measurers {
        let m = measurer
            .measure(nonce)
            .with_context(|| format!("measurer {} failed", measurer.name()))?;
        debug!("collected measurement from {}", measurer.name());
        measurements.push(m);
    }

    let mut rtm_manifest = None;
    let mut os_manifest = None;
    let mut app_manifests = Vec::new();
    let mut company_description = None;
    let mut device_description = None;
    let mut app_descriptions = Vec::new();

    for (i, raw) in metadata.iter().enumerate() {
        let payload = match serializer.get_payload(raw) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to parse metadata object {i}: {e:#}");
                continue;
            }
        };
        let tag: TypeTag = match serializer.unmarshal(&payload) {
            Ok(t) => t,
            Err(e) => {
                warn!("failed to read type of metadata object {i}: {e:#}");
                continue;
            }
        };
        match tag.kind.as_str() {
            TYPE_RTM_MANIFEST => rtm_manifest = Some(raw.clone()),
            TYPE_OS_MANIFEST => os_manifest = Some(raw.clone()),
            TYPE_APP_MANIFEST => app_manifests.push(raw.clone()),
            TYPE_COMPANY_DESCRIPTION => company_description = Some(raw.clone()),
            TYPE_DEVICE_DESCRIPTION => device_description = Some(raw.clone()),
            TYPE_APP_DESCRIPTION => app_descriptions.push(raw.clone()),
            TYPE_DEVICE_CONFIG => {}
            other => warn!("ignoring metadata object of unknown type {other:?}"),
        }
    }

    let rtm_manifest = rtm_manifest.context("no RTM Manifest in metadata")?;
    let os_manifest = os_manifest.context("no OS Manifest in metadata")?;

    Ok(ReportPayload {
        kind: TYPE_ATTESTATION_REPORT.to_string(),
        nonce: nonce.to_vec(),
        measurements,
        rtm_manifest,
        os_manifest,
        app_manifests,
        company_description,
        device_description,
        app_descriptions,
    })
}

/// Serialize and envelope-sign a report payload with the identity key.
pub fn sign_report(
    report: &ReportPayload,
    signer: &dyn Signer,
    serializer: Serializer,
) -> Result<Vec<u8>> {
    let payload = serializer.marshal(report)?;
    serializer.sign(&payload, signer)
}
