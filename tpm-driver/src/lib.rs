//! TPM driver.
//!
//! Owns the TPM device and the attestation (AK) and identity (IK) key
//! lifecycle. On first start it provisions both keys against the enrollment
//! server via credential activation and persists the key store; afterwards
//! the keys load from disk without network access.
//!
//! All TPM access is serialized by an internal mutex; the hardware accepts
//! one command at a time.

mod csr;
mod keystore;

pub mod ima;

pub use csr::{build_csr, ec_spki, rsa_spki, CsrSigAlg, EcCurve};
pub use keystore::{
    chains_present, KeyBlob, AKCHAIN_FILE, AK_BLOB_FILE, IKCHAIN_FILE, IK_BLOB_FILE,
};

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use attestation_report::{
    CsrParams, DeviceConfig, HashChainElem, Measurement, Measurer, Serializer, SignOpts,
    SignatureAlgorithm, Signer, TpmMeasurement, TypeTag, HashAlg, Manifest,
    TYPE_DEVICE_CONFIG, TYPE_OS_MANIFEST, TYPE_RTM_MANIFEST, TYPE_TPM_REFERENCE_VALUE,
};
use est_client::{AkParams, CertifyParams, EstClient};
use tpm_cmd::{
    templates, IkAlg, SigScheme, TpmChip, TpmPublicKey, EK_CERT_NV_INDEX, SRK_PERSISTENT_HANDLE,
    TPM_ALG_SHA256, TPM_ALG_SHA384, TPM_ALG_SHA512, TPM_ECC_NIST_P256, TPM_ECC_NIST_P384,
    TPM_ECC_NIST_P521, TPM_RH_ENDORSEMENT, TPM_RH_OWNER,
};

/// Driver configuration.
pub struct Config {
    pub storage_path: PathBuf,
    /// Enrollment server base URL.
    pub server_addr: String,
    pub key_config: IkAlg,
    /// Signed metadata objects (manifests, descriptions, device config).
    pub metadata: Vec<Vec<u8>>,
    pub use_ima: bool,
    pub ima_pcr: u32,
    pub serializer: Serializer,
    /// TPM device path override; auto-detected when unset.
    pub tpm_device: Option<String>,
}

struct TpmState {
    chip: TpmChip,
    ak_handle: u32,
    ik_handle: u32,
}

/// The TPM driver. Implements [`Measurer`] for report generation and
/// [`Signer`] for the identity key.
pub struct TpmDriver {
    state: Mutex<TpmState>,
    pcrs: Vec<u32>,
    use_ima: bool,
    ima_pcr: u32,
    ik_alg: IkAlg,
    /// AK certificate chain, DER, leaf first.
    akchain: Vec<Vec<u8>>,
    /// IK certificate chain, DER, leaf first.
    ikchain: Vec<Vec<u8>>,
}

impl TpmDriver {
    /// Open the TPM, provisioning it against the enrollment server if the
    /// key store is incomplete, and load the key material.
    pub fn new(config: &Config) -> Result<Self> {
        keystore::ensure_dir(&config.storage_path)?;

        let pcrs = tpm_pcrs_from_metadata(&config.metadata, config.serializer)?;
        debug!("PCRs referenced by manifests: {pcrs:?}");

        let mut chip = TpmChip::open(config.tpm_device.as_deref())
            .context("failed to open the TPM; check access rights to /dev/tpm0")?;

        let provisioning = provisioning_required(&config.storage_path, &mut chip)?;

        let (ak_handle, ik_handle, akchain, ikchain) = if provisioning {
            info!("provisioning TPM (credential activation), this may take a while");
            provision(&mut chip, config)?
        } else {
            debug!("key store present, loading TPM keys");
            load_keys(&mut chip, &config.storage_path)?
        };

        Ok(Self {
            state: Mutex::new(TpmState {
                chip,
                ak_handle,
                ik_handle,
            }),
            pcrs,
            use_ima: config.use_ima,
            ima_pcr: config.ima_pcr,
            ik_alg: config.key_config,
            akchain,
            ikchain,
        })
    }

    /// The AK chain that verifies the quotes (DER, leaf first).
    pub fn measuring_certs(&self) -> &[Vec<u8>] {
        &self.akchain
    }

    /// Flush the loaded key handles and release the device.
    pub fn close(self) -> Result<()> {
        let mut state = self
            .state
            .into_inner()
            .map_err(|_| anyhow!("TPM mutex poisoned"))?;
        let ak = state.ak_handle;
        let ik = state.ik_handle;
        let _ = state.chip.flush(ak);
        let _ = state.chip.flush(ik);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TpmState>> {
        self.state.lock().map_err(|_| anyhow!("TPM mutex poisoned"))
    }
}

impl Measurer for TpmDriver {
    fn name(&self) -> &str {
        "tpm"
    }

    fn measure(&self, nonce: &[u8]) -> Result<Measurement> {
        if self.pcrs.is_empty() {
            warn!("TPM measurement based on reference values does not contain any PCRs");
        }

        let (pcr_values, quote, signature) = {
            let mut state = self.lock()?;
            let pcr_values = state.chip.read_pcrs_sha256()?;
            let ak = state.ak_handle;
            let (quote, signature) = state.chip.quote(ak, nonce, &self.pcrs)?;
            (pcr_values, quote, signature)
        };
        debug!("collected TPM quote over {} PCRs", self.pcrs.len());

        let mut hash_chain = Vec::with_capacity(self.pcrs.len());
        for &pcr in &self.pcrs {
            let value = pcr_values
                .iter()
                .find(|(idx, _)| *idx == pcr)
                .map(|(_, v)| v.clone())
                .with_context(|| format!("PCR {pcr} missing from TPM read"))?;
            hash_chain.push(HashChainElem::new(pcr, vec![value]));
        }

        if self.use_ima {
            // Send the kernel event digests instead of the final PCR value;
            // the verifier extends them to reproduce it.
            match ima::runtime_digests() {
                Ok(digests) => {
                    for elem in &mut hash_chain {
                        if elem.pcr == self.ima_pcr {
                            elem.sha256 = digests.clone();
                        }
                    }
                }
                Err(e) => warn!("failed to get IMA runtime digests, ignoring: {e:#}"),
            }
        }

        let certs = self
            .akchain
            .iter()
            .map(|der| pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())))
            .collect();

        Ok(Measurement::Tpm(TpmMeasurement {
            hash_chain,
            message: quote,
            signature: signature.to_bytes()?,
            certs,
        }))
    }
}

impl Signer for TpmDriver {
    fn algorithm(&self) -> SignatureAlgorithm {
        match self.ik_alg {
            IkAlg::EcP256 => SignatureAlgorithm::EcdsaP256Sha256,
            IkAlg::EcP384 => SignatureAlgorithm::EcdsaP384Sha384,
            IkAlg::EcP521 => SignatureAlgorithm::EcdsaP521Sha512,
            IkAlg::Rsa2048 | IkAlg::Rsa4096 => SignatureAlgorithm::RsaPkcs1Sha256,
        }
    }

    fn sign_digest(&self, digest: &[u8], opts: &SignOpts) -> Result<Vec<u8>> {
        let hash_alg = match opts.hash {
            HashAlg::Sha256 => TPM_ALG_SHA256,
            HashAlg::Sha384 => TPM_ALG_SHA384,
            HashAlg::Sha512 => TPM_ALG_SHA512,
        };
        let scheme = if self.ik_alg.is_rsa() {
            if opts.pss.is_some() {
                SigScheme::rsapss(hash_alg)
            } else {
                SigScheme::rsassa(hash_alg)
            }
        } else {
            SigScheme {
                sig_alg: tpm_cmd::TPM_ALG_ECDSA,
                hash_alg,
            }
        };

        let mut state = self.lock()?;
        let ik = state.ik_handle;
        state.chip.sign_digest(ik, digest, scheme, None)?.to_bytes()
    }

    fn cert_chain(&self) -> Vec<Vec<u8>> {
        self.ikchain.clone()
    }
}

/// Provisioning is required when the key store is incomplete or the storage
/// root key is not persisted in the TPM.
fn provisioning_required(storage: &Path, chip: &mut TpmChip) -> Result<bool> {
    let complete = keystore::chains_present(storage)
        && storage.join(keystore::AK_BLOB_FILE).is_file()
        && storage.join(keystore::IK_BLOB_FILE).is_file();
    if !complete {
        info!("TPM provisioning (credential activation) required: key store incomplete");
        return Ok(true);
    }
    if !chip.handle_exists(SRK_PERSISTENT_HANDLE)? {
        info!("TPM provisioning (credential activation) required: no storage root key");
        return Ok(true);
    }
    debug!("TPM provisioning not required");
    Ok(false)
}

fn load_keys(chip: &mut TpmChip, storage: &Path) -> Result<(u32, u32, Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    let ak_blob = keystore::load_blob(storage, keystore::AK_BLOB_FILE)?;
    let ik_blob = keystore::load_blob(storage, keystore::IK_BLOB_FILE)?;

    let ak_handle = chip
        .load(SRK_PERSISTENT_HANDLE, &ak_blob.private, &ak_blob.public)
        .context("failed to load AK")?;
    let ik_handle = chip
        .load(SRK_PERSISTENT_HANDLE, &ik_blob.private, &ik_blob.public)
        .context("failed to load IK")?;
    debug!("loaded AK and IK from key store");

    let akchain = keystore::load_chain(storage, keystore::AKCHAIN_FILE)?;
    let ikchain = keystore::load_chain(storage, keystore::IKCHAIN_FILE)?;

    Ok((ak_handle, ik_handle, akchain, ikchain))
}

fn provision(
    chip: &mut TpmChip,
    config: &Config,
) -> Result<(u32, u32, Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    let info = chip.tpm_info().context("failed to read TPM properties")?;
    debug!(
        "TPM manufacturer {}, firmware {}.{}",
        info.manufacturer, info.firmware_major, info.firmware_minor
    );

    // Endorsement key: certificate from NV if the manufacturer stored one.
    let ek_cert = chip.nv_read(EK_CERT_NV_INDEX)?;
    if ek_cert.is_none() {
        debug!("no EK certificate in NV storage");
    }
    let (ek_handle, ek_public_area) = chip
        .create_primary(TPM_RH_ENDORSEMENT, &templates::ek_rsa())
        .context("failed to create EK")?;
    let ek_spki = spki_from_public(&ek_public_area)?;

    // Storage root key at its well-known persistent handle.
    if !chip.handle_exists(SRK_PERSISTENT_HANDLE)? {
        let (srk, _) = chip
            .create_primary(TPM_RH_OWNER, &templates::srk())
            .context("failed to create SRK")?;
        chip.evict_control(srk, SRK_PERSISTENT_HANDLE)?;
        chip.flush(srk)?;
    }

    // Attestation key, bound to the SRK, plus its creation attestation.
    let ak = chip
        .create(SRK_PERSISTENT_HANDLE, &templates::ak_ecdsa())
        .context("failed to create AK")?;
    let ak_handle = chip.load(SRK_PERSISTENT_HANDLE, &ak.private, &ak.public)?;
    let (create_attestation, create_signature) =
        chip.certify_creation(ak_handle, ak_handle, &ak.creation_hash, &ak.creation_ticket)?;
    let ak_params = AkParams::new(
        &ak.public,
        &ak.creation_data,
        &create_attestation,
        &create_signature.to_bytes()?,
    );

    // Identity key, certified by the AK.
    let ik = chip
        .create(SRK_PERSISTENT_HANDLE, &templates::ik(config.key_config))
        .context("failed to create IK")?;
    let ik_handle = chip.load(SRK_PERSISTENT_HANDLE, &ik.private, &ik.public)?;
    let (certify_info, certify_signature) = chip.certify(ik_handle, ak_handle)?;
    let ik_params = CertifyParams::new(&ik.public, &certify_info, &certify_signature.to_bytes()?);

    // CSRs from the device configuration.
    let device_config = device_config_from_metadata(&config.metadata, config.serializer)?;
    let ak_csr = build_ak_csr(chip, ak_handle, &ak.public, &device_config.ak_csr)?;
    let ik_csr = build_ik_csr(chip, ik_handle, &ik.public, config.key_config, &device_config.ik_csr)?;
    debug!("created AK CSR ({}) and IK CSR ({})",
        device_config.ak_csr.subject.common_name,
        device_config.ik_csr.subject.common_name);

    // Enrollment: bootstrap the CA chain, then pin its root.
    let bootstrap = EstClient::new(None)?;
    info!("retrieving CA certificates from {}", config.server_addr);
    let ca_certs = bootstrap.ca_certs(&config.server_addr)?;
    let root = ca_certs
        .last()
        .cloned()
        .ok_or_else(|| anyhow!("enrollment server returned an empty CA chain"))?;
    let est = EstClient::with_cas(&[root])?;

    info!("performing TPM AK enroll");
    let challenge = est.tpm_activate_enroll(
        &config.server_addr,
        &info.manufacturer,
        info.firmware_major,
        info.firmware_minor,
        &ek_spki,
        ek_cert.as_deref(),
        None,
        &ak_csr,
        &ak_params,
    )?;

    let secret = chip
        .activate_credential(
            ak_handle,
            ek_handle,
            &challenge.enc_credential,
            &challenge.enc_secret,
        )
        .context("credential activation failed")?;
    let _ = chip.flush(ek_handle);

    let ak_cert = est_client::decrypt_enveloped(&challenge.pkcs7_cert, &secret)
        .context("failed to decrypt AK certificate envelope")?;

    info!("performing TPM IK enroll");
    let ik_cert = est.tpm_certify_enroll(&config.server_addr, &ik_csr, &ik_params, &ak.public)?;

    let mut akchain = vec![ak_cert];
    akchain.extend(ca_certs.iter().cloned());
    let mut ikchain = vec![ik_cert];
    ikchain.extend(ca_certs.iter().cloned());

    keystore::save_chain(&config.storage_path, keystore::AKCHAIN_FILE, &akchain)?;
    keystore::save_chain(&config.storage_path, keystore::IKCHAIN_FILE, &ikchain)?;
    keystore::save_blob(
        &config.storage_path,
        keystore::AK_BLOB_FILE,
        &KeyBlob {
            public: ak.public.clone(),
            private: ak.private.clone(),
        },
    )?;
    keystore::save_blob(
        &config.storage_path,
        keystore::IK_BLOB_FILE,
        &KeyBlob {
            public: ik.public.clone(),
            private: ik.private.clone(),
        },
    )?;
    info!("TPM provisioning finished");

    Ok((ak_handle, ik_handle, akchain, ikchain))
}

fn build_ak_csr(
    chip: &mut TpmChip,
    ak_handle: u32,
    ak_public: &[u8],
    params: &CsrParams,
) -> Result<Vec<u8>> {
    let public = TpmPublicKey::parse(ak_public)?;
    let spki = spki_from_key(&public)?;
    // The AK is restricted: hash in the TPM to obtain the ticket that
    // permits signing externally supplied data.
    build_csr(
        &params.subject,
        &[],
        &spki,
        CsrSigAlg::EcdsaSha256,
        |cri| {
            let (digest, ticket) = chip.hash_with_ticket(cri, TPM_ALG_SHA256)?;
            chip.sign_digest(ak_handle, &digest, SigScheme::ecdsa_sha256(), Some(&ticket))?
                .to_bytes()
        },
    )
}

fn build_ik_csr(
    chip: &mut TpmChip,
    ik_handle: u32,
    ik_public: &[u8],
    alg: IkAlg,
    params: &CsrParams,
) -> Result<Vec<u8>> {
    let public = TpmPublicKey::parse(ik_public)?;
    let spki = spki_from_key(&public)?;
    let (sig_alg, scheme) = match alg {
        IkAlg::EcP256 => (CsrSigAlg::EcdsaSha256, SigScheme::ecdsa_sha256()),
        IkAlg::EcP384 => (
            CsrSigAlg::EcdsaSha384,
            SigScheme {
                sig_alg: tpm_cmd::TPM_ALG_ECDSA,
                hash_alg: TPM_ALG_SHA384,
            },
        ),
        IkAlg::EcP521 => (
            CsrSigAlg::EcdsaSha512,
            SigScheme {
                sig_alg: tpm_cmd::TPM_ALG_ECDSA,
                hash_alg: TPM_ALG_SHA512,
            },
        ),
        IkAlg::Rsa2048 | IkAlg::Rsa4096 => (CsrSigAlg::RsaSha256, SigScheme::rsassa(TPM_ALG_SHA256)),
    };
    let hash = match sig_alg {
        CsrSigAlg::EcdsaSha384 => HashAlg::Sha384,
        CsrSigAlg::EcdsaSha512 => HashAlg::Sha512,
        _ => HashAlg::Sha256,
    };
    build_csr(&params.subject, &params.sans, &spki, sig_alg, |cri| {
        let digest = hash.digest(cri);
        chip.sign_digest(ik_handle, &digest, scheme, None)?.to_bytes()
    })
}

fn spki_from_public(public_area: &[u8]) -> Result<Vec<u8>> {
    spki_from_key(&TpmPublicKey::parse(public_area)?)
}

fn spki_from_key(key: &TpmPublicKey) -> Result<Vec<u8>> {
    match key {
        TpmPublicKey::Ecc { curve, .. } => {
            let ec_curve = match *curve {
                TPM_ECC_NIST_P256 => EcCurve::P256,
                TPM_ECC_NIST_P384 => EcCurve::P384,
                TPM_ECC_NIST_P521 => EcCurve::P521,
                other => bail!("unsupported curve 0x{other:04x}"),
            };
            Ok(ec_spki(ec_curve, &key.ec_point()?))
        }
        TpmPublicKey::Rsa { modulus, exponent } => Ok(rsa_spki(modulus, *exponent)),
    }
}

/// Derive the PCR set to quote from the RTM and OS manifest reference
/// values. Sorted ascending, deduplicated, fixed after init.
pub fn tpm_pcrs_from_metadata(metadata: &[Vec<u8>], serializer: Serializer) -> Result<Vec<u32>> {
    let mut rtm = None;
    let mut os = None;

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
            TYPE_RTM_MANIFEST => {
                rtm = Some(
                    serializer
                        .unmarshal::<Manifest>(&payload)
                        .context("failed to unmarshal RTM Manifest")?,
                );
            }
            TYPE_OS_MANIFEST => {
                os = Some(
                    serializer
                        .unmarshal::<Manifest>(&payload)
                        .context("failed to unmarshal OS Manifest")?,
                );
            }
            _ => {}
        }
    }

    let (Some(rtm), Some(os)) = (rtm, os) else {
        bail!("failed to find RTM and OS manifests in metadata");
    };

    let mut pcrs: Vec<u32> = Vec::new();
    for rv in rtm.reference_values.iter().chain(os.reference_values.iter()) {
        if rv.kind != TYPE_TPM_REFERENCE_VALUE {
            continue;
        }
        if let Some(pcr) = rv.pcr {
            if !pcrs.contains(&pcr) {
                pcrs.push(pcr);
            }
        }
    }
    pcrs.sort_unstable();
    Ok(pcrs)
}

/// Extract the device configuration from the metadata set.
pub fn device_config_from_metadata(
    metadata: &[Vec<u8>],
    serializer: Serializer,
) -> Result<DeviceConfig> {
    for raw in metadata {
        let Ok(payload) = serializer.get_payload(raw) else {
            continue;
        };
        let Ok(tag) = serializer.unmarshal::<TypeTag>(&payload) else {
            continue;
        };
        if tag.kind == TYPE_DEVICE_CONFIG {
            return serializer
                .unmarshal(&payload)
                .context("failed to unmarshal Device Config");
        }
    }
    bail!("failed to find device configuration in metadata");
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;

    fn envelope(payload: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "protected": {"alg": "ES256"},
            "payload": B64.encode(serde_json::to_vec(&payload).unwrap()),
            "signature": B64.encode(b"unchecked"),
            "x5c": [],
        }))
        .unwrap()
    }

    fn manifest(kind: &str, pcrs: &[u32]) -> serde_json::Value {
        let refvals: Vec<serde_json::Value> = pcrs
            .iter()
            .map(|pcr| {
                serde_json::json!({
                    "type": "TPM Reference Value",
                    "sha256": hex::encode([0u8; 32]),
                    "pcr": pcr,
                })
            })
            .collect();
        serde_json::json!({
            "type": kind,
            "name": "test",
            "version": "1",
            "reference_values": refvals,
        })
    }

    #[test]
    fn pcr_set_is_sorted_union() {
        let metadata = vec![
            envelope(manifest("RTM Manifest", &[4, 0, 2])),
            envelope(manifest("OS Manifest", &[2, 10, 1])),
        ];
        let pcrs = tpm_pcrs_from_metadata(&metadata, Serializer::Json).unwrap();
        assert_eq!(pcrs, vec![0, 1, 2, 4, 10]);
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let metadata = vec![envelope(manifest("RTM Manifest", &[0]))];
        assert!(tpm_pcrs_from_metadata(&metadata, Serializer::Json).is_err());
    }

    #[test]
    fn unparsable_objects_are_skipped() {
        let metadata = vec![
            b"garbage".to_vec(),
            envelope(manifest("RTM Manifest", &[1])),
            envelope(manifest("OS Manifest", &[2])),
        ];
        let pcrs = tpm_pcrs_from_metadata(&metadata, Serializer::Json).unwrap();
        assert_eq!(pcrs, vec![1, 2]);
    }

    #[test]
    fn device_config_found() {
        let metadata = vec![envelope(serde_json::json!({
            "type": "Device Config",
            "ak_csr": {"subject": {"common_name": "device-ak"}},
            "ik_csr": {"subject": {"common_name": "device-ik"}, "sans": ["device.example"]},
        }))];
        let dc = device_config_from_metadata(&metadata, Serializer::Json).unwrap();
        assert_eq!(dc.ak_csr.subject.common_name, "device-ak");
        assert_eq!(dc.ik_csr.sans, vec!["device.example".to_string()]);
    }

    #[test]
    fn device_config_missing_is_an_error() {
        assert!(device_config_from_metadata(&[], Serializer::Json).is_err());
    }
}
