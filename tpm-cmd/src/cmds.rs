//! High-level TPM operations used by the driver.

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::consts::*;
use crate::device::{TpmCommand, TpmDevice};
use crate::session::PolicySession;
use crate::types::{SigScheme, TpmtSignature};

/// An open TPM with the command set the attestation stack needs.
pub struct TpmChip {
    device: TpmDevice,
}

/// General TPM properties read via GetCapability.
#[derive(Debug, Clone)]
pub struct TpmInfo {
    pub manufacturer: String,
    pub firmware_major: u32,
    pub firmware_minor: u32,
}

/// Result of TPM2_Create: the exportable key blobs plus the creation data
/// needed for key certification.
#[derive(Debug, Clone)]
pub struct CreatedKey {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
    pub creation_data: Vec<u8>,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: Vec<u8>,
}

impl TpmChip {
    pub fn open(path: Option<&str>) -> Result<Self> {
        let device = match path {
            Some(p) => TpmDevice::open(p)?,
            None => TpmDevice::detect()?,
        };
        Ok(Self { device })
    }

    pub fn device_path(&self) -> &str {
        self.device.path()
    }

    pub fn get_random(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let request = (n - out.len()).min(48) as u16;
            let mut cmd = TpmCommand::new(TPM_CC_GET_RANDOM);
            cmd.u16(request);
            let response = self.device.execute(&cmd.finalize())?;
            response.ensure_success().context("GetRandom failed")?;
            let mut r = response.body_reader();
            out.extend_from_slice(&r.sized()?);
        }
        out.truncate(n);
        Ok(out)
    }

    /// Read all 24 PCRs of the SHA-256 bank, in banked requests of eight.
    pub fn read_pcrs_sha256(&mut self) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut values = Vec::with_capacity(24);
        for bank in 0..3u32 {
            let indices: Vec<u32> = (bank * 8..bank * 8 + 8).collect();
            values.extend(self.pcr_read(&indices)?);
        }
        Ok(values)
    }

    /// TPM2_PCR_Read for the given SHA-256 PCR selection.
    pub fn pcr_read(&mut self, pcrs: &[u32]) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut cmd = TpmCommand::new(TPM_CC_PCR_READ);
        write_pcr_selection(&mut cmd, pcrs);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("PCR_Read failed")?;

        let mut r = response.body_reader();
        let _update_counter = r.u32()?;

        // Selection actually returned by the TPM.
        let mut selected = Vec::new();
        let count = r.u32()?;
        for _ in 0..count {
            let _hash_alg = r.u16()?;
            let sizeof_select = r.u8()? as usize;
            let bitmap = r.bytes(sizeof_select)?;
            for (byte_idx, &byte) in bitmap.iter().enumerate() {
                for bit in 0..8 {
                    if byte & (1 << bit) != 0 {
                        selected.push((byte_idx * 8 + bit) as u32);
                    }
                }
            }
        }

        let digest_count = r.u32()?;
        if digest_count as usize != selected.len() {
            bail!(
                "PCR_Read digest count {digest_count} does not match selection {}",
                selected.len()
            );
        }

        let mut out = Vec::with_capacity(selected.len());
        for idx in selected {
            out.push((idx, r.sized()?));
        }
        Ok(out)
    }

    /// TPM2_Quote: sign the selected SHA-256 PCRs bound to the qualifying
    /// data. Returns the TPMS_ATTEST content and the parsed signature.
    pub fn quote(
        &mut self,
        ak_handle: u32,
        qualifying_data: &[u8],
        pcrs: &[u32],
    ) -> Result<(Vec<u8>, TpmtSignature)> {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_QUOTE);
        cmd.handle(ak_handle);
        cmd.password_auth();
        cmd.sized(qualifying_data);
        cmd.u16(TPM_ALG_NULL); // inScheme: the key's own scheme
        write_pcr_selection(&mut cmd, pcrs);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Quote failed")?;

        let mut r = response.params_reader()?;
        let quoted = r.sized()?; // TPM2B_ATTEST content
        let signature = TpmtSignature::parse(&r.rest())?;

        debug!("generated quote over PCRs {pcrs:?}");
        Ok((quoted, signature))
    }

    /// TPM2_CreatePrimary. Returns the transient handle and the public area.
    pub fn create_primary(&mut self, hierarchy: u32, template: &[u8]) -> Result<(u32, Vec<u8>)> {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_CREATE_PRIMARY);
        cmd.handle(hierarchy);
        cmd.password_auth();
        cmd.sized(&{
            // TPM2B_SENSITIVE_CREATE: empty auth, empty data
            let mut w = crate::wire::Writer::new();
            w.sized(&[]).sized(&[]);
            w.into_vec()
        });
        cmd.sized(template);
        cmd.sized(&[]); // outsideInfo
        cmd.u32(0); // creationPCR: empty TPML_PCR_SELECTION

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("CreatePrimary failed")?;

        // The created handle precedes the parameter size.
        let mut r = response.body_reader();
        let handle = r.u32()?;
        let _param_size = r.u32()?;
        let public = r.sized()?;

        debug!("created primary key 0x{handle:08x}");
        Ok((handle, public))
    }

    /// TPM2_Create under a loaded parent.
    pub fn create(&mut self, parent: u32, template: &[u8]) -> Result<CreatedKey> {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_CREATE);
        cmd.handle(parent);
        cmd.password_auth();
        cmd.sized(&{
            let mut w = crate::wire::Writer::new();
            w.sized(&[]).sized(&[]);
            w.into_vec()
        });
        cmd.sized(template);
        cmd.sized(&[]);
        cmd.u32(0);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Create failed")?;

        let mut r = response.params_reader()?;
        let private = r.sized()?;
        let public = r.sized()?;
        let creation_data = r.sized()?;
        let creation_hash = r.sized()?;
        let creation_ticket = r.rest();

        Ok(CreatedKey {
            private,
            public,
            creation_data,
            creation_hash,
            creation_ticket,
        })
    }

    /// TPM2_Load. Returns the object handle.
    pub fn load(&mut self, parent: u32, private: &[u8], public: &[u8]) -> Result<u32> {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_LOAD);
        cmd.handle(parent);
        cmd.password_auth();
        cmd.sized(private);
        cmd.sized(public);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Load failed")?;

        let mut r = response.body_reader();
        let handle = r.u32()?;
        debug!("loaded key 0x{handle:08x}");
        Ok(handle)
    }

    /// TPM2_Sign over a digest with an explicit scheme. Restricted keys
    /// need the hashcheck `ticket` from [`TpmChip::hash_with_ticket`]; for
    /// unrestricted keys a NULL ticket suffices.
    pub fn sign_digest(
        &mut self,
        key_handle: u32,
        digest: &[u8],
        scheme: SigScheme,
        ticket: Option<&[u8]>,
    ) -> Result<TpmtSignature> {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_SIGN);
        cmd.handle(key_handle);
        cmd.password_auth();
        cmd.sized(digest);
        cmd.u16(scheme.sig_alg).u16(scheme.hash_alg);
        match ticket {
            Some(t) => {
                cmd.bytes(t);
            }
            None => {
                cmd.u16(TPM_ST_HASHCHECK);
                cmd.u32(TPM_RH_NULL);
                cmd.sized(&[]);
            }
        }

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Sign failed")?;

        let mut r = response.params_reader()?;
        TpmtSignature::parse(&r.rest())
    }

    /// TPM2_Hash in the owner hierarchy: digest plus the hashcheck ticket
    /// that allows a restricted key to sign it.
    pub fn hash_with_ticket(&mut self, data: &[u8], hash_alg: u16) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut cmd = TpmCommand::new(TPM_CC_HASH);
        cmd.sized(data);
        cmd.u16(hash_alg);
        cmd.u32(TPM_RH_OWNER);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Hash failed")?;

        let mut r = response.body_reader();
        let digest = r.sized()?;
        let ticket = r.rest();
        Ok((digest, ticket))
    }

    /// TPM2_Certify: certify `object` under `sign_key`. Returns the
    /// TPMS_ATTEST content and the signature.
    pub fn certify(&mut self, object: u32, sign_key: u32) -> Result<(Vec<u8>, TpmtSignature)> {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_CERTIFY);
        cmd.handle(object);
        cmd.handle(sign_key);
        // Both handles use password auth.
        cmd.u32(18);
        cmd.u32(TPM_RS_PW).u16(0).u8(0).u16(0);
        cmd.u32(TPM_RS_PW).u16(0).u8(0).u16(0);
        cmd.sized(&[]); // qualifyingData
        cmd.u16(TPM_ALG_NULL); // inScheme

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Certify failed")?;

        let mut r = response.params_reader()?;
        let certify_info = r.sized()?;
        let signature = TpmtSignature::parse(&r.rest())?;
        Ok((certify_info, signature))
    }

    /// TPM2_CertifyCreation: have the key certify its own creation.
    pub fn certify_creation(
        &mut self,
        sign_key: u32,
        object: u32,
        creation_hash: &[u8],
        creation_ticket: &[u8],
    ) -> Result<(Vec<u8>, TpmtSignature)> {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_CERTIFY_CREATION);
        cmd.handle(sign_key);
        cmd.handle(object);
        cmd.password_auth();
        cmd.sized(&[]); // qualifyingData
        cmd.sized(creation_hash);
        cmd.u16(TPM_ALG_NULL); // inScheme
        cmd.bytes(creation_ticket);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("CertifyCreation failed")?;

        let mut r = response.params_reader()?;
        let certify_info = r.sized()?;
        let signature = TpmtSignature::parse(&r.rest())?;
        Ok((certify_info, signature))
    }

    /// TPM2_ActivateCredential: decrypt the activation challenge. The AK
    /// authorizes with a password, the EK through an endorsement policy
    /// session.
    pub fn activate_credential(
        &mut self,
        ak_handle: u32,
        ek_handle: u32,
        credential_blob: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>> {
        let session = PolicySession::start(&mut self.device)?;
        session.policy_secret_endorsement(&mut self.device)?;

        let mut cmd = TpmCommand::with_sessions(TPM_CC_ACTIVATE_CREDENTIAL);
        cmd.handle(ak_handle);
        cmd.handle(ek_handle);
        cmd.password_then_policy_auth(session.handle);
        cmd.bytes(credential_blob); // TPM2B_ID_OBJECT, size included
        cmd.bytes(secret); // TPM2B_ENCRYPTED_SECRET, size included

        let response = self.device.execute(&cmd.finalize())?;
        let _ = session.flush(&mut self.device);
        response
            .ensure_success()
            .context("ActivateCredential failed")?;

        let mut r = response.params_reader()?;
        let cert_info = r.sized()?;
        debug!("activated credential, secret of {} bytes", cert_info.len());
        Ok(cert_info)
    }

    /// TPM2_EvictControl: persist `object` at `persistent`.
    pub fn evict_control(&mut self, object: u32, persistent: u32) -> Result<()> {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_EVICT_CONTROL);
        cmd.handle(TPM_RH_OWNER);
        cmd.handle(object);
        cmd.password_auth();
        cmd.handle(persistent);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("EvictControl failed")?;
        debug!("persisted key at 0x{persistent:08x}");
        Ok(())
    }

    /// TPM2_ReadPublic: the public area of a loaded or persistent key.
    pub fn read_public(&mut self, handle: u32) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::new(TPM_CC_READ_PUBLIC);
        cmd.handle(handle);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("ReadPublic failed")?;

        let mut r = response.body_reader();
        r.sized()
    }

    pub fn handle_exists(&mut self, handle: u32) -> Result<bool> {
        let mut cmd = TpmCommand::new(TPM_CC_READ_PUBLIC);
        cmd.handle(handle);
        let response = self.device.execute(&cmd.finalize())?;
        Ok(response.is_success())
    }

    pub fn flush(&mut self, handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TPM_CC_FLUSH_CONTEXT);
        cmd.handle(handle);
        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("FlushContext failed")?;
        Ok(())
    }

    /// Manufacturer string and firmware version from the TPM properties.
    pub fn tpm_info(&mut self) -> Result<TpmInfo> {
        let mut cmd = TpmCommand::new(TPM_CC_GET_CAPABILITY);
        cmd.u32(TPM_CAP_TPM_PROPERTIES);
        cmd.u32(TPM_PT_MANUFACTURER);
        cmd.u32(64);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("GetCapability failed")?;

        let mut r = response.body_reader();
        let _more_data = r.u8()?;
        let _capability = r.u32()?;
        let count = r.u32()?;

        let mut info = TpmInfo {
            manufacturer: String::new(),
            firmware_major: 0,
            firmware_minor: 0,
        };
        for _ in 0..count {
            let property = r.u32()?;
            let value = r.u32()?;
            match property {
                TPM_PT_MANUFACTURER => {
                    info.manufacturer = String::from_utf8_lossy(&value.to_be_bytes())
                        .trim_end_matches('\0')
                        .to_string();
                }
                TPM_PT_FIRMWARE_VERSION_1 => info.firmware_major = value,
                TPM_PT_FIRMWARE_VERSION_2 => info.firmware_minor = value,
                _ => {}
            }
        }
        Ok(info)
    }

    /// Read the content of an NV index, used for the EK certificate.
    /// Returns `None` if the index does not exist.
    pub fn nv_read(&mut self, index: u32) -> Result<Option<Vec<u8>>> {
        // Size from the public area first.
        let mut cmd = TpmCommand::new(TPM_CC_NV_READ_PUBLIC);
        cmd.handle(index);
        let response = self.device.execute(&cmd.finalize())?;
        if !response.is_success() {
            return Ok(None);
        }
        let mut r = response.body_reader();
        let nv_public = r.sized()?;
        // TPMS_NV_PUBLIC: index, nameAlg, attributes, authPolicy, dataSize
        let mut p = crate::wire::Reader::new(&nv_public);
        let _index = p.u32()?;
        let _name_alg = p.u16()?;
        let _attributes = p.u32()?;
        let _auth_policy = p.sized()?;
        let total = p.u16()? as usize;

        const MAX_READ: usize = 1024;
        let mut data = Vec::with_capacity(total);
        let mut offset = 0usize;
        while offset < total {
            let chunk = (total - offset).min(MAX_READ);
            let mut cmd = TpmCommand::with_sessions(TPM_CC_NV_READ);
            cmd.handle(index); // authHandle: the index authorizes itself
            cmd.handle(index);
            cmd.password_auth();
            cmd.u16(chunk as u16);
            cmd.u16(offset as u16);

            let response = self.device.execute(&cmd.finalize())?;
            if !response.is_success() {
                return Ok(None);
            }
            let mut r = response.params_reader()?;
            data.extend_from_slice(&r.sized()?);
            offset += chunk;
        }
        Ok(Some(data))
    }
}

fn write_pcr_selection(cmd: &mut TpmCommand, pcrs: &[u32]) {
    let max = pcrs.iter().copied().max().unwrap_or(0) as usize;
    let len = (max / 8 + 1).max(3);
    let mut bitmap = vec![0u8; len];
    for &pcr in pcrs {
        bitmap[pcr as usize / 8] |= 1 << (pcr % 8);
    }
    cmd.u32(1); // one selection
    cmd.u16(TPM_ALG_SHA256);
    cmd.u8(bitmap.len() as u8);
    cmd.bytes(&bitmap);
}
