//! Policy sessions. Credential activation needs a PolicySecret session
//! against the endorsement hierarchy to authorize use of the EK.

use anyhow::{Context, Result};
use tracing::debug;

use crate::consts::*;
use crate::device::{TpmCommand, TpmDevice};

pub struct PolicySession {
    pub handle: u32,
}

impl PolicySession {
    /// Start a policy session with SHA-256 as the session hash.
    pub fn start(device: &mut TpmDevice) -> Result<Self> {
        let mut cmd = TpmCommand::new(TPM_CC_START_AUTH_SESSION);
        cmd.handle(TPM_RH_NULL); // tpmKey
        cmd.handle(TPM_RH_NULL); // bind
        cmd.sized(&[0u8; 16]); // nonceCaller
        cmd.sized(&[]); // encryptedSalt
        cmd.u8(TPM_SE_POLICY);
        cmd.u16(TPM_ALG_NULL); // symmetric
        cmd.u16(TPM_ALG_SHA256);

        let response = device.execute(&cmd.finalize())?;
        response
            .ensure_success()
            .context("StartAuthSession failed")?;

        let mut r = response.body_reader();
        let handle = r.u32()?;
        let _nonce_tpm = r.sized()?;

        debug!("started policy session 0x{handle:08x}");
        Ok(Self { handle })
    }

    /// Satisfy the EK auth policy: PolicySecret with the endorsement
    /// hierarchy authorization.
    pub fn policy_secret_endorsement(&self, device: &mut TpmDevice) -> Result<()> {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_POLICY_SECRET);
        cmd.handle(TPM_RH_ENDORSEMENT);
        cmd.handle(self.handle);
        cmd.password_auth();
        cmd.sized(&[]); // nonceTPM
        cmd.sized(&[]); // cpHashA
        cmd.sized(&[]); // policyRef
        cmd.i32(0); // expiration

        let response = device.execute(&cmd.finalize())?;
        response.ensure_success().context("PolicySecret failed")?;
        Ok(())
    }

    pub fn flush(self, device: &mut TpmDevice) -> Result<()> {
        let mut cmd = TpmCommand::new(TPM_CC_FLUSH_CONTEXT);
        cmd.handle(self.handle);
        let response = device.execute(&cmd.finalize())?;
        response.ensure_success().context("FlushContext failed")?;
        Ok(())
    }
}
