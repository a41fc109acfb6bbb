//! TPM device communication over /dev/tpmrm0 or /dev/tpm0.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::consts::*;
use crate::wire::{Reader, Writer};

const TPM_MAX_RESPONSE_SIZE: usize = 4096;

/// An open TPM character device.
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    pub fn open(path: &str) -> Result<Self> {
        let device_path = path.strip_prefix("device:").unwrap_or(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open TPM device {device_path}"))?;
        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Open the resource-managed device if present, the raw device otherwise.
    pub fn detect() -> Result<Self> {
        if Path::new("/dev/tpmrm0").exists() {
            Self::open("/dev/tpmrm0")
        } else if Path::new("/dev/tpm0").exists() {
            Self::open("/dev/tpm0")
        } else {
            bail!("no TPM device found");
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .context("failed to write TPM command")?;
        let mut response = vec![0u8; TPM_MAX_RESPONSE_SIZE];
        let n = self
            .file
            .read(&mut response)
            .context("failed to read TPM response")?;
        response.truncate(n);
        Ok(response)
    }

    pub fn execute(&mut self, command: &[u8]) -> Result<TpmResponse> {
        let response = self.transmit(command)?;
        TpmResponse::parse(&response)
    }
}

/// Command builder: header plus handles, auth area and parameters.
pub struct TpmCommand {
    w: Writer,
}

impl TpmCommand {
    pub fn new(code: u32) -> Self {
        Self::with_tag(TPM_ST_NO_SESSIONS, code)
    }

    pub fn with_sessions(code: u32) -> Self {
        Self::with_tag(TPM_ST_SESSIONS, code)
    }

    fn with_tag(tag: u16, code: u32) -> Self {
        let mut w = Writer::new();
        w.u16(tag).u32(0).u32(code);
        Self { w }
    }

    pub fn handle(&mut self, handle: u32) -> &mut Self {
        self.w.u32(handle);
        self
    }

    /// Single password authorization with an empty auth value.
    pub fn password_auth(&mut self) -> &mut Self {
        self.w.u32(9);
        self.password_session();
        self
    }

    /// Password auth for the first handle, policy session for the second.
    pub fn password_then_policy_auth(&mut self, session: u32) -> &mut Self {
        self.w.u32(9 + 9);
        self.password_session();
        self.w.u32(session).u16(0).u8(TPMA_SESSION_CONTINUE).u16(0);
        self
    }

    fn password_session(&mut self) {
        self.w.u32(TPM_RS_PW).u16(0).u8(0).u16(0);
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.w.u8(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.w.u16(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.w.u32(v);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.w.i32(v);
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.w.bytes(v);
        self
    }

    pub fn sized(&mut self, v: &[u8]) -> &mut Self {
        self.w.sized(v);
        self
    }

    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.w.len() as u32;
        self.w.patch_u32(2, size);
        self.w.into_vec()
    }
}

/// Parsed response header plus body.
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: u16,
    pub response_code: u32,
    pub body: Vec<u8>,
}

impl TpmResponse {
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < 10 {
            bail!("TPM response too short: {} bytes", response.len());
        }
        let mut r = Reader::new(response);
        let tag = r.u16()?;
        if tag != TPM_ST_NO_SESSIONS && tag != TPM_ST_SESSIONS {
            bail!("invalid response tag: 0x{tag:04x}");
        }
        let size = r.u32()? as usize;
        if response.len() < size {
            bail!(
                "TPM response size mismatch: header says {size}, got {}",
                response.len()
            );
        }
        let response_code = r.u32()?;
        Ok(Self {
            tag,
            response_code,
            body: response[10..size].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == 0
    }

    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            bail!("TPM error: 0x{:08x}", self.response_code);
        }
    }

    pub fn body_reader(&self) -> Reader<'_> {
        Reader::new(&self.body)
    }

    /// Reader positioned after the parameter size field of a response to a
    /// command with sessions.
    pub fn params_reader(&self) -> Result<Reader<'_>> {
        let mut r = self.body_reader();
        if self.tag == TPM_ST_SESSIONS {
            let _param_size = r.u32()?;
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_header() {
        let mut cmd = TpmCommand::new(TPM_CC_GET_RANDOM);
        cmd.u16(32);
        let bytes = cmd.finalize();

        assert_eq!(&bytes[0..2], &TPM_ST_NO_SESSIONS.to_be_bytes());
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
        assert_eq!(&bytes[6..10], &TPM_CC_GET_RANDOM.to_be_bytes());
    }

    #[test]
    fn password_auth_area_layout() {
        let mut cmd = TpmCommand::with_sessions(TPM_CC_SIGN);
        cmd.handle(0x8100_0001).password_auth();
        let bytes = cmd.finalize();

        // header (10) + handle (4) + auth size (4) + session (9)
        assert_eq!(bytes.len(), 27);
        assert_eq!(&bytes[14..18], &9u32.to_be_bytes());
        assert_eq!(&bytes[18..22], &TPM_RS_PW.to_be_bytes());
    }

    #[test]
    fn response_parse_success() {
        let raw = [
            0x80, 0x01, // TPM_ST_NO_SESSIONS
            0x00, 0x00, 0x00, 0x0c, // size = 12
            0x00, 0x00, 0x00, 0x00, // success
            0xaa, 0xbb,
        ];
        let resp = TpmResponse::parse(&raw).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.body, vec![0xaa, 0xbb]);
    }

    #[test]
    fn response_parse_error_code() {
        let raw = [0x80, 0x01, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x01, 0x01];
        let resp = TpmResponse::parse(&raw).unwrap();
        assert!(!resp.is_success());
        assert!(resp.ensure_success().is_err());
    }
}
