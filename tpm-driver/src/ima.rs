//! Linux IMA binary runtime measurement parsing.
//!
//! Instead of the final IMA PCR value, the measurement carries the list of
//! per-event template hashes; the verifier extends them in order to
//! reproduce the PCR. In the SHA-256 bank the PCR is extended with the
//! SHA-256 of each event's template data.

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::warn;

pub const IMA_MEASUREMENTS_PATH: &str = "/sys/kernel/security/ima/binary_runtime_measurements";

const SHA1_LEN: usize = 20;
const MAX_FIELD_LEN: usize = 1 << 20;

/// Read and parse the kernel's binary runtime measurement list.
pub fn runtime_digests() -> Result<Vec<Vec<u8>>> {
    let data = fs_err::read(Path::new(IMA_MEASUREMENTS_PATH))
        .context("failed to read IMA runtime measurements")?;
    parse_measurements(&data)
}

/// Parse a binary runtime measurement buffer into per-event SHA-256
/// template hashes. Truncated trailing entries are skipped with a warning,
/// matching the kernel file's behavior under concurrent appends.
pub fn parse_measurements(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut digests = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let Some(entry) = parse_entry(data, &mut pos) else {
            warn!("truncated IMA measurement entry at offset {pos}, ignoring remainder");
            break;
        };
        digests.push(Sha256::digest(&entry).to_vec());
    }

    Ok(digests)
}

/// Advance over one entry, returning its template data.
///
/// Entry layout: u32 LE pcr, 20-byte SHA-1 template digest, u32 LE name
/// length + name, u32 LE data length + data.
fn parse_entry(data: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let mut cursor = *pos;

    let read_u32 = |cursor: &mut usize| -> Option<u32> {
        let bytes = data.get(*cursor..*cursor + 4)?;
        *cursor += 4;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    };

    let _pcr = read_u32(&mut cursor)?;
    cursor = cursor.checked_add(SHA1_LEN)?;
    if cursor > data.len() {
        return None;
    }

    let name_len = read_u32(&mut cursor)? as usize;
    if name_len > MAX_FIELD_LEN {
        return None;
    }
    let name = data.get(cursor..cursor + name_len)?;
    cursor += name_len;
    let _name = std::str::from_utf8(name).ok()?;

    let data_len = read_u32(&mut cursor)? as usize;
    if data_len > MAX_FIELD_LEN {
        return None;
    }
    let template_data = data.get(cursor..cursor + data_len)?.to_vec();
    cursor += data_len;

    *pos = cursor;
    Some(template_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_entry(pcr: u32, name: &str, template_data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&pcr.to_le_bytes());
        out.extend_from_slice(&[0u8; SHA1_LEN]);
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(template_data.len() as u32).to_le_bytes());
        out.extend_from_slice(template_data);
        out
    }

    #[test]
    fn parses_template_hashes() {
        let mut buf = encode_entry(10, "ima-ng", b"first template data");
        buf.extend_from_slice(&encode_entry(10, "ima-sig", b"second template data"));

        let digests = parse_measurements(&buf).unwrap();
        assert_eq!(digests.len(), 2);
        assert_eq!(
            digests[0],
            Sha256::digest(b"first template data").to_vec()
        );
        assert_eq!(
            digests[1],
            Sha256::digest(b"second template data").to_vec()
        );
    }

    #[test]
    fn truncated_tail_is_skipped() {
        let mut buf = encode_entry(10, "ima-ng", b"complete entry");
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]); // cut off inside the SHA-1 field

        let digests = parse_measurements(&buf).unwrap();
        assert_eq!(digests.len(), 1);
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(parse_measurements(&[]).unwrap().is_empty());
    }
}
