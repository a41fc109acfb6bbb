//! TPMS_ATTEST wire structure and PCR hash chain arithmetic.

use anyhow::{anyhow, bail, Result};
use sha2::{Digest, Sha256};

/// TPM_GENERATED magic at the head of every TPMS_ATTEST.
pub const TPM_GENERATED_MAGIC: u32 = 0xff54_4347;
/// TPM_ST_ATTEST_QUOTE
pub const TAG_ATTEST_QUOTE: u16 = 0x8018;
/// TPM_ALG_SHA256
pub const ALG_SHA256: u16 = 0x000b;

#[derive(Debug, Clone)]
pub struct TpmsAttest {
    pub magic: u32,
    pub tag: u16,
    pub qualified_signer: Vec<u8>,
    /// The qualifying data handed to the quote command, i.e. the nonce.
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub quote_info: QuoteInfo,
}

#[derive(Debug, Clone)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: u8,
}

#[derive(Debug, Clone)]
pub struct PcrSelection {
    pub hash_alg: u16,
    pub pcr_indices: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct QuoteInfo {
    pub pcr_selections: Vec<PcrSelection>,
    pub pcr_digest: Vec<u8>,
}

/// Parse a TPMS_ATTEST structure of type quote.
pub fn parse_attest(data: &[u8]) -> Result<TpmsAttest> {
    use nom::bytes::complete::take;
    use nom::number::complete::{be_u16, be_u32, be_u64, be_u8};
    use nom::IResult;

    fn parse_sized_buffer(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
        let (input, size) = be_u16(input)?;
        let (input, data) = take(size)(input)?;
        Ok((input, data.to_vec()))
    }

    fn parse(input: &[u8]) -> IResult<&[u8], TpmsAttest> {
        let (input, magic) = be_u32(input)?;
        let (input, tag) = be_u16(input)?;
        let (input, qualified_signer) = parse_sized_buffer(input)?;
        let (input, extra_data) = parse_sized_buffer(input)?;

        let (input, clock) = be_u64(input)?;
        let (input, reset_count) = be_u32(input)?;
        let (input, restart_count) = be_u32(input)?;
        let (input, safe) = be_u8(input)?;
        let (input, firmware_version) = be_u64(input)?;

        let (input, selection_count) = be_u32(input)?;
        let mut pcr_selections = Vec::new();
        let mut rest = input;
        for _ in 0..selection_count {
            let (input, hash_alg) = be_u16(rest)?;
            let (input, sizeof_select) = be_u8(input)?;
            let (input, bitmap) = take(sizeof_select)(input)?;

            let mut pcr_indices = Vec::new();
            for (byte_idx, &byte) in bitmap.iter().enumerate() {
                for bit in 0..8 {
                    if byte & (1 << bit) != 0 {
                        pcr_indices.push((byte_idx * 8 + bit) as u32);
                    }
                }
            }
            pcr_selections.push(PcrSelection {
                hash_alg,
                pcr_indices,
            });
            rest = input;
        }

        let (input, pcr_digest) = parse_sized_buffer(rest)?;

        Ok((
            input,
            TpmsAttest {
                magic,
                tag,
                qualified_signer,
                extra_data,
                clock_info: ClockInfo {
                    clock,
                    reset_count,
                    restart_count,
                    safe,
                },
                firmware_version,
                quote_info: QuoteInfo {
                    pcr_selections,
                    pcr_digest,
                },
            },
        ))
    }

    let (_, attest) = parse(data).map_err(|e| anyhow!("parse error: {e}"))?;

    if attest.magic != TPM_GENERATED_MAGIC {
        bail!("invalid magic number: 0x{:08x}", attest.magic);
    }
    if attest.tag != TAG_ATTEST_QUOTE {
        bail!("invalid attest type: 0x{:04x}", attest.tag);
    }

    Ok(attest)
}

/// Build a TPMS_ATTEST quote structure over the given PCR selection.
///
/// Used by the software driver; a hardware TPM emits this structure itself.
pub fn build_attest(nonce: &[u8], pcr_indices: &[u32], pcr_digest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + nonce.len() + pcr_digest.len());
    out.extend_from_slice(&TPM_GENERATED_MAGIC.to_be_bytes());
    out.extend_from_slice(&TAG_ATTEST_QUOTE.to_be_bytes());
    // qualifiedSigner (empty TPM2B_NAME)
    out.extend_from_slice(&0u16.to_be_bytes());
    // extraData
    out.extend_from_slice(&(nonce.len() as u16).to_be_bytes());
    out.extend_from_slice(nonce);
    // clockInfo
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(1);
    // firmwareVersion
    out.extend_from_slice(&0u64.to_be_bytes());
    // TPML_PCR_SELECTION with a single SHA-256 bank
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&ALG_SHA256.to_be_bytes());
    let bitmap = pcr_bitmap(pcr_indices);
    out.push(bitmap.len() as u8);
    out.extend_from_slice(&bitmap);
    // pcrDigest
    out.extend_from_slice(&(pcr_digest.len() as u16).to_be_bytes());
    out.extend_from_slice(pcr_digest);
    out
}

/// PCR selection bitmap, at least the standard three bytes.
pub fn pcr_bitmap(pcr_indices: &[u32]) -> Vec<u8> {
    let max = pcr_indices.iter().copied().max().unwrap_or(0) as usize;
    let len = (max / 8 + 1).max(3);
    let mut bitmap = vec![0u8; len];
    for &idx in pcr_indices {
        bitmap[idx as usize / 8] |= 1 << (idx % 8);
    }
    bitmap
}

/// Reproduce a PCR value from its hash chain digest list.
///
/// A single digest is the PCR value itself; multiple digests are folded with
/// the SHA-256 extend operation starting from the all-zero register.
pub fn fold_hash_chain(digests: &[Vec<u8>]) -> Result<Vec<u8>> {
    match digests {
        [] => bail!("empty digest list"),
        [single] => Ok(single.clone()),
        many => {
            let mut pcr = vec![0u8; 32];
            for digest in many {
                let mut hasher = Sha256::new();
                hasher.update(&pcr);
                hasher.update(digest);
                pcr = hasher.finalize().to_vec();
            }
            Ok(pcr)
        }
    }
}

/// Composite digest over the reproduced PCR values, in selection order.
pub fn composite_digest(values: &[Vec<u8>]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for value in values {
        hasher.update(value);
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attest_roundtrip() {
        let nonce = vec![7u8; 32];
        let digest = vec![9u8; 32];
        let blob = build_attest(&nonce, &[0, 2, 10], &digest);
        let attest = parse_attest(&blob).unwrap();

        assert_eq!(attest.extra_data, nonce);
        assert_eq!(attest.quote_info.pcr_digest, digest);
        assert_eq!(attest.quote_info.pcr_selections.len(), 1);
        assert_eq!(
            attest.quote_info.pcr_selections[0].pcr_indices,
            vec![0, 2, 10]
        );
        assert_eq!(attest.quote_info.pcr_selections[0].hash_alg, ALG_SHA256);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = build_attest(&[1u8; 8], &[0], &[0u8; 32]);
        blob[0] = 0;
        assert!(parse_attest(&blob).is_err());
    }

    #[test]
    fn fold_single_digest_is_pcr_value() {
        let value = vec![3u8; 32];
        assert_eq!(fold_hash_chain(&[value.clone()]).unwrap(), value);
    }

    #[test]
    fn fold_extends_from_zero() {
        let d1 = vec![1u8; 32];
        let d2 = vec![2u8; 32];

        let mut hasher = Sha256::new();
        hasher.update([0u8; 32]);
        hasher.update(&d1);
        let step1 = hasher.finalize().to_vec();

        let mut hasher = Sha256::new();
        hasher.update(&step1);
        hasher.update(&d2);
        let expected = hasher.finalize().to_vec();

        assert_eq!(fold_hash_chain(&[d1, d2]).unwrap(), expected);
    }

    #[test]
    fn bitmap_minimum_three_bytes() {
        assert_eq!(pcr_bitmap(&[0]), vec![0x01, 0x00, 0x00]);
        assert_eq!(pcr_bitmap(&[0, 1, 2, 7]), vec![0x87, 0x00, 0x00]);
        assert_eq!(pcr_bitmap(&[10]), vec![0x00, 0x04, 0x00]);
    }
}
