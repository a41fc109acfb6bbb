//! TPM 2.0 constants (TCG Structures specification part 2).

// Structure tags
pub const TPM_ST_NO_SESSIONS: u16 = 0x8001;
pub const TPM_ST_SESSIONS: u16 = 0x8002;
pub const TPM_ST_HASHCHECK: u16 = 0x8024;

// Command codes
pub const TPM_CC_EVICT_CONTROL: u32 = 0x0000_0120;
pub const TPM_CC_CREATE_PRIMARY: u32 = 0x0000_0131;
pub const TPM_CC_ACTIVATE_CREDENTIAL: u32 = 0x0000_0147;
pub const TPM_CC_CERTIFY: u32 = 0x0000_0148;
pub const TPM_CC_CERTIFY_CREATION: u32 = 0x0000_014a;
pub const TPM_CC_NV_READ: u32 = 0x0000_014e;
pub const TPM_CC_POLICY_SECRET: u32 = 0x0000_0151;
pub const TPM_CC_CREATE: u32 = 0x0000_0153;
pub const TPM_CC_LOAD: u32 = 0x0000_0157;
pub const TPM_CC_QUOTE: u32 = 0x0000_0158;
pub const TPM_CC_SIGN: u32 = 0x0000_015d;
pub const TPM_CC_FLUSH_CONTEXT: u32 = 0x0000_0165;
pub const TPM_CC_NV_READ_PUBLIC: u32 = 0x0000_0169;
pub const TPM_CC_READ_PUBLIC: u32 = 0x0000_0173;
pub const TPM_CC_START_AUTH_SESSION: u32 = 0x0000_0176;
pub const TPM_CC_HASH: u32 = 0x0000_017d;
pub const TPM_CC_GET_CAPABILITY: u32 = 0x0000_017a;
pub const TPM_CC_GET_RANDOM: u32 = 0x0000_017b;
pub const TPM_CC_PCR_READ: u32 = 0x0000_017e;

// Capabilities and properties
pub const TPM_CAP_TPM_PROPERTIES: u32 = 0x0000_0006;
pub const TPM_PT_MANUFACTURER: u32 = 0x0000_0105;
pub const TPM_PT_FIRMWARE_VERSION_1: u32 = 0x0000_010b;
pub const TPM_PT_FIRMWARE_VERSION_2: u32 = 0x0000_010c;

// Permanent handles
pub const TPM_RH_OWNER: u32 = 0x4000_0001;
pub const TPM_RH_NULL: u32 = 0x4000_0007;
pub const TPM_RS_PW: u32 = 0x4000_0009;
pub const TPM_RH_ENDORSEMENT: u32 = 0x4000_000b;

// Algorithm identifiers
pub const TPM_ALG_RSA: u16 = 0x0001;
pub const TPM_ALG_AES: u16 = 0x0006;
pub const TPM_ALG_SHA256: u16 = 0x000b;
pub const TPM_ALG_SHA384: u16 = 0x000c;
pub const TPM_ALG_SHA512: u16 = 0x000d;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ALG_RSASSA: u16 = 0x0014;
pub const TPM_ALG_RSAPSS: u16 = 0x0016;
pub const TPM_ALG_ECDSA: u16 = 0x0018;
pub const TPM_ALG_ECC: u16 = 0x0023;
pub const TPM_ALG_CFB: u16 = 0x0043;

// ECC curve identifiers
pub const TPM_ECC_NIST_P256: u16 = 0x0003;
pub const TPM_ECC_NIST_P384: u16 = 0x0004;
pub const TPM_ECC_NIST_P521: u16 = 0x0005;

// Session types
pub const TPM_SE_POLICY: u8 = 0x01;

/// Session attribute: keep the session alive after use.
pub const TPMA_SESSION_CONTINUE: u8 = 0x01;

/// Default persistent handle of the storage root key.
pub const SRK_PERSISTENT_HANDLE: u32 = 0x8100_0001;

/// NV index of the RSA EK certificate (TCG EK Credential Profile).
pub const EK_CERT_NV_INDEX: u32 = 0x01c0_0002;

/// Object attributes (TPMA_OBJECT) for the standard key roles.
pub mod attrs {
    /// Storage root key: restricted decrypt, user auth.
    pub const STORAGE: u32 = 0x0003_0472;
    /// Endorsement key: restricted decrypt, admin with policy.
    pub const ENDORSEMENT: u32 = 0x0003_00b2;
    /// Attestation key: restricted signing.
    pub const ATTESTATION: u32 = 0x0005_0472;
    /// Identity key: unrestricted signing.
    pub const IDENTITY: u32 = 0x0004_0472;
}

/// TCG default EK auth policy digest (PolicySecret with the endorsement
/// hierarchy), from the EK Credential Profile.
pub const EK_AUTH_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xb3, 0xf8, 0x1a, 0x90, 0xcc, 0x8d, 0x46, 0xa5, 0xd7,
    0x24, 0xfd, 0x52, 0xd7, 0x6e, 0x06, 0x52, 0x0b, 0x64, 0xf2, 0xa1, 0xda, 0x1b, 0x33, 0x14,
    0x69, 0xaa,
];
