//! Direct TPM 2.0 command layer.
//!
//! Talks to `/dev/tpmrm0` or `/dev/tpm0` without C library dependencies and
//! implements the command subset the attestation stack needs: PCR reads,
//! quotes, key creation and loading, signing, key certification and
//! credential activation.

mod cmds;
mod consts;
mod device;
mod session;
mod types;
mod wire;

pub use cmds::{CreatedKey, TpmChip, TpmInfo};
pub use consts::*;
pub use device::{TpmCommand, TpmDevice, TpmResponse};
pub use types::{templates, IkAlg, SigScheme, TpmPublicKey, TpmtSignature};
pub use wire::{Reader, Writer};
