//! Keyed 16-byte hash used to derive multicast group addresses from channel
//! names (§4.1). The reference implementation treats its hash primitive as
//! an opaque external collaborator ("a generic keyed hash producing 16-byte
//! digests") and is out of scope here too; this crate grounds that
//! collaborator in `blake2`'s keyed BLAKE2s, truncated/instantiated at a
//! 16-byte output width via its `Mac` interface.

use blake2::digest::consts::U16;
use blake2::digest::Mac;
use blake2::Blake2sMac;

use crate::error::{Error, Result};

pub const DIGEST_LEN: usize = 16;

type Blake2sMac128 = Blake2sMac<U16>;

/// Computes the 16-byte keyed hash of `data` under `key` (possibly empty).
///
/// Mirrors `librecast.c`'s `hash_init`/`hash_update`/`hash_final` sequence:
/// one key, one or more update calls' worth of input, one digest.
pub fn keyed_hash16(key: &[u8], data: &[u8]) -> Result<[u8; DIGEST_LEN]> {
    let mut mac = Blake2sMac128::new_from_slice(key).map_err(|_| Error::InvalidParams)?;
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&out);
    Ok(digest)
}

/// Convenience wrapper for the unkeyed case used by address derivation.
pub fn hash16(data: &[u8]) -> Result<[u8; DIGEST_LEN]> {
    keyed_hash16(&[], data)
}
