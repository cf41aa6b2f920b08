//! Stable digests of call arguments, comparable across runs.

use xxhash_rust::xxh3::Xxh3;

use crate::{descriptor::BoundedPath, MAX_PATH};

/// The arguments of a call that identify it independently of addresses and timing.
///
/// Field names fit file reads best; other functions fill in whatever plays the same role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashContext<'a> {
    /// Name of the file, if the call has one
    pub file_name: &'a [u16],
    /// Item count argument, `0` if the function has none
    pub count: u64,
    /// Position in the stream being read
    pub position: u64,
    /// Number of bytes requested
    pub read_size: u64,
}

/// The 128 bit xxh3 digest of `context`.
///
/// The context is fed in a fixed shape: the bounded filename zero-padded to `MAX_PATH + 1` UTF-16
/// units, then `count`, `position` and `read_size` as little endian `u64`s. Nothing else goes in,
/// and the hasher is unseeded, so the same context hashes the same in every run.
#[must_use]
pub fn arg_digest(context: &HashContext) -> u128 {
    let mut hasher = Xxh3::new();

    let name = BoundedPath::bound(context.file_name);
    for unit in name {
        hasher.update(&unit.to_le_bytes());
    }
    hasher.update(&ZERO_UNITS[..(MAX_PATH + 1 - name.len()) * 2]);

    hasher.update(&context.count.to_le_bytes());
    hasher.update(&context.position.to_le_bytes());
    hasher.update(&context.read_size.to_le_bytes());

    hasher.digest128()
}

/// Hashes `context` into a 32 character lowercase hex string, as stored in `argHash`.
#[must_use]
pub fn hash_args(context: &HashContext) -> String {
    format!("{:032x}", arg_digest(context))
}

static ZERO_UNITS: [u8; (MAX_PATH + 1) * 2] = [0; (MAX_PATH + 1) * 2];
