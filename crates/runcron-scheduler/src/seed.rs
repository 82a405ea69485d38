use rand::{rngs::StdRng, SeedableRng};

use crate::error::{Result, ScheduleError};

const FNV1A32_OFFSET: u32 = 2_166_136_261;
const FNV1A32_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV1A32_OFFSET, |h, &b| {
        (h ^ u32::from(b)).wrapping_mul(FNV1A32_PRIME)
    })
}

/// Deterministic generator for `H` fields. Same tag, same sequence.
pub fn rng_for_tag(tag: &str) -> StdRng {
    StdRng::seed_from_u64(u64::from(fnv1a(tag.as_bytes())))
}

/// The host name, used as the tag when none is configured.
pub fn default_tag() -> Result<String> {
    let name = nix::unistd::gethostname().map_err(|e| ScheduleError::Hostname(e.to_string()))?;
    Ok(name.to_string_lossy().into_owned())
}
