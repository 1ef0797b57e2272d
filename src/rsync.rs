use anyhow::{Context, Result};
use fast_rsync::{apply, diff, Signature, SignatureOptions};

/// Default block size for rsync signatures; small enough to give good delta locality
/// on typical datasite files without an excessive signature size.
const SIGNATURE_OPTIONS: SignatureOptions = SignatureOptions {
    block_size: 4096,
    crypto_hash_size: 8,
};

/// Computes an rsync block-level signature of `data`, serialized for the wire.
pub fn calculate_signature(data: &[u8]) -> Vec<u8> {
    Signature::calculate(data, SIGNATURE_OPTIONS).into_serialized()
}

/// Computes a delta that transforms the bytes signed by `signature` into `new_data`.
pub fn compute_diff(signature: &[u8], new_data: &[u8]) -> Result<Vec<u8>> {
    let sig = Signature::deserialize(signature.to_vec()).context("parse rsync signature")?;
    let indexed = sig.index();
    let mut out = Vec::new();
    diff(&indexed, new_data, &mut out).context("compute rsync diff")?;
    Ok(out)
}

/// Applies `delta` (as produced by [`compute_diff`]) to `base` to recover the target
/// bytes.
pub fn apply_diff(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    apply(base, delta, &mut out).context("apply rsync diff")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_then_apply_recovers_target_bytes() {
        let old = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let mut new = old.clone();
        new.splice(100..110, b"CHANGED!!!".iter().copied());

        let signature = calculate_signature(&old);
        let delta = compute_diff(&signature, &new).unwrap();
        let applied = apply_diff(&old, &delta).unwrap();

        assert_eq!(applied, new);
    }
}
