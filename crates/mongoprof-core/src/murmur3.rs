//! MurmurHash3 x64 128-bit.
//!
//! Bit-for-bit port of Austin Appleby's `MurmurHash3_x64_128` from SMHasher.
//! Shape identifiers derived from it are persisted, so the output must stay
//! stable across releases.

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[inline]
fn mix_k1(k1: u64) -> u64 {
    k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2)
}

#[inline]
fn mix_k2(k2: u64) -> u64 {
    k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1)
}

/// Hashes `data` with `seed`, returning the `(h1, h2)` lanes.
pub fn hash128(data: &[u8], seed: u64) -> (u64, u64) {
    let mut h1 = seed;
    let mut h2 = seed;

    let mut blocks = data.chunks_exact(16);
    for block in blocks.by_ref() {
        let (lo, hi) = block.split_at(8);
        let k1 = u64::from_le_bytes(lo.try_into().unwrap_or_default());
        let k2 = u64::from_le_bytes(hi.try_into().unwrap_or_default());

        h1 ^= mix_k1(k1);
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        h2 ^= mix_k2(k2);
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    // Remaining 0..=15 bytes: 9..15 feed k2, 1..8 feed k1.
    let tail = blocks.remainder();
    if tail.len() > 8 {
        let k2 = tail[8..]
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &b)| acc ^ ((b as u64) << (i * 8)));
        h2 ^= mix_k2(k2);
    }
    if !tail.is_empty() {
        let k1 = tail[..tail.len().min(8)]
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &b)| acc ^ ((b as u64) << (i * 8)));
        h1 ^= mix_k1(k1);
    }

    let len = data.len() as u64;
    h1 ^= len;
    h2 ^= len;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix64(h1);
    h2 = fmix64(h2);

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

/// Length of a fallback shape identifier.
pub const SHAPE_ID_LEN: usize = 8;

/// Shape identifier for operations the server reports without a `queryHash`.
///
/// High lane of `hash128("<op>-<ns>", 0)`, as zero-padded uppercase hex,
/// truncated to [`SHAPE_ID_LEN`] characters.
pub fn fallback_shape_id(op: &str, namespace: &str) -> String {
    let (h1, _) = hash128(format!("{}-{}", op, namespace).as_bytes(), 0);
    let mut id = format!("{:016X}", h1);
    id.truncate(SHAPE_ID_LEN);
    id
}
