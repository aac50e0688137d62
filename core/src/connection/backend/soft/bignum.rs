/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Just enough unsigned big-integer arithmetic for modular exponentiation.
//! Numbers are little-endian `u32` limb vectors.
use std::cmp::Ordering;

fn compare(a: &[u32], b: &[u32]) -> Ordering {
    for (x, y) in a.iter().rev().zip(b.iter().rev()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn sub_assign(a: &mut [u32], b: &[u32]) {
    let mut borrow = 0i64;
    for (x, y) in a.iter_mut().zip(b) {
        let diff = *x as i64 - *y as i64 - borrow;
        borrow = (diff < 0) as i64;
        *x = diff.rem_euclid(1 << 32) as u32;
    }
}

fn add_assign(a: &mut [u32], b: &[u32]) {
    let mut carry = 0u64;
    for (x, y) in a.iter_mut().zip(b) {
        let sum = *x as u64 + *y as u64 + carry;
        *x = sum as u32;
        carry = sum >> 32;
    }
}

fn shl1(a: &mut [u32]) {
    let mut carry = 0u32;
    for x in a.iter_mut() {
        let next = *x >> 31;
        *x = (*x << 1) | carry;
        carry = next;
    }
}

fn reduce_once(a: &mut [u32], n: &[u32]) {
    if compare(a, n) != Ordering::Less {
        sub_assign(a, n);
    }
}

/// Bits of `a`, most significant first, leading zeros skipped.
fn bits_msb_first(a: &[u32]) -> impl Iterator<Item = bool> + '_ {
    let total = a.len() * 32;
    let top = (0..total)
        .rev()
        .find(|i| a[i / 32] >> (i % 32) & 1 == 1)
        .map_or(0, |i| i + 1);
    (0..top).rev().map(move |i| a[i / 32] >> (i % 32) & 1 == 1)
}

fn is_zero(a: &[u32]) -> bool {
    a.iter().all(|x| *x == 0)
}

/// `a mod n`, widened to `n.len() + 1` limbs.
fn reduce(a: &[u32], n: &[u32]) -> Vec<u32> {
    let mut r = vec![0u32; n.len()];
    for bit in bits_msb_first(a) {
        shl1(&mut r);
        r[0] |= bit as u32;
        reduce_once(&mut r, n);
    }
    r
}

/// `a * b mod n` for `a, b < n`, by shift-and-add.
fn mul_mod(a: &[u32], b: &[u32], n: &[u32]) -> Vec<u32> {
    let mut r = vec![0u32; n.len()];
    for bit in bits_msb_first(b) {
        shl1(&mut r);
        reduce_once(&mut r, n);
        if bit {
            add_assign(&mut r, a);
            reduce_once(&mut r, n);
        }
    }
    r
}

/// `base ^ exp mod modulus`. Returns `None` for a zero modulus. The result has
/// as many limbs as `modulus`.
pub fn mod_pow(base: &[u32], exp: &[u32], modulus: &[u32]) -> Option<Vec<u32>> {
    if is_zero(modulus) {
        return None;
    }
    // One spare limb so doubling never overflows.
    let mut n = modulus.to_vec();
    n.push(0);
    let base = reduce(base, &n);
    let mut acc = reduce(&[1], &n);
    for bit in bits_msb_first(exp) {
        acc = mul_mod(&acc, &acc, &n);
        if bit {
            acc = mul_mod(&acc, &base, &n);
        }
    }
    acc.truncate(modulus.len());
    Some(acc)
}

/// Big-endian bytes to little-endian limbs.
pub fn from_be_bytes(bytes: &[u8]) -> Vec<u32> {
    let mut limbs: Vec<u32> = bytes
        .rchunks(4)
        .map(|chunk| chunk.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
        .collect();
    if limbs.is_empty() {
        limbs.push(0);
    }
    limbs
}

/// Little-endian limbs to exactly `len` big-endian bytes.
pub fn to_be_bytes(limbs: &[u32], len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = limbs.iter().rev().flat_map(|l| l.to_be_bytes()).collect();
    if out.len() > len {
        out.drain(..out.len() - len);
    } else {
        let mut padded = vec![0u8; len - out.len()];
        padded.extend_from_slice(&out);
        out = padded;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_numbers() {
        // 4^13 mod 497 = 445
        assert_eq!(mod_pow(&[4], &[13], &[497]), Some(vec![445]));
        assert_eq!(mod_pow(&[5], &[0], &[7]), Some(vec![1]));
        assert_eq!(mod_pow(&[5], &[3], &[1]), Some(vec![0]));
        assert_eq!(mod_pow(&[5], &[3], &[0, 0]), None);
    }

    #[test]
    fn crosses_limb_boundaries() {
        // (2^32 + 3)^2 mod (2^61 - 1)
        let n = [0xffff_ffff, 0x1fff_ffff];
        let r = mod_pow(&[3, 1], &[2], &n).unwrap();
        let expected = ((1u128 << 32) + 3).pow(2) % ((1u128 << 61) - 1);
        assert_eq!(r, vec![expected as u32, (expected >> 32) as u32]);
    }

    #[test]
    fn base_larger_than_modulus_is_reduced() {
        assert_eq!(mod_pow(&[1000], &[1], &[7]), Some(vec![1000 % 7]));
    }

    #[test]
    fn byte_conversions() {
        let limbs = from_be_bytes(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(limbs, vec![0x0203_0405, 0x01]);
        assert_eq!(to_be_bytes(&limbs, 5), vec![1, 2, 3, 4, 5]);
        assert_eq!(to_be_bytes(&limbs, 8), vec![0, 0, 0, 1, 2, 3, 4, 5]);
    }
}
