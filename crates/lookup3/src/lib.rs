//! Integer hashes from Bob Jenkins' lookup3.
//!
//! Original algorithm by Bob Jenkins (public domain). Only the fixed-width
//! integer variants are provided; they are used to derive decorrelated
//! per-pixel random seeds and cheap procedural noise.

const INIT: u32 = 0xdead_beef;

#[inline(always)]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

#[inline(always)]
fn finalize(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

#[inline(always)]
fn seed(words: u32) -> u32 {
    INIT.wrapping_add(words << 2).wrapping_add(13)
}

/// Hash a single 32-bit integer.
#[inline]
pub fn hash_uint(kx: u32) -> u32 {
    let (mut a, mut b, mut c) = (seed(1), seed(1), seed(1));
    a = a.wrapping_add(kx);
    finalize(&mut a, &mut b, &mut c);
    c
}

/// Hash two 32-bit integers, typically pixel coordinates.
#[inline]
pub fn hash_uint2(kx: u32, ky: u32) -> u32 {
    let (mut a, mut b, mut c) = (seed(2), seed(2), seed(2));
    a = a.wrapping_add(kx);
    b = b.wrapping_add(ky);
    finalize(&mut a, &mut b, &mut c);
    c
}

/// Hash three 32-bit integers.
#[inline]
pub fn hash_uint3(kx: u32, ky: u32, kz: u32) -> u32 {
    let (mut a, mut b, mut c) = (seed(3), seed(3), seed(3));
    a = a.wrapping_add(kx);
    b = b.wrapping_add(ky);
    c = c.wrapping_add(kz);
    finalize(&mut a, &mut b, &mut c);
    c
}

/// Hash four 32-bit integers.
#[inline]
pub fn hash_uint4(kx: u32, ky: u32, kz: u32, kw: u32) -> u32 {
    let (mut a, mut b, mut c) = (seed(4), seed(4), seed(4));
    a = a.wrapping_add(kx);
    b = b.wrapping_add(ky);
    c = c.wrapping_add(kz);
    mix(&mut a, &mut b, &mut c);
    a = a.wrapping_add(kw);
    finalize(&mut a, &mut b, &mut c);
    c
}

/// Map a hash to `[0, 1]`.
#[inline]
pub fn hash_to_float(h: u32) -> f32 {
    h as f32 / u32::MAX as f32
}

/// Hash three integers straight to a float in `[0, 1]`.
#[inline]
pub fn hash_uint3_to_float(kx: u32, ky: u32, kz: u32) -> f32 {
    hash_to_float(hash_uint3(kx, ky, kz))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(hash_uint(42), hash_uint(42));
        assert_eq!(hash_uint2(3, 7), hash_uint2(3, 7));
    }

    #[test]
    fn test_argument_order_matters() {
        assert_ne!(hash_uint2(1, 2), hash_uint2(2, 1));
        assert_ne!(hash_uint3(1, 2, 3), hash_uint3(3, 2, 1));
    }

    #[test]
    fn test_arity_differs() {
        // Different init seeds per arity keep the variants decorrelated.
        assert_ne!(hash_uint(0), hash_uint2(0, 0));
        assert_ne!(hash_uint2(0, 0), hash_uint3(0, 0, 0));
        assert_ne!(hash_uint3(0, 0, 0), hash_uint4(0, 0, 0, 0));
    }

    #[test]
    fn test_neighbours_spread() {
        let mut seen = std::collections::HashSet::new();
        for y in 0..64 {
            for x in 0..64 {
                seen.insert(hash_uint2(x, y));
            }
        }
        assert_eq!(seen.len(), 64 * 64);
    }

    #[test]
    fn test_float_range() {
        for i in 0..1000 {
            let f = hash_uint3_to_float(i, i * 7, 11);
            assert!((0.0..=1.0).contains(&f));
        }
    }
}
