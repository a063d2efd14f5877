use crate::config::{Number, EPSILON};
use wide::f32x8;

/// Dot product of two equal-length vectors using SIMD lanes of eight.
/// For unit-norm inputs this is their cosine similarity.
pub fn dot_product_simd(a: &[Number], b: &[Number]) -> Number {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len().min(b.len());
    let simd_len = len - (len % 8);

    let mut acc = f32x8::splat(0.0);
    for (ca, cb) in a[..simd_len].chunks_exact(8).zip(b[..simd_len].chunks_exact(8)) {
        let va = f32x8::new([ca[0], ca[1], ca[2], ca[3], ca[4], ca[5], ca[6], ca[7]]);
        let vb = f32x8::new([cb[0], cb[1], cb[2], cb[3], cb[4], cb[5], cb[6], cb[7]]);
        acc += va * vb;
    }

    let mut dot = acc.reduce_add();
    for i in simd_len..len {
        dot += a[i] * b[i];
    }
    dot
}

pub fn l2_norm(vector: &[Number]) -> Number {
    dot_product_simd(vector, vector).sqrt()
}

pub fn normalize_vector(vector: &mut [Number]) {
    let magnitude = l2_norm(vector);
    if magnitude > EPSILON {
        for x in vector.iter_mut() {
            *x /= magnitude;
        }
    }
}

pub fn is_unit_norm(vector: &[Number]) -> bool {
    (l2_norm(vector) - 1.0).abs() < 1e-3
}
