//! Masks for padded batches. Id 0 is padding everywhere in this crate.
//!
//! Two conventions are in use and the names say which: `*_non_pad_mask` are multiplicative (1.0 for
//! real data, 0.0 for padding) and `*_attention_mask` are additive, holding [`NEG_INF`] where a key
//! must not be attended to.
use super::NEG_INF;
use ndarray::{Array2, Array3};

/// `(batch, time, 1)` multiplicative mask, 1.0 where the id isn't padding.
pub fn ids_non_pad_mask(ids: &Array2<usize>) -> Array3<f32> {
    let (batch, time) = ids.dim();
    Array3::from_shape_fn((batch, time, 1), |(b, t, _)| {
        if ids[[b, t]] != 0 {
            1.0
        } else {
            0.0
        }
    })
}

/// `(batch, time)` mask with 1.0 on padded positions, built from the unpadded lengths.
pub fn lengths_padding_mask(lengths: &[usize], max_len: usize) -> Array2<f32> {
    Array2::from_shape_fn((lengths.len(), max_len), |(b, t)| {
        if t >= lengths[b] {
            1.0
        } else {
            0.0
        }
    })
}

/// `(batch, len_q, len_k)` additive mask knocking out padded keys for every query.
pub fn key_padding_attention_mask(keys: &Array2<usize>, len_q: usize) -> Array3<f32> {
    let (batch, len_k) = keys.dim();
    Array3::from_shape_fn((batch, len_q, len_k), |(b, _, k)| {
        if keys[[b, k]] == 0 {
            NEG_INF
        } else {
            0.0
        }
    })
}

/// `(1, len, len)` additive mask stopping a query attending to later keys.
pub fn causal_attention_mask(len: usize) -> Array3<f32> {
    Array3::from_shape_fn((1, len, len), |(_, q, k)| if k > q { NEG_INF } else { 0.0 })
}

/// 1-based positions for every non padding id, 0 for padding.
pub fn positions(ids: &Array2<usize>) -> Array2<usize> {
    let mut out = Array2::zeros(ids.dim());
    for (mut row, ids) in out.outer_iter_mut().zip(ids.outer_iter()) {
        let mut pos = 0;
        for (p, id) in row.iter_mut().zip(ids.iter()) {
            if *id != 0 {
                pos += 1;
                *p = pos;
            }
        }
    }
    out
}

/// Guided attention weights `1 - exp(-(t/T - n/N)² / 2g²)`, small near the diagonal and close to
/// one far away from it. Multiplying an alignment by this penalises non-diagonal attention.
pub fn guided_attention(n: usize, t: usize, g: f32) -> Array2<f32> {
    Array2::from_shape_fn((n, t), |(n_pos, t_pos)| {
        let d = t_pos as f32 / t as f32 - n_pos as f32 / n as f32;
        1.0 - (-(d * d) / (2.0 * g * g)).exp()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn padding_masks() {
        let ids = arr2(&[[3, 4, 0], [5, 0, 0]]);
        let mask = ids_non_pad_mask(&ids);
        assert_eq!(mask[[0, 1, 0]], 1.0);
        assert_eq!(mask[[0, 2, 0]], 0.0);
        assert_eq!(mask[[1, 1, 0]], 0.0);

        let attn = key_padding_attention_mask(&ids, 2);
        assert_eq!(attn.dim(), (2, 2, 3));
        assert_eq!(attn[[1, 1, 0]], 0.0);
        assert_eq!(attn[[1, 1, 1]], NEG_INF);

        assert_eq!(positions(&ids), arr2(&[[1, 2, 0], [1, 0, 0]]));
        assert_eq!(
            lengths_padding_mask(&[2, 1], 3),
            arr2(&[[0.0, 0.0, 1.0], [0.0, 1.0, 1.0]])
        );
    }

    #[test]
    fn causal_is_upper_triangular() {
        let mask = causal_attention_mask(3);
        assert_eq!(mask[[0, 0, 0]], 0.0);
        assert_eq!(mask[[0, 0, 1]], NEG_INF);
        assert_eq!(mask[[0, 2, 1]], 0.0);
    }

    #[test]
    fn guided_attention_diagonal() {
        let w = guided_attention(4, 4, 0.2);
        assert!(w[[2, 2]].abs() < 1e-6);
        assert!(w[[0, 3]] > 0.9);
    }
}
