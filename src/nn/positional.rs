//! Sinusoidal position tables. Position 0 is reserved for padding in both tables so padded
//! frames don't pick up a positional signal.
use ndarray::Array2;

/// Transformer style table, `sin` on even channels and `cos` on odd channels with the angle
/// `pos / 10000^(2 * (i / 2) / d_hid)`.
pub fn sinusoid_encoding_table(
    n_position: usize,
    d_hid: usize,
    padding_idx: Option<usize>,
) -> Array2<f32> {
    let mut table = Array2::from_shape_fn((n_position, d_hid), |(pos, i)| {
        let angle = pos as f64 / 10000f64.powf(2.0 * (i / 2) as f64 / d_hid as f64);
        if i % 2 == 0 {
            angle.sin() as f32
        } else {
            angle.cos() as f32
        }
    });
    if let Some(idx) = padding_idx.filter(|idx| *idx < n_position) {
        table.row_mut(idx).fill(0.0);
    }
    table
}

/// Variant used by Transformer-TTS, the angle uses the raw channel index and row 0 is all zeros.
pub fn positional_table(d_pos_vec: usize, n_position: usize) -> Array2<f32> {
    Array2::from_shape_fn((n_position, d_pos_vec), |(pos, i)| {
        if pos == 0 {
            return 0.0;
        }
        let angle = pos as f64 / 10000f64.powf(2.0 * i as f64 / d_pos_vec as f64);
        if i % 2 == 0 {
            angle.sin() as f32
        } else {
            angle.cos() as f32
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_row_is_zero() {
        let table = sinusoid_encoding_table(10, 8, Some(0));
        assert!(table.row(0).iter().all(|v| *v == 0.0));
        assert!((table[[1, 0]] - 1f32.sin()).abs() < 1e-6);
        assert!((table[[1, 1]] - 1f32.cos()).abs() < 1e-6);

        let table = positional_table(8, 10);
        assert!(table.row(0).iter().all(|v| *v == 0.0));
        assert!(table.row(3).iter().any(|v| *v != 0.0));
    }
}
