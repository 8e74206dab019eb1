//! Scalar losses reported by the training and evaluation harness.
use ndarray::{Array, Array2, Array3, Dimension, Zip};

pub fn l1_loss<D: Dimension>(prediction: &Array<f32, D>, target: &Array<f32, D>) -> f32 {
    let n = prediction.len().max(1) as f32;
    Zip::from(prediction)
        .and(target)
        .fold(0.0, |acc, p, t| acc + (p - t).abs())
        / n
}

pub fn mse_loss<D: Dimension>(prediction: &Array<f32, D>, target: &Array<f32, D>) -> f32 {
    let n = prediction.len().max(1) as f32;
    Zip::from(prediction)
        .and(target)
        .fold(0.0, |acc, p, t| acc + (p - t).powi(2))
        / n
}

/// Mean squared error between predicted and target durations in frames.
pub fn duration_loss(prediction: &Array2<f32>, target: &Array2<usize>) -> f32 {
    mse_loss(prediction, &target.mapv(|d| d as f32))
}

/// Binary cross entropy summed over every element, with positive labels weighted by
/// `position_weight`. Used for stop token prediction where positives are rare.
pub fn weighted_binary_cross_entropy(
    input: &Array2<f32>,
    label: &Array2<f32>,
    position_weight: f32,
) -> f32 {
    const EPSILON: f32 = 1e-30;
    Zip::from(input).and(label).fold(0.0, |acc, x, y| {
        let loss = -y * (x + EPSILON).ln() - (1.0 - y) * (1.0 - x + EPSILON).ln();
        acc + loss * (y * (position_weight - 1.0) + 1.0)
    })
}

/// Mean of the alignment weighted by a guided attention matrix of matching shape.
pub fn guided_attention_loss(alignment: &Array3<f32>, weights: &Array2<f32>) -> f32 {
    let n = alignment.len().max(1) as f32;
    let mut total = 0.0;
    for a in alignment.outer_iter() {
        total += (&a * weights).sum();
    }
    total / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn simple_losses() {
        let a = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let b = arr2(&[[1.0, 0.0], [3.0, 6.0]]);
        assert!((l1_loss(&a, &b) - 1.0).abs() < 1e-6);
        assert!((mse_loss(&a, &b) - 2.0).abs() < 1e-6);
        assert!((duration_loss(&arr2(&[[2.0, 3.0]]), &arr2(&[[2, 1]])) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn bce_perfect_prediction() {
        let x = arr2(&[[1.0, 0.0]]);
        assert!(weighted_binary_cross_entropy(&x, &x, 5.0).abs() < 1e-5);
        let wrong = arr2(&[[0.5, 0.5]]);
        assert!(weighted_binary_cross_entropy(&wrong, &x, 5.0) > 0.0);
    }
}
