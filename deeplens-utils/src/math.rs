//! Score-vector math shared by the post-processors.

use std::cmp::Ordering;

/// Numerically stable softmax with temperature factor `fac`.
///
/// The maximum input is subtracted before exponentiating, so the result is
/// invariant under adding a constant to all inputs. `fac` multiplies the
/// shifted logits; `fac = 1.0` is the plain softmax.
pub fn softmax(input: &[f32], fac: f32) -> Vec<f32> {
    if input.is_empty() {
        return Vec::new();
    }

    let max = input.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out: Vec<f32> = input.iter().map(|&x| ((x - max) * fac).exp()).collect();
    let sum: f32 = out.iter().sum();
    if sum > 0.0 {
        for v in &mut out {
            *v /= sum;
        }
    }
    out
}

/// Indices and values of the `k` largest entries, in descending score order.
///
/// Ties are broken by ascending index so the selection is deterministic.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    ranked.sort_unstable_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_matches_reference_values() {
        let out = softmax(&[1.0, 2.0, 3.0], 1.0);
        assert!((out[0] - 0.0900).abs() < 1e-3);
        assert!((out[1] - 0.2447).abs() < 1e-3);
        assert!((out[2] - 0.6652).abs() < 1e-3);
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn softmax_is_shift_invariant() {
        let a = softmax(&[1.0, 2.0, 3.0], 1.0);
        let b = softmax(&[1001.0, 1002.0, 1003.0], 1.0);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn softmax_handles_empty_input() {
        assert!(softmax(&[], 1.0).is_empty());
    }

    #[test]
    fn top_k_breaks_ties_by_ascending_index() {
        let picked = top_k(&[0.1, 0.9, 0.9, 0.2], 2);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].0, 1);
        assert_eq!(picked[1].0, 2);
    }

    #[test]
    fn top_k_truncates_to_available_entries() {
        let picked = top_k(&[0.5, 0.4], 10);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].0, 0);
    }
}
