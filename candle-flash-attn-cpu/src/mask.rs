//! Attention logits: scaling, ALiBi bias, soft-capping and causal/sliding-window masking.
//!
//! Query and key positions are right aligned: when `seqlen_q != seqlen_k` the last query row
//! lines up with the last key row, so query `i` sits at `i + seqlen_k - seqlen_q` in key index
//! space. Both the masks and the ALiBi distances are measured in that space.
use candle::WithDType;
use std::ops::Range;

const DOT_CHUNK: usize = 4;

/// Dot product between a query row, already converted to `f32`, and a key row.
#[inline]
pub(crate) fn vec_dot<T: WithDType>(q: &[f32], k: &[T]) -> f32 {
    let chunks = q.len() / DOT_CHUNK;
    let mut sum = 0f32;
    for i in 0..chunks {
        let i = i * DOT_CHUNK;
        sum += q[i] * k[i].to_f64() as f32
            + q[i + 1] * k[i + 1].to_f64() as f32
            + q[i + 2] * k[i + 2].to_f64() as f32
            + q[i + 3] * k[i + 3].to_f64() as f32;
    }
    for i in (chunks * DOT_CHUNK)..q.len() {
        sum += q[i] * k[i].to_f64() as f32;
    }
    sum
}

/// Geometric ALiBi slopes `2^(-max_bias * (h + 1) / n2)` with `n2` the smallest power of two
/// that is at least `num_heads`.
pub fn alibi_slopes(num_heads: usize, max_bias: f32) -> Vec<f32> {
    let n2 = num_heads.next_power_of_two() as f32;
    (0..num_heads)
        .map(|h| 2f32.powf(-max_bias * (h + 1) as f32 / n2))
        .collect()
}

/// Causal and sliding-window constraints. A key is visible when it satisfies all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreMask {
    pub causal: bool,
    pub window_left: Option<usize>,
    pub window_right: Option<usize>,
}

impl ScoreMask {
    /// Builds a mask from raw window sizes, negative sizes leave that side unbounded.
    pub fn new(causal: bool, window_size_left: i32, window_size_right: i32) -> Self {
        Self {
            causal,
            window_left: usize::try_from(window_size_left).ok(),
            window_right: usize::try_from(window_size_right).ok(),
        }
    }

    /// Position of query row `i` in key index space.
    #[inline]
    pub fn aligned(i: usize, seqlen_q: usize, seqlen_k: usize) -> isize {
        i as isize + seqlen_k as isize - seqlen_q as isize
    }

    /// Whether key `j` is visible from a query at aligned position `i_k`.
    pub fn allows(&self, i_k: isize, j: usize) -> bool {
        let j = j as isize;
        if self.causal && j > i_k {
            return false;
        }
        if matches!(self.window_left, Some(left) if i_k - j > left as isize) {
            return false;
        }
        if matches!(self.window_right, Some(right) if j - i_k > right as isize) {
            return false;
        }
        true
    }

    /// The visible keys for a query at aligned position `i_k`. Every constraint bounds one side
    /// of the key axis, so the visible set is always a single, possibly empty, range.
    pub fn key_range(&self, i_k: isize, seqlen_k: usize) -> Range<usize> {
        let mut lo = 0isize;
        let mut hi = seqlen_k as isize;
        if let Some(left) = self.window_left {
            lo = lo.max(i_k - left as isize);
        }
        if self.causal {
            hi = hi.min(i_k + 1);
        }
        if let Some(right) = self.window_right {
            hi = hi.min(i_k + right as isize + 1);
        }
        if hi <= lo {
            return 0..0;
        }
        lo as usize..hi as usize
    }
}

/// Turns a raw `q.k` dot product into the logit fed to the softmax.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreTransform {
    softmax_scale: f32,
    alibi_slope: Option<f32>,
    softcap: Option<f32>,
}

impl ScoreTransform {
    /// `softcap <= 0` disables soft-capping.
    pub fn new(softmax_scale: f32, alibi_slope: Option<f32>, softcap: f32) -> Self {
        Self {
            softmax_scale,
            alibi_slope,
            softcap: (softcap > 0.0).then_some(softcap),
        }
    }

    #[inline]
    pub fn apply(&self, dot: f32, i_k: isize, j: usize) -> f32 {
        let mut score = dot * self.softmax_scale;
        if let Some(slope) = self.alibi_slope {
            score -= slope * (i_k - j as isize).unsigned_abs() as f32;
        }
        if let Some(softcap) = self.softcap {
            score = softcap * (score / softcap).tanh();
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_range_matches_allows() {
        let masks = [
            ScoreMask::new(false, -1, -1),
            ScoreMask::new(true, -1, -1),
            ScoreMask::new(false, 1, 0),
            ScoreMask::new(false, 2, 3),
            ScoreMask::new(true, 3, 5),
            ScoreMask::new(true, 0, -1),
        ];
        for mask in masks {
            for (seqlen_q, seqlen_k) in [(5, 5), (3, 7), (7, 3), (1, 9)] {
                for i in 0..seqlen_q {
                    let i_k = ScoreMask::aligned(i, seqlen_q, seqlen_k);
                    let expected: Vec<usize> =
                        (0..seqlen_k).filter(|&j| mask.allows(i_k, j)).collect();
                    let range: Vec<usize> = mask.key_range(i_k, seqlen_k).collect();
                    assert_eq!(range, expected, "{mask:?} q={seqlen_q} k={seqlen_k} i={i}");
                }
            }
        }
    }

    #[test]
    fn causal_is_right_aligned() {
        let mask = ScoreMask::new(true, -1, -1);
        // Decoding one token against a cache of 6 keys sees all of them.
        let i_k = ScoreMask::aligned(0, 1, 6);
        assert_eq!(mask.key_range(i_k, 6), 0..6);
        // More queries than keys: the first rows have nothing to attend to.
        assert!(mask.key_range(ScoreMask::aligned(0, 4, 2), 2).is_empty());
        assert!(mask.key_range(ScoreMask::aligned(1, 4, 2), 2).is_empty());
        assert_eq!(mask.key_range(ScoreMask::aligned(2, 4, 2), 2), 0..1);
    }

    #[test]
    fn sliding_window() {
        let mask = ScoreMask::new(false, 1, 0);
        assert_eq!(mask.key_range(0, 5), 0..1);
        assert_eq!(mask.key_range(3, 5), 2..4);
        let bidirectional = ScoreMask::new(false, 1, 2);
        assert_eq!(bidirectional.key_range(3, 5), 2..5);
        assert_eq!(bidirectional.key_range(0, 5), 0..3);
    }

    #[test]
    fn transform() {
        let plain = ScoreTransform::new(0.5, None, 0.0);
        assert_eq!(plain.apply(4.0, 3, 0), 2.0);

        let alibi = ScoreTransform::new(1.0, Some(0.25), 0.0);
        assert_eq!(alibi.apply(1.0, 3, 3), 1.0);
        assert_eq!(alibi.apply(1.0, 3, 1), 0.5);
        assert_eq!(alibi.apply(1.0, 3, 5), 0.5);

        let zero_slope = ScoreTransform::new(1.0, Some(0.0), 0.0);
        assert_eq!(zero_slope.apply(1.5, 7, 0), 1.5);

        let capped = ScoreTransform::new(1.0, None, 5.0);
        assert!((capped.apply(1.0, 0, 0) - 5.0 * 0.2f32.tanh()).abs() < 1e-6);
        assert!(capped.apply(1e6, 0, 0) <= 5.0);
        assert!(capped.apply(-1e6, 0, 0) >= -5.0);

        // The bias is added before the cap.
        let both = ScoreTransform::new(1.0, Some(1.0), 2.0);
        let expected = 2.0 * ((3.0f32 - 2.0) / 2.0).tanh();
        assert!((both.apply(3.0, 2, 0) - expected).abs() < 1e-6);
    }

    #[test]
    fn slopes() {
        let s = alibi_slopes(8, 8.0);
        assert_eq!(s.len(), 8);
        assert!((s[0] - 0.5).abs() < 1e-6);
        assert!((s[7] - 2f32.powi(-8)).abs() < 1e-9);
        // Non power of two head counts use the next power of two as denominator.
        let s = alibi_slopes(6, 8.0);
        assert!((s[0] - 2f32.powf(-1.0)).abs() < 1e-6);
    }

    #[test]
    fn dot() {
        let q = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let k = [1.0f32, 1.0, 1.0, 1.0, 1.0, -1.0];
        assert_eq!(vec_dot(&q, &k), 9.0);
        let k16: Vec<half::f16> = k.iter().map(|&x| half::f16::from_f32(x)).collect();
        assert_eq!(vec_dot(&q, &k16), 9.0);
    }
}
