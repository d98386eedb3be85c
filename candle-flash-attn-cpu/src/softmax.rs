//! Online softmax over key blocks.
//!
//! The running state `(max, sum, acc)` for one query row is updated block by block with the
//! usual rescaling law:
//!
//! ```text
//! m_new   = max(m_old, max(scores))
//! l_new   = l_old * exp(m_old - m_new) + sum(exp(scores - m_new))
//! acc_new = acc_old * exp(m_old - m_new) + sum(exp(scores - m_new) * v)
//! ```
//!
//! The result does not depend on how the keys are grouped into blocks nor on the order in
//! which the blocks are visited, which also makes partial states computed on disjoint key
//! ranges mergeable.
use candle::WithDType;

#[derive(Debug, Clone, PartialEq)]
pub struct OnlineSoftmax {
    max: f32,
    sum: f32,
    acc: Vec<f32>,
}

impl OnlineSoftmax {
    pub fn new(head_dim: usize) -> Self {
        Self {
            max: f32::NEG_INFINITY,
            sum: 0.0,
            acc: vec![0.0; head_dim],
        }
    }

    pub fn reset(&mut self) {
        self.max = f32::NEG_INFINITY;
        self.sum = 0.0;
        self.acc.fill(0.0);
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn sum(&self) -> f32 {
        self.sum
    }

    pub fn acc(&self) -> &[f32] {
        &self.acc
    }

    fn rescale(&mut self, factor: f32) {
        if factor != 1.0 {
            self.sum *= factor;
            for a in self.acc.iter_mut() {
                *a *= factor;
            }
        }
    }

    /// Folds a block of scores and the matching value rows into the state. Masked keys carry a
    /// `-inf` score and are skipped.
    pub fn update_block<'v, T, I>(&mut self, scores: &[f32], values: I)
    where
        T: WithDType,
        I: IntoIterator<Item = &'v [T]>,
    {
        let block_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if block_max == f32::NEG_INFINITY {
            return;
        }
        let new_max = self.max.max(block_max);
        self.rescale((self.max - new_max).exp());
        self.max = new_max;

        for (&score, v_row) in scores.iter().zip(values) {
            if score == f32::NEG_INFINITY {
                continue;
            }
            let p = (score - new_max).exp();
            self.sum += p;
            for (a, &v) in self.acc.iter_mut().zip(v_row) {
                *a += p * v.to_f64() as f32;
            }
        }
    }

    /// Combines with a state accumulated over a disjoint set of keys.
    pub fn merge(&mut self, other: OnlineSoftmax) {
        if other.max == f32::NEG_INFINITY {
            return;
        }
        if self.max == f32::NEG_INFINITY {
            *self = other;
            return;
        }
        let new_max = self.max.max(other.max);
        let other_factor = (other.max - new_max).exp();
        self.rescale((self.max - new_max).exp());
        self.max = new_max;
        self.sum += other.sum * other_factor;
        for (a, b) in self.acc.iter_mut().zip(other.acc) {
            *a += b * other_factor;
        }
    }

    /// Writes the normalized output row to `out` and returns the log-sum-exp. A row that saw
    /// no key produces zeros and a `-inf` lse.
    pub fn finalize_into(&self, out: &mut [f32]) -> f32 {
        if self.sum > 0.0 {
            let inv_sum = 1.0 / self.sum;
            for (o, &a) in out.iter_mut().zip(self.acc.iter()) {
                *o = a * inv_sum;
            }
            self.max + self.sum.ln()
        } else {
            out.fill(0.0);
            f32::NEG_INFINITY
        }
    }
}
