//! Shapes, strides and sequence addressing for the attention kernel.
//!
//! [`MhaParams`] carries the same information as the `run_mha` entry point of the CUDA
//! flash-attention kernels: per-tensor batch/row/head strides in element units, head counts,
//! head dimension, sequence lengths and their rounded counterparts, plus the masking and
//! scaling flags. The feature dimension is always assumed to be contiguous.
use crate::error::{FlashError, Result, MAX_HEAD_DIM};
use crate::kernel::MhaBuffers;

pub fn round_multiple(x: usize, m: usize) -> usize {
    (x + m - 1) / m * m
}

/// Strides of a `(batch, seqlen, heads, head_dim)` view, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorStrides {
    pub batch: usize,
    pub row: usize,
    pub head: usize,
}

impl TensorStrides {
    pub fn new(batch: usize, row: usize, head: usize) -> Self {
        Self { batch, row, head }
    }

    /// Strides of a contiguous `(batch, seqlen, num_heads, head_dim)` buffer.
    pub fn contiguous(seqlen: usize, num_heads: usize, head_dim: usize) -> Self {
        Self {
            batch: seqlen * num_heads * head_dim,
            row: num_heads * head_dim,
            head: head_dim,
        }
    }

    /// Strides of a packed `(total, num_heads, head_dim)` buffer. There is no batch dimension,
    /// rows are located through cumulative sequence lengths.
    pub fn packed(num_heads: usize, head_dim: usize) -> Self {
        Self {
            batch: 0,
            row: num_heads * head_dim,
            head: head_dim,
        }
    }
}

/// How the rows of a tensor are split between batch entries.
#[derive(Debug, Clone, Copy)]
pub enum SeqLayout<'a> {
    /// Every batch entry has `seqlen` rows, located with the batch stride.
    Dense { seqlen: usize },
    /// Batch entry `b` owns rows `cu_seqlens[b]..cu_seqlens[b + 1]`, the batch stride is unused.
    Jagged { cu_seqlens: &'a [u32] },
}

impl<'a> SeqLayout<'a> {
    pub fn new(seqlen: usize, cu_seqlens: Option<&'a [u32]>) -> Self {
        match cu_seqlens {
            None => Self::Dense { seqlen },
            Some(cu_seqlens) => Self::Jagged { cu_seqlens },
        }
    }

    /// Number of rows of batch entry `b`.
    #[inline]
    pub fn len(&self, b: usize) -> usize {
        match self {
            Self::Dense { seqlen } => *seqlen,
            Self::Jagged { cu_seqlens } => (cu_seqlens[b + 1] - cu_seqlens[b]) as usize,
        }
    }

    /// Index of the first row of batch entry `b` among all the rows of the batch.
    #[inline]
    pub fn start(&self, b: usize) -> usize {
        match self {
            Self::Dense { seqlen } => b * seqlen,
            Self::Jagged { cu_seqlens } => cu_seqlens[b] as usize,
        }
    }

    /// Total number of rows over `batch` entries.
    pub fn total(&self, batch: usize) -> usize {
        match self {
            Self::Dense { seqlen } => batch * seqlen,
            Self::Jagged { cu_seqlens } => cu_seqlens[batch] as usize,
        }
    }

    /// Batch entry and position within it of row `row` among all the rows of the batch, the
    /// inverse of `start(b) + pos`. Empty batch entries are skipped.
    #[inline]
    pub fn locate(&self, row: usize) -> (usize, usize) {
        match self {
            Self::Dense { seqlen } => (row / seqlen, row % seqlen),
            Self::Jagged { cu_seqlens } => {
                let b = cu_seqlens.partition_point(|&c| c as usize <= row) - 1;
                (b, row - cu_seqlens[b] as usize)
            }
        }
    }

    /// Element offset of row `pos` of batch entry `b`, head `head`.
    #[inline]
    pub fn offset(&self, strides: &TensorStrides, b: usize, pos: usize, head: usize) -> usize {
        match self {
            Self::Dense { .. } => b * strides.batch + pos * strides.row + head * strides.head,
            Self::Jagged { cu_seqlens } => {
                (cu_seqlens[b] as usize + pos) * strides.row + head * strides.head
            }
        }
    }

    /// Same as `offset` but `None` instead of overflowing.
    fn checked_offset(
        &self,
        strides: &TensorStrides,
        b: usize,
        pos: usize,
        head: usize,
    ) -> Option<usize> {
        let (batch_off, row) = match self {
            Self::Dense { .. } => (b.checked_mul(strides.batch)?, pos),
            Self::Jagged { cu_seqlens } => (0, (cu_seqlens[b] as usize).checked_add(pos)?),
        };
        batch_off
            .checked_add(row.checked_mul(strides.row)?)?
            .checked_add(head.checked_mul(strides.head)?)
    }

    /// Number of elements a buffer needs so that every `(b, pos, head, feature)` is in bounds,
    /// `None` when that number does not fit in a `usize`. Every offset computed by the kernel
    /// is below this bound.
    fn required_len(
        &self,
        strides: &TensorStrides,
        batch: usize,
        num_heads: usize,
        head_dim: usize,
    ) -> Option<usize> {
        let mut required = 0;
        for b in (0..batch).filter(|&b| self.len(b) > 0) {
            let last = self.checked_offset(strides, b, self.len(b) - 1, num_heads - 1)?;
            required = required.max(last.checked_add(head_dim)?);
        }
        Some(required)
    }

    pub(crate) fn validate(
        &self,
        arg: &'static str,
        batch: usize,
        max_seqlen: usize,
    ) -> Result<()> {
        let Self::Jagged { cu_seqlens } = self else {
            return Ok(());
        };
        if cu_seqlens.len() != batch + 1 {
            return Err(FlashError::CuSeqlens {
                arg,
                reason: format!("expected {} elements, got {}", batch + 1, cu_seqlens.len()),
            });
        }
        if cu_seqlens[0] != 0 {
            return Err(FlashError::CuSeqlens {
                arg,
                reason: format!("first offset must be 0, got {}", cu_seqlens[0]),
            });
        }
        for (b, w) in cu_seqlens.windows(2).enumerate() {
            if w[1] < w[0] {
                return Err(FlashError::CuSeqlens {
                    arg,
                    reason: format!("offsets decrease at batch {b}: {} > {}", w[0], w[1]),
                });
            }
            let len = (w[1] - w[0]) as usize;
            if len > max_seqlen {
                return Err(FlashError::SeqlenTooLong {
                    arg,
                    batch: b,
                    len,
                    max: max_seqlen,
                });
            }
        }
        Ok(())
    }
}

/// Parameters of one multi-head attention forward call.
///
/// In varlen mode `seqlen_q`/`seqlen_k` are the maximum sequence lengths over the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MhaParams {
    pub q: TensorStrides,
    pub k: TensorStrides,
    pub v: TensorStrides,
    pub o: TensorStrides,
    /// Distance between the slopes of two batch entries, `0` when slopes are shared.
    pub alibi_slopes_batch_stride: usize,

    pub b: usize,
    pub h: usize,
    pub h_k: usize,
    pub d: usize,
    pub d_rounded: usize,
    pub softmax_scale: f32,

    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub seqlen_q_rounded: usize,
    pub seqlen_k_rounded: usize,

    pub is_causal: bool,
    pub unpadded_lse: bool,

    /// Negative values leave that side of the window unbounded.
    pub window_size_left: i32,
    pub window_size_right: i32,

    /// `0.0` disables soft-capping.
    pub softcap: f32,
}

impl MhaParams {
    /// Parameters for contiguous `(b, seqlen, heads, d)` tensors, `num_heads_k` k/v heads.
    pub fn contiguous(
        b: usize,
        num_heads: usize,
        num_heads_k: usize,
        seqlen_q: usize,
        seqlen_k: usize,
        head_dim: usize,
        causal: bool,
    ) -> Self {
        let q = TensorStrides::contiguous(seqlen_q, num_heads, head_dim);
        let kv = TensorStrides::contiguous(seqlen_k, num_heads_k, head_dim);
        Self {
            q,
            k: kv,
            v: kv,
            o: q,
            alibi_slopes_batch_stride: 0,
            b,
            h: num_heads,
            h_k: num_heads_k,
            d: head_dim,
            d_rounded: round_multiple(head_dim, 8),
            softmax_scale: 1.0 / (head_dim as f32).sqrt(),
            seqlen_q,
            seqlen_k,
            seqlen_q_rounded: round_multiple(seqlen_q, 128),
            seqlen_k_rounded: round_multiple(seqlen_k, 128),
            is_causal: causal,
            unpadded_lse: false,
            window_size_left: -1,
            window_size_right: -1,
            softcap: 0.0,
        }
    }

    /// Parameters for packed `(total, heads, d)` tensors addressed through cumulative sequence
    /// lengths. The lse is unpadded, with shape `(num_heads, total_q)`.
    pub fn varlen(
        b: usize,
        num_heads: usize,
        num_heads_k: usize,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        head_dim: usize,
        causal: bool,
    ) -> Self {
        let q = TensorStrides::packed(num_heads, head_dim);
        let kv = TensorStrides::packed(num_heads_k, head_dim);
        Self {
            q,
            k: kv,
            v: kv,
            o: q,
            unpadded_lse: true,
            ..Self::contiguous(
                b,
                num_heads,
                num_heads_k,
                max_seqlen_q,
                max_seqlen_k,
                head_dim,
                causal,
            )
        }
    }

    pub fn with_window(mut self, left: i32, right: i32) -> Self {
        self.window_size_left = left;
        self.window_size_right = right;
        self
    }

    pub fn with_softcap(mut self, softcap: f32) -> Self {
        self.softcap = softcap;
        self
    }

    pub fn with_softmax_scale(mut self, softmax_scale: f32) -> Self {
        self.softmax_scale = softmax_scale;
        self
    }

    /// The key/value head used by query head `hq`.
    #[inline]
    pub fn kv_head(&self, hq: usize) -> usize {
        hq / (self.h / self.h_k)
    }

    /// Number of lse values written for a batch with `total_q` query rows, `None` on overflow.
    pub fn lse_len(&self, total_q: usize) -> Option<usize> {
        if self.unpadded_lse {
            self.h.checked_mul(total_q)
        } else {
            self.b.checked_mul(self.h)?.checked_mul(self.seqlen_q)
        }
    }

    /// Checks the shapes and every buffer extent. Nothing is written to the output buffers
    /// when this fails.
    pub fn validate<T>(&self, bufs: &MhaBuffers<'_, T>) -> Result<()> {
        for (arg, value) in [("b", self.b), ("h", self.h), ("h_k", self.h_k), ("d", self.d)] {
            if value == 0 {
                return Err(FlashError::ZeroExtent { arg });
            }
        }
        if self.h % self.h_k != 0 {
            return Err(FlashError::HeadCount {
                num_heads: self.h,
                num_heads_k: self.h_k,
            });
        }
        if self.d > MAX_HEAD_DIM {
            return Err(FlashError::UnsupportedHeadDim(self.d));
        }
        for (arg, value, rounded) in [
            ("d", self.d, self.d_rounded),
            ("seqlen_q", self.seqlen_q, self.seqlen_q_rounded),
            ("seqlen_k", self.seqlen_k, self.seqlen_k_rounded),
        ] {
            if rounded < value {
                return Err(FlashError::RoundedExtent {
                    arg,
                    value,
                    rounded,
                });
            }
        }

        let q_layout = SeqLayout::new(self.seqlen_q, bufs.cu_seqlens_q);
        let k_layout = SeqLayout::new(self.seqlen_k, bufs.cu_seqlens_k);
        q_layout.validate("cu_seqlens_q", self.b, self.seqlen_q)?;
        k_layout.validate("cu_seqlens_k", self.b, self.seqlen_k)?;

        let (b, d) = (self.b, self.d);
        for (arg, layout, strides, heads, len) in [
            ("q", &q_layout, &self.q, self.h, bufs.q.len()),
            ("k", &k_layout, &self.k, self.h_k, bufs.k.len()),
            ("v", &k_layout, &self.v, self.h_k, bufs.v.len()),
            ("o", &q_layout, &self.o, self.h, bufs.o.len()),
        ] {
            let required = layout
                .required_len(strides, b, heads, d)
                .ok_or(FlashError::ExtentOverflow { arg })?;
            if len < required {
                return Err(FlashError::BufferTooSmall { arg, required, len });
            }
        }
        if let Some(lse) = bufs.softmax_lse.as_deref() {
            let required = self
                .lse_len(q_layout.total(b))
                .ok_or(FlashError::ExtentOverflow { arg: "softmax_lse" })?;
            if lse.len() < required {
                return Err(FlashError::BufferTooSmall {
                    arg: "softmax_lse",
                    required,
                    len: lse.len(),
                });
            }
        }
        if let Some(slopes) = bufs.alibi_slopes {
            let required = (b - 1)
                .checked_mul(self.alibi_slopes_batch_stride)
                .and_then(|off| off.checked_add(self.h))
                .ok_or(FlashError::ExtentOverflow {
                    arg: "alibi_slopes",
                })?;
            if slopes.len() < required {
                return Err(FlashError::BufferTooSmall {
                    arg: "alibi_slopes",
                    required,
                    len: slopes.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_multiple(1, 8), 8);
        assert_eq!(round_multiple(64, 8), 64);
        assert_eq!(round_multiple(65, 128), 128);
        let p = MhaParams::contiguous(2, 4, 2, 3, 130, 60, false);
        assert_eq!(p.d_rounded, 64);
        assert_eq!(p.seqlen_q_rounded, 128);
        assert_eq!(p.seqlen_k_rounded, 256);
        assert_eq!(p.softmax_scale, 1.0 / 60f32.sqrt());
    }

    #[test]
    fn kv_head_groups() {
        let p = MhaParams::contiguous(1, 8, 2, 4, 4, 16, false);
        let heads: Vec<usize> = (0..8).map(|h| p.kv_head(h)).collect();
        assert_eq!(heads, [0, 0, 0, 0, 1, 1, 1, 1]);
        let mqa = MhaParams::contiguous(1, 8, 1, 4, 4, 16, false);
        assert!((0..8).all(|h| mqa.kv_head(h) == 0));
    }

    #[test]
    fn dense_and_jagged_offsets() {
        let strides = TensorStrides::new(1000, 10, 3);
        let dense = SeqLayout::new(5, None);
        assert_eq!(dense.offset(&strides, 2, 4, 1), 2000 + 40 + 3);
        assert_eq!(dense.start(2), 10);
        assert_eq!(dense.total(3), 15);

        // The batch stride is never applied once cumulative offsets are given.
        let cu = [0u32, 3, 7];
        let jagged = SeqLayout::new(5, Some(&cu));
        assert_eq!(jagged.len(1), 4);
        assert_eq!(jagged.offset(&strides, 1, 2, 1), (3 + 2) * 10 + 3);
        assert_eq!(jagged.start(1), 3);
        assert_eq!(jagged.total(2), 7);

        assert_eq!(dense.locate(12), (2, 2));
        assert_eq!(jagged.locate(0), (0, 0));
        assert_eq!(jagged.locate(3), (1, 0));
        assert_eq!(jagged.locate(6), (1, 3));
        let with_empty = [0u32, 0, 2, 2, 5];
        let jagged = SeqLayout::new(3, Some(&with_empty));
        let rows: Vec<_> = (0..5).map(|r| jagged.locate(r)).collect();
        assert_eq!(rows, [(1, 0), (1, 1), (3, 0), (3, 1), (3, 2)]);
    }

    #[test]
    fn malformed_cu_seqlens() {
        let bad_len = [0u32, 3];
        let err = SeqLayout::new(4, Some(&bad_len)).validate("cu_seqlens_q", 2, 4);
        assert!(matches!(err, Err(FlashError::CuSeqlens { .. })));

        let bad_start = [1u32, 3, 4];
        let err = SeqLayout::new(4, Some(&bad_start)).validate("cu_seqlens_q", 2, 4);
        assert!(matches!(err, Err(FlashError::CuSeqlens { .. })));

        let decreasing = [0u32, 3, 2];
        let err = SeqLayout::new(4, Some(&decreasing)).validate("cu_seqlens_q", 2, 4);
        assert!(matches!(err, Err(FlashError::CuSeqlens { .. })));

        let too_long = [0u32, 3, 9];
        let err = SeqLayout::new(4, Some(&too_long)).validate("cu_seqlens_k", 2, 4);
        assert!(matches!(
            err,
            Err(FlashError::SeqlenTooLong {
                batch: 1,
                len: 6,
                ..
            })
        ));

        let ok = [0u32, 0, 4];
        assert!(SeqLayout::new(4, Some(&ok)).validate("cu_seqlens_q", 2, 4).is_ok());
    }

    #[test]
    fn required_len_skips_empty_sequences() {
        let strides = TensorStrides::packed(2, 4);
        let cu = [0u32, 2, 2];
        let layout = SeqLayout::new(2, Some(&cu));
        // Last row is row 1 of batch 0, head 1.
        assert_eq!(layout.required_len(&strides, 2, 2, 4), Some(8 + 4 + 4));
        let empty = SeqLayout::new(0, None);
        assert_eq!(empty.required_len(&strides, 2, 2, 4), Some(0));
    }

    #[test]
    fn validate_shapes() {
        let q = vec![0f32; 2 * 4 * 3 * 8];
        let kv = vec![0f32; 2 * 4 * 2 * 8];
        let mut o = vec![0f32; q.len()];

        let p = MhaParams::contiguous(2, 3, 2, 4, 4, 8, false);
        let bufs = MhaBuffers::new(&q, &kv, &kv, &mut o);
        assert!(matches!(
            p.validate(&bufs),
            Err(FlashError::HeadCount {
                num_heads: 3,
                num_heads_k: 2
            })
        ));

        let p = MhaParams::contiguous(2, 4, 2, 4, 4, 300, false);
        assert!(matches!(
            p.validate(&bufs),
            Err(FlashError::UnsupportedHeadDim(300))
        ));

        let p = MhaParams {
            seqlen_k_rounded: 2,
            ..MhaParams::contiguous(2, 4, 2, 4, 4, 8, false)
        };
        assert!(matches!(
            p.validate(&bufs),
            Err(FlashError::RoundedExtent {
                arg: "seqlen_k",
                ..
            })
        ));

        // q is too small for 4 query heads.
        let p = MhaParams::contiguous(2, 4, 2, 4, 4, 8, false);
        assert!(matches!(
            p.validate(&bufs),
            Err(FlashError::BufferTooSmall { arg: "q", .. })
        ));
    }

    #[test]
    fn huge_strides_are_rejected() {
        let q = vec![0f32; 4 * 4 * 2 * 4];
        let kv = vec![0f32; 4 * 4 * 2 * 4];
        let mut o = vec![0f32; q.len()];
        let bufs = MhaBuffers::new(&q, &kv, &kv, &mut o);

        let p = MhaParams {
            q: TensorStrides::new(usize::MAX / 2, 8, 4),
            ..MhaParams::contiguous(4, 2, 2, 4, 4, 4, false)
        };
        assert!(matches!(
            p.validate(&bufs),
            Err(FlashError::ExtentOverflow { arg: "q" })
        ));

        let p = MhaParams {
            v: TensorStrides::new(32, usize::MAX / 2, 4),
            ..MhaParams::contiguous(4, 2, 2, 4, 4, 4, false)
        };
        assert!(matches!(
            p.validate(&bufs),
            Err(FlashError::ExtentOverflow { arg: "v" })
        ));

        let strides = TensorStrides::new(usize::MAX, 1, 1);
        assert_eq!(SeqLayout::new(1, None).required_len(&strides, 2, 1, 1), None);
        // The batch stride is unused by jagged layouts.
        let cu = [0u32, 1, 2];
        assert_eq!(
            SeqLayout::new(1, Some(&cu)).required_len(&strides, 2, 1, 1),
            Some(2)
        );
    }
}
