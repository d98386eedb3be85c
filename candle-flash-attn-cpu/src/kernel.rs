//! The attention forward pass over raw slices.
//!
//! Every `(batch, query row, query head)` triple is independent and owns `head_dim` elements of
//! the output. With the usual row-major output those are written in place by the rayon tasks of
//! the flash-attention thread pool, other output strides go through a row-major buffer first.
//! The log-sum-exp values are gathered per task and laid out afterwards.
use candle::WithDType;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::ops::Range;
use std::sync::LazyLock;

use crate::config::{get_num_threads, KernelConfig};
use crate::error::Result;
use crate::mask::{vec_dot, ScoreMask, ScoreTransform};
use crate::params::{MhaParams, SeqLayout};
use crate::softmax::OnlineSoftmax;

/// Rayon pool used by the flash-attention cpu kernel. When it cannot be built the global
/// rayon pool is used instead.
static FLASH_ATTN_POOL: LazyLock<Option<ThreadPool>> = LazyLock::new(|| {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(get_num_threads())
        .thread_name(|i| format!("flash-attn-{i}"))
        .build();
    match pool {
        Ok(pool) => Some(pool),
        Err(err) => {
            tracing::warn!("cannot build the flash-attn thread pool, using the global one: {err}");
            None
        }
    }
});

fn install<R: Send>(f: impl FnOnce() -> R + Send) -> R {
    match FLASH_ATTN_POOL.as_ref() {
        Some(pool) => pool.install(f),
        None => f(),
    }
}

/// Input and output buffers of a forward call.
///
/// The optional buffers enable the matching feature: `softmax_lse` receives the log-sum-exp of
/// each query row, `alibi_slopes` turns on the ALiBi bias, and `cu_seqlens_q`/`cu_seqlens_k`
/// switch q/o, respectively k/v, to variable length addressing.
pub struct MhaBuffers<'a, T> {
    pub q: &'a [T],
    pub k: &'a [T],
    pub v: &'a [T],
    pub o: &'a mut [T],
    pub softmax_lse: Option<&'a mut [f32]>,
    pub alibi_slopes: Option<&'a [f32]>,
    pub cu_seqlens_q: Option<&'a [u32]>,
    pub cu_seqlens_k: Option<&'a [u32]>,
}

impl<'a, T> MhaBuffers<'a, T> {
    pub fn new(q: &'a [T], k: &'a [T], v: &'a [T], o: &'a mut [T]) -> Self {
        Self {
            q,
            k,
            v,
            o,
            softmax_lse: None,
            alibi_slopes: None,
            cu_seqlens_q: None,
            cu_seqlens_k: None,
        }
    }

    pub fn with_lse(mut self, softmax_lse: &'a mut [f32]) -> Self {
        self.softmax_lse = Some(softmax_lse);
        self
    }

    pub fn with_alibi_slopes(mut self, alibi_slopes: &'a [f32]) -> Self {
        self.alibi_slopes = Some(alibi_slopes);
        self
    }

    pub fn with_cu_seqlens(mut self, cu_seqlens_q: &'a [u32], cu_seqlens_k: &'a [u32]) -> Self {
        self.cu_seqlens_q = Some(cu_seqlens_q);
        self.cu_seqlens_k = Some(cu_seqlens_k);
        self
    }
}

/// Per task scratch space, reused over the `(query row, head)` pairs a rayon task handles.
struct Scratch {
    q_row: Vec<f32>,
    out_row: Vec<f32>,
    scores: Vec<f32>,
    state: OnlineSoftmax,
}

impl Scratch {
    fn new(head_dim: usize, block_k: usize) -> Self {
        Self {
            q_row: vec![0f32; head_dim],
            out_row: vec![0f32; head_dim],
            scores: Vec::with_capacity(block_k),
            state: OnlineSoftmax::new(head_dim),
        }
    }
}

/// Read-only view of everything the attention of a single query row needs.
struct Inputs<'a, T> {
    params: &'a MhaParams,
    q: &'a [T],
    k: &'a [T],
    v: &'a [T],
    alibi_slopes: Option<&'a [f32]>,
    q_layout: SeqLayout<'a>,
    k_layout: SeqLayout<'a>,
    block_k: usize,
}

impl<T: WithDType> Inputs<'_, T> {
    /// Folds keys `keys` of kv head `kv_head` into `state`, `block_k` keys at a time.
    #[allow(clippy::too_many_arguments)]
    fn attend_keys(
        &self,
        state: &mut OnlineSoftmax,
        scores: &mut Vec<f32>,
        q_row: &[f32],
        keys: Range<usize>,
        b: usize,
        kv_head: usize,
        i_k: isize,
        transform: &ScoreTransform,
    ) {
        let p = self.params;
        let d = p.d;
        let mut start = keys.start;
        while start < keys.end {
            let block = start..(start + self.block_k).min(keys.end);
            scores.clear();
            scores.extend(block.clone().map(|j| {
                let k_off = self.k_layout.offset(&p.k, b, j, kv_head);
                transform.apply(vec_dot(q_row, &self.k[k_off..k_off + d]), i_k, j)
            }));
            let values = block.clone().map(|j| {
                let v_off = self.k_layout.offset(&p.v, b, j, kv_head);
                &self.v[v_off..v_off + d]
            });
            state.update_block(&scores[..], values);
            start = block.end;
        }
    }

    /// Same as `attend_keys` but the keys are split into `num_splits` chunks reduced in
    /// parallel, the partial states are then merged.
    #[allow(clippy::too_many_arguments)]
    fn attend_keys_split(
        &self,
        q_row: &[f32],
        keys: Range<usize>,
        num_splits: usize,
        b: usize,
        kv_head: usize,
        i_k: isize,
        transform: &ScoreTransform,
    ) -> OnlineSoftmax {
        let d = self.params.d;
        let chunk = keys.len().div_ceil(num_splits);
        (0..num_splits)
            .into_par_iter()
            .map(|split| {
                let start = (keys.start + split * chunk).min(keys.end);
                let end = (start + chunk).min(keys.end);
                let mut state = OnlineSoftmax::new(d);
                let mut scores = Vec::with_capacity(self.block_k);
                self.attend_keys(
                    &mut state,
                    &mut scores,
                    q_row,
                    start..end,
                    b,
                    kv_head,
                    i_k,
                    transform,
                );
                state
            })
            .reduce(
                || OnlineSoftmax::new(d),
                |mut acc, part| {
                    acc.merge(part);
                    acc
                },
            )
    }

    /// Attention of query row `i` of batch entry `b`, head `hq`. The normalized row is left in
    /// `scratch.out_row`, the log-sum-exp is returned.
    fn attend_row(
        &self,
        scratch: &mut Scratch,
        b: usize,
        i: usize,
        hq: usize,
        num_splits: usize,
    ) -> f32 {
        let p = self.params;
        let d = p.d;
        let seqlen_q = self.q_layout.len(b);
        let seqlen_k = self.k_layout.len(b);
        let kv_head = p.kv_head(hq);

        let mask = ScoreMask::new(p.is_causal, p.window_size_left, p.window_size_right);
        let slope = self
            .alibi_slopes
            .map(|slopes| slopes[b * p.alibi_slopes_batch_stride + hq]);
        let transform = ScoreTransform::new(p.softmax_scale, slope, p.softcap);

        let Scratch {
            q_row,
            out_row,
            scores,
            state,
        } = scratch;
        let q_off = self.q_layout.offset(&p.q, b, i, hq);
        for (dst, src) in q_row.iter_mut().zip(&self.q[q_off..q_off + d]) {
            *dst = src.to_f64() as f32;
        }
        let i_k = ScoreMask::aligned(i, seqlen_q, seqlen_k);
        let keys = mask.key_range(i_k, seqlen_k);
        if num_splits > 1 && keys.len() > self.block_k {
            self.attend_keys_split(q_row, keys, num_splits, b, kv_head, i_k, &transform)
                .finalize_into(out_row)
        } else {
            state.reset();
            self.attend_keys(state, scores, q_row, keys, b, kv_head, i_k, &transform);
            state.finalize_into(out_row)
        }
    }

    /// Computes every `(query row, head)` pair straight into `out`, a `(total_q, h, d)`
    /// row-major buffer, `min_len` pairs at least per rayon task. Returns the log-sum-exp of
    /// each pair in the same `(total_q, h)` order.
    fn attend_rows(&self, out: &mut [T], num_splits: usize, min_len: usize) -> Vec<f32> {
        let (h, d) = (self.params.h, self.params.d);
        out.par_chunks_mut(d)
            .enumerate()
            .with_min_len(min_len)
            .map_init(
                || Scratch::new(d, self.block_k),
                |scratch, (idx, out_row)| {
                    let (b, i) = self.q_layout.locate(idx / h);
                    let lse = self.attend_row(scratch, b, i, idx % h, num_splits);
                    for (dst, &src) in out_row.iter_mut().zip(scratch.out_row.iter()) {
                        *dst = T::from_f64(src as f64);
                    }
                    lse
                },
            )
            .collect()
    }
}

/// Whether `o` is the row-major `(total_q, h, d)` layout, possibly with a batch dimension,
/// in which case each `(query row, head)` pair owns the next `d` elements.
fn is_row_major(params: &MhaParams, q_layout: &SeqLayout) -> bool {
    let o = &params.o;
    let batch_ok = match q_layout {
        SeqLayout::Dense { seqlen } => params.b == 1 || o.batch == seqlen * o.row,
        SeqLayout::Jagged { .. } => true,
    };
    o.head == params.d && o.row == params.h * params.d && batch_ok
}

/// Copies rows computed in row-major order to an output with arbitrary strides.
fn scatter_rows<T: Copy>(params: &MhaParams, q_layout: &SeqLayout, rows: &[T], o: &mut [T]) {
    let (h, d) = (params.h, params.d);
    for (idx, row) in rows.chunks_exact(d).enumerate() {
        let (b, i) = q_layout.locate(idx / h);
        let o_off = q_layout.offset(&params.o, b, i, idx % h);
        o[o_off..o_off + d].copy_from_slice(row);
    }
}

/// Writes the `(total_q, h)` log-sum-exp values to the padded or unpadded lse layout. Padding
/// slots of the padded layout are left untouched.
fn emit_lse(params: &MhaParams, q_layout: &SeqLayout, row_lse: &[f32], softmax_lse: &mut [f32]) {
    let h = params.h;
    let total_q = q_layout.total(params.b);
    for (row, heads) in row_lse.chunks_exact(h).enumerate() {
        let (b, i) = q_layout.locate(row);
        for (hq, &value) in heads.iter().enumerate() {
            let idx = if params.unpadded_lse {
                hq * total_q + row
            } else {
                (b * h + hq) * params.seqlen_q + i
            };
            softmax_lse[idx] = value;
        }
    }
}

/// Runs the attention forward pass described by `params` on `bufs`.
///
/// For every query row `i` of batch entry `b` and query head `h` this computes
/// `softmax(q.k^T * softmax_scale + alibi) v` over the keys of kv head `h / (h / h_k)` that
/// survive the causal and window masks, without materializing the score matrix. Query rows
/// that see no key get a zero output and a `-inf` lse.
///
/// The parameters and buffer extents are validated before anything is written.
pub fn run_mha<T: WithDType>(
    params: &MhaParams,
    bufs: MhaBuffers<'_, T>,
    cfg: &KernelConfig,
) -> Result<()> {
    let _span = tracing::span!(
        tracing::Level::TRACE,
        "flash-attn-fwd",
        b = params.b,
        h = params.h,
        h_k = params.h_k,
        d = params.d
    )
    .entered();
    params.validate(&bufs)?;

    let MhaBuffers {
        q,
        k,
        v,
        o,
        softmax_lse,
        alibi_slopes,
        cu_seqlens_q,
        cu_seqlens_k,
    } = bufs;
    let q_layout = SeqLayout::new(params.seqlen_q, cu_seqlens_q);
    let k_layout = SeqLayout::new(params.seqlen_k, cu_seqlens_k);
    let inputs = Inputs {
        params,
        q,
        k,
        v,
        alibi_slopes,
        q_layout,
        k_layout,
        block_k: cfg.block_k.max(1),
    };
    let out_len = q_layout.total(params.b) * params.h * params.d;
    let min_len = cfg.block_q.max(1);
    let row_major = is_row_major(params, &q_layout);

    let row_lse = install(|| {
        let num_units = (out_len / params.d).div_ceil(min_len);
        let num_splits = cfg.splits_for(num_units, params.seqlen_k, rayon::current_num_threads());
        tracing::debug!(
            num_units,
            num_splits,
            row_major,
            varlen = cu_seqlens_q.is_some() || cu_seqlens_k.is_some(),
            "flash-attn schedule"
        );
        if row_major {
            inputs.attend_rows(&mut o[..out_len], num_splits, min_len)
        } else {
            let mut rows = vec![T::from_f64(0.0); out_len];
            let row_lse = inputs.attend_rows(&mut rows, num_splits, min_len);
            scatter_rows(params, &q_layout, &rows, o);
            row_lse
        }
    });

    if let Some(softmax_lse) = softmax_lse {
        emit_lse(params, &q_layout, &row_lse, softmax_lse);
    }
    Ok(())
}
