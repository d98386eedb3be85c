//! Flash-attention forward pass for candle CPU tensors.
//!
//! The public functions follow the `candle-flash-attn` API: q is `(batch, seq_len_q, num_heads_q,
//! head_size)`, k and v are `(batch, seq_len_kv, num_heads_kv, head_size)`, or their packed
//! `(total, num_heads, head_size)` counterparts for the varlen variants. The work itself is done
//! by [`kernel::run_mha`] which can also be used directly on slices.
pub mod config;
pub mod error;
pub mod kernel;
pub mod mask;
pub mod params;
pub mod softmax;

use candle::backend::BackendStorage;
use candle::{CpuStorage, DType, Device, Layout, Result, Shape, Storage, Tensor, WithDType};
use half::{bf16, f16};

pub use config::KernelConfig;
pub use error::FlashError;
pub use kernel::{run_mha, MhaBuffers};
pub use mask::alibi_slopes;
pub use params::{MhaParams, SeqLayout, TensorStrides};

/// Converts the optional window sizes of the tensor api to the kernel convention, sizes larger
/// than the key length are unbounded.
fn window_sizes(left: Option<usize>, right: Option<usize>, seqlen_k: usize) -> (i32, i32) {
    let convert = |w: Option<usize>| {
        w.filter(|w| *w <= seqlen_k)
            .and_then(|w| i32::try_from(w).ok())
            .unwrap_or(-1)
    };
    (convert(left), convert(right))
}

#[allow(clippy::too_many_arguments)]
fn check_inputs(
    name: &str,
    rank: usize,
    q: &CpuStorage,
    q_l: &Layout,
    k: &CpuStorage,
    k_l: &Layout,
    v: &CpuStorage,
    v_l: &Layout,
) -> Result<()> {
    let q_rank = q_l.stride().len();
    let k_rank = k_l.stride().len();
    let v_rank = v_l.stride().len();
    if q_rank != rank || k_rank != rank || v_rank != rank {
        candle::bail!(
            "{name} expects input tensors of rank {rank} (q: {q_rank}, k: {k_rank}, v: {v_rank})"
        )
    }
    for (arg, l) in [("q", q_l), ("k", k_l), ("v", v_l)] {
        let stride = l.stride();
        if stride[rank - 1] != 1 {
            candle::bail!("the last dim of {arg} must be contiguous {stride:?}")
        }
    }
    if q.dtype() != k.dtype() || q.dtype() != v.dtype() {
        candle::bail!(
            "dtype mismatch q {:?}, k {:?} and v {:?}",
            q.dtype(),
            k.dtype(),
            v.dtype()
        )
    }
    Ok(())
}

/// Slopes as a slice together with their batch stride: `0` for `(num_heads)`, `num_heads` for
/// `(batch, num_heads)`.
fn alibi_slopes_slice<'a>(
    storage: &'a Storage,
    layout: &Layout,
    b_sz: usize,
    num_heads: usize,
) -> Result<(&'a [f32], usize)> {
    let batch_stride = match layout.dims() {
        [h] if *h == num_heads => 0,
        [b, h] if *b == b_sz && *h == num_heads => num_heads,
        _ => candle::bail!(
            "shape mismatch alibi_slopes {:?}, expected {:?} or {:?}",
            layout.shape(),
            (num_heads,),
            (b_sz, num_heads)
        ),
    };
    let slopes = match storage {
        Storage::Cpu(s) => s.as_slice::<f32>()?,
        _ => candle::bail!("alibi_slopes must be a cpu tensor"),
    };
    match layout.contiguous_offsets() {
        Some((o1, o2)) => Ok((&slopes[o1..o2], batch_stride)),
        None => candle::bail!("alibi_slopes has to be contiguous"),
    }
}

fn seqlens_slice<'a>(storage: &'a Storage, layout: &Layout, arg: &str) -> Result<&'a [u32]> {
    let seqlens = match storage {
        Storage::Cpu(s) => s.as_slice::<u32>()?,
        _ => candle::bail!("{arg} must be a cpu tensor"),
    };
    match layout.contiguous_offsets() {
        Some((o1, o2)) => Ok(&seqlens[o1..o2]),
        None => candle::bail!("{arg} has to be contiguous"),
    }
}

/// Output and log-sum-exp of a forward call, before they get wrapped as storage or tensors.
struct FwdOutput<T> {
    out: Vec<T>,
    out_shape: Shape,
    lse: Vec<f32>,
    lse_shape: Shape,
}

impl<T: WithDType> FwdOutput<T> {
    fn into_storage(self) -> (CpuStorage, Shape) {
        (T::to_cpu_storage_owned(self.out), self.out_shape)
    }

    fn into_tensors(self) -> Result<(Tensor, Tensor)> {
        let out = Tensor::from_vec(self.out, self.out_shape, &Device::Cpu)?;
        let lse = Tensor::from_vec(self.lse, self.lse_shape, &Device::Cpu)?;
        Ok((out, lse))
    }
}

fn cpu_storages<'a>(
    q: &'a Storage,
    k: &'a Storage,
    v: &'a Storage,
) -> Result<(&'a CpuStorage, &'a CpuStorage, &'a CpuStorage)> {
    match (q, k, v) {
        (Storage::Cpu(q), Storage::Cpu(k), Storage::Cpu(v)) => Ok((q, k, v)),
        _ => candle::bail!("flash-attn-cpu only supports cpu tensors"),
    }
}

pub struct FlashAttn {
    pub softmax_scale: f32,
    pub alibi_slopes: Option<Tensor>,
    pub window_size_left: Option<usize>,
    pub window_size_right: Option<usize>,
    pub softcap: Option<f32>,
}

impl FlashAttn {
    fn fwd_t<T: WithDType>(
        &self,
        q: &CpuStorage,
        q_l: &Layout,
        k: &CpuStorage,
        k_l: &Layout,
        v: &CpuStorage,
        v_l: &Layout,
    ) -> Result<FwdOutput<T>> {
        check_inputs("flash-attn", 4, q, q_l, k, k_l, v, v_l)?;
        let q_stride = q_l.stride();
        let k_stride = k_l.stride();
        let v_stride = v_l.stride();

        let (b_sz, seqlen_q, num_heads, head_size) = q_l.shape().dims4()?;
        let (_b_sz, seqlen_k, num_heads_k, _head_size) = k_l.shape().dims4()?;
        let expected_kv = (b_sz, seqlen_k, num_heads_k, head_size);
        if expected_kv != k_l.shape().dims4()? {
            candle::bail!("shape mismatch q {:?} and k {:?}", q_l.shape(), k_l.shape())
        }
        if expected_kv != v_l.shape().dims4()? {
            candle::bail!("shape mismatch q {:?} and v {:?}", q_l.shape(), v_l.shape())
        }

        let alibi = self.alibi_slopes.as_ref().map(|t| t.storage_and_layout());
        let alibi_slopes = match &alibi {
            Some((storage, layout)) => Some(alibi_slopes_slice(storage, layout, b_sz, num_heads)?),
            None => None,
        };

        let (window_size_left, window_size_right) =
            window_sizes(self.window_size_left, self.window_size_right, seqlen_k);
        let is_causal = window_size_left < 0 && window_size_right == 0;

        let out_shape = Shape::from((b_sz, seqlen_q, num_heads, head_size));
        let mut params = MhaParams::contiguous(
            b_sz,
            num_heads,
            num_heads_k,
            seqlen_q,
            seqlen_k,
            head_size,
            is_causal,
        )
        .with_window(window_size_left, window_size_right)
        .with_softmax_scale(self.softmax_scale)
        .with_softcap(self.softcap.unwrap_or(0.0));
        params.q = TensorStrides::new(q_stride[0], q_stride[1], q_stride[2]);
        params.k = TensorStrides::new(k_stride[0], k_stride[1], k_stride[2]);
        params.v = TensorStrides::new(v_stride[0], v_stride[1], v_stride[2]);

        let q = &q.as_slice::<T>()?[q_l.start_offset()..];
        let k = &k.as_slice::<T>()?[k_l.start_offset()..];
        let v = &v.as_slice::<T>()?[v_l.start_offset()..];
        let mut out = vec![T::from_f64(0.0); out_shape.elem_count()];
        let mut lse = vec![f32::NEG_INFINITY; b_sz * num_heads * seqlen_q];

        let mut bufs = MhaBuffers::new(q, k, v, &mut out).with_lse(&mut lse);
        if let Some((slopes, batch_stride)) = alibi_slopes {
            params.alibi_slopes_batch_stride = batch_stride;
            bufs = bufs.with_alibi_slopes(slopes);
        }
        run_mha(&params, bufs, KernelConfig::global())?;

        Ok(FwdOutput {
            out,
            out_shape,
            lse,
            lse_shape: Shape::from((b_sz, num_heads, seqlen_q)),
        })
    }

    /// Runs the op and also returns the log-sum-exp of every query row, with shape
    /// `(batch, num_heads_q, seq_len_q)`.
    pub fn forward_with_lse(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (q_s, q_l) = q.storage_and_layout();
        let (k_s, k_l) = k.storage_and_layout();
        let (v_s, v_l) = v.storage_and_layout();
        let (q_s, k_s, v_s) = cpu_storages(&q_s, &k_s, &v_s)?;
        match q.dtype() {
            DType::F16 => self.fwd_t::<f16>(q_s, q_l, k_s, k_l, v_s, v_l)?.into_tensors(),
            DType::BF16 => self.fwd_t::<bf16>(q_s, q_l, k_s, k_l, v_s, v_l)?.into_tensors(),
            DType::F32 => self.fwd_t::<f32>(q_s, q_l, k_s, k_l, v_s, v_l)?.into_tensors(),
            dt => candle::bail!("flash-attn is only supported for f16/bf16/f32 ({dt:?})"),
        }
    }
}

impl candle::CustomOp3 for FlashAttn {
    fn name(&self) -> &'static str {
        "flash-attn-cpu"
    }

    fn cpu_fwd(
        &self,
        q: &CpuStorage,
        q_l: &Layout,
        k: &CpuStorage,
        k_l: &Layout,
        v: &CpuStorage,
        v_l: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        match q.dtype() {
            DType::F16 => Ok(self.fwd_t::<f16>(q, q_l, k, k_l, v, v_l)?.into_storage()),
            DType::BF16 => Ok(self.fwd_t::<bf16>(q, q_l, k, k_l, v, v_l)?.into_storage()),
            DType::F32 => Ok(self.fwd_t::<f32>(q, q_l, k, k_l, v, v_l)?.into_storage()),
            dt => candle::bail!("flash-attn is only supported for f16/bf16/f32 ({dt:?})"),
        }
    }
}

/// Flash-attention layer.
///
/// This implements scaled dot-product attention, `softmax(Q @ K^T . softmax_scale) @ V`.
/// Multi-query and grouped-query attention are supported by using tensors k and v with fewer heads
/// than q, the number of heads in k and v has to be divisible by the number of heads in q.
///
/// # Arguments
///
/// * `q` - Query tensor with shape `(batch, seq_len_q, num_heads_q, head_size)`.
/// * `k` - Key tensor with shape `(batch, seq_len_kv, num_heads_kv, head_size)`.
/// * `v` - Value tensor with shape `(batch, seq_len_kv, num_heads_kv, head_size)`.
///
/// The resulting tensor has dimensions `(batch, seq_len_q, num_heads_q, head_size)`.
pub fn flash_attn(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    softmax_scale: f32,
    causal: bool,
) -> Result<Tensor> {
    let window_size_left = None;
    let window_size_right = if causal { Some(0) } else { None };

    let op = FlashAttn {
        softmax_scale,
        alibi_slopes: None,
        window_size_left,
        window_size_right,
        softcap: None,
    };
    q.apply_op3(k, v, op)
}

/// Flash-attention layer with a sliding window.
///
/// # Arguments
///
/// * `q` - Query tensor with shape `(batch, seq_len_q, num_heads_q, head_size)`.
/// * `k` - Key tensor with shape `(batch, seq_len_kv, num_heads_kv, head_size)`.
/// * `v` - Value tensor with shape `(batch, seq_len_kv, num_heads_kv, head_size)`.
/// * `window_size_left` - Limit left attention to value tokens.
/// * `window_size_right` - Limit right attention to value tokens.
///
/// # Causal mask
///
/// `window_size_left=None` with `window_size_right=Some(0)` applies a causal mask to the result
/// of `Q @ K^T`.
///
/// The resulting tensor has dimensions `(batch, seq_len_q, num_heads_q, head_size)`.
pub fn flash_attn_windowed(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    softmax_scale: f32,
    window_size_left: Option<usize>,
    window_size_right: Option<usize>,
) -> Result<Tensor> {
    let op = FlashAttn {
        softmax_scale,
        alibi_slopes: None,
        window_size_left,
        window_size_right,
        softcap: None,
    };
    q.apply_op3(k, v, op)
}

/// Flash-attention layer with ALiBi.
///
/// * `alibi_slopes` - Alibi slopes tensor with shape `(num_heads_q)` or
///   `(batch, num_heads_q)`, `f32`. Key `j` gets a bias of `-slope * |i + seq_len_kv - seq_len_q - j|`
///   for query `i`.
///
/// The resulting tensor has dimensions `(batch, seq_len_q, num_heads_q, head_size)`.
pub fn flash_attn_alibi(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    alibi_slopes: &Tensor,
    softmax_scale: f32,
    causal: bool,
) -> Result<Tensor> {
    let window_size_left = None;
    let window_size_right = if causal { Some(0) } else { None };

    let op = FlashAttn {
        softmax_scale,
        alibi_slopes: Some(alibi_slopes.clone()),
        window_size_left,
        window_size_right,
        softcap: None,
    };
    q.apply_op3(k, v, op)
}

/// Flash-attention layer with ALiBi and a sliding window, see [`flash_attn_alibi`] and
/// [`flash_attn_windowed`].
pub fn flash_attn_alibi_windowed(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    alibi_slopes: &Tensor,
    softmax_scale: f32,
    window_size_left: Option<usize>,
    window_size_right: Option<usize>,
) -> Result<Tensor> {
    let op = FlashAttn {
        softmax_scale,
        alibi_slopes: Some(alibi_slopes.clone()),
        window_size_left,
        window_size_right,
        softcap: None,
    };
    q.apply_op3(k, v, op)
}

/// Most general flash-attention layer.
///
/// * `softcap` - Logits are mapped to `softcap * tanh(logits / softcap)` after scaling and
///   ALiBi, `0.0` disables capping.
#[allow(clippy::too_many_arguments)]
pub fn flash_attn_alibi_windowed_softcap(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    alibi_slopes: Option<&Tensor>,
    softmax_scale: f32,
    window_size_left: Option<usize>,
    window_size_right: Option<usize>,
    softcap: f32,
) -> Result<Tensor> {
    let op = FlashAttn {
        softmax_scale,
        alibi_slopes: alibi_slopes.cloned(),
        window_size_left,
        window_size_right,
        softcap: Some(softcap),
    };
    q.apply_op3(k, v, op)
}

/// Same as [`flash_attn`] but also returns the log-sum-exp of the attention logits, with shape
/// `(batch, num_heads_q, seq_len_q)`. Query rows without any visible key get `-inf`.
pub fn flash_attn_with_lse(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    softmax_scale: f32,
    causal: bool,
) -> Result<(Tensor, Tensor)> {
    let op = FlashAttn {
        softmax_scale,
        alibi_slopes: None,
        window_size_left: None,
        window_size_right: if causal { Some(0) } else { None },
        softcap: None,
    };
    op.forward_with_lse(q, k, v)
}

pub struct FlashAttnVarLen {
    pub softmax_scale: f32,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub seqlens_q: Tensor,
    pub seqlens_k: Tensor,
    pub alibi_slopes: Option<Tensor>,
    pub window_size_left: Option<usize>,
    pub window_size_right: Option<usize>,
    pub softcap: Option<f32>,
    /// Lay the lse out as `(num_heads_q, total_q)` instead of `(batch, num_heads_q, max_seqlen_q)`.
    pub unpadded_lse: bool,
}

impl FlashAttnVarLen {
    fn fwd_t<T: WithDType>(
        &self,
        q: &CpuStorage,
        q_l: &Layout,
        k: &CpuStorage,
        k_l: &Layout,
        v: &CpuStorage,
        v_l: &Layout,
    ) -> Result<FwdOutput<T>> {
        check_inputs("flash-attn-varlen", 3, q, q_l, k, k_l, v, v_l)?;
        let q_stride = q_l.stride();
        let k_stride = k_l.stride();
        let v_stride = v_l.stride();

        let (total_q, num_heads, head_size) = q_l.shape().dims3()?;
        let (total_k, num_heads_k, _head_size) = k_l.shape().dims3()?;
        let expected_kv = (total_k, num_heads_k, head_size);
        if expected_kv != k_l.shape().dims3()? {
            candle::bail!("shape mismatch q {:?} and k {:?}", q_l.shape(), k_l.shape())
        }
        if expected_kv != v_l.shape().dims3()? {
            candle::bail!("shape mismatch q {:?} and v {:?}", q_l.shape(), v_l.shape())
        }

        let (seqlens_q, seqlens_q_layout) = self.seqlens_q.storage_and_layout();
        let seqlens_q = seqlens_slice(&seqlens_q, seqlens_q_layout, "seqlens_q")?;
        let (seqlens_k, seqlens_k_layout) = self.seqlens_k.storage_and_layout();
        let seqlens_k = seqlens_slice(&seqlens_k, seqlens_k_layout, "seqlens_k")?;

        let nseqlens_q = seqlens_q.len();
        if nseqlens_q < 2 {
            candle::bail!("seqlens_q should have a len >= 2 {nseqlens_q}")
        }
        let nseqlens_k = seqlens_k.len();
        if nseqlens_k != nseqlens_q {
            candle::bail!("seqlens_q and seqlens_k should have the same number of elements {nseqlens_q} <> {nseqlens_k}")
        }
        let batch_size = nseqlens_q - 1;
        // The offsets size the lse, check them before allocating anything.
        SeqLayout::new(self.max_seqlen_q, Some(seqlens_q)).validate(
            "cu_seqlens_q",
            batch_size,
            self.max_seqlen_q,
        )?;
        SeqLayout::new(self.max_seqlen_k, Some(seqlens_k)).validate(
            "cu_seqlens_k",
            batch_size,
            self.max_seqlen_k,
        )?;
        let (last_q, last_k) = (seqlens_q[batch_size] as usize, seqlens_k[batch_size] as usize);
        if last_q > total_q || last_k > total_k {
            candle::bail!(
                "seqlens end past the packed tensors, q: {last_q} > {total_q} or k: {last_k} > {total_k}"
            )
        }

        let alibi = self.alibi_slopes.as_ref().map(|t| t.storage_and_layout());
        let alibi_slopes = match &alibi {
            Some((storage, layout)) => {
                Some(alibi_slopes_slice(storage, layout, batch_size, num_heads)?)
            }
            None => None,
        };

        let (window_size_left, window_size_right) =
            window_sizes(self.window_size_left, self.window_size_right, self.max_seqlen_k);
        let is_causal = window_size_left < 0 && window_size_right == 0;

        let out_shape = Shape::from((total_q, num_heads, head_size));
        let mut params = MhaParams::varlen(
            batch_size,
            num_heads,
            num_heads_k,
            self.max_seqlen_q,
            self.max_seqlen_k,
            head_size,
            is_causal,
        )
        .with_window(window_size_left, window_size_right)
        .with_softmax_scale(self.softmax_scale)
        .with_softcap(self.softcap.unwrap_or(0.0));
        params.q = TensorStrides::new(0, q_stride[0], q_stride[1]);
        params.k = TensorStrides::new(0, k_stride[0], k_stride[1]);
        params.v = TensorStrides::new(0, v_stride[0], v_stride[1]);
        params.unpadded_lse = self.unpadded_lse;

        let lse_shape = if self.unpadded_lse {
            // The lse covers the rows referenced by the offsets.
            Shape::from((num_heads, last_q))
        } else {
            Shape::from((batch_size, num_heads, self.max_seqlen_q))
        };

        let q = &q.as_slice::<T>()?[q_l.start_offset()..];
        let k = &k.as_slice::<T>()?[k_l.start_offset()..];
        let v = &v.as_slice::<T>()?[v_l.start_offset()..];
        let mut out = vec![T::from_f64(0.0); out_shape.elem_count()];
        let mut lse = vec![f32::NEG_INFINITY; lse_shape.elem_count()];

        let mut bufs = MhaBuffers::new(q, k, v, &mut out)
            .with_lse(&mut lse)
            .with_cu_seqlens(seqlens_q, seqlens_k);
        if let Some((slopes, batch_stride)) = alibi_slopes {
            params.alibi_slopes_batch_stride = batch_stride;
            bufs = bufs.with_alibi_slopes(slopes);
        }
        run_mha(&params, bufs, KernelConfig::global())?;

        Ok(FwdOutput {
            out,
            out_shape,
            lse,
            lse_shape,
        })
    }

    /// Runs the op and also returns the log-sum-exp of every query row, see
    /// [`FlashAttnVarLen::unpadded_lse`] for its layout.
    pub fn forward_with_lse(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (q_s, q_l) = q.storage_and_layout();
        let (k_s, k_l) = k.storage_and_layout();
        let (v_s, v_l) = v.storage_and_layout();
        let (q_s, k_s, v_s) = cpu_storages(&q_s, &k_s, &v_s)?;
        match q.dtype() {
            DType::F16 => self.fwd_t::<f16>(q_s, q_l, k_s, k_l, v_s, v_l)?.into_tensors(),
            DType::BF16 => self.fwd_t::<bf16>(q_s, q_l, k_s, k_l, v_s, v_l)?.into_tensors(),
            DType::F32 => self.fwd_t::<f32>(q_s, q_l, k_s, k_l, v_s, v_l)?.into_tensors(),
            dt => candle::bail!("flash-attn is only supported for f16/bf16/f32 ({dt:?})"),
        }
    }
}

impl candle::CustomOp3 for FlashAttnVarLen {
    fn name(&self) -> &'static str {
        "flash-attn-cpu-varlen"
    }

    fn cpu_fwd(
        &self,
        q: &CpuStorage,
        q_l: &Layout,
        k: &CpuStorage,
        k_l: &Layout,
        v: &CpuStorage,
        v_l: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        match q.dtype() {
            DType::F16 => Ok(self.fwd_t::<f16>(q, q_l, k, k_l, v, v_l)?.into_storage()),
            DType::BF16 => Ok(self.fwd_t::<bf16>(q, q_l, k, k_l, v, v_l)?.into_storage()),
            DType::F32 => Ok(self.fwd_t::<f32>(q, q_l, k, k_l, v, v_l)?.into_storage()),
            dt => candle::bail!("flash-attn is only supported for f16/bf16/f32 ({dt:?})"),
        }
    }
}

/// Flash-attention layer with variable-length batching.
///
/// This implements scaled dot-product attention, `softmax(Q @ K^T . softmax_scale) @ V`.
/// Multi-query and grouped-query attention are supported by using tensors k and v with fewer heads
/// than q, the number of heads in k and v has to be divisible by the number of heads in q.
///
/// # Arguments
///
/// * `q` - Query tensor with shape `(total_q, num_heads_q, head_size)`.
/// * `k` - Key tensor with shape `(total_kv, num_heads_kv, head_size)`.
/// * `v` - Value tensor with shape `(total_kv, num_heads_kv, head_size)`.
/// * `seqlens_q` - The cumulative lengths of the sequences in the batch, used to index in q.
/// * `seqlens_k` - The cumulative lengths of the sequences in the batch, used to index in k and v.
/// * `max_seqlen_q` - The maximum query sequence length for q in the batch.
/// * `max_seqlen_k` - The maximum key sequence length for k and v in the batch.
///
/// `seqlens_q` and `seqlens_k` are `u32` tensors with `batch_size + 1` elements, typically `0`,
/// `seqlen_1`, `seqlen_1 + seqlen_2`, etc.
///
/// The resulting tensor has dimensions `(total_q, num_heads_q, head_size)`.
#[allow(clippy::too_many_arguments)]
pub fn flash_attn_varlen(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    seqlens_q: &Tensor,
    seqlens_k: &Tensor,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    softmax_scale: f32,
    causal: bool,
) -> Result<Tensor> {
    let window_size_left = None;
    let window_size_right = if causal { Some(0) } else { None };

    let op = FlashAttnVarLen {
        softmax_scale,
        max_seqlen_q,
        max_seqlen_k,
        seqlens_q: seqlens_q.clone(),
        seqlens_k: seqlens_k.clone(),
        alibi_slopes: None,
        window_size_left,
        window_size_right,
        softcap: None,
        unpadded_lse: true,
    };
    q.apply_op3(k, v, op)
}

/// Flash-attention layer with variable-length batching and a sliding window, see
/// [`flash_attn_varlen`] and [`flash_attn_windowed`].
#[allow(clippy::too_many_arguments)]
pub fn flash_attn_varlen_windowed(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    seqlens_q: &Tensor,
    seqlens_k: &Tensor,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    softmax_scale: f32,
    window_size_left: Option<usize>,
    window_size_right: Option<usize>,
) -> Result<Tensor> {
    let op = FlashAttnVarLen {
        softmax_scale,
        max_seqlen_q,
        max_seqlen_k,
        seqlens_q: seqlens_q.clone(),
        seqlens_k: seqlens_k.clone(),
        alibi_slopes: None,
        window_size_left,
        window_size_right,
        softcap: None,
        unpadded_lse: true,
    };
    q.apply_op3(k, v, op)
}

/// Flash-attention layer with variable-length batching and ALiBi, see [`flash_attn_varlen`] and
/// [`flash_attn_alibi`].
#[allow(clippy::too_many_arguments)]
pub fn flash_attn_varlen_alibi(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    alibi_slopes: &Tensor,
    seqlens_q: &Tensor,
    seqlens_k: &Tensor,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    softmax_scale: f32,
    causal: bool,
) -> Result<Tensor> {
    let window_size_left = None;
    let window_size_right = if causal { Some(0) } else { None };

    let op = FlashAttnVarLen {
        softmax_scale,
        max_seqlen_q,
        max_seqlen_k,
        seqlens_q: seqlens_q.clone(),
        seqlens_k: seqlens_k.clone(),
        alibi_slopes: Some(alibi_slopes.clone()),
        window_size_left,
        window_size_right,
        softcap: None,
        unpadded_lse: true,
    };
    q.apply_op3(k, v, op)
}

#[allow(clippy::too_many_arguments)]
pub fn flash_attn_varlen_alibi_windowed(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    alibi_slopes: &Tensor,
    seqlens_q: &Tensor,
    seqlens_k: &Tensor,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    softmax_scale: f32,
    window_size_left: Option<usize>,
    window_size_right: Option<usize>,
) -> Result<Tensor> {
    let op = FlashAttnVarLen {
        softmax_scale,
        max_seqlen_q,
        max_seqlen_k,
        seqlens_q: seqlens_q.clone(),
        seqlens_k: seqlens_k.clone(),
        alibi_slopes: Some(alibi_slopes.clone()),
        window_size_left,
        window_size_right,
        softcap: None,
        unpadded_lse: true,
    };
    q.apply_op3(k, v, op)
}

#[allow(clippy::too_many_arguments)]
pub fn flash_attn_varlen_alibi_windowed_softcap(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    alibi_slopes: Option<&Tensor>,
    seqlens_q: &Tensor,
    seqlens_k: &Tensor,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    softmax_scale: f32,
    window_size_left: Option<usize>,
    window_size_right: Option<usize>,
    softcap: f32,
) -> Result<Tensor> {
    let op = FlashAttnVarLen {
        softmax_scale,
        max_seqlen_q,
        max_seqlen_k,
        seqlens_q: seqlens_q.clone(),
        seqlens_k: seqlens_k.clone(),
        alibi_slopes: alibi_slopes.cloned(),
        window_size_left,
        window_size_right,
        softcap: Some(softcap),
        unpadded_lse: true,
    };
    q.apply_op3(k, v, op)
}

/// Same as [`flash_attn_varlen`] but also returns the log-sum-exp of the attention logits.
///
/// With `unpadded_lse` the lse has shape `(num_heads_q, total_q)`, otherwise
/// `(batch_size, num_heads_q, max_seqlen_q)` where the slots past the end of a sequence hold
/// `-inf`.
#[allow(clippy::too_many_arguments)]
pub fn flash_attn_varlen_with_lse(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    seqlens_q: &Tensor,
    seqlens_k: &Tensor,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    softmax_scale: f32,
    causal: bool,
    unpadded_lse: bool,
) -> Result<(Tensor, Tensor)> {
    let op = FlashAttnVarLen {
        softmax_scale,
        max_seqlen_q,
        max_seqlen_k,
        seqlens_q: seqlens_q.clone(),
        seqlens_k: seqlens_k.clone(),
        alibi_slopes: None,
        window_size_left: None,
        window_size_right: if causal { Some(0) } else { None },
        softcap: None,
        unpadded_lse,
    };
    op.forward_with_lse(q, k, v)
}
