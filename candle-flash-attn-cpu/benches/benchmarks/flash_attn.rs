use crate::benchmarks::BenchDevice;
use candle::{DType, Device, Result, Tensor};
use criterion::{criterion_group, Criterion};
use std::hint::black_box;
use std::time::Instant;

use rand::prelude::*;

fn make_input(rng: &mut StdRng, shape: &[usize], dtype: DType) -> Result<Tensor> {
    let len: usize = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.random_range(-1.0..1.0)).collect();
    Tensor::from_vec(data, shape, &Device::Cpu)?.to_dtype(dtype)
}

fn make_attention_inputs(
    batch_size: usize,
    seq_len_q: usize,
    seq_len_kv: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    dtype: DType,
) -> Result<(Tensor, Tensor, Tensor)> {
    let mut rng = StdRng::seed_from_u64(123);
    let q = make_input(&mut rng, &[batch_size, seq_len_q, num_heads, head_dim], dtype)?;
    let k = make_input(&mut rng, &[batch_size, seq_len_kv, num_kv_heads, head_dim], dtype)?;
    let v = make_input(&mut rng, &[batch_size, seq_len_kv, num_kv_heads, head_dim], dtype)?;
    Ok((q, k, v))
}

#[derive(Clone, Copy)]
struct Case {
    window_size_left: Option<usize>,
    window_size_right: Option<usize>,
    max_bias: Option<f32>,
    softcap: f32,
}

impl Case {
    fn causal(causal: bool) -> Self {
        Self {
            window_size_left: None,
            window_size_right: if causal { Some(0) } else { None },
            max_bias: None,
            softcap: 0.0,
        }
    }
}

fn bench_case(
    c: &mut Criterion,
    device: &Device,
    name: String,
    inputs: (Tensor, Tensor, Tensor),
    case: Case,
) {
    let (q, k, v) = inputs;
    let (_, _, num_heads, head_dim) = q.dims4().unwrap();
    let softmax_scale = 1.0 / (head_dim as f64).sqrt() as f32;
    let slopes = case.max_bias.map(|max_bias| {
        let slopes = candle_flash_attn_cpu::alibi_slopes(num_heads, max_bias);
        Tensor::new(slopes.as_slice(), device).unwrap()
    });

    let mut group = c.benchmark_group(device.bench_name(name));
    group.bench_function("flash_attn_cpu", move |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                let out = candle_flash_attn_cpu::flash_attn_alibi_windowed_softcap(
                    black_box(&q),
                    black_box(&k),
                    black_box(&v),
                    slopes.as_ref(),
                    softmax_scale,
                    case.window_size_left,
                    case.window_size_right,
                    case.softcap,
                )
                .unwrap();
                black_box(out);
            }
            device.sync().unwrap();
            start.elapsed()
        })
    });
    group.finish();
}

fn bench_varlen(c: &mut Criterion, device: &Device, dtype: DType) {
    let (hq, hk, d) = (8usize, 8usize, 64usize);
    let seq_lens = [32usize, 96, 200, 256];
    let total: usize = seq_lens.iter().sum();
    let max_seqlen = *seq_lens.iter().max().unwrap();
    let mut cu = vec![0u32];
    for len in seq_lens {
        cu.push(cu[cu.len() - 1] + len as u32);
    }

    let mut rng = StdRng::seed_from_u64(321);
    let q = make_input(&mut rng, &[total, hq, d], dtype).unwrap();
    let k = make_input(&mut rng, &[total, hk, d], dtype).unwrap();
    let v = make_input(&mut rng, &[total, hk, d], dtype).unwrap();
    let seqlens = Tensor::new(cu.as_slice(), device).unwrap();
    let softmax_scale = 1.0 / (d as f64).sqrt() as f32;

    let name = format!("flash_varlen_{dtype:?}_hq{hq}_hk{hk}_d{d}_causal");
    let mut group = c.benchmark_group(device.bench_name(name));
    group.bench_function("flash_attn_cpu", move |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                let out = candle_flash_attn_cpu::flash_attn_varlen(
                    black_box(&q),
                    black_box(&k),
                    black_box(&v),
                    &seqlens,
                    &seqlens,
                    max_seqlen,
                    max_seqlen,
                    softmax_scale,
                    true,
                )
                .unwrap();
                black_box(out);
            }
            device.sync().unwrap();
            start.elapsed()
        })
    });
    group.finish();
}

fn criterion_benchmark(c: &mut Criterion) {
    let dev = Device::Cpu;
    for dtype in [DType::F16, DType::BF16, DType::F32] {
        let (b, hq, hk, d, seq_len) = (4usize, 8usize, 8usize, 64usize, 256usize);
        bench_case(
            c,
            &dev,
            format!("flash_prefill_{dtype:?}_b{b}_hq{hq}_hk{hk}_d{d}_noncausal"),
            make_attention_inputs(b, seq_len, seq_len, hq, hk, d, dtype).unwrap(),
            Case::causal(false),
        );
        bench_case(
            c,
            &dev,
            format!("flash_prefill_{dtype:?}_b{b}_hq{hq}_hk{hk}_d{d}_causal"),
            make_attention_inputs(b, seq_len, seq_len, hq, hk, d, dtype).unwrap(),
            Case::causal(true),
        );
        bench_case(
            c,
            &dev,
            format!("flash_prefill_{dtype:?}_b{b}_hq{hq}_hk{hk}_d{d}_causal_wl64"),
            make_attention_inputs(b, seq_len, seq_len, hq, hk, d, dtype).unwrap(),
            Case {
                window_size_left: Some(64),
                ..Case::causal(true)
            },
        );

        let (b, hq, hk) = (3usize, 12usize, 4usize);
        bench_case(
            c,
            &dev,
            format!("flash_prefill_{dtype:?}_b{b}_hq{hq}_hk{hk}_d{d}_gqa_causal"),
            make_attention_inputs(b, seq_len, seq_len, hq, hk, d, dtype).unwrap(),
            Case::causal(true),
        );

        let (b, hq, hk) = (2usize, 8usize, 8usize);
        bench_case(
            c,
            &dev,
            format!("flash_prefill_{dtype:?}_b{b}_hq{hq}_hk{hk}_d{d}_alibi_softcap_causal"),
            make_attention_inputs(b, seq_len, seq_len, hq, hk, d, dtype).unwrap(),
            Case {
                max_bias: Some(8.0),
                softcap: 30.0,
                ..Case::causal(true)
            },
        );

        // Decode: one query row against a long cache, exercises the split-kv path.
        let (b, hq, hk, seq_len_kv) = (1usize, 8usize, 2usize, 4096usize);
        bench_case(
            c,
            &dev,
            format!("flash_decode_{dtype:?}_b{b}_hq{hq}_hk{hk}_d{d}_kv{seq_len_kv}"),
            make_attention_inputs(b, 1, seq_len_kv, hq, hk, d, dtype).unwrap(),
            Case::causal(true),
        );

        bench_varlen(c, &dev, dtype);
    }
}

criterion_group!(benches, criterion_benchmark);
