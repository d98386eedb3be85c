//! Scheduling knobs for the cpu kernel. None of them changes the result beyond floating point
//! rounding.
use std::str::FromStr;
use std::sync::LazyLock;

/// Minimum number of `(query row, head)` pairs handled by one rayon task.
pub const DEFAULT_BLOCK_Q: usize = 64;

/// Size (in KV positions) of the blocks fed to the online softmax.
pub const DEFAULT_BLOCK_K: usize = 16;

/// Upper bound on the number of key splits per query row.
const MAX_SPLITS: usize = 128;

pub fn get_num_threads() -> usize {
    // Respond to the same environment variable as rayon.
    match env_usize("RAYON_NUM_THREADS") {
        Some(x) if x > 0 => x,
        Some(_) | None => num_cpus::get(),
    }
}

fn parse_usize(s: &str) -> Option<usize> {
    usize::from_str(s.trim()).ok()
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|s| parse_usize(&s))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub block_q: usize,
    pub block_k: usize,
    /// Number of chunks each query row's keys are split into and reduced in parallel,
    /// `0` picks a value from the amount of available parallelism.
    pub num_splits: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            block_q: DEFAULT_BLOCK_Q,
            block_k: DEFAULT_BLOCK_K,
            num_splits: 0,
        }
    }
}

static GLOBAL_CONFIG: LazyLock<KernelConfig> = LazyLock::new(KernelConfig::from_env);

impl KernelConfig {
    /// Defaults overridden by `CANDLE_FLASH_ATTN_BLOCK_Q`, `CANDLE_FLASH_ATTN_BLOCK_K` and
    /// `CANDLE_FLASH_ATTN_NUM_SPLITS`. Zero block sizes are ignored.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            block_q: env_usize("CANDLE_FLASH_ATTN_BLOCK_Q")
                .filter(|&b| b > 0)
                .unwrap_or(default.block_q),
            block_k: env_usize("CANDLE_FLASH_ATTN_BLOCK_K")
                .filter(|&b| b > 0)
                .unwrap_or(default.block_k),
            num_splits: env_usize("CANDLE_FLASH_ATTN_NUM_SPLITS").unwrap_or(default.num_splits),
        }
    }

    /// The configuration used by the tensor level ops, read once from the environment.
    pub fn global() -> &'static KernelConfig {
        &GLOBAL_CONFIG
    }

    /// How many chunks to split the keys of a query row into, given the number of rayon tasks
    /// and worker threads.
    pub(crate) fn splits_for(&self, num_units: usize, seqlen_k: usize, num_threads: usize) -> usize {
        let max_splits = seqlen_k.div_ceil(self.block_k.max(1)).clamp(1, MAX_SPLITS);
        let splits = if self.num_splits > 0 {
            self.num_splits
        } else if num_units >= num_threads {
            1
        } else {
            num_threads / num_units.max(1)
        };
        splits.clamp(1, max_splits)
    }
}
