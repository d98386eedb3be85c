pub(crate) mod flash_attn;

use candle::{Device, Result};

pub(crate) trait BenchDevice {
    fn sync(&self) -> Result<()>;

    fn bench_name<S: Into<String>>(&self, name: S) -> String;
}

impl BenchDevice for Device {
    fn sync(&self) -> Result<()> {
        self.synchronize()
    }

    fn bench_name<S: Into<String>>(&self, name: S) -> String {
        let threads = candle_flash_attn_cpu::config::get_num_threads();
        format!("cpu{threads}_{}", name.into())
    }
}
