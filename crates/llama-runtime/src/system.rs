//! Build and host capabilities.

use std::fmt;

use serde::Serialize;

/// CPU features the binary was compiled with, plus the host's parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub avx: bool,
    pub avx2: bool,
    pub avx512: bool,
    pub fma: bool,
    pub f16c: bool,
    pub sse3: bool,
    pub neon: bool,
    /// Hardware threads available to this process.
    pub threads: usize,
}

pub fn system_info() -> SystemInfo {
    SystemInfo {
        avx: cfg!(target_feature = "avx"),
        avx2: cfg!(target_feature = "avx2"),
        avx512: cfg!(target_feature = "avx512f"),
        fma: cfg!(target_feature = "fma"),
        f16c: cfg!(target_feature = "f16c"),
        sse3: cfg!(target_feature = "sse3"),
        neon: cfg!(target_feature = "neon"),
        threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
    }
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |b: bool| u8::from(b);
        write!(
            f,
            "AVX = {} | AVX2 = {} | AVX512 = {} | FMA = {} | F16C = {} | SSE3 = {} | NEON = {} | threads = {}",
            flag(self.avx),
            flag(self.avx2),
            flag(self.avx512),
            flag(self.fma),
            flag(self.f16c),
            flag(self.sse3),
            flag(self.neon),
            self.threads
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_at_least_one_thread() {
        let info = system_info();
        assert!(info.threads >= 1);
        let line = info.to_string();
        assert!(line.starts_with("AVX = "));
        assert!(line.ends_with(&format!("threads = {}", info.threads)));
    }

    #[test]
    fn neon_and_avx_are_exclusive() {
        let info = system_info();
        assert!(!(info.neon && info.avx));
    }
}
