//! Context configuration.
//!
//! [`ContextParams`] is constructed once through [`ContextParamsBuilder`],
//! validated at `build()`, and never mutated afterwards.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::progress::LoadProgress;
use crate::{LlamaError, Result};

/// Storage precision of the key/value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvPrecision {
    F16,
    F32,
}

impl KvPrecision {
    pub fn bytes_per_element(self) -> usize {
        match self {
            KvPrecision::F16 => 2,
            KvPrecision::F32 => 4,
        }
    }
}

impl fmt::Display for KvPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvPrecision::F16 => write!(f, "f16"),
            KvPrecision::F32 => write!(f, "f32"),
        }
    }
}

/// Immutable configuration for loading a model and creating a context.
#[derive(Clone)]
pub struct ContextParams {
    n_ctx: usize,
    n_parts: Option<usize>,
    seed: Option<u64>,
    kv_precision: KvPrecision,
    logits_all: bool,
    vocab_only: bool,
    use_mlock: bool,
    embedding: bool,
    progress: Option<Arc<dyn LoadProgress>>,
}

impl ContextParams {
    pub fn builder() -> ContextParamsBuilder {
        ContextParamsBuilder::default()
    }

    /// Context length: maximum number of positions held by the KV cache.
    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    /// Part count override; `None` derives it from the model's embedding size.
    pub fn n_parts(&self) -> Option<usize> {
        self.n_parts
    }

    /// RNG seed; `None` seeds from the clock at context creation.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn kv_precision(&self) -> KvPrecision {
        self.kv_precision
    }

    /// Keep logits for every evaluated position, not only the last.
    pub fn logits_all(&self) -> bool {
        self.logits_all
    }

    pub fn vocab_only(&self) -> bool {
        self.vocab_only
    }

    pub fn use_mlock(&self) -> bool {
        self.use_mlock
    }

    /// Embedding mode: fill the embedding buffer on every eval.
    pub fn embedding(&self) -> bool {
        self.embedding
    }

    pub fn progress(&self) -> Option<&Arc<dyn LoadProgress>> {
        self.progress.as_ref()
    }
}

impl Default for ContextParams {
    fn default() -> Self {
        ContextParamsBuilder::default().unvalidated()
    }
}

impl fmt::Debug for ContextParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextParams")
            .field("n_ctx", &self.n_ctx)
            .field("n_parts", &self.n_parts)
            .field("seed", &self.seed)
            .field("kv_precision", &self.kv_precision)
            .field("logits_all", &self.logits_all)
            .field("vocab_only", &self.vocab_only)
            .field("use_mlock", &self.use_mlock)
            .field("embedding", &self.embedding)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Builder for [`ContextParams`]. Defaults:
/// 512 positions, f16 KV cache, last-position logits only.
#[derive(Clone)]
pub struct ContextParamsBuilder {
    n_ctx: usize,
    n_parts: Option<usize>,
    seed: Option<u64>,
    kv_precision: KvPrecision,
    logits_all: bool,
    vocab_only: bool,
    use_mlock: bool,
    embedding: bool,
    progress: Option<Arc<dyn LoadProgress>>,
}

impl Default for ContextParamsBuilder {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_parts: None,
            seed: None,
            kv_precision: KvPrecision::F16,
            logits_all: false,
            vocab_only: false,
            use_mlock: false,
            embedding: false,
            progress: None,
        }
    }
}

impl ContextParamsBuilder {
    pub fn n_ctx(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn n_parts(mut self, n_parts: usize) -> Self {
        self.n_parts = Some(n_parts);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn kv_precision(mut self, precision: KvPrecision) -> Self {
        self.kv_precision = precision;
        self
    }

    pub fn logits_all(mut self, enabled: bool) -> Self {
        self.logits_all = enabled;
        self
    }

    pub fn vocab_only(mut self, enabled: bool) -> Self {
        self.vocab_only = enabled;
        self
    }

    pub fn use_mlock(mut self, enabled: bool) -> Self {
        self.use_mlock = enabled;
        self
    }

    pub fn embedding(mut self, enabled: bool) -> Self {
        self.embedding = enabled;
        self
    }

    pub fn progress(mut self, observer: Arc<dyn LoadProgress>) -> Self {
        self.progress = Some(observer);
        self
    }

    /// Validate every option and freeze the configuration.
    pub fn build(self) -> Result<ContextParams> {
        if self.n_ctx == 0 {
            return Err(LlamaError::InvalidArgument(
                "n_ctx must be greater than zero".into(),
            ));
        }
        if self.n_parts == Some(0) {
            return Err(LlamaError::InvalidArgument(
                "n_parts override must be at least 1".into(),
            ));
        }
        if self.n_ctx > i32::MAX as usize {
            return Err(LlamaError::InvalidArgument(format!(
                "n_ctx {} exceeds the addressable token range",
                self.n_ctx
            )));
        }
        Ok(self.unvalidated())
    }

    fn unvalidated(self) -> ContextParams {
        ContextParams {
            n_ctx: self.n_ctx,
            n_parts: self.n_parts,
            seed: self.seed,
            kv_precision: self.kv_precision,
            logits_all: self.logits_all,
            vocab_only: self.vocab_only,
            use_mlock: self.use_mlock,
            embedding: self.embedding,
            progress: self.progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let params = ContextParams::builder().build().unwrap();
        assert_eq!(params.n_ctx(), 512);
        assert_eq!(params.n_parts(), None);
        assert_eq!(params.kv_precision(), KvPrecision::F16);
        assert!(!params.logits_all());
        assert!(!params.vocab_only());
        assert!(!params.embedding());
        assert!(params.progress().is_none());
    }

    #[test]
    fn zero_context_rejected() {
        let err = ContextParams::builder().n_ctx(0).build().unwrap_err();
        assert!(matches!(err, LlamaError::InvalidArgument(_)));
    }

    #[test]
    fn zero_parts_rejected() {
        let err = ContextParams::builder().n_parts(0).build().unwrap_err();
        assert!(matches!(err, LlamaError::InvalidArgument(_)));
    }

    #[test]
    fn builder_sets_every_option() {
        let params = ContextParams::builder()
            .n_ctx(64)
            .n_parts(2)
            .seed(7)
            .kv_precision(KvPrecision::F32)
            .logits_all(true)
            .vocab_only(true)
            .use_mlock(true)
            .embedding(true)
            .progress(Arc::new(crate::NoProgress))
            .build()
            .unwrap();
        assert_eq!(params.n_ctx(), 64);
        assert_eq!(params.n_parts(), Some(2));
        assert_eq!(params.seed(), Some(7));
        assert_eq!(params.kv_precision(), KvPrecision::F32);
        assert!(params.logits_all());
        assert!(params.vocab_only());
        assert!(params.use_mlock());
        assert!(params.embedding());
        assert!(params.progress().is_some());
    }

    #[test]
    fn debug_hides_observer() {
        let params = ContextParams::default();
        let dbg = format!("{params:?}");
        assert!(dbg.contains("n_ctx: 512"));
        assert!(dbg.contains("progress: false"));
    }

    #[test]
    fn kv_precision_sizes() {
        assert_eq!(KvPrecision::F16.bytes_per_element(), 2);
        assert_eq!(KvPrecision::F32.bytes_per_element(), 4);
        assert_eq!(KvPrecision::F16.to_string(), "f16");
    }
}
