//! Model hyperparameters as stored in every part file.

use llama_engine::{LlamaError, Result};

/// Hyperparameters block. On disk every field is an `i32`; in memory the
/// dimensions are validated and held as `usize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HParams {
    pub n_vocab: usize,
    pub n_embd: usize,
    pub n_mult: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_rot: usize,
    /// Dominant weight type: 0 = f32, 1 = f16, 2 = q4_0, 3 = q4_1.
    pub ftype: i32,
}

impl HParams {
    /// Build from the raw on-disk fields, rejecting anything a forward pass
    /// could not run with.
    pub fn from_raw(raw: [i32; 7]) -> Result<Self> {
        let [n_vocab, n_embd, n_mult, n_head, n_layer, n_rot, ftype] = raw;
        let hparams = Self {
            n_vocab: positive("n_vocab", n_vocab)?,
            n_embd: positive("n_embd", n_embd)?,
            n_mult: positive("n_mult", n_mult)?,
            n_head: positive("n_head", n_head)?,
            n_layer: positive("n_layer", n_layer)?,
            n_rot: usize::try_from(n_rot)
                .map_err(|_| LlamaError::Format(format!("n_rot must be non-negative, got {n_rot}")))?,
            ftype,
        };
        hparams.validate()?;
        Ok(hparams)
    }

    /// The on-disk field order.
    pub fn to_raw(&self) -> [i32; 7] {
        [
            self.n_vocab as i32,
            self.n_embd as i32,
            self.n_mult as i32,
            self.n_head as i32,
            self.n_layer as i32,
            self.n_rot as i32,
            self.ftype,
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_embd % self.n_head != 0 {
            return Err(LlamaError::Format(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        if self.n_rot % 2 != 0 || self.n_rot > self.head_dim() {
            return Err(LlamaError::Format(format!(
                "n_rot {} must be even and at most head_dim {}",
                self.n_rot,
                self.head_dim()
            )));
        }
        if self.to_raw().iter().any(|&v| v < 0) {
            return Err(LlamaError::Format("hyperparameter exceeds i32 range".into()));
        }
        Ok(())
    }

    /// Feed-forward width: `2/3 * 4 * n_embd` rounded up to a multiple of
    /// `n_mult`.
    pub fn n_ff(&self) -> usize {
        (2 * (4 * self.n_embd) / 3).div_ceil(self.n_mult) * self.n_mult
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Number of part files a checkpoint of this width ships in.
    pub fn default_n_parts(&self) -> usize {
        match self.n_embd {
            4096 => 1,
            5120 => 2,
            6656 => 4,
            8192 => 8,
            _ => 1,
        }
    }
}

fn positive(field: &str, value: i32) -> Result<usize> {
    if value <= 0 {
        return Err(LlamaError::Format(format!(
            "{field} must be positive, got {value}"
        )));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llama_7b() -> HParams {
        HParams::from_raw([32000, 4096, 256, 32, 32, 128, 1]).unwrap()
    }

    #[test]
    fn n_ff_matches_published_widths() {
        assert_eq!(llama_7b().n_ff(), 11008);
        let h13 = HParams::from_raw([32000, 5120, 256, 40, 40, 128, 1]).unwrap();
        assert_eq!(h13.n_ff(), 13824);
    }

    #[test]
    fn default_parts_by_width() {
        assert_eq!(llama_7b().default_n_parts(), 1);
        let mut h = llama_7b();
        for (n_embd, parts) in [(5120, 2), (6656, 4), (8192, 8), (64, 1)] {
            h.n_embd = n_embd;
            assert_eq!(h.default_n_parts(), parts);
        }
    }

    #[test]
    fn raw_roundtrip() {
        let h = llama_7b();
        assert_eq!(HParams::from_raw(h.to_raw()).unwrap(), h);
        assert_eq!(h.head_dim(), 128);
    }

    #[test]
    fn rejects_degenerate_values() {
        assert!(HParams::from_raw([0, 64, 32, 4, 1, 16, 0]).is_err());
        assert!(HParams::from_raw([10, 64, 32, 5, 1, 0, 0]).is_err());
        assert!(HParams::from_raw([10, 64, 32, 4, 1, 3, 0]).is_err());
        assert!(HParams::from_raw([10, 64, 32, 4, 1, 18, 0]).is_err());
        assert!(HParams::from_raw([10, 64, 32, 4, 1, -2, 0]).is_err());
    }
}
