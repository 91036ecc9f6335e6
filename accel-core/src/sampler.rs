//! Temperature sampling over per-row logits

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::EngineError;

/// Floor applied to exponential noise before division
pub const NOISE_EPSILON: f32 = 1e-10;

/// Source of unit-exponential noise, one value per logit
pub trait NoiseSource: Send {
    fn exponential(&mut self, n: usize) -> Vec<f32>;
}

/// Exponential noise drawn from a seeded RNG by inversion
pub struct SeededNoise {
    rng: StdRng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl NoiseSource for SeededNoise {
    fn exponential(&mut self, n: usize) -> Vec<f32> {
        (0..n)
            .map(|_| {
                let u: f32 = self.rng.gen();
                -(1.0 - u).ln()
            })
            .collect()
    }
}

/// Constant noise. A value of 1.0 turns sampling into arg-max of the
/// tempered distribution.
#[derive(Debug, Clone, Copy)]
pub struct FixedNoise(pub f32);

impl NoiseSource for FixedNoise {
    fn exponential(&mut self, n: usize) -> Vec<f32> {
        vec![self.0; n]
    }
}

/// Token sampler.
///
/// Divides the softmax of the tempered logits by exponential noise and
/// takes the arg-max, which is equivalent to drawing from the distribution.
pub struct Sampler {
    noise: Box<dyn NoiseSource>,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self::with_noise(Box::new(SeededNoise::new(seed)))
    }

    pub fn with_noise(noise: Box<dyn NoiseSource>) -> Self {
        Self { noise }
    }

    /// Sample one token per row.
    ///
    /// `logits`: [batch, vocab], `temperatures`: [batch], every entry > 0.
    pub fn sample(&mut self, logits: &Tensor, temperatures: &Tensor) -> Result<Vec<u32>> {
        let (batch, vocab) = logits.dims2()?;
        let temperatures = temperatures.to_dtype(DType::F32)?;
        if temperatures.dims1()? != batch {
            return Err(EngineError::Contract(format!(
                "{} temperatures for {} rows",
                temperatures.dims1()?,
                batch
            ))
            .into());
        }
        if temperatures
            .to_vec1::<f32>()?
            .iter()
            .any(|t| !t.is_finite() || *t <= 0.0)
        {
            return Err(EngineError::Contract("sampler temperatures must be positive".into()).into());
        }

        let logits = logits.to_dtype(DType::F32)?;
        let scaled = logits.broadcast_div(&temperatures.unsqueeze(1)?)?;
        let probs = candle_nn::ops::softmax_last_dim(&scaled)?;

        let noise: Vec<f32> = self
            .noise
            .exponential(batch * vocab)
            .into_iter()
            .map(|q| q.max(NOISE_EPSILON))
            .collect();
        let noise = Tensor::from_vec(noise, (batch, vocab), logits.device())?;

        let tokens = (probs / noise)?.argmax(D::Minus1)?;
        Ok(tokens.to_vec1::<u32>()?)
    }

    /// Arg-max of raw logits, used when temperature is zero
    pub fn greedy(logits: &Tensor) -> Result<Vec<u32>> {
        let tokens = logits.to_dtype(DType::F32)?.argmax(D::Minus1)?;
        Ok(tokens.to_vec1::<u32>()?)
    }
}
