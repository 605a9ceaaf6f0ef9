//! Probability utilities: diagonal Gaussian log-densities, seeded noise and
//! the logistic squash used for the adaptive discriminator rate.

use candle_core::{Device, Shape, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::VaeGanResult;

/// `ln(2π)`
pub const LOG_2PI: f64 = 1.837_877_066_409_345_5;

/// Log-density of `sample` under an independent Gaussian per dimension,
/// summed over `axis`:
///
/// `sum(-0.5 * ((sample - mean)^2 * exp(-logvar) + logvar + ln(2π)))`
///
/// `mean` and `logvar` must have the same shape as `sample`.
pub fn log_normal_pdf(
    sample: &Tensor,
    mean: &Tensor,
    logvar: &Tensor,
    axis: usize,
) -> VaeGanResult<Tensor> {
    let sq = sample.sub(mean)?.sqr()?;
    let scaled = sq.mul(&logvar.neg()?.exp()?)?;
    let inner = (scaled.add(logvar)? + LOG_2PI)?;
    Ok((inner * -0.5)?.sum(axis)?)
}

/// [`log_normal_pdf`] with `mean = 0` and `logvar = 0`.
pub fn standard_log_normal_pdf(sample: &Tensor, axis: usize) -> VaeGanResult<Tensor> {
    let zeros = sample.zeros_like()?;
    log_normal_pdf(sample, &zeros, &zeros, axis)
}

/// Smallest distance kept between [`sigmoid`] and either end of (0, 1).
pub const SIGMOID_MARGIN: f64 = f64::EPSILON;

/// Logistic squash `1 / (1 + exp(-mult * (x - shift)))`.
///
/// Clamped to `[SIGMOID_MARGIN, 1 - SIGMOID_MARGIN]`, so the result stays
/// strictly inside (0, 1) for every finite input.
pub fn sigmoid(x: f64, shift: f64, mult: f64) -> f64 {
    let t = mult * (x - shift);
    let y = if t >= 0.0 {
        1.0 / (1.0 + (-t).exp())
    } else {
        let e = t.exp();
        e / (1.0 + e)
    };
    y.clamp(SIGMOID_MARGIN, 1.0 - SIGMOID_MARGIN)
}

/// Draw an f32 tensor of standard-normal noise from `rng`.
pub fn standard_normal<R: Rng + ?Sized, S: Into<Shape>>(
    rng: &mut R,
    shape: S,
    device: &Device,
) -> VaeGanResult<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| StandardNormal.sample(rng))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Diagonal multivariate normal parameterised by mean and log-variance.
#[derive(Debug, Clone)]
pub struct DiagonalGaussian {
    mean: Tensor,
    logvar: Tensor,
}

impl DiagonalGaussian {
    /// Create a distribution; `mean` and `logvar` are `(batch, n_z)`.
    pub fn new(mean: Tensor, logvar: Tensor) -> Self {
        Self { mean, logvar }
    }

    /// Per-dimension mean.
    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Per-dimension log-variance.
    pub fn logvar(&self) -> &Tensor {
        &self.logvar
    }

    /// `exp(logvar)`
    pub fn variance(&self) -> VaeGanResult<Tensor> {
        Ok(self.logvar.exp()?)
    }

    /// `exp(0.5 * logvar)`
    pub fn stddev(&self) -> VaeGanResult<Tensor> {
        Ok((&self.logvar * 0.5)?.exp()?)
    }

    /// Reparameterised draw: `noise * stddev + mean`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> VaeGanResult<Tensor> {
        let noise = standard_normal(rng, self.mean.shape().clone(), self.mean.device())?;
        Ok(noise.mul(&self.stddev()?)?.add(&self.mean)?)
    }

    /// Per-row log-density of `x`.
    pub fn log_prob(&self, x: &Tensor) -> VaeGanResult<Tensor> {
        log_normal_pdf(x, &self.mean, &self.logvar, 1)
    }

    /// Per-row `KL(self || N(0, I))` in closed form:
    /// `-0.5 * sum(1 + logvar - mean^2 - exp(logvar))`.
    pub fn kl_to_standard_normal(&self) -> VaeGanResult<Tensor> {
        let inner = ((&self.logvar + 1.0)?
            .sub(&self.mean.sqr()?)?
            .sub(&self.logvar.exp()?))?;
        Ok((inner.sum(1)? * -0.5)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_log_normal_pdf_at_mean() {
        let device = Device::Cpu;
        let d = 5usize;
        for offset in [-3.0f32, 0.0, 7.5] {
            let mean = (Tensor::randn(0.0f32, 1.0, (4, d), &device).unwrap() + offset as f64).unwrap();
            let logvar = mean.zeros_like().unwrap();
            let out: Vec<f32> = log_normal_pdf(&mean, &mean, &logvar, 1)
                .unwrap()
                .to_vec1()
                .unwrap();
            let expected = (-0.5 * d as f64 * LOG_2PI) as f32;
            for v in out {
                assert!((v - expected).abs() < 1e-5, "{v} vs {expected}");
            }
        }
    }

    #[test]
    fn test_log2pi_constant() {
        assert!((LOG_2PI - (2.0 * std::f64::consts::PI).ln()).abs() < 1e-15);
    }

    #[test]
    fn test_standard_pdf_matches_explicit() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[0.5f32, -1.0], [2.0, 0.0]], &device).unwrap();
        let a: Vec<f32> = standard_log_normal_pdf(&x, 1).unwrap().to_vec1().unwrap();
        // -0.5 * (x^2 + ln 2π) summed over two dims
        let expected = [
            -0.5 * (0.25 + 1.0 + 2.0 * LOG_2PI),
            -0.5 * (4.0 + 0.0 + 2.0 * LOG_2PI),
        ];
        for (v, e) in a.iter().zip(expected) {
            assert!((*v as f64 - e).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sigmoid_midpoint_and_range() {
        assert_eq!(sigmoid(0.0, 0.0, 20.0), 0.5);
        assert_eq!(sigmoid(0.0, 0.0, 0.1), 0.5);
        for mult in [1.0, 20.0, 1e6] {
            for x in [-1e300, -1e4, -40.0, -30.0, -2.0, 0.0, 2.0, 30.0, 40.0, 1e4, 1e300] {
                let y = sigmoid(x, 0.0, mult);
                assert!(y > 0.0 && y < 1.0, "sigmoid({x}, mult={mult}) = {y}");
            }
        }
        assert_eq!(sigmoid(2.0, 0.0, 20.0), 1.0 - SIGMOID_MARGIN);
        assert_eq!(sigmoid(-40.0, 0.0, 20.0), SIGMOID_MARGIN);
        // Lower tail keeps precision until the clamp
        let y = sigmoid(-10.0, 0.0, 1.0);
        assert!((y - 4.539_786_870_243_439e-5).abs() < 1e-15);
        // Monotone in x
        assert!(sigmoid(0.1, 0.0, 20.0) > sigmoid(-0.1, 0.0, 20.0));
        // Shift moves the midpoint
        assert_eq!(sigmoid(2.0, 2.0, 5.0), 0.5);
    }

    #[test]
    fn test_standard_normal_is_seeded() {
        let device = Device::Cpu;
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        let ta: Vec<f32> = standard_normal(&mut a, 16, &device).unwrap().to_vec1().unwrap();
        let tb: Vec<f32> = standard_normal(&mut b, 16, &device).unwrap().to_vec1().unwrap();
        assert_eq!(ta, tb);

        let tc: Vec<f32> = standard_normal(&mut a, 16, &device).unwrap().to_vec1().unwrap();
        assert_ne!(ta, tc);
    }

    #[test]
    fn test_gaussian_sample_collapses_to_mean() {
        let device = Device::Cpu;
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mean = Tensor::new(&[[1.0f32, -2.0, 3.0]], &device).unwrap();
        let logvar = Tensor::full(-40.0f32, (1, 3), &device).unwrap();
        let dist = DiagonalGaussian::new(mean.clone(), logvar);
        for _ in 0..5 {
            let z = dist.sample(&mut rng).unwrap();
            let diff: f32 = z.sub(&mean).unwrap().abs().unwrap().max_keepdim(1).unwrap()
                .flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
            assert!(diff < 1e-6);
        }
    }

    #[test]
    fn test_kl_is_zero_for_standard_normal() {
        let device = Device::Cpu;
        let zeros = Tensor::zeros((2, 4), candle_core::DType::F32, &device).unwrap();
        let dist = DiagonalGaussian::new(zeros.clone(), zeros);
        let kl: Vec<f32> = dist.kl_to_standard_normal().unwrap().to_vec1().unwrap();
        assert!(kl.iter().all(|v| v.abs() < 1e-7));
    }
}
