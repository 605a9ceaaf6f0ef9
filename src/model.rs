//! The VAEGAN model: encode/decode/discriminate wrappers and loss
//! composition.

use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::VaeGanConfig;
use crate::error::{VaeGanError, VaeGanResult};
use crate::loss::{feature_matching_loss, gan_loss, LossBundle};
use crate::networks::{Decoder, Discriminator, Encoder};
use crate::optimizer::OptimizerSet;
use crate::prob::{log_normal_pdf, sigmoid, standard_log_normal_pdf, standard_normal, DiagonalGaussian};

/// Encoder, decoder and discriminator trained jointly.
pub struct VaeGan {
    pub(crate) encoder: Encoder,
    pub(crate) decoder: Decoder,
    pub(crate) discriminator: Discriminator,
    pub(crate) config: VaeGanConfig,
    /// Discriminator-rate proportion from the latest loss composition.
    pub(crate) d_prop: Option<f64>,
    /// Built on the first gradient application.
    pub(crate) optimizers: Option<OptimizerSet>,
    pub(crate) step: usize,
    rng: ChaCha8Rng,
    device: Device,
}

impl VaeGan {
    /// Validate `config` and build the three networks.
    pub fn new(config: VaeGanConfig, device: &Device) -> VaeGanResult<Self> {
        config.validate()?;

        let encoder = Encoder::new(&config, device)?;
        let decoder = Decoder::new(&config, device)?;
        let discriminator = Discriminator::new(&config, device)?;

        tracing::info!(
            "Built VAEGAN: input {:?}, n_z {}, params enc/dec/disc = {}/{}/{}",
            config.input_shape,
            config.n_z,
            encoder.parameter_count(),
            decoder.parameter_count(),
            discriminator.parameter_count()
        );

        Ok(Self {
            encoder,
            decoder,
            discriminator,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            d_prop: None,
            optimizers: None,
            step: 0,
            device: device.clone(),
        })
    }

    /// The validated configuration the model was built from.
    pub fn config(&self) -> &VaeGanConfig {
        &self.config
    }

    /// Device holding every parameter and generated tensor.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The inference network.
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// The generative network.
    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// The adversary, which also supplies the feature layer.
    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    /// Number of completed training steps.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Total trainable parameters over all three networks.
    pub fn parameter_count(&self) -> usize {
        self.encoder.parameter_count()
            + self.decoder.parameter_count()
            + self.discriminator.parameter_count()
    }

    /// Restart the noise stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Overwrite every parameter with the matching one from `other`, which
    /// must have been built from an identical architecture.
    pub fn copy_parameters_from(&self, other: &VaeGan) -> VaeGanResult<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        let pairs = [
            (self.encoder.var_map(), other.encoder.var_map()),
            (self.decoder.var_map(), other.decoder.var_map()),
            (self.discriminator.var_map(), other.discriminator.var_map()),
        ];
        for (dst, src) in pairs {
            let dst = dst
                .data()
                .lock()
                .map_err(|_| VaeGanError::training("parameter map lock poisoned"))?;
            let src = src
                .data()
                .lock()
                .map_err(|_| VaeGanError::training("parameter map lock poisoned"))?;
            for (name, var) in dst.iter() {
                let from = src.get(name).ok_or_else(|| {
                    VaeGanError::invalid_config(format!("parameter {name} missing in source model"))
                })?;
                var.set(&from.as_tensor().copy()?)?;
            }
        }
        Ok(())
    }

    /// `(mean, logvar)` of the approximate posterior for each row of `x`.
    pub fn encode(&self, x: &Tensor) -> VaeGanResult<(Tensor, Tensor)> {
        self.encoder.encode(x)
    }

    /// The approximate posterior as a distribution object.
    pub fn dist_encode(&self, x: &Tensor) -> VaeGanResult<DiagonalGaussian> {
        let (mean, logvar) = self.encode(x)?;
        Ok(DiagonalGaussian::new(mean, logvar))
    }

    /// `noise * exp(0.5 * logvar) + mean` with fresh standard-normal noise.
    pub fn reparameterize(&mut self, mean: &Tensor, logvar: &Tensor) -> VaeGanResult<Tensor> {
        let eps = standard_normal(&mut self.rng, mean.shape().clone(), mean.device())?;
        let std = (logvar * 0.5)?.exp()?;
        Ok(eps.mul(&std)?.add(mean)?)
    }

    /// Decoder output for latent samples `z`; probabilities when
    /// `apply_sigmoid` is set, logits otherwise.
    pub fn decode(&self, z: &Tensor, apply_sigmoid: bool) -> VaeGanResult<Tensor> {
        self.decoder.decode(z, apply_sigmoid)
    }

    /// Deterministic reconstruction through the posterior mean.
    pub fn reconstruct(&self, x: &Tensor) -> VaeGanResult<Tensor> {
        let (mean, _) = self.encode(x)?;
        self.decode(&mean, true)
    }

    /// Decode `n` draws from the standard-normal prior to probabilities.
    pub fn sample(&mut self, n: usize) -> VaeGanResult<Tensor> {
        let z = standard_normal(&mut self.rng, (n, self.encoder.n_z()), &self.device)?;
        self.decode(&z, true)
    }

    /// `(score, feature_layer)` from the discriminator.
    pub fn discriminate(&self, x: &Tensor) -> VaeGanResult<(Tensor, Tensor)> {
        self.discriminator.discriminate(x)
    }

    /// Latest discriminator-rate proportion; `None` before the first loss
    /// composition.
    pub fn d_prop(&self) -> Option<f64> {
        self.d_prop
    }

    /// `lr_base_disc * D_prop`.
    pub fn disc_learning_rate(&self) -> VaeGanResult<f64> {
        let d_prop = self
            .d_prop
            .ok_or_else(|| VaeGanError::training("D_prop read before any loss computation"))?;
        Ok(self.config.hyper.lr_base_disc * d_prop)
    }

    /// One forward pass producing every loss term.
    ///
    /// Writes `D_prop` as a side effect once every term has been built;
    /// parameters are not touched. An empty batch is rejected before any
    /// noise is drawn.
    pub fn compute_loss(&mut self, x: &Tensor) -> VaeGanResult<LossBundle> {
        let hyper = self.config.hyper.clone();
        let batch = x.dim(0)?;
        if batch == 0 {
            return Err(VaeGanError::shape_mismatch(
                "batch of at least one row",
                format!("{:?}", x.dims()),
            ));
        }

        let (mean, logvar) = self.encode(x)?;
        let z = self.reparameterize(&mean, &logvar)?;
        let xg = self.decode(&z, true)?;

        let z_samp = standard_normal(&mut self.rng, (batch, self.encoder.n_z()), &self.device)?;
        let xg_samp = self.decode(&z_samp, true)?;

        let (_, ld_xg) = self.discriminate(&xg)?;
        let (d_x, ld_x) = self.discriminate(x)?;
        let (d_xg_samp, _) = self.discriminate(&xg_samp)?;

        let disc_real_loss = gan_loss(&d_x, true)?;
        let disc_fake_loss = gan_loss(&d_xg_samp, false)?;
        let gen_fake_loss = gan_loss(&d_xg_samp, true)?;

        let discrim_layer_recon_loss = feature_matching_loss(&ld_x, &ld_xg, hyper.recon_loss_div)?;

        // Read back as plain numbers: D_prop is a control signal, not a
        // differentiable term.
        let gap = disc_fake_loss.to_scalar::<f32>()? as f64 - gen_fake_loss.to_scalar::<f32>()? as f64;
        let d_prop = sigmoid(gap, 0.0, hyper.sig_mult);

        let logpz = standard_log_normal_pdf(&z, 1)?;
        let logqz_x = (log_normal_pdf(&z, &mean, &logvar, 1)? * hyper.beta)?;
        let latent_loss = logpz.sub(&logqz_x)?.mean_all()?.neg()?;

        let enc_loss = latent_loss.add(&discrim_layer_recon_loss)?;
        let dec_loss = gen_fake_loss.add(&discrim_layer_recon_loss)?;
        let disc_loss = disc_fake_loss.add(&(&disc_real_loss * d_prop)?)?;

        tracing::trace!(batch, d_prop, "loss composition complete");

        self.d_prop = Some(d_prop);
        Ok(LossBundle {
            d_prop,
            latent_loss,
            discrim_layer_recon_loss,
            gen_fake_loss,
            disc_fake_loss,
            disc_real_loss,
            enc_loss,
            dec_loss,
            disc_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> VaeGan {
        VaeGan::new(VaeGanConfig::dense(8, 16, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_reparameterize_near_zero_variance() {
        let mut model = small();
        let device = Device::Cpu;
        let mean = Tensor::new(&[[0.3f32, -1.2], [4.0, 0.0]], &device).unwrap();
        let logvar = Tensor::full(-50.0f32, (2, 2), &device).unwrap();
        let expected: Vec<f32> = mean.flatten_all().unwrap().to_vec1().unwrap();
        for _ in 0..10 {
            let z: Vec<f32> = model
                .reparameterize(&mean, &logvar)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            for (a, b) in z.iter().zip(&expected) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_reparameterize_draws_fresh_noise() {
        let mut model = small();
        let device = Device::Cpu;
        let mean = Tensor::zeros((1, 2), candle_core::DType::F32, &device).unwrap();
        let logvar = mean.zeros_like().unwrap();
        let a: Vec<f32> = model.reparameterize(&mean, &logvar).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = model.reparameterize(&mean, &logvar).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_reconstruct_is_deterministic() {
        let model = small();
        let x = Tensor::rand(0.0f32, 1.0, (3, 8), &Device::Cpu).unwrap();
        let a: Vec<f32> = model.reconstruct(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = model.reconstruct(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_sample_shape() {
        let mut model = small();
        assert_eq!(model.sample(5).unwrap().dims(), &[5, 8]);
    }

    #[test]
    fn test_dist_encode_matches_encode() {
        let model = small();
        let x = Tensor::rand(0.0f32, 1.0, (2, 8), &Device::Cpu).unwrap();
        let (mean, _) = model.encode(&x).unwrap();
        let dist = model.dist_encode(&x).unwrap();
        let a: Vec<f32> = mean.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = dist.mean().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_d_prop_written_by_compute_loss() {
        let mut model = small();
        assert!(model.d_prop().is_none());
        assert!(model.disc_learning_rate().is_err());

        let x = Tensor::rand(0.0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
        let bundle = model.compute_loss(&x).unwrap();
        assert_eq!(model.d_prop(), Some(bundle.d_prop));
        assert!(bundle.d_prop > 0.0 && bundle.d_prop < 1.0);

        let lr = model.disc_learning_rate().unwrap();
        assert_eq!(lr, model.config().hyper.lr_base_disc * bundle.d_prop);
    }

    #[test]
    fn test_composite_losses_add_up() {
        let mut model = small();
        let x = Tensor::rand(0.0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
        let v = model.compute_loss(&x).unwrap().values().unwrap();

        assert!((v.enc_loss - (v.latent_loss + v.discrim_layer_recon_loss)).abs() < 1e-4);
        assert!((v.dec_loss - (v.gen_fake_loss + v.discrim_layer_recon_loss)).abs() < 1e-4);
        assert!((v.disc_loss - (v.disc_fake_loss + v.d_prop * v.disc_real_loss)).abs() < 1e-4);
        let expected_d_prop = sigmoid(
            (v.disc_fake_loss - v.gen_fake_loss) as f64,
            0.0,
            model.config().hyper.sig_mult,
        );
        assert!((v.d_prop as f64 - expected_d_prop).abs() < 1e-4);
    }

    #[test]
    fn test_empty_batch_rejected_without_side_effects() {
        let mut model = small();
        let empty = Tensor::zeros((0, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.compute_loss(&empty),
            Err(VaeGanError::ShapeMismatch { .. })
        ));
        assert!(model.d_prop().is_none());

        // The noise stream was not advanced
        let mut reference = small();
        model.reseed(11);
        reference.reseed(11);
        model.compute_loss(&empty).unwrap_err();
        let mean = Tensor::zeros((1, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let logvar = mean.zeros_like().unwrap();
        let a: Vec<f32> = model.reparameterize(&mean, &logvar).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = reference.reparameterize(&mean, &logvar).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_failed_composition_keeps_previous_d_prop() {
        let mut model = small();
        let x = Tensor::rand(0.0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
        let first = model.compute_loss(&x).unwrap().d_prop;

        let bad = Tensor::rand(0.0f32, 1.0, (4, 7), &Device::Cpu).unwrap();
        assert!(model.compute_loss(&bad).is_err());
        assert_eq!(model.d_prop(), Some(first));
    }

    #[test]
    fn test_wrong_input_width_fails() {
        let mut model = small();
        let x = Tensor::rand(0.0f32, 1.0, (4, 7), &Device::Cpu).unwrap();
        assert!(matches!(
            model.compute_loss(&x),
            Err(VaeGanError::ShapeMismatch { .. })
        ));
    }
}
