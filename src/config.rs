//! Model and training configuration.
//!
//! Every recognised option is a named field; unknown keys are rejected when
//! a configuration is loaded from YAML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{VaeGanError, VaeGanResult};
use crate::layers::{infer_shapes, LayerSpec};

/// Scalar hyperparameters of the composite loss and learning rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HyperParams {
    /// Weight on the approximate-posterior log-density in the KL term.
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Learning rate of the encoder and decoder optimizers.
    #[serde(default = "default_lr_base_gen")]
    pub lr_base_gen: f64,
    /// Base learning rate of the discriminator, scaled each step by `D_prop`.
    #[serde(default = "default_lr_base_disc")]
    pub lr_base_disc: f64,
    /// Steepness of the logistic squash producing `D_prop`.
    #[serde(default = "default_sig_mult")]
    pub sig_mult: f64,
    /// Divisor applied to the feature-matching loss.
    #[serde(default = "default_recon_loss_div")]
    pub recon_loss_div: f64,
}

fn default_beta() -> f64 {
    1.0
}
fn default_lr_base_gen() -> f64 {
    1e-3
}
fn default_lr_base_disc() -> f64 {
    1e-4
}
fn default_sig_mult() -> f64 {
    20.0
}
fn default_recon_loss_div() -> f64 {
    1.0
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            beta: default_beta(),
            lr_base_gen: default_lr_base_gen(),
            lr_base_disc: default_lr_base_disc(),
            sig_mult: default_sig_mult(),
            recon_loss_div: default_recon_loss_div(),
        }
    }
}

/// Adam moment/decay settings for one optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdamSettings {
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Decoupled weight decay; 0 gives plain Adam.
    #[serde(default)]
    pub weight_decay: f64,
}

fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-7
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

impl AdamSettings {
    fn validate(&self, name: &str) -> VaeGanResult<()> {
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(VaeGanError::invalid_config(format!(
                "optimizers.{name}: beta1 and beta2 must be in [0, 1)"
            )));
        }
        if self.eps <= 0.0 {
            return Err(VaeGanError::invalid_config(format!(
                "optimizers.{name}: eps must be > 0"
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(VaeGanError::invalid_config(format!(
                "optimizers.{name}: weight_decay must be >= 0"
            )));
        }
        Ok(())
    }
}

/// Per-sub-network optimizer overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerSettings {
    #[serde(default)]
    pub encoder: AdamSettings,
    #[serde(default)]
    pub decoder: AdamSettings,
    #[serde(default)]
    pub discriminator: AdamSettings,
}

/// Full VAEGAN configuration.
///
/// # Example
///
/// ```
/// use vaegan_rs::VaeGanConfig;
///
/// let config = VaeGanConfig::dense(16, 32, 4).with_beta(0.5).with_sig_mult(10.0);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaeGanConfig {
    /// Per-sample input shape, without the batch dimension.
    pub input_shape: Vec<usize>,
    /// Latent width.
    pub n_z: usize,
    /// Encoder layers; the last must produce `2 * n_z` features.
    pub encoder: Vec<LayerSpec>,
    /// Decoder layers; take `[n_z]`, produce `input_shape` logits.
    pub decoder: Vec<LayerSpec>,
    /// Discriminator layers; take `input_shape`, produce a realness logit.
    pub discriminator: Vec<LayerSpec>,
    /// Index of the discriminator layer whose output is the feature layer.
    pub disc_feature_layer: usize,
    #[serde(default)]
    pub hyper: HyperParams,
    #[serde(default)]
    pub optimizers: OptimizerSettings,
    /// Seed for reparameterisation noise and prior samples.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

impl VaeGanConfig {
    /// Fully connected networks over a flat `input_dim` input.
    pub fn dense(input_dim: usize, hidden: usize, n_z: usize) -> Self {
        Self {
            input_shape: vec![input_dim],
            n_z,
            encoder: vec![
                LayerSpec::Dense { units: hidden },
                LayerSpec::LeakyRelu { negative_slope: 0.2 },
                LayerSpec::Dense { units: 2 * n_z },
            ],
            decoder: vec![
                LayerSpec::Dense { units: hidden },
                LayerSpec::LeakyRelu { negative_slope: 0.2 },
                LayerSpec::Dense { units: input_dim },
            ],
            discriminator: vec![
                LayerSpec::Dense { units: hidden },
                LayerSpec::LeakyRelu { negative_slope: 0.2 },
                LayerSpec::Dense { units: 1 },
            ],
            disc_feature_layer: 1,
            hyper: HyperParams::default(),
            optimizers: OptimizerSettings::default(),
            seed: default_seed(),
        }
    }

    /// Convolutional networks for single-channel 32x32 inputs such as
    /// spectrogram patches.
    pub fn conv_32x32(n_z: usize) -> Self {
        let conv = |filters| LayerSpec::Conv2d {
            filters,
            kernel_size: 3,
            stride: 2,
            padding: 1,
        };
        let deconv = |filters| LayerSpec::ConvTranspose2d {
            filters,
            kernel_size: 4,
            stride: 2,
            padding: 1,
            output_padding: 0,
        };
        let lrelu = LayerSpec::LeakyRelu { negative_slope: 0.2 };
        Self {
            input_shape: vec![1, 32, 32],
            n_z,
            encoder: vec![
                conv(32),
                lrelu.clone(),
                conv(64),
                lrelu.clone(),
                conv(128),
                lrelu.clone(),
                LayerSpec::Flatten,
                LayerSpec::Dense { units: 2 * n_z },
            ],
            decoder: vec![
                LayerSpec::Dense { units: 128 * 4 * 4 },
                lrelu.clone(),
                LayerSpec::Reshape {
                    shape: vec![128, 4, 4],
                },
                deconv(64),
                lrelu.clone(),
                deconv(32),
                lrelu.clone(),
                deconv(1),
            ],
            discriminator: vec![
                conv(32),
                lrelu.clone(),
                conv(64),
                lrelu.clone(),
                conv(128),
                lrelu.clone(),
                LayerSpec::Flatten,
                LayerSpec::Dense { units: 1 },
            ],
            disc_feature_layer: 5,
            hyper: HyperParams::default(),
            optimizers: OptimizerSettings::default(),
            seed: default_seed(),
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> VaeGanResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a YAML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> VaeGanResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Serialise to YAML.
    pub fn to_yaml(&self) -> VaeGanResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Save as a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> VaeGanResult<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    #[must_use]
    pub fn with_beta(mut self, beta: f64) -> Self {
        self.hyper.beta = beta;
        self
    }

    #[must_use]
    pub fn with_learning_rates(mut self, lr_base_gen: f64, lr_base_disc: f64) -> Self {
        self.hyper.lr_base_gen = lr_base_gen;
        self.hyper.lr_base_disc = lr_base_disc;
        self
    }

    #[must_use]
    pub fn with_sig_mult(mut self, sig_mult: f64) -> Self {
        self.hyper.sig_mult = sig_mult;
        self
    }

    #[must_use]
    pub fn with_recon_loss_div(mut self, recon_loss_div: f64) -> Self {
        self.hyper.recon_loss_div = recon_loss_div;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check hyperparameter ranges and that the three architectures satisfy
    /// their shape contracts.
    pub fn validate(&self) -> VaeGanResult<()> {
        if self.input_shape.is_empty() || self.input_shape.contains(&0) {
            return Err(VaeGanError::invalid_config(
                "input_shape must be non-empty with positive dims",
            ));
        }
        if self.n_z == 0 {
            return Err(VaeGanError::invalid_config("n_z must be > 0"));
        }

        let h = &self.hyper;
        if !h.beta.is_finite() || h.beta < 0.0 {
            return Err(VaeGanError::invalid_config("hyper.beta must be finite and >= 0"));
        }
        if h.lr_base_gen <= 0.0 || h.lr_base_disc <= 0.0 {
            return Err(VaeGanError::invalid_config("learning rates must be > 0"));
        }
        if h.sig_mult <= 0.0 || !h.sig_mult.is_finite() {
            return Err(VaeGanError::invalid_config("hyper.sig_mult must be > 0"));
        }
        if h.recon_loss_div <= 0.0 || !h.recon_loss_div.is_finite() {
            return Err(VaeGanError::invalid_config("hyper.recon_loss_div must be > 0"));
        }

        self.optimizers.encoder.validate("encoder")?;
        self.optimizers.decoder.validate("decoder")?;
        self.optimizers.discriminator.validate("discriminator")?;

        for (name, stack) in [
            ("encoder", &self.encoder),
            ("decoder", &self.decoder),
            ("discriminator", &self.discriminator),
        ] {
            if stack.is_empty() {
                return Err(VaeGanError::invalid_config(format!("{name} has no layers")));
            }
        }

        let enc_out = infer_shapes(&self.encoder, &self.input_shape)?;
        match enc_out.last().map(Vec::as_slice) {
            Some([w]) if w % 2 != 0 => {
                return Err(VaeGanError::shape_mismatch(
                    "encoder output width divisible by 2",
                    format!("{w}"),
                ))
            }
            Some([w]) if *w == 2 * self.n_z => {}
            other => {
                return Err(VaeGanError::shape_mismatch(
                    format!("encoder output [{}]", 2 * self.n_z),
                    format!("{other:?}"),
                ))
            }
        }

        let dec_out = infer_shapes(&self.decoder, &[self.n_z])?;
        if dec_out.last() != Some(&self.input_shape) {
            return Err(VaeGanError::shape_mismatch(
                format!("decoder output {:?}", self.input_shape),
                format!("{:?}", dec_out.last()),
            ));
        }

        infer_shapes(&self.discriminator, &self.input_shape)?;
        if self.disc_feature_layer >= self.discriminator.len() {
            return Err(VaeGanError::invalid_config(format!(
                "disc_feature_layer {} out of range for {} discriminator layers",
                self.disc_feature_layer,
                self.discriminator.len()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_presets_validate() {
        assert!(VaeGanConfig::dense(16, 32, 4).validate().is_ok());
        assert!(VaeGanConfig::conv_32x32(8).validate().is_ok());
    }

    #[test]
    fn test_odd_encoder_width_rejected() {
        let mut config = VaeGanConfig::dense(16, 32, 4);
        config.encoder[2] = LayerSpec::Dense { units: 7 };
        assert!(matches!(
            config.validate(),
            Err(VaeGanError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_decoder_must_match_input() {
        let mut config = VaeGanConfig::dense(16, 32, 4);
        config.decoder[2] = LayerSpec::Dense { units: 15 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_feature_layer_in_range() {
        let mut config = VaeGanConfig::dense(16, 32, 4);
        config.disc_feature_layer = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hyperparam_ranges() {
        assert!(VaeGanConfig::dense(8, 8, 2).with_sig_mult(0.0).validate().is_err());
        assert!(VaeGanConfig::dense(8, 8, 2).with_recon_loss_div(0.0).validate().is_err());
        assert!(VaeGanConfig::dense(8, 8, 2).with_recon_loss_div(-1.0).validate().is_err());
        assert!(VaeGanConfig::dense(8, 8, 2)
            .with_recon_loss_div(f64::NAN)
            .validate()
            .is_err());
        assert!(VaeGanConfig::dense(8, 8, 2).with_recon_loss_div(0.1).validate().is_ok());
        assert!(VaeGanConfig::dense(8, 8, 2)
            .with_learning_rates(1e-3, -1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_yaml_roundtrip_and_defaults() {
        let yaml = r#"
input_shape: [4]
n_z: 1
encoder:
  - type: dense
    units: 2
decoder:
  - type: dense
    units: 4
discriminator:
  - type: dense
    units: 3
  - type: tanh
  - type: dense
    units: 1
disc_feature_layer: 1
hyper:
  sig_mult: 5.0
"#;
        let config = VaeGanConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.hyper.sig_mult, 5.0);
        assert_eq!(config.hyper.beta, 1.0);
        assert_eq!(config.seed, 42);
        assert!(config.validate().is_ok());

        let restored = VaeGanConfig::from_yaml_str(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let mut yaml = VaeGanConfig::dense(4, 4, 1).to_yaml().unwrap();
        yaml.push_str("learning_rate_typo: 0.1\n");
        assert!(matches!(
            VaeGanConfig::from_yaml_str(&yaml),
            Err(VaeGanError::Yaml(_))
        ));

        let nested = "input_shape: [4]\nn_z: 1\nencoder: []\ndecoder: []\ndiscriminator: []\ndisc_feature_layer: 0\nhyper:\n  gamma: 1.0\n";
        assert!(VaeGanConfig::from_yaml_str(nested).is_err());
    }

    #[test]
    fn test_from_file() {
        let config = VaeGanConfig::conv_32x32(16).with_seed(7);
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(config.to_yaml().unwrap().as_bytes()).unwrap();

        let loaded = VaeGanConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.seed, 7);
        assert_eq!(loaded.encoder, config.encoder);
    }
}
