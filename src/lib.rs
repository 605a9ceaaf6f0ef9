//! VAE/GAN hybrid training core on Candle.
//!
//! This crate trains an encoder, a decoder/generator and a discriminator
//! jointly:
//! - KL regularisation of the encoder's diagonal-Gaussian posterior
//! - Feature-matching reconstruction loss on a designated discriminator layer
//! - Standard sigmoid cross-entropy adversarial losses
//! - An adaptive discriminator learning rate (`D_prop`) recomputed every step
//!   from the generator/discriminator loss gap
//!
//! The three composite losses come from a single forward pass; each is
//! differentiated separately and applied only to its own sub-network by its
//! own Adam optimizer.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use vaegan_rs::{VaeGan, VaeGanConfig};
//!
//! let device = Device::Cpu;
//! let config = VaeGanConfig::conv_32x32(16).with_sig_mult(10.0);
//! let mut model = VaeGan::new(config, &device).unwrap();
//!
//! let batch = Tensor::rand(0.0f32, 1.0, (8, 1, 32, 32), &device).unwrap();
//! let losses = model.train_net(&batch).unwrap();
//! println!("d_prop = {}", losses.d_prop);
//! ```

pub mod config;
pub mod error;
pub mod layers;
pub mod loss;
pub mod model;
pub mod networks;
pub mod optimizer;
pub mod prob;
pub mod trainer;

pub use config::{AdamSettings, HyperParams, OptimizerSettings, VaeGanConfig};
pub use error::{VaeGanError, VaeGanResult};
pub use layers::{LayerSpec, LayerStack};
pub use loss::{feature_matching_loss, gan_loss, LossBundle, LossHistory, LossValues};
pub use model::VaeGan;
pub use networks::{Decoder, Discriminator, Encoder};
pub use optimizer::{Adam, OptimizerSet};
pub use prob::{log_normal_pdf, sigmoid, standard_log_normal_pdf, DiagonalGaussian};
pub use trainer::{Gradients, SubnetGradients};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{HyperParams, VaeGanConfig};
    pub use crate::error::{VaeGanError, VaeGanResult};
    pub use crate::layers::LayerSpec;
    pub use crate::loss::{LossHistory, LossValues};
    pub use crate::model::VaeGan;
    pub use crate::trainer::Gradients;
}
