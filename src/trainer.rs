//! Gradient computation and optimizer coordination.
//!
//! One forward pass feeds three backward passes. Each backward pass is
//! queried only for the parameters of its own sub-network, so the encoder is
//! moved by `enc_loss` alone, the decoder by `dec_loss` alone and the
//! discriminator by `disc_loss` alone.

use std::collections::HashMap;

use candle_core::{backprop::GradStore, Tensor};
use candle_nn::VarMap;

use crate::error::{VaeGanError, VaeGanResult};
use crate::loss::LossValues;
use crate::model::VaeGan;
use crate::optimizer::OptimizerSet;

/// Gradients for one sub-network, keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct SubnetGradients {
    grads: HashMap<String, Tensor>,
}

impl SubnetGradients {
    /// Pick the gradients of `var_map`'s parameters out of `store`.
    fn collect(store: &GradStore, var_map: &VarMap) -> VaeGanResult<Self> {
        let data = var_map
            .data()
            .lock()
            .map_err(|_| VaeGanError::training("parameter map lock poisoned"))?;
        let grads = data
            .iter()
            .filter_map(|(name, var)| store.get(var).map(|g| (name.clone(), g.clone())))
            .collect();
        Ok(Self { grads })
    }

    /// Gradient of parameter `name`, if it received one.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    /// Parameter names with a gradient.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.grads.keys().map(String::as_str)
    }

    /// Number of parameters with a gradient.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    /// Whether no parameter received a gradient.
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// The name-keyed map an optimizer step consumes.
    pub fn as_map(&self) -> &HashMap<String, Tensor> {
        &self.grads
    }

    /// Same names, all-zero gradients.
    pub fn zeroed(&self) -> VaeGanResult<Self> {
        let mut grads = HashMap::with_capacity(self.grads.len());
        for (name, g) in &self.grads {
            grads.insert(name.clone(), g.zeros_like()?);
        }
        Ok(Self { grads })
    }

    /// L2 norm over every gradient.
    pub fn global_norm(&self) -> VaeGanResult<f32> {
        let mut sq = 0.0f32;
        for g in self.grads.values() {
            sq += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
        Ok(sq.sqrt())
    }
}

/// Gradients of the three composite losses plus the loss values of the
/// forward pass that produced them.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub encoder: SubnetGradients,
    pub decoder: SubnetGradients,
    pub discriminator: SubnetGradients,
    pub losses: LossValues,
    /// `D_prop` of the same forward pass, at full precision.
    pub d_prop: f64,
}

impl VaeGan {
    /// Run one loss composition and differentiate each composite loss with
    /// respect to its own sub-network only.
    pub fn compute_gradients(&mut self, x: &Tensor) -> VaeGanResult<Gradients> {
        let bundle = self.compute_loss(x)?;
        let losses = bundle.values()?;

        let enc_store = bundle.enc_loss.backward()?;
        let dec_store = bundle.dec_loss.backward()?;
        let disc_store = bundle.disc_loss.backward()?;

        Ok(Gradients {
            encoder: SubnetGradients::collect(&enc_store, self.encoder.var_map())?,
            decoder: SubnetGradients::collect(&dec_store, self.decoder.var_map())?,
            discriminator: SubnetGradients::collect(&disc_store, self.discriminator.var_map())?,
            losses,
            d_prop: bundle.d_prop,
        })
    }

    /// Apply each gradient set to its own parameters with its own optimizer.
    ///
    /// The discriminator's learning rate is `lr_base_disc * D_prop`, where
    /// `D_prop` comes from the forward pass that produced `gradients`.
    pub fn apply_gradients(&mut self, gradients: &Gradients) -> VaeGanResult<()> {
        if !(gradients.d_prop > 0.0 && gradients.d_prop < 1.0) {
            return Err(VaeGanError::training(format!(
                "D_prop {} outside (0, 1)",
                gradients.d_prop
            )));
        }
        let disc_lr = self.config.hyper.lr_base_disc * gradients.d_prop;

        if self.optimizers.is_none() {
            tracing::info!(
                "Initializing optimizers (lr_base_gen={}, lr_base_disc={})",
                self.config.hyper.lr_base_gen,
                self.config.hyper.lr_base_disc
            );
            self.optimizers = Some(OptimizerSet::new(&self.config.hyper, &self.config.optimizers));
        }
        let optimizers = self
            .optimizers
            .as_mut()
            .ok_or_else(|| VaeGanError::training("optimizers not initialized"))?;

        optimizers
            .encoder
            .step(self.encoder.var_map(), gradients.encoder.as_map())?;
        optimizers
            .decoder
            .step(self.decoder.var_map(), gradients.decoder.as_map())?;
        optimizers.discriminator.set_learning_rate(disc_lr);
        optimizers
            .discriminator
            .step(self.discriminator.var_map(), gradients.discriminator.as_map())?;

        Ok(())
    }

    /// One training step: compute and apply gradients for all three
    /// sub-networks. Returns the loss values of the step's forward pass.
    pub fn train_net(&mut self, x: &Tensor) -> VaeGanResult<LossValues> {
        let gradients = self.compute_gradients(x)?;
        self.apply_gradients(&gradients)?;
        self.step += 1;

        let l = &gradients.losses;
        tracing::debug!(
            step = self.step,
            d_prop = l.d_prop,
            latent = l.latent_loss,
            feature = l.discrim_layer_recon_loss,
            gen_fake = l.gen_fake_loss,
            disc_fake = l.disc_fake_loss,
            disc_real = l.disc_real_loss,
            "train step"
        );
        if !l.is_finite() {
            tracing::warn!(step = self.step, "non-finite loss value; consider lowering sig_mult or learning rates");
        }

        Ok(gradients.losses)
    }

    /// Optimizers, once the first gradient application has built them.
    pub fn optimizers(&self) -> Option<&OptimizerSet> {
        self.optimizers.as_ref()
    }
}
