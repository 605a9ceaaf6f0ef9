//! Adam optimizers, one per sub-network.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use candle_nn::VarMap;

use crate::config::{AdamSettings, HyperParams, OptimizerSettings};
use crate::error::{VaeGanError, VaeGanResult};

/// Adam with optional decoupled weight decay.
///
/// Moment estimates are keyed by parameter name and created the first time a
/// gradient for that name is applied.
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    /// First moment estimates
    m: HashMap<String, Tensor>,
    /// Second moment estimates
    v: HashMap<String, Tensor>,
    /// Step counter for bias correction
    t: usize,
}

impl Adam {
    /// Create an optimizer with default moments and no weight decay.
    pub fn new(lr: f64) -> Self {
        Self::with_settings(lr, &AdamSettings::default())
    }

    /// Optimizer at rate `lr` with explicit moment and decay settings.
    pub fn with_settings(lr: f64, settings: &AdamSettings) -> Self {
        Self {
            learning_rate: lr,
            beta1: settings.beta1,
            beta2: settings.beta2,
            eps: settings.eps,
            weight_decay: settings.weight_decay,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }

    /// Current step size.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Replace the step size used by later steps.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    /// Number of steps taken.
    pub fn steps(&self) -> usize {
        self.t
    }

    /// Apply `grads` (parameter name to gradient) to the matching vars of
    /// `var_map`. Names without a gradient are left untouched.
    pub fn step(&mut self, var_map: &VarMap, grads: &HashMap<String, Tensor>) -> VaeGanResult<()> {
        self.t += 1;

        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        let data = var_map
            .data()
            .lock()
            .map_err(|_| VaeGanError::training("parameter map lock poisoned"))?;

        for (name, var) in data.iter() {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            if grad.dims() != var.dims() {
                return Err(VaeGanError::shape_mismatch(
                    format!("gradient {:?} for {name}", var.dims()),
                    format!("{:?}", grad.dims()),
                ));
            }

            let m = match self.m.get(name) {
                Some(m) => m.clone(),
                None => Tensor::zeros(var.dims(), DType::F32, var.device())?,
            };
            let v = match self.v.get(name) {
                Some(v) => v.clone(),
                None => Tensor::zeros(var.dims(), DType::F32, var.device())?,
            };

            // m = β1 * m + (1 - β1) * g
            let m_new = ((&m * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            // v = β2 * v + (1 - β2) * g²
            let v_new = ((&v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;

            // lr * m_hat / (sqrt(v_hat) + eps)
            let denom = (v_hat.sqrt()? + self.eps)?;
            let update = ((m_hat / denom)? * self.learning_rate)?;

            let w = var.as_tensor();
            let new_w = if self.weight_decay > 0.0 {
                let decay = (w * (self.learning_rate * self.weight_decay))?;
                ((w - update)? - decay)?
            } else {
                (w - update)?
            };
            var.set(&new_w)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
        }

        Ok(())
    }
}

/// The three independent optimizers.
pub struct OptimizerSet {
    pub encoder: Adam,
    pub decoder: Adam,
    pub discriminator: Adam,
}

impl OptimizerSet {
    /// Encoder and decoder run at `lr_base_gen`; the discriminator starts at
    /// `lr_base_disc` and is rescaled by `D_prop` before each step.
    pub fn new(hyper: &HyperParams, settings: &OptimizerSettings) -> Self {
        Self {
            encoder: Adam::with_settings(hyper.lr_base_gen, &settings.encoder),
            decoder: Adam::with_settings(hyper.lr_base_gen, &settings.decoder),
            discriminator: Adam::with_settings(hyper.lr_base_disc, &settings.discriminator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::Init;

    fn single_param(value: f32) -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((1,), "w", Init::Const(value as f64), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    fn read(varmap: &VarMap) -> f32 {
        varmap.all_vars()[0].as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let varmap = single_param(1.0);
        let mut opt = Adam::new(0.1);
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Tensor::new(&[2.0f32], &Device::Cpu).unwrap());

        opt.step(&varmap, &grads).unwrap();
        // Bias-corrected first step is lr * sign(g)
        assert!((read(&varmap) - 0.9).abs() < 1e-4);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_zero_gradient_leaves_param_unchanged() {
        let varmap = single_param(0.75);
        let mut opt = Adam::new(0.1);
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());

        opt.step(&varmap, &grads).unwrap();
        assert_eq!(read(&varmap), 0.75);
    }

    #[test]
    fn test_missing_gradient_skipped() {
        let varmap = single_param(0.5);
        let mut opt = Adam::new(0.1);
        opt.step(&varmap, &HashMap::new()).unwrap();
        assert_eq!(read(&varmap), 0.5);
    }

    #[test]
    fn test_gradient_shape_checked() {
        let varmap = single_param(0.5);
        let mut opt = Adam::new(0.1);
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap());
        assert!(opt.step(&varmap, &grads).is_err());
    }

    #[test]
    fn test_learning_rate_is_settable() {
        let hyper = HyperParams::default();
        let mut set = OptimizerSet::new(&hyper, &OptimizerSettings::default());
        assert_eq!(set.encoder.learning_rate(), hyper.lr_base_gen);
        assert_eq!(set.discriminator.learning_rate(), hyper.lr_base_disc);

        set.discriminator.set_learning_rate(hyper.lr_base_disc * 0.25);
        assert_eq!(set.discriminator.learning_rate(), hyper.lr_base_disc * 0.25);
    }

    #[test]
    fn test_weight_decay_shrinks_weights() {
        let varmap = single_param(1.0);
        let settings = AdamSettings {
            weight_decay: 0.5,
            ..AdamSettings::default()
        };
        let mut opt = Adam::with_settings(0.1, &settings);
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());

        opt.step(&varmap, &grads).unwrap();
        assert!((read(&varmap) - 0.95).abs() < 1e-6);
    }
}
