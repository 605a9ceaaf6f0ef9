//! The three sub-networks.
//!
//! Each network owns its own `VarMap`, so the encoder, decoder and
//! discriminator parameter sets are disjoint by construction.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::config::VaeGanConfig;
use crate::error::{VaeGanError, VaeGanResult};
use crate::layers::LayerStack;

fn var_builder<'a>(var_map: &'a VarMap, prefix: &str, device: &Device) -> VarBuilder<'a> {
    VarBuilder::from_varmap(var_map, DType::F32, device).pp(prefix)
}

fn parameter_count(var_map: &VarMap) -> usize {
    var_map.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Maps inputs to the parameters of a diagonal Gaussian over latent space.
pub struct Encoder {
    stack: LayerStack,
    var_map: VarMap,
    n_z: usize,
}

impl Encoder {
    /// Build the encoder stack under the `enc` prefix and check that it ends
    /// in `[2 * n_z]`.
    pub fn new(config: &VaeGanConfig, device: &Device) -> VaeGanResult<Self> {
        let var_map = VarMap::new();
        let stack = LayerStack::build(
            &config.encoder,
            &config.input_shape,
            var_builder(&var_map, "enc", device),
        )?;
        match stack.output_shape() {
            [w] if *w == 2 * config.n_z => {}
            other => {
                return Err(VaeGanError::shape_mismatch(
                    format!("encoder output [{}]", 2 * config.n_z),
                    format!("{other:?}"),
                ))
            }
        }
        Ok(Self {
            stack,
            var_map,
            n_z: config.n_z,
        })
    }

    /// Raw network output, `(batch, 2 * n_z)`.
    pub fn forward(&self, x: &Tensor) -> VaeGanResult<Tensor> {
        self.stack.forward(x)
    }

    /// Split the raw output into `(mean, logvar)` halves along the feature
    /// axis.
    pub fn encode(&self, x: &Tensor) -> VaeGanResult<(Tensor, Tensor)> {
        let out = self.forward(x)?;
        let width = out.dim(1)?;
        if width % 2 != 0 {
            return Err(VaeGanError::shape_mismatch(
                "even encoder output width",
                format!("{width}"),
            ));
        }
        let half = width / 2;
        Ok((out.narrow(1, 0, half)?, out.narrow(1, half, half)?))
    }

    /// Latent dimensionality.
    pub fn n_z(&self) -> usize {
        self.n_z
    }

    /// This network's parameters, and nothing else.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Total scalar parameters.
    pub fn parameter_count(&self) -> usize {
        parameter_count(&self.var_map)
    }
}

/// Maps latent samples to output-space logits.
pub struct Decoder {
    stack: LayerStack,
    var_map: VarMap,
}

impl Decoder {
    /// Build the decoder stack under the `dec` prefix and check that it
    /// ends in the input shape.
    pub fn new(config: &VaeGanConfig, device: &Device) -> VaeGanResult<Self> {
        let var_map = VarMap::new();
        let stack = LayerStack::build(
            &config.decoder,
            &[config.n_z],
            var_builder(&var_map, "dec", device),
        )?;
        if stack.output_shape() != config.input_shape.as_slice() {
            return Err(VaeGanError::shape_mismatch(
                format!("decoder output {:?}", config.input_shape),
                format!("{:?}", stack.output_shape()),
            ));
        }
        Ok(Self { stack, var_map })
    }

    /// Decoder logits; squashed element-wise to probabilities when
    /// `apply_sigmoid` is set.
    pub fn decode(&self, z: &Tensor, apply_sigmoid: bool) -> VaeGanResult<Tensor> {
        let logits = self.stack.forward(z)?;
        if apply_sigmoid {
            Ok(candle_nn::ops::sigmoid(&logits)?)
        } else {
            Ok(logits)
        }
    }

    /// This network's parameters, and nothing else.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Total scalar parameters.
    pub fn parameter_count(&self) -> usize {
        parameter_count(&self.var_map)
    }
}

/// Maps inputs to a realness logit plus a designated intermediate feature
/// layer.
pub struct Discriminator {
    stack: LayerStack,
    var_map: VarMap,
    feature_layer: usize,
}

impl Discriminator {
    /// Build the discriminator stack under the `disc` prefix.
    pub fn new(config: &VaeGanConfig, device: &Device) -> VaeGanResult<Self> {
        let var_map = VarMap::new();
        let stack = LayerStack::build(
            &config.discriminator,
            &config.input_shape,
            var_builder(&var_map, "disc", device),
        )?;
        if config.disc_feature_layer >= stack.len() {
            return Err(VaeGanError::invalid_config(format!(
                "disc_feature_layer {} out of range for {} layers",
                config.disc_feature_layer,
                stack.len()
            )));
        }
        Ok(Self {
            stack,
            var_map,
            feature_layer: config.disc_feature_layer,
        })
    }

    /// `(score, feature_layer)` for a batch.
    pub fn discriminate(&self, x: &Tensor) -> VaeGanResult<(Tensor, Tensor)> {
        self.stack.forward_with_tap(x, self.feature_layer)
    }

    /// Per-sample shape of the feature layer.
    pub fn feature_shape(&self) -> &[usize] {
        self.stack.shape_after(self.feature_layer).unwrap_or(&[])
    }

    /// This network's parameters, and nothing else.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Total scalar parameters.
    pub fn parameter_count(&self) -> usize {
        parameter_count(&self.var_map)
    }
}
