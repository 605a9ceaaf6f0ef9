//! Configuration-supplied layer stacks.
//!
//! Encoder, decoder and discriminator architectures are not hard-coded: they
//! are described by a list of [`LayerSpec`]s in the model configuration and
//! built here into a [`LayerStack`]. Shapes are inferred per sample (without
//! the batch dimension) while building, so a stack that cannot be wired
//! together fails at construction instead of on the first batch.
//!
//! Image-like tensors use candle's `[C, H, W]` layout.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{VaeGanError, VaeGanResult};

fn default_stride() -> usize {
    1
}

/// One layer of a configured network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    /// Fully connected layer over a rank-1 input.
    Dense { units: usize },
    /// 2D convolution over a `[C, H, W]` input.
    Conv2d {
        filters: usize,
        kernel_size: usize,
        #[serde(default = "default_stride")]
        stride: usize,
        #[serde(default)]
        padding: usize,
    },
    /// 2D transposed convolution over a `[C, H, W]` input.
    ConvTranspose2d {
        filters: usize,
        kernel_size: usize,
        #[serde(default = "default_stride")]
        stride: usize,
        #[serde(default)]
        padding: usize,
        #[serde(default)]
        output_padding: usize,
    },
    /// Collapse everything after the batch dimension.
    Flatten,
    /// Reshape each sample to `shape`.
    Reshape { shape: Vec<usize> },
    Relu,
    LeakyRelu { negative_slope: f64 },
    Tanh,
    Sigmoid,
}

impl LayerSpec {
    /// Short name used in parameter paths and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dense { .. } => "dense",
            Self::Conv2d { .. } => "conv2d",
            Self::ConvTranspose2d { .. } => "conv_transpose2d",
            Self::Flatten => "flatten",
            Self::Reshape { .. } => "reshape",
            Self::Relu => "relu",
            Self::LeakyRelu { .. } => "leaky_relu",
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
        }
    }
}

fn image_dims(spec: &LayerSpec, input: &[usize]) -> VaeGanResult<(usize, usize, usize)> {
    match input {
        [c, h, w] => Ok((*c, *h, *w)),
        _ => Err(VaeGanError::shape_mismatch(
            format!("[C, H, W] input for {}", spec.kind()),
            format!("{input:?}"),
        )),
    }
}

/// Per-sample output shape of `spec` applied to an input of shape `input`.
pub fn infer_output_shape(spec: &LayerSpec, input: &[usize]) -> VaeGanResult<Vec<usize>> {
    match spec {
        LayerSpec::Dense { units } => match input {
            [_] => Ok(vec![*units]),
            _ => Err(VaeGanError::shape_mismatch(
                "rank-1 input for dense (add a flatten layer)",
                format!("{input:?}"),
            )),
        },
        LayerSpec::Conv2d {
            filters,
            kernel_size,
            stride,
            padding,
        } => {
            let (_, h, w) = image_dims(spec, input)?;
            if *stride == 0 {
                return Err(VaeGanError::invalid_config("conv2d stride must be > 0"));
            }
            let out = |d: usize| -> VaeGanResult<usize> {
                let padded = d + 2 * padding;
                if padded < *kernel_size {
                    return Err(VaeGanError::shape_mismatch(
                        format!("spatial size >= kernel {kernel_size}"),
                        format!("{padded}"),
                    ));
                }
                Ok((padded - kernel_size) / stride + 1)
            };
            Ok(vec![*filters, out(h)?, out(w)?])
        }
        LayerSpec::ConvTranspose2d {
            filters,
            kernel_size,
            stride,
            padding,
            output_padding,
        } => {
            let (_, h, w) = image_dims(spec, input)?;
            if *stride == 0 {
                return Err(VaeGanError::invalid_config(
                    "conv_transpose2d stride must be > 0",
                ));
            }
            if h == 0 || w == 0 {
                return Err(VaeGanError::shape_mismatch(
                    "non-empty spatial dims",
                    format!("{input:?}"),
                ));
            }
            let out = |d: usize| -> VaeGanResult<usize> {
                let full = (d - 1) * stride + kernel_size + output_padding;
                full.checked_sub(2 * padding).ok_or_else(|| {
                    VaeGanError::shape_mismatch(
                        format!("padding <= {}", full / 2),
                        format!("{padding}"),
                    )
                })
            };
            Ok(vec![*filters, out(h)?, out(w)?])
        }
        LayerSpec::Flatten => Ok(vec![input.iter().product()]),
        LayerSpec::Reshape { shape } => {
            let have: usize = input.iter().product();
            let want: usize = shape.iter().product();
            if have != want {
                return Err(VaeGanError::shape_mismatch(
                    format!("{want} elements for reshape to {shape:?}"),
                    format!("{have} elements in {input:?}"),
                ));
            }
            Ok(shape.clone())
        }
        LayerSpec::Relu | LayerSpec::LeakyRelu { .. } | LayerSpec::Tanh | LayerSpec::Sigmoid => {
            Ok(input.to_vec())
        }
    }
}

/// Infer the shape after each layer of `specs`, starting from `input`.
pub fn infer_shapes(specs: &[LayerSpec], input: &[usize]) -> VaeGanResult<Vec<Vec<usize>>> {
    let mut shapes = Vec::with_capacity(specs.len());
    let mut current = input.to_vec();
    for spec in specs {
        current = infer_output_shape(spec, &current)?;
        shapes.push(current.clone());
    }
    Ok(shapes)
}

enum Layer {
    Dense(Linear),
    Conv2d(Conv2d),
    ConvTranspose2d(ConvTranspose2d),
    Flatten,
    Reshape(Vec<usize>),
    Relu,
    LeakyRelu(f64),
    Tanh,
    Sigmoid,
}

impl Module for Layer {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Dense(l) => l.forward(x),
            Self::Conv2d(l) => l.forward(x),
            Self::ConvTranspose2d(l) => l.forward(x),
            Self::Flatten => x.flatten_from(1),
            Self::Reshape(shape) => {
                let mut dims = Vec::with_capacity(shape.len() + 1);
                dims.push(x.dim(0)?);
                dims.extend_from_slice(shape);
                x.reshape(dims)
            }
            Self::Relu => x.relu(),
            Self::LeakyRelu(slope) => candle_nn::ops::leaky_relu(x, *slope),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => candle_nn::ops::sigmoid(x),
        }
    }
}

/// A sequential stack of layers built from [`LayerSpec`]s.
pub struct LayerStack {
    layers: Vec<Layer>,
    input_shape: Vec<usize>,
    shapes: Vec<Vec<usize>>,
}

impl LayerStack {
    /// Build the stack, registering parameters under `vb`.
    ///
    /// Parameterised layers are named `layers.{i}.{kind}`.
    pub fn build(specs: &[LayerSpec], input_shape: &[usize], vb: VarBuilder) -> VaeGanResult<Self> {
        if specs.is_empty() {
            return Err(VaeGanError::invalid_config("layer stack must not be empty"));
        }
        let shapes = infer_shapes(specs, input_shape)?;

        let mut layers = Vec::with_capacity(specs.len());
        let mut in_shape = input_shape.to_vec();
        for (i, spec) in specs.iter().enumerate() {
            let vb = vb.pp(format!("layers.{i}.{}", spec.kind()));
            let layer = match spec {
                LayerSpec::Dense { units } => Layer::Dense(candle_nn::linear(in_shape[0], *units, vb)?),
                LayerSpec::Conv2d {
                    filters,
                    kernel_size,
                    stride,
                    padding,
                } => {
                    let cfg = Conv2dConfig {
                        padding: *padding,
                        stride: *stride,
                        ..Default::default()
                    };
                    Layer::Conv2d(candle_nn::conv2d(in_shape[0], *filters, *kernel_size, cfg, vb)?)
                }
                LayerSpec::ConvTranspose2d {
                    filters,
                    kernel_size,
                    stride,
                    padding,
                    output_padding,
                } => {
                    let cfg = ConvTranspose2dConfig {
                        padding: *padding,
                        output_padding: *output_padding,
                        stride: *stride,
                        ..Default::default()
                    };
                    Layer::ConvTranspose2d(candle_nn::conv_transpose2d(
                        in_shape[0],
                        *filters,
                        *kernel_size,
                        cfg,
                        vb,
                    )?)
                }
                LayerSpec::Flatten => Layer::Flatten,
                LayerSpec::Reshape { shape } => Layer::Reshape(shape.clone()),
                LayerSpec::Relu => Layer::Relu,
                LayerSpec::LeakyRelu { negative_slope } => Layer::LeakyRelu(*negative_slope),
                LayerSpec::Tanh => Layer::Tanh,
                LayerSpec::Sigmoid => Layer::Sigmoid,
            };
            layers.push(layer);
            in_shape.clone_from(&shapes[i]);
        }

        Ok(Self {
            layers,
            input_shape: input_shape.to_vec(),
            shapes,
        })
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stack has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Per-sample input shape.
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Per-sample output shape.
    pub fn output_shape(&self) -> &[usize] {
        self.shapes.last().map_or(self.input_shape.as_slice(), Vec::as_slice)
    }

    /// Per-sample shape after layer `idx`.
    pub fn shape_after(&self, idx: usize) -> Option<&[usize]> {
        self.shapes.get(idx).map(Vec::as_slice)
    }

    /// Check a batch against the expected per-sample input shape.
    fn check_input(&self, x: &Tensor) -> VaeGanResult<()> {
        let dims = x.dims();
        if dims.len() != self.input_shape.len() + 1 || dims[1..] != self.input_shape[..] {
            return Err(VaeGanError::shape_mismatch(
                format!("[batch, {:?}]", self.input_shape),
                format!("{dims:?}"),
            ));
        }
        Ok(())
    }

    /// Run every layer in order.
    pub fn forward(&self, x: &Tensor) -> VaeGanResult<Tensor> {
        self.check_input(x)?;
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h)?;
        }
        Ok(h)
    }

    /// Run every layer, also returning the activation after layer `tap`.
    pub fn forward_with_tap(&self, x: &Tensor, tap: usize) -> VaeGanResult<(Tensor, Tensor)> {
        if tap >= self.layers.len() {
            return Err(VaeGanError::invalid_config(format!(
                "tap index {tap} out of range for {} layers",
                self.layers.len()
            )));
        }
        self.check_input(x)?;
        let mut h = x.clone();
        let mut tapped = None;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i == tap {
                tapped = Some(h.clone());
            }
        }
        let tapped = tapped.ok_or_else(|| VaeGanError::training("feature tap not reached"))?;
        Ok((h, tapped))
    }
}
