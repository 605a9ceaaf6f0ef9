//! Loss primitives and the per-step loss bundle.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::VaeGanResult;

/// Mean sigmoid cross-entropy of `logits` against implicit labels.
///
/// Labels are all ones when `is_real`, all zeros otherwise. Computed from the
/// logits as `max(x, 0) - x * z + ln(1 + exp(-|x|))`, which never overflows.
/// Gradients flow back through `logits`.
pub fn gan_loss(logits: &Tensor, is_real: bool) -> VaeGanResult<Tensor> {
    let labels = if is_real {
        logits.ones_like()?
    } else {
        logits.zeros_like()?
    };
    let relu = logits.relu()?;
    // -|x| = x - 2 * relu(x)
    let neg_abs = logits.sub(&(&relu * 2.0)?)?;
    let softplus_neg_abs = (neg_abs.exp()? + 1.0)?.log()?;
    let per_elem = relu.sub(&logits.mul(&labels)?)?.add(&softplus_neg_abs)?;
    Ok(per_elem.mean_all()?)
}

/// Feature-matching loss between two discriminator feature layers: squared
/// difference averaged over the batch, then over the remaining dimensions,
/// divided by `divisor`.
pub fn feature_matching_loss(ld_x: &Tensor, ld_xg: &Tensor, divisor: f64) -> VaeGanResult<Tensor> {
    let per_feature = ld_x.sub(ld_xg)?.sqr()?.mean(0)?;
    Ok((per_feature.mean_all()? / divisor)?)
}

/// The nine outputs of one loss composition.
///
/// Every tensor is rank-0 and still attached to the graph of the forward
/// pass that produced it. `d_prop` is a plain number: it scales
/// `disc_loss` as a constant and is never differentiated.
#[derive(Debug, Clone)]
pub struct LossBundle {
    pub d_prop: f64,
    pub latent_loss: Tensor,
    pub discrim_layer_recon_loss: Tensor,
    pub gen_fake_loss: Tensor,
    pub disc_fake_loss: Tensor,
    pub disc_real_loss: Tensor,
    pub enc_loss: Tensor,
    pub dec_loss: Tensor,
    pub disc_loss: Tensor,
}

impl LossBundle {
    /// Read every term back as a plain number.
    pub fn values(&self) -> VaeGanResult<LossValues> {
        let f = |t: &Tensor| -> VaeGanResult<f32> { Ok(t.to_scalar::<f32>()?) };
        Ok(LossValues {
            d_prop: self.d_prop as f32,
            latent_loss: f(&self.latent_loss)?,
            discrim_layer_recon_loss: f(&self.discrim_layer_recon_loss)?,
            gen_fake_loss: f(&self.gen_fake_loss)?,
            disc_fake_loss: f(&self.disc_fake_loss)?,
            disc_real_loss: f(&self.disc_real_loss)?,
            enc_loss: f(&self.enc_loss)?,
            dec_loss: f(&self.dec_loss)?,
            disc_loss: f(&self.disc_loss)?,
        })
    }
}

/// Detached, serialisable copy of a [`LossBundle`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossValues {
    pub d_prop: f32,
    pub latent_loss: f32,
    pub discrim_layer_recon_loss: f32,
    pub gen_fake_loss: f32,
    pub disc_fake_loss: f32,
    pub disc_real_loss: f32,
    pub enc_loss: f32,
    pub dec_loss: f32,
    pub disc_loss: f32,
}

impl LossValues {
    /// All nine values in output order.
    pub fn as_array(&self) -> [f32; 9] {
        [
            self.d_prop,
            self.latent_loss,
            self.discrim_layer_recon_loss,
            self.gen_fake_loss,
            self.disc_fake_loss,
            self.disc_real_loss,
            self.enc_loss,
            self.dec_loss,
            self.disc_loss,
        ]
    }

    /// True when no value is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite())
    }
}

/// Per-step record of loss values, exposed as plain series for plotting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossHistory {
    records: Vec<LossValues>,
}

impl LossHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one step's values.
    pub fn push(&mut self, values: LossValues) {
        self.records.push(values);
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record in step order.
    pub fn records(&self) -> &[LossValues] {
        &self.records
    }

    /// The most recent record.
    pub fn last(&self) -> Option<&LossValues> {
        self.records.last()
    }

    fn series(&self, f: impl Fn(&LossValues) -> f32) -> Vec<f32> {
        self.records.iter().map(f).collect()
    }

    /// `D_prop` per step.
    pub fn d_prop(&self) -> Vec<f32> {
        self.series(|v| v.d_prop)
    }

    /// Latent (KL) loss per step.
    pub fn latent_loss(&self) -> Vec<f32> {
        self.series(|v| v.latent_loss)
    }

    /// Feature-matching loss per step.
    pub fn discrim_layer_recon_loss(&self) -> Vec<f32> {
        self.series(|v| v.discrim_layer_recon_loss)
    }

    /// Generator adversarial loss per step.
    pub fn gen_fake_loss(&self) -> Vec<f32> {
        self.series(|v| v.gen_fake_loss)
    }

    /// Discriminator loss on prior samples per step.
    pub fn disc_fake_loss(&self) -> Vec<f32> {
        self.series(|v| v.disc_fake_loss)
    }

    /// Discriminator loss on real data per step.
    pub fn disc_real_loss(&self) -> Vec<f32> {
        self.series(|v| v.disc_real_loss)
    }

    /// Encoder objective per step.
    pub fn enc_loss(&self) -> Vec<f32> {
        self.series(|v| v.enc_loss)
    }

    /// Decoder objective per step.
    pub fn dec_loss(&self) -> Vec<f32> {
        self.series(|v| v.dec_loss)
    }

    /// Discriminator objective per step.
    pub fn disc_loss(&self) -> Vec<f32> {
        self.series(|v| v.disc_loss)
    }

    /// Mean of every value over the last `n` records (fewer if the history
    /// is shorter). `None` when empty.
    pub fn recent_mean(&self, n: usize) -> Option<LossValues> {
        if self.records.is_empty() || n == 0 {
            return None;
        }
        let tail = &self.records[self.records.len().saturating_sub(n)..];
        let mut sums = [0.0f64; 9];
        for r in tail {
            for (s, v) in sums.iter_mut().zip(r.as_array()) {
                *s += v as f64;
            }
        }
        let k = tail.len() as f64;
        let m = sums.map(|s| (s / k) as f32);
        Some(LossValues {
            d_prop: m[0],
            latent_loss: m[1],
            discrim_layer_recon_loss: m[2],
            gen_fake_loss: m[3],
            disc_fake_loss: m[4],
            disc_real_loss: m[5],
            enc_loss: m[6],
            dec_loss: m[7],
            disc_loss: m[8],
        })
    }

    /// Serialise as pretty JSON.
    pub fn to_json(&self) -> VaeGanResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Restore from [`LossHistory::to_json`] output.
    pub fn from_json(json: &str) -> VaeGanResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
