//! Train a small VAEGAN on synthetic bar images.
//!
//! Each sample is an 8x8 image with one lit row or column. Run with
//! `RUST_LOG=debug` to see per-step losses.
//!
//! ```bash
//! cargo run --example train_synthetic
//! ```

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vaegan_rs::prelude::*;

const SIDE: usize = 8;
const BATCH: usize = 32;
const STEPS: usize = 200;

fn bar_batch(rng: &mut ChaCha8Rng, device: &Device) -> VaeGanResult<Tensor> {
    let mut data = vec![0.0f32; BATCH * SIDE * SIDE];
    for b in 0..BATCH {
        let k = rng.gen_range(0..SIDE);
        let horizontal = rng.gen_bool(0.5);
        for i in 0..SIDE {
            let (r, c) = if horizontal { (k, i) } else { (i, k) };
            data[b * SIDE * SIDE + r * SIDE + c] = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (BATCH, SIDE * SIDE), device)?)
}

fn main() -> VaeGanResult<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let device = Device::Cpu;
    let config = VaeGanConfig::dense(SIDE * SIDE, 128, 4)
        .with_learning_rates(1e-3, 1e-3)
        .with_sig_mult(10.0)
        .with_recon_loss_div(0.1);
    let mut model = VaeGan::new(config, &device)?;
    let mut data_rng = ChaCha8Rng::seed_from_u64(0);
    let mut history = LossHistory::new();

    for step in 1..=STEPS {
        let x = bar_batch(&mut data_rng, &device)?;
        history.push(model.train_net(&x)?);

        if step % 50 == 0 {
            if let Some(m) = history.recent_mean(50) {
                tracing::info!(
                    "step {step}: latent {:.4} feature {:.4} gen {:.4} disc_fake {:.4} disc_real {:.4} d_prop {:.3}",
                    m.latent_loss,
                    m.discrim_layer_recon_loss,
                    m.gen_fake_loss,
                    m.disc_fake_loss,
                    m.disc_real_loss,
                    m.d_prop
                );
            }
        }
    }

    let x = bar_batch(&mut data_rng, &device)?;
    let recon = model.reconstruct(&x)?;
    let err = x.sub(&recon)?.sqr()?.mean_all()?.to_scalar::<f32>()?;
    tracing::info!("reconstruction MSE after {STEPS} steps: {err:.4}");

    println!("{}", history.to_json()?);
    Ok(())
}
