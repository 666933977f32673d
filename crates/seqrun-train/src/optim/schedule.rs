//! Learning rate values and schedules.

use seqrun_core::{DecayConfig, ParamsConfig};

/// A learning rate that is either a constant or resolved from the optimizer step.
#[derive(Debug, Clone, PartialEq)]
pub enum LearningRate {
    Constant(f64),
    /// Noam decay scaled by the base learning rate.
    Noam {
        scale: f64,
        model_dim: usize,
        warmup_steps: usize,
    },
    /// Warmup-stable-decay scaled by the base learning rate.
    Wsd {
        base: f64,
        warmup_steps: usize,
        total_steps: usize,
        decay_start_frac: f64,
        min_lr_frac: f64,
    },
}

impl LearningRate {
    pub fn from_params(params: &ParamsConfig) -> Self {
        match params.decay {
            None => LearningRate::Constant(params.learning_rate),
            Some(DecayConfig::Noam {
                model_dim,
                warmup_steps,
            }) => LearningRate::Noam {
                scale: params.learning_rate,
                model_dim,
                warmup_steps,
            },
            Some(DecayConfig::Wsd {
                warmup_steps,
                total_steps,
                decay_start_frac,
                min_lr_frac,
            }) => LearningRate::Wsd {
                base: params.learning_rate,
                warmup_steps,
                total_steps,
                decay_start_frac,
                min_lr_frac,
            },
        }
    }

    pub fn is_schedule(&self) -> bool {
        !matches!(self, LearningRate::Constant(_))
    }

    /// Resolve the learning rate at `step`.
    pub fn at(&self, step: usize) -> f64 {
        match *self {
            LearningRate::Constant(lr) => lr,
            LearningRate::Noam {
                scale,
                model_dim,
                warmup_steps,
            } => scale * noam_schedule(step, model_dim, warmup_steps),
            LearningRate::Wsd {
                base,
                warmup_steps,
                total_steps,
                decay_start_frac,
                min_lr_frac,
            } => {
                base * wsd_schedule(step, warmup_steps, total_steps, decay_start_frac, min_lr_frac)
            }
        }
    }
}

/// Noam decay: `dim^-0.5 * min(step^-0.5, step * warmup^-1.5)`.
///
/// Step 0 is treated as step 1.
pub fn noam_schedule(step: usize, model_dim: usize, warmup_steps: usize) -> f64 {
    let step = step.max(1) as f64;
    let warmup = warmup_steps.max(1) as f64;
    (model_dim.max(1) as f64).powf(-0.5) * step.powf(-0.5).min(step * warmup.powf(-1.5))
}

/// WSD learning rate multiplier.
///
/// Returns a value in [min_lr_frac, 1.0]:
/// - Warmup phase: linear ramp from 0 to 1 over `warmup_steps`
/// - Stable phase: constant 1.0
/// - Decay phase: cosine anneal from 1.0 to `min_lr_frac`
pub fn wsd_schedule(
    step: usize,
    warmup_steps: usize,
    total_steps: usize,
    decay_start_frac: f64,
    min_lr_frac: f64,
) -> f64 {
    if step < warmup_steps {
        return step as f64 / warmup_steps.max(1) as f64;
    }

    let decay_start = (total_steps as f64 * decay_start_frac) as usize;
    if step < decay_start {
        return 1.0;
    }

    let decay_steps = total_steps.saturating_sub(decay_start).max(1);
    let progress = ((step - decay_start) as f64 / decay_steps as f64).min(1.0);
    min_lr_frac + 0.5 * (1.0 - min_lr_frac) * (1.0 + (std::f64::consts::PI * progress).cos())
}
