//! Adam optimizer with bias correction.

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use seqrun_core::{checkpoint_error, ParamsConfig, Result};

use super::{LearningRate, Optimizer};

/// Adam optimizer.
///
/// Update rule at iteration t (1-based):
///   1. m = beta1*m + (1-beta1)*g
///   2. v = beta2*v + (1-beta2)*g^2
///   3. p -= lr_t * (m / (1-beta1^t)) / (sqrt(v / (1-beta2^t)) + eps)
pub struct Adam {
    names: Vec<String>,
    vars: Vec<Var>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    learning_rate: LearningRate,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    iterations: usize,
}

impl Adam {
    pub fn new(named_vars: Vec<(String, Var)>, learning_rate: LearningRate, betas: (f64, f64), epsilon: f64) -> Result<Self> {
        let mut names = Vec::with_capacity(named_vars.len());
        let mut vars = Vec::with_capacity(named_vars.len());
        let mut exp_avg = Vec::with_capacity(named_vars.len());
        let mut exp_avg_sq = Vec::with_capacity(named_vars.len());
        for (name, var) in named_vars {
            exp_avg.push(var.as_tensor().zeros_like()?);
            exp_avg_sq.push(var.as_tensor().zeros_like()?);
            names.push(name);
            vars.push(var);
        }
        Ok(Self {
            names,
            vars,
            exp_avg,
            exp_avg_sq,
            learning_rate,
            beta1: betas.0,
            beta2: betas.1,
            epsilon,
            iterations: 0,
        })
    }

    /// Build from the `[params]` section.
    pub fn from_params(named_vars: Vec<(String, Var)>, params: &ParamsConfig) -> Result<Self> {
        Self::new(
            named_vars,
            LearningRate::from_params(params),
            (params.adam_beta1, params.adam_beta2),
            params.adam_epsilon,
        )
    }
}

impl Optimizer for Adam {
    fn variables(&self) -> &[Var] {
        &self.vars
    }

    fn apply_gradients(&mut self, gradients: &[Tensor]) -> Result<()> {
        if gradients.len() != self.vars.len() {
            return Err(seqrun_core::RunnerError::Candle(format!(
                "Adam expected {} gradients, got {}",
                self.vars.len(),
                gradients.len()
            )));
        }

        let t = (self.iterations + 1) as i32;
        let lr = self.learning_rate.at(self.iterations + 1);
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);

        for (i, (var, grad)) in self.vars.iter().zip(gradients).enumerate() {
            let m = ((&self.exp_avg[i] * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            let v = ((&self.exp_avg_sq[i] * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let denom = (v_hat.sqrt()? + self.epsilon)?;
            let update = ((m_hat / denom)? * lr)?;
            var.set(&var.as_tensor().sub(&update)?)?;

            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;
        }
        self.iterations += 1;
        Ok(())
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn learning_rate(&self) -> &LearningRate {
        &self.learning_rate
    }

    fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::with_capacity(self.names.len() * 2);
        for (i, name) in self.names.iter().enumerate() {
            state.insert(format!("{}/exp_avg", name), self.exp_avg[i].clone());
            state.insert(format!("{}/exp_avg_sq", name), self.exp_avg_sq[i].clone());
        }
        state
    }

    fn load_state(&mut self, tensors: &HashMap<String, Tensor>, iterations: usize) -> Result<()> {
        let mut exp_avg = Vec::with_capacity(self.vars.len());
        let mut exp_avg_sq = Vec::with_capacity(self.vars.len());
        for (name, var) in self.names.iter().zip(&self.vars) {
            for (suffix, slots) in [("exp_avg", &mut exp_avg), ("exp_avg_sq", &mut exp_avg_sq)] {
                let key = format!("{}/{}", name, suffix);
                let tensor = tensors
                    .get(&key)
                    .ok_or_else(|| checkpoint_error(format!("missing optimizer slot '{}'", key), ""))?;
                if tensor.dims() != var.as_tensor().dims() {
                    return Err(checkpoint_error(
                        format!(
                            "optimizer slot '{}' has shape {:?}, expected {:?}",
                            key,
                            tensor.dims(),
                            var.as_tensor().dims()
                        ),
                        "",
                    ));
                }
                slots.push(tensor.to_device(var.device())?.to_dtype(var.dtype())?);
            }
        }
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.iterations = iterations;
        Ok(())
    }
}
