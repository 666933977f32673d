//! Optimizer capability used by the training loop and checkpoints.

pub mod adam;
pub mod schedule;

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use seqrun_core::{Result, RunnerError};

pub use adam::Adam;
pub use schedule::{noam_schedule, wsd_schedule, LearningRate};

/// An optimizer owning an ordered set of variables.
///
/// Gradients passed to [`Optimizer::apply_gradients`] are aligned with
/// [`Optimizer::variables`].
pub trait Optimizer {
    fn variables(&self) -> &[Var];

    /// Apply one update and advance the iteration counter.
    fn apply_gradients(&mut self, gradients: &[Tensor]) -> Result<()>;

    /// Number of updates applied so far.
    fn iterations(&self) -> usize;

    fn learning_rate(&self) -> &LearningRate;

    /// Learning rate resolved at the current iteration.
    fn current_learning_rate(&self) -> f64 {
        self.learning_rate().at(self.iterations())
    }

    /// Named slot tensors persisted in checkpoints.
    fn state_tensors(&self) -> HashMap<String, Tensor>;

    /// Restore slot tensors and the iteration counter.
    fn load_state(&mut self, tensors: &HashMap<String, Tensor>, iterations: usize) -> Result<()>;
}

/// Variables of a `VarMap` sorted by name.
///
/// `VarMap` iteration order is unspecified; sorting gives every consumer the
/// same variable order.
pub fn named_variables(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| RunnerError::Candle("variable map lock poisoned".to_string()))?;
    let mut named: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(named)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_named_variables_sorted() -> Result<()> {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(2, "zeta", candle_nn::Init::Const(0.0))?;
        vb.get_with_hints(3, "alpha", candle_nn::Init::Const(0.0))?;
        vb.get_with_hints(4, "mid", candle_nn::Init::Const(0.0))?;

        let names: Vec<String> = named_variables(&varmap)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        Ok(())
    }
}
