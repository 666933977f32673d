//! Gradient accumulation across micro-batches.

use candle_core::{backprop::GradStore, Tensor, Var};
use seqrun_core::{Result, RunnerError};

/// One accumulation buffer per trainable variable.
///
/// Buffers are allocated on the first call to [`GradientAccumulator::accumulate`]
/// with the shape and dtype of each variable, and are zeroed by
/// [`GradientAccumulator::reset`].
#[derive(Default)]
pub struct GradientAccumulator {
    buffers: Vec<Tensor>,
    allocated: bool,
    num_accumulated: usize,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the gradient of every variable in `vars` into its buffer.
    ///
    /// A variable without a gradient in `grads` contributes zeros.
    pub fn accumulate(&mut self, vars: &[Var], grads: &GradStore) -> Result<()> {
        if !self.allocated {
            self.buffers = vars
                .iter()
                .map(|var| var.as_tensor().zeros_like())
                .collect::<candle_core::Result<Vec<_>>>()?;
            self.allocated = true;
        }
        if vars.len() != self.buffers.len() {
            return Err(RunnerError::Candle(format!(
                "accumulator holds {} buffers but received {} variables",
                self.buffers.len(),
                vars.len()
            )));
        }

        for (buffer, var) in self.buffers.iter_mut().zip(vars) {
            if let Some(grad) = grads.get(var.as_tensor()) {
                *buffer = (&*buffer + grad.to_dtype(buffer.dtype())?)?;
            }
        }
        self.num_accumulated += 1;
        Ok(())
    }

    /// Accumulated gradients aligned with the variables passed to `accumulate`.
    pub fn gradients(&self) -> &[Tensor] {
        &self.buffers
    }

    /// Micro-batches accumulated since the last reset.
    pub fn num_accumulated(&self) -> usize {
        self.num_accumulated
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Zero every buffer and the micro-batch count. The buffer count is unchanged.
    pub fn reset(&mut self) -> Result<()> {
        for buffer in self.buffers.iter_mut() {
            *buffer = buffer.zeros_like()?;
        }
        self.num_accumulated = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vars() -> Result<(VarMap, Vec<Var>)> {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "a", candle_nn::Init::Const(1.0))?;
        vb.get_with_hints((2, 2), "b", candle_nn::Init::Const(2.0))?;
        let vars = crate::optim::named_variables(&varmap)?
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        Ok((varmap, vars))
    }

    #[test]
    fn test_sum_of_micro_batch_gradients() -> Result<()> {
        let (_varmap, vars) = vars()?;
        let mut acc = GradientAccumulator::new();
        assert!(!acc.is_allocated());

        // loss_k = k * sum(a) + sum(b) gives grad(a) = k, grad(b) = 1.
        for k in 1..=3 {
            let loss = ((vars[0].as_tensor().sum_all()? * k as f64)?
                + vars[1].as_tensor().sum_all()?)?;
            acc.accumulate(&vars, &loss.backward()?)?;
        }

        assert_eq!(acc.len(), 2);
        assert_eq!(acc.num_accumulated(), 3);
        assert_eq!(acc.gradients()[0].to_vec1::<f32>()?, vec![6.0, 6.0, 6.0]);
        assert_eq!(
            acc.gradients()[1].to_vec2::<f32>()?,
            vec![vec![3.0, 3.0], vec![3.0, 3.0]]
        );

        acc.reset()?;
        assert_eq!(acc.len(), 2);
        assert_eq!(acc.num_accumulated(), 0);
        for buffer in acc.gradients() {
            assert_eq!(buffer.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_missing_gradient_adds_zeros() -> Result<()> {
        let (_varmap, vars) = vars()?;
        let mut acc = GradientAccumulator::new();
        let loss = vars[0].as_tensor().sum_all()?;
        acc.accumulate(&vars, &loss.backward()?)?;

        assert_eq!(acc.gradients()[0].to_vec1::<f32>()?, vec![1.0, 1.0, 1.0]);
        assert_eq!(acc.gradients()[1].dims(), &[2, 2]);
        assert_eq!(acc.gradients()[1].sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_variable_count_mismatch() -> Result<()> {
        let (_varmap, vars) = vars()?;
        let mut acc = GradientAccumulator::new();
        let loss = vars[0].as_tensor().sum_all()?;
        let grads = loss.backward()?;
        acc.accumulate(&vars, &grads)?;
        assert!(acc.accumulate(&vars[..1], &grads).is_err());
        Ok(())
    }
}
