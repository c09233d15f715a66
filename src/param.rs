//! Learnable parameters.

use std::collections::BTreeMap;

use candle_core::{Tensor, Var};

use crate::error::Result;

/// Named parameters owned by one module or adapter.
pub type ParamStore = BTreeMap<String, Parameter>;

/// One learnable tensor plus its trainability flag.
///
/// Cloning a `Parameter` shares storage with the original, which is how tied
/// adapters defer to the first layer's tensors.
#[derive(Debug, Clone)]
pub struct Parameter {
    var: Var,
    trainable: bool,
}

impl Parameter {
    /// Wrap a tensor as a trainable parameter (the data is copied).
    ///
    /// # Errors
    ///
    /// Returns an error if the variable cannot be created.
    pub fn new(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            var: Var::from_tensor(&tensor.copy()?)?,
            trainable: true,
        })
    }

    /// Wrap an existing variable.
    #[must_use]
    pub fn from_var(var: Var) -> Self {
        Self {
            var,
            trainable: true,
        }
    }

    /// Current value.
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Number of scalar elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.var.elem_count()
    }

    /// Whether the optimizer should update this parameter.
    #[must_use]
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Mark as trainable or frozen.
    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Whether `self` and `other` are backed by the same storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        self.var.as_tensor().id() == other.var.as_tensor().id()
    }

    /// Overwrite the value in place, converting dtype and device as needed.
    ///
    /// Every parameter sharing this storage observes the new value.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch or if the conversion fails.
    pub fn assign(&self, value: &Tensor) -> Result<()> {
        let value = value
            .to_dtype(self.var.dtype())?
            .to_device(self.var.device())?
            .contiguous()?;
        self.var.set(&value)?;
        Ok(())
    }

    /// Detached deep copy of the current value.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    pub fn snapshot(&self) -> Result<Tensor> {
        Ok(self.var.as_tensor().copy()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_clone_shares_storage() -> Result<()> {
        let p = Parameter::new(&Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?)?;
        let q = p.clone();
        assert!(p.shares_storage_with(&q));

        q.assign(&Tensor::ones((2, 3), DType::F32, &Device::Cpu)?)?;
        assert_eq!(p.tensor().sum_all()?.to_scalar::<f32>()?, 6.0);
        Ok(())
    }

    #[test]
    fn test_snapshot_is_detached() -> Result<()> {
        let p = Parameter::new(&Tensor::zeros(4, DType::F32, &Device::Cpu)?)?;
        let snap = p.snapshot()?;
        p.assign(&Tensor::ones(4, DType::F32, &Device::Cpu)?)?;
        assert_eq!(snap.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_assign_rejects_shape_mismatch() -> Result<()> {
        let p = Parameter::new(&Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?)?;
        assert!(p.assign(&Tensor::zeros(3, DType::F32, &Device::Cpu)?).is_err());
        Ok(())
    }

    #[test]
    fn test_assign_converts_dtype() -> Result<()> {
        let p = Parameter::new(&Tensor::zeros(2, DType::F32, &Device::Cpu)?)?;
        p.assign(&Tensor::ones(2, DType::F64, &Device::Cpu)?)?;
        assert_eq!(p.tensor().dtype(), DType::F32);
        Ok(())
    }
}
