//! Parameter count summaries logged around injection.

use std::collections::HashSet;
use std::fmt;

use crate::param::Parameter;

/// Total, trainable and frozen parameter counts of a model.
///
/// Parameters that share storage (tied adapters) are counted once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterSummary {
    /// All scalar parameters.
    pub total: usize,
    /// Scalars the optimizer updates.
    pub trainable: usize,
    /// Scalars held fixed.
    pub frozen: usize,
}

impl ParameterSummary {
    /// Summarize a set of parameters.
    pub fn from_parameters<'a>(params: impl IntoIterator<Item = &'a Parameter>) -> Self {
        let mut seen = HashSet::new();
        let mut summary = Self::default();
        for param in params {
            if !seen.insert(param.tensor().id()) {
                continue;
            }
            let count = param.elem_count();
            summary.total += count;
            if param.is_trainable() {
                summary.trainable += count;
            } else {
                summary.frozen += count;
            }
        }
        summary
    }
}

impl fmt::Display for ParameterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {} | trainable {} | frozen {}",
            format_parameter_count(self.total),
            format_parameter_count(self.trainable),
            format_parameter_count(self.frozen)
        )
    }
}

/// Format parameter count with appropriate units.
///
/// # Returns
/// Human-readable string (e.g., "12.3K", "1.5M", "2.1B")
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_format_parameter_count() {
        assert_eq!(format_parameter_count(100), "100");
        assert_eq!(format_parameter_count(1_234), "1.23K");
        assert_eq!(format_parameter_count(12_345_678), "12.35M");
        assert_eq!(format_parameter_count(1_234_567_890), "1.23B");
    }

    #[test]
    fn test_summary_counts_shared_storage_once() -> crate::Result<()> {
        let mut frozen = Parameter::new(&Tensor::zeros((4, 4), DType::F32, &Device::Cpu)?)?;
        frozen.set_trainable(false);
        let trainable = Parameter::new(&Tensor::zeros(8, DType::F32, &Device::Cpu)?)?;
        let tied = trainable.clone();

        let summary = ParameterSummary::from_parameters([&frozen, &trainable, &tied]);
        assert_eq!(summary.total, 24);
        assert_eq!(summary.trainable, 8);
        assert_eq!(summary.frozen, 16);
        assert_eq!(summary.to_string(), "total 24 | trainable 8 | frozen 16");
        Ok(())
    }
}
