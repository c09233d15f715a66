//! PEFT lifecycle state owned by a model.
//!
//! The phase only moves forward: `Uninitialized -> Injected -> SetupComplete`.
//! Injecting again while `Injected` is allowed and replaces the key sets.

use crate::error::{PeftError, Result};
use crate::keys::KeySet;

/// Lifecycle phase of the PEFT layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeftPhase {
    /// No adapters injected.
    #[default]
    Uninitialized,
    /// Adapters injected; serialization still covers the full model.
    Injected,
    /// Setup finished; serialization covers adapter parameters only.
    SetupComplete,
}

impl PeftPhase {
    fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Injected => "injected",
            Self::SetupComplete => "setup_complete",
        }
    }
}

/// Phase plus the key snapshots taken by the last injection.
#[derive(Debug, Clone, Default)]
pub struct PeftState {
    phase: PeftPhase,
    base_keys: KeySet,
    adapter_keys: KeySet,
}

impl PeftState {
    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> PeftPhase {
        self.phase
    }

    /// Adapters have been injected.
    #[must_use]
    pub fn use_peft(&self) -> bool {
        self.phase != PeftPhase::Uninitialized
    }

    /// Training or inference setup has finished.
    #[must_use]
    pub fn setup_complete(&self) -> bool {
        self.phase == PeftPhase::SetupComplete
    }

    /// Only adapter parameters are serialized.
    #[must_use]
    pub fn adapters_only(&self) -> bool {
        self.use_peft() && self.setup_complete()
    }

    /// Keys present before the last injection.
    #[must_use]
    pub fn base_keys(&self) -> &KeySet {
        &self.base_keys
    }

    /// Keys added by the last injection.
    #[must_use]
    pub fn adapter_keys(&self) -> &KeySet {
        &self.adapter_keys
    }

    /// Check that an injection may start.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::InvalidTransition`] once setup is complete.
    pub fn ensure_can_inject(&self) -> Result<()> {
        self.transition_check(PeftPhase::Injected)
    }

    /// Record the outcome of an injection and move to `Injected`.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::InvalidTransition`] once setup is complete.
    pub fn record_injection(&mut self, base_keys: KeySet, adapter_keys: KeySet) -> Result<()> {
        self.transition_check(PeftPhase::Injected)?;
        self.base_keys = base_keys;
        self.adapter_keys = adapter_keys;
        self.phase = PeftPhase::Injected;
        Ok(())
    }

    /// Move to `SetupComplete`. Repeating the call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::InvalidTransition`] if no adapters were injected.
    pub fn mark_setup_complete(&mut self) -> Result<()> {
        self.transition_check(PeftPhase::SetupComplete)?;
        self.phase = PeftPhase::SetupComplete;
        Ok(())
    }

    fn transition_check(&self, to: PeftPhase) -> Result<()> {
        let allowed = matches!(
            (self.phase, to),
            (PeftPhase::Uninitialized | PeftPhase::Injected, PeftPhase::Injected)
                | (PeftPhase::Injected | PeftPhase::SetupComplete, PeftPhase::SetupComplete)
        );
        if allowed {
            Ok(())
        } else {
            Err(PeftError::InvalidTransition {
                from: self.phase.name(),
                to: to.name(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() -> Result<()> {
        let mut state = PeftState::default();
        assert!(!state.use_peft());
        state.record_injection(KeySet::capture(["w"]), KeySet::capture(["a"]))?;
        assert!(state.use_peft());
        assert!(!state.adapters_only());
        state.mark_setup_complete()?;
        state.mark_setup_complete()?;
        assert!(state.adapters_only());
        assert_eq!(state.adapter_keys(), &KeySet::capture(["a"]));
        Ok(())
    }

    #[test]
    fn test_setup_before_injection_rejected() {
        let mut state = PeftState::default();
        assert!(matches!(
            state.mark_setup_complete(),
            Err(PeftError::InvalidTransition { from: "uninitialized", .. })
        ));
    }

    #[test]
    fn test_injection_after_setup_rejected() -> Result<()> {
        let mut state = PeftState::default();
        state.record_injection(KeySet::default(), KeySet::capture(["a"]))?;
        state.mark_setup_complete()?;
        assert!(state.ensure_can_inject().is_err());
        assert!(state
            .record_injection(KeySet::default(), KeySet::default())
            .is_err());
        assert_eq!(state.phase(), PeftPhase::SetupComplete);
        Ok(())
    }

    #[test]
    fn test_reinjection_replaces_keys() -> Result<()> {
        let mut state = PeftState::default();
        state.record_injection(KeySet::default(), KeySet::capture(["a"]))?;
        state.record_injection(KeySet::capture(["a"]), KeySet::capture(["b"]))?;
        assert_eq!(state.adapter_keys(), &KeySet::capture(["b"]));
        assert_eq!(state.base_keys(), &KeySet::capture(["a"]));
        Ok(())
    }
}
