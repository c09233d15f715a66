//! Distributed runtime queries.
//!
//! The PEFT layer never launches collectives; it only asks the surrounding
//! runtime where this process sits in the pipeline/tensor grid and toggles the
//! active virtual pipeline chunk while loading interleaved checkpoints.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Rank and topology queries answered by the distributed runtime.
pub trait ParallelState: Send + Sync {
    /// Pipeline-parallel rank of this process.
    fn pipeline_rank(&self) -> usize;

    /// Number of pipeline stages.
    fn pipeline_world_size(&self) -> usize;

    /// Tensor-parallel rank of this process.
    fn tensor_rank(&self) -> usize;

    /// Tensor-parallel group size.
    fn tensor_world_size(&self) -> usize;

    /// Number of virtual pipeline chunks, if interleaving is enabled.
    fn virtual_pipeline_world_size(&self) -> Option<usize>;

    /// Currently active virtual pipeline chunk.
    fn virtual_pipeline_rank(&self) -> usize;

    /// Select the active virtual pipeline chunk.
    fn set_virtual_pipeline_rank(&self, rank: usize);

    /// Whether the pipeline-parallel-native runtime is present.
    fn native_runtime_available(&self) -> bool;
}

/// In-process [`ParallelState`] with fixed ranks.
#[derive(Debug)]
pub struct LocalParallelState {
    pipeline_rank: usize,
    pipeline_world_size: usize,
    tensor_rank: usize,
    tensor_world_size: usize,
    virtual_world_size: Option<usize>,
    virtual_rank: AtomicUsize,
    native_available: bool,
}

impl LocalParallelState {
    /// Single process, no parallelism, native runtime available.
    #[must_use]
    pub fn single() -> Self {
        Self {
            pipeline_rank: 0,
            pipeline_world_size: 1,
            tensor_rank: 0,
            tensor_world_size: 1,
            virtual_world_size: None,
            virtual_rank: AtomicUsize::new(0),
            native_available: true,
        }
    }

    /// Set the pipeline position.
    #[must_use]
    pub fn with_pipeline(mut self, rank: usize, world_size: usize) -> Self {
        self.pipeline_rank = rank;
        self.pipeline_world_size = world_size;
        self
    }

    /// Set the tensor-parallel position.
    #[must_use]
    pub fn with_tensor(mut self, rank: usize, world_size: usize) -> Self {
        self.tensor_rank = rank;
        self.tensor_world_size = world_size;
        self
    }

    /// Enable interleaving with `chunks` virtual pipeline chunks.
    #[must_use]
    pub fn with_virtual_pipeline(mut self, chunks: usize) -> Self {
        self.virtual_world_size = Some(chunks);
        self
    }

    /// Declare whether the native runtime is present.
    #[must_use]
    pub fn with_native_runtime(mut self, available: bool) -> Self {
        self.native_available = available;
        self
    }
}

impl Default for LocalParallelState {
    fn default() -> Self {
        Self::single()
    }
}

impl ParallelState for LocalParallelState {
    fn pipeline_rank(&self) -> usize {
        self.pipeline_rank
    }

    fn pipeline_world_size(&self) -> usize {
        self.pipeline_world_size
    }

    fn tensor_rank(&self) -> usize {
        self.tensor_rank
    }

    fn tensor_world_size(&self) -> usize {
        self.tensor_world_size
    }

    fn virtual_pipeline_world_size(&self) -> Option<usize> {
        self.virtual_world_size
    }

    fn virtual_pipeline_rank(&self) -> usize {
        self.virtual_rank.load(Ordering::SeqCst)
    }

    fn set_virtual_pipeline_rank(&self, rank: usize) {
        self.virtual_rank.store(rank, Ordering::SeqCst);
    }

    fn native_runtime_available(&self) -> bool {
        self.native_available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_defaults() {
        let state = LocalParallelState::single();
        assert_eq!(state.pipeline_world_size(), 1);
        assert_eq!(state.tensor_world_size(), 1);
        assert!(state.virtual_pipeline_world_size().is_none());
        assert!(state.native_runtime_available());
    }

    #[test]
    fn test_virtual_rank_setter() {
        let state = LocalParallelState::single().with_virtual_pipeline(2);
        state.set_virtual_pipeline_rank(1);
        assert_eq!(state.virtual_pipeline_rank(), 1);
        assert_eq!(state.virtual_pipeline_world_size(), Some(2));
    }
}
