//! Tensor-parallel / data-parallel rank layout
//!
//! Global ranks are laid out tensor-parallel first: the `tp` ranks of one model
//! replica are contiguous, and data-parallel groups stride across replicas.
//! With `world_size = 8` and `tp = 2`:
//!
//! ```text
//! tp groups: [0,1] [2,3] [4,5] [6,7]
//! dp groups: [0,2,4,6] [1,3,5,7]
//! ```

use crate::backend::Collective;
use crate::error::CommError;
use crate::group::ProcessGroup;

/// Parallel degrees of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelLayout {
    world_size: usize,
    tensor_parallel_size: usize,
}

impl ParallelLayout {
    /// Validate and build a layout.
    pub fn new(world_size: usize, tensor_parallel_size: usize) -> Result<Self, CommError> {
        if world_size == 0 || tensor_parallel_size == 0 {
            return Err(CommError::InvalidTopology(format!(
                "world size ({world_size}) and tensor parallel size ({tensor_parallel_size}) must be positive"
            )));
        }
        if world_size % tensor_parallel_size != 0 {
            return Err(CommError::InvalidTopology(format!(
                "world size {world_size} is not divisible by tensor parallel size {tensor_parallel_size}"
            )));
        }
        Ok(Self {
            world_size,
            tensor_parallel_size,
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn tensor_parallel_size(&self) -> usize {
        self.tensor_parallel_size
    }

    /// Number of model replicas.
    pub fn data_parallel_size(&self) -> usize {
        self.world_size / self.tensor_parallel_size
    }

    pub fn tp_rank(&self, global_rank: usize) -> usize {
        global_rank % self.tensor_parallel_size
    }

    pub fn dp_rank(&self, global_rank: usize) -> usize {
        global_rank / self.tensor_parallel_size
    }

    /// Global ranks sharing `global_rank`'s model replica.
    pub fn tp_group_members(&self, global_rank: usize) -> Vec<usize> {
        let base = self.dp_rank(global_rank) * self.tensor_parallel_size;
        (base..base + self.tensor_parallel_size).collect()
    }

    /// Global ranks holding the same model shard as `global_rank`.
    pub fn dp_group_members(&self, global_rank: usize) -> Vec<usize> {
        let tp_rank = self.tp_rank(global_rank);
        (0..self.data_parallel_size())
            .map(|dp| dp * self.tensor_parallel_size + tp_rank)
            .collect()
    }

    /// Every tensor-parallel group.
    pub fn tp_groups(&self) -> Vec<Vec<usize>> {
        (0..self.data_parallel_size())
            .map(|dp| self.tp_group_members(dp * self.tensor_parallel_size))
            .collect()
    }

    /// Every data-parallel group.
    pub fn dp_groups(&self) -> Vec<Vec<usize>> {
        (0..self.tensor_parallel_size)
            .map(|tp| self.dp_group_members(tp))
            .collect()
    }
}

/// Per-worker view of the parallel topology.
#[derive(Debug)]
pub struct ParallelState {
    global_rank: usize,
    layout: ParallelLayout,
    tp_group: ProcessGroup,
    dp_group: ProcessGroup,
}

impl ParallelState {
    pub fn new(
        global_rank: usize,
        layout: ParallelLayout,
        tp_group: ProcessGroup,
        dp_group: ProcessGroup,
    ) -> Self {
        Self {
            global_rank,
            layout,
            tp_group,
            dp_group,
        }
    }

    /// State for a single-worker run.
    pub fn single() -> Self {
        Self {
            global_rank: 0,
            layout: ParallelLayout {
                world_size: 1,
                tensor_parallel_size: 1,
            },
            tp_group: ProcessGroup::solo("tensor_parallel", 0),
            dp_group: ProcessGroup::solo("data_parallel", 0),
        }
    }

    pub fn global_rank(&self) -> usize {
        self.global_rank
    }

    pub fn layout(&self) -> ParallelLayout {
        self.layout
    }

    /// The lead worker: global rank zero.
    pub fn is_root(&self) -> bool {
        self.global_rank == 0
    }

    pub fn tp_rank(&self) -> usize {
        self.tp_group.rank()
    }

    pub fn tp_size(&self) -> usize {
        self.tp_group.size()
    }

    pub fn dp_rank(&self) -> usize {
        self.dp_group.rank()
    }

    pub fn dp_size(&self) -> usize {
        self.dp_group.size()
    }

    pub fn tp_group(&self) -> &ProcessGroup {
        &self.tp_group
    }

    pub fn dp_group(&self) -> &ProcessGroup {
        &self.dp_group
    }

    /// Block until every rank in the world has arrived.
    ///
    /// Each data-parallel group holds one member of every tensor-parallel
    /// group, so a tensor-parallel barrier followed by a data-parallel
    /// barrier covers the whole world.
    pub fn rendezvous(&self) -> Result<(), CommError> {
        self.tp_group.barrier()?;
        self.dp_group.barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_rejects_indivisible_world() {
        assert!(ParallelLayout::new(6, 4).is_err());
        assert!(ParallelLayout::new(0, 1).is_err());
        assert!(ParallelLayout::new(4, 0).is_err());
    }

    #[test]
    fn test_layout_groups() {
        let layout = ParallelLayout::new(8, 2).unwrap();
        assert_eq!(layout.data_parallel_size(), 4);
        assert_eq!(layout.tp_groups(), vec![vec![0, 1], vec![2, 3], vec![4, 5], vec![6, 7]]);
        assert_eq!(layout.dp_groups(), vec![vec![0, 2, 4, 6], vec![1, 3, 5, 7]]);
        assert_eq!(layout.tp_rank(5), 1);
        assert_eq!(layout.dp_rank(5), 2);
    }

    #[test]
    fn test_single_state() {
        let state = ParallelState::single();
        assert!(state.is_root());
        assert_eq!(state.dp_size(), 1);
        assert_eq!(state.tp_size(), 1);
        assert_eq!(state.layout().world_size(), 1);
    }
}
