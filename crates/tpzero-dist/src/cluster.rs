//! In-process launcher: one thread per rank
//!
//! Every group gets its own ring of channels, so tensor-parallel and
//! data-parallel traffic never interleave.

use crate::error::CommError;
use crate::group::{Payload, ProcessGroup};
use crate::topology::{ParallelLayout, ParallelState};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::fmt::Display;
use std::thread;
use tracing::{debug, error};

/// Builds and launches local worker sets.
pub struct LocalCluster;

impl LocalCluster {
    /// Wire up the tensor-parallel and data-parallel groups of every rank.
    ///
    /// Returns one [`ParallelState`] per global rank, in rank order.
    pub fn build(layout: ParallelLayout) -> Vec<ParallelState> {
        let world = layout.world_size();
        let mut tp_groups = wire_groups("tensor_parallel", world, &layout.tp_groups());
        let mut dp_groups = wire_groups("data_parallel", world, &layout.dp_groups());

        (0..world)
            .map(|rank| {
                let tp = tp_groups[rank]
                    .take()
                    .unwrap_or_else(|| ProcessGroup::solo("tensor_parallel", rank));
                let dp = dp_groups[rank]
                    .take()
                    .unwrap_or_else(|| ProcessGroup::solo("data_parallel", rank));
                ParallelState::new(rank, layout, tp, dp)
            })
            .collect()
    }

    /// Run `worker` on every rank concurrently and collect results in rank order.
    ///
    /// If any rank fails, the first failure in rank order is returned. A failing
    /// rank drops its channels, so its peers observe
    /// [`CommError::Disconnected`] instead of blocking forever.
    pub fn launch<T, E, F>(layout: ParallelLayout, worker: F) -> Result<Vec<T>, E>
    where
        T: Send,
        E: Send + Display + From<CommError>,
        F: Fn(ParallelState) -> Result<T, E> + Sync,
    {
        let states = Self::build(layout);
        debug!(
            world_size = layout.world_size(),
            tp = layout.tensor_parallel_size(),
            dp = layout.data_parallel_size(),
            "launching local workers"
        );

        let results: Vec<Result<T, E>> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(states.len());
            for state in states {
                let rank = state.global_rank();
                let worker = &worker;
                let spawned = thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || worker(state));
                handles.push((rank, spawned));
            }

            handles
                .into_iter()
                .map(|(rank, spawned)| match spawned {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(CommError::WorkerPanicked(rank).into())),
                    Err(source) => Err(CommError::Spawn { rank, source }.into()),
                })
                .collect()
        });

        let mut outputs = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (rank, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => outputs.push(value),
                Err(e) => {
                    error!(rank, "worker failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }
}

/// Create ring channels for each group and hand every member its endpoint.
fn wire_groups(name: &str, world: usize, groups: &[Vec<usize>]) -> Vec<Option<ProcessGroup>> {
    let mut out: Vec<Option<ProcessGroup>> = (0..world).map(|_| None).collect();

    for members in groups {
        let size = members.len();
        // Channel k carries traffic from local rank k to local rank k + 1.
        let (senders, receivers): (Vec<Sender<Payload>>, Vec<Receiver<Payload>>) =
            (0..size).map(|_| unbounded()).unzip();

        for (local, &global) in members.iter().enumerate() {
            let right_tx = senders[local].clone();
            let left_rx = receivers[(local + size - 1) % size].clone();
            out[global] = Some(ProcessGroup::ring(
                name,
                local,
                members.clone(),
                left_rx,
                right_tx,
            ));
        }
    }

    out
}
