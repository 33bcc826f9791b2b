//! Ring collectives over in-process channels
//!
//! Each group member is connected to its left and right neighbour. All-reduce
//! runs the classic two-phase ring: a scatter-reduce where every member ends up
//! owning one fully reduced chunk, followed by an all-gather that circulates
//! those chunks. Traffic per member is `2 * (n - 1) / n` times the buffer size
//! regardless of group size.

use crate::backend::Collective;
use crate::error::CommError;
use crossbeam::channel::{Receiver, Sender};
use std::ops::AddAssign;

/// Message travelling around the ring.
#[derive(Debug)]
pub enum Payload {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Element types that can travel in a [`Payload`].
trait Wire: Copy + AddAssign + Send + 'static {
    fn wrap(data: Vec<Self>) -> Payload;
    fn unwrap(payload: Payload) -> Option<Vec<Self>>;
}

impl Wire for f32 {
    fn wrap(data: Vec<Self>) -> Payload {
        Payload::F32(data)
    }

    fn unwrap(payload: Payload) -> Option<Vec<Self>> {
        match payload {
            Payload::F32(data) => Some(data),
            Payload::F64(_) => None,
        }
    }
}

impl Wire for f64 {
    fn wrap(data: Vec<Self>) -> Payload {
        Payload::F64(data)
    }

    fn unwrap(payload: Payload) -> Option<Vec<Self>> {
        match payload {
            Payload::F64(data) => Some(data),
            Payload::F32(_) => None,
        }
    }
}

#[derive(Debug)]
struct Ring {
    left_rx: Receiver<Payload>,
    right_tx: Sender<Payload>,
}

/// A named communication group.
///
/// Groups of size one never touch a channel, so single-worker runs pay nothing
/// for collectives.
#[derive(Debug)]
pub struct ProcessGroup {
    name: String,
    rank: usize,
    size: usize,
    members: Vec<usize>,
    ring: Option<Ring>,
}

impl ProcessGroup {
    /// A group containing only the calling worker.
    pub fn solo(name: impl Into<String>, global_rank: usize) -> Self {
        Self {
            name: name.into(),
            rank: 0,
            size: 1,
            members: vec![global_rank],
            ring: None,
        }
    }

    /// A ring group member.
    ///
    /// `left_rx` receives from local rank `rank - 1`, `right_tx` sends to
    /// local rank `rank + 1` (both modulo the group size). `members` lists the
    /// global ranks of the group in local-rank order.
    pub fn ring(
        name: impl Into<String>,
        rank: usize,
        members: Vec<usize>,
        left_rx: Receiver<Payload>,
        right_tx: Sender<Payload>,
    ) -> Self {
        let size = members.len();
        Self {
            name: name.into(),
            rank,
            size,
            members,
            ring: (size > 1).then_some(Ring { left_rx, right_tx }),
        }
    }

    /// Group name, used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Global ranks of the group members in local-rank order.
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    fn disconnected(&self) -> CommError {
        CommError::Disconnected {
            group: self.name.clone(),
            rank: self.rank,
        }
    }

    fn send<T: Wire>(&self, ring: &Ring, data: &[T]) -> Result<(), CommError> {
        ring.right_tx
            .send(T::wrap(data.to_vec()))
            .map_err(|_| self.disconnected())
    }

    fn recv<T: Wire>(&self, ring: &Ring, expected: usize) -> Result<Vec<T>, CommError> {
        let payload = ring.left_rx.recv().map_err(|_| self.disconnected())?;
        let data = T::unwrap(payload).ok_or_else(|| CommError::PayloadType {
            group: self.name.clone(),
        })?;
        if data.len() != expected {
            return Err(CommError::SizeMismatch {
                group: self.name.clone(),
                expected,
                got: data.len(),
            });
        }
        Ok(data)
    }

    fn ring_all_reduce<T: Wire>(&self, buf: &mut [T]) -> Result<(), CommError> {
        let Some(ring) = &self.ring else {
            return Ok(());
        };

        let n = self.size;
        let len = buf.len();
        let chunk = len.div_ceil(n);
        let bounds = |idx: usize| {
            let start = (idx * chunk).min(len);
            (start, (start + chunk).min(len))
        };
        let wrap = |offset: isize| (self.rank as isize + offset).rem_euclid(n as isize) as usize;

        // Scatter-reduce: after n - 1 steps this rank owns chunk (rank + 1) fully reduced.
        for step in 0..n - 1 {
            let (send_start, send_end) = bounds(wrap(-(step as isize)));
            let (recv_start, recv_end) = bounds(wrap(-(step as isize) - 1));
            self.send(ring, &buf[send_start..send_end])?;
            let incoming = self.recv::<T>(ring, recv_end - recv_start)?;
            for (dst, src) in buf[recv_start..recv_end].iter_mut().zip(incoming) {
                *dst += src;
            }
        }

        // All-gather: circulate the reduced chunks.
        for step in 0..n - 1 {
            let (send_start, send_end) = bounds(wrap(1 - step as isize));
            let (recv_start, recv_end) = bounds(wrap(-(step as isize)));
            self.send(ring, &buf[send_start..send_end])?;
            let incoming = self.recv::<T>(ring, recv_end - recv_start)?;
            buf[recv_start..recv_end].copy_from_slice(&incoming);
        }

        Ok(())
    }
}

impl Collective for ProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<(), CommError> {
        self.ring_all_reduce(buf)
    }

    fn all_reduce_sum_f64(&self, buf: &mut [f64]) -> Result<(), CommError> {
        self.ring_all_reduce(buf)
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>, CommError> {
        let Some(ring) = &self.ring else {
            return Ok(local.to_vec());
        };

        let n = self.size;
        let block = local.len();
        let mut out = vec![0.0f32; block * n];
        out[self.rank * block..(self.rank + 1) * block].copy_from_slice(local);

        for step in 0..n - 1 {
            let send_idx = (self.rank + n - step) % n;
            let recv_idx = (self.rank + n - step - 1) % n;
            self.send(ring, &out[send_idx * block..(send_idx + 1) * block])?;
            let incoming = self.recv::<f32>(ring, block)?;
            out[recv_idx * block..(recv_idx + 1) * block].copy_from_slice(&incoming);
        }

        Ok(out)
    }
}
