use crate::error::CommError;

/// Abstraction over a communication group.
///
/// Every member of the group must call the same collective in the same order;
/// a call blocks until all members have arrived.
pub trait Collective: Send {
    /// Rank of this worker inside the group.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn size(&self) -> usize;

    /// Sums `buf` element-wise across the group, in place.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<(), CommError>;

    /// Double-precision variant of [`Collective::all_reduce_sum`].
    fn all_reduce_sum_f64(&self, buf: &mut [f64]) -> Result<(), CommError>;

    /// Concatenates equal-length contributions from every member in rank order.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>, CommError>;

    /// Blocks until every member of the group has reached the barrier.
    fn barrier(&self) -> Result<(), CommError> {
        let mut token = [0.0f32];
        self.all_reduce_sum(&mut token)
    }
}
