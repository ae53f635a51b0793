//! MPI-backed communicator.
//!
//! [`NativeComm`] adapts any `rsmpi` communicator to the crate's
//! [`Communicator`](super::Communicator) surface so a build can run on a
//! real cluster. Only enabled with the `mpi` cargo feature.

use mpi::traits::{Communicator as MpiCommunicator, Destination, Source};

use super::{CommValue, Communicator};

/// Adapter around an MPI communicator.
pub struct NativeComm<C: MpiCommunicator> {
    comm: C,
}

impl<C: MpiCommunicator> NativeComm<C> {
    /// Wrap an MPI communicator, e.g. the world communicator.
    pub fn new(comm: C) -> Self {
        Self { comm }
    }

    /// Borrow the underlying MPI communicator.
    pub fn inner(&self) -> &C {
        &self.comm
    }
}

impl<C: MpiCommunicator> Communicator for NativeComm<C> {
    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn send<T: CommValue>(&self, buf: &[T], dest: usize, tag: i32) {
        self.comm
            .process_at_rank(dest as i32)
            .send_with_tag(buf, tag);
    }

    fn receive<T: CommValue>(&self, buf: &mut [T], source: usize, tag: i32) {
        self.comm
            .process_at_rank(source as i32)
            .receive_into_with_tag(buf, tag);
    }
}
