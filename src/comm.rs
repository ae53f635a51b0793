//! Process communication.
//!
//! The build is written against the minimal [`Communicator`] surface:
//! process identity plus tagged point-to-point messages. Everything
//! collective happens through [`SubGroup`], which implements broadcast,
//! gather and reductions over a contiguous range of ranks in terms of
//! paired sends and receives, scoped by the tag of the sub-problem the
//! group is working on. Disjoint sub-groups therefore make progress
//! independently as long as they never share a tag.

use std::ops::Add;

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

/// Value types that can travel between processes.
///
/// With the `mpi` feature enabled the type additionally has to describe
/// itself to the MPI layer.
#[cfg(feature = "mpi")]
pub trait CommValue: Copy + Default + Send + 'static + ::mpi::traits::Equivalence {}
#[cfg(feature = "mpi")]
impl<T: Copy + Default + Send + 'static + ::mpi::traits::Equivalence> CommValue for T {}

/// Value types that can travel between processes.
#[cfg(not(feature = "mpi"))]
pub trait CommValue: Copy + Default + Send + 'static {}
#[cfg(not(feature = "mpi"))]
impl<T: Copy + Default + Send + 'static> CommValue for T {}

/// The point-to-point surface the tree build depends on.
///
/// `send` and `receive` block until the matching call on the peer
/// completes and are matched by `(source, destination, tag)`, in program
/// order for equal triples.
pub trait Communicator {
    /// Number of cooperating processes.
    fn size(&self) -> usize;

    /// Rank of this process, in `0..size()`.
    fn rank(&self) -> usize;

    /// Send `buf` to `dest`.
    fn send<T: CommValue>(&self, buf: &[T], dest: usize, tag: i32);

    /// Receive exactly `buf.len()` values from `source` into `buf`.
    fn receive<T: CommValue>(&self, buf: &mut [T], source: usize, tag: i32);
}

/// A contiguous range of ranks cooperating on one sub-problem.
///
/// Roots are given as local ranks, i.e. offsets into the range. Every
/// member must call each collective; a process outside the range must not.
pub struct SubGroup<'a, C: Communicator> {
    comm: &'a C,
    first: usize,
    last: usize,
    tag: i32,
}

impl<'a, C: Communicator> SubGroup<'a, C> {
    /// Create a handle for the rank range `first..=last`.
    pub fn new(comm: &'a C, first: usize, last: usize, tag: i32) -> Self {
        debug_assert!(first <= last && last < comm.size());
        debug_assert!(
            (first..=last).contains(&comm.rank()),
            "rank {} is outside the sub-group {}..={}",
            comm.rank(),
            first,
            last
        );
        Self {
            comm,
            first,
            last,
            tag,
        }
    }

    /// Number of members.
    pub fn nmembers(&self) -> usize {
        self.last - self.first + 1
    }

    /// The tag scoping this group's collectives.
    pub fn tag(&self) -> i32 {
        self.tag
    }

    /// Translate a global rank into a local rank.
    pub fn local_rank(&self, global: usize) -> usize {
        debug_assert!((self.first..=self.last).contains(&global));
        global - self.first
    }

    /// Translate a local rank into a global rank.
    pub fn global_rank(&self, local: usize) -> usize {
        debug_assert!(local < self.nmembers());
        self.first + local
    }

    fn my_local_rank(&self) -> usize {
        self.comm.rank() - self.first
    }

    /// Broadcast `buf` from the member with local rank `root` to all
    /// members.
    pub fn broadcast<T: CommValue>(&self, buf: &mut [T], root: usize) {
        if self.my_local_rank() == root {
            for member in 0..self.nmembers() {
                if member != root {
                    self.comm.send(buf, self.global_rank(member), self.tag);
                }
            }
        } else {
            self.comm.receive(buf, self.global_rank(root), self.tag);
        }
    }

    /// Gather each member's `send` into `recv` on the member with local
    /// rank `root`, ordered by local rank. `recv` is ignored elsewhere.
    pub fn gather<T: CommValue>(&self, send: &[T], recv: &mut [T], root: usize) {
        let n = send.len();
        if self.my_local_rank() == root {
            assert_eq!(recv.len(), n * self.nmembers());
            for member in 0..self.nmembers() {
                let slot = &mut recv[member * n..(member + 1) * n];
                if member == root {
                    slot.copy_from_slice(send);
                } else {
                    self.comm.receive(slot, self.global_rank(member), self.tag);
                }
            }
        } else {
            self.comm.send(send, self.global_rank(root), self.tag);
        }
    }

    /// Gather each member's `send` into `recv` on every member.
    pub fn all_gather<T: CommValue>(&self, send: &[T], recv: &mut [T]) {
        self.gather(send, recv, 0);
        self.broadcast(recv, 0);
    }

    fn reduce_with<T: CommValue>(
        &self,
        send: &[T],
        recv: &mut [T],
        root: usize,
        combine: impl Fn(T, T) -> T,
    ) {
        if self.my_local_rank() == root {
            assert_eq!(recv.len(), send.len());
            recv.copy_from_slice(send);
            let mut contribution = vec![T::default(); send.len()];
            for member in 0..self.nmembers() {
                if member == root {
                    continue;
                }
                self.comm
                    .receive(&mut contribution, self.global_rank(member), self.tag);
                for (r, &c) in recv.iter_mut().zip(contribution.iter()) {
                    *r = combine(*r, c);
                }
            }
        } else {
            self.comm.send(send, self.global_rank(root), self.tag);
        }
    }

    /// Elementwise minimum of every member's `send`, delivered into `recv`
    /// on the member with local rank `root`.
    pub fn reduce_min<T: CommValue + PartialOrd>(&self, send: &[T], recv: &mut [T], root: usize) {
        self.reduce_with(send, recv, root, |a, b| if b < a { b } else { a });
    }

    /// Elementwise maximum, delivered on `root`.
    pub fn reduce_max<T: CommValue + PartialOrd>(&self, send: &[T], recv: &mut [T], root: usize) {
        self.reduce_with(send, recv, root, |a, b| if b > a { b } else { a });
    }

    /// Elementwise sum, delivered on `root`.
    pub fn reduce_sum<T: CommValue + Add<Output = T>>(
        &self,
        send: &[T],
        recv: &mut [T],
        root: usize,
    ) {
        self.reduce_with(send, recv, root, |a, b| a + b);
    }

    /// Elementwise minimum, delivered on every member.
    pub fn all_reduce_min<T: CommValue + PartialOrd>(&self, send: &[T], recv: &mut [T]) {
        self.reduce_min(send, recv, 0);
        self.broadcast(recv, 0);
    }

    /// Elementwise maximum, delivered on every member.
    pub fn all_reduce_max<T: CommValue + PartialOrd>(&self, send: &[T], recv: &mut [T]) {
        self.reduce_max(send, recv, 0);
        self.broadcast(recv, 0);
    }

    /// Elementwise sum, delivered on every member.
    pub fn all_reduce_sum<T: CommValue + Add<Output = T>>(&self, send: &[T], recv: &mut [T]) {
        self.reduce_sum(send, recv, 0);
        self.broadcast(recv, 0);
    }
}
