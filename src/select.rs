//! Distributed selection.
//!
//! Given a subarray `[l, r]` of the global point array and a target index
//! `k`, [`BuildContext::select`] rearranges the points so that the value
//! at `k` along the chosen dimension is the `(k - l + 1)`-th smallest,
//! with smaller values to its left and larger ones to its right. The
//! algorithm is the randomized selection of Floyd and Rivest (1975),
//! adapted to distributed data: instead of the original two-way split,
//! each step partitions the subarray into `< T`, `= T` and `> T` blocks,
//! which bounds the worst case when the pivot value repeats many times.

use crate::build::BuildContext;
use crate::comm::{Communicator, SubGroup};
use crate::constants::FR_SAMPLE_THRESHOLD;

fn sign(x: i64) -> i64 {
    if x < 0 {
        -1
    } else {
        1
    }
}

impl<'a, C: Communicator> BuildContext<'a, C> {
    /// Select the median of `[l, r]` along `dim` and return the global
    /// index of the first point of the right half.
    ///
    /// The returned index is rolled leftward over any run of values equal
    /// to the median, so that equal coordinates end up on one definite
    /// side of the cut.
    pub(crate) fn select(&mut self, sub: &SubGroup<'a, C>, dim: usize, l: i64, r: i64) -> i64 {
        let k = (r + l) / 2 + 1;

        self.select_recursive(sub, l, r, k, dim);

        if k == l {
            return k;
        }

        // The array is now partitioned around the value at k, but that
        // value may repeat to the left of k. Find the first index of the
        // run so every equal point lands in the right-hand region.

        let comm = self.comm;
        let me = comm.rank();

        let has_k = self.dir.owner(k).unwrap();
        let has_k_rank = sub.local_rank(has_k);
        let has_k_left = self.dir.owner(k - 1).unwrap();
        let has_k_left_rank = sub.local_rank(has_k_left);

        let mut k_value = [0.0_f32];
        if has_k == me {
            k_value[0] = self.buffer.value(k, dim);
        }
        sub.broadcast(&mut k_value, has_k_rank);

        let mut k_left_value = [0.0_f32];
        if has_k_left == me {
            k_left_value[0] = self.buffer.value(k - 1, dim);
        }
        sub.broadcast(&mut k_left_value, has_k_left_rank);

        if k_left_value[0] != k_value[0] {
            return k;
        }

        // Each process scans its slice backward for the start of the run
        // of values equal to the pivot; the reduction takes the earliest.
        let mut first_k_value = self.dir.total(); // greater than any valid index

        if me <= has_k_left && self.dir.count(me) > 0 {
            let start = self.dir.end(me).min(k - 1);

            if self.buffer.value(start, dim) == k_value[0] {
                first_k_value = start;

                let finish = self.dir.start(me);
                let mut idx = start - 1;
                while idx >= finish {
                    if self.buffer.value(idx, dim) < k_value[0] {
                        break;
                    }
                    first_k_value -= 1;
                    idx -= 1;
                }
            }
        }

        let mut new_k = [0_i64];
        sub.reduce_min(&[first_k_value], &mut new_k, has_k_rank);
        sub.broadcast(&mut new_k, has_k_rank);

        new_k[0]
    }

    fn select_recursive(&mut self, sub: &SubGroup<'a, C>, l: i64, r: i64, k: i64, dim: usize) {
        let mut l = l;
        let mut r = r;

        while r > l {
            if r - l > FR_SAMPLE_THRESHOLD {
                // Recurse on a sample interval around k to pull a pivot
                // estimate into position k, biased so that the target is
                // expected to land in the smaller side of the partition.
                let n = r - l + 1;
                let i = k - l + 1;
                let z = (n as f64).ln();
                let s = (0.5 * (2.0 * z / 3.0).exp()) as i64;
                let sd = (0.5 * (z * s as f64 * ((n - s) as f64 / n as f64)).sqrt()) as i64
                    * sign(i - n / 2);
                let ll = l.max(k - (i as f64 * (s as f64 / n as f64)) as i64 + sd);
                let rr = r.min(k + ((n - i) as f64 * (s as f64 / n as f64)) as i64 + sd);
                self.select_recursive(sub, ll, rr, k, dim);
            }

            let (i, j) = self.partition_subarray(sub, l, r, k, dim);

            // [i, j) is the block of values equal to the pivot.
            if k >= j {
                l = j;
            } else if k >= i {
                break;
            } else {
                r = i - 1;
            }
        }
    }

    /// Three-way partition of the global subarray `[l, r]` around the
    /// value at `k`. Returns `(i, j)`: the values in `[l, i)` are smaller,
    /// those in `[i, j)` equal and those in `[j, r]` greater than the
    /// pivot.
    ///
    /// Every member of `sub` learns the result; the redistribution itself
    /// involves only the owners of `[l, r]`.
    fn partition_subarray(
        &mut self,
        sub: &SubGroup<'a, C>,
        l: i64,
        r: i64,
        k: i64,
        dim: usize,
    ) -> (i64, i64) {
        let comm = self.comm;
        let me = comm.rank();
        let p1 = self.dir.owner(l).unwrap();
        let p2 = self.dir.owner(r).unwrap();
        let root = sub.local_rank(p1);

        if me < p1 || me > p2 {
            let mut idx = [0_i64; 2];
            sub.broadcast(&mut idx, root);
            return (idx[0], idx[1]);
        }

        if p1 == p2 {
            // The whole subarray is local to one process.
            let (i, j) = self.partition_about_my_value(l, r, k, dim);
            let mut idx = [i, j];
            sub.broadcast(&mut idx, root);
            return (idx[0], idx[1]);
        }

        let group = SubGroup::new(comm, p1, p2, sub.tag());
        let nprocs = p2 - p1 + 1;

        let has_k = self.dir.owner(k).unwrap();
        let k_rank = group.local_rank(has_k);

        let my_l = l.max(self.dir.start(me));
        let my_r = r.min(self.dir.end(me));

        let mut pivot = [0.0_f32];
        if has_k == me {
            pivot[0] = self.buffer.value(k, dim);
        }
        group.broadcast(&mut pivot, k_rank);

        // Rearrange the local slice. The owner of k partitions around its
        // own value, which is guaranteed present; the others partition
        // around the broadcast pivot, which may be absent locally.
        let (i, j) = if has_k == me {
            self.partition_about_my_value(my_l, my_r, k, dim)
        } else {
            self.partition_about_other_value(my_l, my_r, pivot[0], dim)
        };

        // Share each participant's slice endpoints and split offsets.
        let mut left = vec![0_i64; nprocs];
        group.all_gather(&[my_l], &mut left);
        let mut right = vec![0_i64; nprocs];
        group.all_gather(&[my_r], &mut right);
        let mut ival = vec![0_i64; nprocs];
        group.all_gather(&[i], &mut ival);
        let mut jval = vec![0_i64; nprocs];
        group.all_gather(&[j], &mut jval);

        debug_assert_eq!(left[0], l);

        let mut less_count = vec![0_i64; nprocs];
        let mut equal_count = vec![0_i64; nprocs];
        let mut greater_count = vec![0_i64; nprocs];

        for p in 0..nprocs {
            less_count[p] = ival[p] - left[p];
            equal_count[p] = jval[p] - ival[p];
            greater_count[p] = right[p] - jval[p] + 1;
        }

        let total_less: i64 = less_count.iter().sum();
        let total_equal: i64 = equal_count.iter().sum();

        // Globally the subarray must become one < block, one = block and
        // one > block in contiguous index order. Every participant runs
        // the identical transfer schedule: receivers in rank order, each
        // drained from the remaining supplies in rank order.

        if my_l > self.dir.start(me) || my_r < self.dir.end(me) {
            // Keep the points outside [l, r] across the buffer swap.
            self.buffer.copy_current_to_next();
        }

        let mut less_used = vec![0_i64; nprocs];
        let mut equal_used = vec![0_i64; nprocs];
        let mut greater_used = vec![0_i64; nprocs];

        let mut next_less = 0_usize;
        let mut next_equal = 0_usize;
        let mut next_greater = 0_usize;

        for recvr in 0..nprocs {
            let mut need = less_count[recvr] + equal_count[recvr] + greater_count[recvr];
            let mut have = 0_i64;

            while need > 0 && next_less < nprocs {
                let available = less_count[next_less] - less_used[next_less];
                if available == 0 {
                    next_less += 1;
                    continue;
                }
                let take = available.min(need);
                self.do_transfer(
                    p1 + next_less,
                    p1 + recvr,
                    left[next_less] + less_used[next_less],
                    left[recvr] + have,
                    take,
                    sub.tag(),
                );
                have += take;
                need -= take;
                less_used[next_less] += take;
                if less_used[next_less] == less_count[next_less] {
                    next_less += 1;
                }
            }

            while need > 0 && next_equal < nprocs {
                let available = equal_count[next_equal] - equal_used[next_equal];
                if available == 0 {
                    next_equal += 1;
                    continue;
                }
                let take = available.min(need);
                self.do_transfer(
                    p1 + next_equal,
                    p1 + recvr,
                    left[next_equal] + less_count[next_equal] + equal_used[next_equal],
                    left[recvr] + have,
                    take,
                    sub.tag(),
                );
                have += take;
                need -= take;
                equal_used[next_equal] += take;
                if equal_used[next_equal] == equal_count[next_equal] {
                    next_equal += 1;
                }
            }

            while need > 0 && next_greater < nprocs {
                let available = greater_count[next_greater] - greater_used[next_greater];
                if available == 0 {
                    next_greater += 1;
                    continue;
                }
                let take = available.min(need);
                self.do_transfer(
                    p1 + next_greater,
                    p1 + recvr,
                    left[next_greater]
                        + less_count[next_greater]
                        + equal_count[next_greater]
                        + greater_used[next_greater],
                    left[recvr] + have,
                    take,
                    sub.tag(),
                );
                have += take;
                need -= take;
                greater_used[next_greater] += take;
                if greater_used[next_greater] == greater_count[next_greater] {
                    next_greater += 1;
                }
            }

            debug_assert_eq!(need, 0);
        }

        self.buffer.swap();

        let first_equal = left[0] + total_less;
        let first_greater = first_equal + total_equal;

        let mut idx = [first_equal, first_greater];
        sub.broadcast(&mut idx, root);
        (idx[0], idx[1])
    }

    /// Move `count` points from the donor's current array to the
    /// receiver's next array. Both indices are global; the schedule is
    /// identical on all participants, so the paired sends and receives
    /// line up.
    fn do_transfer(
        &mut self,
        from: usize,
        to: usize,
        from_index: i64,
        to_index: i64,
        count: i64,
        tag: i32,
    ) {
        let comm = self.comm;
        let me = comm.rank();

        if from == me && to == me {
            self.buffer.transfer_local(from_index, to_index, count);
        } else if from == me {
            comm.send(self.buffer.current_run(from_index, count), to, tag);
        } else if to == me {
            comm.receive(self.buffer.next_run_mut(to_index, count), from, tag);
        }
    }

    /// Three-way partition of the local range `[l, r]` around the value at
    /// `k`, which lies inside the range. Returns the first index of the
    /// equal block and the first index of the greater block (`r + 1` if
    /// there is none).
    pub(crate) fn partition_about_my_value(
        &mut self,
        l: i64,
        r: i64,
        k: i64,
        dim: usize,
    ) -> (i64, i64) {
        let t = self.buffer.value(k, dim);
        let mut many_t = false;

        // Arrange the pivot at one end: after the first exchange of the
        // main loop either x[l] = t and x[r] >= t, or x[l] < t and
        // x[r] = t.
        self.buffer.exchange_local(l, k);

        let rv = self.buffer.value(r, dim);
        if rv >= t {
            if rv == t {
                many_t = true;
            } else {
                self.buffer.exchange_local(r, l);
            }
        }

        let mut i = l;
        let mut j = r;

        while i < j {
            self.buffer.exchange_local(i, j);

            loop {
                j -= 1;
                if j <= i {
                    break;
                }
                let v = self.buffer.value(j, dim);
                if v < t {
                    break;
                }
                if !many_t && j > l && v == t {
                    many_t = true;
                }
            }

            if i == j {
                break;
            }

            loop {
                i += 1;
                if i >= j {
                    break;
                }
                let v = self.buffer.value(i, dim);
                if v >= t {
                    if !many_t && v == t {
                        many_t = true;
                    }
                    break;
                }
            }
        }

        // i and j sit at the rightmost value < t, or at l if there is
        // none. Put the pivot at the boundary.
        let l_value = self.buffer.value(l, dim);
        if l_value == t {
            self.buffer.exchange_local(l, j);
        } else {
            j += 1;
            self.buffer.exchange_local(j, r);
        }

        // j is now at the leftmost value >= t, which is a t.
        let first_t = j;
        let mut first_greater = j + 1;

        if many_t {
            // Gather the remaining t's into the middle block.
            let mut i = j;
            let mut j = r + 1;

            loop {
                loop {
                    i += 1;
                    if i >= j || self.buffer.value(i, dim) != t {
                        break;
                    }
                }
                if i >= j {
                    break;
                }
                loop {
                    j -= 1;
                    if j <= i || self.buffer.value(j, dim) == t {
                        break;
                    }
                }
                if i < j {
                    self.buffer.exchange_local(i, j);
                } else {
                    break;
                }
            }

            first_greater = i;
        }

        (first_t, first_greater)
    }

    /// Three-way partition of the local range `[l, r]` around a pivot
    /// value that may not occur locally at all. Returns the same pair as
    /// [`partition_about_my_value`](Self::partition_about_my_value); the
    /// two indices coincide when no local value equals the pivot.
    pub(crate) fn partition_about_other_value(
        &mut self,
        l: i64,
        r: i64,
        t: f32,
        dim: usize,
    ) -> (i64, i64) {
        if r < l {
            // Empty slice.
            return (l, l);
        }

        let total = r - l + 1;
        let mut num_t = 0_i64;
        let mut num_greater = 0_i64;
        let mut num_less = 0_i64;

        let l_value = self.buffer.value(l, dim);
        if l_value == t {
            num_t += 1;
        } else if l_value > t {
            num_greater += 1;
        } else {
            num_less += 1;
        }

        let r_value = self.buffer.value(r, dim);
        if r_value == t {
            num_t += 1;
        } else if r_value > t {
            num_greater += 1;
        } else {
            num_less += 1;
        }

        let mut i = l;
        let mut j = r;

        if l_value >= t && r_value >= t {
            loop {
                j -= 1;
                if j <= i {
                    break;
                }
                let v = self.buffer.value(j, dim);
                if v < t {
                    break;
                }
                if v == t {
                    num_t += 1;
                } else {
                    num_greater += 1;
                }
            }
        } else if l_value < t && r_value < t {
            loop {
                i += 1;
                if i >= j {
                    break;
                }
                let v = self.buffer.value(i, dim);
                if v >= t {
                    if v == t {
                        num_t += 1;
                    }
                    break;
                }
                num_less += 1;
            }
        } else if l_value < t && r_value >= t {
            // Pre-swap so the unconditional exchange of the main loop
            // restores the correctly placed ends.
            self.buffer.exchange_local(i, j);
        }
        // l_value >= t && r_value < t: the first exchange fixes it.

        if num_less == total {
            return (r + 1, r + 1);
        }
        if num_t == total {
            return (l, r + 1);
        }
        if num_greater == total {
            return (l, l);
        }

        while i < j {
            // The value at i belongs right of the value at j.
            self.buffer.exchange_local(i, j);

            loop {
                i += 1;
                if i >= j {
                    break;
                }
                let v = self.buffer.value(i, dim);
                if v >= t {
                    if v == t {
                        num_t += 1;
                    }
                    break;
                }
            }

            if i == j {
                break;
            }

            loop {
                j -= 1;
                if j <= i {
                    break;
                }
                let v = self.buffer.value(j, dim);
                if v < t {
                    break;
                }
                if v == t {
                    num_t += 1;
                }
            }
        }

        // i is at the first value >= t.
        if num_t == 0 {
            return (i, i);
        }

        let first_t = i;

        // Gather the t's into the middle block.
        let mut i = i - 1;
        let mut j = r + 1;

        loop {
            loop {
                i += 1;
                if i >= j || self.buffer.value(i, dim) != t {
                    break;
                }
            }
            if i >= j {
                break;
            }
            loop {
                j -= 1;
                if j <= i || self.buffer.value(j, dim) == t {
                    break;
                }
            }
            if i < j {
                self.buffer.exchange_local(i, j);
            } else {
                break;
            }
        }

        (first_t, i)
    }
}
