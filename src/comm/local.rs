//! Shared-memory communicator.
//!
//! [`LocalComm`] runs a group of cooperating "processes" as threads of one
//! program, connected by channels. It is the backend used by the test
//! suite and the doc examples, and is handy for exercising a build on a
//! single machine without an MPI launcher.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};

use super::{CommValue, Communicator};

struct Message {
    source: usize,
    tag: i32,
    payload: Box<dyn Any + Send>,
}

/// One member of a thread-backed process group.
pub struct LocalComm {
    rank: usize,
    senders: Vec<Sender<Message>>,
    inbox: Receiver<Message>,
    // Messages that arrived ahead of the receive that wants them.
    stash: RefCell<VecDeque<Message>>,
}

impl LocalComm {
    /// Create a fully connected group of `size` communicators, one per
    /// simulated process, in rank order.
    pub fn cluster(size: usize) -> Vec<LocalComm> {
        assert!(size > 0);

        let (senders, inboxes): (Vec<_>, Vec<_>) =
            (0..size).map(|_| channel::<Message>()).unzip();

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                senders: senders.clone(),
                inbox,
                stash: RefCell::new(VecDeque::new()),
            })
            .collect()
    }
}

impl Communicator for LocalComm {
    fn size(&self) -> usize {
        self.senders.len()
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn send<T: CommValue>(&self, buf: &[T], dest: usize, tag: i32) {
        let message = Message {
            source: self.rank,
            tag,
            payload: Box::new(buf.to_vec()),
        };
        self.senders[dest]
            .send(message)
            .expect("receiving process has shut down");
    }

    fn receive<T: CommValue>(&self, buf: &mut [T], source: usize, tag: i32) {
        let mut stash = self.stash.borrow_mut();

        // Earlier receives may have set aside the message we want; matching
        // is FIFO per (source, tag) pair.
        let stashed = stash
            .iter()
            .position(|m| m.source == source && m.tag == tag);

        let message = match stashed {
            Some(index) => stash.remove(index).unwrap(),
            None => loop {
                let message = self
                    .inbox
                    .recv()
                    .expect("sending process has shut down");
                if message.source == source && message.tag == tag {
                    break message;
                }
                stash.push_back(message);
            },
        };

        let values = message
            .payload
            .downcast::<Vec<T>>()
            .expect("mismatched message type between matched send and receive");
        assert_eq!(
            values.len(),
            buf.len(),
            "mismatched message length between matched send and receive"
        );
        buf.copy_from_slice(&values);
    }
}

/// Run `body` on a cluster of `size` thread-backed processes and return
/// the per-rank results in rank order.
///
/// Panics in any member propagate to the caller.
pub fn run_cluster<T, F>(size: usize, body: F) -> Vec<T>
where
    T: Send,
    F: Fn(LocalComm) -> T + Send + Sync,
{
    let comms = LocalComm::cluster(size);
    let body = &body;

    std::thread::scope(|scope| {
        let handles = comms
            .into_iter()
            .map(|comm| scope.spawn(move || body(comm)))
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| handle.join().expect("cluster member panicked"))
            .collect()
    })
}
