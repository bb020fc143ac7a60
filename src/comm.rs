//! Rank-to-rank communication abstraction.
//!
//! The engine is generic over a [`Communicator`] carrying the rank/size
//! identity and three exchange primitives; every collective the engine
//! needs (gathers, reductions, prefix sums) is derived from these in
//! [`crate::tools`]. All primitives are collective: each rank of the
//! communicator must call them in the same order or the job deadlocks.
//!
//! Two backends are provided. [`SerialComm`] is the single-rank
//! implementation. [`ThreadComm`] runs several ranks inside one process,
//! one thread per rank, over a shared deposit board; it gives bit-identical
//! results for a fixed call sequence and is the backend the multi-rank
//! tests run on. An MPI-backed communicator is a 1:1 swap of the same
//! three primitives.

use std::collections::BTreeMap;
use std::sync::{Arc, Barrier, Mutex};

/// Message-passing endpoint of one rank.
pub trait Communicator {
    /// This process' rank in `0..size`.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Collective: every rank contributes a buffer; every rank receives
    /// the buffers of all ranks, indexed by rank.
    fn all_gather_bytes(&self, bytes: &[u8]) -> Vec<Vec<u8>>;

    /// Collective: sparse point-to-point exchange with receiver discovery.
    /// Each rank passes the buffers it wants delivered, keyed by receiver;
    /// the call returns the buffers addressed to the caller, keyed by
    /// sender.
    fn exchange(&self, sends: BTreeMap<usize, Vec<u8>>) -> BTreeMap<usize, Vec<u8>>;

    /// Collective: broadcast a buffer from `root` to every rank.
    fn broadcast_bytes(&self, root: usize, bytes: &[u8]) -> Vec<u8>;
}

/// The trivial single-rank communicator.
#[derive(Debug, Default, Clone)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_bytes(&self, bytes: &[u8]) -> Vec<Vec<u8>> {
        vec![bytes.to_vec()]
    }

    fn exchange(&self, sends: BTreeMap<usize, Vec<u8>>) -> BTreeMap<usize, Vec<u8>> {
        // A rank never sends to itself; anything addressed elsewhere is a bug.
        debug_assert!(sends.is_empty());
        BTreeMap::new()
    }

    fn broadcast_bytes(&self, _root: usize, bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }
}

struct Board {
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
    exchange_slots: Mutex<Vec<BTreeMap<usize, Vec<u8>>>>,
}

/// In-process multi-rank communicator.
///
/// [`ThreadComm::split`] creates one handle per rank; each handle is moved
/// onto its own thread, which then drives its rank of the engine. The
/// double barrier around every primitive makes each call a full
/// synchronization point, so a fixed call sequence is deterministic.
pub struct ThreadComm {
    rank: usize,
    board: Arc<Board>,
}

impl ThreadComm {
    /// Create the handles of an `n`-rank communicator.
    pub fn split(n: usize) -> Vec<ThreadComm> {
        assert!(n > 0);
        let board = Arc::new(Board {
            size: n,
            barrier: Barrier::new(n),
            slots: Mutex::new(vec![None; n]),
            exchange_slots: Mutex::new(vec![BTreeMap::new(); n]),
        });
        (0..n)
            .map(|rank| ThreadComm {
                rank,
                board: Arc::clone(&board),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.board.size
    }

    fn all_gather_bytes(&self, bytes: &[u8]) -> Vec<Vec<u8>> {
        {
            let mut slots = self.board.slots.lock().unwrap();
            slots[self.rank] = Some(bytes.to_vec());
        }
        self.board.barrier.wait();
        let gathered = {
            let slots = self.board.slots.lock().unwrap();
            slots
                .iter()
                .map(|slot| slot.as_ref().cloned().unwrap_or_default())
                .collect()
        };
        self.board.barrier.wait();
        gathered
    }

    fn exchange(&self, sends: BTreeMap<usize, Vec<u8>>) -> BTreeMap<usize, Vec<u8>> {
        {
            let mut slots = self.board.exchange_slots.lock().unwrap();
            slots[self.rank] = sends;
        }
        self.board.barrier.wait();
        let received = {
            let slots = self.board.exchange_slots.lock().unwrap();
            let mut received = BTreeMap::new();
            for (sender, outbox) in slots.iter().enumerate() {
                if let Some(message) = outbox.get(&self.rank) {
                    received.insert(sender, message.clone());
                }
            }
            received
        };
        self.board.barrier.wait();
        received
    }

    fn broadcast_bytes(&self, root: usize, bytes: &[u8]) -> Vec<u8> {
        if self.rank == root {
            let mut slots = self.board.slots.lock().unwrap();
            slots[root] = Some(bytes.to_vec());
        }
        self.board.barrier.wait();
        let message = {
            let slots = self.board.slots.lock().unwrap();
            slots[root].as_ref().cloned().unwrap_or_default()
        };
        self.board.barrier.wait();
        message
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    fn run_on_ranks<F, T>(n: usize, f: F) -> Vec<T>
    where
        F: Fn(ThreadComm) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut handles = Vec::new();
        for comm in ThreadComm::split(n) {
            let f = Arc::clone(&f);
            handles.push(thread::spawn(move || f(comm)));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_serial_comm() {
        let comm = SerialComm;
        assert_eq!(comm.size(), 1);
        assert_eq!(comm.all_gather_bytes(&[1, 2, 3]), vec![vec![1, 2, 3]]);
        assert_eq!(comm.broadcast_bytes(0, &[9]), vec![9]);
    }

    #[test]
    fn test_thread_comm_all_gather() {
        let gathered = run_on_ranks(3, |comm| {
            let payload = vec![comm.rank() as u8; comm.rank() + 1];
            comm.all_gather_bytes(&payload)
        });
        for result in gathered {
            assert_eq!(result, vec![vec![0], vec![1, 1], vec![2, 2, 2]]);
        }
    }

    #[test]
    fn test_thread_comm_exchange() {
        let results = run_on_ranks(3, |comm| {
            // Every rank sends its rank id to the next rank.
            let mut sends = BTreeMap::new();
            let next = (comm.rank() + 1) % comm.size();
            sends.insert(next, vec![comm.rank() as u8]);
            let received = comm.exchange(sends);
            (comm.rank(), received)
        });
        for (rank, received) in results {
            let prev = (rank + 2) % 3;
            assert_eq!(received.len(), 1);
            assert_eq!(received[&prev], vec![prev as u8]);
        }
    }

    #[test]
    fn test_thread_comm_broadcast() {
        let results = run_on_ranks(4, |comm| {
            let payload = if comm.rank() == 2 { vec![42] } else { vec![] };
            comm.broadcast_bytes(2, &payload)
        });
        for result in results {
            assert_eq!(result, vec![42]);
        }
    }

    #[test]
    fn test_thread_comm_back_to_back_collectives() {
        let results = run_on_ranks(2, |comm| {
            let a = comm.all_gather_bytes(&[comm.rank() as u8]);
            let b = comm.all_gather_bytes(&[10 + comm.rank() as u8]);
            (a, b)
        });
        for (a, b) in results {
            assert_eq!(a, vec![vec![0], vec![1]]);
            assert_eq!(b, vec![vec![10], vec![11]]);
        }
    }
}
