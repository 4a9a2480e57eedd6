//! Process-wide socket lookup tables.
//!
//! Two hash-bucketed tables: `bound` keyed on the local port (with one extra
//! trailing bucket holding sockets that are not bound yet), and `connected`
//! keyed on the remote CID xor the local port, matched on the full address
//! pair.
//!
//! The tables mutex is a leaf lock: it may be taken with socket locks already
//! held (API paths) or with none held (dispatcher lookups), but no socket
//! lock is ever acquired underneath it. Lookups therefore match on address
//! snapshots stored in the entries rather than on live socket state; the
//! snapshots are refreshed by the same operations that change the addresses.
//!
//! Every entry holds one strong reference to its socket; `find_*` hand out an
//! additional reference that the caller drops.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::addr::{Addr, LAST_RESERVED_PORT, PORT_ANY};
use crate::socket::VsockSocket;
use crate::util::{contains_arc, remove_arc};
use crate::Dependencies;

const HASH_SIZE: usize = 251;
/// Autobind gives up after this many occupied candidate ports.
pub(crate) const MAX_PORT_RETRIES: u32 = 24;

fn bound_bucket(port: u32) -> usize {
    if port == PORT_ANY {
        // trailing bucket for unbound sockets
        HASH_SIZE
    } else {
        port as usize % (HASH_SIZE - 1)
    }
}

fn connected_bucket(remote: Addr, local_port: u32) -> usize {
    (remote.cid ^ local_port) as usize % (HASH_SIZE - 1)
}

#[derive(Debug)]
struct BoundEntry<X: Dependencies> {
    /// `PORT_ANY` for sockets in the unbound bucket.
    port: u32,
    sk: Arc<VsockSocket<X>>,
}

#[derive(Debug)]
struct ConnectedEntry<X: Dependencies> {
    remote: Addr,
    local_port: u32,
    sk: Arc<VsockSocket<X>>,
}

#[derive(Debug)]
pub(crate) struct Tables<X: Dependencies> {
    bound: Vec<Vec<BoundEntry<X>>>,
    connected: Vec<Vec<ConnectedEntry<X>>>,
    /// Rolling candidate for autobind port selection.
    next_ephemeral: u32,
}

impl<X: Dependencies> Tables<X> {
    pub fn new() -> Self {
        Self {
            bound: (0..=HASH_SIZE).map(|_| Vec::new()).collect(),
            connected: (0..HASH_SIZE).map(|_| Vec::new()).collect(),
            next_ephemeral: LAST_RESERVED_PORT + 1,
        }
    }

    /// Park a fresh socket in the unbound bucket so that release can treat
    /// every socket uniformly.
    pub fn insert_unbound(&mut self, sk: &Arc<VsockSocket<X>>) {
        self.insert_bound(PORT_ANY, sk);
    }

    pub fn insert_bound(&mut self, port: u32, sk: &Arc<VsockSocket<X>>) {
        debug_assert!(!sk.in_bound_table.load(Ordering::Relaxed));
        self.bound[bound_bucket(port)].push(BoundEntry {
            port,
            sk: Arc::clone(sk),
        });
        sk.in_bound_table.store(true, Ordering::Relaxed);
    }

    /// Remove from the bound table (or the unbound bucket when `port` is
    /// `PORT_ANY`). Returns the reference held by the entry.
    pub fn remove_bound(&mut self, port: u32, sk: &Arc<VsockSocket<X>>) -> Option<Arc<VsockSocket<X>>> {
        let bucket = &mut self.bound[bound_bucket(port)];
        let pos = bucket.iter().position(|e| Arc::ptr_eq(&e.sk, sk))?;
        let entry = bucket.remove(pos);
        sk.in_bound_table.store(false, Ordering::Relaxed);
        Some(entry.sk)
    }

    pub fn find_bound(&self, addr: Addr) -> Option<Arc<VsockSocket<X>>> {
        if addr.port == PORT_ANY {
            // sockets in the unbound bucket are not addressable
            return None;
        }

        self.bound[bound_bucket(addr.port)]
            .iter()
            .find(|e| e.port == addr.port)
            .map(|e| Arc::clone(&e.sk))
    }

    pub fn insert_connected(&mut self, remote: Addr, local_port: u32, sk: &Arc<VsockSocket<X>>) {
        debug_assert!(!sk.in_connected_table.load(Ordering::Relaxed));
        self.connected[connected_bucket(remote, local_port)].push(ConnectedEntry {
            remote,
            local_port,
            sk: Arc::clone(sk),
        });
        sk.in_connected_table.store(true, Ordering::Relaxed);
    }

    pub fn remove_connected(
        &mut self,
        remote: Addr,
        local_port: u32,
        sk: &Arc<VsockSocket<X>>,
    ) -> Option<Arc<VsockSocket<X>>> {
        let bucket = &mut self.connected[connected_bucket(remote, local_port)];
        let pos = bucket.iter().position(|e| Arc::ptr_eq(&e.sk, sk))?;
        let entry = bucket.remove(pos);
        sk.in_connected_table.store(false, Ordering::Relaxed);
        Some(entry.sk)
    }

    /// Full-tuple lookup: `src` is the packet's source (our peer), `dst` the
    /// packet's destination (us). The destination CID is not compared, since
    /// our own CID can legitimately change under us.
    pub fn find_connected(&self, src: Addr, dst: Addr) -> Option<Arc<VsockSocket<X>>> {
        self.connected[connected_bucket(src, dst.port)]
            .iter()
            .find(|e| e.remote == src && e.local_port == dst.port)
            .map(|e| Arc::clone(&e.sk))
    }

    /// All sockets currently in the connected table; used by the VM-resume
    /// sweep.
    pub fn connected_sockets(&self) -> Vec<Arc<VsockSocket<X>>> {
        self.connected
            .iter()
            .flat_map(|bucket| bucket.iter().map(|e| Arc::clone(&e.sk)))
            .collect()
    }

    /// All sockets in the bound table, including the unbound bucket; used to
    /// route peer-detach events to sockets still mid-handshake.
    pub fn bound_sockets(&self) -> Vec<Arc<VsockSocket<X>>> {
        self.bound
            .iter()
            .flat_map(|bucket| bucket.iter().map(|e| Arc::clone(&e.sk)))
            .collect()
    }

    /// Pick an unused non-reserved port, walking a rolling counter. Fails
    /// after [`MAX_PORT_RETRIES`] occupied candidates.
    pub fn select_ephemeral_port(&mut self) -> Option<u32> {
        for _ in 0..MAX_PORT_RETRIES {
            if self.next_ephemeral <= LAST_RESERVED_PORT {
                self.next_ephemeral = LAST_RESERVED_PORT + 1;
            }
            let port = self.next_ephemeral;
            self.next_ephemeral = self.next_ephemeral.wrapping_add(1);

            if self.find_bound(Addr::new(crate::addr::CID_ANY, port)).is_none() {
                return Some(port);
            }
        }

        None
    }
}

/// Pending-list and accept-queue helpers. These lists live on the listener
/// socket (guarded by its lock), not in the global tables; they are grouped
/// here with the rest of the membership bookkeeping.
pub(crate) mod listener {
    use super::*;
    use crate::socket::StreamCore;

    /// Add a child to the listener's pending list. The child's backpointer is
    /// set by the caller, which also accounts the backlog.
    pub fn add_pending<X: Dependencies>(
        listener: &mut StreamCore<X>,
        child: &Arc<VsockSocket<X>>,
    ) {
        debug_assert!(!contains_arc(&listener.pending, child));
        listener.pending.push(Arc::clone(child));
    }

    pub fn remove_pending<X: Dependencies>(
        listener: &mut StreamCore<X>,
        child: &Arc<VsockSocket<X>>,
    ) -> Option<Arc<VsockSocket<X>>> {
        remove_arc(&mut listener.pending, child)
    }

    pub fn is_pending<X: Dependencies>(
        listener: &StreamCore<X>,
        child: &Arc<VsockSocket<X>>,
    ) -> bool {
        contains_arc(&listener.pending, child)
    }

    pub fn enqueue_accept<X: Dependencies>(
        listener: &mut StreamCore<X>,
        child: &Arc<VsockSocket<X>>,
    ) {
        listener.accept_queue.push_back(Arc::clone(child));
    }

    pub fn dequeue_accept<X: Dependencies>(
        listener: &mut StreamCore<X>,
    ) -> Option<Arc<VsockSocket<X>>> {
        listener.accept_queue.pop_front()
    }

    pub fn in_accept_queue<X: Dependencies>(
        listener: &StreamCore<X>,
        child: &Arc<VsockSocket<X>>,
    ) -> bool {
        listener
            .accept_queue
            .iter()
            .any(|e| Arc::ptr_eq(e, child))
    }
}
