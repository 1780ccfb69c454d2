// src/slab.rs
use crate::conn::Conn;

const NIL: usize = usize::MAX;

enum Entry {
    /// On the free list. Keeps the `Conn` it last held so its buffers are
    /// re-used by the next connection in this slot.
    Free { next: usize, conn: Option<Box<Conn>> },
    /// Owned by the reactor, registered with epoll and waiting for an event.
    Parked(Box<Conn>),
    /// Handed to a worker.
    Busy,
}

/// Fixed-capacity table of connections indexed by epoll token.
///
/// Slots are created on demand up to `capacity` and never shrink.
pub struct ConnectionSlab {
    entries: Vec<Entry>,
    head_free: usize,
    active_count: usize,
    capacity: usize,
}

impl ConnectionSlab {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.min(1024)),
            head_free: NIL,
            active_count: 0,
            capacity,
        }
    }

    /// O(1) allocation. Re-uses the `Conn` left in a free slot, otherwise
    /// builds one with `make`. The new entry is parked and returned for
    /// initialisation. Returns `None` at capacity.
    pub fn allocate(&mut self, make: impl FnOnce() -> Box<Conn>) -> Option<(usize, &mut Conn)> {
        let idx = if self.head_free != NIL {
            let idx = self.head_free;
            let Entry::Free { next, conn } = &mut self.entries[idx] else {
                unreachable!("free list points at a live slot");
            };
            self.head_free = *next;
            let conn = conn.take().unwrap_or_else(make);
            self.entries[idx] = Entry::Parked(conn);
            idx
        } else if self.entries.len() < self.capacity {
            self.entries.push(Entry::Parked(make()));
            self.entries.len() - 1
        } else {
            return None;
        };

        self.active_count += 1;
        match &mut self.entries[idx] {
            Entry::Parked(conn) => Some((idx, &mut **conn)),
            _ => None,
        }
    }

    /// Move a parked connection out so a worker can drive it.
    pub fn take(&mut self, index: usize) -> Option<Box<Conn>> {
        let entry = self.entries.get_mut(index)?;
        if !matches!(entry, Entry::Parked(_)) {
            return None;
        }
        match std::mem::replace(entry, Entry::Busy) {
            Entry::Parked(conn) => Some(conn),
            _ => None,
        }
    }

    /// Put a connection handed out by [`take`](Self::take) back in its slot.
    pub fn park(&mut self, index: usize, conn: Box<Conn>) {
        match self.entries.get_mut(index) {
            Some(entry @ Entry::Busy) => *entry = Entry::Parked(conn),
            _ => tracing::error!(index, "park on a slot that was not handed out"),
        }
    }

    /// O(1) deallocation: returns the slot to the free list. `conn` is kept
    /// for re-use; pass `None` when it was lost (a panicking worker).
    pub fn release(&mut self, index: usize, conn: Option<Box<Conn>>) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        let conn = match std::mem::replace(entry, Entry::Busy) {
            Entry::Parked(parked) => Some(parked),
            Entry::Busy => conn,
            free @ Entry::Free { .. } => {
                // Double free prevention
                *entry = free;
                return;
            }
        };
        *entry = Entry::Free {
            next: self.head_free,
            conn,
        };
        self.head_free = index;
        self.active_count -= 1;
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Conn> {
        match self.entries.get_mut(index)? {
            Entry::Parked(conn) => Some(&mut **conn),
            _ => None,
        }
    }

    pub fn get(&self, index: usize) -> Option<&Conn> {
        match self.entries.get(index)? {
            Entry::Parked(conn) => Some(&**conn),
            _ => None,
        }
    }

    pub fn is_busy(&self, index: usize) -> bool {
        matches!(self.entries.get(index), Some(Entry::Busy))
    }

    /// Parked connections with their tokens.
    pub fn parked(&self) -> impl Iterator<Item = (usize, &Conn)> + '_ {
        self.entries.iter().enumerate().filter_map(|(idx, entry)| match entry {
            Entry::Parked(conn) => Some((idx, &**conn)),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServerMetrics;
    use crate::resolver::Resolver;
    use std::sync::Arc;

    fn maker() -> impl Fn() -> Box<Conn> {
        let resolver = Arc::new(Resolver::new("/tmp").unwrap());
        let metrics = Arc::new(ServerMetrics::new());
        move || Box::new(Conn::new(resolver.clone(), metrics.clone()))
    }

    #[test]
    fn test_slab_operations() {
        let make = maker();
        let mut slab = ConnectionSlab::new(2);
        assert!(slab.is_empty());
        assert_eq!(slab.capacity(), 2);

        let (idx1, _) = slab.allocate(&make).unwrap();
        assert_eq!(idx1, 0);
        let (idx2, _) = slab.allocate(&make).unwrap();
        assert_eq!(idx2, 1);
        assert!(slab.allocate(&make).is_none());

        slab.release(idx1, None);
        assert_eq!(slab.len(), 1);

        // Index 0 is at the head of the free list.
        let (idx3, _) = slab.allocate(&make).unwrap();
        assert_eq!(idx3, 0);
    }

    #[test]
    fn released_conn_is_reused() {
        let make = maker();
        let mut slab = ConnectionSlab::new(4);
        let (idx, conn) = slab.allocate(&make).unwrap();
        let addr = conn as *const Conn;

        let conn = slab.take(idx).unwrap();
        assert!(slab.is_busy(idx));
        assert!(slab.get(idx).is_none());
        slab.release(idx, Some(conn));
        assert!(slab.is_empty());

        let (again, conn) = slab.allocate(|| panic!("slot should be recycled")).unwrap();
        assert_eq!(again, idx);
        assert_eq!(conn as *const Conn, addr);
    }

    #[test]
    fn take_and_park() {
        let make = maker();
        let mut slab = ConnectionSlab::new(4);
        let (idx, _) = slab.allocate(&make).unwrap();

        let conn = slab.take(idx).unwrap();
        assert!(slab.take(idx).is_none());
        slab.park(idx, conn);
        assert!(slab.get_mut(idx).is_some());
        assert_eq!(slab.parked().count(), 1);
    }

    #[test]
    fn double_release_is_ignored() {
        let make = maker();
        let mut slab = ConnectionSlab::new(4);
        let (idx, _) = slab.allocate(&make).unwrap();
        slab.allocate(&make).unwrap();
        slab.release(idx, None);
        slab.release(idx, None);
        assert_eq!(slab.len(), 1);
    }
}
