//! Session-local request-id allocation.

use std::sync::atomic::{AtomicI64, Ordering};

use fluxmcp_protocol::RequestId;

/// Monotonically increasing request-id source, starting at 1.
///
/// One allocator per session; ids are unique across all concurrently
/// outstanding requests and repeat only after the 64-bit counter wraps.
/// Not exposed to handlers.
#[derive(Debug)]
pub(crate) struct RequestIdAllocator {
    next: AtomicI64,
}

impl RequestIdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Mint a fresh numeric id.
    pub(crate) fn next(&self) -> RequestId {
        RequestId::Number(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() {
        let alloc = RequestIdAllocator::new();
        assert_eq!(alloc.next(), RequestId::Number(1));
        assert_eq!(alloc.next(), RequestId::Number(2));
        assert_eq!(alloc.next(), RequestId::Number(3));
    }

    #[test]
    fn concurrent_mints_are_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let alloc = Arc::new(RequestIdAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| alloc.next()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id minted");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
