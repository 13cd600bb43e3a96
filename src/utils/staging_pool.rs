//! Pool of host staging buffers for host-staged device copies.
//!
//! Buffers are kept per thread and handed back with [`release`] once a copy is done.

use std::cell::RefCell;
use std::collections::VecDeque;

thread_local! {
    static POOL: RefCell<VecDeque<Vec<u8>>> = const { RefCell::new(VecDeque::new()) };
}

/// Buffers smaller than this are dropped instead of pooled.
const MIN_POOL_CAPACITY: usize = 4096;

/// Maximum number of buffers kept per thread.
const MAX_POOL_SIZE: usize = 8;

/// Acquire a zeroed staging buffer of exactly `size` bytes, reusing pooled capacity.
pub fn acquire(size: usize) -> Vec<u8> {
    POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if let Some(pos) = pool.iter().position(|b| b.capacity() >= size) {
            if let Some(mut buf) = pool.remove(pos) {
                buf.resize(size, 0);
                return buf;
            }
        }
        vec![0; size]
    })
}

/// Return a staging buffer to this thread's pool.
pub fn release(mut buf: Vec<u8>) {
    if buf.capacity() < MIN_POOL_CAPACITY {
        return;
    }
    POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() >= MAX_POOL_SIZE {
            return;
        }
        buf.clear();
        pool.push_back(buf);
    });
}

/// Number of buffers pooled on the current thread.
pub fn pooled() -> usize {
    POOL.with(|pool| pool.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reuses_capacity() {
        let b = acquire(8192);
        assert_eq!(b.len(), 8192);
        let before = pooled();
        release(b);
        assert_eq!(pooled(), before + 1);
        let b2 = acquire(100);
        assert_eq!(b2.len(), 100);
        assert!(b2.capacity() >= 8192);
        assert!(b2.iter().all(|&x| x == 0));
        assert_eq!(pooled(), before);
    }

    #[test]
    fn small_buffers_are_not_pooled() {
        let before = pooled();
        release(acquire(16));
        assert_eq!(pooled(), before);
    }
}
