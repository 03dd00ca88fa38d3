//! The process-shared backing for the pool registry: an anonymous shared
//! mapping plus the spin lock that serializes every mutation of it.
//!
//! The mapping must be created by the supervisor before any worker is forked;
//! children inherit it at the same address, so a [`PoolRegistry`] handle built
//! over it remains valid on both sides of the fork.
//!
//! [`PoolRegistry`]: crate::registry::PoolRegistry

use std::{
    ffi::c_void,
    hint::spin_loop,
    num::NonZeroUsize,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::{Error, Result};

/// An anonymous `MAP_SHARED` region. Unmapped on drop; after a fork each
/// process unmaps its own address space, so the region lives until the last
/// process holding it exits or drops it.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the region is plain memory; all access discipline is imposed by the
// registry lock built on top of it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Maps `len` zeroed bytes shared between this process and every child
    /// forked after the call.
    pub fn anonymous(len: usize) -> Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| Error::invalid_argument("shared region length must be nonzero"))?;
        // SAFETY: anonymous MAP_SHARED mapping with no backing fd; the
        // returned pointer is the sole owner, unmapped once in `Drop`.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }?;
        Ok(Self { ptr, len })
    }

    /// The mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty. Always false for a mapped region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!(error = %err, "failed to unmap pool registry region");
        }
    }
}

/// A ticket spin lock living in shared memory. FIFO across processes: each
/// acquirer takes the next ticket and spins until `serving` reaches it.
///
/// Critical sections under this lock are bounded by one scan of the slot
/// array, so plain spinning (with a pause hint) is sufficient; there is no
/// sleeping waiter to hand off to.
#[repr(C)]
pub(crate) struct TicketLock {
    next: AtomicU32,
    serving: AtomicU32,
}

impl TicketLock {
    /// Resets the lock to the released state. Called once, by the supervisor,
    /// while no other process can observe the region.
    pub(crate) fn init(&self) {
        self.next.store(0, Ordering::Relaxed);
        self.serving.store(0, Ordering::Relaxed);
    }

    pub(crate) fn lock(&self) -> TicketGuard<'_> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        // Acquire so the previous holder's writes are visible once our ticket
        // comes up. Wraparound is harmless: equality is all that matters.
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
        TicketGuard { lock: self }
    }
}

pub(crate) struct TicketGuard<'a> {
    lock: &'a TicketLock,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.lock.serving.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use std::{mem, sync::atomic::Ordering, thread};

    use super::{SharedRegion, TicketLock};

    #[test]
    fn shared_region_is_zeroed() {
        let region = SharedRegion::anonymous(4096).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr().as_ptr(), region.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn ticket_lock_serializes_increments() {
        let region = SharedRegion::anonymous(mem::size_of::<TicketLock>() + 8).unwrap();
        let lock: &TicketLock = unsafe { &*region.as_ptr().as_ptr().cast() };
        lock.init();
        let counter_addr =
            unsafe { region.as_ptr().as_ptr().add(mem::size_of::<TicketLock>()) } as usize;

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(move || {
                    let counter = counter_addr as *mut u64;
                    for _ in 0..10_000 {
                        let _guard = lock.lock();
                        // Exclusive access is provided by the guard held above.
                        unsafe { counter.write(counter.read() + 1) };
                    }
                });
            }
        });

        let _guard = lock.lock();
        assert_eq!(unsafe { (counter_addr as *const u64).read() }, 40_000);
        assert_eq!(lock.next.load(Ordering::Relaxed), 40_001);
    }
}
