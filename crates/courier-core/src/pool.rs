//! Object pools for the hot path.
//!
//! A [`Pool`] hands out instances of one type and takes them back for
//! reuse. Rented instances carry a [`PoolTag`] naming the pool and the lease
//! they were rented under; with integrity checks enabled the pool rejects
//! instances it did not hand out and instances returned twice.
//!
//! [`BufferPool`] groups byte-buffer pools into power-of-two size classes
//! and backs the frame assembler.

use crossbeam_queue::SegQueue;
use dashmap::DashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::trace;

/// Source of pool identities. Only used to tell pools apart.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Default number of idle instances a pool keeps.
pub const DEFAULT_MAX_IDLE: usize = 256;

/// Pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The instance was not rented from this pool, or was already returned.
    #[error("Pool integrity violation in pool {pool}: {reason}")]
    IntegrityViolation { pool: u64, reason: &'static str },
}

/// Identity stamped on an instance while it is rented out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolTag {
    /// Pool the instance was rented from.
    pub pool: u64,
    /// Lease number, unique per rent within that pool.
    pub lease: u64,
}

/// A type that can live in a [`Pool`].
pub trait Poolable: Send {
    /// The tag of the current lease, if any.
    fn tag(&self) -> Option<PoolTag>;

    /// Stamp the instance with a new lease.
    fn set_tag(&mut self, tag: PoolTag);

    /// Clear per-use state before the instance is reused.
    fn reset(&mut self) {}
}

/// Pool construction options.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Idle instances kept for reuse; extras are dropped on return.
    pub max_idle: usize,
    /// Track outstanding leases and reject foreign or repeated returns.
    pub integrity_checks: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            integrity_checks: cfg!(debug_assertions),
        }
    }
}

/// A pool of reusable instances of `T`.
pub struct Pool<T: Poolable> {
    id: u64,
    free: SegQueue<T>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    created: AtomicUsize,
    next_lease: AtomicU64,
    outstanding: Option<DashSet<u64>>,
    max_idle: usize,
}

impl<T: Poolable> Pool<T> {
    /// Create a pool with default options.
    #[must_use]
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::with_options(factory, PoolOptions::default())
    }

    /// Create a pool with explicit options.
    #[must_use]
    pub fn with_options(
        factory: impl Fn() -> T + Send + Sync + 'static,
        options: PoolOptions,
    ) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            free: SegQueue::new(),
            factory: Box::new(factory),
            created: AtomicUsize::new(0),
            next_lease: AtomicU64::new(1),
            outstanding: options.integrity_checks.then(DashSet::new),
            max_idle: options.max_idle,
        }
    }

    /// This pool's identity.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Rent an instance, reusing an idle one when available.
    pub fn rent(&self) -> T {
        let mut item = self.free.pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            (self.factory)()
        });

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        item.set_tag(PoolTag {
            pool: self.id,
            lease,
        });
        if let Some(outstanding) = &self.outstanding {
            outstanding.insert(lease);
        }

        item
    }

    /// Return an instance for reuse.
    ///
    /// # Errors
    ///
    /// With integrity checks enabled, returns
    /// [`PoolError::IntegrityViolation`] if the instance was not rented from
    /// this pool or its lease was already returned.
    pub fn give_back(&self, mut item: T) -> Result<(), PoolError> {
        if let Some(outstanding) = &self.outstanding {
            match item.tag() {
                Some(tag) if tag.pool == self.id => {
                    if outstanding.remove(&tag.lease).is_none() {
                        return Err(PoolError::IntegrityViolation {
                            pool: self.id,
                            reason: "instance returned twice",
                        });
                    }
                }
                _ => {
                    return Err(PoolError::IntegrityViolation {
                        pool: self.id,
                        reason: "instance was not rented from this pool",
                    });
                }
            }
        }

        item.reset();
        if self.free.len() < self.max_idle {
            self.free.push(item);
        } else {
            trace!(pool = self.id, "Pool full, dropping returned instance");
        }
        Ok(())
    }

    /// Number of instances the factory has constructed.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of idle instances ready to rent.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of leases not yet returned (only tracked with integrity checks).
    #[must_use]
    pub fn outstanding(&self) -> Option<usize> {
        self.outstanding.as_ref().map(|leases| leases.len())
    }
}

impl<T: Poolable> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("created", &self.created())
            .field("available", &self.available())
            .field("integrity_checks", &self.outstanding.is_some())
            .finish()
    }
}

/// A fixed-capacity byte buffer rented from a [`BufferPool`].
#[derive(Debug, Clone)]
pub struct PooledBuffer {
    data: Vec<u8>,
    tag: Option<PoolTag>,
}

impl PooledBuffer {
    /// Allocate a zeroed buffer that belongs to no pool.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            tag: None,
        }
    }

    /// Usable size in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Poolable for PooledBuffer {
    fn tag(&self) -> Option<PoolTag> {
        self.tag
    }

    fn set_tag(&mut self, tag: PoolTag) {
        self.tag = Some(tag);
    }
}

/// Byte buffers in power-of-two size classes.
///
/// Requests larger than the biggest class get a one-off buffer that is
/// dropped instead of pooled when given back.
#[derive(Debug)]
pub struct BufferPool {
    min_size: usize,
    classes: Vec<(usize, Pool<PooledBuffer>)>,
    integrity_checks: bool,
}

impl BufferPool {
    /// Create size classes from `min_size` up to at least `max_size`.
    #[must_use]
    pub fn new(min_size: usize, max_size: usize, integrity_checks: bool) -> Self {
        let min_size = min_size.max(64).next_power_of_two();
        let options = PoolOptions {
            max_idle: 64,
            integrity_checks,
        };

        let mut classes = Vec::new();
        let mut size = min_size;
        loop {
            classes.push((
                size,
                Pool::with_options(move || PooledBuffer::with_capacity(size), options),
            ));
            if size >= max_size {
                break;
            }
            size *= 2;
        }

        Self {
            min_size,
            classes,
            integrity_checks,
        }
    }

    fn class_for(&self, capacity: usize) -> Option<&Pool<PooledBuffer>> {
        let size = capacity.max(self.min_size).checked_next_power_of_two()?;
        let index = (size / self.min_size).trailing_zeros() as usize;
        self.classes.get(index).map(|(_, pool)| pool)
    }

    /// Rent a buffer holding at least `min_capacity` bytes.
    pub fn rent(&self, min_capacity: usize) -> PooledBuffer {
        match self.class_for(min_capacity) {
            Some(pool) => pool.rent(),
            None => PooledBuffer::with_capacity(min_capacity),
        }
    }

    /// Give a buffer back to its size class.
    ///
    /// # Errors
    ///
    /// With integrity checks enabled, fails for buffers that no class of
    /// this pool handed out, or that were already returned.
    pub fn give_back(&self, buffer: PooledBuffer) -> Result<(), PoolError> {
        let Some(tag) = buffer.tag else {
            return Ok(());
        };

        match self.classes.iter().find(|(_, pool)| pool.id() == tag.pool) {
            Some((_, pool)) => pool.give_back(buffer),
            None if self.integrity_checks => Err(PoolError::IntegrityViolation {
                pool: tag.pool,
                reason: "buffer was not rented from this pool",
            }),
            None => Ok(()),
        }
    }

    /// Largest pooled buffer size.
    #[must_use]
    pub fn max_pooled_size(&self) -> usize {
        self.classes.last().map(|(size, _)| *size).unwrap_or(self.min_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Widget {
        value: u32,
        tag: Option<PoolTag>,
    }

    impl Poolable for Widget {
        fn tag(&self) -> Option<PoolTag> {
            self.tag
        }

        fn set_tag(&mut self, tag: PoolTag) {
            self.tag = Some(tag);
        }

        fn reset(&mut self) {
            self.value = 0;
        }
    }

    fn checked_pool() -> Pool<Widget> {
        Pool::with_options(
            Widget::default,
            PoolOptions {
                max_idle: 8,
                integrity_checks: true,
            },
        )
    }

    #[test]
    fn test_rent_return_reuses_instance() {
        let pool = checked_pool();

        let mut widget = pool.rent();
        widget.value = 7;
        pool.give_back(widget).unwrap();

        let widget = pool.rent();
        assert_eq!(pool.created(), 1);
        assert_eq!(widget.value, 0);
        assert_eq!(pool.outstanding(), Some(1));
    }

    #[test]
    fn test_double_return_rejected() {
        let pool = checked_pool();

        let widget = pool.rent();
        let copy = widget.clone();
        pool.give_back(widget).unwrap();

        assert!(matches!(
            pool.give_back(copy),
            Err(PoolError::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_foreign_instance_rejected() {
        let pool = checked_pool();
        let other = checked_pool();

        assert!(pool.give_back(Widget::default()).is_err());
        assert!(pool.give_back(other.rent()).is_err());
    }

    #[test]
    fn test_unchecked_pool_accepts_anything() {
        let pool = Pool::with_options(
            Widget::default,
            PoolOptions {
                max_idle: 8,
                integrity_checks: false,
            },
        );

        let widget = pool.rent();
        let copy = widget.clone();
        pool.give_back(widget).unwrap();
        pool.give_back(copy).unwrap();
        assert_eq!(pool.outstanding(), None);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_max_idle_bound() {
        let pool = Pool::with_options(
            Widget::default,
            PoolOptions {
                max_idle: 1,
                integrity_checks: true,
            },
        );

        let a = pool.rent();
        let b = pool.rent();
        pool.give_back(a).unwrap();
        pool.give_back(b).unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_buffer_pool_size_classes() {
        let pool = BufferPool::new(1024, 8192, true);

        let small = pool.rent(10);
        assert_eq!(small.capacity(), 1024);

        let mid = pool.rent(3000);
        assert_eq!(mid.capacity(), 4096);

        let huge = pool.rent(100_000);
        assert_eq!(huge.capacity(), 100_000);
        assert!(huge.tag().is_none());

        pool.give_back(small).unwrap();
        pool.give_back(mid).unwrap();
        pool.give_back(huge).unwrap();

        let again = pool.rent(4096);
        assert_eq!(again.capacity(), 4096);
        assert_eq!(pool.max_pooled_size(), 8192);
    }

    #[test]
    fn test_buffer_pool_rejects_foreign_buffer() {
        let pool = BufferPool::new(1024, 2048, true);
        let other = BufferPool::new(1024, 2048, true);

        assert!(pool.give_back(other.rent(10)).is_err());
    }
}
