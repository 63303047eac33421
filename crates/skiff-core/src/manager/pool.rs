use std::sync::{Arc, Mutex};

use skiff_storage::Backend;
use skiff_types::error::Result;

/// Builds a fresh backend connection on demand.
pub type BackendFactory = Box<dyn Fn() -> Result<Box<dyn Backend>> + Send + Sync>;

/// Pool of idle backend connections, shared by the dispatcher and every
/// in-flight transfer. A handle is exclusively owned while in use and
/// returned (or discarded) on release.
pub(crate) struct BackendPool {
    factory: BackendFactory,
    idle: Mutex<Vec<Box<dyn Backend>>>,
    allow_reuse: bool,
}

impl BackendPool {
    pub fn new(factory: BackendFactory, allow_reuse: bool) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::new()),
            allow_reuse,
        }
    }

    /// Take an idle connection or create a new one.
    pub fn acquire(self: &Arc<Self>) -> Result<ReclaimableBackend> {
        let existing = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let backend = match existing {
            Some(backend) => backend,
            None => (self.factory)()?,
        };
        Ok(ReclaimableBackend {
            backend: Some(backend),
            pool: Arc::clone(self),
            reuse: self.allow_reuse,
        })
    }

    fn release(&self, backend: Box<dyn Backend>) {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(backend);
    }

    /// Dispose every idle connection. Called at dispatcher shutdown.
    pub fn drain(&self) {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A pooled backend handle. Returns the connection to the pool on drop
/// unless reuse was prevented; the flag is checked once, at release.
pub(crate) struct ReclaimableBackend {
    backend: Option<Box<dyn Backend>>,
    pool: Arc<BackendPool>,
    reuse: bool,
}

impl ReclaimableBackend {
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_deref().expect("backend present until drop")
    }

    /// Mark the connection as not safe to hand to another operation.
    /// Called on any failure while the handle was held.
    pub fn prevent_reuse(&mut self) {
        self.reuse = false;
    }
}

impl Drop for ReclaimableBackend {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            if self.reuse {
                self.pool.release(backend);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend;

    impl Backend for CountingBackend {
        fn display_name(&self) -> &str {
            "counting"
        }
        fn list(&self) -> Result<Vec<skiff_types::remote_volume::FileEntry>> {
            Ok(Vec::new())
        }
        fn put(&self, _: &str, _: &std::path::Path) -> Result<()> {
            Ok(())
        }
        fn get(&self, _: &str, _: &std::path::Path) -> Result<()> {
            Ok(())
        }
        fn delete(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn create_folder(&self) -> Result<()> {
            Ok(())
        }
    }

    fn counting_pool(allow_reuse: bool) -> (Arc<BackendPool>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory: BackendFactory = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingBackend))
        });
        (Arc::new(BackendPool::new(factory, allow_reuse)), created)
    }

    #[test]
    fn clean_release_reuses_the_connection() {
        let (pool, created) = counting_pool(true);
        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn prevent_reuse_discards_the_connection() {
        let (pool, created) = counting_pool(true);
        let mut handle = pool.acquire().unwrap();
        handle.prevent_reuse();
        drop(handle);
        assert_eq!(pool.idle_count(), 0);

        drop(pool.acquire().unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reuse_disabled_never_pools() {
        let (pool, created) = counting_pool(false);
        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn drain_empties_the_pool() {
        let (pool, _) = counting_pool(true);
        drop(pool.acquire().unwrap());
        assert_eq!(pool.idle_count(), 1);
        pool.drain();
        assert_eq!(pool.idle_count(), 0);
    }
}
