//! Cross-process exit signal.
//!
//! [`ExitSignal`] is the orchestrator's owning side: it creates the shared
//! flag before any worker is spawned and is the only side that can
//! [`clear`](ExitSignal::clear) it. Workers receive an [`ExitHandle`], which
//! reads the flag and may raise it to escalate a failure, but cannot reset it.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::ipc::shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmPath};

#[repr(C)]
#[derive(Default)]
struct ExitFlag {
    raised: AtomicBool,
}

// SAFETY: repr(C), a single atomic field.
unsafe impl SharedMemorySafe for ExitFlag {}

/// Owning side of the exit flag.
#[derive(Debug)]
pub struct ExitSignal {
    flag: Shm<ExitFlag, Creator>,
}

impl ExitSignal {
    /// Creates a fresh, lowered flag under a unique name.
    ///
    /// # Errors
    ///
    /// Fails if the shared memory object cannot be created.
    pub fn create(prefix: &str) -> Result<Self, ShmError> {
        let path = ShmPath::unique(prefix, "exit")?;
        Ok(Self {
            flag: Shm::create(path)?,
        })
    }

    /// Whether shutdown was requested. Wait-free.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.flag.raised.load(Ordering::Acquire)
    }

    /// Requests shutdown from every process. Idempotent.
    pub fn raise(&self) {
        self.flag.raised.store(true, Ordering::Release);
    }

    /// Lowers the flag for another run.
    ///
    /// Only meaningful once every pool that saw the flag has been joined.
    pub fn clear(&self) {
        self.flag.raised.store(false, Ordering::Release);
    }

    /// Opens a worker-side handle in this process.
    ///
    /// # Errors
    ///
    /// Fails if the shared memory object cannot be opened.
    pub fn handle(&self) -> Result<ExitHandle, ShmError> {
        ExitHandle::open(self.flag.path().clone())
    }

    /// Name of the underlying shared memory object.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        self.flag.path()
    }
}

/// Worker side of the exit flag.
#[derive(Debug)]
pub struct ExitHandle {
    flag: Shm<ExitFlag, Opener>,
}

impl ExitHandle {
    /// Opens the flag published at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the object does not exist or has the wrong size.
    pub fn open(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            flag: Shm::open(path)?,
        })
    }

    /// Whether shutdown was requested. Wait-free.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.flag.raised.load(Ordering::Acquire)
    }

    /// Requests shutdown of the whole pipeline.
    pub fn raise(&self) {
        self.flag.raised.store(true, Ordering::Release);
    }

    /// Name of the flag this handle watches.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        self.flag.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_lowered() {
        let exit = ExitSignal::create("flightdeck-test").unwrap();
        assert!(!exit.is_raised());
    }

    #[test]
    fn test_raise_is_idempotent_and_clear_resets() {
        let exit = ExitSignal::create("flightdeck-test").unwrap();
        exit.raise();
        exit.raise();
        assert!(exit.is_raised());
        exit.clear();
        assert!(!exit.is_raised());
    }

    #[test]
    fn test_handle_sees_owner_and_escalates() {
        let exit = ExitSignal::create("flightdeck-test").unwrap();
        let handle = exit.handle().unwrap();
        assert_eq!(handle.path(), exit.path());
        assert!(!handle.is_raised());

        exit.raise();
        assert!(handle.is_raised());

        exit.clear();
        assert!(!handle.is_raised());
        handle.raise();
        assert!(exit.is_raised());
    }

    #[test]
    fn test_raise_visible_across_threads() {
        let exit = ExitSignal::create("flightdeck-test").unwrap();
        let handle = exit.handle().unwrap();
        let waiter = std::thread::spawn(move || {
            while !handle.is_raised() {
                std::thread::yield_now();
            }
        });
        exit.raise();
        waiter.join().unwrap();
    }
}
