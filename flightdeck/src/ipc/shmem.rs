//! POSIX shared memory mappings with typestate-based cleanup.
//!
//! Every cross-process object in flightdeck (the exit flag, each channel
//! ring) lives in a named POSIX shared memory object. The orchestrator creates
//! the objects before forking any worker; workers open them by name.
//!
//! - [`Shm<T, Mode>`]: fixed-size mapping of one `T`, dereferences to `&T`
//! - [`ShmRegion<Mode>`]: byte mapping whose length is decided at runtime
//! - [`Creator`]: creates the object and unlinks its name on drop
//! - [`Opener`]: opens an existing object and only unmaps on drop
//!
//! ```text
//! orchestrator (Creator)          worker (Opener)
//!   shm_open(O_CREAT|O_EXCL)        shm_open(O_RDWR)
//!   ftruncate + mmap                fstat + mmap
//!   ... fork ...                    ...
//!   munmap + shm_unlink             munmap
//! ```
//!
//! A `Creator` mapping inherited by a forked child never unlinks from the
//! child: the unlink is tied to the pid that created the object.

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::os::fd::OwnedFd;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`] and [`ShmRegion`].
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `mmap`, `shm_open`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The existing object has a different size than expected.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// A region layout could not be computed.
    #[error("shared memory `{path}` layout invalid: {reason}")]
    Layout { path: String, reason: &'static str },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// Must start with `/`, contain no further `/`, and be at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates `path` as a shared memory name.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidPath`] if the name breaks a POSIX rule.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_shm_path(&path)?;
        Ok(Self(path))
    }

    /// Generates a name unique to this process and call.
    ///
    /// The name combines `prefix`, the pid, a random nonce and a sanitized
    /// `label`, so two orchestrators never collide and a stale object from a
    /// crashed run is never reopened by accident.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidPath`] if `prefix` contains a `/`.
    pub fn unique(prefix: &str, label: &str) -> Result<Self> {
        let nonce: u32 = rand::random();
        let label: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(64)
            .collect();
        Self::new(format!(
            "/{prefix}-{}-{nonce:08x}-{label}",
            std::process::id()
        ))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

/// Validates that a path meets POSIX `shm_open` requirements.
fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }

    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }

    if path.len() == 1 {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must have a name after '/'",
        });
    }

    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// Cleanup behavior of a mapping, selected by the [`Creator`] and
/// [`Opener`] markers.
pub trait ShmMode {
    /// Whether dropping the mapping removes the name.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker: created the object, unlinks the name on drop.
#[derive(Debug)]
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker: opened an existing object, leaves the name alone.
#[derive(Debug)]
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in POSIX shared memory.
///
/// # Safety
///
/// Implementers must guarantee that the type:
/// - is `#[repr(C)]` or `#[repr(transparent)]`,
/// - holds no pointers, references or heap allocations,
/// - only has `SharedMemorySafe` fields,
/// - stays sound when `Drop` never runs (a `SIGKILL`ed worker skips it),
/// - synchronizes concurrent access through atomics.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Opens (or creates) the object and returns the descriptor.
fn open_fd(path: &ShmPath, create: bool) -> Result<OwnedFd> {
    let (flags, mode) = if create {
        (
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
    } else {
        (shm::OFlags::RDWR, Mode::empty())
    };
    shm::open(path.as_str(), flags, mode).map_err(|err| ShmError::posix("shm_open", path, err))
}

/// Maps `len` bytes of `fd` read-write and shared.
fn map_fd(fd: &OwnedFd, len: usize, path: &ShmPath) -> Result<NonNull<u8>> {
    // SAFETY: a fresh mapping chosen by the kernel never aliases a Rust
    // object. The object holds at least `len` bytes (ftruncate or fstat
    // checked by the caller) and the result is page aligned.
    let ptr = unsafe {
        mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ShmError::Layout {
        path: path.to_string(),
        reason: "mmap returned null",
    })
}

/// Creates an object of exactly `len` bytes and maps it.
fn create_mapping(path: &ShmPath, len: usize) -> Result<NonNull<u8>> {
    let fd = open_fd(path, true)?;

    if let Err(err) = ftruncate(&fd, len as u64) {
        drop(fd);
        let _ = shm::unlink(path.as_str());
        return Err(ShmError::posix("ftruncate", path, err));
    }

    match map_fd(&fd, len, path) {
        Ok(ptr) => Ok(ptr),
        Err(err) => {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            Err(err)
        }
    }
}

/// Opens an existing object, checks its size with `check`, and maps it.
fn open_mapping(
    path: &ShmPath,
    check: impl FnOnce(i64) -> Result<usize>,
) -> Result<(NonNull<u8>, usize)> {
    let fd = open_fd(path, false)?;
    let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
    let len = check(stat.st_size)?;
    let ptr = map_fd(&fd, len, path)?;
    Ok((ptr, len))
}

fn unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: `ptr`/`len` describe a mapping created by `map_fd` that is
    // being dropped, so no reference into it outlives this call.
    unsafe {
        let _ = munmap(ptr.as_ptr().cast(), len);
    }
}

/// Smart pointer to one `T` in POSIX shared memory.
///
/// `Shm<T, Creator>` initializes the value with `T::default()`; the
/// `Opener` side requires the object to be exactly `size_of::<T>()` bytes.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    path: ShmPath,
    owner_pid: u32,
    _mode: PhantomData<Mode>,
}

// SAFETY: T: SharedMemorySafe requires Send + Sync and the pointer targets
// process-shared memory rather than thread-local data.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

impl<T: SharedMemorySafe + Default> Shm<T, Creator> {
    /// Creates the object at `path`, sizes it for `T` and writes `T::default()`.
    ///
    /// # Errors
    ///
    /// Fails if the path is taken (`EEXIST`), on permission errors, or when
    /// the mapping cannot be created.
    ///
    /// # Panics
    ///
    /// Propagates a panic from `T::default()` after unmapping and unlinking.
    pub fn create(path: ShmPath) -> Result<Self> {
        let ptr = create_mapping(&path, size_of::<T>())?;
        let shm = Self {
            ptr: ptr.cast::<T>(),
            path,
            owner_pid: std::process::id(),
            _mode: PhantomData,
        };

        let init = catch_unwind(AssertUnwindSafe(|| unsafe {
            std::ptr::write(shm.ptr.as_ptr(), T::default());
        }));
        match init {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Opens the object at `path` and maps it.
    ///
    /// # Errors
    ///
    /// Fails if the object does not exist, or with
    /// [`ShmError::SizeMismatch`] when its size is not `size_of::<T>()`.
    pub fn open(path: ShmPath) -> Result<Self> {
        let (ptr, _) = open_mapping(&path, |actual| {
            if actual != size_of::<T>() as i64 {
                return Err(ShmError::SizeMismatch {
                    path: path.to_string(),
                    expected: size_of::<T>(),
                    actual,
                });
            }
            Ok(size_of::<T>())
        })?;
        Ok(Self {
            ptr: ptr.cast::<T>(),
            path,
            owner_pid: std::process::id(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// Returns the name of the underlying object.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        unmap(self.ptr.cast::<u8>(), size_of::<T>());
        if Mode::SHOULD_UNLINK && self.owner_pid == std::process::id() {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the mapping stays valid until drop and was initialized by
        // the creator before its name was handed to anyone.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> fmt::Debug for Shm<T, Mode> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shm")
            .field("path", &self.path)
            .field("size", &size_of::<T>())
            .finish()
    }
}

/// A byte-addressed shared memory mapping with a runtime length.
///
/// Layout inside the region is the caller's business; the region only
/// guarantees the pointer is page aligned and valid for [`len`](Self::len)
/// bytes until drop.
pub struct ShmRegion<Mode: ShmMode> {
    ptr: NonNull<u8>,
    len: usize,
    path: ShmPath,
    owner_pid: u32,
    _mode: PhantomData<Mode>,
}

// SAFETY: the region is plain shared memory; all concurrent access to its
// contents goes through atomics in the layouts built on top of it.
unsafe impl<Mode: ShmMode> Send for ShmRegion<Mode> {}
unsafe impl<Mode: ShmMode> Sync for ShmRegion<Mode> {}

impl ShmRegion<Creator> {
    /// Creates a zero-filled region of `len` bytes and lets `init` lay it out
    /// before the region is returned.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Shm::create`], plus [`ShmError::Layout`] for a
    /// zero length.
    pub fn create(path: ShmPath, len: usize, init: impl FnOnce(NonNull<u8>, usize)) -> Result<Self> {
        if len == 0 {
            return Err(ShmError::Layout {
                path: path.to_string(),
                reason: "region length must be non-zero",
            });
        }
        let ptr = create_mapping(&path, len)?;
        let region = Self {
            ptr,
            len,
            path,
            owner_pid: std::process::id(),
            _mode: PhantomData,
        };

        match catch_unwind(AssertUnwindSafe(|| init(region.ptr, region.len))) {
            Ok(()) => Ok(region),
            Err(payload) => {
                drop(region);
                resume_unwind(payload);
            }
        }
    }
}

impl ShmRegion<Opener> {
    /// Opens an existing region of at least `min_len` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the object does not exist or is smaller than `min_len`.
    pub fn open(path: ShmPath, min_len: usize) -> Result<Self> {
        let (ptr, len) = open_mapping(&path, |actual| {
            if actual < min_len as i64 || actual <= 0 {
                return Err(ShmError::SizeMismatch {
                    path: path.to_string(),
                    expected: min_len,
                    actual,
                });
            }
            Ok(actual as usize)
        })?;
        Ok(Self {
            ptr,
            len,
            path,
            owner_pid: std::process::id(),
            _mode: PhantomData,
        })
    }
}

impl<Mode: ShmMode> ShmRegion<Mode> {
    /// Base address of the mapping.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Regions are never empty; provided for API symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the name of the underlying object.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<Mode: ShmMode> Drop for ShmRegion<Mode> {
    fn drop(&mut self) {
        unmap(self.ptr, self.len);
        if Mode::SHOULD_UNLINK && self.owner_pid == std::process::id() {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<Mode: ShmMode> fmt::Debug for ShmRegion<Mode> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Default)]
    struct Counter {
        value: AtomicU64,
        flag: AtomicBool,
    }

    unsafe impl SharedMemorySafe for Counter {}

    #[repr(C)]
    #[derive(Default)]
    struct Wide {
        a: AtomicU64,
        b: AtomicU64,
        c: AtomicU64,
    }

    unsafe impl SharedMemorySafe for Wide {}

    fn test_path(label: &str) -> ShmPath {
        ShmPath::unique("flightdeck-test", label).unwrap()
    }

    #[test]
    fn test_shm_creator_and_opener_share_memory() -> Result<()> {
        let path = test_path("counter");
        let creator = Shm::<Counter, Creator>::create(path.clone())?;
        creator.value.store(100, Ordering::SeqCst);

        {
            let opener = Shm::<Counter, Opener>::open(path.clone())?;
            assert_eq!(opener.value.load(Ordering::SeqCst), 100);
            opener.value.store(200, Ordering::SeqCst);
            opener.flag.store(true, Ordering::SeqCst);
        }

        assert_eq!(creator.value.load(Ordering::SeqCst), 200);
        assert!(creator.flag.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_creator_drop_unlinks() -> Result<()> {
        let path = test_path("unlink");
        drop(Shm::<Counter, Creator>::create(path.clone())?);
        let reopened = Shm::<Counter, Opener>::open(path);
        assert!(matches!(reopened, Err(ShmError::Posix { op: "shm_open", .. })));
        Ok(())
    }

    #[test]
    fn test_create_twice_fails() -> Result<()> {
        let path = test_path("twice");
        let _first = Shm::<Counter, Creator>::create(path.clone())?;
        let second = Shm::<Counter, Creator>::create(path);
        assert!(matches!(second, Err(ShmError::Posix { source, .. }) if source == io::Errno::EXIST));
        Ok(())
    }

    #[test]
    fn test_shm_open_size_mismatch() -> Result<()> {
        let path = test_path("mismatch");
        let _small = Shm::<Counter, Creator>::create(path.clone())?;
        match Shm::<Wide, Opener>::open(path) {
            Err(ShmError::SizeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, size_of::<Wide>());
                assert_eq!(actual, size_of::<Counter>() as i64);
            }
            Err(e) => panic!("expected SizeMismatch, got: {e}"),
            Ok(_) => panic!("expected SizeMismatch, but open() succeeded"),
        }
        Ok(())
    }

    #[test]
    fn test_region_init_visible_to_opener() -> Result<()> {
        let path = test_path("region");
        let region = ShmRegion::create(path.clone(), 4096, |ptr, len| unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, len);
        })?;
        assert_eq!(region.len(), 4096);

        let opened = ShmRegion::open(path, 1024)?;
        assert_eq!(opened.len(), 4096);
        let first = unsafe { *opened.as_ptr().as_ptr() };
        let last = unsafe { *opened.as_ptr().as_ptr().add(4095) };
        assert_eq!((first, last), (0xAB, 0xAB));
        Ok(())
    }

    #[test]
    fn test_region_open_too_small() -> Result<()> {
        let path = test_path("small");
        let _region = ShmRegion::create(path.clone(), 128, |_, _| {})?;
        let opened = ShmRegion::open(path, 4096);
        assert!(matches!(opened, Err(ShmError::SizeMismatch { expected: 4096, actual: 128, .. })));
        Ok(())
    }

    #[test]
    fn test_region_zero_length_rejected() {
        let result = ShmRegion::create(test_path("zero"), 0, |_, _| {});
        assert!(matches!(result, Err(ShmError::Layout { .. })));
    }

    #[test]
    fn test_validate_shm_path_valid() {
        assert!(validate_shm_path("/valid").is_ok());
        assert!(validate_shm_path("/valid-name").is_ok());
        assert!(validate_shm_path("/valid_name_123").is_ok());
    }

    #[test]
    fn test_validate_shm_path_rejects() {
        assert!(matches!(
            validate_shm_path("no-slash"),
            Err(ShmError::InvalidPath { reason, .. }) if reason == "path must start with '/'"
        ));
        assert!(matches!(
            validate_shm_path("/foo/bar"),
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path must not contain additional '/' characters"
        ));
        assert!(matches!(validate_shm_path("/"), Err(ShmError::InvalidPath { .. })));
    }

    #[test]
    fn test_validate_shm_path_length_limit() {
        let max_path = format!("/{}", "a".repeat(254));
        assert!(validate_shm_path(&max_path).is_ok());

        let long_path = format!("/{}", "a".repeat(255));
        assert!(matches!(
            validate_shm_path(&long_path),
            Err(ShmError::InvalidPath { reason, .. }) if reason == "path length must be <= 255 bytes"
        ));
    }

    #[test]
    fn test_unique_path_sanitizes_label() {
        let path = ShmPath::unique("flightdeck", "telemetry to/command").unwrap();
        let s = path.as_str();
        assert!(s.starts_with("/flightdeck-"));
        assert!(s.ends_with("-telemetry_to_command"));
        assert_eq!(s.matches('/').count(), 1);
    }

    #[test]
    fn test_unique_paths_differ() {
        let a = ShmPath::unique("flightdeck", "x").unwrap();
        let b = ShmPath::unique("flightdeck", "x").unwrap();
        assert_ne!(a, b);
    }
}
