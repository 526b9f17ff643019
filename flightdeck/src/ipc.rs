//! Shared memory primitives underneath channels and the exit signal.

pub mod backoff;
pub(crate) mod ring;
pub mod shmem;

pub use backoff::Timeout;
