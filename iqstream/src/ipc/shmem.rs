//! POSIX shared memory holding the producer arena.
//!
//! On target hardware the descriptor ring lives in a reserved physical window
//! that a platform bridge exposes as a named shared-memory object; on a
//! development host the [`crate::sim`] producer creates the same object. Either
//! way the consumer only ever sees a `&DmaRegion<N>` through [`Shm`].
//!
//! - [`Shm<T, Mode>`] - Mapping with typestate-based cleanup
//! - [`SharedMemorySafe`] - Types whose layout and zero state are fixed
//! - [`Creator`] - Creates the object, unlinks on drop
//! - [`Opener`] - Attaches to an existing object, never unlinks
//!
//! ```no_run
//! use iqstream::ipc::shmem::{Creator, Opener, Shm};
//! use iqstream::ring::DmaRegion;
//!
//! // Producer side (simulator or platform bridge)
//! let arena = Shm::<DmaRegion<1024>, Creator>::create("/iqstream-rx")?;
//! arena.status.publish_head(0);
//!
//! // Consumer side
//! let arena = Shm::<DmaRegion<1024>, Opener>::open("/iqstream-rx")?;
//! let head = arena.status.head();
//! # Ok::<(), iqstream::ipc::shmem::ShmError>(())
//! ```
//!
//! Unlike a heap value, a freshly created object is not initialised by
//! writing `T::default()` through the mapping: `ftruncate` hands back zeroed
//! pages and [`SharedMemorySafe`] requires the all-zero pattern to be a valid
//! `T`. This keeps multi-megabyte arenas off the stack.

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`].
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `mmap`, `shm_open`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    PosixError {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The existing shared memory object has a different size than `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

/// Cleanup behaviour of a mapping, fixed by its typestate.
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Creates the object; unmaps and unlinks on drop.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Attaches to an existing object; unmaps only on drop.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in memory shared with another process or a remote
/// DMA engine.
///
/// # Safety
///
/// Implementers must guarantee:
///
/// | Property | Requirement |
/// |----------|-------------|
/// | Layout | `#[repr(C)]` or `#[repr(transparent)]` |
/// | Zero state | The all-zero bit pattern is a valid, meaningful value |
/// | Pointers | None: no `Box`, `Vec`, references or raw pointers |
/// | Fields | Every field is itself `SharedMemorySafe` |
/// | Drop | Nothing relies on `Drop` running |
/// | Concurrency | Mutable state is atomic; the type is `Send + Sync` |
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, isize,
    u8, u16, u32, u64, usize,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Mapping of a POSIX shared memory object holding one `T`.
///
/// Derefs to `&T`; there is no `DerefMut`, all mutation goes through atomics.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: String,
    _mode: PhantomData<Mode>,
}

// SAFETY: T: SharedMemorySafe requires Send + Sync, and the pointer targets a
// process-wide mapping rather than thread-local data.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
// SAFETY: as above.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

const POSIX_NAME_MAX: usize = 255;

/// Checks the portable `shm_open` naming rules: a leading `/`, no other `/`,
/// at most 255 bytes.
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

    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// Maps `size_of::<T>()` bytes of `fd` read-write and shared.
fn map<T>(fd: &rustix::fd::OwnedFd, path: &str) -> Result<NonNull<T>> {
    // SAFETY: a fresh mapping that aliases no Rust object in this process.
    // The object is exactly size_of::<T>() bytes (checked or set by the
    // caller) and mmap returns page-aligned addresses, which satisfies T.
    let ptr = unsafe {
        mmap(
            null_mut(),
            size_of::<T>(),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr.cast::<T>()).ok_or_else(|| ShmError::posix("mmap", path, io::Errno::NOMEM))
}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates a zero-filled object at `path` and maps it.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid, already exists (`EEXIST`), or the
    /// object cannot be sized or mapped (`ENOMEM`, `EMFILE`, ...).
    pub fn create(path: &str) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        if let Err(err) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path);
            return Err(ShmError::posix("ftruncate", path, err));
        }

        let ptr = match map::<T>(&fd, path) {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path);
                return Err(err);
            }
        };

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Maps an existing object, which must be exactly `size_of::<T>()` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the object does not exist (`ENOENT`), is not accessible, has a
    /// different size ([`ShmError::SizeMismatch`]) or cannot be mapped.
    pub fn open(path: &str) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(path, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
        if stat.st_size != size_of::<T>() as i64 {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        let ptr = map::<T>(&fd, path)?;

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// The object name this mapping was created or opened with.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping made in create/open, and no
        // reference derived from it outlives self.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(&self.path);
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the mapping stays valid until Drop, is aligned for T, and the
        // all-zero or producer-written contents are a valid T.
        unsafe { self.ptr.as_ref() }
    }
}
