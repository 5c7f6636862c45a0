// Memory backends for endpoints
// Linux endpoints live in /dev/shm so another process can map them by name;
// heap endpoints serve in-process circuits and tests.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt::Debug;
use std::fs::OpenOptions;
use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, IntoRawFd};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::{self, NonNull};

/// Alignment of every region and of every allocation carved from one.
pub const REGION_ALIGN: usize = 128;

#[inline]
pub fn align_up(value: usize) -> usize {
    (value + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}

/// Backing store of an endpoint region
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the OS handle, if the region has one
    fn raw_handle(&self) -> RawHandle;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawHandle {
    /// Unix file descriptor (Linux)
    Fd(i32),
    /// Process-private heap region
    None,
}

/// Create a zeroed, 128-byte aligned region on the heap.
pub fn create_heap_memory(size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(HeapMemory::create(size)?))
}

/// Create a new /dev/shm region with the specified size
///
/// # Arguments
/// * `size` - Size of the region in bytes (rounded up to 128)
/// * `name` - File name under /dev/shm
#[cfg(target_os = "linux")]
pub fn create_shared_memory(size: usize, name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

/// Attach to a /dev/shm region created by another endpoint owner
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(name: &str, size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name, size)?))
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_size: usize, _name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_name: &str, _size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

/// Heap-backed region for endpoints that never leave the process.
#[derive(Debug)]
pub struct HeapMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for HeapMemory {}
unsafe impl Sync for HeapMemory {}

impl HeapMemory {
    pub fn create(size: usize) -> io::Result<Self> {
        let size = align_up(size.max(REGION_ALIGN));
        let layout = Layout::from_size_align(size, REGION_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("Failed to allocate {} byte heap region", size),
            )
        })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl SharedMemoryBackend for HeapMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::None
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
    // Base pointer and length handed to munmap
    mapping: (*mut u8, usize),
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create (or truncate) /dev/shm/<name> and map it
    pub fn create(size: usize, name: &str) -> io::Result<Self> {
        let size = align_up(size.max(REGION_ALIGN));
        let path = shm_path(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to create shared memory file at {}: {}", path, e),
                )
            })?;

        if unsafe { libc::ftruncate(file.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let fd = file.into_raw_fd();
        Self::map(fd, size, size)
    }

    /// Map an existing /dev/shm/<name>; fails if it is smaller than `size`
    pub fn attach(name: &str, size: usize) -> io::Result<Self> {
        let path = shm_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Failed to open shared memory at {}: {}", path, e),
                )
            })?;

        let file_size = file.metadata()?.len() as usize;
        if file_size < size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Shared memory size too small: expected at least {} bytes, got {}",
                    size, file_size
                ),
            ));
        }

        let fd = file.into_raw_fd();
        Self::map(fd, file_size, file_size)
    }

    fn map(fd: i32, file_size: usize, usable: usize) -> io::Result<Self> {
        // Extra space so the usable base can be rounded up to 128 bytes
        let total = file_size + REGION_ALIGN - 1;
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let aligned = align_up(raw as usize) as *mut u8;
        let offset = aligned as usize - raw as usize;
        let ptr = match NonNull::new(aligned) {
            Some(ptr) => ptr,
            None => {
                unsafe {
                    libc::munmap(raw, total);
                    libc::close(fd);
                }
                return Err(io::Error::new(io::ErrorKind::Other, "mmap returned null"));
            }
        };

        Ok(Self {
            ptr,
            size: usable.saturating_sub(offset),
            fd,
            mapping: (raw as *mut u8, total),
        })
    }
}

#[cfg(target_os = "linux")]
fn shm_path(name: &str) -> String {
    format!("/dev/shm/{}", name.trim_start_matches('/'))
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mapping.0 as *mut libc::c_void, self.mapping.1);
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd)
    }
}
