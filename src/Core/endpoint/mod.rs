use crate::Core::SharedMemory::{align_up, SharedMemoryBackend, REGION_ALIGN};
use crate::DataTransport::Structs::Mailbox_Structs::{MailBox, END_POINT_NAME_LEN};
use crate::error::{Result, TransportError};
use crossbeam_utils::CachePadded;
use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
mod debug;
mod descriptor;
mod getters;
pub mod registry;

pub use descriptor::{EndpointDescriptor, EndpointProtocol};

// Use parking_lot's Mutex for better performance
use parking_lot::Mutex;

const MAGIC_NUMBER: u64 = 0x444D58505F455054; // "DMXP_EPT"
const LAYOUT_VERSION: u32 = 1;

/// Control header at offset 0 of every endpoint region.
///
/// Anything that maps the region (the owner or a remote attacher) finds the
/// mailbox geometry here; the inbox and outbox arrays follow immediately.
#[repr(C, align(128))]
pub struct EndpointHeader {
    /// Identifies an initialized endpoint region.
    pub magic: u64,

    /// Layout version.
    pub version: u32,

    /// Mailbox id of the owning endpoint.
    pub mailbox_id: u32,

    /// Number of slots in each of the inbox and outbox arrays.
    pub max_mailboxes: u32,

    /// Reserved/padding.
    pub reserved: u32,

    /// Bytes currently handed out by the allocator.
    pub allocated: CachePadded<AtomicU64>,

    /// NUL padded endpoint string.
    pub name: [u8; END_POINT_NAME_LEN],
}

/// First-fit allocator over the heap part of the region.
struct Heap {
    /// Free extents, keyed by offset.
    free: BTreeMap<usize, usize>,
    /// Live allocations, keyed by offset.
    used: BTreeMap<usize, usize>,
}

/// A named, addressable memory region.
///
/// Endpoints own the memory every buffer, control block and mailbox of a
/// circuit lives in. Offsets handed out by [`Endpoint::alloc`] are the
/// only addresses that cross endpoint boundaries.
pub struct Endpoint {
    shm: Box<dyn SharedMemoryBackend>,
    header: *mut EndpointHeader,
    descriptor: EndpointDescriptor,
    heap_start: usize,
    heap: Mutex<Heap>,
    owner: bool,
}

impl Endpoint {
    /// Create a new endpoint region and register it process-wide.
    pub fn create(descriptor: EndpointDescriptor) -> Result<Arc<Self>> {
        let size = align_up(descriptor.size);
        let heap_start = Self::heap_start_for(descriptor.max_mailboxes);

        if size <= heap_start {
            return Err(TransportError::InvalidEndpoint {
                name: descriptor.to_string(),
                reason: format!(
                    "region of {} bytes cannot hold the {} byte header and mailboxes",
                    size, heap_start
                ),
            });
        }

        let shm = match descriptor.protocol {
            EndpointProtocol::Heap => crate::Core::SharedMemory::create_heap_memory(size),
            EndpointProtocol::Shm => {
                crate::Core::SharedMemory::create_shared_memory(size, &descriptor.address)
            }
        }
        .map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create endpoint memory:\n\
                ├─ Endpoint:     {descriptor}\n\
                ├─ Region size:  {size}\n\
                ╰─ Error: {e}"
                ),
            )
        })?;

        let header = shm.as_ptr() as *mut EndpointHeader;
        if (header as usize) % REGION_ALIGN != 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Endpoint memory not properly aligned",
            )));
        }

        let mut name = [0u8; END_POINT_NAME_LEN];
        let text = descriptor.to_string();
        let len = text.len().min(END_POINT_NAME_LEN - 1);
        name[..len].copy_from_slice(&text.as_bytes()[..len]);

        unsafe {
            std::ptr::write(
                header,
                EndpointHeader {
                    magic: MAGIC_NUMBER,
                    version: LAYOUT_VERSION,
                    mailbox_id: descriptor.mailbox_id as u32,
                    max_mailboxes: descriptor.max_mailboxes as u32,
                    reserved: 0,
                    allocated: CachePadded::new(AtomicU64::new(0)),
                    name,
                },
            );
            // Mailbox arrays start out as NoRequest
            std::ptr::write_bytes(
                shm.as_ptr().add(size_of::<EndpointHeader>()),
                0,
                heap_start - size_of::<EndpointHeader>(),
            );
        }

        let usable = shm.size();
        let mut free = BTreeMap::new();
        free.insert(heap_start, usable - heap_start);

        let endpoint = Arc::new(Self {
            shm,
            header,
            descriptor,
            heap_start,
            heap: Mutex::new(Heap {
                free,
                used: BTreeMap::new(),
            }),
            owner: true,
        });

        registry::register(&endpoint)?;
        tracing::debug!(
            endpoint = %endpoint.name(),
            size = usable,
            heap_start,
            "created endpoint"
        );
        Ok(endpoint)
    }

    /// Map a /dev/shm endpoint created by another process.
    ///
    /// The attached endpoint can be read and written but never allocates;
    /// allocation belongs to the owner.
    pub fn attach(descriptor: EndpointDescriptor) -> Result<Arc<Self>> {
        if descriptor.protocol != EndpointProtocol::Shm {
            return Err(TransportError::InvalidEndpoint {
                name: descriptor.to_string(),
                reason: "only dmxp-shm endpoints can be attached".into(),
            });
        }

        let shm = crate::Core::SharedMemory::attach_shared_memory(
            &descriptor.address,
            align_up(descriptor.size),
        )?;
        let header = shm.as_ptr() as *mut EndpointHeader;

        unsafe {
            if (*header).magic != MAGIC_NUMBER {
                return Err(TransportError::InvalidEndpoint {
                    name: descriptor.to_string(),
                    reason: "invalid magic number - endpoint not initialized".into(),
                });
            }
            if (*header).mailbox_id != descriptor.mailbox_id as u32 {
                return Err(TransportError::InvalidEndpoint {
                    name: descriptor.to_string(),
                    reason: format!(
                        "region belongs to mailbox {}, not {}",
                        (*header).mailbox_id,
                        descriptor.mailbox_id
                    ),
                });
            }
        }

        let heap_start = Self::heap_start_for(descriptor.max_mailboxes);
        let endpoint = Arc::new(Self {
            shm,
            header,
            descriptor,
            heap_start,
            heap: Mutex::new(Heap {
                free: BTreeMap::new(),
                used: BTreeMap::new(),
            }),
            owner: false,
        });
        tracing::debug!(endpoint = %endpoint.name(), "attached endpoint");
        Ok(endpoint)
    }

    fn heap_start_for(max_mailboxes: u16) -> usize {
        let mailboxes = 2 * max_mailboxes as usize * size_of::<MailBox>();
        align_up(size_of::<EndpointHeader>() + mailboxes)
    }

    /// Stable wire identifier of this endpoint.
    pub fn name(&self) -> &str {
        &self.descriptor.text
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn mailbox_id(&self) -> u16 {
        self.descriptor.mailbox_id
    }

    pub fn max_mailboxes(&self) -> u16 {
        self.descriptor.max_mailboxes
    }

    /// Size of the mapped region in bytes.
    pub fn size(&self) -> usize {
        self.shm.size()
    }

    /// True when this process created the region.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Two handles address the same memory.
    pub fn same_memory(&self, other: &Endpoint) -> bool {
        self.shm.as_ptr() == other.shm.as_ptr()
    }

    /// Allocate `size` bytes, 128-byte aligned, from the endpoint heap.
    pub fn alloc(&self, size: usize) -> Result<u64> {
        if !self.owner {
            return Err(TransportError::state(format!(
                "endpoint {} is attached and cannot allocate",
                self.name()
            )));
        }
        let size = align_up(size.max(1));

        // Serialize allocations so extents never overlap
        let mut heap = self.heap.lock();
        let found = heap
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&offset, &len)| (offset, len));

        let (offset, len) = match found {
            Some(extent) => extent,
            None => {
                let available = heap.free.values().copied().max().unwrap_or(0);
                return Err(TransportError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
        };

        heap.free.remove(&offset);
        if len > size {
            heap.free.insert(offset + size, len - size);
        }
        heap.used.insert(offset, size);
        drop(heap);

        unsafe {
            std::ptr::write_bytes(self.shm.as_ptr().add(offset), 0, size);
            (*self.header)
                .allocated
                .fetch_add(size as u64, Ordering::Relaxed);
        }
        Ok(offset as u64)
    }

    /// Return an allocation to the heap, merging adjacent free extents.
    pub fn free(&self, offset: u64) -> Result<()> {
        let offset = offset as usize;
        let mut heap = self.heap.lock();
        let size = heap.used.remove(&offset).ok_or_else(|| {
            TransportError::state(format!("offset {} is not allocated", offset))
        })?;

        let mut start = offset;
        let mut len = size;
        if let Some((&prev, &prev_len)) = heap.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                heap.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = heap.free.remove(&(offset + size)) {
            len += next_len;
        }
        heap.free.insert(start, len);
        drop(heap);

        unsafe {
            (*self.header)
                .allocated
                .fetch_sub(size as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Bytes handed out by the allocator.
    pub fn used_memory(&self) -> usize {
        unsafe { (*self.header).allocated.load(Ordering::Relaxed) as usize }
    }

    /// Bytes the heap can still hand out.
    pub fn available_memory(&self) -> usize {
        self.heap.lock().free.values().sum()
    }

    fn check(&self, offset: u64, len: usize) -> Result<usize> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.shm.size() => Ok(start),
            _ => Err(TransportError::OutOfBounds {
                offset,
                len,
                size: self.shm.size(),
            }),
        }
    }

    /// Bounds-checked pointer to `len` bytes at `offset`.
    pub fn map(&self, offset: u64, len: usize) -> Result<*mut u8> {
        let start = self.check(offset, len)?;
        Ok(unsafe { self.shm.as_ptr().add(start) })
    }

    /// Read view of `len` bytes at `offset`.
    ///
    /// # Safety
    /// The caller must ensure no writer touches the range while the slice
    /// is alive; the region is shared with other endpoints.
    pub unsafe fn map_rx(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let ptr = self.map(offset, len)?;
        Ok(std::slice::from_raw_parts(ptr, len))
    }

    /// Write view of `len` bytes at `offset`.
    ///
    /// # Safety
    /// The caller must be the only party accessing the range while the
    /// slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn map_tx(&self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let ptr = self.map(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(ptr, len))
    }

    /// The 32-bit flag word at `offset`.
    pub fn flag(&self, offset: u64) -> Result<&AtomicU32> {
        if offset % 4 != 0 {
            return Err(TransportError::state(format!(
                "flag offset {} is not 4-byte aligned",
                offset
            )));
        }
        let ptr = self.map(offset, size_of::<u32>())?;
        Ok(unsafe { &*(ptr as *const AtomicU32) })
    }

    /// Copy a `#[repr(C)]` value out of the region.
    pub fn read<T: Copy>(&self, offset: u64) -> Result<T> {
        let ptr = self.map(offset, size_of::<T>())?;
        Ok(unsafe { std::ptr::read_unaligned(ptr as *const T) })
    }

    /// Copy a `#[repr(C)]` value into the region.
    pub fn write<T: Copy>(&self, offset: u64, value: &T) -> Result<()> {
        let ptr = self.map(offset, size_of::<T>())?;
        unsafe { std::ptr::write_unaligned(ptr as *mut T, *value) };
        Ok(())
    }

    pub fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let ptr = self.map(offset, bytes.len())?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let ptr = self.map(offset, out.len())?;
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Offset of the inbox slot written by mailbox `from`.
    pub fn inbox_offset(&self, from: u16) -> Result<u64> {
        self.mailbox_slot(from, 0)
    }

    /// Offset of the outbox slot used for requests to mailbox `to`.
    pub fn outbox_offset(&self, to: u16) -> Result<u64> {
        self.mailbox_slot(to, self.max_mailboxes() as usize)
    }

    fn mailbox_slot(&self, index: u16, base_slot: usize) -> Result<u64> {
        if index >= self.max_mailboxes() {
            return Err(TransportError::CapacityExceeded {
                what: "mailbox",
                limit: self.max_mailboxes() as usize,
            });
        }
        let slot = base_slot + index as usize;
        Ok((size_of::<EndpointHeader>() + slot * size_of::<MailBox>()) as u64)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.owner {
            registry::unregister(self.name(), self.mailbox_id());
        }
    }
}

// Access to the region is synchronized through flag words and the heap mutex
unsafe impl Send for Endpoint {}
unsafe impl Sync for Endpoint {}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(address: &str, mailbox: u16) -> Arc<Endpoint> {
        let descriptor =
            EndpointDescriptor::parse(&format!("dmxp-heap:{};1048576.{}.1024", address, mailbox))
                .unwrap();
        Endpoint::create(descriptor).unwrap()
    }

    #[test]
    fn allocations_are_aligned_and_reused() {
        let ep = endpoint("unit-alloc", 901);
        let a = ep.alloc(10).unwrap();
        let b = ep.alloc(300).unwrap();
        assert_eq!(a % REGION_ALIGN as u64, 0);
        assert_eq!(b, a + REGION_ALIGN as u64);
        assert_eq!(ep.used_memory(), 128 + 384);

        ep.free(a).unwrap();
        let c = ep.alloc(64).unwrap();
        assert_eq!(c, a);
        assert!(ep.free(a + 1).is_err());
    }

    #[test]
    fn free_merges_neighbours() {
        let ep = endpoint("unit-merge", 902);
        let before = ep.available_memory();
        let a = ep.alloc(128).unwrap();
        let b = ep.alloc(128).unwrap();
        let c = ep.alloc(128).unwrap();
        ep.free(b).unwrap();
        ep.free(a).unwrap();
        ep.free(c).unwrap();
        assert_eq!(ep.available_memory(), before);
        assert_eq!(ep.used_memory(), 0);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let ep = endpoint("unit-bounds", 903);
        let size = ep.size() as u64;
        assert!(ep.map(size - 4, 4).is_ok());
        assert!(matches!(
            ep.map(size - 2, 4),
            Err(TransportError::OutOfBounds { .. })
        ));
        assert!(ep.flag(6).is_err());
    }
}
