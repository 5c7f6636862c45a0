use super::*;

/// Getter methods for Endpoint
///
/// These expose the control header for debugging and monitoring.
impl Endpoint {
    /// Get the raw pointer to the EndpointHeader
    pub fn header_ptr(&self) -> *const EndpointHeader {
        self.header
    }

    /// Offset at which the allocation heap starts
    pub fn heap_start(&self) -> usize {
        self.heap_start
    }

    /// Check that the region carries an initialized header
    ///
    /// Returns true if the magic number in the header matches the expected value.
    pub fn is_initialized(&self) -> bool {
        // Safety: the header pointer is valid while the endpoint exists
        unsafe { !self.header.is_null() && (*self.header).magic == MAGIC_NUMBER }
    }

    /// Layout version recorded in the header
    pub fn layout_version(&self) -> u32 {
        unsafe { (*self.header).version }
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.heap.lock().used.len()
    }
}
