use crate::Core::SharedMemory::align_up;
use crate::DataTransport::Structs::Buffer_Structs::METADATA_STRIDE;

use super::Buffer::BufferOffsets;

/// Bytes reserved for a port control block.
pub const CONTROL_BLOCK_SIZE: usize = 128;

/// Placement of one port's buffers inside a single allocation.
///
/// ```text
/// base ─┬─ control block            (128 B)
///       ├─ state words              (count × words × 4, 128 aligned)
///       ├─ metadata headers         (count × 128)
///       └─ data                     (count × align128(length))
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    pub buffer_count: usize,
    pub buffer_length: usize,
    /// State words per buffer (one per potential producer).
    pub state_words: usize,
}

impl PortLayout {
    pub fn new(buffer_count: usize, buffer_length: usize, state_words: usize) -> Self {
        Self {
            buffer_count,
            buffer_length,
            state_words: state_words.max(1),
        }
    }

    fn states_start(&self) -> usize {
        CONTROL_BLOCK_SIZE
    }

    fn metadata_start(&self) -> usize {
        self.states_start() + align_up(self.buffer_count * self.state_words * 4)
    }

    fn data_start(&self) -> usize {
        self.metadata_start() + self.buffer_count * METADATA_STRIDE
    }

    pub fn data_stride(&self) -> usize {
        align_up(self.buffer_length.max(1))
    }

    /// Total bytes to allocate for the port.
    pub fn total_size(&self) -> usize {
        self.data_start() + self.buffer_count * self.data_stride()
    }

    /// Offsets of buffer `index` given the allocation `base`.
    pub fn buffer(&self, base: u64, index: usize) -> BufferOffsets {
        BufferOffsets {
            data: base + (self.data_start() + index * self.data_stride()) as u64,
            metadata: base + (self.metadata_start() + index * METADATA_STRIDE) as u64,
            state: base + (self.states_start() + index * self.state_words * 4) as u64,
        }
    }
}

/// Shadow state array kept on the producer side for one input port:
/// `buffer_count × producers` words, written Empty by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowStateLayout {
    pub base: u64,
    pub buffer_count: usize,
    pub producers: usize,
}

impl ShadowStateLayout {
    pub fn size(buffer_count: usize, producers: usize) -> usize {
        buffer_count * producers.max(1) * 4
    }

    pub fn word(&self, buffer: usize, producer: usize) -> u64 {
        self.base + ((buffer * self.producers + producer) * 4) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_do_not_overlap() {
        let layout = PortLayout::new(3, 200, 2);
        let b0 = layout.buffer(1024, 0);
        let b2 = layout.buffer(1024, 2);
        assert_eq!(b0.state, 1024 + 128);
        assert_eq!(b2.state, b0.state + 16);
        assert!(b2.state + 8 <= b0.metadata);
        assert!(b2.metadata + 128 <= b0.data);
        assert_eq!(b2.data, b0.data + 2 * 256);
        assert_eq!(layout.total_size() as u64, b2.data + 256 - 1024);
    }
}
