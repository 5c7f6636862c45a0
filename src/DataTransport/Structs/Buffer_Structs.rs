// Wire structures shared by producers and consumers

// no atomics in BufferMetaData; keep as plain integral types for ABI

/// Buffer state word value: slot may be written.
pub const FLAG_EMPTY: u32 = 0;

/// Buffer state word value: slot holds data ("FULL").
pub const FLAG_FULL: u32 = 0x4655_4C4C;

/// Size reserved for one metadata header in endpoint memory.
pub const METADATA_STRIDE: usize = 128;

/// Shape of one piece of a partitioned whole.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PartShape {
    /// Byte offset of the piece within the whole.
    pub offset: u32,
    pub length: u32,
    pub whole_length: u32,
    pub block_size: u32,
}

/// Header carried with every buffer.
/// ABI-stable across endpoints; all fields are little-endian.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferMetaData {
    /// Strictly increasing per output port.
    pub sequence: u64,
    pub timestamp: u64,
    /// Back-offset to the buffer's own state word.
    pub state_offset: u64,
    /// Payload length in bytes.
    pub length: u32,
    pub op_code: u32,
    pub user_tag: u32,
    pub src_rank: u32,
    pub src_temporal_id: u32,
    pub n_parts_per_whole: u32,
    /// Only meaningful when `n_parts_per_whole > 1`.
    pub parts_sequence: u32,
    pub end_of_stream: u8,
    pub truncate: u8,
    pub end_of_circuit: u8,
    pub broadcast: u8,
    pub only_meta: u8,
    pub end_of_whole: u8,
    pub zero_copy: u8,
    pub _pad: u8,
    pub shape: PartShape,
    pub _pad2: u32,
}

impl BufferMetaData {
    /// Range of the destination buffer that holds this payload. For a part
    /// the range is the part's slice of the whole, clipped to `length`.
    pub fn payload_range(&self) -> std::ops::Range<usize> {
        let length = self.length as usize;
        if self.n_parts_per_whole > 1 {
            let start = (self.shape.offset as usize).min(length);
            let end = (self.shape.offset as usize + self.shape.length as usize).min(length);
            start..end
        } else {
            0..length
        }
    }
}

/// Control block at the head of every output port's memory.
///
/// `sequential_token` is the only mutable word; the others are constants
/// used as sources for flag copies.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct OutputPortControl {
    /// Rank of the output port allowed to hand off next.
    pub sequential_token: u32,
    /// Rank this port passes the token to.
    pub next_token: u32,
    pub full_flag: u32,
    pub empty_flag: u32,
}

/// Control block at the head of every input port's memory.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct InputPortControl {
    pub empty_flag: u32,
    pub full_flag: u32,
}
