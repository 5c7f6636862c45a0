// Buffer slots of a port
// A Buffer is a view: its bytes, header and state words live in endpoint
// memory at the recorded offsets and belong to the endpoint allocator.

/// Direction of the owning port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Output,
    Input,
}

/// Endpoint offsets of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferOffsets {
    pub data: u64,
    pub metadata: u64,
    /// First state word; input buffers have one word per producer.
    pub state: u64,
}

/// An output buffer, addressed within its circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    pub port: usize,
    pub buffer: usize,
}

/// An input buffer, addressed within its circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputRef {
    pub set: usize,
    pub port: usize,
    pub buffer: usize,
}

/// Zero-copy state of an input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroCopyLink {
    #[default]
    Detached,
    /// Data is read from this output buffer's memory.
    AttachedTo(OutputRef),
}

/// One fixed-size transport slot.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub tid: usize,
    pub length: usize,
    pub direction: Direction,
    pub offsets: BufferOffsets,
    /// Number of state words (potential producers).
    pub state_words: usize,
    /// Consumer side zero-copy link.
    pub link: ZeroCopyLink,
    /// Producer side: input buffers currently aliasing this buffer.
    pub dependents: Vec<InputRef>,
    /// Producer side: hand-offs started but not finished.
    pub pending: usize,
    /// Data offset to use instead of `offsets.data` while aliased.
    pub alias: Option<u64>,
}

impl Buffer {
    pub fn new(
        tid: usize,
        length: usize,
        direction: Direction,
        offsets: BufferOffsets,
        state_words: usize,
    ) -> Self {
        Self {
            tid,
            length,
            direction,
            offsets,
            state_words: state_words.max(1),
            link: ZeroCopyLink::Detached,
            dependents: Vec::new(),
            pending: 0,
            alias: None,
        }
    }
}
