use super::Buffer::{Buffer, Direction, ZeroCopyLink};
use crate::error::{Result, TransportError};
use crate::Core::endpoint::Endpoint;
use crate::DataTransport::Structs::Buffer_Structs::{BufferMetaData, FLAG_EMPTY, FLAG_FULL};
use std::sync::atomic::{AtomicU32, Ordering};

impl Buffer {
    /// State word of producer `index`.
    pub fn state_word<'a>(&self, endpoint: &'a Endpoint, index: usize) -> Result<&'a AtomicU32> {
        if index >= self.state_words {
            return Err(TransportError::UnknownPort {
                what: "state word",
                index,
                count: self.state_words,
            });
        }
        endpoint.flag(self.offsets.state + 4 * index as u64)
    }

    /// Offset of producer `index`'s state word.
    pub fn state_offset(&self, index: usize) -> u64 {
        self.offsets.state + 4 * index as u64
    }

    /// An input buffer is full when any producer has flagged it.
    pub fn is_full(&self, endpoint: &Endpoint) -> Result<bool> {
        for index in 0..self.state_words {
            if self.state_word(endpoint, index)?.load(Ordering::Acquire) == FLAG_FULL {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every state word reads Empty.
    pub fn all_empty(&self, endpoint: &Endpoint) -> Result<bool> {
        for index in 0..self.state_words {
            if self.state_word(endpoint, index)?.load(Ordering::Acquire) != FLAG_EMPTY {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Producers whose word currently reads Full.
    pub fn full_producers(&self, endpoint: &Endpoint) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for index in 0..self.state_words {
            if self.state_word(endpoint, index)?.load(Ordering::Acquire) == FLAG_FULL {
                out.push(index);
            }
        }
        Ok(out)
    }

    pub fn mark_full(&self, endpoint: &Endpoint, index: usize) -> Result<()> {
        self.state_word(endpoint, index)?
            .store(FLAG_FULL, Ordering::Release);
        Ok(())
    }

    pub fn mark_empty(&self, endpoint: &Endpoint, index: usize) -> Result<()> {
        self.state_word(endpoint, index)?
            .store(FLAG_EMPTY, Ordering::Release);
        Ok(())
    }

    /// Data offset currently backing this buffer.
    pub fn data_offset(&self) -> u64 {
        self.alias.unwrap_or(self.offsets.data)
    }

    pub fn read_metadata(&self, endpoint: &Endpoint) -> Result<BufferMetaData> {
        endpoint.read(self.offsets.metadata)
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.link, ZeroCopyLink::AttachedTo(_))
    }

    /// Drop the zero-copy alias of an input buffer.
    pub fn detach(&mut self) {
        if self.direction == Direction::Input {
            self.link = ZeroCopyLink::Detached;
            self.alias = None;
        }
    }
}
