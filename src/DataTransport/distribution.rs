//! Data distribution and partitioning.
//!
//! Pure computation of how one output buffer is split into pieces and where
//! each piece lands on the input side.

use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DistributionType {
    /// Every buffer may go to any input port.
    #[default]
    Parallel,
    /// Buffers visit input ports in strict rotation.
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PartitionType {
    /// The buffer moves as one whole.
    #[default]
    Indivisible,
    /// The buffer is cut into fixed-size blocks.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DataPartition {
    pub kind: PartitionType,
    /// Block size in bytes; only used for `Block`.
    pub block_size: usize,
}

impl DataPartition {
    pub fn indivisible() -> Self {
        Self::default()
    }

    pub fn block(block_size: usize) -> Self {
        Self {
            kind: PartitionType::Block,
            block_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DataDistribution {
    pub kind: DistributionType,
    pub partition: DataPartition,
}

impl DataDistribution {
    pub fn new(kind: DistributionType, partition: DataPartition) -> Self {
        Self { kind, partition }
    }

    pub fn parallel() -> Self {
        Self::default()
    }

    pub fn sequential() -> Self {
        Self {
            kind: DistributionType::Sequential,
            partition: DataPartition::indivisible(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition.kind == PartitionType::Block && self.partition.block_size == 0 {
            return Err(TransportError::InvalidPartition {
                message: "block partition with zero block size".into(),
            });
        }
        Ok(())
    }

    /// Packed form carried in mailbox requests.
    pub fn encode(&self) -> Result<(u32, u32)> {
        let dist = match self.kind {
            DistributionType::Parallel => 0,
            DistributionType::Sequential => 1,
        };
        let part = match self.partition.kind {
            PartitionType::Indivisible => 0,
            PartitionType::Block => 1,
        };
        let block_size = u32::try_from(self.partition.block_size).map_err(|_| {
            TransportError::InvalidPartition {
                message: format!("block size {} does not fit the wire format", self.partition.block_size),
            }
        })?;
        Ok((dist | part << 8, block_size))
    }

    pub fn decode(packed: u32, block_size: u32) -> Result<Self> {
        let kind = match packed & 0xff {
            0 => DistributionType::Parallel,
            1 => DistributionType::Sequential,
            other => {
                return Err(TransportError::MalformedRequest {
                    message: format!("unknown distribution {}", other),
                })
            }
        };
        let partition = match (packed >> 8) & 0xff {
            0 => DataPartition::indivisible(),
            1 => DataPartition::block(block_size as usize),
            other => {
                return Err(TransportError::MalformedRequest {
                    message: format!("unknown partition {}", other),
                })
            }
        };
        Ok(Self { kind, partition })
    }
}

/// One primitive hand-off of a whole or a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    /// Position of this piece within the whole.
    pub index: usize,
    /// Input port rank that receives it.
    pub rank: usize,
    /// How many earlier pieces of this whole went to the same rank.
    pub sequence: usize,
    pub src_offset: usize,
    pub dst_offset: usize,
    pub length: usize,
}

/// Pieces needed to move one output buffer onto one input PortSet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pieces: Vec<Piece>,
    whole_length: usize,
    block_size: usize,
    input_ports: usize,
}

impl TransferPlan {
    /// Plan the hand-off of a `src_length` byte buffer to `dst_ports` input
    /// ports whose buffers are `dst_length` bytes.
    pub fn new(
        src: &DataDistribution,
        dst: &DataDistribution,
        src_length: usize,
        dst_length: usize,
        dst_ports: usize,
    ) -> Result<Self> {
        src.validate()?;
        dst.validate()?;
        if dst_ports == 0 {
            return Err(TransportError::InvalidPartition {
                message: "input port set has no ports".into(),
            });
        }

        let whole = |block_size| {
            Ok(Self {
                pieces: vec![Piece {
                    index: 0,
                    rank: 0,
                    sequence: 0,
                    src_offset: 0,
                    dst_offset: 0,
                    length: src_length,
                }],
                whole_length: src_length,
                block_size,
                input_ports: dst_ports,
            })
        };

        match (src.partition.kind, dst.partition.kind) {
            (PartitionType::Indivisible, PartitionType::Indivisible) => {
                if dst_length < src_length {
                    return Err(TransportError::InvalidPartition {
                        message: format!(
                            "input buffer of {} bytes cannot hold a {} byte whole",
                            dst_length, src_length
                        ),
                    });
                }
                whole(0)
            }
            (PartitionType::Block, PartitionType::Block) => {
                if dst_length < src_length {
                    return Err(TransportError::InvalidPartition {
                        message: format!(
                            "input buffer of {} bytes cannot hold a {} byte part",
                            dst_length, src_length
                        ),
                    });
                }
                whole(dst.partition.block_size)
            }
            (PartitionType::Indivisible, PartitionType::Block) => {
                let block = dst.partition.block_size;
                let parts = src_length.div_ceil(block).max(1);
                let pieces = (0..parts)
                    .map(|index| {
                        let rank = index % dst_ports;
                        let sequence = index / dst_ports;
                        let offset = (dst_ports * sequence + rank) * block;
                        Piece {
                            index,
                            rank,
                            sequence,
                            src_offset: offset,
                            dst_offset: offset,
                            length: block.min(src_length.saturating_sub(offset)),
                        }
                    })
                    .collect::<Vec<_>>();

                // Pieces land at their offset within the whole
                if let Some(last) = pieces.last() {
                    if last.dst_offset + last.length > dst_length {
                        return Err(TransportError::InvalidPartition {
                            message: format!(
                                "piece at {}..{} does not fit a {} byte input buffer",
                                last.dst_offset,
                                last.dst_offset + last.length,
                                dst_length
                            ),
                        });
                    }
                }

                Ok(Self {
                    pieces,
                    whole_length: src_length,
                    block_size: block,
                    input_ports: dst_ports,
                })
            }
            (PartitionType::Block, PartitionType::Indivisible) => {
                Err(TransportError::InvalidPartition {
                    message: "block partitioned output cannot feed indivisible input".into(),
                })
            }
        }
    }

    /// Number of primitive transfers per output buffer.
    pub fn transfer_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn parts_per_whole(&self) -> usize {
        self.pieces.len()
    }

    pub fn whole_length(&self) -> usize {
        self.whole_length
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Offsets (source, destination, length) of transfer `index`.
    pub fn calculate_buffer_offsets(&self, index: usize) -> Result<(usize, usize, usize)> {
        let piece = self.pieces.get(index).ok_or(TransportError::UnknownPort {
            what: "transfer",
            index,
            count: self.pieces.len(),
        })?;
        Ok((piece.src_offset, piece.dst_offset, piece.length))
    }

    /// The piece sent to `rank` in its `sequence`-th round.
    pub fn offsets_for(&self, sequence: usize, rank: usize) -> Option<&Piece> {
        self.pieces.get(self.input_ports * sequence + rank)
    }

    /// Last piece of the whole delivered to this piece's rank.
    pub fn is_last_for_rank(&self, index: usize) -> bool {
        index < self.pieces.len() && index + self.input_ports >= self.pieces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(size: usize) -> DataDistribution {
        DataDistribution::new(DistributionType::Parallel, DataPartition::block(size))
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn oversized_block_size_cannot_be_encoded() {
        let d = block(u32::MAX as usize + 1);
        assert!(matches!(d.encode(), Err(TransportError::InvalidPartition { .. })));
        assert_eq!(block(4096).encode().unwrap(), (1 << 8, 4096));
    }

    #[test]
    fn indivisible_is_one_whole_piece() {
        let d = DataDistribution::parallel();
        let plan = TransferPlan::new(&d, &d, 256, 256, 3).unwrap();
        assert_eq!(plan.transfer_count(), 1);
        assert_eq!(plan.calculate_buffer_offsets(0).unwrap(), (0, 0, 256));
    }

    #[test]
    fn whole_to_parts_uses_port_major_offsets() {
        let plan = TransferPlan::new(&DataDistribution::parallel(), &block(64), 256, 256, 1).unwrap();
        let offsets: Vec<_> = plan.pieces().iter().map(|p| p.dst_offset).collect();
        assert_eq!(offsets, vec![0, 64, 128, 192]);
        assert!(plan.is_last_for_rank(3));
        assert!(!plan.is_last_for_rank(2));

        let plan = TransferPlan::new(&DataDistribution::parallel(), &block(64), 300, 320, 2).unwrap();
        assert_eq!(plan.transfer_count(), 5);
        let last = plan.offsets_for(2, 0).unwrap();
        assert_eq!((last.rank, last.src_offset, last.length), (0, 256, 44));
        assert!(plan.is_last_for_rank(3) && plan.is_last_for_rank(4));
    }

    #[test]
    fn rejected_combinations() {
        assert!(matches!(
            TransferPlan::new(&block(64), &DataDistribution::parallel(), 256, 256, 1),
            Err(TransportError::InvalidPartition { .. })
        ));
        assert!(TransferPlan::new(&DataDistribution::parallel(), &block(64), 256, 128, 1).is_err());
        assert!(TransferPlan::new(&DataDistribution::parallel(), &block(0), 256, 256, 1).is_err());
    }
}
