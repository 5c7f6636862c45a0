//! Ports: rings of buffers bound to one endpoint.

use crate::error::{Result, TransportError};
use crate::Core::endpoint::Endpoint;
use crate::DataTransport::Buffer::layout::{PortLayout, ShadowStateLayout};
use crate::DataTransport::Buffer::Buffer::{Buffer, BufferOffsets, Direction};
use crate::DataTransport::Structs::Buffer_Structs::{
    InputPortControl, OutputPortControl, FLAG_EMPTY, FLAG_FULL,
};
use crate::DataTransport::Structs::Mailbox_Structs::{BufferOffsetsWire, PortOffsetsWire};
use std::sync::Arc;

/// Negotiated role of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Data is pushed and flags are sent back.
    #[default]
    ActiveMessage,
    /// The consumer pulls; the producer only marks its buffers full.
    ActiveFlowControl,
    /// The port sends no flags; its state is polled by the peer.
    Passive,
}

impl Role {
    pub(crate) fn encode(self) -> u32 {
        match self {
            Role::ActiveMessage => 0,
            Role::ActiveFlowControl => 1,
            Role::Passive => 2,
        }
    }

    pub(crate) fn decode(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Role::ActiveMessage),
            1 => Ok(Role::ActiveFlowControl),
            2 => Ok(Role::Passive),
            other => Err(TransportError::MalformedRequest {
                message: format!("unknown role {}", other),
            }),
        }
    }
}

/// Connection state of a port whose peer lives on another endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalState {
    NotExternal,
    WaitingForUpdate,
    WaitingForShadowBuffer,
    DefinitionComplete,
}

/// Producer-side record of where a consumer signals Empty for one input
/// port.
#[derive(Debug, Clone)]
pub struct ShadowState {
    pub endpoint: Arc<Endpoint>,
    pub layout: ShadowStateLayout,
}

pub struct Port {
    pub id: usize,
    /// Position within a scaled PortSet.
    pub rank: usize,
    pub direction: Direction,
    /// Local stand-in for a port that lives on another endpoint.
    pub shadow: bool,
    pub role: Role,
    pub flag_is_meta: bool,
    pub external: ExternalState,
    location: Option<Arc<Endpoint>>,
    pub buffers: Vec<Buffer>,
    /// Offset of the control block in `location`.
    pub control_offset: u64,
    /// Input ports seen by the producer.
    pub shadow_state: Option<ShadowState>,
    /// Input ports: Empty flag targets, `[producer][buffer]`.
    pub empty_targets: Vec<Vec<u64>>,
    /// Input ports: endpoint holding `empty_targets`.
    pub producer_endpoint: Option<Arc<Endpoint>>,
    /// Output ports: sequence number of the next hand-off.
    pub next_sequence: u64,
    /// Ring cursor: next buffer to fill (output) or read (input).
    pub cursor: usize,
    allocations: Vec<(Arc<Endpoint>, u64)>,
}

impl Port {
    /// A real output port with its buffers allocated on `endpoint`.
    pub fn local_output(
        id: usize,
        endpoint: &Arc<Endpoint>,
        buffer_count: usize,
        buffer_length: usize,
        port_count: usize,
        role: Role,
        flag_is_meta: bool,
    ) -> Result<Self> {
        let layout = PortLayout::new(buffer_count, buffer_length, 1);
        let base = endpoint.alloc(layout.total_size())?;
        endpoint.write(
            base,
            &OutputPortControl {
                sequential_token: 0,
                next_token: ((id + 1) % port_count.max(1)) as u32,
                full_flag: FLAG_FULL,
                empty_flag: FLAG_EMPTY,
            },
        )?;

        let buffers = (0..buffer_count)
            .map(|tid| Buffer::new(tid, buffer_length, Direction::Output, layout.buffer(base, tid), 1))
            .collect();

        tracing::trace!(port = id, base, size = layout.total_size(), "allocated output port");
        Ok(Self::with_parts(
            id,
            Direction::Output,
            false,
            role,
            flag_is_meta,
            ExternalState::NotExternal,
            Some(endpoint.clone()),
            buffers,
            base,
            vec![(endpoint.clone(), base)],
        ))
    }

    /// A real input port fed by `producers` output ports.
    pub fn local_input(
        id: usize,
        endpoint: &Arc<Endpoint>,
        buffer_count: usize,
        buffer_length: usize,
        producers: usize,
        role: Role,
        flag_is_meta: bool,
    ) -> Result<Self> {
        let layout = PortLayout::new(buffer_count, buffer_length, producers);
        let base = endpoint.alloc(layout.total_size())?;
        endpoint.write(
            base,
            &InputPortControl {
                empty_flag: FLAG_EMPTY,
                full_flag: FLAG_FULL,
            },
        )?;

        let buffers = (0..buffer_count)
            .map(|tid| {
                Buffer::new(
                    tid,
                    buffer_length,
                    Direction::Input,
                    layout.buffer(base, tid),
                    producers,
                )
            })
            .collect();

        tracing::trace!(port = id, base, size = layout.total_size(), "allocated input port");
        Ok(Self::with_parts(
            id,
            Direction::Input,
            false,
            role,
            flag_is_meta,
            ExternalState::NotExternal,
            Some(endpoint.clone()),
            buffers,
            base,
            vec![(endpoint.clone(), base)],
        ))
    }

    /// A shadow port whose location and offsets arrive later.
    pub fn placeholder(
        id: usize,
        direction: Direction,
        buffer_count: usize,
        buffer_length: usize,
        state_words: usize,
        role: Role,
        flag_is_meta: bool,
    ) -> Self {
        let buffers = (0..buffer_count)
            .map(|tid| {
                Buffer::new(
                    tid,
                    buffer_length,
                    direction,
                    BufferOffsets::default(),
                    state_words,
                )
            })
            .collect();
        Self::with_parts(
            id,
            direction,
            true,
            role,
            flag_is_meta,
            ExternalState::WaitingForUpdate,
            None,
            buffers,
            0,
            Vec::new(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with_parts(
        id: usize,
        direction: Direction,
        shadow: bool,
        role: Role,
        flag_is_meta: bool,
        external: ExternalState,
        location: Option<Arc<Endpoint>>,
        buffers: Vec<Buffer>,
        control_offset: u64,
        allocations: Vec<(Arc<Endpoint>, u64)>,
    ) -> Self {
        Self {
            id,
            rank: id,
            direction,
            shadow,
            role,
            flag_is_meta,
            external,
            location,
            buffers,
            control_offset,
            shadow_state: None,
            empty_targets: Vec::new(),
            producer_endpoint: None,
            next_sequence: 0,
            cursor: 0,
            allocations,
        }
    }

    /// Allocate the producer-side shadow state array for this input port.
    pub fn allocate_shadow_state(&mut self, endpoint: &Arc<Endpoint>, producers: usize) -> Result<()> {
        let size = ShadowStateLayout::size(self.buffers.len(), producers);
        let base = endpoint.alloc(size)?;
        self.allocations.push((endpoint.clone(), base));
        self.shadow_state = Some(ShadowState {
            endpoint: endpoint.clone(),
            layout: ShadowStateLayout {
                base,
                buffer_count: self.buffers.len(),
                producers: producers.max(1),
            },
        });
        Ok(())
    }

    /// Consumer writes Empty for producer `r` at `targets[r][buffer]` on
    /// `endpoint`.
    pub fn set_empty_targets(&mut self, endpoint: Arc<Endpoint>, producer: usize, targets: Vec<u64>) {
        if self.empty_targets.len() <= producer {
            self.empty_targets.resize(producer + 1, Vec::new());
        }
        self.empty_targets[producer] = targets;
        self.producer_endpoint = Some(endpoint);
    }

    pub fn location(&self) -> Result<&Arc<Endpoint>> {
        self.location.as_ref().ok_or_else(|| {
            TransportError::state(format!("port {} has no location yet", self.id))
        })
    }

    pub fn has_location(&self) -> bool {
        self.location.is_some()
    }

    pub fn set_location(&mut self, endpoint: Arc<Endpoint>) {
        self.location = Some(endpoint);
    }

    /// Fill buffer offsets learned from the peer.
    pub fn set_remote_offsets(&mut self, control_offset: u64, offsets: &[BufferOffsetsWire]) -> Result<()> {
        if offsets.len() != self.buffers.len() {
            return Err(TransportError::MalformedRequest {
                message: format!(
                    "port {} has {} buffers, peer sent {} offsets",
                    self.id,
                    self.buffers.len(),
                    offsets.len()
                ),
            });
        }
        self.control_offset = control_offset;
        for (buffer, wire) in self.buffers.iter_mut().zip(offsets) {
            buffer.offsets = BufferOffsets {
                data: wire.data,
                metadata: wire.metadata,
                state: wire.state,
            };
        }
        Ok(())
    }

    /// Wire form of this port's buffer offsets.
    pub fn offsets_wire(&self) -> (PortOffsetsWire, Vec<BufferOffsetsWire>) {
        let header = PortOffsetsWire {
            count: self.buffers.len() as u32,
            _pad: 0,
            control_offset: self.control_offset,
        };
        let entries = self
            .buffers
            .iter()
            .map(|b| BufferOffsetsWire {
                data: b.offsets.data,
                metadata: b.offsets.metadata,
                state: b.offsets.state,
            })
            .collect();
        (header, entries)
    }

    /// A port is ready once it has a real location and, if external, has
    /// finished its definition.
    pub fn is_ready(&self) -> bool {
        self.location.is_some()
            && matches!(
                self.external,
                ExternalState::NotExternal | ExternalState::DefinitionComplete
            )
    }

    pub fn buffer(&self, index: usize) -> Result<&Buffer> {
        let count = self.buffers.len();
        self.buffers.get(index).ok_or(TransportError::UnknownPort {
            what: "buffer",
            index,
            count,
        })
    }

    pub fn buffer_mut(&mut self, index: usize) -> Result<&mut Buffer> {
        let count = self.buffers.len();
        self.buffers.get_mut(index).ok_or(TransportError::UnknownPort {
            what: "buffer",
            index,
            count,
        })
    }

    /// Offset of the output control block's token word.
    pub fn token_offset(&self) -> u64 {
        self.control_offset
    }

    /// Offset of the output control block's next-token constant.
    pub fn next_token_offset(&self) -> u64 {
        self.control_offset + 4
    }

    /// Offset of the control block's Full constant.
    pub fn full_flag_offset(&self) -> u64 {
        match self.direction {
            Direction::Output => self.control_offset + 8,
            Direction::Input => self.control_offset + 4,
        }
    }

    /// Offset of the control block's Empty constant.
    pub fn empty_flag_offset(&self) -> u64 {
        match self.direction {
            Direction::Output => self.control_offset + 12,
            Direction::Input => self.control_offset,
        }
    }

    /// Advance the ring cursor past `buffer`.
    pub fn advance(&mut self, buffer: usize) {
        if buffer == self.cursor && !self.buffers.is_empty() {
            self.cursor = (self.cursor + 1) % self.buffers.len();
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        for (endpoint, offset) in self.allocations.drain(..) {
            if let Err(e) = endpoint.free(offset) {
                tracing::warn!(port = self.id, offset, error = %e, "failed to free port memory");
            }
        }
    }
}
