//! Transfer controllers.
//!
//! One controller drives one (output PortSet, input PortSet) pair. The
//! family is closed; [`ControllerKind::lookup`] is the single place that
//! maps a negotiated combination to a pattern.

use crate::error::{Result, TransportError};
use crate::Core::endpoint::Endpoint;
use crate::Core::xfer::{XferFactory, XferKind};
use crate::DataTransport::distribution::{DistributionType, PartitionType, Piece, TransferPlan};
use crate::DataTransport::port::Role;
use crate::DataTransport::port_set::PortSet;
use crate::DataTransport::transfer::{
    GateKey, MetaPatch, PresetMeta, Transfer, TransferArena, TransferId, ZeroCopyPair,
};
use crate::DataTransport::Buffer::{InputRef, OutputRef, ZeroCopyLink};
use crate::DataTransport::Structs::Buffer_Structs::{
    BufferMetaData, PartShape, FLAG_EMPTY, FLAG_FULL, METADATA_STRIDE,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem::size_of;
use std::sync::atomic::Ordering;
use std::sync::Arc;

mod afc;
mod pattern1;
mod pattern4;
mod sequential;

/// The seven axes controller selection depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllerKey {
    pub output_distribution: DistributionType,
    pub input_distribution: DistributionType,
    pub output_partition: PartitionType,
    pub input_partition: PartitionType,
    /// The output port is a local stand-in for a remote producer.
    pub shadow: bool,
    pub output_role: Role,
    pub input_role: Role,
}

impl ControllerKey {
    pub fn for_sets(output: &PortSet, input: &PortSet) -> Self {
        Self {
            output_distribution: output.distribution.kind,
            input_distribution: input.distribution.kind,
            output_partition: output.distribution.partition.kind,
            input_partition: input.distribution.partition.kind,
            shadow: output.is_shadow(),
            output_role: output.role,
            input_role: input.role,
        }
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:?}, {:?}, {:?}, {:?}, shadow={}, {:?}, {:?})",
            self.output_distribution,
            self.input_distribution,
            self.output_partition,
            self.input_partition,
            self.shadow,
            self.output_role,
            self.input_role
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    /// Whole to whole, parallel push.
    Pattern1,
    /// Producer marks full, consumer pulls.
    Pattern1Afc,
    /// Consumer side of a remote flow-controlled producer.
    Pattern1AfcShadow,
    /// Sequential round robin.
    Pattern2,
    /// Sequential round robin gated by a control token.
    Pattern3,
    /// Whole to parts.
    Pattern4,
    Unsupported,
}

impl ControllerKind {
    pub fn lookup(key: &ControllerKey) -> Self {
        use DistributionType::{Parallel, Sequential};
        use PartitionType::{Block, Indivisible};
        use Role::{ActiveFlowControl, ActiveMessage, Passive};

        match (
            key.output_distribution,
            key.input_distribution,
            key.output_partition,
            key.input_partition,
            key.shadow,
            key.output_role,
            key.input_role,
        ) {
            (Parallel, Parallel, Indivisible, Indivisible, _, ActiveMessage, ActiveMessage | Passive) => {
                ControllerKind::Pattern1
            }
            (Parallel, Parallel, Block, Block, _, ActiveMessage, ActiveMessage | Passive) => {
                ControllerKind::Pattern1
            }
            (
                Parallel,
                Parallel,
                Indivisible,
                Indivisible,
                false,
                ActiveFlowControl,
                ActiveMessage | ActiveFlowControl,
            ) => ControllerKind::Pattern1Afc,
            (
                Parallel,
                Parallel,
                Indivisible,
                Indivisible,
                true,
                ActiveFlowControl,
                ActiveMessage | ActiveFlowControl,
            ) => ControllerKind::Pattern1AfcShadow,
            (Sequential, Parallel, Indivisible, Indivisible, _, ActiveMessage, ActiveMessage) => {
                ControllerKind::Pattern2
            }
            (Sequential, Sequential, Indivisible, Indivisible, _, ActiveMessage, ActiveMessage) => {
                ControllerKind::Pattern3
            }
            (Parallel, Parallel, Indivisible, Block, _, ActiveMessage, ActiveMessage) => {
                ControllerKind::Pattern4
            }
            _ => ControllerKind::Unsupported,
        }
    }

    /// Data is pushed by the producer.
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            ControllerKind::Pattern1
                | ControllerKind::Pattern2
                | ControllerKind::Pattern3
                | ControllerKind::Pattern4
        )
    }

    pub fn is_afc(&self) -> bool {
        matches!(
            self,
            ControllerKind::Pattern1Afc | ControllerKind::Pattern1AfcShadow
        )
    }
}

/// Outcome of a controller hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    /// Copies were started; `gated` further pieces will follow.
    Pushed { gated: usize },
    /// The buffer was only marked full; the consumer pulls it.
    Marked,
}

/// Settings a controller is built with.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub zero_copy: bool,
    pub max_templates: usize,
}

/// Template ids laid out as a dense multi-dimensional grid.
#[derive(Debug, Clone)]
struct Grid {
    base: TransferId,
    dims: Vec<usize>,
}

impl Grid {
    fn id(&self, index: &[usize]) -> Result<TransferId> {
        if index.len() != self.dims.len() {
            return Err(TransportError::state(format!(
                "template index has {} dimensions, grid has {}",
                index.len(),
                self.dims.len()
            )));
        }
        let mut flat = 0;
        for (&i, &d) in index.iter().zip(&self.dims) {
            if i >= d {
                return Err(TransportError::UnknownPort {
                    what: "template index",
                    index: i,
                    count: d,
                });
            }
            flat = flat * d + i;
        }
        Ok(self.base + flat)
    }

    fn len(dims: &[usize]) -> usize {
        dims.iter().product()
    }
}

/// Part geometry travels as 32-bit metadata fields.
fn wire_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| TransportError::InvalidPartition {
        message: format!("{} {} does not fit part metadata", what, value),
    })
}

/// One output buffer being handed to this controller's input PortSet.
#[derive(Debug, Clone)]
struct HandOff {
    output: OutputRef,
    transfers: Vec<TransferId>,
    next_piece: usize,
    pieces: usize,
}

/// A consumer-side pull of one output buffer.
#[derive(Debug, Clone, Copy)]
struct Pull {
    output: OutputRef,
    transfer: TransferId,
}

pub struct Controller {
    kind: ControllerKind,
    key: ControllerKey,
    set: usize,
    settings: ControllerSettings,
    plan: Option<TransferPlan>,
    arena: TransferArena,
    push: Option<Grid>,
    broadcast: Option<Grid>,
    release: Option<Grid>,
    pull: Option<Grid>,
    zero_copy: bool,
    in_flight: VecDeque<HandOff>,
    releases: Vec<TransferId>,
    pulls: Vec<Pull>,
    /// Input (port, buffer) targeted by a running transfer.
    reserved: HashMap<(usize, usize), TransferId>,
    /// Producer side ring cursor per input port.
    fill_cursor: Vec<usize>,
    /// Consumer side ring cursor per output port.
    pull_cursor: Vec<usize>,
    /// Round robin position (Pattern 1) or hand-off counter (Patterns 2, 3).
    next_port: usize,
    staging: Vec<(Arc<Endpoint>, u64)>,
}

impl Controller {
    /// Look up the controller for `key`; absent combinations are a
    /// configuration error.
    pub fn select(key: ControllerKey, set: usize, settings: ControllerSettings) -> Result<Self> {
        let kind = ControllerKind::lookup(&key);
        if kind == ControllerKind::Unsupported {
            return Err(TransportError::UnsupportedController { key });
        }
        tracing::debug!(set, %key, ?kind, "selected controller");
        Ok(Self {
            kind,
            key,
            set,
            settings,
            plan: None,
            arena: TransferArena::new(settings.max_templates),
            push: None,
            broadcast: None,
            release: None,
            pull: None,
            zero_copy: false,
            in_flight: VecDeque::new(),
            releases: Vec::new(),
            pulls: Vec::new(),
            reserved: HashMap::new(),
            fill_cursor: Vec::new(),
            pull_cursor: Vec::new(),
            next_port: 0,
            staging: Vec::new(),
        })
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn key(&self) -> &ControllerKey {
        &self.key
    }

    pub fn plan(&self) -> Option<&TransferPlan> {
        self.plan.as_ref()
    }

    pub fn template_count(&self) -> usize {
        self.arena.len()
    }

    /// Hand-offs started and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Gated pieces still pending on the oldest hand-off of `output`.
    pub fn gated_pending(&self, output: OutputRef) -> usize {
        self.in_flight
            .iter()
            .find(|h| h.output == output)
            .map(|h| {
                h.transfers
                    .first()
                    .map(|t| self.arena.pending_gated(*t))
                    .unwrap_or(0)
                    + h.pieces.saturating_sub(h.next_piece)
            })
            .unwrap_or(0)
    }

    /// Build every transfer template this pair needs for its lifetime.
    pub fn init(&mut self, output: &PortSet, input: &PortSet, factory: &dyn XferFactory) -> Result<()> {
        let plan = TransferPlan::new(
            &output.distribution,
            &input.distribution,
            output.buffer_length,
            input.buffer_length,
            input.ports.len(),
        )?;

        let n_out = output.ports.len();
        let out_bufs = output.buffer_count;
        let n_in = input.ports.len();
        let in_bufs = input.buffer_count;
        let pieces = plan.transfer_count();

        let producer_side = !output.is_shadow() && output.is_located();
        let consumer_side = !input.is_shadow();
        let whole_fits = input.buffer_length >= output.buffer_length;

        let mut needed = 0;
        if self.kind.is_push() && producer_side {
            needed += Grid::len(&[n_out, out_bufs, n_in, in_bufs, pieces]);
            if pieces > 1 && whole_fits {
                needed += Grid::len(&[n_out, out_bufs, n_in, in_bufs]);
            }
        }
        if self.kind.is_push() && consumer_side && input.role != Role::Passive {
            needed += Grid::len(&[n_in, in_bufs, n_out]);
        }
        if self.kind.is_afc() && consumer_side {
            needed += Grid::len(&[n_out, out_bufs, n_in, in_bufs]);
        }
        if needed > self.settings.max_templates {
            return Err(TransportError::CapacityExceeded {
                what: "transfer templates",
                limit: self.settings.max_templates,
            });
        }

        self.fill_cursor = vec![0; n_in];
        self.pull_cursor = vec![0; n_out];

        if self.kind.is_push() && producer_side {
            self.zero_copy = self.settings.zero_copy
                && self.kind == ControllerKind::Pattern1
                && pieces == 1
                && consumer_side
                && pattern1::co_located(output, input)?;
            self.build_push(output, input, factory, &plan)?;
        }
        if self.kind.is_push() && consumer_side && input.role != Role::Passive {
            self.build_release(output, input, factory)?;
        }
        if self.kind.is_afc() && consumer_side {
            afc::build_pull(self, output, input, factory)?;
        }

        tracing::debug!(
            set = self.set,
            kind = ?self.kind,
            templates = self.arena.len(),
            pieces,
            zero_copy = self.zero_copy,
            "controller initialized"
        );
        self.plan = Some(plan);
        Ok(())
    }

    fn build_push(
        &mut self,
        output: &PortSet,
        input: &PortSet,
        factory: &dyn XferFactory,
        plan: &TransferPlan,
    ) -> Result<()> {
        let n_out = output.ports.len();
        let out_bufs = output.buffer_count;
        let n_in = input.ports.len();
        let in_bufs = input.buffer_count;
        let pieces = plan.pieces();
        let partitioned = pieces.len() > 1;

        // One staging header per (output buffer, piece) carries the patched metadata
        let mut staging = HashMap::new();
        if partitioned || self.zero_copy {
            for (r, port) in output.ports.iter().enumerate() {
                let endpoint = port.location()?;
                for ob in 0..out_bufs {
                    for piece in pieces {
                        let offset = endpoint.alloc(METADATA_STRIDE)?;
                        self.staging.push((endpoint.clone(), offset));
                        let patch = if partitioned {
                            MetaPatch {
                                n_parts_per_whole: Some(wire_u32(pieces.len(), "part count")?),
                                parts_sequence: Some(wire_u32(piece.index, "part index")?),
                                end_of_whole: Some(plan.is_last_for_rank(piece.index)),
                                shape: Some(PartShape {
                                    offset: wire_u32(piece.src_offset, "part offset")?,
                                    length: wire_u32(piece.length, "part length")?,
                                    whole_length: wire_u32(plan.whole_length(), "whole length")?,
                                    block_size: wire_u32(plan.block_size(), "block size")?,
                                }),
                                zero_copy: None,
                            }
                        } else {
                            MetaPatch {
                                zero_copy: Some(true),
                                ..MetaPatch::default()
                            }
                        };
                        staging.insert((r, ob, piece.index), (offset, patch));
                    }
                }
            }
        }

        let dims = vec![n_out, out_bufs, n_in, in_bufs, pieces.len()];
        let base = self.arena.len();
        for r in 0..n_out {
            for ob in 0..out_bufs {
                for p in 0..n_in {
                    for ib in 0..in_bufs {
                        for piece in pieces {
                            let transfer = self.push_template(
                                factory,
                                output,
                                input,
                                (r, ob, p, ib),
                                Some(piece),
                                staging.get(&(r, ob, piece.index)).copied(),
                            )?;
                            self.arena.insert(transfer)?;
                        }
                    }
                }
            }
        }
        self.push = Some(Grid { base, dims });

        // Broadcast always moves the whole buffer
        if partitioned && input.buffer_length >= output.buffer_length {
            let dims = vec![n_out, out_bufs, n_in, in_bufs];
            let base = self.arena.len();
            for r in 0..n_out {
                for ob in 0..out_bufs {
                    for p in 0..n_in {
                        for ib in 0..in_bufs {
                            let transfer =
                                self.push_template(factory, output, input, (r, ob, p, ib), None, None)?;
                            self.arena.insert(transfer)?;
                        }
                    }
                }
            }
            self.broadcast = Some(Grid { base, dims });
        } else if !partitioned {
            self.broadcast = self.push.clone();
        }
        Ok(())
    }

    /// Data, metadata and Full flag from output buffer `ob` of port `r` to
    /// input buffer `ib` of port `p`.
    fn push_template(
        &self,
        factory: &dyn XferFactory,
        output: &PortSet,
        input: &PortSet,
        (r, ob, p, ib): (usize, usize, usize, usize),
        piece: Option<&Piece>,
        staging: Option<(u64, MetaPatch)>,
    ) -> Result<Transfer> {
        let out_port = output.port(r)?;
        let in_port = input.port(p)?;
        let src = out_port.location()?;
        let dst = in_port.location()?;
        let services = factory.services(src, dst)?;
        let out_buf = out_port.buffer(ob)?;
        let in_buf = in_port.buffer(ib)?;

        let mut transfer = Transfer::new();
        let meta_src = match staging {
            Some((offset, patch)) => {
                transfer.add_preset(PresetMeta {
                    endpoint: src.clone(),
                    source: out_buf.offsets.metadata,
                    staging: offset,
                    patch,
                });
                offset
            }
            None => out_buf.offsets.metadata,
        };

        let mut first = services.create_request();
        if self.zero_copy && piece.is_some() {
            transfer.add_zero_copy(ZeroCopyPair {
                output: OutputRef { port: r, buffer: ob },
                input: InputRef {
                    set: self.set,
                    port: p,
                    buffer: ib,
                },
            });
        } else {
            let (src_offset, dst_offset, length) = piece
                .map(|pc| (pc.src_offset, pc.dst_offset, pc.length))
                .unwrap_or((0, 0, output.buffer_length));
            first.copy(
                out_buf.offsets.data + src_offset as u64,
                in_buf.offsets.data + dst_offset as u64,
                length,
                XferKind::Data,
            )?;
        }
        first.copy(
            meta_src,
            in_buf.offsets.metadata,
            size_of::<BufferMetaData>(),
            XferKind::MetaData,
        )?;

        let flag_src = out_port.full_flag_offset();
        let flag_dst = in_buf.state_offset(r);
        if out_port.flag_is_meta || in_port.flag_is_meta {
            first.copy(flag_src, flag_dst, 4, XferKind::Flag)?;
            transfer.add_request(first)?;
        } else {
            transfer.add_request(first)?;
            let mut flag = services.create_request();
            flag.copy(flag_src, flag_dst, 4, XferKind::Flag)?;
            transfer.add_request(flag)?;
        }

        if self.kind == ControllerKind::Pattern3 && self.set == 0 {
            transfer.add_request(sequential::token_request(factory, output, r)?)?;
        }
        Ok(transfer)
    }

    /// Empty flag from input buffer `ib` of port `p` back to producer `r`.
    fn build_release(&mut self, output: &PortSet, input: &PortSet, factory: &dyn XferFactory) -> Result<()> {
        let n_out = output.ports.len();
        let in_bufs = input.buffer_count;
        let dims = vec![input.ports.len(), in_bufs, n_out];
        let base = self.arena.len();

        for port in &input.ports {
            let src = port.location()?;
            let dst = port.producer_endpoint.as_ref().ok_or_else(|| {
                TransportError::state(format!("input port {} has no producer endpoint", port.id))
            })?;
            let services = factory.services(src, dst)?;
            for ib in 0..in_bufs {
                for r in 0..n_out {
                    let target = port
                        .empty_targets
                        .get(r)
                        .and_then(|t| t.get(ib))
                        .copied()
                        .ok_or_else(|| {
                            TransportError::state(format!(
                                "input port {} lacks the shadow state of producer {}",
                                port.id, r
                            ))
                        })?;
                    let mut request = services.create_request();
                    request.copy(port.empty_flag_offset(), target, 4, XferKind::Flag)?;
                    let mut transfer = Transfer::new();
                    transfer.add_request(request)?;
                    self.arena.insert(transfer)?;
                }
            }
        }
        self.release = Some(Grid { base, dims });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Producer side
    // ---------------------------------------------------------------------

    /// Whether input buffer `ib` of port `p` may be written now.
    fn input_ready(&self, input: &PortSet, p: usize, ib: usize) -> Result<bool> {
        if self.reserved.contains_key(&(p, ib)) {
            return Ok(false);
        }
        let port = input.port(p)?;
        match &port.shadow_state {
            Some(shadow) => {
                for r in 0..shadow.layout.producers {
                    let word = shadow.endpoint.flag(shadow.layout.word(ib, r))?;
                    if word.load(Ordering::Acquire) != FLAG_EMPTY {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            // Passive consumers send nothing back; read their state directly
            None => port.buffer(ib)?.all_empty(port.location()?),
        }
    }

    /// The next ring slot of input port `p`, if it may be written.
    fn port_ready(&self, input: &PortSet, p: usize) -> Result<Option<usize>> {
        let ib = self.fill_cursor.get(p).copied().unwrap_or(0);
        Ok(self.input_ready(input, p, ib)?.then_some(ib))
    }

    fn all_ports_ready(&self, input: &PortSet) -> Result<bool> {
        for p in 0..input.ports.len() {
            if self.port_ready(input, p)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn can_produce(&self, output: &PortSet, input: &PortSet, r: usize, broadcast: bool) -> Result<bool> {
        output.port(r)?;
        if self.push.is_none() && self.kind.is_push() {
            return Ok(false);
        }
        if broadcast && self.kind.is_push() {
            if self.broadcast.is_none() {
                return Err(TransportError::InvalidPartition {
                    message: "input buffers cannot hold a whole output buffer".into(),
                });
            }
            if self.kind == ControllerKind::Pattern3 && !sequential::may_hand_off(self, output, r)? {
                return Ok(false);
            }
            return self.all_ports_ready(input);
        }
        match self.kind {
            ControllerKind::Pattern1 => Ok(pattern1::select_port(self, input)?.is_some()),
            ControllerKind::Pattern2 | ControllerKind::Pattern3 => {
                sequential::can_produce(self, output, input, r)
            }
            ControllerKind::Pattern4 => pattern4::can_produce(self, input),
            ControllerKind::Pattern1Afc => Ok(true),
            ControllerKind::Pattern1AfcShadow | ControllerKind::Unsupported => Err(
                TransportError::state("producer operations need a local output port"),
            ),
        }
    }

    /// Hand off output buffer `ob` of port `r`. The caller has checked
    /// [`can_produce`](Self::can_produce).
    pub fn produce(
        &mut self,
        output: &mut PortSet,
        input: &mut PortSet,
        r: usize,
        ob: usize,
        broadcast: bool,
    ) -> Result<Issue> {
        let source = OutputRef { port: r, buffer: ob };
        let handoff = match self.kind {
            ControllerKind::Pattern1Afc => {
                output.port(r)?.buffer(ob)?;
                return Ok(Issue::Marked);
            }
            ControllerKind::Pattern1AfcShadow | ControllerKind::Unsupported => {
                return Err(TransportError::state(
                    "producer operations need a local output port",
                ))
            }
            _ if broadcast => {
                let grid = self
                    .broadcast
                    .clone()
                    .ok_or_else(|| TransportError::state("no broadcast templates"))?;
                let mut transfers = Vec::with_capacity(input.ports.len());
                for p in 0..input.ports.len() {
                    let ib = self.fill_cursor[p];
                    let id = grid.id(&[r, ob, p, ib])?;
                    self.start_push(output, input, source, p, ib, id, None)?;
                    transfers.push(id);
                }
                if self.kind == ControllerKind::Pattern2 || self.kind == ControllerKind::Pattern3 {
                    self.next_port += 1;
                }
                HandOff {
                    output: source,
                    transfers,
                    next_piece: 1,
                    pieces: 1,
                }
            }
            ControllerKind::Pattern1 => {
                let (p, ib) = pattern1::select_port(self, input)?
                    .ok_or_else(|| TransportError::state("no input port ready"))?;
                let id = self.push_id(r, ob, p, ib, 0)?;
                self.start_push(output, input, source, p, ib, id, None)?;
                self.next_port = (p + 1) % input.ports.len();
                HandOff {
                    output: source,
                    transfers: vec![id],
                    next_piece: 1,
                    pieces: 1,
                }
            }
            ControllerKind::Pattern2 | ControllerKind::Pattern3 => {
                let p = sequential::designated_port(self, input);
                let ib = self.fill_cursor[p];
                let id = self.push_id(r, ob, p, ib, 0)?;
                self.start_push(output, input, source, p, ib, id, None)?;
                self.next_port += 1;
                HandOff {
                    output: source,
                    transfers: vec![id],
                    next_piece: 1,
                    pieces: 1,
                }
            }
            ControllerKind::Pattern4 => pattern4::produce(self, output, input, source)?,
        };

        let gated = handoff.pieces.saturating_sub(handoff.next_piece);
        tracing::trace!(
            set = self.set,
            port = r,
            buffer = ob,
            broadcast,
            gated,
            "hand-off started"
        );
        self.in_flight.push_back(handoff);
        Ok(Issue::Pushed { gated })
    }

    fn push_id(&self, r: usize, ob: usize, p: usize, ib: usize, piece: usize) -> Result<TransferId> {
        let grid = self
            .push
            .as_ref()
            .ok_or_else(|| TransportError::state("controller has no producer templates"))?;
        grid.id(&[r, ob, p, ib, piece])
    }

    /// Start template `id` towards input buffer `ib` of port `p`.
    #[allow(clippy::too_many_arguments)]
    fn start_push(
        &mut self,
        output: &mut PortSet,
        input: &mut PortSet,
        source: OutputRef,
        p: usize,
        ib: usize,
        id: TransferId,
        gate: Option<(TransferId, GateKey)>,
    ) -> Result<()> {
        {
            let port = input.port(p)?;
            if let Some(shadow) = &port.shadow_state {
                shadow
                    .endpoint
                    .flag(shadow.layout.word(ib, source.port))?
                    .store(FLAG_FULL, Ordering::Release);
            }
        }

        let pairs = self.arena.get(id)?.zero_copy_pairs().to_vec();
        for pair in pairs {
            let alias = output.port(pair.output.port)?.buffer(pair.output.buffer)?.data_offset();
            let target = input.port_mut(pair.input.port)?.buffer_mut(pair.input.buffer)?;
            target.link = ZeroCopyLink::AttachedTo(pair.output);
            target.alias = Some(alias);
            output
                .port_mut(pair.output.port)?
                .buffer_mut(pair.output.buffer)?
                .dependents
                .push(pair.input);
        }

        match gate {
            None => self.arena.start(id)?,
            Some((primary, key)) => self.arena.chain(primary, key, id)?,
        }
        self.reserved.insert((p, ib), id);
        let count = input.buffer_count.max(1);
        self.fill_cursor[p] = (ib + 1) % count;
        Ok(())
    }

    /// Progress in-flight work. Returns the output buffers whose hand-off
    /// to this input PortSet finished.
    pub fn poll(&mut self, output: &mut PortSet, input: &mut PortSet) -> Result<Vec<OutputRef>> {
        let mut finished = Vec::new();

        let mut index = 0;
        while index < self.in_flight.len() {
            if self.kind == ControllerKind::Pattern4 {
                pattern4::issue_pieces(self, output, input, index)?;
            }
            let (transfers, all_issued) = match self.in_flight.get(index) {
                Some(h) => (h.transfers.clone(), h.next_piece >= h.pieces),
                None => break,
            };
            let mut done = all_issued;
            for id in transfers {
                if !self.arena.progress(id)? {
                    done = false;
                }
            }
            if done {
                if let Some(h) = self.in_flight.remove(index) {
                    tracing::trace!(set = self.set, port = h.output.port, buffer = h.output.buffer, "hand-off finished");
                    finished.push(h.output);
                }
            } else {
                index += 1;
            }
        }

        let mut pending = Vec::with_capacity(self.releases.len());
        for id in std::mem::take(&mut self.releases) {
            if !self.arena.progress(id)? {
                pending.push(id);
            }
        }
        self.releases = pending;

        if self.kind.is_afc() && !input.is_shadow() {
            afc::poll(self, output, input)?;
        }

        let arena = &self.arena;
        self.reserved
            .retain(|_, id| arena.get(*id).map(Transfer::is_running).unwrap_or(false));
        Ok(finished)
    }

    pub fn have_output_barrier_token(&self, output: &PortSet, r: usize) -> Result<bool> {
        match self.kind {
            ControllerKind::Pattern3 => sequential::has_token(output, r),
            _ => {
                output.port(r)?;
                Ok(true)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Consumer side
    // ---------------------------------------------------------------------

    pub fn get_next_full_input_buffer(&self, input: &PortSet, p: usize) -> Result<Option<usize>> {
        let port = input.port(p)?;
        if port.shadow {
            return Err(TransportError::state("consumer operations need a local input port"));
        }
        if self.kind == ControllerKind::Pattern4 {
            return pattern4::next_full(input, p);
        }
        let endpoint = port.location()?;
        let ib = port.cursor;
        Ok(port.buffer(ib)?.is_full(endpoint)?.then_some(ib))
    }

    pub fn has_full_input_buffer(&self, input: &PortSet, p: usize) -> Result<bool> {
        Ok(self.get_next_full_input_buffer(input, p)?.is_some())
    }

    /// Release a consumed input buffer back to its producers.
    pub fn consume(&mut self, input: &mut PortSet, p: usize, ib: usize) -> Result<()> {
        let port = input.port(p)?;
        if port.shadow {
            return Err(TransportError::state("consumer operations need a local input port"));
        }
        let endpoint = port.location()?.clone();
        let producers = port.buffer(ib)?.full_producers(&endpoint)?;
        if producers.is_empty() {
            return Err(TransportError::state(format!(
                "input buffer {} of port {} is not full",
                ib, p
            )));
        }

        let releases = match &self.release {
            Some(grid) => producers
                .iter()
                .map(|&r| grid.id(&[p, ib, r]))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        // Nothing changes unless every earlier release of this slot finished
        for &id in &releases {
            if !self.arena.progress(id)? {
                return Err(TransportError::state(format!(
                    "release of input buffer {} of port {} still in flight",
                    ib, p
                )));
            }
        }

        for &r in &producers {
            port.buffer(ib)?.mark_empty(&endpoint, r)?;
        }
        for id in releases {
            self.arena.start(id)?;
            self.releases.push(id);
        }

        let port = input.port_mut(p)?;
        port.buffer_mut(ib)?.detach();
        port.advance(ib);
        tracing::trace!(set = self.set, port = p, buffer = ib, ?producers, "input consumed");
        Ok(())
    }

    /// Re-target every template reading `old` to read `new`.
    pub fn retarget(&mut self, new: u64, old: u64) -> Result<usize> {
        self.arena.retarget_all(&[new], &[old])
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_controller(self, f)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        for (endpoint, offset) in self.staging.drain(..) {
            if let Err(e) = endpoint.free(offset) {
                tracing::warn!(offset, error = %e, "failed to free staging header");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DistributionType::{Parallel, Sequential};
    use PartitionType::{Block, Indivisible};
    use Role::{ActiveFlowControl, ActiveMessage, Passive};

    fn key(
        od: DistributionType,
        id: DistributionType,
        op: PartitionType,
        ip: PartitionType,
        shadow: bool,
        or: Role,
        ir: Role,
    ) -> ControllerKey {
        ControllerKey {
            output_distribution: od,
            input_distribution: id,
            output_partition: op,
            input_partition: ip,
            shadow,
            output_role: or,
            input_role: ir,
        }
    }

    #[test]
    fn selection_table() {
        for shadow in [false, true] {
            for ir in [ActiveMessage, Passive] {
                assert_eq!(
                    ControllerKind::lookup(&key(Parallel, Parallel, Indivisible, Indivisible, shadow, ActiveMessage, ir)),
                    ControllerKind::Pattern1
                );
                assert_eq!(
                    ControllerKind::lookup(&key(Parallel, Parallel, Block, Block, shadow, ActiveMessage, ir)),
                    ControllerKind::Pattern1
                );
            }
            for ir in [ActiveMessage, ActiveFlowControl] {
                assert_eq!(
                    ControllerKind::lookup(&key(Parallel, Parallel, Indivisible, Indivisible, shadow, ActiveFlowControl, ir)),
                    if shadow {
                        ControllerKind::Pattern1AfcShadow
                    } else {
                        ControllerKind::Pattern1Afc
                    }
                );
            }
            assert_eq!(
                ControllerKind::lookup(&key(Sequential, Parallel, Indivisible, Indivisible, shadow, ActiveMessage, ActiveMessage)),
                ControllerKind::Pattern2
            );
            assert_eq!(
                ControllerKind::lookup(&key(Sequential, Sequential, Indivisible, Indivisible, shadow, ActiveMessage, ActiveMessage)),
                ControllerKind::Pattern3
            );
            assert_eq!(
                ControllerKind::lookup(&key(Parallel, Parallel, Indivisible, Block, shadow, ActiveMessage, ActiveMessage)),
                ControllerKind::Pattern4
            );
        }
    }

    #[test]
    fn absent_tuples_are_unsupported() {
        let settings = ControllerSettings {
            zero_copy: true,
            max_templates: 16,
        };
        let absent = [
            key(Parallel, Parallel, Block, Indivisible, false, ActiveMessage, ActiveMessage),
            key(Parallel, Sequential, Indivisible, Indivisible, false, ActiveMessage, ActiveMessage),
            key(Parallel, Parallel, Indivisible, Indivisible, false, Passive, ActiveMessage),
            key(Parallel, Parallel, Indivisible, Block, false, ActiveMessage, Passive),
            key(Sequential, Parallel, Indivisible, Indivisible, false, ActiveMessage, Passive),
            key(Parallel, Parallel, Indivisible, Indivisible, false, ActiveFlowControl, Passive),
        ];
        for k in absent {
            assert_eq!(ControllerKind::lookup(&k), ControllerKind::Unsupported, "{k}");
            assert!(matches!(
                Controller::select(k, 0, settings),
                Err(TransportError::UnsupportedController { .. })
            ));
        }
    }

    #[test]
    fn grid_ids_are_dense() {
        let grid = Grid {
            base: 10,
            dims: vec![2, 3, 4],
        };
        assert_eq!(grid.id(&[0, 0, 0]).unwrap(), 10);
        assert_eq!(grid.id(&[0, 0, 3]).unwrap(), 13);
        assert_eq!(grid.id(&[0, 1, 0]).unwrap(), 14);
        assert_eq!(grid.id(&[1, 2, 3]).unwrap(), 10 + 23);
        assert_eq!(Grid::len(&grid.dims), 24);
    }

    #[test]
    fn part_geometry_must_fit_metadata() {
        assert_eq!(wire_u32(4096, "block size").unwrap(), 4096);
        assert_eq!(wire_u32(u32::MAX as usize, "whole length").unwrap(), u32::MAX);
        if let Some(big) = (u32::MAX as usize).checked_add(1) {
            assert!(matches!(
                wire_u32(big, "whole length"),
                Err(TransportError::InvalidPartition { .. })
            ));
        }
    }

    #[test]
    fn grid_rejects_out_of_range_indices() {
        let grid = Grid {
            base: 0,
            dims: vec![2, 3, 4],
        };
        // [0, 0, 4] would alias [0, 1, 0] without the check
        assert!(matches!(
            grid.id(&[0, 0, 4]),
            Err(TransportError::UnknownPort { index: 4, count: 4, .. })
        ));
        assert!(matches!(
            grid.id(&[2, 0, 0]),
            Err(TransportError::UnknownPort { index: 2, count: 2, .. })
        ));
        assert!(matches!(
            grid.id(&[0, 0]),
            Err(TransportError::InvalidState { .. })
        ));
    }
}
