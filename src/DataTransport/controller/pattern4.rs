// Pattern 4: one whole output buffer split into parts across the input
// ports. Piece 0 is the primary transfer; the remaining pieces are gated
// successors started as their target slots free up.

use super::{Controller, HandOff};
use crate::error::{Result, TransportError};
use crate::DataTransport::port_set::PortSet;
use crate::DataTransport::transfer::GateKey;
use crate::DataTransport::Buffer::OutputRef;

/// One whole issues pieces at a time; the next waits for its turn.
pub(super) fn can_produce(ctrl: &Controller, input: &PortSet) -> Result<bool> {
    if ctrl.in_flight.iter().any(|h| h.next_piece < h.pieces) {
        return Ok(false);
    }
    let rank = first_rank(ctrl)?;
    Ok(ctrl.port_ready(input, rank)?.is_some())
}

fn first_rank(ctrl: &Controller) -> Result<usize> {
    ctrl.plan
        .as_ref()
        .and_then(|plan| plan.pieces().first())
        .map(|piece| piece.rank)
        .ok_or_else(|| TransportError::state("controller has no transfer plan"))
}

pub(super) fn produce(
    ctrl: &mut Controller,
    output: &mut PortSet,
    input: &mut PortSet,
    source: OutputRef,
) -> Result<HandOff> {
    let pieces = ctrl.plan.as_ref().map(|p| p.transfer_count()).unwrap_or(0);
    let rank = first_rank(ctrl)?;
    let ib = ctrl.fill_cursor[rank];
    let id = ctrl.push_id(source.port, source.buffer, rank, ib, 0)?;
    ctrl.start_push(output, input, source, rank, ib, id, None)?;
    Ok(HandOff {
        output: source,
        transfers: vec![id],
        next_piece: 1,
        pieces,
    })
}

/// Start every further piece of hand-off `index` whose target slot is free,
/// in piece order.
pub(super) fn issue_pieces(
    ctrl: &mut Controller,
    output: &mut PortSet,
    input: &mut PortSet,
    index: usize,
) -> Result<()> {
    loop {
        let (source, primary, next, pieces) = match ctrl.in_flight.get(index) {
            Some(h) => match h.transfers.first() {
                Some(&primary) => (h.output, primary, h.next_piece, h.pieces),
                None => return Ok(()),
            },
            None => return Ok(()),
        };
        if next >= pieces {
            return Ok(());
        }
        let piece = ctrl
            .plan
            .as_ref()
            .and_then(|plan| plan.pieces().get(next).copied())
            .ok_or_else(|| TransportError::state("piece outside the transfer plan"))?;
        let Some(ib) = ctrl.port_ready(input, piece.rank)? else {
            return Ok(());
        };

        let id = ctrl.push_id(source.port, source.buffer, piece.rank, ib, next)?;
        let key = GateKey {
            sequence: next,
            port: piece.rank,
            buffer: ib,
        };
        ctrl.start_push(output, input, source, piece.rank, ib, id, Some((primary, key)))?;
        if let Some(h) = ctrl.in_flight.get_mut(index) {
            h.next_piece += 1;
        }
        tracing::trace!(
            port = source.port,
            buffer = source.buffer,
            piece = next,
            rank = piece.rank,
            input_buffer = ib,
            "gated piece started"
        );
    }
}

/// Full buffer with the lowest `(sequence, parts_sequence)`.
pub(super) fn next_full(input: &PortSet, p: usize) -> Result<Option<usize>> {
    let port = input.port(p)?;
    let endpoint = port.location()?;
    let mut best: Option<((u64, u32), usize)> = None;
    for (ib, buffer) in port.buffers.iter().enumerate() {
        if !buffer.is_full(endpoint)? {
            continue;
        }
        let meta = buffer.read_metadata(endpoint)?;
        let key = (meta.sequence, meta.parts_sequence);
        if best.map_or(true, |(current, _)| key < current) {
            best = Some((key, ib));
        }
    }
    Ok(best.map(|(_, ib)| ib))
}
