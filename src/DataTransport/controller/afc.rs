// Active flow control: the producer only marks its buffer Full; the
// consumer side polls the output state, pulls data and metadata, raises
// its own Full flag and finally writes Empty back into the output buffer.

use super::{Controller, Grid, Pull};
use crate::error::Result;
use crate::Core::xfer::{XferFactory, XferKind};
use crate::DataTransport::port_set::PortSet;
use crate::DataTransport::transfer::Transfer;
use crate::DataTransport::Buffer::OutputRef;
use crate::DataTransport::Structs::Buffer_Structs::{BufferMetaData, FLAG_FULL};
use std::mem::size_of;
use std::sync::atomic::Ordering;

pub(super) fn build_pull(
    ctrl: &mut Controller,
    output: &PortSet,
    input: &PortSet,
    factory: &dyn XferFactory,
) -> Result<()> {
    let dims = vec![
        output.ports.len(),
        output.buffer_count,
        input.ports.len(),
        input.buffer_count,
    ];
    let base = ctrl.arena.len();

    for (r, out_port) in output.ports.iter().enumerate() {
        let a = out_port.location()?;
        for out_buf in &out_port.buffers {
            for in_port in &input.ports {
                let b = in_port.location()?;
                let forward = factory.services(a, b)?;
                let back = factory.services(b, a)?;
                for in_buf in &in_port.buffers {
                    let mut transfer = Transfer::new();

                    let mut data = forward.create_request();
                    data.copy(
                        out_buf.offsets.data,
                        in_buf.offsets.data,
                        output.buffer_length,
                        XferKind::Data,
                    )?;
                    data.copy(
                        out_buf.offsets.metadata,
                        in_buf.offsets.metadata,
                        size_of::<BufferMetaData>(),
                        XferKind::MetaData,
                    )?;
                    let full = (out_port.full_flag_offset(), in_buf.state_offset(r));
                    if out_port.flag_is_meta || in_port.flag_is_meta {
                        data.copy(full.0, full.1, 4, XferKind::Flag)?;
                        transfer.add_request(data)?;
                    } else {
                        transfer.add_request(data)?;
                        let mut flag = forward.create_request();
                        flag.copy(full.0, full.1, 4, XferKind::Flag)?;
                        transfer.add_request(flag)?;
                    }

                    let mut release = back.create_request();
                    release.copy(
                        in_port.empty_flag_offset(),
                        out_buf.state_offset(0),
                        4,
                        XferKind::Flag,
                    )?;
                    transfer.add_request(release)?;

                    ctrl.arena.insert(transfer)?;
                }
            }
        }
    }
    ctrl.pull = Some(Grid { base, dims });
    Ok(())
}

/// Progress running pulls and start new ones for every output buffer that
/// reads Full, in ring order per output port.
pub(super) fn poll(ctrl: &mut Controller, output: &PortSet, input: &PortSet) -> Result<()> {
    let mut running = Vec::with_capacity(ctrl.pulls.len());
    for pull in std::mem::take(&mut ctrl.pulls) {
        if ctrl.arena.progress(pull.transfer)? {
            tracing::trace!(port = pull.output.port, buffer = pull.output.buffer, "pull finished");
        } else {
            running.push(pull);
        }
    }
    ctrl.pulls = running;

    let Some(grid) = ctrl.pull.clone() else {
        return Ok(());
    };
    let n_in = input.ports.len();

    for r in 0..output.ports.len() {
        loop {
            let ob = ctrl.pull_cursor[r];
            let source = OutputRef { port: r, buffer: ob };
            if ctrl.pulls.iter().any(|p| p.output == source) {
                break;
            }
            let out_port = output.port(r)?;
            let state = out_port
                .buffer(ob)?
                .state_word(out_port.location()?, 0)?
                .load(Ordering::Acquire);
            if state != FLAG_FULL {
                break;
            }

            let mut target = None;
            for step in 0..n_in {
                let p = (ctrl.next_port + step) % n_in;
                let ib = ctrl.fill_cursor[p];
                if ctrl.reserved.contains_key(&(p, ib)) {
                    continue;
                }
                let in_port = input.port(p)?;
                if in_port.buffer(ib)?.all_empty(in_port.location()?)? {
                    target = Some((p, ib));
                    break;
                }
            }
            let Some((p, ib)) = target else {
                break;
            };

            let id = grid.id(&[r, ob, p, ib])?;
            ctrl.arena.start(id)?;
            ctrl.reserved.insert((p, ib), id);
            ctrl.pulls.push(Pull {
                output: source,
                transfer: id,
            });
            ctrl.fill_cursor[p] = (ib + 1) % input.buffer_count.max(1);
            ctrl.next_port = (p + 1) % n_in;
            ctrl.pull_cursor[r] = (ob + 1) % output.buffer_count.max(1);
            tracing::trace!(port = r, buffer = ob, input_port = p, input_buffer = ib, "pull started");
        }
    }
    Ok(())
}
