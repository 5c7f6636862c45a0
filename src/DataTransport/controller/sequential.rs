// Patterns 2 and 3: sequential round robin over the input ports.
//
// Pattern 3 adds a control token stored in every output port's control
// block. Only the port whose id matches the token may hand off; each
// hand-off ends by copying the holder's next-token word over every
// port's token word.

use super::{Controller, ControllerKind};
use crate::error::Result;
use crate::Core::xfer::{XferFactory, XferKind, XferRequest};
use crate::DataTransport::port_set::PortSet;
use std::sync::atomic::Ordering;

pub(super) fn designated_port(ctrl: &Controller, input: &PortSet) -> usize {
    ctrl.next_port % input.ports.len().max(1)
}

pub(super) fn can_produce(ctrl: &Controller, output: &PortSet, input: &PortSet, r: usize) -> Result<bool> {
    if ctrl.kind == ControllerKind::Pattern3 && !may_hand_off(ctrl, output, r)? {
        return Ok(false);
    }
    Ok(ctrl.port_ready(input, designated_port(ctrl, input))?.is_some())
}

/// Token check of Pattern 3. Only the first input PortSet gates and passes
/// the token; a whole hands off to every set under one token turn.
pub(super) fn may_hand_off(ctrl: &Controller, output: &PortSet, r: usize) -> Result<bool> {
    if ctrl.set != 0 {
        return Ok(true);
    }
    Ok(ctrl.in_flight.is_empty() && has_token(output, r)?)
}

pub(super) fn has_token(output: &PortSet, r: usize) -> Result<bool> {
    let port = output.port(r)?;
    let token = port.location()?.flag(port.token_offset())?.load(Ordering::Acquire);
    Ok(token as usize == r)
}

/// Copies port `r`'s next-token word over every port's token word.
pub(super) fn token_request(
    factory: &dyn XferFactory,
    output: &PortSet,
    r: usize,
) -> Result<Box<dyn XferRequest>> {
    let holder = output.port(r)?;
    let endpoint = holder.location()?;
    let services = factory.services(endpoint, endpoint)?;
    let mut request = services.create_request();
    for port in &output.ports {
        request.copy(
            holder.next_token_offset(),
            port.token_offset(),
            4,
            XferKind::Flag,
        )?;
    }
    Ok(request)
}
