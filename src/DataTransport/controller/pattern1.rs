// Pattern 1: parallel whole-to-whole push

use super::Controller;
use crate::error::Result;
use crate::DataTransport::port_set::PortSet;

/// First input port, round robin from the last one used, whose next ring
/// slot is free. Returns `(port, buffer)`.
pub(super) fn select_port(ctrl: &Controller, input: &PortSet) -> Result<Option<(usize, usize)>> {
    let count = input.ports.len();
    for step in 0..count {
        let p = (ctrl.next_port + step) % count;
        if let Some(ib) = ctrl.port_ready(input, p)? {
            return Ok(Some((p, ib)));
        }
    }
    Ok(None)
}

/// Every output and input port lives in the same endpoint memory.
pub(super) fn co_located(output: &PortSet, input: &PortSet) -> Result<bool> {
    for out in &output.ports {
        let src = out.location()?;
        for inp in &input.ports {
            if !src.same_memory(inp.location()?) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
