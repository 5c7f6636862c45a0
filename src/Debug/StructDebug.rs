use std::fmt;
use crate::Core::endpoint::Endpoint;
use crate::DataTransport::circuit::Circuit;
use crate::DataTransport::controller::Controller;
use crate::DataTransport::port_set::PortSet;

/// Debug function for Endpoint
///
/// Shows the name, mailbox and heap usage; the mapped memory itself is
/// never dereferenced.
pub fn debug_endpoint(endpoint: &Endpoint, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Endpoint")
        .field("name", &endpoint.name())
        .field("mailbox_id", &endpoint.mailbox_id())
        .field("header", &format_args!("{:p}", endpoint.header_ptr()))
        .field("size", &endpoint.size())
        .field("used", &endpoint.used_memory())
        .field("allocations", &endpoint.allocation_count())
        .field("owner", &endpoint.is_owner())
        .finish()
}

/// Debug function for PortSet
pub fn debug_port_set(set: &PortSet, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PortSet")
        .field("is_output", &set.is_output)
        .field("ports", &set.ports.len())
        .field("buffers", &set.buffer_count)
        .field("buffer_length", &set.buffer_length)
        .field("distribution", &set.distribution.kind)
        .field("role", &set.role)
        .field("shadow", &set.is_shadow())
        .field("ready", &set.is_ready())
        .finish_non_exhaustive()
}

/// Debug function for Controller
pub fn debug_controller(controller: &Controller, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Controller")
        .field("kind", &controller.kind())
        .field("templates", &controller.template_count())
        .field("in_flight", &controller.in_flight())
        .finish_non_exhaustive()
}

/// Debug function for Circuit
///
/// Shows:
/// - Identity and lifecycle state
/// - Output and input PortSets
/// - Selected controller kinds
pub fn debug_circuit(circuit: &Circuit, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kinds: Vec<_> = (0..circuit.inputs().len())
        .filter_map(|set| circuit.controller(set).ok().map(Controller::kind))
        .collect();
    f.debug_struct("Circuit")
        .field("id", &format_args!("{:#010x}", circuit.id()))
        .field("state", &circuit.state())
        .field("ready", &circuit.is_ready())
        .field("ref_count", &circuit.ref_count())
        .field("endpoint", &circuit.endpoint().name())
        .field("output", circuit.output())
        .field("inputs", &circuit.inputs())
        .field("controllers", &kinds)
        .finish()
}
