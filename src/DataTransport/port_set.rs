use crate::error::{Result, TransportError};
use crate::Core::endpoint::Endpoint;
use crate::DataTransport::builder::PortSetDescriptor;
use crate::DataTransport::distribution::DataDistribution;
use crate::DataTransport::port::{ExternalState, Port, Role};
use crate::DataTransport::Buffer::Buffer::Direction;
use std::sync::Arc;

/// Same-direction ports sharing distribution and buffer geometry.
pub struct PortSet {
    pub ports: Vec<Port>,
    pub is_output: bool,
    pub distribution: DataDistribution,
    pub buffer_count: usize,
    pub buffer_length: usize,
    pub role: Role,
    pub flag_is_meta: bool,
    bound: bool,
}

impl PortSet {
    /// Real output ports on `endpoint`.
    pub fn local_output(endpoint: &Arc<Endpoint>, descriptor: &PortSetDescriptor) -> Result<Self> {
        descriptor.validate()?;
        let ports = (0..descriptor.port_count)
            .map(|id| {
                Port::local_output(
                    id,
                    endpoint,
                    descriptor.buffer_count,
                    descriptor.buffer_size,
                    descriptor.port_count,
                    descriptor.role,
                    descriptor.flag_is_meta,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_ports(ports, true, descriptor))
    }

    /// Real input ports on `endpoint`, fed by `producers` output ports.
    pub fn local_input(
        endpoint: &Arc<Endpoint>,
        descriptor: &PortSetDescriptor,
        producers: usize,
    ) -> Result<Self> {
        descriptor.validate()?;
        let ports = (0..descriptor.port_count)
            .map(|id| {
                Port::local_input(
                    id,
                    endpoint,
                    descriptor.buffer_count,
                    descriptor.buffer_size,
                    producers,
                    descriptor.role,
                    descriptor.flag_is_meta,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_ports(ports, false, descriptor))
    }

    /// Shadow ports standing in for a remote PortSet.
    pub fn placeholder(descriptor: &PortSetDescriptor, is_output: bool, state_words: usize) -> Self {
        let direction = if is_output {
            Direction::Output
        } else {
            Direction::Input
        };
        let ports = (0..descriptor.port_count)
            .map(|id| {
                Port::placeholder(
                    id,
                    direction,
                    descriptor.buffer_count,
                    descriptor.buffer_size,
                    state_words,
                    descriptor.role,
                    descriptor.flag_is_meta,
                )
            })
            .collect();
        Self::from_ports(ports, is_output, descriptor)
    }

    fn from_ports(ports: Vec<Port>, is_output: bool, descriptor: &PortSetDescriptor) -> Self {
        Self {
            ports,
            is_output,
            distribution: descriptor.distribution,
            buffer_count: descriptor.buffer_count,
            buffer_length: descriptor.buffer_size,
            role: descriptor.role,
            flag_is_meta: descriptor.flag_is_meta,
            bound: false,
        }
    }

    pub fn descriptor(&self) -> PortSetDescriptor {
        PortSetDescriptor {
            port_count: self.ports.len(),
            buffer_count: self.buffer_count,
            buffer_size: self.buffer_length,
            distribution: self.distribution,
            role: self.role,
            flag_is_meta: self.flag_is_meta,
        }
    }

    pub fn port(&self, index: usize) -> Result<&Port> {
        let count = self.ports.len();
        self.ports.get(index).ok_or(TransportError::UnknownPort {
            what: if self.is_output { "output port" } else { "input port" },
            index,
            count,
        })
    }

    pub fn port_mut(&mut self, index: usize) -> Result<&mut Port> {
        let count = self.ports.len();
        let what = if self.is_output { "output port" } else { "input port" };
        self.ports
            .get_mut(index)
            .ok_or(TransportError::UnknownPort { what, index, count })
    }

    pub fn is_ready(&self) -> bool {
        self.ports.iter().all(Port::is_ready)
    }

    /// True when the ports stand in for a remote PortSet.
    pub fn is_shadow(&self) -> bool {
        self.ports.first().map(|p| p.shadow).unwrap_or(false)
    }

    /// Every port has a real location.
    pub fn is_located(&self) -> bool {
        self.ports.iter().all(Port::has_location)
    }

    pub fn set_external(&mut self, state: ExternalState) {
        for port in &mut self.ports {
            port.external = state;
        }
    }

    /// Record that a controller now drives this set. Allowed once.
    pub fn bind_controller(&mut self) -> Result<()> {
        if self.bound {
            return Err(TransportError::state("port set already has a controller"));
        }
        if !self.is_ready() {
            return Err(TransportError::state("port set is not ready"));
        }
        self.bound = true;
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub(crate) fn unbind(&mut self) {
        self.bound = false;
    }
}

impl std::fmt::Debug for PortSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_port_set(self, f)
    }
}
