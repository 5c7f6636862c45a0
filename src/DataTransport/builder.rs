use crate::error::{Result, TransportError};
use crate::Core::endpoint::{EndpointDescriptor, EndpointProtocol};
use crate::DataTransport::distribution::{DataDistribution, DataPartition, DistributionType};
use crate::DataTransport::port::Role;
use std::time::Duration;

/// Geometry and policy of one PortSet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSetDescriptor {
    pub port_count: usize,
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub distribution: DataDistribution,
    pub role: Role,
    /// Send metadata and the Full flag in a single request.
    pub flag_is_meta: bool,
}

impl Default for PortSetDescriptor {
    fn default() -> Self {
        Self {
            port_count: 1,
            buffer_count: 2,
            buffer_size: 4096,
            distribution: DataDistribution::default(),
            role: Role::ActiveMessage,
            flag_is_meta: false,
        }
    }
}

impl PortSetDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ports(mut self, port_count: usize) -> Self {
        self.port_count = port_count;
        self
    }

    pub fn with_buffers(mut self, buffer_count: usize, buffer_size: usize) -> Self {
        self.buffer_count = buffer_count;
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_distribution(mut self, kind: DistributionType) -> Self {
        self.distribution.kind = kind;
        self
    }

    pub fn with_partition(mut self, partition: DataPartition) -> Self {
        self.distribution.partition = partition;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_flag_is_meta(mut self, flag_is_meta: bool) -> Self {
        self.flag_is_meta = flag_is_meta;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_count == 0 {
            return Err(TransportError::config("port set needs at least one port"));
        }
        if self.buffer_count == 0 {
            return Err(TransportError::config("port set needs at least one buffer"));
        }
        if self.buffer_size == 0 || self.buffer_size > u32::MAX as usize {
            return Err(TransportError::config(format!(
                "buffer size {} out of range",
                self.buffer_size
            )));
        }
        self.distribution.validate()
    }

    /// Packed distribution, partition, role and flag-is-meta.
    pub(crate) fn encode(&self) -> Result<(u32, u32)> {
        let (packed, block) = self.distribution.encode()?;
        Ok((
            packed | self.role.encode() << 16 | (self.flag_is_meta as u32) << 24,
            block,
        ))
    }

    pub(crate) fn decode(
        port_count: u32,
        buffer_count: u32,
        buffer_size: u32,
        packed: u32,
        block_size: u32,
    ) -> Result<Self> {
        let descriptor = Self {
            port_count: port_count as usize,
            buffer_count: buffer_count as usize,
            buffer_size: buffer_size as usize,
            distribution: DataDistribution::decode(packed & 0xffff, block_size)?,
            role: Role::decode((packed >> 16) & 0xff)?,
            flag_is_meta: (packed >> 24) & 0xff != 0,
        };
        descriptor.validate().map_err(|e| TransportError::MalformedRequest {
            message: e.to_string(),
        })?;
        Ok(descriptor)
    }
}

/// Configuration of one [`Transport`](crate::DataTransport::Transport).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint: EndpointDescriptor,
    pub zero_copy: bool,
    /// Upper bound for the blocking setup helper.
    pub request_timeout: Duration,
    /// Sleep between polls in the blocking setup helper.
    pub poll_interval: Duration,
    /// Transfer templates one controller may build.
    pub max_templates: usize,
    /// Input PortSet created when a peer opens a connection.
    pub default_input: PortSetDescriptor,
    /// Status polls before a posted copy executes.
    pub xfer_latency: u32,
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }
}

pub struct TransportConfigBuilder {
    protocol: EndpointProtocol,
    address: Option<String>,
    size: usize,
    mailbox: u16,
    max_mailboxes: u16,
    zero_copy: bool,
    request_timeout: Duration,
    poll_interval: Duration,
    max_templates: usize,
    default_input: PortSetDescriptor,
    xfer_latency: u32,
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self {
            protocol: EndpointProtocol::Heap,
            address: None,
            size: 16 * 1024 * 1024, // 16MB default
            mailbox: 0,
            max_mailboxes: 16,
            zero_copy: true,
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            max_templates: 65536,
            default_input: PortSetDescriptor::default(),
            xfer_latency: 0,
        }
    }
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: EndpointProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_mailbox(mut self, mailbox: u16, max_mailboxes: u16) -> Self {
        self.mailbox = mailbox;
        self.max_mailboxes = max_mailboxes;
        self
    }

    pub fn with_zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_templates(mut self, max_templates: usize) -> Self {
        self.max_templates = max_templates;
        self
    }

    pub fn with_default_input(mut self, descriptor: PortSetDescriptor) -> Self {
        self.default_input = descriptor;
        self
    }

    pub fn with_xfer_latency(mut self, latency: u32) -> Self {
        self.xfer_latency = latency;
        self
    }

    /// Use a complete endpoint string instead of the individual fields.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        let descriptor = EndpointDescriptor::parse(endpoint)?;
        self.protocol = descriptor.protocol;
        self.address = Some(descriptor.address);
        self.size = descriptor.size;
        self.mailbox = descriptor.mailbox_id;
        self.max_mailboxes = descriptor.max_mailboxes;
        Ok(self)
    }

    pub fn build(self) -> Result<TransportConfig> {
        let address = self
            .address
            .unwrap_or_else(|| format!("transport-{}", self.mailbox));
        let endpoint = EndpointDescriptor::new(
            self.protocol,
            &address,
            self.size,
            self.mailbox,
            self.max_mailboxes,
        )?;
        if self.max_templates == 0 {
            return Err(TransportError::config("max_templates must be non-zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(TransportError::config("poll interval must be non-zero"));
        }
        self.default_input.validate()?;

        Ok(TransportConfig {
            endpoint,
            zero_copy: self.zero_copy,
            request_timeout: self.request_timeout,
            poll_interval: self.poll_interval,
            max_templates: self.max_templates,
            default_input: self.default_input,
            xfer_latency: self.xfer_latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = TransportConfig::builder().with_mailbox(2, 8).build().unwrap();
        assert_eq!(config.endpoint.to_string(), "dmxp-heap:transport-2;16777216.2.8");
        assert!(config.zero_copy);
        assert_eq!(config.max_templates, 65536);
    }

    #[test]
    fn descriptor_survives_wire_encoding() {
        let d = PortSetDescriptor::new()
            .with_ports(3)
            .with_buffers(4, 512)
            .with_partition(DataPartition::block(128))
            .with_role(Role::Passive)
            .with_flag_is_meta(true);
        let (packed, block) = d.encode().unwrap();
        let back = PortSetDescriptor::decode(3, 4, 512, packed, block).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let err = TransportConfig::builder()
            .with_mailbox(4, 4)
            .build()
            .unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Configuration);
        assert!(PortSetDescriptor::new().with_ports(0).validate().is_err());
    }
}
