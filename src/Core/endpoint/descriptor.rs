use crate::error::{Result, TransportError};
use crate::DataTransport::Structs::Mailbox_Structs::END_POINT_NAME_LEN;
use std::fmt;
use std::str::FromStr;

/// Memory backing an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointProtocol {
    /// Process-private heap region.
    Heap,
    /// `/dev/shm` file, attachable by other processes.
    Shm,
}

impl EndpointProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointProtocol::Heap => "dmxp-heap",
            EndpointProtocol::Shm => "dmxp-shm",
        }
    }
}

impl FromStr for EndpointProtocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dmxp-heap" => Ok(EndpointProtocol::Heap),
            "dmxp-shm" => Ok(EndpointProtocol::Shm),
            other => Err(TransportError::InvalidEndpoint {
                name: other.to_string(),
                reason: "unknown protocol (expected dmxp-heap or dmxp-shm)".into(),
            }),
        }
    }
}

/// Parsed form of `<protocol>:<address>;<size>.<mailbox>.<max_mailboxes>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub protocol: EndpointProtocol,
    pub address: String,
    pub size: usize,
    pub mailbox_id: u16,
    pub max_mailboxes: u16,
    pub(crate) text: String,
}

impl EndpointDescriptor {
    pub fn new(
        protocol: EndpointProtocol,
        address: &str,
        size: usize,
        mailbox_id: u16,
        max_mailboxes: u16,
    ) -> Result<Self> {
        let text = format!(
            "{}:{};{}.{}.{}",
            protocol.as_str(),
            address,
            size,
            mailbox_id,
            max_mailboxes
        );
        let invalid = |reason: String| TransportError::InvalidEndpoint {
            name: text.clone(),
            reason,
        };

        if address.is_empty() {
            return Err(invalid("empty address".into()));
        }
        if address.contains([';', ':', '/']) {
            return Err(invalid("address may not contain ';', ':' or '/'".into()));
        }
        if size == 0 {
            return Err(invalid("size must be non-zero".into()));
        }
        if max_mailboxes == 0 || mailbox_id >= max_mailboxes {
            return Err(invalid(format!(
                "mailbox {} outside 0..{}",
                mailbox_id, max_mailboxes
            )));
        }
        if text.len() >= END_POINT_NAME_LEN {
            return Err(invalid(format!(
                "name longer than {} bytes",
                END_POINT_NAME_LEN - 1
            )));
        }

        Ok(Self {
            protocol,
            address: address.to_string(),
            size,
            mailbox_id,
            max_mailboxes,
            text,
        })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            name: s.to_string(),
            reason: reason.to_string(),
        };

        let (protocol, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid("missing ':' after protocol"))?;
        let (address, geometry) = rest
            .split_once(';')
            .ok_or_else(|| invalid("missing ';' after address"))?;

        let mut fields = geometry.split('.');
        let mut next = |what: &str| {
            fields
                .next()
                .ok_or_else(|| invalid(&format!("missing {}", what)))
        };
        let size = next("size")?
            .parse::<usize>()
            .map_err(|_| invalid("size is not a number"))?;
        let mailbox_id = next("mailbox id")?
            .parse::<u16>()
            .map_err(|_| invalid("mailbox id is not a number"))?;
        let max_mailboxes = next("mailbox count")?
            .parse::<u16>()
            .map_err(|_| invalid("mailbox count is not a number"))?;
        if fields.next().is_some() {
            return Err(invalid("trailing fields"));
        }

        Self::new(
            protocol.parse()?,
            address,
            size,
            mailbox_id,
            max_mailboxes,
        )
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for EndpointDescriptor {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_canonical_form() {
        let d = EndpointDescriptor::parse("dmxp-shm:node-a;1048576.3.8").unwrap();
        assert_eq!(d.protocol, EndpointProtocol::Shm);
        assert_eq!(d.address, "node-a");
        assert_eq!(d.size, 1 << 20);
        assert_eq!(d.mailbox_id, 3);
        assert_eq!(d.max_mailboxes, 8);
        assert_eq!(d.to_string(), "dmxp-shm:node-a;1048576.3.8");
    }

    #[test]
    fn rejects_malformed_strings() {
        for bad in [
            "dmxp-heap",
            "tcp:host;10.0.1",
            "dmxp-heap:a;10.4.4",
            "dmxp-heap:a;0.0.1",
            "dmxp-heap:;10.0.1",
            "dmxp-heap:a;10.0",
            "dmxp-heap:a;10.0.1.9",
        ] {
            let err = EndpointDescriptor::parse(bad).unwrap_err();
            assert!(
                matches!(err, TransportError::InvalidEndpoint { .. }),
                "{bad}: {err}"
            );
        }
    }
}
