//! Mailbox control protocol.
//!
//! Every endpoint carries an inbox and an outbox array with one slot per
//! remote mailbox id. A requester writes the request into its own outbox
//! slot for the remote, copies it into the remote's inbox slot for the
//! requester and publishes the type word last. The responder answers into
//! the requester's return region, writes the error code into the
//! requester's outbox slot and clears both type words.

use crate::error::{Result, TransportError};
use crate::Core::endpoint::{registry, Endpoint};
use crate::DataTransport::Structs::Mailbox_Structs::{
    decode_name, ContainerRequest, MailBox, RequestType,
};
use std::mem::offset_of;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// Error codes carried in `MailBox::error_code`
pub const MAILBOX_OK: i32 = 0;
pub const MAILBOX_ERROR_CONFIG: i32 = -1;
pub const MAILBOX_ERROR_UNKNOWN_CIRCUIT: i32 = -2;
pub const MAILBOX_ERROR_UNKNOWN_PORT: i32 = -3;
pub const MAILBOX_ERROR_MALFORMED: i32 = -4;
pub const MAILBOX_ERROR_STATE: i32 = -5;
pub const MAILBOX_ERROR_RESOURCE: i32 = -6;
pub const MAILBOX_ERROR_REPLY_TOO_LARGE: i32 = -7;
pub const MAILBOX_ERROR_INTERNAL: i32 = -8;

const NO_REQUEST: u32 = RequestType::NoRequest as u32;

/// Code a responder reports for `error`.
pub fn error_code(error: &TransportError) -> i32 {
    match error {
        TransportError::UnsupportedController { .. }
        | TransportError::InvalidConfig { .. }
        | TransportError::InvalidEndpoint { .. }
        | TransportError::InvalidPartition { .. } => MAILBOX_ERROR_CONFIG,
        TransportError::UnknownCircuit { .. } => MAILBOX_ERROR_UNKNOWN_CIRCUIT,
        TransportError::UnknownPort { .. } => MAILBOX_ERROR_UNKNOWN_PORT,
        TransportError::MalformedRequest { .. } => MAILBOX_ERROR_MALFORMED,
        TransportError::InvalidState { .. } | TransportError::DuplicateQueuedBuffer { .. } => {
            MAILBOX_ERROR_STATE
        }
        TransportError::OutOfMemory { .. }
        | TransportError::OutOfBounds { .. }
        | TransportError::Timeout { .. } => MAILBOX_ERROR_RESOURCE,
        TransportError::CapacityExceeded { .. } => MAILBOX_ERROR_REPLY_TOO_LARGE,
        TransportError::RemoteRequestFailed { .. } | TransportError::Io(_) => MAILBOX_ERROR_INTERNAL,
    }
}

/// A request posted and not yet answered.
#[derive(Debug)]
pub struct PendingRequest {
    pub request_type: RequestType,
    pub circuit_id: u32,
    remote: Arc<Endpoint>,
    return_offset: u64,
    return_size: usize,
}

impl PendingRequest {
    pub fn remote(&self) -> &Arc<Endpoint> {
        &self.remote
    }
}

/// Requester half of the protocol for one local endpoint.
#[derive(Debug, Clone)]
pub struct MailboxClient {
    endpoint: Arc<Endpoint>,
}

impl MailboxClient {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Post `request` to `remote` with a reply region of `return_size`
    /// bytes. `None` when a previous request to `remote` is still being
    /// served; post again later.
    pub fn post(
        &self,
        remote: &Arc<Endpoint>,
        request: ContainerRequest,
        return_size: usize,
    ) -> Result<Option<PendingRequest>> {
        let request_type = request.request_type()?;
        if request_type == RequestType::NoRequest {
            return Err(TransportError::MalformedRequest {
                message: "cannot post an empty request".into(),
            });
        }

        let lock = registry::mailbox_lock(remote.name());
        let _guard = lock.lock();

        let own = self.endpoint.mailbox_id();
        let outbox = self.endpoint.outbox_offset(remote.mailbox_id())?;
        let inbox = remote.inbox_offset(own)?;
        if self.endpoint.flag(outbox)?.load(Ordering::Acquire) != NO_REQUEST
            || remote.flag(inbox)?.load(Ordering::Acquire) != NO_REQUEST
        {
            return Ok(None);
        }

        let return_offset = self.endpoint.alloc(return_size.max(1))?;
        let mut slot = MailBox {
            request,
            error_code: MAILBOX_OK,
            return_mailbox_id: own as u32,
            return_offset,
            return_size: return_size as u32,
            _pad: 0,
        };
        slot.request.header.request_type = NO_REQUEST;
        self.endpoint.write(outbox, &slot)?;
        remote.write(inbox, &slot)?;

        // Type word last: the responder only looks at slots with a type
        self.endpoint
            .flag(outbox)?
            .store(request_type as u32, Ordering::Release);
        remote
            .flag(inbox)?
            .store(request_type as u32, Ordering::Release);

        tracing::debug!(
            from = own,
            to = remote.mailbox_id(),
            request = request_type.name(),
            circuit = request.header.circuit_id,
            "mailbox request posted"
        );
        Ok(Some(PendingRequest {
            request_type,
            circuit_id: request.header.circuit_id,
            remote: remote.clone(),
            return_offset,
            return_size,
        }))
    }

    /// Reply bytes once the responder finished, `None` while it has not.
    pub fn poll(&self, pending: &PendingRequest) -> Result<Option<Vec<u8>>> {
        let outbox = self.endpoint.outbox_offset(pending.remote.mailbox_id())?;
        if self.endpoint.flag(outbox)?.load(Ordering::Acquire) != NO_REQUEST {
            return Ok(None);
        }
        let slot: MailBox = self.endpoint.read(outbox)?;
        let mut reply = vec![0u8; pending.return_size];
        self.endpoint.read_bytes(pending.return_offset, &mut reply)?;
        self.endpoint.free(pending.return_offset)?;

        if slot.error_code != MAILBOX_OK {
            tracing::warn!(
                request = pending.request_type.name(),
                remote = pending.remote.name(),
                code = slot.error_code,
                "mailbox request failed"
            );
            return Err(TransportError::RemoteRequestFailed {
                request: pending.request_type.name(),
                endpoint: pending.remote.name().to_string(),
                code: slot.error_code,
            });
        }
        Ok(Some(reply))
    }
}

/// Endpoint name carried in the request body.
fn requester_name(request: &ContainerRequest) -> Result<String> {
    let field = match request.request_type()? {
        RequestType::ReqNewConnection => unsafe { request.body.connection.output_end_point },
        RequestType::ReqUpdateCircuit => unsafe { request.body.update.output_end_point },
        RequestType::ReqShadowRstateOffset
        | RequestType::ReqInputOffsets
        | RequestType::ReqOutputControlOffset => unsafe { request.body.offsets.requester },
        RequestType::NoRequest => {
            return Err(TransportError::MalformedRequest {
                message: "empty request".into(),
            })
        }
    };
    decode_name(&field)
}

fn resolve_requester(slot: &MailBox) -> Result<Arc<Endpoint>> {
    let mailbox = slot.return_mailbox_id as u16;
    if let Ok(name) = requester_name(&slot.request) {
        if let Ok(endpoint) = registry::resolve(&name) {
            if endpoint.mailbox_id() == mailbox {
                return Ok(endpoint);
            }
        }
    }
    registry::by_mailbox(mailbox).ok_or_else(|| TransportError::InvalidEndpoint {
        name: format!("mailbox {}", mailbox),
        reason: "requester endpoint cannot be resolved".into(),
    })
}

/// Answer every pending request in `endpoint`'s inbox. `handler` receives
/// the requester endpoint and the request and returns the reply bytes.
/// Returns how many requests were served.
pub fn serve<F>(endpoint: &Arc<Endpoint>, mut handler: F) -> Result<usize>
where
    F: FnMut(&Arc<Endpoint>, &ContainerRequest) -> Result<Vec<u8>>,
{
    let mut served = 0;
    for from in 0..endpoint.max_mailboxes() {
        let inbox = endpoint.inbox_offset(from)?;
        if endpoint.flag(inbox)?.load(Ordering::Acquire) == NO_REQUEST {
            continue;
        }
        let slot: MailBox = endpoint.read(inbox)?;

        let requester = match resolve_requester(&slot) {
            Ok(requester) => requester,
            Err(e) => {
                tracing::warn!(from, error = %e, "dropping request from unknown endpoint");
                // The sender may still be reachable by the slot it wrote into
                if let Some(sender) = registry::by_mailbox(from) {
                    if let Err(e) = answer(&sender, endpoint.mailbox_id(), MAILBOX_ERROR_INTERNAL) {
                        tracing::warn!(from, error = %e, "sender outbox could not be released");
                    }
                }
                endpoint.flag(inbox)?.store(NO_REQUEST, Ordering::Release);
                continue;
            }
        };

        let code = match handler(&requester, &slot.request) {
            Ok(reply) if reply.len() > slot.return_size as usize => {
                tracing::warn!(
                    from,
                    reply = reply.len(),
                    capacity = slot.return_size,
                    "reply does not fit the return region"
                );
                MAILBOX_ERROR_REPLY_TOO_LARGE
            }
            Ok(reply) => match requester.write_bytes(slot.return_offset, &reply) {
                Ok(()) => MAILBOX_OK,
                Err(e) => {
                    tracing::warn!(from, error = %e, "reply could not be written");
                    MAILBOX_ERROR_INTERNAL
                }
            },
            Err(e) => {
                tracing::warn!(
                    from,
                    circuit = slot.request.header.circuit_id,
                    error = %e,
                    "mailbox request rejected"
                );
                error_code(&e)
            }
        };

        let answered = answer(&requester, endpoint.mailbox_id(), code);
        endpoint.flag(inbox)?.store(NO_REQUEST, Ordering::Release);
        match answered {
            Ok(()) => served += 1,
            Err(e) => tracing::warn!(from, error = %e, "requester outbox could not be released"),
        }
    }
    Ok(served)
}

/// Store `code` in the requester's outbox for `responder` and release it.
fn answer(requester: &Endpoint, responder: u16, code: i32) -> Result<()> {
    let outbox = requester.outbox_offset(responder)?;
    requester.write(outbox + offset_of!(MailBox, error_code) as u64, &code)?;
    requester.flag(outbox)?.store(NO_REQUEST, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Core::endpoint::EndpointDescriptor;
    use crate::DataTransport::Structs::Mailbox_Structs::{
        encode_name, RequestBody, RequestPortOffsets,
    };

    fn endpoint(address: &str, mailbox: u16) -> Arc<Endpoint> {
        let d = EndpointDescriptor::parse(&format!("dmxp-heap:{};1048576.{}.1024", address, mailbox))
            .unwrap();
        Endpoint::create(d).unwrap()
    }

    fn offsets_request(requester: &Endpoint, circuit: u32, port: u32) -> ContainerRequest {
        ContainerRequest::new(
            RequestType::ReqInputOffsets,
            circuit,
            RequestBody {
                offsets: RequestPortOffsets {
                    port_id: port,
                    producer_rank: 0,
                    requester: encode_name(requester.name()).unwrap(),
                },
            },
        )
    }

    #[test]
    fn request_round_trip() {
        let a = endpoint("mailbox-a", 931);
        let b = endpoint("mailbox-b", 932);
        let client = MailboxClient::new(a.clone());

        let pending = client.post(&b, offsets_request(&a, 7, 3), 8).unwrap().unwrap();
        // Slot busy until served
        assert!(client.post(&b, offsets_request(&a, 7, 4), 8).unwrap().is_none());
        assert!(client.poll(&pending).unwrap().is_none());

        let served = serve(&b, |requester, request| {
            assert_eq!(requester.mailbox_id(), 931);
            assert_eq!(request.header.circuit_id, 7);
            let port = unsafe { request.body.offsets.port_id };
            Ok((port as u64 * 10).to_le_bytes().to_vec())
        })
        .unwrap();
        assert_eq!(served, 1);

        let reply = client.poll(&pending).unwrap().unwrap();
        assert_eq!(u64::from_le_bytes(reply.try_into().unwrap()), 30);
    }

    #[test]
    fn handler_errors_surface_as_remote_failures() {
        let a = endpoint("mailbox-err-a", 933);
        let b = endpoint("mailbox-err-b", 934);
        let client = MailboxClient::new(a.clone());

        let pending = client.post(&b, offsets_request(&a, 99, 0), 8).unwrap().unwrap();
        serve(&b, |_, request| {
            Err(TransportError::UnknownCircuit {
                id: request.header.circuit_id,
            })
        })
        .unwrap();

        match client.poll(&pending) {
            Err(TransportError::RemoteRequestFailed { code, request, .. }) => {
                assert_eq!(code, MAILBOX_ERROR_UNKNOWN_CIRCUIT);
                assert_eq!(request, "ReqInputOffsets");
            }
            other => panic!("unexpected {:?}", other.map(|r| r.map(|v| v.len()))),
        }
        // The slot is free again
        assert!(client.post(&b, offsets_request(&a, 99, 0), 8).unwrap().is_some());
    }

    #[test]
    fn oversized_reply_is_rejected() {
        let a = endpoint("mailbox-big-a", 935);
        let b = endpoint("mailbox-big-b", 936);
        let client = MailboxClient::new(a.clone());
        let pending = client.post(&b, offsets_request(&a, 1, 0), 4).unwrap().unwrap();
        serve(&b, |_, _| Ok(vec![0u8; 64])).unwrap();
        assert!(matches!(
            client.poll(&pending),
            Err(TransportError::RemoteRequestFailed {
                code: MAILBOX_ERROR_REPLY_TOO_LARGE,
                ..
            })
        ));
    }

    #[test]
    fn unwritable_reply_still_frees_both_slots() {
        let a = endpoint("mailbox-lost-a", 937);
        let b = endpoint("mailbox-lost-b", 938);
        let client = MailboxClient::new(a.clone());
        let pending = client.post(&b, offsets_request(&a, 2, 0), 8).unwrap().unwrap();

        // Point the reply past the end of the requester's region
        let inbox = b.inbox_offset(937).unwrap();
        let mut slot: MailBox = b.read(inbox).unwrap();
        slot.return_offset = u64::MAX - 4;
        b.write(inbox, &slot).unwrap();

        assert_eq!(serve(&b, |_, _| Ok(vec![1u8; 8])).unwrap(), 1);
        assert!(matches!(
            client.poll(&pending),
            Err(TransportError::RemoteRequestFailed {
                code: MAILBOX_ERROR_INTERNAL,
                ..
            })
        ));
        assert!(client.post(&b, offsets_request(&a, 2, 0), 8).unwrap().is_some());
    }

    #[test]
    fn unresolvable_requester_releases_the_sender() {
        let a = endpoint("mailbox-ghost-a", 939);
        let b = endpoint("mailbox-ghost-b", 940);
        let client = MailboxClient::new(a.clone());
        let pending = client.post(&b, offsets_request(&a, 3, 0), 8).unwrap().unwrap();

        let inbox = b.inbox_offset(939).unwrap();
        let mut slot: MailBox = b.read(inbox).unwrap();
        slot.return_mailbox_id = 1023;
        slot.request.body.offsets.requester = encode_name("mailbox-ghost").unwrap();
        b.write(inbox, &slot).unwrap();

        let mut called = false;
        assert_eq!(
            serve(&b, |_, _| {
                called = true;
                Ok(Vec::new())
            })
            .unwrap(),
            0
        );
        assert!(!called);
        assert!(matches!(
            client.poll(&pending),
            Err(TransportError::RemoteRequestFailed {
                code: MAILBOX_ERROR_INTERNAL,
                ..
            })
        ));
        assert!(client.post(&b, offsets_request(&a, 3, 0), 8).unwrap().is_some());
    }
}
