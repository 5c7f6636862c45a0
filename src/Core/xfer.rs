// Primitive copy engine
// A request is an ordered list of copy operations between two endpoints.
// Flag operations publish a 32-bit word with Release ordering so they never
// become visible before the data copied ahead of them.

use crate::error::{Result, TransportError};
use crate::Core::endpoint::Endpoint;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

/// What a copy operation moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferKind {
    Data,
    MetaData,
    Flag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferStatus {
    /// Not posted since the last reset.
    Idle,
    /// Posted, not yet finished.
    Pending,
    Complete,
}

/// One reusable primitive transfer request.
pub trait XferRequest: Send {
    /// Append a copy of `len` bytes from `src` (source endpoint) to `dst`
    /// (destination endpoint). Flag copies are always 4 bytes.
    fn copy(&mut self, src: u64, dst: u64, len: usize, kind: XferKind) -> Result<()>;

    /// Issue the request.
    fn post(&mut self) -> Result<()>;

    fn status(&mut self) -> Result<XferStatus>;

    fn is_complete(&mut self) -> Result<bool> {
        Ok(self.status()? == XferStatus::Complete)
    }

    /// Re-target operations: every source or destination offset equal to
    /// `old[i]` becomes `new[i]`. Returns how many offsets changed.
    fn modify(&mut self, new: &[u64], old: &[u64]) -> Result<usize>;

    /// Back to `Idle` so the request can be posted again.
    fn reset(&mut self);

    fn op_count(&self) -> usize;
}

/// Creates requests for one (source, destination) endpoint pair.
pub trait XferServices: Send + Sync {
    fn source(&self) -> &Arc<Endpoint>;
    fn destination(&self) -> &Arc<Endpoint>;
    fn create_request(&self) -> Box<dyn XferRequest>;
}

pub trait XferFactory: Send + Sync {
    fn services(&self, src: &Arc<Endpoint>, dst: &Arc<Endpoint>) -> Result<Arc<dyn XferServices>>;
}

/// In-process copy engine over mapped endpoints.
///
/// With a non-zero `latency` a posted request only executes after that
/// many `status()` polls, which lets callers exercise the asynchronous
/// completion paths.
#[derive(Debug, Clone, Default)]
pub struct MemcpyXferFactory {
    latency: u32,
}

impl MemcpyXferFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: u32) -> Self {
        Self { latency }
    }
}

impl XferFactory for MemcpyXferFactory {
    fn services(&self, src: &Arc<Endpoint>, dst: &Arc<Endpoint>) -> Result<Arc<dyn XferServices>> {
        Ok(Arc::new(MemcpyServices {
            src: src.clone(),
            dst: dst.clone(),
            latency: self.latency,
        }))
    }
}

struct MemcpyServices {
    src: Arc<Endpoint>,
    dst: Arc<Endpoint>,
    latency: u32,
}

impl XferServices for MemcpyServices {
    fn source(&self) -> &Arc<Endpoint> {
        &self.src
    }

    fn destination(&self) -> &Arc<Endpoint> {
        &self.dst
    }

    fn create_request(&self) -> Box<dyn XferRequest> {
        Box::new(MemcpyRequest {
            src: self.src.clone(),
            dst: self.dst.clone(),
            latency: self.latency,
            ops: Vec::new(),
            state: RequestState::Idle,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CopyOp {
    src: u64,
    dst: u64,
    len: usize,
    kind: XferKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Idle,
    Posted { polls_left: u32 },
    Complete,
}

struct MemcpyRequest {
    src: Arc<Endpoint>,
    dst: Arc<Endpoint>,
    latency: u32,
    ops: Vec<CopyOp>,
    state: RequestState,
}

impl MemcpyRequest {
    fn execute(&self) -> Result<()> {
        for op in &self.ops {
            match op.kind {
                XferKind::Flag => {
                    let value = self.src.flag(op.src)?.load(Ordering::Acquire);
                    self.dst.flag(op.dst)?.store(value, Ordering::Release);
                }
                XferKind::Data | XferKind::MetaData => {
                    if op.len == 0 {
                        continue;
                    }
                    let from = self.src.map(op.src, op.len)?;
                    let to = self.dst.map(op.dst, op.len)?;
                    // Zero-copy aliases can make a copy land on itself
                    if from != to {
                        unsafe { std::ptr::copy(from, to, op.len) };
                    }
                }
            }
        }
        fence(Ordering::Release);
        Ok(())
    }
}

impl XferRequest for MemcpyRequest {
    fn copy(&mut self, src: u64, dst: u64, len: usize, kind: XferKind) -> Result<()> {
        let len = if kind == XferKind::Flag { 4 } else { len };
        // Validate at insertion so execution cannot fault
        self.src.map(src, len)?;
        self.dst.map(dst, len)?;
        if kind == XferKind::Flag && (src % 4 != 0 || dst % 4 != 0) {
            return Err(TransportError::state(format!(
                "flag copy {} -> {} is not 4-byte aligned",
                src, dst
            )));
        }
        self.ops.push(CopyOp { src, dst, len, kind });
        Ok(())
    }

    fn post(&mut self) -> Result<()> {
        if self.latency == 0 {
            self.execute()?;
            self.state = RequestState::Complete;
        } else {
            self.state = RequestState::Posted {
                polls_left: self.latency,
            };
        }
        Ok(())
    }

    fn status(&mut self) -> Result<XferStatus> {
        match self.state {
            RequestState::Idle => Ok(XferStatus::Idle),
            RequestState::Complete => Ok(XferStatus::Complete),
            RequestState::Posted { polls_left } => {
                if polls_left <= 1 {
                    self.execute()?;
                    self.state = RequestState::Complete;
                    Ok(XferStatus::Complete)
                } else {
                    self.state = RequestState::Posted {
                        polls_left: polls_left - 1,
                    };
                    Ok(XferStatus::Pending)
                }
            }
        }
    }

    fn modify(&mut self, new: &[u64], old: &[u64]) -> Result<usize> {
        if new.len() != old.len() {
            return Err(TransportError::state(format!(
                "modify given {} new and {} old offsets",
                new.len(),
                old.len()
            )));
        }
        let mut changed = 0;
        for op in &mut self.ops {
            for (n, o) in new.iter().zip(old) {
                if op.src == *o {
                    self.src.map(*n, op.len)?;
                    op.src = *n;
                    changed += 1;
                    break;
                }
            }
            for (n, o) in new.iter().zip(old) {
                if op.dst == *o {
                    self.dst.map(*n, op.len)?;
                    op.dst = *n;
                    changed += 1;
                    break;
                }
            }
        }
        Ok(changed)
    }

    fn reset(&mut self) {
        self.state = RequestState::Idle;
    }

    fn op_count(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Core::endpoint::EndpointDescriptor;
    use crate::DataTransport::Structs::Buffer_Structs::FLAG_FULL;

    fn endpoint(address: &str, mailbox: u16) -> Arc<Endpoint> {
        let d = EndpointDescriptor::parse(&format!("dmxp-heap:{};1048576.{}.1024", address, mailbox))
            .unwrap();
        Endpoint::create(d).unwrap()
    }

    #[test]
    fn latency_delays_execution() {
        let a = endpoint("xfer-a", 911);
        let b = endpoint("xfer-b", 912);
        let src = a.alloc(256).unwrap();
        let dst = b.alloc(256).unwrap();
        let flag_src = a.alloc(4).unwrap();
        let flag_dst = b.alloc(4).unwrap();
        a.write_bytes(src, b"hello").unwrap();
        a.flag(flag_src).unwrap().store(FLAG_FULL, Ordering::Relaxed);

        let services = MemcpyXferFactory::with_latency(3).services(&a, &b).unwrap();
        let mut req = services.create_request();
        req.copy(src, dst, 5, XferKind::Data).unwrap();
        req.copy(flag_src, flag_dst, 4, XferKind::Flag).unwrap();
        assert_eq!(req.status().unwrap(), XferStatus::Idle);

        req.post().unwrap();
        assert_eq!(req.status().unwrap(), XferStatus::Pending);
        assert_eq!(req.status().unwrap(), XferStatus::Pending);
        assert_eq!(b.flag(flag_dst).unwrap().load(Ordering::Acquire), 0);
        assert!(req.is_complete().unwrap());

        let mut out = [0u8; 5];
        b.read_bytes(dst, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(b.flag(flag_dst).unwrap().load(Ordering::Acquire), FLAG_FULL);
    }

    #[test]
    fn modify_retargets_source() {
        let a = endpoint("xfer-c", 913);
        let first = a.alloc(128).unwrap();
        let second = a.alloc(128).unwrap();
        let dst = a.alloc(128).unwrap();
        a.write_bytes(first, b"one").unwrap();
        a.write_bytes(second, b"two").unwrap();

        let services = MemcpyXferFactory::new().services(&a, &a).unwrap();
        let mut req = services.create_request();
        req.copy(first, dst, 3, XferKind::Data).unwrap();
        assert_eq!(req.modify(&[second], &[first]).unwrap(), 1);
        req.post().unwrap();

        let mut out = [0u8; 3];
        a.read_bytes(dst, &mut out).unwrap();
        assert_eq!(&out, b"two");
        assert!(req.copy(a.size() as u64, dst, 8, XferKind::Data).is_err());
    }
}
