// Process-wide endpoint registry
// Endpoints are found by name (the wire identifier carried in mailbox
// requests) or by mailbox id. Entries are weak so dropping the last Arc
// tears the region down.

use super::{Endpoint, EndpointDescriptor, EndpointProtocol};
use crate::error::{Result, TransportError};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct Registry {
    by_name: HashMap<String, Weak<Endpoint>>,
    by_mailbox: HashMap<u16, String>,
    attached: HashMap<String, Weak<Endpoint>>,
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        by_name: HashMap::new(),
        by_mailbox: HashMap::new(),
        attached: HashMap::new(),
    });

    /// Named mailbox locks, one per remote endpoint.
    static ref MAILBOX_LOCKS: Mutex<HashMap<String, Arc<Mutex<()>>>> =
        Mutex::new(HashMap::new());
}

pub(crate) fn register(endpoint: &Arc<Endpoint>) -> Result<()> {
    let mut registry = REGISTRY.lock();
    let name = endpoint.name().to_string();
    let mailbox = endpoint.mailbox_id();

    if let Some(existing) = registry.by_mailbox.get(&mailbox) {
        let alive = registry
            .by_name
            .get(existing)
            .map(|w| w.strong_count() > 0)
            .unwrap_or(false);
        if alive {
            return Err(TransportError::config(format!(
                "mailbox id {} already used by endpoint {}",
                mailbox, existing
            )));
        }
    }
    if let Some(existing) = registry.by_name.get(&name) {
        if existing.strong_count() > 0 {
            return Err(TransportError::config(format!(
                "endpoint {} already exists",
                name
            )));
        }
    }

    registry.by_name.insert(name.clone(), Arc::downgrade(endpoint));
    registry.by_mailbox.insert(mailbox, name);
    Ok(())
}

pub(crate) fn unregister(name: &str, mailbox: u16) {
    let mut registry = REGISTRY.lock();
    let dead = registry
        .by_name
        .get(name)
        .map(|w| w.strong_count() == 0)
        .unwrap_or(false);
    if dead {
        registry.by_name.remove(name);
        if registry.by_mailbox.get(&mailbox).map(String::as_str) == Some(name) {
            registry.by_mailbox.remove(&mailbox);
        }
    }
}

/// Find an endpoint by its wire name.
///
/// Endpoints created in this process are returned directly. A `dmxp-shm`
/// name that is not local is attached from `/dev/shm`.
pub fn resolve(name: &str) -> Result<Arc<Endpoint>> {
    {
        let registry = REGISTRY.lock();
        if let Some(endpoint) = registry.by_name.get(name).and_then(Weak::upgrade) {
            return Ok(endpoint);
        }
        if let Some(endpoint) = registry.attached.get(name).and_then(Weak::upgrade) {
            return Ok(endpoint);
        }
    }

    let descriptor = EndpointDescriptor::parse(name)?;
    if descriptor.protocol != EndpointProtocol::Shm {
        return Err(TransportError::InvalidEndpoint {
            name: name.to_string(),
            reason: "no such endpoint in this process".into(),
        });
    }

    let endpoint = Endpoint::attach(descriptor)?;
    REGISTRY
        .lock()
        .attached
        .insert(name.to_string(), Arc::downgrade(&endpoint));
    Ok(endpoint)
}

/// Endpoint owning `mailbox`, if one is alive in this process.
pub fn by_mailbox(mailbox: u16) -> Option<Arc<Endpoint>> {
    let registry = REGISTRY.lock();
    let name = registry.by_mailbox.get(&mailbox)?;
    registry.by_name.get(name).and_then(Weak::upgrade)
}

/// Lock serializing mailbox claims against the endpoint called `name`.
pub fn mailbox_lock(name: &str) -> Arc<Mutex<()>> {
    MAILBOX_LOCKS
        .lock()
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Names of all live local endpoints.
pub fn local_endpoints() -> Vec<String> {
    let registry = REGISTRY.lock();
    let mut names: Vec<String> = registry
        .by_name
        .iter()
        .filter(|(_, w)| w.strong_count() > 0)
        .map(|(n, _)| n.clone())
        .collect();
    names.sort();
    names
}
