//! Bookkeeping for every channel a context has created.

use std::{collections::HashMap, sync::Arc};

use crate::{
    client::{
        ClientError,
        callbacks::{CallbackSlot, ConnectionCallback},
        context::IoToken,
    },
    dbr::DbrBasicType,
    messages::Access,
};

/// Where a channel is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Looking for a server that hosts the name
    Searching,
    /// Bound to a server on a live circuit
    Connected,
    /// Was connected, lost the circuit, and is searching again
    Disconnected,
    /// Destroyed by the application. Terminal.
    Destroyed,
}

pub(crate) struct ChannelEntry {
    pub cid: u32,
    pub name: String,
    pub state: ChannelState,
    pub native_type: Option<DbrBasicType>,
    pub element_count: u32,
    /// The circuit this channel is attached to, once a search has resolved
    pub circuit: Option<u64>,
    pub server_id: Option<u32>,
    pub access: Access,
    pub connection: Option<Arc<CallbackSlot<ConnectionCallback>>>,
    /// Held until the first connection, so that pend_io waits for it
    pub pend_io: Option<IoToken>,
    /// Searching stopped after the retry bound with no server answering
    pub not_found: bool,
}

impl ChannelEntry {
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }
}

/// Channel lookup by client id.
///
/// Client ids are allocated sequentially and never reused within a context.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: HashMap<u32, ChannelEntry>,
    next_cid: u32,
}

impl ChannelRegistry {
    pub fn allocate(
        &mut self,
        name: &str,
        connection: Option<Arc<CallbackSlot<ConnectionCallback>>>,
        pend_io: Option<IoToken>,
    ) -> Result<u32, ClientError> {
        let cid = self.next_cid;
        self.next_cid = cid.checked_add(1).ok_or(ClientError::ResourceExhausted)?;
        self.channels.insert(
            cid,
            ChannelEntry {
                cid,
                name: name.to_owned(),
                state: ChannelState::Searching,
                native_type: None,
                element_count: 0,
                circuit: None,
                server_id: None,
                access: Access::None,
                connection,
                pend_io,
                not_found: false,
            },
        );
        Ok(cid)
    }

    pub fn lookup(&self, cid: u32) -> Option<&ChannelEntry> {
        self.channels.get(&cid)
    }

    pub fn lookup_mut(&mut self, cid: u32) -> Option<&mut ChannelEntry> {
        self.channels.get_mut(&cid)
    }

    /// Associate a found channel with the circuit that will carry it
    pub fn attach(&mut self, cid: u32, circuit: u64) -> Option<&mut ChannelEntry> {
        let entry = self.channels.get_mut(&cid)?;
        entry.circuit = Some(circuit);
        entry.not_found = false;
        // Servers that predate access rights messages grant everything
        entry.access = Access::ReadWrite;
        Some(entry)
    }

    /// Record the server's answer to a create request.
    ///
    /// Ignored unless the channel is still waiting on that same circuit.
    pub fn bind(
        &mut self,
        cid: u32,
        circuit: u64,
        server_id: u32,
        native_type: DbrBasicType,
        element_count: u32,
    ) -> Option<&mut ChannelEntry> {
        let entry = self.channels.get_mut(&cid)?;
        if entry.circuit != Some(circuit) || entry.state == ChannelState::Destroyed {
            return None;
        }
        entry.server_id = Some(server_id);
        entry.native_type = Some(native_type);
        entry.element_count = element_count;
        entry.state = ChannelState::Connected;
        Some(entry)
    }

    /// Detach a channel from its circuit, returning it to searching.
    ///
    /// Returns the state the channel was in beforehand.
    pub fn unbind(&mut self, cid: u32) -> Option<ChannelState> {
        let entry = self.channels.get_mut(&cid)?;
        let previous = entry.state;
        if previous == ChannelState::Destroyed {
            return Some(previous);
        }
        entry.circuit = None;
        entry.server_id = None;
        entry.access = Access::None;
        entry.state = if previous == ChannelState::Connected {
            ChannelState::Disconnected
        } else {
            previous
        };
        Some(previous)
    }

    /// Record that no server claimed the name. Ignored once the channel
    /// has found a circuit.
    pub fn mark_not_found(&mut self, cid: u32) -> Option<&mut ChannelEntry> {
        let entry = self.channels.get_mut(&cid)?;
        if entry.circuit.is_some() {
            return None;
        }
        entry.not_found = true;
        Some(entry)
    }

    pub fn remove(&mut self, cid: u32) -> Option<ChannelEntry> {
        let mut entry = self.channels.remove(&cid)?;
        entry.state = ChannelState::Destroyed;
        Some(entry)
    }

    /// Channels attached to a specific circuit
    pub fn on_circuit(&self, circuit: u64) -> Vec<u32> {
        let mut cids: Vec<u32> = self
            .channels
            .values()
            .filter(|c| c.circuit == Some(circuit))
            .map(|c| c.cid)
            .collect();
        cids.sort_unstable();
        cids
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_not_reused() {
        let mut registry = ChannelRegistry::default();
        let a = registry.allocate("A", None, None).unwrap();
        let b = registry.allocate("B", None, None).unwrap();
        assert_ne!(a, b);
        registry.remove(a);
        let c = registry.allocate("C", None, None).unwrap();
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn id_exhaustion_fails() {
        let mut registry = ChannelRegistry {
            next_cid: u32::MAX,
            ..Default::default()
        };
        assert!(matches!(
            registry.allocate("LAST", None, None),
            Err(ClientError::ResourceExhausted)
        ));
    }

    #[test]
    fn bind_requires_matching_circuit() {
        let mut registry = ChannelRegistry::default();
        let cid = registry.allocate("TEMP1", None, None).unwrap();
        registry.attach(cid, 4);
        assert!(registry.bind(cid, 5, 9, DbrBasicType::Double, 1).is_none());
        let entry = registry.bind(cid, 4, 9, DbrBasicType::Double, 1).unwrap();
        assert!(entry.is_connected());
        assert_eq!(entry.server_id, Some(9));
        assert_eq!(registry.on_circuit(4), vec![cid]);
    }

    #[test]
    fn unbind_returns_to_search() {
        let mut registry = ChannelRegistry::default();
        let cid = registry.allocate("TEMP1", None, None).unwrap();
        registry.attach(cid, 1);
        assert_eq!(registry.unbind(cid), Some(ChannelState::Searching));
        assert_eq!(registry.lookup(cid).unwrap().state, ChannelState::Searching);

        registry.attach(cid, 2);
        registry.bind(cid, 2, 7, DbrBasicType::Long, 1);
        assert_eq!(registry.unbind(cid), Some(ChannelState::Connected));
        let entry = registry.lookup(cid).unwrap();
        assert_eq!(entry.state, ChannelState::Disconnected);
        assert_eq!(entry.circuit, None);
        assert_eq!(entry.access, Access::None);
        assert!(registry.on_circuit(2).is_empty());
    }

    #[test]
    fn not_found_until_attached() {
        let mut registry = ChannelRegistry::default();
        let cid = registry.allocate("MISSING", None, None).unwrap();
        assert!(registry.mark_not_found(cid).is_some());
        assert!(registry.lookup(cid).unwrap().not_found);
        registry.attach(cid, 3);
        assert!(!registry.lookup(cid).unwrap().not_found);
        assert!(registry.mark_not_found(cid).is_none());
        assert!(!registry.lookup(cid).unwrap().not_found);
    }
}
