use std::collections::VecDeque;

use indexmap::IndexMap;
use tracing::debug;
use weft_utils::{alloc, bug, bug_assert};

use crate::{
    dispatch::Dispatcher,
    error::{Error, Result, names},
    message::Message,
    service::{ServiceDirectory, ServiceId},
    transaction::{TransactionId, Transactions},
    transport::{PreallocatedSend, Transport},
    watch::MainLoop,
};

/// Identity of one client attachment, assigned by the transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ConnectionId(pub usize);

/// Placeholder written into the OOM template's reply-serial field at priming
/// time; rewritten to the real request serial before the send.
const OOM_REPLY_SERIAL_PLACEHOLDER: i32 = 14;

/// One message staged on a connection by a transaction.
#[derive(Debug)]
pub(crate) struct QueuedSend {
    pub(crate) txn: TransactionId,
    pub(crate) message: Message,
    pub(crate) reservation: PreallocatedSend,
}

#[derive(Debug)]
struct OomReply {
    reservation: PreallocatedSend,
    template: Message,
}

/// Bus-side state of one connection.
#[derive(Debug, Default)]
pub struct ConnectionRecord {
    /// Unique bus name; `Some` once the client has registered. Never changes
    /// afterwards.
    unique_name: Option<String>,
    /// Services this connection owns, in acquisition order. Released LIFO on
    /// disconnect.
    services_owned: Vec<ServiceId>,
    /// Staged transaction sends, newest at the front. Entries of several live
    /// transactions interleave here.
    pub(crate) pending: VecDeque<QueuedSend>,
    oom_reply: Option<OomReply>,
}

impl ConnectionRecord {
    fn new() -> Self {
        Self::default()
    }
}

impl Drop for ConnectionRecord {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        // Teardown must have drained both lists before the record goes away.
        bug_assert!(self.services_owned.is_empty(), "record dropped with owned services");
        bug_assert!(self.pending.is_empty(), "record dropped with staged sends");

        // Orderly teardown releases the slot through the transport; when the
        // whole registry drops, the transport went with it.
        if let Some(oom) = &mut self.oom_reply {
            oom.reservation.forget();
        }
    }
}

/// Process-wide ordered set of active connections.
#[derive(Debug, Default)]
pub struct Connections {
    records: IndexMap<ConnectionId, ConnectionRecord>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.records.contains_key(&id)
    }

    pub(crate) fn record_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&id)
    }

    /// Attaches a connection the transport has accepted: allocates its
    /// record, installs its watches, and announces it to the dispatcher.
    /// Unwinds and disconnects on failure.
    pub fn setup(
        &mut self,
        transport: &mut dyn Transport,
        dispatcher: &mut dyn Dispatcher,
        main_loop: &mut dyn MainLoop,
        id: ConnectionId,
    ) -> Result<()> {
        bug_assert!(!self.records.contains_key(&id), "connection {id:?} set up twice");

        alloc::claim().map_err(Error::from)?;
        let record = ConnectionRecord::new();

        if alloc::claim().is_err() {
            transport.disconnect(id);
            return Err(Error::NoMemory);
        }
        self.records.insert(id, record);

        if let Err(err) = transport.install_watches(main_loop, id) {
            self.records.shift_remove(&id);
            transport.disconnect(id);
            return Err(err);
        }

        if let Err(err) = dispatcher.add_connection(id) {
            transport.uninstall_watches(main_loop, id);
            self.records.shift_remove(&id);
            transport.disconnect(id);
            return Err(err);
        }

        debug!(?id, "connection attached");
        Ok(())
    }

    /// Calls `f` on each connection; stops early when it returns false. The
    /// iteration tolerates the current element being removed mid-callback.
    pub fn foreach(&mut self, mut f: impl FnMut(&mut Self, ConnectionId) -> bool) {
        let ids: Vec<ConnectionId> = self.records.keys().copied().collect();
        for id in ids {
            if !self.records.contains_key(&id) {
                continue;
            }
            if !f(self, id) {
                break;
            }
        }
    }

    /// True once the client has completed registration.
    pub fn is_active(&self, id: ConnectionId) -> bool {
        self.records.get(&id).is_some_and(|record| record.unique_name.is_some())
    }

    /// Assigns the unique bus name. Set once; a second assignment is a
    /// programming error.
    pub fn set_unique_name(&mut self, id: ConnectionId, name: &str) -> Result<()> {
        let Some(record) = self.records.get_mut(&id) else {
            bug!("naming an unknown connection {id:?}");
            return Err(Error::Disconnected);
        };
        bug_assert!(record.unique_name.is_none(), "unique name for {id:?} set twice");

        record.unique_name = Some(alloc::new_string(name)?);
        Ok(())
    }

    pub fn unique_name(&self, id: ConnectionId) -> Option<&str> {
        self.records.get(&id).and_then(|record| record.unique_name.as_deref())
    }

    /// Mirrors a service grant onto the record.
    pub fn add_owned_service(&mut self, id: ConnectionId, service: ServiceId) -> Result<()> {
        let Some(record) = self.records.get_mut(&id) else {
            bug!("service granted to unknown connection {id:?}");
            return Err(Error::Disconnected);
        };
        alloc::reserve_vec(&mut record.services_owned, 1)?;
        record.services_owned.push(service);
        Ok(())
    }

    /// Mirrors a service release onto the record; removes the most recent
    /// grant. Releasing a service the connection does not own is a
    /// programming error.
    pub fn remove_owned_service(&mut self, id: ConnectionId, service: ServiceId) {
        let Some(record) = self.records.get_mut(&id) else {
            bug!("service released from unknown connection {id:?}");
            return;
        };
        match record.services_owned.iter().rposition(|&owned| owned == service) {
            Some(pos) => {
                record.services_owned.remove(pos);
            }
            None => bug!("service {service:?} not owned by {id:?}"),
        }
    }

    pub fn owned_services(&self, id: ConnectionId) -> &[ServiceId] {
        self.records.get(&id).map_or(&[], |record| record.services_owned.as_slice())
    }

    /// Number of staged transaction sends on this connection.
    pub fn pending_sends(&self, id: ConnectionId) -> usize {
        self.records.get(&id).map_or(0, |record| record.pending.len())
    }

    /// True when at least one staged send on `id` belongs to `txn`.
    pub fn has_pending_for(&self, id: ConnectionId, txn: TransactionId) -> bool {
        self.records
            .get(&id)
            .is_some_and(|record| record.pending.iter().any(|entry| entry.txn == txn))
    }

    pub fn has_oom_reply(&self, id: ConnectionId) -> bool {
        self.records.get(&id).is_some_and(|record| record.oom_reply.is_some())
    }

    /// Primes the always-answerable error reply: a send reservation plus a
    /// pre-encoded template. A second priming is a no-op.
    pub fn preallocate_oom_error(
        &mut self,
        transport: &mut dyn Transport,
        id: ConnectionId,
    ) -> Result<()> {
        let Some(record) = self.records.get_mut(&id) else {
            bug!("priming OOM reply for unknown connection {id:?}");
            return Err(Error::Disconnected);
        };
        if record.oom_reply.is_some() {
            return Ok(());
        }

        let reservation = transport.preallocate_send(id)?;

        let template = match Message::error(names::NO_MEMORY, "bus ran out of memory") {
            Ok(template) => template,
            Err(err) => {
                transport.free_preallocated(id, reservation);
                return Err(err);
            }
        };
        template.set_reply_serial(OOM_REPLY_SERIAL_PLACEHOLDER);

        record.oom_reply = Some(OomReply { reservation, template });
        Ok(())
    }

    /// Answers `in_reply_to` from the primed slot. The slot is consumed; it
    /// must be primed again before the next anticipated need.
    pub fn send_oom_error(
        &mut self,
        transport: &mut dyn Transport,
        id: ConnectionId,
        in_reply_to: &Message,
    ) {
        let Some(record) = self.records.get_mut(&id) else {
            bug!("OOM reply for unknown connection {id:?}");
            return;
        };
        let Some(OomReply { reservation, template }) = record.oom_reply.take() else {
            bug!("OOM reply sent without priming on {id:?}");
            return;
        };

        // Fixed-offset rewrite; cannot fail.
        template.set_reply_serial(in_reply_to.serial());
        transport.send_preallocated(id, reservation, &template);
    }

    /// Orderly teardown of a connection the transport reports gone.
    ///
    /// Each step can fail only for memory and must still happen, so the
    /// fan-out steps alternate with `wait_for_memory` until they stick.
    pub fn disconnected(
        &mut self,
        transactions: &mut Transactions,
        transport: &mut dyn Transport,
        dispatcher: &mut dyn Dispatcher,
        services: &mut dyn ServiceDirectory,
        main_loop: &mut dyn MainLoop,
        id: ConnectionId,
    ) {
        debug!(?id, "connection disconnected");
        if !self.records.contains_key(&id) {
            bug!("teardown of unknown connection {id:?}");
            return;
        }

        // Fan out "service released" broadcasts in one transaction. Teardown
        // cannot be abandoned, so allocation failures wait and retry.
        let mut txn = loop {
            match transactions.begin() {
                Ok(txn) => break txn,
                Err(_) => main_loop.wait_for_memory(),
            }
        };

        loop {
            let Some(record) = self.records.get(&id) else { break };
            let Some(&service) = record.services_owned.last() else { break };

            match services.remove_owner(self, transactions, transport, &mut txn, service, id) {
                Ok(()) => {}
                Err(Error::NoMemory) => main_loop.wait_for_memory(),
                Err(err) => {
                    bug!("service release failed for a non-memory reason: {err}");
                    break;
                }
            }
        }

        transactions.execute(self, transport, txn);

        dispatcher.remove_connection(id);

        transport.uninstall_watches(main_loop, id);

        // Staged sends belong to transactions that can no longer reach this
        // connection; purge them and unlist the connection from each.
        if let Some(record) = self.records.get_mut(&id) {
            while let Some(entry) = record.pending.pop_front() {
                transactions.forget_connection(entry.txn, id);
                transport.free_preallocated(id, entry.reservation);
            }
            if let Some(oom) = record.oom_reply.take() {
                transport.free_preallocated(id, oom.reservation);
            }
        }

        self.records.shift_remove(&id);
    }
}
