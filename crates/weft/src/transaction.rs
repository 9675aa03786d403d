use std::collections::HashMap;

use tracing::debug;
use weft_utils::{alloc, bug};

use crate::{
    connection::{ConnectionId, Connections, QueuedSend},
    error::{Error, Result},
    message::Message,
    transport::Transport,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TransactionId(u64);

/// Handle over one staged fan-out.
///
/// Staging can fail; once it has succeeded, [`Transactions::execute`] delivers
/// everything and [`Transactions::cancel`] delivers nothing, and neither can
/// fail. The handle is move-only and must end in one of the two; dropping it
/// unconsumed is a programming error.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    consumed: bool,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    fn consume(mut self) -> TransactionId {
        self.consumed = true;
        self.id
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.consumed && !std::thread::panicking() {
            bug!("transaction {:?} dropped without commit or cancel", self.id);
        }
    }
}

/// The transaction engine: tracks, per live transaction, which connections
/// hold at least one staged entry. The staged messages themselves live on the
/// connection records, keyed back here by transaction id; neither collection
/// owns the other.
#[derive(Debug, Default)]
pub struct Transactions {
    live: HashMap<TransactionId, Vec<ConnectionId>>,
    next_id: u64,
}

impl Transactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// True when `txn` currently lists `conn` as a staging target.
    pub fn is_listed(&self, txn: TransactionId, conn: ConnectionId) -> bool {
        self.live.get(&txn).is_some_and(|listed| listed.contains(&conn))
    }

    /// Opens an empty transaction.
    pub fn begin(&mut self) -> Result<Transaction> {
        alloc::claim().map_err(Error::from)?;

        let id = TransactionId(self.next_id);
        self.next_id += 1;
        self.live.insert(id, Vec::new());
        Ok(Transaction { id, consumed: false })
    }

    /// Stages `message` for delivery to `target` under `txn`.
    ///
    /// Staging to a departed peer succeeds as a no-op. Any partial work is
    /// unwound before a failure is returned, so a failed call leaves no trace.
    pub fn send(
        &mut self,
        connections: &mut Connections,
        transport: &mut dyn Transport,
        txn: &Transaction,
        target: ConnectionId,
        message: &Message,
    ) -> Result<()> {
        if !transport.is_connected(target) {
            return Ok(());
        }

        let reservation = match transport.preallocate_send(target) {
            Ok(reservation) => reservation,
            Err(Error::Disconnected) => return Ok(()),
            Err(err) => return Err(err),
        };

        let Some(record) = connections.record_mut(target) else {
            bug!("staging to a connection without a record: {target:?}");
            transport.free_preallocated(target, reservation);
            return Ok(());
        };

        if alloc::reserve_deque(&mut record.pending, 1).is_err() {
            transport.free_preallocated(target, reservation);
            return Err(Error::NoMemory);
        }
        record
            .pending
            .push_front(QueuedSend { txn: txn.id, message: message.clone(), reservation });

        // List the connection on the transaction unless an earlier staged
        // entry already did.
        let first_for_txn = record.pending.iter().skip(1).all(|entry| entry.txn != txn.id);
        if first_for_txn {
            let Some(listed) = self.live.get_mut(&txn.id) else {
                bug!("staging on a dead transaction {:?}", txn.id);
                let entry = record.pending.pop_front().expect("just staged");
                transport.free_preallocated(target, entry.reservation);
                return Ok(());
            };
            if alloc::reserve_vec(listed, 1).is_err() {
                let entry = record.pending.pop_front().expect("just staged");
                transport.free_preallocated(target, entry.reservation);
                return Err(Error::NoMemory);
            }
            listed.insert(0, target);
        }

        Ok(())
    }

    /// Builds an error reply to `in_reply_to` and stages it for `target`.
    pub fn send_error_reply(
        &mut self,
        connections: &mut Connections,
        transport: &mut dyn Transport,
        txn: &Transaction,
        target: ConnectionId,
        name: &str,
        text: &str,
        in_reply_to: &Message,
    ) -> Result<()> {
        let reply = Message::error_reply(in_reply_to, name, text)?;
        self.send(connections, transport, txn, target, &reply)
    }

    /// Commits: delivers every staged entry of `txn`, oldest first per
    /// connection, each through the reservation taken at staging time. No
    /// allocation happens here, so commit cannot fail.
    pub fn execute(&mut self, connections: &mut Connections, transport: &mut dyn Transport, txn: Transaction) {
        let id = txn.consume();
        let Some(targets) = self.live.remove(&id) else {
            bug!("executing unknown transaction {id:?}");
            return;
        };

        for target in targets {
            let Some(record) = connections.record_mut(target) else { continue };

            // Newest entries sit at the front; walk from the back to deliver
            // in staging order.
            let mut index = record.pending.len();
            while index > 0 {
                index -= 1;
                if record.pending[index].txn != id {
                    continue;
                }
                let entry = record.pending.remove(index).expect("index in bounds");
                transport.send_preallocated(target, entry.reservation, &entry.message);
            }
        }

        debug!(?id, "transaction committed");
    }

    /// Cancels: removes every staged entry of `txn` and releases its message
    /// and reservation. Nothing reaches a transport. Cannot fail.
    pub fn cancel(&mut self, connections: &mut Connections, transport: &mut dyn Transport, txn: Transaction) {
        let id = txn.consume();
        let Some(targets) = self.live.remove(&id) else {
            bug!("canceling unknown transaction {id:?}");
            return;
        };

        for target in targets {
            let Some(record) = connections.record_mut(target) else { continue };

            let mut index = 0;
            while index < record.pending.len() {
                if record.pending[index].txn != id {
                    index += 1;
                    continue;
                }
                let entry = record.pending.remove(index).expect("index in bounds");
                transport.free_preallocated(target, entry.reservation);
            }
        }

        debug!(?id, "transaction canceled");
    }

    /// Unlists `conn` from `txn` after its staged entries were purged by
    /// disconnect teardown. Only the first purged entry per transaction has
    /// an effect.
    pub(crate) fn forget_connection(&mut self, txn: TransactionId, conn: ConnectionId) {
        if let Some(listed) = self.live.get_mut(&txn)
            && let Some(pos) = listed.iter().position(|&c| c == conn)
        {
            listed.swap_remove(pos);
        }
    }
}
