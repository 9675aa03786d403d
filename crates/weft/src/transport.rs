use weft_utils::{bug, bug_assert};

use crate::{
    connection::{ConnectionId, Connections},
    dispatch::Dispatcher,
    error::Result,
    message::Message,
    transaction::Transactions,
    watch::{MainLoop, Readiness},
};

/// A reservation against one connection's outbound queue: proof that exactly
/// one message can later be sent to that connection without allocating.
///
/// The handle is move-only and must end in
/// [`Transport::send_preallocated`] or [`Transport::free_preallocated`];
/// dropping it armed is a programming error. A reservation never outlives its
/// connection.
#[derive(Debug)]
pub struct PreallocatedSend {
    connection: ConnectionId,
    slot: u64,
    armed: bool,
}

impl PreallocatedSend {
    /// Issued by transports from `preallocate_send`.
    pub fn new(connection: ConnectionId, slot: u64) -> Self {
        Self { connection, slot, armed: true }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Disarms the handle and yields its slot. Transports call this from the
    /// send and free paths.
    pub fn consume(mut self) -> u64 {
        self.armed = false;
        self.slot
    }

    /// Disarms in place without consuming a slot. Only for record teardown
    /// when the owning transport is already gone.
    pub(crate) fn forget(&mut self) {
        self.armed = false;
    }
}

impl Drop for PreallocatedSend {
    fn drop(&mut self) {
        if self.armed && !std::thread::panicking() {
            bug!("send reservation for {:?} leaked", self.connection);
        }
    }
}

/// The byte-moving side of the bus, one instance per process.
///
/// Everything here is single-threaded; implementations are driven from the
/// event loop only.
pub trait Transport {
    /// False once the peer is gone; staging to such a connection silently
    /// succeeds as a no-op.
    fn is_connected(&self, conn: ConnectionId) -> bool;

    /// Reserves outbound queue room for one message. Fails with `NoMemory`
    /// when the queue cannot grow, `Disconnected` when the peer is gone.
    fn preallocate_send(&mut self, conn: ConnectionId) -> Result<PreallocatedSend>;

    /// Sends `message` through `reservation`. Stamps the serial if the
    /// message does not carry one, locks it, and enqueues it; never fails and
    /// never allocates.
    fn send_preallocated(&mut self, conn: ConnectionId, reservation: PreallocatedSend, message: &Message);

    /// Releases an unused reservation.
    fn free_preallocated(&mut self, conn: ConnectionId, reservation: PreallocatedSend);

    /// Performs the IO indicated by a readiness condition.
    fn handle_watch(&mut self, conn: ConnectionId, ready: Readiness);

    /// Routes one loaded inbound message to the dispatcher. Returns whether
    /// more messages are ready for this connection.
    fn dispatch_message(
        &mut self,
        connections: &mut Connections,
        transactions: &mut Transactions,
        dispatcher: &mut dyn Dispatcher,
        conn: ConnectionId,
    ) -> bool;

    /// Registers this connection's readiness sources with the event loop.
    fn install_watches(&mut self, main_loop: &mut dyn MainLoop, conn: ConnectionId) -> Result<()>;

    /// Unregisters this connection's readiness sources.
    fn uninstall_watches(&mut self, main_loop: &mut dyn MainLoop, conn: ConnectionId);

    /// Starts closing the connection. Teardown completes through
    /// [`Connections::disconnected`].
    fn disconnect(&mut self, conn: ConnectionId);
}

/// Shared sanity check for transports consuming a reservation.
pub fn check_reservation(conn: ConnectionId, reservation: &PreallocatedSend) {
    bug_assert!(
        reservation.connection() == conn,
        "reservation for {:?} used on {:?}",
        reservation.connection(),
        conn
    );
}
