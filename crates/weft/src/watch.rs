use bitflags::bitflags;

use crate::{
    connection::{ConnectionId, Connections},
    dispatch::Dispatcher,
    error::Result,
    transaction::Transactions,
    transport::Transport,
};

bitflags! {
    /// Readiness conditions delivered by the event loop.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Readiness: u8 {
        const READABLE = 1;
        const WRITABLE = 1 << 1;
        const HANGUP = 1 << 2;
        const ERROR = 1 << 3;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WatchId(pub u64);

/// A readiness source the transport asks the event loop to monitor.
#[derive(Clone, Copy, Debug)]
pub struct Watch {
    pub id: WatchId,
    pub connection: ConnectionId,
    pub interest: Readiness,
}

/// The event loop collaborator.
pub trait MainLoop {
    fn add_watch(&mut self, watch: Watch) -> Result<()>;

    fn remove_watch(&mut self, id: WatchId);

    /// Sleeps briefly. The disconnect teardown alternates this with retrying
    /// allocations that cannot be abandoned; nothing else may block on it.
    fn wait_for_memory(&mut self);
}

/// Bridges one readiness event into connection dispatch: hand the condition
/// to the transport, then pump ready messages until the transport reports
/// nothing left to do.
///
/// Draining is bounded by the input already buffered; no fairness beyond that
/// is promised.
pub fn handle_watch_event(
    connections: &mut Connections,
    transactions: &mut Transactions,
    transport: &mut dyn Transport,
    dispatcher: &mut dyn Dispatcher,
    conn: ConnectionId,
    ready: Readiness,
) {
    // The connection can be torn down by an earlier event in the same poll
    // batch; readiness for it is then stale.
    if !connections.contains(conn) {
        return;
    }

    transport.handle_watch(conn, ready);

    while transport.dispatch_message(connections, transactions, dispatcher, conn) {}
}
