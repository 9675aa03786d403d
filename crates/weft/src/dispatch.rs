use crate::{
    connection::{ConnectionId, Connections},
    error::Result,
    message::Message,
    transaction::Transactions,
    transport::Transport,
};

/// Routing collaborator: decides where inbound messages go.
///
/// Implementations stage their outbound fan-out through a
/// [`Transaction`](crate::transaction::Transaction) so a mid-dispatch
/// allocation failure never leaves a partial broadcast behind.
pub trait Dispatcher {
    /// Announces a freshly attached connection.
    fn add_connection(&mut self, conn: ConnectionId) -> Result<()>;

    /// The connection is going away; drop any routing state for it.
    fn remove_connection(&mut self, conn: ConnectionId);

    /// Routes one message read from `source`.
    fn dispatch(
        &mut self,
        connections: &mut Connections,
        transactions: &mut Transactions,
        transport: &mut dyn Transport,
        source: ConnectionId,
        message: Message,
    );
}
