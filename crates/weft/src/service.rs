use crate::{
    connection::{ConnectionId, Connections},
    error::Result,
    transaction::{Transaction, Transactions},
    transport::Transport,
};

/// A well-known service name, by directory index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ServiceId(pub u32);

/// Name-ownership collaborator.
///
/// The directory owns the service-name-to-owner mapping and mirrors ownership
/// onto connection records through
/// [`Connections::add_owned_service`] / [`Connections::remove_owned_service`].
pub trait ServiceDirectory {
    /// Strips `owner` of `service`, staging any resulting ownership-change
    /// broadcasts on `txn`.
    ///
    /// Only `NoMemory` is acceptable as an error: the disconnect path retries
    /// it after waiting for memory, anything else is a bug.
    fn remove_owner(
        &mut self,
        connections: &mut Connections,
        transactions: &mut Transactions,
        transport: &mut dyn Transport,
        txn: &mut Transaction,
        service: ServiceId,
        owner: ConnectionId,
    ) -> Result<()>;
}
