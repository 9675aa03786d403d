#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};

use weft::{
    ConnectionId, Connections, Dispatcher, Error, Message, PreallocatedSend, Readiness, Result,
    SerialCounter, ServiceDirectory, ServiceId, Transaction, Transactions, Transport, Watch,
    WatchId, MainLoop,
};

/// In-memory transport: records everything the bus asks of it.
#[derive(Default)]
pub struct MockTransport {
    connected: HashSet<ConnectionId>,
    pub sent: HashMap<ConnectionId, Vec<Message>>,
    outstanding: HashMap<ConnectionId, usize>,
    pub inbound: HashMap<ConnectionId, VecDeque<Message>>,
    pub handled: Vec<(ConnectionId, Readiness)>,
    pub installed: Vec<ConnectionId>,
    pub uninstalled: Vec<ConnectionId>,
    pub disconnects: Vec<ConnectionId>,
    pub fail_preallocations: u32,
    serials: SerialCounter,
    next_slot: u64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, id: ConnectionId) {
        self.connected.insert(id);
    }

    /// Simulates the peer going away at the socket level.
    pub fn drop_peer(&mut self, id: ConnectionId) {
        self.connected.remove(&id);
    }

    pub fn sent_to(&self, id: ConnectionId) -> &[Message] {
        self.sent.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Reservations currently armed against `id`.
    pub fn outstanding(&self, id: ConnectionId) -> usize {
        self.outstanding.get(&id).copied().unwrap_or(0)
    }

    pub fn queue_inbound(&mut self, id: ConnectionId, message: Message) {
        self.inbound.entry(id).or_default().push_back(message);
    }
}

impl Transport for MockTransport {
    fn is_connected(&self, conn: ConnectionId) -> bool {
        self.connected.contains(&conn)
    }

    fn preallocate_send(&mut self, conn: ConnectionId) -> Result<PreallocatedSend> {
        if self.fail_preallocations > 0 {
            self.fail_preallocations -= 1;
            return Err(Error::NoMemory);
        }
        if !self.connected.contains(&conn) {
            return Err(Error::Disconnected);
        }
        *self.outstanding.entry(conn).or_default() += 1;
        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(PreallocatedSend::new(conn, slot))
    }

    fn send_preallocated(&mut self, conn: ConnectionId, reservation: PreallocatedSend, message: &Message) {
        weft::transport::check_reservation(conn, &reservation);
        reservation.consume();
        let outstanding = self.outstanding.entry(conn).or_default();
        assert!(*outstanding > 0, "send without a reservation");
        *outstanding -= 1;

        if message.serial() == 0 {
            message.set_serial(self.serials.next());
        }
        message.lock();
        self.sent.entry(conn).or_default().push(message.clone());
    }

    fn free_preallocated(&mut self, conn: ConnectionId, reservation: PreallocatedSend) {
        weft::transport::check_reservation(conn, &reservation);
        reservation.consume();
        let outstanding = self.outstanding.entry(conn).or_default();
        assert!(*outstanding > 0, "free without a reservation");
        *outstanding -= 1;
    }

    fn handle_watch(&mut self, conn: ConnectionId, ready: Readiness) {
        self.handled.push((conn, ready));
    }

    fn dispatch_message(
        &mut self,
        connections: &mut Connections,
        transactions: &mut Transactions,
        dispatcher: &mut dyn Dispatcher,
        conn: ConnectionId,
    ) -> bool {
        let Some(message) = self.inbound.get_mut(&conn).and_then(VecDeque::pop_front) else {
            return false;
        };
        dispatcher.dispatch(connections, transactions, self, conn, message);
        self.inbound.get(&conn).is_some_and(|queue| !queue.is_empty())
    }

    fn install_watches(&mut self, main_loop: &mut dyn MainLoop, conn: ConnectionId) -> Result<()> {
        main_loop.add_watch(Watch {
            id: WatchId(conn.0 as u64),
            connection: conn,
            interest: Readiness::READABLE,
        })?;
        self.installed.push(conn);
        Ok(())
    }

    fn uninstall_watches(&mut self, main_loop: &mut dyn MainLoop, conn: ConnectionId) {
        main_loop.remove_watch(WatchId(conn.0 as u64));
        self.uninstalled.push(conn);
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        self.connected.remove(&conn);
        self.disconnects.push(conn);
    }
}

/// Event loop stand-in. `wait_for_memory` disarms the allocation failure
/// injector, so retry loops make progress in tests.
#[derive(Default)]
pub struct MockLoop {
    pub watches: Vec<Watch>,
    pub removed: Vec<WatchId>,
    pub waits: usize,
}

impl MockLoop {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MainLoop for MockLoop {
    fn add_watch(&mut self, watch: Watch) -> Result<()> {
        self.watches.push(watch);
        Ok(())
    }

    fn remove_watch(&mut self, id: WatchId) {
        self.removed.push(id);
    }

    fn wait_for_memory(&mut self) {
        self.waits += 1;
        weft_utils::alloc::reset();
    }
}

#[derive(Default)]
pub struct MockDispatcher {
    pub added: Vec<ConnectionId>,
    pub removed: Vec<ConnectionId>,
    pub dispatched: Vec<(ConnectionId, Message)>,
    pub fail_next_add: bool,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dispatcher for MockDispatcher {
    fn add_connection(&mut self, conn: ConnectionId) -> Result<()> {
        if self.fail_next_add {
            self.fail_next_add = false;
            return Err(Error::NoMemory);
        }
        self.added.push(conn);
        Ok(())
    }

    fn remove_connection(&mut self, conn: ConnectionId) {
        self.removed.push(conn);
    }

    fn dispatch(
        &mut self,
        _connections: &mut Connections,
        _transactions: &mut Transactions,
        _transport: &mut dyn Transport,
        source: ConnectionId,
        message: Message,
    ) {
        self.dispatched.push((source, message));
    }
}

/// Service directory where each service has one observer connection that gets
/// a release broadcast.
#[derive(Default)]
pub struct ReleaseServices {
    pub observers: HashMap<ServiceId, ConnectionId>,
    pub released: Vec<ServiceId>,
}

impl ReleaseServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, service: ServiceId, observer: ConnectionId) {
        self.observers.insert(service, observer);
    }

    pub fn notice_name(service: ServiceId) -> String {
        format!("dev.weft.Service.Released.{}", service.0)
    }
}

impl ServiceDirectory for ReleaseServices {
    fn remove_owner(
        &mut self,
        connections: &mut Connections,
        transactions: &mut Transactions,
        transport: &mut dyn Transport,
        txn: &mut Transaction,
        service: ServiceId,
        owner: ConnectionId,
    ) -> Result<()> {
        // Stage the broadcast before touching ownership, so a NoMemory here
        // leaves the whole operation retryable.
        if let Some(&observer) = self.observers.get(&service) {
            let notice = Message::new(&Self::notice_name(service))?;
            transactions.send(connections, transport, txn, observer, &notice)?;
        }

        connections.remove_owned_service(owner, service);
        self.released.push(service);
        Ok(())
    }
}

/// Wires three fresh connections into a registry backed by the mocks.
pub fn attach(
    connections: &mut Connections,
    transport: &mut MockTransport,
    dispatcher: &mut MockDispatcher,
    main_loop: &mut MockLoop,
    ids: &[ConnectionId],
) {
    for &id in ids {
        transport.connect(id);
        connections
            .setup(transport, dispatcher, main_loop, id)
            .expect("setup failed");
    }
}
