use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
    net::Shutdown,
};

use indexmap::IndexMap;
use mio::{Interest, Registry, Token, net::TcpStream};
use tracing::{debug, info, trace, warn};
use weft::{
    ConnectionId, Connections, Dispatcher, Error, MainLoop, Message, MessageLoader,
    PreallocatedSend, PrologueFramer, Readiness, Result, SerialCounter, SizeCounter, Transactions,
    Transport, Watch, WatchId, loader, transport::check_reservation,
};
use weft_utils::{alloc, bug_assert};

fn token(conn: ConnectionId) -> Token {
    Token(conn.0)
}

fn watch_id(conn: ConnectionId) -> WatchId {
    WatchId(conn.0 as u64)
}

/// Outbound bytes queued per connection before a crossing is logged.
const DEFAULT_OUT_HIGH_WATER: usize = 8 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum IoOutcome {
    Open,
    Dead,
}

struct Endpoint {
    stream: TcpStream,
    loader: MessageLoader,
    /// Locked messages waiting for the socket; capacity is claimed up front
    /// by reservations, so enqueuing never allocates.
    out: VecDeque<Message>,
    /// Reservations currently armed against `out`.
    reserved: usize,
    /// Bytes of the front outbound message already written.
    write_pos: usize,
    outgoing_bytes: SizeCounter,
    writable_armed: bool,
    open: bool,
}

impl Endpoint {
    fn new(stream: TcpStream, max_message_size: usize) -> Self {
        let mut loader = MessageLoader::new(Box::new(PrologueFramer));
        loader.set_max_message_size(max_message_size);
        Self {
            stream,
            loader,
            out: VecDeque::new(),
            reserved: 0,
            write_pos: 0,
            outgoing_bytes: SizeCounter::new(),
            writable_armed: false,
            open: true,
        }
    }

    /// Reads until the kernel blocks, straight into loader-owned memory.
    fn read_ready(&mut self, conn: ConnectionId) -> IoOutcome {
        loop {
            if self.loader.is_corrupted() {
                warn!(?conn, "inbound stream corrupted, closing");
                return IoOutcome::Dead;
            }

            let buf = match self.loader.get_buffer() {
                Ok(buf) => buf,
                Err(err) => {
                    // Bytes stay in the kernel; retried on the next readiness.
                    debug!(?conn, ?err, "no loader buffer for inbound data");
                    return IoOutcome::Open;
                }
            };

            match self.stream.read(buf) {
                Ok(0) => {
                    self.loader.return_buffer(0);
                    return IoOutcome::Dead;
                }
                Ok(n) => self.loader.return_buffer(n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.loader.return_buffer(0);
                    return IoOutcome::Open;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.loader.return_buffer(0);
                }
                Err(err) => {
                    self.loader.return_buffer(0);
                    debug!(?conn, ?err, "tcp read failed");
                    return IoOutcome::Dead;
                }
            }
        }
    }

    /// Flushes queued messages until the kernel blocks or the queue drains.
    fn write_ready(&mut self, conn: ConnectionId) -> IoOutcome {
        loop {
            let Some(front) = self.out.front() else { return IoOutcome::Open };
            let (header, body) = front.network_data();
            let header_len = header.len();
            let total = header_len + body.len();

            let written = if self.write_pos < header_len {
                self.stream.write_vectored(&[
                    IoSlice::new(&header[self.write_pos..]),
                    IoSlice::new(&body),
                ])
            } else {
                self.stream.write(&body[self.write_pos - header_len..])
            };

            match written {
                Ok(0) => return IoOutcome::Dead,
                Ok(n) => {
                    drop(header);
                    drop(body);
                    self.write_pos += n;
                    if self.write_pos >= total {
                        self.write_pos = 0;
                        self.out.pop_front();
                        trace!(?conn, "outbound message flushed");
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return IoOutcome::Open;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?conn, ?err, "tcp write failed");
                    return IoOutcome::Dead;
                }
            }
        }
    }
}

/// The concrete transport: one mio TCP stream, loader, and outbound queue per
/// connection.
///
/// Inbound bytes land directly in loader buffers through the borrow protocol;
/// outbound queue capacity is claimed at reservation time, so commit-time
/// sends never allocate.
pub struct Endpoints {
    registry: Registry,
    conns: IndexMap<ConnectionId, Endpoint>,
    serials: SerialCounter,
    max_message_size: usize,
    out_high_water: usize,
    next_slot: u64,
    dead: Vec<ConnectionId>,
}

impl Endpoints {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            conns: IndexMap::new(),
            serials: SerialCounter::new(),
            max_message_size: loader::DEFAULT_MAX_MESSAGE_SIZE,
            out_high_water: DEFAULT_OUT_HIGH_WATER,
            next_slot: 0,
            dead: Vec::new(),
        }
    }

    /// Caps a single inbound message for all connections attached afterwards.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the queued-bytes level above which a connection gets flagged.
    pub fn with_out_high_water(mut self, bytes: usize) -> Self {
        self.out_high_water = bytes;
        self
    }

    /// Adopts an accepted stream under `conn`. Watches are installed
    /// separately during connection setup.
    pub fn attach(&mut self, conn: ConnectionId, stream: TcpStream) -> Result<()> {
        bug_assert!(!self.conns.contains_key(&conn), "connection {conn:?} attached twice");
        alloc::claim().map_err(Error::from)?;
        self.conns.insert(conn, Endpoint::new(stream, self.max_message_size));
        Ok(())
    }

    /// Drops all per-connection state. Must run after registry teardown, once
    /// every reservation has been consumed or freed.
    pub fn remove(&mut self, conn: ConnectionId) {
        if let Some(endpoint) = self.conns.shift_remove(&conn) {
            bug_assert!(endpoint.reserved == 0, "endpoint {conn:?} removed with armed reservations");
        }
    }

    /// Connections whose sockets died since the last call; the reactor runs
    /// registry teardown for each.
    pub fn take_dead(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.dead)
    }

    pub fn queued_outbound(&self, conn: ConnectionId) -> usize {
        self.conns.get(&conn).map_or(0, |endpoint| endpoint.out.len())
    }

    fn retire(dead: &mut Vec<ConnectionId>, conn: ConnectionId, endpoint: &mut Endpoint) {
        if endpoint.open {
            info!(?conn, "closing connection");
            endpoint.open = false;
            let _ = endpoint.stream.shutdown(Shutdown::Both);
            dead.push(conn);
        }
    }
}

impl Transport for Endpoints {
    fn is_connected(&self, conn: ConnectionId) -> bool {
        self.conns.get(&conn).is_some_and(|endpoint| endpoint.open)
    }

    fn preallocate_send(&mut self, conn: ConnectionId) -> Result<PreallocatedSend> {
        let Some(endpoint) = self.conns.get_mut(&conn) else {
            return Err(Error::Disconnected);
        };
        if !endpoint.open {
            return Err(Error::Disconnected);
        }

        alloc::reserve_deque(&mut endpoint.out, endpoint.reserved + 1)?;
        endpoint.reserved += 1;

        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(PreallocatedSend::new(conn, slot))
    }

    fn send_preallocated(&mut self, conn: ConnectionId, reservation: PreallocatedSend, message: &Message) {
        check_reservation(conn, &reservation);
        reservation.consume();

        let Some(endpoint) = self.conns.get_mut(&conn) else {
            // The peer died between staging and commit; the bytes go nowhere.
            return;
        };
        bug_assert!(endpoint.reserved > 0, "send on {conn:?} without a reservation");
        endpoint.reserved = endpoint.reserved.saturating_sub(1);
        if !endpoint.open {
            return;
        }

        if message.serial() == 0 && !message.is_locked() {
            message.set_serial(self.serials.next());
        }
        message.lock();
        if message.add_size_counter(endpoint.outgoing_bytes.clone()).is_err() {
            trace!(?conn, "outbound byte accounting skipped");
        }

        // Queue room was claimed by the reservation.
        endpoint.out.push_back(message.clone());

        if endpoint.outgoing_bytes.value() > self.out_high_water {
            warn!(?conn, queued = endpoint.outgoing_bytes.value(), "outbound queue above high water");
        }

        if !endpoint.writable_armed {
            match self.registry.reregister(
                &mut endpoint.stream,
                token(conn),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                Ok(()) => endpoint.writable_armed = true,
                Err(err) => {
                    debug!(?conn, ?err, "arming writable interest failed");
                    Self::retire(&mut self.dead, conn, endpoint);
                }
            }
        }
    }

    fn free_preallocated(&mut self, conn: ConnectionId, reservation: PreallocatedSend) {
        check_reservation(conn, &reservation);
        reservation.consume();
        if let Some(endpoint) = self.conns.get_mut(&conn) {
            bug_assert!(endpoint.reserved > 0, "free on {conn:?} without a reservation");
            endpoint.reserved = endpoint.reserved.saturating_sub(1);
        }
    }

    fn handle_watch(&mut self, conn: ConnectionId, ready: Readiness) {
        let Some(endpoint) = self.conns.get_mut(&conn) else { return };
        if !endpoint.open {
            return;
        }

        let mut dead = false;
        if ready.contains(Readiness::READABLE)
            && endpoint.read_ready(conn) == IoOutcome::Dead
        {
            dead = true;
        }
        if !dead
            && ready.contains(Readiness::WRITABLE)
            && endpoint.write_ready(conn) == IoOutcome::Dead
        {
            dead = true;
        }
        // Hangup after draining whatever the peer left behind.
        if ready.intersects(Readiness::HANGUP | Readiness::ERROR) {
            dead = true;
        }

        if dead {
            Self::retire(&mut self.dead, conn, endpoint);
            return;
        }

        // Writable interest stays armed only while there is something to
        // flush.
        if endpoint.writable_armed && endpoint.out.is_empty() {
            match self.registry.reregister(&mut endpoint.stream, token(conn), Interest::READABLE) {
                Ok(()) => endpoint.writable_armed = false,
                Err(err) => {
                    debug!(?conn, ?err, "dropping writable interest failed");
                    Self::retire(&mut self.dead, conn, endpoint);
                }
            }
        }
    }

    fn dispatch_message(
        &mut self,
        connections: &mut Connections,
        transactions: &mut Transactions,
        dispatcher: &mut dyn Dispatcher,
        conn: ConnectionId,
    ) -> bool {
        let Some(message) = self.conns.get_mut(&conn).and_then(|endpoint| endpoint.loader.pop_message())
        else {
            return false;
        };

        dispatcher.dispatch(connections, transactions, self, conn, message);

        self.conns.get(&conn).is_some_and(|endpoint| endpoint.loader.queued_messages() > 0)
    }

    fn install_watches(&mut self, main_loop: &mut dyn MainLoop, conn: ConnectionId) -> Result<()> {
        let Some(endpoint) = self.conns.get_mut(&conn) else {
            return Err(Error::Disconnected);
        };

        if let Err(err) = self.registry.register(&mut endpoint.stream, token(conn), Interest::READABLE) {
            warn!(?conn, ?err, "watch registration failed");
            return Err(Error::Disconnected);
        }

        main_loop.add_watch(Watch {
            id: watch_id(conn),
            connection: conn,
            interest: Readiness::READABLE,
        })
    }

    fn uninstall_watches(&mut self, main_loop: &mut dyn MainLoop, conn: ConnectionId) {
        if let Some(endpoint) = self.conns.get_mut(&conn) {
            let _ = self.registry.deregister(&mut endpoint.stream);
        }
        main_loop.remove_watch(watch_id(conn));
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        let dead = &mut self.dead;
        if let Some(endpoint) = self.conns.get_mut(&conn) {
            Self::retire(dead, conn, endpoint);
        }
    }
}
