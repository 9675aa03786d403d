use std::{collections::HashMap, io, net::SocketAddr, time::Duration};

use mio::{Events, Interest, Poll, Token, event::Event, net::TcpListener};
use tracing::{info, trace, warn};
use weft::{
    ConnectionId, Connections, Dispatcher, Error, MainLoop, Readiness, Result, ServiceDirectory,
    Transactions, Watch, WatchId, handle_watch_event,
};
use weft_utils::alloc;

use crate::Endpoints;

const LISTENER: Token = Token(0);

/// Watch bookkeeping plus the one sanctioned blocking point.
#[derive(Default)]
pub struct LoopState {
    watches: HashMap<WatchId, Watch>,
}

impl LoopState {
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

impl MainLoop for LoopState {
    fn add_watch(&mut self, watch: Watch) -> Result<()> {
        alloc::claim().map_err(Error::from)?;
        self.watches.insert(watch.id, watch);
        Ok(())
    }

    fn remove_watch(&mut self, id: WatchId) {
        self.watches.remove(&id);
    }

    fn wait_for_memory(&mut self) {
        trace!("waiting for memory");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Single-threaded poll loop: accepts clients, forwards readiness into the
/// watch adapter, and runs registry teardown for connections whose sockets
/// died.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    endpoints: Endpoints,
    loop_state: LoopState,
    next_conn: usize,
}

impl Reactor {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let registry = poll.registry().try_clone()?;

        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            listener,
            endpoints: Endpoints::new(registry),
            loop_state: LoopState::default(),
            next_conn: LISTENER.0 + 1,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn endpoints_mut(&mut self) -> &mut Endpoints {
        &mut self.endpoints
    }

    /// Polls once and services every event. Returns whether any IO happened.
    pub fn poll_once(
        &mut self,
        timeout: Option<Duration>,
        connections: &mut Connections,
        transactions: &mut Transactions,
        dispatcher: &mut dyn Dispatcher,
        services: &mut dyn ServiceDirectory,
    ) -> io::Result<bool> {
        self.poll.poll(&mut self.events, timeout)?;

        let batch: Vec<(Token, Readiness)> =
            self.events.iter().map(|event| (event.token(), readiness_of(event))).collect();
        let worked = !batch.is_empty();

        for (token, ready) in batch {
            if token == LISTENER {
                self.accept_pending(connections, dispatcher);
                continue;
            }
            handle_watch_event(
                connections,
                transactions,
                &mut self.endpoints,
                dispatcher,
                ConnectionId(token.0),
                ready,
            );
        }

        self.reap_dead(connections, transactions, dispatcher, services);
        Ok(worked)
    }

    fn accept_pending(&mut self, connections: &mut Connections, dispatcher: &mut dyn Dispatcher) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let id = ConnectionId(self.next_conn);
                    self.next_conn += 1;
                    info!(?id, ?addr, "client connected");

                    let _ = stream.set_nodelay(true);
                    if let Err(err) = self.endpoints.attach(id, stream) {
                        warn!(?id, ?err, "no room to attach client");
                        continue;
                    }
                    if let Err(err) =
                        connections.setup(&mut self.endpoints, dispatcher, &mut self.loop_state, id)
                    {
                        warn!(?id, ?err, "client setup failed");
                        self.endpoints.remove(id);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }

    fn reap_dead(
        &mut self,
        connections: &mut Connections,
        transactions: &mut Transactions,
        dispatcher: &mut dyn Dispatcher,
        services: &mut dyn ServiceDirectory,
    ) {
        for id in self.endpoints.take_dead() {
            if connections.contains(id) {
                connections.disconnected(
                    transactions,
                    &mut self.endpoints,
                    dispatcher,
                    services,
                    &mut self.loop_state,
                    id,
                );
            }
            self.endpoints.remove(id);
        }
    }
}

fn readiness_of(event: &Event) -> Readiness {
    let mut ready = Readiness::empty();
    if event.is_readable() {
        ready |= Readiness::READABLE;
    }
    if event.is_writable() {
        ready |= Readiness::WRITABLE;
    }
    if event.is_read_closed() || event.is_write_closed() {
        ready |= Readiness::HANGUP;
    }
    if event.is_error() {
        ready |= Readiness::ERROR;
    }
    ready
}
