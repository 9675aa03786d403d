mod support;

use support::{MockDispatcher, MockLoop, MockTransport, attach};
use weft::{ConnectionId, Connections, Message, Readiness, Transactions, handle_watch_event};

const A: ConnectionId = ConnectionId(1);

#[test]
fn readiness_pumps_until_nothing_is_left() {
    let mut connections = Connections::new();
    let mut transactions = Transactions::new();
    let mut transport = MockTransport::new();
    let mut dispatcher = MockDispatcher::new();
    let mut main_loop = MockLoop::new();

    attach(&mut connections, &mut transport, &mut dispatcher, &mut main_loop, &[A]);

    let first = Message::new("dev.weft.First").unwrap();
    let second = Message::new("dev.weft.Second").unwrap();
    transport.queue_inbound(A, first.clone());
    transport.queue_inbound(A, second.clone());

    handle_watch_event(
        &mut connections,
        &mut transactions,
        &mut transport,
        &mut dispatcher,
        A,
        Readiness::READABLE,
    );

    assert_eq!(transport.handled, vec![(A, Readiness::READABLE)]);
    assert_eq!(dispatcher.dispatched.len(), 2);
    assert!(dispatcher.dispatched[0].1.ptr_eq(&first));
    assert!(dispatcher.dispatched[1].1.ptr_eq(&second));
}

#[test]
fn stale_readiness_for_a_gone_connection_is_ignored() {
    let mut connections = Connections::new();
    let mut transactions = Transactions::new();
    let mut transport = MockTransport::new();
    let mut dispatcher = MockDispatcher::new();

    // Never attached: the watch event must not reach the transport.
    handle_watch_event(
        &mut connections,
        &mut transactions,
        &mut transport,
        &mut dispatcher,
        A,
        Readiness::READABLE | Readiness::HANGUP,
    );

    assert!(transport.handled.is_empty());
    assert!(dispatcher.dispatched.is_empty());
}

#[test]
fn setup_failure_unwinds_watches_and_disconnects() {
    let mut connections = Connections::new();
    let mut transport = MockTransport::new();
    let mut dispatcher = MockDispatcher::new();
    let mut main_loop = MockLoop::new();

    transport.connect(A);
    dispatcher.fail_next_add = true;

    assert!(connections.setup(&mut transport, &mut dispatcher, &mut main_loop, A).is_err());
    assert!(!connections.contains(A));
    assert_eq!(transport.installed, vec![A]);
    assert_eq!(transport.uninstalled, vec![A]);
    assert_eq!(transport.disconnects, vec![A]);
    assert!(main_loop.watches.len() == 1 && main_loop.removed.len() == 1);
}
