mod support;

use support::{MockDispatcher, MockLoop, MockTransport, ReleaseServices, attach};
use weft::{ConnectionId, Connections, Message, ServiceId, Transactions, WatchId};

const A: ConnectionId = ConnectionId(1);
const B: ConnectionId = ConnectionId(2);

const S1: ServiceId = ServiceId(1);
const S2: ServiceId = ServiceId(2);

#[test]
fn disconnect_releases_services_lifo_in_one_transaction() {
    let mut connections = Connections::new();
    let mut transactions = Transactions::new();
    let mut transport = MockTransport::new();
    let mut dispatcher = MockDispatcher::new();
    let mut main_loop = MockLoop::new();
    let mut services = ReleaseServices::new();

    attach(&mut connections, &mut transport, &mut dispatcher, &mut main_loop, &[A, B]);

    connections.add_owned_service(A, S1).unwrap();
    connections.add_owned_service(A, S2).unwrap();
    services.watch(S1, B);
    services.watch(S2, B);

    // A live transaction with entries on both connections; it must survive
    // the teardown minus the departed connection.
    let live = transactions.begin().unwrap();
    let parting = Message::new("dev.weft.Parting").unwrap();
    transactions.send(&mut connections, &mut transport, &live, A, &parting).unwrap();
    transactions.send(&mut connections, &mut transport, &live, B, &parting).unwrap();
    let live_id = live.id();

    transport.drop_peer(A);
    connections.disconnected(
        &mut transactions,
        &mut transport,
        &mut dispatcher,
        &mut services,
        &mut main_loop,
        A,
    );

    // Most recent grant released first.
    assert_eq!(services.released, vec![S2, S1]);

    // Both broadcasts were committed as one transaction, release order
    // preserved on the observer.
    let notices = transport.sent_to(B);
    assert_eq!(notices.len(), 2);
    assert_eq!(&*notices[0].name(), ReleaseServices::notice_name(S2));
    assert_eq!(&*notices[1].name(), ReleaseServices::notice_name(S1));

    // The departed connection saw none of it.
    assert!(transport.sent_to(A).is_empty());
    assert_eq!(transport.outstanding(A), 0);

    // Registry, dispatcher, and loop all let go of A.
    assert!(!connections.contains(A));
    assert_eq!(dispatcher.removed, vec![A]);
    assert!(main_loop.removed.contains(&WatchId(A.0 as u64)));

    // A was purged from the still-live transaction, B stayed on it.
    assert!(!transactions.is_listed(live_id, A));
    assert!(transactions.is_listed(live_id, B));

    transactions.execute(&mut connections, &mut transport, live);
    let to_b = transport.sent_to(B);
    assert_eq!(to_b.len(), 3);
    assert!(to_b[2].ptr_eq(&parting));
}

#[test]
fn teardown_retries_after_memory_failures() {
    let mut connections = Connections::new();
    let mut transactions = Transactions::new();
    let mut transport = MockTransport::new();
    let mut dispatcher = MockDispatcher::new();
    let mut main_loop = MockLoop::new();
    let mut services = ReleaseServices::new();

    attach(&mut connections, &mut transport, &mut dispatcher, &mut main_loop, &[A, B]);
    connections.add_owned_service(A, S1).unwrap();
    services.watch(S1, B);

    transport.drop_peer(A);

    // Fail the transaction construction once; wait_for_memory (which disarms
    // the injector) must get the teardown through.
    weft_utils::alloc::fail_claims(0, 1);
    connections.disconnected(
        &mut transactions,
        &mut transport,
        &mut dispatcher,
        &mut services,
        &mut main_loop,
        A,
    );
    assert!(main_loop.waits >= 1);
    assert_eq!(services.released, vec![S1]);
    assert_eq!(transport.sent_to(B).len(), 1);
    assert!(!connections.contains(A));
}

#[test]
fn teardown_retries_a_failed_service_release() {
    let mut connections = Connections::new();
    let mut transactions = Transactions::new();
    let mut transport = MockTransport::new();
    let mut dispatcher = MockDispatcher::new();
    let mut main_loop = MockLoop::new();
    let mut services = ReleaseServices::new();

    attach(&mut connections, &mut transport, &mut dispatcher, &mut main_loop, &[A, B]);
    connections.add_owned_service(A, S1).unwrap();
    services.watch(S1, B);

    transport.drop_peer(A);

    // Let the transaction construction through, then fail inside the first
    // release attempt. The same service must be retried until it sticks.
    weft_utils::alloc::fail_claims(1, 1);
    connections.disconnected(
        &mut transactions,
        &mut transport,
        &mut dispatcher,
        &mut services,
        &mut main_loop,
        A,
    );
    assert!(main_loop.waits >= 1);
    assert_eq!(services.released, vec![S1]);
    assert_eq!(transport.sent_to(B).len(), 1);
    assert!(connections.owned_services(A).is_empty());
    assert!(!connections.contains(A));
}

#[test]
fn disconnect_without_services_still_tears_down() {
    let mut connections = Connections::new();
    let mut transactions = Transactions::new();
    let mut transport = MockTransport::new();
    let mut dispatcher = MockDispatcher::new();
    let mut main_loop = MockLoop::new();
    let mut services = ReleaseServices::new();

    attach(&mut connections, &mut transport, &mut dispatcher, &mut main_loop, &[A]);
    connections.preallocate_oom_error(&mut transport, A).unwrap();
    assert_eq!(transport.outstanding(A), 1);

    transport.drop_peer(A);
    connections.disconnected(
        &mut transactions,
        &mut transport,
        &mut dispatcher,
        &mut services,
        &mut main_loop,
        A,
    );

    // The primed OOM reservation was released with the record.
    assert_eq!(transport.outstanding(A), 0);
    assert!(!connections.contains(A));
    assert_eq!(transactions.live_count(), 0);
}

#[test]
fn foreach_stops_early_and_tolerates_removal() {
    let mut connections = Connections::new();
    let mut transport = MockTransport::new();
    let mut dispatcher = MockDispatcher::new();
    let mut main_loop = MockLoop::new();

    attach(&mut connections, &mut transport, &mut dispatcher, &mut main_loop, &[A, B]);

    let mut seen = Vec::new();
    connections.foreach(|_, id| {
        seen.push(id);
        false
    });
    assert_eq!(seen, vec![A]);

    // Removing the current element mid-callback must not derail iteration.
    let mut transactions = Transactions::new();
    let mut services = ReleaseServices::new();
    let mut seen = Vec::new();
    connections.foreach(|connections, id| {
        seen.push(id);
        if id == A {
            transport.drop_peer(A);
            connections.disconnected(
                &mut transactions,
                &mut transport,
                &mut dispatcher,
                &mut services,
                &mut main_loop,
                A,
            );
        }
        true
    });
    assert_eq!(seen, vec![A, B]);
    assert!(!connections.contains(A));
    assert!(connections.contains(B));
}
