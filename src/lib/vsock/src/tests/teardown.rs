//! Teardown paths: orderly shutdown, abortive reset, peer detach, VM resume,
//! pending-connection expiry and close.

use crate::packet::{ControlPacket, PacketType, Payload, ProtoFlags};
use crate::socket::{ShutdownFlags, SocketError, State};
use crate::tests::util::Duration;
use crate::tests::{state, TestNet, CLIENT_CID, SERVER_CID, SERVER_PORT};
use crate::{
    Addr, PollEvents, RecvFlags, SendError, SendFlags, ShutdownError,
};

#[test]
fn orderly_shutdown_both_directions() {
    let net = TestNet::new();
    let (client, _listener, accepted) = net.establish(1);

    // the client finishes its side with data still in flight
    net.client.send(&client, b"fin", SendFlags::empty()).unwrap();
    net.client.shutdown(&client, ShutdownFlags::SEND).unwrap();

    // the SHUTDOWN packet carries the direction mask
    let mut saw_shutdown = false;
    while let Some(bytes) = net.sim.pop_wire(SERVER_CID) {
        let pkt = ControlPacket::parse(&bytes).unwrap();
        if pkt.ty == PacketType::Shutdown {
            assert_eq!(pkt.payload, Payload::Mode(ShutdownFlags::SEND.bits() as u64));
            saw_shutdown = true;
        }
        net.server.receive_datagram(&bytes).unwrap();
        net.sim.run_work();
    }
    assert!(saw_shutdown);

    assert_eq!(accepted.lock().peer_shutdown, ShutdownFlags::SEND);

    // the server can still send against a half-closed stream
    assert_eq!(
        net.server.send(&accepted, b"late", SendFlags::empty()).unwrap(),
        4
    );
    net.pump();

    // buffered bytes are still readable, then a clean end of stream
    let mut buf = [0u8; 8];
    let n = net
        .server
        .recv(&accepted, &mut buf, RecvFlags::DONTWAIT)
        .unwrap();
    assert_eq!(&buf[..n], b"fin");
    assert_eq!(
        net.server.recv(&accepted, &mut buf, RecvFlags::DONTWAIT).unwrap(),
        0
    );
    assert!(accepted.lock().done);

    // further sends against the drained conversation fail cleanly
    assert_eq!(
        net.server.send(&accepted, b"x", SendFlags::DONTWAIT),
        Err(SendError::NotConnected)
    );

    // the server closes its own side; the client drains and sees EOF
    net.server.shutdown(&accepted, ShutdownFlags::SEND).unwrap();
    net.pump();

    let n = net
        .client
        .recv(&client, &mut buf, RecvFlags::DONTWAIT)
        .unwrap();
    assert_eq!(&buf[..n], b"late");
    assert_eq!(
        net.client.recv(&client, &mut buf, RecvFlags::DONTWAIT).unwrap(),
        0
    );
    assert!(client.lock().done);
    assert_eq!(client.lock().peer_shutdown, ShutdownFlags::SEND);
}

#[test]
fn shutdown_is_idempotent_and_monotonic() {
    let net = TestNet::new();
    let (client, _listener, accepted) = net.establish(1);

    net.client.shutdown(&client, ShutdownFlags::SEND).unwrap();
    net.client.shutdown(&client, ShutdownFlags::SEND).unwrap();
    assert_eq!(client.lock().shutdown, ShutdownFlags::SEND);

    net.client.shutdown(&client, ShutdownFlags::RCV).unwrap();
    assert_eq!(client.lock().shutdown, ShutdownFlags::BOTH);
    net.pump();

    // the peer's observed mask folds the same way
    assert_eq!(accepted.lock().peer_shutdown, ShutdownFlags::BOTH);

    // an empty mask is rejected, and a never-connected socket has nothing to
    // shut down
    assert_eq!(
        net.client.shutdown(&client, ShutdownFlags::empty()),
        Err(ShutdownError::Invalid)
    );
    let fresh = net.client.socket(crate::Credentials::default());
    assert_eq!(
        net.client.shutdown(&fresh, ShutdownFlags::SEND),
        Err(ShutdownError::NotConnected)
    );
}

#[test]
fn peer_detach_resets_an_idle_connection() {
    let net = TestNet::new();
    let (client, _listener, _accepted) = net.establish(1);

    let handle = client.lock().qp_handle;

    // the server's host process dies; the substrate reports the detach
    net.client.peer_detach_event(handle);

    let core = client.lock();
    assert!(core.done);
    assert_eq!(core.peer_shutdown, ShutdownFlags::BOTH);
    assert_eq!(core.state, State::Unconnected);
    assert_eq!(core.err, Some(SocketError::ConnReset));
    drop(core);

    // the orderly-EOF rule still applies: done is set and the queue is empty
    let mut buf = [0u8; 4];
    assert_eq!(
        net.client.recv(&client, &mut buf, RecvFlags::DONTWAIT).unwrap(),
        0
    );

    let mask = net.client.poll(&client);
    assert!(mask.contains(PollEvents::ERR));
    assert!(mask.contains(PollEvents::RDHUP));
}

#[test]
fn peer_detach_with_buffered_data_waits_for_the_drain() {
    let net = TestNet::new();
    let (client, _listener, accepted) = net.establish(1);

    net.server.send(&accepted, b"last words", SendFlags::empty()).unwrap();
    net.pump();

    let handle = client.lock().qp_handle;
    net.client.peer_detach_event(handle);

    // still connected until the data is drained
    assert_eq!(state(&client), State::Connected);
    assert!(client.lock().done);

    let mut buf = [0u8; 16];
    let n = net
        .client
        .recv(&client, &mut buf, RecvFlags::DONTWAIT)
        .unwrap();
    assert_eq!(&buf[..n], b"last words");

    assert_eq!(state(&client), State::Unconnected);
    assert_eq!(
        net.client.recv(&client, &mut buf, RecvFlags::DONTWAIT).unwrap(),
        0
    );
}

#[test]
fn detach_during_connect_resets_the_attempt() {
    let net = TestNet::new();
    let _listener = net.listener(1);
    let client = net.start_connect();

    // run the handshake up to the OFFER, then lose the peer
    let request = net.sim.pop_wire(SERVER_CID).unwrap();
    net.server.receive_datagram(&request).unwrap();
    net.sim.run_work();
    let negotiate = net.sim.pop_wire(CLIENT_CID).unwrap();
    net.client.receive_datagram(&negotiate).unwrap();
    net.sim.run_work();

    // the client has allocated its pair and sent the OFFER
    let handle = client.lock().qp_handle;
    assert!(!handle.is_invalid());

    net.client.peer_detach_event(handle);

    assert_eq!(state(&client), State::Unconnected);
    assert_eq!(client.lock().err, Some(SocketError::ConnReset));
}

#[test]
fn rst_in_connected_state_allows_draining() {
    let net = TestNet::new();
    let (client, _listener, accepted) = net.establish(1);

    net.server.send(&accepted, b"tail", SendFlags::empty()).unwrap();
    net.pump();

    // forge a RST from the server side
    let mut rst = ControlPacket::new(
        Addr::new(SERVER_CID, SERVER_PORT),
        net.client.local_addr(&client),
        SERVER_CID,
        PacketType::Rst,
        Payload::Size(0),
        ProtoFlags::empty(),
    );
    rst.dg_src.context = SERVER_CID;
    net.client.receive_datagram(&rst.encode()).unwrap();
    net.sim.run_work();

    // treated like a clean shutdown while data remains
    {
        let core = client.lock();
        assert!(core.done);
        assert_eq!(core.peer_shutdown, ShutdownFlags::BOTH);
        assert_eq!(core.state, State::Connected);
    }

    let mut buf = [0u8; 8];
    let n = net
        .client
        .recv(&client, &mut buf, RecvFlags::DONTWAIT)
        .unwrap();
    assert_eq!(&buf[..n], b"tail");
    assert_eq!(
        net.client.recv(&client, &mut buf, RecvFlags::DONTWAIT).unwrap(),
        0
    );
}

#[test]
fn rst_on_an_empty_connection_disconnects() {
    let net = TestNet::new();
    let (client, _listener, _accepted) = net.establish(1);

    let mut rst = ControlPacket::new(
        Addr::new(SERVER_CID, SERVER_PORT),
        net.client.local_addr(&client),
        SERVER_CID,
        PacketType::Rst,
        Payload::Size(0),
        ProtoFlags::empty(),
    );
    rst.dg_src.context = SERVER_CID;
    net.client.receive_datagram(&rst.encode()).unwrap();
    net.sim.run_work();

    assert_eq!(state(&client), State::Disconnecting);
    assert!(client.lock().done);
}

#[test]
fn pending_children_expire_and_free_the_backlog() {
    let net = TestNet::new();
    let listener = net.listener(1);

    // a first client gets stuck after the server replies NEGOTIATE2
    let first = net.start_connect();
    let request = net.sim.pop_wire(SERVER_CID).unwrap();
    net.server.receive_datagram(&request).unwrap();
    net.sim.run_work();
    // the NEGOTIATE2 is lost; the child stays pending
    net.sim.pop_wire(CLIENT_CID).unwrap();

    {
        let lcore = listener.lock();
        assert_eq!(lcore.ack_backlog, 1);
        assert_eq!(lcore.pending.len(), 1);
    }

    // a second request is refused while the slot is taken
    let _second = net.start_connect();
    let request = net.sim.pop_wire(SERVER_CID).unwrap();
    net.server.receive_datagram(&request).unwrap();
    net.sim.run_work();
    let refusal = ControlPacket::parse(&net.sim.pop_wire(CLIENT_CID).unwrap()).unwrap();
    assert_eq!(refusal.ty, PacketType::Rst);

    // one second later the stuck child is reaped
    net.sim.advance(Duration::from_secs(1));
    {
        let lcore = listener.lock();
        assert_eq!(lcore.ack_backlog, 0);
        assert!(lcore.pending.is_empty());
    }
    assert_eq!(state(&first), State::Connecting);

    // and a fresh request now succeeds
    let third = net.start_connect();
    net.pump();
    assert_eq!(state(&third), State::Connected);
    assert!(net.server.accept(&listener, true).is_ok());
}

#[test]
fn accepted_children_survive_the_cleanup_timer() {
    let net = TestNet::new();
    let (client, listener, accepted) = net.establish(1);

    net.sim.advance(Duration::from_secs(2));

    assert_eq!(state(&accepted), State::Connected);
    assert_eq!(state(&client), State::Connected);
    assert_eq!(listener.lock().ack_backlog, 0);

    // the connection still works
    net.client.send(&client, b"alive", SendFlags::empty()).unwrap();
    net.pump();
    let mut buf = [0u8; 8];
    let n = net
        .server
        .recv(&accepted, &mut buf, RecvFlags::DONTWAIT)
        .unwrap();
    assert_eq!(&buf[..n], b"alive");
}

#[test]
fn closing_a_listener_releases_unaccepted_children() {
    let net = TestNet::new();
    let listener = net.listener(2);
    let _client = net.start_connect();
    net.pump();

    // the handshake completed but nobody accepted
    assert_eq!(listener.lock().accept_queue.len(), 1);

    net.server.close(&listener);

    assert_eq!(state(&listener), State::Free);
    // the child's queue pair was released on the substrate
    assert!(!net.sim.take_detached().is_empty());

    // the listener is gone from the bound table: new requests draw RST
    let orphan = net.start_connect();
    net.pump();
    assert_eq!(state(&orphan), State::Unconnected);
    assert_eq!(orphan.lock().err, Some(SocketError::ConnReset));
}

#[test]
fn close_detaches_and_unlinks_a_connected_socket() {
    let net = TestNet::new();
    let (client, _listener, accepted) = net.establish(1);

    net.client.close(&client);
    assert_eq!(state(&client), State::Free);
    assert!(client.lock().qp.is_none());

    // the substrate saw the detach; delivering it to the server ends the
    // conversation there
    let detached = net.sim.take_detached();
    assert!(!detached.is_empty());
    net.server.peer_detach_event(detached[0]);

    assert!(accepted.lock().done);
    assert_eq!(accepted.lock().peer_shutdown, ShutdownFlags::BOTH);
}

#[test]
fn vm_resume_drops_every_connection() {
    let net = TestNet::new();
    let (client, _listener, _accepted) = net.establish(1);

    net.client.queue_pairs_resumed();

    let core = client.lock();
    assert!(core.done);
    assert_eq!(core.state, State::Unconnected);
    assert_eq!(core.peer_shutdown, ShutdownFlags::BOTH);
}

#[test]
fn poll_reflects_lifecycle() {
    let net = TestNet::new();

    // a fresh socket reports nothing
    let fresh = net.client.socket(crate::Credentials::default());
    assert_eq!(net.client.poll(&fresh), PollEvents::empty());

    // an idle listener is not readable; a ready child makes it so
    let listener = net.listener(1);
    assert!(!net.server.poll(&listener).contains(PollEvents::IN));

    let client = net.start_connect();
    net.pump();
    let mask = net.server.poll(&listener);
    assert!(mask.contains(PollEvents::IN | PollEvents::RDNORM));

    // a connected socket with room is writable, and readable once data sits
    // in the queue
    let accepted = net.server.accept(&listener, true).unwrap();
    let mask = net.client.poll(&client);
    assert!(mask.contains(PollEvents::OUT | PollEvents::WRNORM));
    assert!(!mask.contains(PollEvents::IN));

    net.server.send(&accepted, b"ready", SendFlags::empty()).unwrap();
    net.pump();
    assert!(net.client.poll(&client).contains(PollEvents::IN | PollEvents::RDNORM));

    // half-close on both sides reads as hangup
    net.client.shutdown(&client, ShutdownFlags::SEND).unwrap();
    net.server.shutdown(&accepted, ShutdownFlags::SEND).unwrap();
    net.pump();
    let mask = net.client.poll(&client);
    assert!(mask.contains(PollEvents::HUP));
    assert!(mask.contains(PollEvents::RDHUP));
}
