//! Tests for the stream engine. The scaffolding in [`util`] stands in for the
//! queue-pair substrate: a simulated clock drives the engine's timers, an
//! in-memory registry backs queue-pair allocation, and control datagrams are
//! queued on a per-destination wire that tests deliver explicitly (so a test
//! can observe, reorder or drop any packet of a handshake).

// ignore dead code in the test scaffolding
#![allow(dead_code)]

mod teardown;

pub mod util;

use std::sync::Arc;

use crate::socket::State;
use crate::stack::VsockStack;
use crate::tests::util::{Sim, TestEnv};
use crate::{
    Addr, ConnectError, ConnectFlags, Credentials, ProtoOverride, StackConfig, VsockSocket,
    PORT_ANY,
};

pub const CLIENT_CID: u32 = 3;
pub const SERVER_CID: u32 = 2;
pub const SERVER_PORT: u32 = 5000;

pub struct TestNet {
    pub sim: Arc<Sim>,
    pub client_env: TestEnv,
    pub server_env: TestEnv,
    pub client: Arc<VsockStack<TestEnv>>,
    pub server: Arc<VsockStack<TestEnv>>,
}

impl TestNet {
    pub fn new() -> Self {
        Self::with_configs(StackConfig::default(), StackConfig::default())
    }

    /// Both stacks speaking the legacy handshake.
    pub fn new_legacy() -> Self {
        let mut config = StackConfig::default();
        config.proto_override(Some(ProtoOverride::Legacy));
        Self::with_configs(config, StackConfig::default())
    }

    pub fn with_configs(client_config: StackConfig, server_config: StackConfig) -> Self {
        let sim = Sim::new();
        let client_env = sim.env(CLIENT_CID);
        let server_env = sim.env(SERVER_CID);
        let client = VsockStack::new(client_env.clone(), client_config);
        let server = VsockStack::new(server_env.clone(), server_config);

        Self {
            sim,
            client_env,
            server_env,
            client,
            server,
        }
    }

    /// Deliver everything on the wire to both stacks until it is quiet.
    pub fn pump(&self) {
        self.sim.run_work();

        loop {
            let mut progressed = false;

            while let Some(bytes) = self.sim.pop_wire(CLIENT_CID) {
                let _ = self.client.receive_datagram(&bytes);
                self.sim.run_work();
                progressed = true;
            }
            while let Some(bytes) = self.sim.pop_wire(SERVER_CID) {
                let _ = self.server.receive_datagram(&bytes);
                self.sim.run_work();
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
    }

    /// A server socket bound to `SERVER_PORT` and listening.
    pub fn listener(&self, backlog: u32) -> Arc<VsockSocket<TestEnv>> {
        let sk = self.server.socket(Credentials::default());
        self.server
            .bind(&sk, Addr::new(SERVER_CID, SERVER_PORT))
            .unwrap();
        self.server.listen(&sk, backlog).unwrap();
        sk
    }

    /// Start a (non-blocking) connect from a fresh client socket to the
    /// server port.
    pub fn start_connect(&self) -> Arc<VsockSocket<TestEnv>> {
        let sk = self.client.socket(Credentials::default());
        let err = VsockStack::connect(
            &self.client,
            &sk,
            Addr::new(SERVER_CID, SERVER_PORT),
            ConnectFlags::NONBLOCK,
        )
        .unwrap_err();
        assert_eq!(err, ConnectError::InProgress);
        sk
    }

    /// Run a full handshake: returns the connected client socket, the
    /// listener, and the accept()ed server-side socket.
    pub fn establish(
        &self,
        backlog: u32,
    ) -> (
        Arc<VsockSocket<TestEnv>>,
        Arc<VsockSocket<TestEnv>>,
        Arc<VsockSocket<TestEnv>>,
    ) {
        let listener = self.listener(backlog);
        let client = self.start_connect();
        self.pump();

        assert_eq!(state(&client), State::Connected);
        let accepted = self.server.accept(&listener, true).unwrap();
        assert_eq!(state(&accepted), State::Connected);

        (client, listener, accepted)
    }
}

pub fn state(sk: &Arc<VsockSocket<TestEnv>>) -> State {
    sk.lock().state
}

#[test]
fn sockets_autobind_on_connect() {
    let net = TestNet::new();
    let _listener = net.listener(1);

    let client = net.start_connect();
    let local = net.client.local_addr(&client);
    assert_ne!(local.port, PORT_ANY);
    assert!(local.port > 1023);
}

#[test]
fn verify_send_sync() {
    // the stack is driven from the substrate's delivery context, timer
    // callbacks and user threads all at once
    static_assertions::assert_impl_all!(VsockStack<TestEnv>: Send, Sync);
    static_assertions::assert_impl_all!(Arc<VsockSocket<TestEnv>>: Send, Sync);
}
