//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use corvus_utils::ip::{AddressFamily, IpAddrExt};
use corvus_utils::socket::TcpListener;
use corvus_utils::task::Task;
use corvus_utils::{
    Receiver, Sender, UnboundedReceiver, UnboundedSender,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{LocalConfig, NeighborConfig};
use crate::debug::Debug;
use crate::error::IoError;
use crate::event::{Event, EventSender};
use crate::neighbor::{ClearType, Neighbor, Neighbors, fsm};
use crate::packet::consts::{CeaseSubcode, ErrorCode};
use crate::packet::message::NotificationMsg;
use crate::rib::{Change, Family};
use crate::tasks::messages::input::{
    NbrRxMsg, NbrTimerMsg, TcpAcceptMsg, TcpConnectMsg,
};
use crate::{events, network, tasks};

//
// BGP session driver.
//
// One driver owns every configured neighbor and runs them from a single
// task: socket readiness, timer expiries and producer commands are
// multiplexed through the input channels, so per-neighbor state is never
// touched concurrently.
//
#[derive(Debug)]
pub struct Instance {
    // Speaker configuration data.
    pub config: LocalConfig,
    // Configured neighbors.
    pub neighbors: Neighbors,
    // Runtime state.
    pub state: InstanceState,
    // Instance Tx channels.
    pub tx: InstanceChannelsTx,
}

#[derive(Debug, Default)]
pub struct InstanceState {
    // TCP listening sockets.
    pub listening_sockets: Vec<TcpListenerTask>,
}

#[derive(Debug)]
pub struct TcpListenerTask {
    pub af: AddressFamily,
    pub socket: Arc<TcpListener>,
    _task: Task<()>,
}

#[derive(Clone, Debug)]
pub struct InstanceChannelsTx {
    pub protocol_input: ProtocolInputChannelsTx,
    pub events: EventSender,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    // TCP accept event.
    pub tcp_accept: Sender<TcpAcceptMsg>,
    // TCP connect event.
    pub tcp_connect: Sender<TcpConnectMsg>,
    // TCP neighbor message.
    pub nbr_msg_rx: Sender<NbrRxMsg>,
    // Neighbor timeout event.
    pub nbr_timer: Sender<NbrTimerMsg>,
    // Producer mailbox.
    pub api: UnboundedSender<ApiMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    // TCP accept event.
    pub tcp_accept: Receiver<TcpAcceptMsg>,
    // TCP connect event.
    pub tcp_connect: Receiver<TcpConnectMsg>,
    // TCP neighbor message.
    pub nbr_msg_rx: Receiver<NbrRxMsg>,
    // Neighbor timeout event.
    pub nbr_timer: Receiver<NbrTimerMsg>,
    // Producer mailbox.
    pub api: UnboundedReceiver<ApiMsg>,
}

// Commands posted by route producers and the management plane.
//
// A `nbr_addr` of `None` addresses every configured neighbor.
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub enum ApiMsg {
    // Enqueue announcements or withdrawals.
    Routes {
        nbr_addr: Option<IpAddr>,
        changes: Vec<Change>,
    },
    // Apply a configuration reload as an announce/withdraw delta.
    Replace {
        nbr_addr: Option<IpAddr>,
        previous: Vec<Change>,
        changes: Vec<Change>,
    },
    // Withdraw everything advertised for the given families (all
    // negotiated families by default).
    WithdrawAll {
        nbr_addr: Option<IpAddr>,
        families: Option<BTreeSet<Family>>,
    },
    // Administrative session clear.
    Clear {
        nbr_addr: Option<IpAddr>,
        clear_type: ClearType,
    },
    // Stop the session, optionally with an RFC 9003 Shutdown
    // Communication.
    Stop {
        nbr_addr: Option<IpAddr>,
        communication: Option<String>,
    },
}

// Borrowed view used by the event processing code.
pub struct InstanceUpView<'a> {
    pub config: &'a LocalConfig,
    pub tx: &'a InstanceChannelsTx,
}

// ===== impl Instance =====

impl Instance {
    // Creates a new session driver. Events flow out through the provided
    // channel; commands flow in through `ProtocolInputChannelsTx::api`.
    pub fn new(
        config: LocalConfig,
        event_txp: UnboundedSender<Event>,
    ) -> (Instance, ProtocolInputChannelsRx) {
        let (tcp_acceptp, tcp_acceptc) = mpsc::channel(4);
        let (tcp_connectp, tcp_connectc) = mpsc::channel(4);
        let (nbr_msg_rxp, nbr_msg_rxc) = mpsc::channel(4);
        let (nbr_timerp, nbr_timerc) = mpsc::channel(4);
        let (api_txp, api_txc) = mpsc::unbounded_channel();

        let tx = InstanceChannelsTx {
            protocol_input: ProtocolInputChannelsTx {
                tcp_accept: tcp_acceptp,
                tcp_connect: tcp_connectp,
                nbr_msg_rx: nbr_msg_rxp,
                nbr_timer: nbr_timerp,
                api: api_txp,
            },
            events: EventSender::new(event_txp, config.raw_message_events),
        };
        let rx = ProtocolInputChannelsRx {
            tcp_accept: tcp_acceptc,
            tcp_connect: tcp_connectc,
            nbr_msg_rx: nbr_msg_rxc,
            nbr_timer: nbr_timerc,
            api: api_txc,
        };

        let instance = Instance {
            config,
            neighbors: Default::default(),
            state: Default::default(),
            tx,
        };

        (instance, rx)
    }

    // Registers a neighbor. The configuration comes pre-validated from the
    // external configuration layer.
    pub fn add_neighbor(&mut self, config: NeighborConfig) {
        Debug::NbrCreate(&config.remote_addr).log();

        let nbr = Neighbor::new(config, self.config.asn);

        // Provision the authentication keys on the listening sockets so
        // inbound connections from this neighbor are accepted.
        if let Some(auth) = &nbr.config.auth {
            for listener in &self.state.listening_sockets {
                network::listen_socket_auth_update(
                    &listener.socket,
                    &nbr.remote_addr,
                    auth,
                );
            }
        }

        self.neighbors.insert(nbr.remote_addr, nbr);
    }

    // Handle to the producer mailbox.
    pub fn api_channel(&self) -> UnboundedSender<ApiMsg> {
        self.tx.protocol_input.api.clone()
    }

    // Runs the session driver until the producer mailbox closes.
    pub async fn run(mut self, mut rx: ProtocolInputChannelsRx) {
        Debug::InstanceStart.log();

        // Start the listening sockets.
        if self.config.listen {
            for af in [AddressFamily::Ipv4, AddressFamily::Ipv6] {
                match network::listen_socket(af, self.config.port) {
                    Ok(socket) => {
                        let addr = IpAddr::unspecified(af);
                        Debug::ListenerStart(&addr).log();
                        let socket = Arc::new(socket);
                        let task = tasks::tcp_listener(
                            &socket,
                            &self.tx.protocol_input.tcp_accept,
                        );

                        // Provision the per-neighbor authentication keys.
                        for nbr in self.neighbors.values() {
                            if let Some(auth) = &nbr.config.auth {
                                network::listen_socket_auth_update(
                                    &socket,
                                    &nbr.remote_addr,
                                    auth,
                                );
                            }
                        }

                        self.state.listening_sockets.push(TcpListenerTask {
                            af,
                            socket,
                            _task: task,
                        });
                    }
                    Err(error) => {
                        IoError::TcpSocketError(error).log();
                    }
                }
            }
        }

        let Instance {
            config,
            neighbors,
            tx,
            ..
        } = &mut self;
        let mut instance = InstanceUpView {
            config: &*config,
            tx: &*tx,
        };

        // Start the configured sessions.
        for nbr in neighbors.values_mut() {
            if nbr.config.enabled {
                nbr.fsm_event(&mut instance, fsm::Event::Start);
            }
        }

        // Multiplex the input channels.
        loop {
            tokio::select! {
                msg = rx.tcp_accept.recv() => {
                    let Some(mut msg) = msg else { break };
                    let stream = msg.stream();
                    if let Err(error) = events::process_tcp_accept(
                        &mut instance,
                        neighbors,
                        stream,
                        msg.conn_info,
                    ) {
                        error.log();
                    }
                }
                msg = rx.tcp_connect.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(error) = events::process_tcp_connect(
                        &mut instance,
                        neighbors,
                        msg.nbr_addr,
                        msg.stream,
                        msg.conn_info,
                    ) {
                        error.log();
                    }
                }
                msg = rx.nbr_msg_rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(error) = events::process_nbr_msg(
                        &mut instance,
                        neighbors,
                        msg.nbr_addr,
                        msg.msg,
                        msg.raw,
                    ) {
                        error.log();
                    }
                }
                msg = rx.nbr_timer.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(error) = events::process_nbr_timer(
                        &mut instance,
                        neighbors,
                        msg.nbr_addr,
                        msg.timer,
                    ) {
                        error.log();
                    }
                }
                msg = rx.api.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Err(error) = events::process_api_msg(
                                &mut instance,
                                neighbors,
                                msg,
                            ) {
                                error.log();
                            }
                        }
                        // The producer went away: shut everything down.
                        None => break,
                    }
                }
            }
        }

        // Stop the remaining sessions.
        Debug::InstanceStop.log();
        for nbr in neighbors.values_mut() {
            let msg = NotificationMsg::new(
                ErrorCode::Cease,
                CeaseSubcode::AdministrativeShutdown,
            );
            nbr.fsm_event(&mut instance, fsm::Event::Stop(Some(msg)));
        }
    }
}

