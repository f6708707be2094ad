//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU32};
use std::time::Duration;

use chrono::{DateTime, Utc};
use corvus_utils::socket::{TcpConnInfo, TcpStream};
use corvus_utils::task::{IntervalTask, Task, TimeoutTask};
use corvus_utils::{Sender, UnboundedSender};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::NeighborConfig;
use crate::debug::Debug;
use crate::error::Error;
use crate::event::{DownReason, Event};
use crate::instance::{InstanceChannelsTx, InstanceUpView};
use crate::packet::consts::{
    AS_TRANS, AddPathMode, Afi, BGP_VERSION, CapabilityCode, CeaseSubcode,
    ErrorCode, FsmErrorSubcode, GrAfiSafiFlags, GrFlags, Safi,
};
use crate::packet::message::{
    AddPathTuple, Capability, DecodeCxt, EncodeCxt, GrTuple, KeepaliveMsg,
    Message, NegotiatedCapability, NotificationMsg, OpenMsg, RouteRefreshMsg,
    max_msg_len, negotiate_capabilities,
};
use crate::rib::OutgoingRib;
use crate::tasks::messages::input::NbrTimerMsg;
use crate::tasks::messages::output::NbrTxMsg;
use crate::{events, tasks};

// Large hold-time used during session initialization.
const LARGE_HOLDTIME: u16 = 240;

// Upper bound of the exponential connect retry back-off, in seconds.
const CONNECT_RETRY_BACKOFF_CAP: u16 = 512;

// BGP neighbor.
#[derive(Debug)]
pub struct Neighbor {
    pub remote_addr: IpAddr,
    pub config: NeighborConfig,
    pub state: fsm::State,
    pub peer_type: PeerType,
    pub conn_info: Option<TcpConnInfo>,
    pub identifier: Option<Ipv4Addr>,
    pub sent_open: Option<OpenMsg>,
    pub capabilities_rcvd: BTreeSet<Capability>,
    pub negotiated: Option<Negotiated>,
    pub notification_sent: Option<(DateTime<Utc>, NotificationMsg)>,
    pub notification_rcvd: Option<(DateTime<Utc>, NotificationMsg)>,
    pub last_established: Option<DateTime<Utc>>,
    // Families for which the peer signalled End-of-RIB on this session.
    pub eor_rcvd: BTreeSet<(Afi, Safi)>,
    // Consecutive failed connection attempts, drives the retry back-off.
    pub connect_attempts: u32,
    pub statistics: NeighborStatistics,
    pub rib: OutgoingRib,
    pub tasks: NeighborTasks,
    pub msg_txp: Option<UnboundedSender<NbrTxMsg>>,
}

// BGP peer type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PeerType {
    Internal,
    External,
}

// Session-scoped view derived once both OPEN messages were exchanged.
#[derive(Clone, Debug)]
#[derive(Serialize)]
pub struct Negotiated {
    pub local_as: u32,
    pub peer_as: u32,
    pub local_id: Ipv4Addr,
    pub peer_id: Ipv4Addr,
    // Zero disables the hold timer.
    pub holdtime: u16,
    pub keepalive: u16,
    pub families: BTreeSet<(Afi, Safi)>,
    pub asn4: bool,
    pub addpath: BTreeMap<(Afi, Safi), AddPathDirections>,
    pub refresh: RefreshMode,
    pub msg_size: u16,
    pub multisession: bool,
    pub operational: bool,
    // The peer's graceful restart announcement, when both ends advertised
    // the capability.
    pub graceful_restart: Option<GrPeer>,
    pub capabilities: BTreeSet<NegotiatedCapability>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AddPathDirections {
    pub send: bool,
    pub recv: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RefreshMode {
    Absent,
    Normal,
    Enhanced,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct GrPeer {
    pub restart_time: u16,
    pub restarting: bool,
    pub families: Vec<GrTuple>,
}

// Neighbor statistics.
#[derive(Debug, Default)]
pub struct NeighborStatistics {
    pub established_transitions: u32,
    pub msgs_rcvd: MessageStatistics,
    pub msgs_sent: MessageStatistics,
    pub erroneous_updates_withdrawn: u32,
    // Treat-as-withdraw occurrences, per failing attribute type.
    pub treat_as_withdraw: BTreeMap<u8, u32>,
}

// Inbound and outbound message counters.
#[derive(Debug, Default)]
pub struct MessageStatistics {
    pub total: Arc<AtomicU32>,
    pub updates: u32,
    pub notifications: u32,
    pub route_refreshes: u32,
}

// Neighbor tasks.
#[derive(Debug, Default)]
pub struct NeighborTasks {
    pub autostart: Option<TimeoutTask>,
    pub connect: Option<Task<()>>,
    pub connect_retry: Option<TimeoutTask>,
    pub tcp_rx: Option<Task<()>>,
    pub keepalive: Option<IntervalTask>,
    pub holdtime: Option<TimeoutTask>,
    pub graceful_restart: Option<TimeoutTask>,
}

// Type aliases.
pub type Neighbors = BTreeMap<IpAddr, Neighbor>;

// Finite State Machine.
pub mod fsm {
    use corvus_utils::socket::{TcpConnInfo, TcpStream};
    use serde::{Deserialize, Serialize};

    use crate::packet::error::DecodeError;
    use crate::packet::message::{NotificationMsg, OpenMsg};

    // FSM states.
    #[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
    #[derive(Deserialize, Serialize)]
    pub enum State {
        Idle,
        Connect,
        Active,
        OpenSent,
        OpenConfirm,
        Established,
        // Session lost with graceful restart in effect: advertised state
        // is preserved while waiting for the peer to come back.
        GracefulRestarting,
    }

    // FSM events.
    //
    // The original RFC FSM events are listed above each event for clarity.
    #[derive(Debug)]
    pub enum Event {
        // ManualStart
        // ManualStart_with_PassiveTcpEstablishment
        Start,
        // ManualStop
        Stop(Option<NotificationMsg>),
        // Tcp_CR_Acked
        // TcpConnectionConfirmed
        Connected(TcpStream, TcpConnInfo),
        // TcpConnectionFails
        ConnFail,
        // BGPHeaderErr
        // BGPOpenMsgErr
        // UpdateMsgErr
        RcvdError(DecodeError),
        // BGPOpen
        RcvdOpen(OpenMsg),
        // NotifMsg
        RcvdNotif(NotificationMsg),
        // KeepAliveMsg
        RcvdKalive,
        // UpdateMsg
        RcvdUpdate,
        // ConnectRetryTimer_Expires
        // HoldTimer_Expires
        // AutomaticStart
        // AutomaticStart_with_PassiveTcpEstablishment
        Timer(Timer),
    }

    // BGP timers.
    //
    // Note: KEEPALIVE messages are sent independently, separate from the FSM.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    pub enum Timer {
        ConnectRetry,
        Hold,
        AutoStart,
        GracefulRestart,
    }
}

// ===== impl Neighbor =====

impl Neighbor {
    // Creates a new neighbor in the Idle state.
    pub(crate) fn new(config: NeighborConfig, local_as: u32) -> Neighbor {
        let remote_addr = config.remote_addr;
        let peer_type =
            if config.local_as.unwrap_or(local_as) == config.peer_as {
                PeerType::Internal
            } else {
                PeerType::External
            };
        let rib = OutgoingRib::new(config.families.clone());

        Neighbor {
            remote_addr,
            config,
            state: fsm::State::Idle,
            peer_type,
            conn_info: None,
            identifier: None,
            sent_open: None,
            capabilities_rcvd: Default::default(),
            negotiated: None,
            notification_sent: None,
            notification_rcvd: None,
            last_established: None,
            eor_rcvd: Default::default(),
            connect_attempts: 0,
            statistics: Default::default(),
            rib,
            tasks: Default::default(),
            msg_txp: None,
        }
    }

    // Injects an event into the neighbor's FSM.
    pub(crate) fn fsm_event(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        event: fsm::Event,
    ) {
        Debug::NbrFsmEvent(&self.remote_addr, &event).log();

        // The graceful restart timer fires independently of the FSM state:
        // the preserved advertisements are flushed wherever reconnection
        // got to.
        if let fsm::Event::Timer(fsm::Timer::GracefulRestart) = event {
            self.rib.clear();
            if self.state == fsm::State::GracefulRestarting {
                self.session_close(
                    instance,
                    None,
                    DownReason::ConnectionClosed,
                );
                self.fsm_state_change(instance, fsm::State::Idle);
                if self.config.enabled {
                    self.autostart_start(
                        &instance.tx.protocol_input.nbr_timer,
                    );
                }
            } else {
                self.tasks.graceful_restart = None;
            }
            return;
        }

        // Process FSM event.
        let next_state = match self.state {
            // Idle state
            fsm::State::Idle => match event {
                fsm::Event::Start
                | fsm::Event::Timer(fsm::Timer::AutoStart) => {
                    self.connect_retry_start(
                        &instance.tx.protocol_input.nbr_timer,
                    );
                    if self.config.passive {
                        Some(fsm::State::Active)
                    } else {
                        self.connect(instance);
                        Some(fsm::State::Connect)
                    }
                }
                _ => None,
            },
            // Connect state
            fsm::State::Connect => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(msg) => {
                    self.session_close(instance, msg, DownReason::AdminStop);
                    Some(fsm::State::Idle)
                }
                fsm::Event::Connected(stream, conn_info) => {
                    self.connection_setup(stream, conn_info, instance);
                    Some(fsm::State::OpenSent)
                }
                fsm::Event::ConnFail => {
                    // Keep listening for an inbound connection until the
                    // connect retry timer fires again.
                    self.connect_attempts += 1;
                    Some(fsm::State::Active)
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error.clone());
                    self.session_close(
                        instance,
                        Some(msg),
                        DownReason::DecodeError(error),
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::Timer(fsm::Timer::ConnectRetry) => {
                    self.connect(instance);
                    self.connect_retry_start(
                        &instance.tx.protocol_input.nbr_timer,
                    );
                    None
                }
                _ => {
                    // FSM error.
                    self.session_close(
                        instance,
                        None,
                        DownReason::ConnectionFailed,
                    );
                    Some(fsm::State::Idle)
                }
            },
            // Active state
            fsm::State::Active => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(msg) => {
                    self.session_close(instance, msg, DownReason::AdminStop);
                    Some(fsm::State::Idle)
                }
                fsm::Event::Connected(stream, conn_info) => {
                    self.connection_setup(stream, conn_info, instance);
                    Some(fsm::State::OpenSent)
                }
                fsm::Event::ConnFail => {
                    self.connect_attempts += 1;
                    None
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error.clone());
                    self.session_close(
                        instance,
                        Some(msg),
                        DownReason::DecodeError(error),
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::Timer(fsm::Timer::ConnectRetry) => {
                    self.connect(instance);
                    self.connect_retry_start(
                        &instance.tx.protocol_input.nbr_timer,
                    );
                    Some(fsm::State::Connect)
                }
                _ => {
                    // FSM error.
                    self.session_close(
                        instance,
                        None,
                        DownReason::ConnectionFailed,
                    );
                    Some(fsm::State::Idle)
                }
            },
            // OpenSent state
            fsm::State::OpenSent => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(msg) => {
                    self.session_close(instance, msg, DownReason::AdminStop);
                    Some(fsm::State::Idle)
                }
                fsm::Event::ConnFail => {
                    self.session_close(
                        instance,
                        None,
                        DownReason::ConnectionClosed,
                    );
                    self.connect_retry_start(
                        &instance.tx.protocol_input.nbr_timer,
                    );
                    Some(fsm::State::Active)
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error.clone());
                    self.session_close(
                        instance,
                        Some(msg),
                        DownReason::DecodeError(error),
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdOpen(msg) => {
                    let next_state = self.open_process(instance, msg);
                    Some(next_state)
                }
                fsm::Event::RcvdNotif(msg) => {
                    self.session_close(
                        instance,
                        None,
                        DownReason::NotificationReceived(msg),
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::Timer(fsm::Timer::Hold) => {
                    let msg = NotificationMsg::new(
                        ErrorCode::HoldTimerExpired,
                        0u8,
                    );
                    self.session_close(
                        instance,
                        Some(msg.clone()),
                        DownReason::NotificationSent(msg),
                    );
                    Some(fsm::State::Idle)
                }
                _ => {
                    // FSM error.
                    let msg = NotificationMsg::new(
                        ErrorCode::FiniteStateMachineError,
                        FsmErrorSubcode::UnexpectedMessageInOpenSent,
                    );
                    self.session_close(
                        instance,
                        Some(msg.clone()),
                        DownReason::NotificationSent(msg),
                    );
                    Some(fsm::State::Idle)
                }
            },
            // OpenConfirm state
            fsm::State::OpenConfirm => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(msg) => {
                    self.session_close(instance, msg, DownReason::AdminStop);
                    Some(fsm::State::Idle)
                }
                fsm::Event::ConnFail => {
                    self.session_close(
                        instance,
                        None,
                        DownReason::ConnectionClosed,
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error.clone());
                    self.session_close(
                        instance,
                        Some(msg),
                        DownReason::DecodeError(error),
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdOpen(_msg) => {
                    // TODO: collision detection
                    self.session_close(
                        instance,
                        None,
                        DownReason::ConnectionFailed,
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdNotif(msg) => {
                    self.session_close(
                        instance,
                        None,
                        DownReason::NotificationReceived(msg),
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdKalive => {
                    self.holdtime_restart();
                    Some(fsm::State::Established)
                }
                fsm::Event::Timer(fsm::Timer::Hold) => {
                    let msg = NotificationMsg::new(
                        ErrorCode::HoldTimerExpired,
                        0u8,
                    );
                    self.session_close(
                        instance,
                        Some(msg.clone()),
                        DownReason::NotificationSent(msg),
                    );
                    Some(fsm::State::Idle)
                }
                _ => {
                    // FSM error.
                    let msg = NotificationMsg::new(
                        ErrorCode::FiniteStateMachineError,
                        FsmErrorSubcode::UnexpectedMessageInOpenConfirm,
                    );
                    self.session_close(
                        instance,
                        Some(msg.clone()),
                        DownReason::NotificationSent(msg),
                    );
                    Some(fsm::State::Idle)
                }
            },
            // Established state
            fsm::State::Established => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(msg) => {
                    self.session_close(instance, msg, DownReason::AdminStop);
                    Some(fsm::State::Idle)
                }
                fsm::Event::ConnFail => {
                    // RFC 4724: losing the connection without a NOTIFICATION
                    // starts the graceful restart machinery when negotiated.
                    if let Some(restart_time) = self.gr_restart_time() {
                        self.session_preserve(instance, restart_time);
                        Some(fsm::State::GracefulRestarting)
                    } else {
                        self.session_close(
                            instance,
                            None,
                            DownReason::ConnectionClosed,
                        );
                        Some(fsm::State::Idle)
                    }
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error.clone());
                    self.session_close(
                        instance,
                        Some(msg),
                        DownReason::DecodeError(error),
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdNotif(msg) => {
                    self.session_close(
                        instance,
                        None,
                        DownReason::NotificationReceived(msg),
                    );
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdKalive | fsm::Event::RcvdUpdate => {
                    self.holdtime_restart();
                    None
                }
                fsm::Event::Timer(fsm::Timer::Hold) => {
                    let msg = NotificationMsg::new(
                        ErrorCode::HoldTimerExpired,
                        0u8,
                    );
                    self.session_close(
                        instance,
                        Some(msg.clone()),
                        DownReason::NotificationSent(msg),
                    );
                    Some(fsm::State::Idle)
                }
                _ => {
                    // FSM error.
                    let msg = NotificationMsg::new(
                        ErrorCode::FiniteStateMachineError,
                        FsmErrorSubcode::UnexpectedMessageInEstablished,
                    );
                    self.session_close(
                        instance,
                        Some(msg.clone()),
                        DownReason::NotificationSent(msg),
                    );
                    Some(fsm::State::Idle)
                }
            },
            // GracefulRestarting state
            fsm::State::GracefulRestarting => match event {
                fsm::Event::Start
                | fsm::Event::Timer(fsm::Timer::AutoStart) => {
                    self.connect_retry_start(
                        &instance.tx.protocol_input.nbr_timer,
                    );
                    if !self.config.passive {
                        self.connect(instance);
                    }
                    None
                }
                fsm::Event::Stop(msg) => {
                    self.session_close(instance, msg, DownReason::AdminStop);
                    Some(fsm::State::Idle)
                }
                fsm::Event::Connected(stream, conn_info) => {
                    self.connection_setup(stream, conn_info, instance);
                    Some(fsm::State::OpenSent)
                }
                fsm::Event::ConnFail => {
                    self.connect_attempts += 1;
                    None
                }
                fsm::Event::Timer(fsm::Timer::ConnectRetry) => {
                    self.connect(instance);
                    self.connect_retry_start(
                        &instance.tx.protocol_input.nbr_timer,
                    );
                    None
                }
                _ => None,
            },
        };

        // Change to next FSM state when applicable.
        if let Some(next_state) = next_state
            && self.state != next_state
        {
            // Schedule auto-start unless the peer has been manually disabled.
            if matches!(
                next_state,
                fsm::State::Idle | fsm::State::GracefulRestarting
            ) && self.config.enabled
            {
                self.autostart_start(&instance.tx.protocol_input.nbr_timer);
            } else {
                self.autostart_stop();
            }

            self.fsm_state_change(instance, next_state);
        }
    }

    // Updates the neighbor's FSM state.
    fn fsm_state_change(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        mut next_state: fsm::State,
    ) {
        Debug::NbrFsmTransition(&self.remote_addr, &self.state, &next_state)
            .log();

        // Keep track of the time that the BGP session last transitioned in or
        // out of the Established state.
        if self.state == fsm::State::Established
            || next_state == fsm::State::Established
        {
            self.last_established = Some(Utc::now());
        }

        if next_state == fsm::State::Established {
            // Update statistics and reset the connection back-off.
            self.statistics.established_transitions += 1;
            self.connect_attempts = 0;
            self.tasks.graceful_restart = None;
            self.eor_rcvd.clear();

            // Initialize session.
            if !self.session_init(instance) {
                self.session_close(
                    instance,
                    None,
                    DownReason::InternalError(
                        "update generation failed".to_owned(),
                    ),
                );
                self.autostart_start(&instance.tx.protocol_input.nbr_timer);
                next_state = fsm::State::Idle;
            }
        }

        self.state = next_state;
    }

    // Sets up the connection for the BGP neighbor, spawning necessary tasks
    // for TCP communication, and sends the initial OPEN message.
    fn connection_setup(
        &mut self,
        stream: TcpStream,
        conn_info: TcpConnInfo,
        instance: &mut InstanceUpView<'_>,
    ) {
        // Set the ConnectRetryTimer to zero.
        self.connect_retry_stop();

        // Store TCP connection information.
        self.conn_info = Some(conn_info);

        // Split TCP stream into two halves.
        let (read_half, write_half) = stream.into_split();

        // Spawn neighbor TCP Tx task.
        let (msg_txp, msg_txc) = mpsc::unbounded_channel();
        let cxt = EncodeCxt {
            capabilities: Default::default(),
        };
        let mut tx_task = tasks::nbr_tx(self, cxt, write_half, msg_txc);
        self.msg_txp = Some(msg_txp);

        // Spawn neighbor TCP Rx task.
        //
        // The read loop starts with an empty capability set and computes
        // the negotiated one (from what we advertise and what the peer's
        // OPEN carries) as soon as that OPEN arrives.
        let cxt = DecodeCxt {
            peer_type: self.peer_type,
            peer_as: self.config.peer_as,
            capabilities: Default::default(),
        };
        let advertised = self.local_capabilities(instance);
        let tcp_rx_task = tasks::nbr_rx(
            self,
            cxt,
            advertised,
            read_half,
            &instance.tx.protocol_input.nbr_msg_rx,
        );
        self.tasks.tcp_rx = Some(tcp_rx_task);

        // No need to keep track of the Tx task since it gracefully exits as
        // soon as the tx end of its mpsc channel is dropped. This ensures that
        // messages sent during neighbor shutdown will be delivered.
        tx_task.detach();

        // Send the OPEN message and wait for the peer's under a generous
        // hold time.
        self.open_send(instance);
        self.holdtime_start(
            LARGE_HOLDTIME,
            &instance.tx.protocol_input.nbr_timer,
        );
    }

    // Initializes the BGP session once it reaches Established. Returns
    // whether the initial advertisement could be generated.
    fn session_init(&mut self, instance: &mut InstanceUpView<'_>) -> bool {
        let negotiated = self.negotiated.clone().unwrap();

        // Update the Tx task with the negotiated capabilities.
        let msg =
            NbrTxMsg::UpdateCapabilities(negotiated.capabilities.clone());
        if let Some(msg_txp) = &self.msg_txp {
            let _ = msg_txp.send(msg);
        }

        // Replay the advertised state (empty on the first session, the
        // preserved cache after a restart), then the configured routes.
        self.rib.resend(None, false);
        for change in self.config.initial_routes.clone() {
            let change = events::export_change(self, instance, change);
            self.rib.add_change(change);
        }

        // Generate the initial routing update.
        let mut msgs =
            match self.rib.updates(&negotiated, self.config.group_updates) {
                Ok(msgs) => msgs,
                Err(error) => {
                    Error::NbrRibError(self.remote_addr, error).log();
                    let msg = NotificationMsg::new(
                        ErrorCode::Cease,
                        CeaseSubcode::OutOfResources,
                    );
                    self.message_send(
                        Message::Notification(msg),
                        instance.tx,
                    );
                    return false;
                }
            };

        // Signal End-of-RIB for every negotiated family.
        for family in &negotiated.families {
            msgs.push(OutgoingRib::eor(*family));
        }

        instance.tx.events.send(Event::SessionUp {
            peer: self.remote_addr,
            negotiated: Box::new(negotiated),
        });

        self.message_list_send(msgs, instance.tx);
        true
    }

    // Closes the BGP session, performing necessary cleanup and releasing
    // resources.
    pub(crate) fn session_close(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        send_notif: Option<NotificationMsg>,
        reason: DownReason,
    ) {
        // Send a notification message.
        if self.state >= fsm::State::OpenSent
            && self.msg_txp.is_some()
            && let Some(msg) = send_notif
        {
            self.message_send(Message::Notification(msg), instance.tx);
        }

        // Set the ConnectRetryTimer to zero.
        self.connect_retry_stop();

        // Notify the session loss.
        if self.state == fsm::State::Established {
            instance.tx.events.send(Event::SessionDown {
                peer: self.remote_addr,
                reason,
            });
        }

        // Release all resources. The advertised-state cache survives so a
        // reconnect replays it.
        self.conn_info = None;
        self.identifier = None;
        self.sent_open = None;
        self.capabilities_rcvd.clear();
        self.negotiated = None;
        self.eor_rcvd.clear();
        self.rib.reset();
        self.tasks = Default::default();
        self.msg_txp = None;
    }

    // Closes the lost session while preserving the advertised state and
    // arming the restart timer (RFC 4724).
    fn session_preserve(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        restart_time: u16,
    ) {
        instance.tx.events.send(Event::SessionDown {
            peer: self.remote_addr,
            reason: DownReason::ConnectionClosed,
        });

        self.conn_info = None;
        self.identifier = None;
        self.sent_open = None;
        self.capabilities_rcvd.clear();
        self.negotiated = None;
        self.rib.reset();
        self.tasks = Default::default();
        self.msg_txp = None;

        Debug::NbrGrTimerStart(&self.remote_addr, restart_time).log();
        let task = tasks::nbr_timer(
            self,
            fsm::Timer::GracefulRestart,
            Duration::from_secs(restart_time.into()),
            &instance.tx.protocol_input.nbr_timer,
        );
        self.tasks.graceful_restart = Some(task);
    }

    // Closes the session after a fatal internal error, rather than letting
    // a corrupt message reach the wire.
    pub(crate) fn internal_close(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        error: crate::rib::RibError,
    ) {
        Error::NbrRibError(self.remote_addr, error.clone()).log();
        let msg = NotificationMsg::new(
            ErrorCode::Cease,
            CeaseSubcode::OutOfResources,
        );
        self.session_close(
            instance,
            Some(msg),
            DownReason::InternalError(error.to_string()),
        );
        if self.config.enabled {
            self.autostart_start(&instance.tx.protocol_input.nbr_timer);
        }
        self.fsm_state_change(instance, fsm::State::Idle);
    }

    // Returns the peer's restart time when graceful restart was negotiated.
    fn gr_restart_time(&self) -> Option<u16> {
        let negotiated = self.negotiated.as_ref()?;
        let gr = negotiated.graceful_restart.as_ref()?;
        (gr.restart_time != 0).then_some(gr.restart_time)
    }

    // Enqueues a single BGP message for transmission.
    pub(crate) fn message_send(
        &mut self,
        msg: Message,
        tx: &InstanceChannelsTx,
    ) {
        Debug::NbrMsgTx(&self.remote_addr, &msg).log();

        // Update statistics.
        self.statistics.msgs_sent.update(&msg);

        // Keep track of the last sent notification.
        if let Message::Notification(notif) = &msg {
            self.notification_sent = Some((Utc::now(), notif.clone()));
            tx.events.send(Event::Notification {
                peer: self.remote_addr,
                direction: crate::event::Direction::Sent,
                msg: notif.clone(),
            });
        }

        tx.events.send(Event::Sent {
            peer: self.remote_addr,
            msg: Box::new(msg.clone()),
            raw: None,
        });

        // Ignore any possible error as the connection might have gone down
        // already.
        let nbr_addr = self.remote_addr;
        let msg = NbrTxMsg::SendMessage { nbr_addr, msg };
        if let Some(msg_txp) = &self.msg_txp {
            let _ = msg_txp.send(msg);
        }
    }

    // Enqueues a list of BGP messages for transmission.
    //
    // This method is more efficient for handling a large number of messages,
    // as they are sent all at once.
    pub(crate) fn message_list_send(
        &mut self,
        msg_list: Vec<Message>,
        tx: &InstanceChannelsTx,
    ) {
        for msg in &msg_list {
            Debug::NbrMsgTx(&self.remote_addr, msg).log();

            // Update statistics.
            self.statistics.msgs_sent.update(msg);

            tx.events.send(Event::Sent {
                peer: self.remote_addr,
                msg: Box::new(msg.clone()),
                raw: None,
            });
        }

        // Ignore any possible error as the connection might have gone down
        // already.
        let nbr_addr = self.remote_addr;
        let msg = NbrTxMsg::SendMessageList { nbr_addr, msg_list };
        if let Some(msg_txp) = &self.msg_txp {
            let _ = msg_txp.send(msg);
        }
    }

    // Effective local AS number of this session.
    pub(crate) fn local_as(&self, instance: &InstanceUpView<'_>) -> u32 {
        self.config.local_as.unwrap_or(instance.config.asn)
    }

    // Builds the capability set advertised to this neighbor.
    fn local_capabilities(
        &self,
        instance: &InstanceUpView<'_>,
    ) -> BTreeSet<Capability> {
        let local_as = self.local_as(instance);

        let mut capabilities = BTreeSet::new();

        // Multiprotocol capabilities.
        for (afi, safi) in &self.config.families {
            capabilities.insert(Capability::MultiProtocol {
                afi: *afi,
                safi: *safi,
            });
        }

        if self.config.capabilities.asn4 {
            capabilities
                .insert(Capability::FourOctetAsNumber { asn: local_as });
        }
        if self.config.capabilities.route_refresh {
            capabilities.insert(Capability::RouteRefresh);
        }
        if self.config.capabilities.enhanced_route_refresh {
            capabilities.insert(Capability::EnhancedRouteRefresh);
        }
        if self.config.capabilities.extended_message {
            capabilities.insert(Capability::ExtendedMessage);
        }
        if self.config.capabilities.multisession {
            // The session identifier is the multiprotocol capability.
            capabilities.insert(Capability::Multisession(vec![
                CapabilityCode::MultiProtocol as u8,
            ]));
        }
        if self.config.capabilities.operational {
            capabilities.insert(Capability::Operational);
        }

        // ADD-PATH tuples, advertised from our perspective.
        let addpath_tuples = self
            .config
            .addpath
            .iter()
            .filter_map(|((afi, safi), cfg)| {
                let mode = match (cfg.send, cfg.recv) {
                    (true, true) => AddPathMode::ReceiveSend,
                    (true, false) => AddPathMode::Send,
                    (false, true) => AddPathMode::Receive,
                    (false, false) => return None,
                };
                Some(AddPathTuple {
                    afi: *afi,
                    safi: *safi,
                    mode,
                })
            })
            .collect::<BTreeSet<_>>();
        if !addpath_tuples.is_empty() {
            capabilities.insert(Capability::AddPath(addpath_tuples));
        }

        // Graceful restart.
        if let Some(gr) = &self.config.graceful_restart {
            let mut flags = GrFlags::empty();
            if gr.restart_state {
                flags.insert(GrFlags::RESTART);
            }
            let families = self
                .config
                .families
                .iter()
                .map(|(afi, safi)| GrTuple {
                    afi: *afi,
                    safi: *safi,
                    flags: GrAfiSafiFlags::FORWARDING,
                })
                .collect();
            capabilities.insert(Capability::GracefulRestart {
                flags,
                restart_time: gr.restart_time & 0x0fff,
                families,
            });
        }

        // Host and software identification.
        if let Some(hostname) = &instance.config.hostname {
            capabilities.insert(Capability::Hostname {
                hostname: hostname.clone(),
                domain: instance.config.domain.clone(),
            });
        }
        if let Some(version) = &instance.config.software_version {
            capabilities.insert(Capability::SoftwareVersion(version.clone()));
        }

        capabilities
    }

    // Sends a BGP OPEN message based on the local configuration.
    fn open_send(&mut self, instance: &mut InstanceUpView<'_>) {
        let local_as = self.local_as(instance);
        let capabilities = self.local_capabilities(instance);

        // When the ASN doesn't fit two octets, AS_TRANS goes on the wire
        // and the real value travels in the capability (RFC 6793).
        let msg = OpenMsg {
            version: BGP_VERSION,
            my_as: local_as.try_into().unwrap_or(AS_TRANS),
            holdtime: self.config.timers.holdtime,
            identifier: instance.config.identifier,
            capabilities,
        };
        self.sent_open = Some(msg.clone());
        self.message_send(Message::Open(msg), instance.tx);
    }

    // Processes the received OPEN message while in the OpenSent state.
    fn open_process(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        msg: OpenMsg,
    ) -> fsm::State {
        use crate::packet::consts::OpenMessageErrorSubcode as ErrorSubcode;

        // Validate the received message.
        if let Err(error) = self.open_validate(instance, &msg) {
            error.log();

            // Close the session.
            let notif = match &error {
                Error::NbrBadAs(..) => Some(NotificationMsg::new(
                    ErrorCode::OpenMessageError,
                    ErrorSubcode::BadPeerAs,
                )),
                Error::NbrBadIdentifier(..) => Some(NotificationMsg::new(
                    ErrorCode::OpenMessageError,
                    ErrorSubcode::BadBgpIdentifier,
                )),
                _ => None,
            };
            let reason = match &notif {
                Some(notif) => DownReason::NotificationSent(notif.clone()),
                None => DownReason::ConnectionFailed,
            };
            self.session_close(instance, notif, reason);

            // Transition to the Idle state.
            return fsm::State::Idle;
        }

        // Compute the session-scoped negotiated view.
        let sent_open = self.sent_open.clone().unwrap();
        let negotiated = match Negotiated::negotiate(
            &sent_open,
            &msg,
            self.config.capabilities.multisession,
        ) {
            Ok(negotiated) => negotiated,
            Err(notif) => {
                Error::NbrNoCommonFamilies(self.remote_addr).log();
                self.session_close(
                    instance,
                    Some(notif.clone()),
                    DownReason::NotificationSent(notif),
                );
                return fsm::State::Idle;
            }
        };

        // Set the ConnectRetryTimer to zero.
        self.connect_retry_stop();

        // Send Keepalive message.
        self.message_send(Message::Keepalive(KeepaliveMsg {}), instance.tx);

        // Start Keepalive interval and session hold timer.
        if negotiated.holdtime != 0 {
            self.keepalive_interval_start(
                negotiated.holdtime,
                &instance.tx.events,
            );
            self.holdtime_start(
                negotiated.holdtime,
                &instance.tx.protocol_input.nbr_timer,
            );
        } else {
            self.holdtime_stop();
        }

        // Keep track of the received data.
        self.identifier = Some(msg.identifier);
        self.capabilities_rcvd = msg.capabilities;
        self.negotiated = Some(negotiated);

        // TODO: collision detection

        // Transition to the OpenConfirm state.
        fsm::State::OpenConfirm
    }

    // Performs semantic validation of the received BGP OPEN message.
    // Syntactic errors are detected during the decoding phase.
    fn open_validate(
        &self,
        instance: &InstanceUpView<'_>,
        msg: &OpenMsg,
    ) -> Result<(), Error> {
        // Validate ASN.
        if self.config.peer_as != msg.real_as() {
            return Err(Error::NbrBadAs(
                self.remote_addr,
                msg.real_as(),
                self.config.peer_as,
            ));
        }

        // Validate BGP identifier for internal peers.
        if self.peer_type == PeerType::Internal
            && msg.identifier == instance.config.identifier
        {
            return Err(Error::NbrBadIdentifier(
                self.remote_addr,
                msg.identifier,
            ));
        }

        Ok(())
    }

    // Returns the neighbor's Tx-TTL value based on the peer type and
    // configuration.
    pub(crate) fn tx_ttl(&self) -> u8 {
        use corvus_utils::socket::TTL_MAX;

        match self.peer_type {
            PeerType::Internal => TTL_MAX,
            PeerType::External => {
                if self.config.transport.ttl_security.is_some() {
                    TTL_MAX
                } else if let Some(ttl) =
                    self.config.transport.ebgp_multihop_ttl
                {
                    ttl
                } else {
                    1
                }
            }
        }
    }

    // Starts the auto-start timer.
    fn autostart_start(&mut self, nbr_timerp: &Sender<NbrTimerMsg>) {
        let idle_hold_time = Duration::from_secs(1);
        let task = tasks::nbr_timer(
            self,
            fsm::Timer::AutoStart,
            idle_hold_time,
            nbr_timerp,
        );
        self.tasks.autostart = Some(task);
    }

    // Stops the auto-start timer.
    fn autostart_stop(&mut self) {
        self.tasks.autostart = None;
    }

    // Starts a TCP connection task to the neighbor's remote address.
    fn connect(&mut self, instance: &InstanceUpView<'_>) {
        let task = tasks::tcp_connect(
            self,
            instance.config.port,
            &instance.tx.protocol_input.tcp_connect,
        );
        self.tasks.connect = Some(task);
    }

    // Starts the Keepalive Tx interval.
    fn keepalive_interval_start(
        &mut self,
        holdtime_nego: u16,
        events: &crate::event::EventSender,
    ) {
        let interval =
            self.config.timers.keepalive.unwrap_or(holdtime_nego / 3).max(1);
        let task = tasks::nbr_kalive_interval(self, interval, events);
        self.tasks.keepalive = Some(task);
    }

    // Starts the session hold timer.
    fn holdtime_start(
        &mut self,
        seconds: u16,
        nbr_timerp: &Sender<NbrTimerMsg>,
    ) {
        let task = tasks::nbr_timer(
            self,
            fsm::Timer::Hold,
            Duration::from_secs(seconds.into()),
            nbr_timerp,
        );
        self.tasks.holdtime = Some(task);
    }

    // Restarts the session hold timer if the negotiated HoldTime value is
    // non-zero.
    pub(crate) fn holdtime_restart(&mut self) {
        if let Some(holdtime) = self.tasks.holdtime.as_mut() {
            holdtime.reset(None);
        }
    }

    // Stops the session hold timer.
    fn holdtime_stop(&mut self) {
        self.tasks.holdtime = None;
    }

    // Starts the connect retry timer.
    //
    // Consecutive connection failures back the interval off exponentially
    // (1, 2, 4, ... seconds) to avoid tight reconnect loops, bounded by the
    // configured retry interval, with jitter applied per RFC 4271
    // section 10.
    fn connect_retry_start(&mut self, nbr_timerp: &Sender<NbrTimerMsg>) {
        let interval = self.connect_retry_interval();
        let task = tasks::nbr_timer(
            self,
            fsm::Timer::ConnectRetry,
            interval,
            nbr_timerp,
        );
        self.tasks.connect_retry = Some(task);
    }

    fn connect_retry_interval(&self) -> Duration {
        let cap = self
            .config
            .timers
            .connect_retry
            .clamp(1, CONNECT_RETRY_BACKOFF_CAP);
        let backoff = 1u16 << self.connect_attempts.min(9) as u16;
        let seconds = backoff.min(cap);

        // Jitter: 75% to 100% of the computed interval.
        let millis = u64::from(seconds) * 1000;
        let millis = rand::rng().random_range(millis * 3 / 4..=millis);
        Duration::from_millis(millis)
    }

    // Stops the connect retry timer.
    fn connect_retry_stop(&mut self) {
        self.tasks.connect_retry = None;
    }

    // Clears the neighbor session.
    pub(crate) fn clear_session(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        clear_type: ClearType,
    ) {
        match clear_type {
            ClearType::Admin => {
                // Close the session with the "Administrative Reset" subcode.
                let msg = NotificationMsg::new(
                    ErrorCode::Cease,
                    CeaseSubcode::AdministrativeReset,
                );
                self.fsm_event(instance, fsm::Event::Stop(Some(msg)));
            }
            ClearType::Hard => {
                // Close the session with the "Hard Reset" subcode.
                let msg = NotificationMsg::new(
                    ErrorCode::Cease,
                    CeaseSubcode::HardReset,
                );
                self.fsm_event(instance, fsm::Event::Stop(Some(msg)));
            }
            ClearType::Soft => {
                // Re-send the full Adj-RIB-Out to this neighbor.
                if self.state == fsm::State::Established {
                    self.rib.resend(None, false);
                    events::flush_updates(self, instance);
                }
            }
            ClearType::SoftInbound => {
                // Request the peer's Adj-RIB-Out to be re-sent.
                let Some(negotiated) = &self.negotiated else {
                    return;
                };
                if negotiated.refresh == RefreshMode::Absent {
                    return;
                }
                for (afi, safi) in negotiated.families.clone() {
                    let msg = RouteRefreshMsg::new(
                        afi,
                        safi,
                        crate::packet::consts::RouteRefreshSubtype::Normal,
                    );
                    self.message_send(
                        Message::RouteRefresh(msg),
                        instance.tx,
                    );
                }
            }
        }
    }

    // Check if the given address-family is enabled for this session.
    pub(crate) fn is_af_enabled(&self, afi: Afi, safi: Safi) -> bool {
        if let Some(negotiated) = &self.negotiated {
            return negotiated.families.contains(&(afi, safi));
        }
        false
    }
}

// Administrative session clear variants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ClearType {
    Admin,
    Hard,
    Soft,
    SoftInbound,
}

// ===== impl Negotiated =====

impl Negotiated {
    // Combines the two OPEN messages into the session-scoped view.
    pub fn negotiate(
        sent: &OpenMsg,
        received: &OpenMsg,
        multisession_cfg: bool,
    ) -> Result<Negotiated, NotificationMsg> {
        use crate::packet::consts::OpenMessageErrorSubcode;

        let capabilities =
            negotiate_capabilities(&sent.capabilities, &received.capabilities);

        // Negotiated families are the intersection of both multiprotocol
        // announcements. Peers that don't speak capabilities at all get the
        // implicit IPv4 unicast session.
        let sent_mp = sent.mp_families();
        let received_mp = received.mp_families();
        let families = if sent_mp.is_empty() && received_mp.is_empty() {
            [(Afi::Ipv4, Safi::Unicast)].into()
        } else {
            sent_mp
                .intersection(&received_mp)
                .copied()
                .collect::<BTreeSet<_>>()
        };

        let multisession = multisession_cfg
            && sent.has_capability(CapabilityCode::Multisession)
            && received.has_capability(CapabilityCode::Multisession);

        if families.is_empty() && !multisession {
            return Err(NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::UnsupportedCapability,
            ));
        }

        // ADD-PATH directions per family.
        let addpath = capabilities
            .iter()
            .filter_map(|cap| {
                if let NegotiatedCapability::AddPath {
                    afi,
                    safi,
                    send,
                    recv,
                } = cap
                {
                    Some((
                        (*afi, *safi),
                        AddPathDirections {
                            send: *send,
                            recv: *recv,
                        },
                    ))
                } else {
                    None
                }
            })
            .collect();

        // Route refresh support ladder.
        let refresh = if capabilities
            .contains(&NegotiatedCapability::EnhancedRouteRefresh)
        {
            RefreshMode::Enhanced
        } else if capabilities.contains(&NegotiatedCapability::RouteRefresh) {
            RefreshMode::Normal
        } else {
            RefreshMode::Absent
        };

        // The negotiated hold time is the smaller of the two offers; the
        // keepalive interval derives from it.
        let holdtime = std::cmp::min(sent.holdtime, received.holdtime);
        let keepalive = holdtime / 3;

        let msg_size = max_msg_len(&capabilities);
        let asn4 =
            capabilities.contains(&NegotiatedCapability::FourOctetAsNumber);
        let operational =
            capabilities.contains(&NegotiatedCapability::Operational);

        // The peer's graceful restart announcement matters only when the
        // capability was negotiated both ways.
        let mut graceful_restart = None;
        if capabilities.contains(&NegotiatedCapability::GracefulRestart)
            && let Some(Capability::GracefulRestart {
                flags,
                restart_time,
                families,
            }) = received.capabilities.iter().find(|cap| {
                cap.code() == Some(CapabilityCode::GracefulRestart)
            })
        {
            graceful_restart = Some(GrPeer {
                restart_time: *restart_time,
                restarting: flags.contains(GrFlags::RESTART),
                families: families.clone(),
            });
        }

        Ok(Negotiated {
            local_as: sent.real_as(),
            peer_as: received.real_as(),
            local_id: sent.identifier,
            peer_id: received.identifier,
            holdtime,
            keepalive,
            families,
            asn4,
            addpath,
            refresh,
            msg_size,
            multisession,
            operational,
            graceful_restart,
            capabilities,
        })
    }

    pub fn addpath_send(&self, afi: Afi, safi: Safi) -> bool {
        self.addpath
            .get(&(afi, safi))
            .is_some_and(|directions| directions.send)
    }

    pub fn addpath_recv(&self, afi: Afi, safi: Safi) -> bool {
        self.addpath
            .get(&(afi, safi))
            .is_some_and(|directions| directions.recv)
    }
}

// ===== impl MessageStatistics =====

impl MessageStatistics {
    pub(crate) fn update(&mut self, msg: &Message) {
        self.total.fetch_add(1, atomic::Ordering::Relaxed);
        match msg {
            Message::Update(_) => {
                self.updates += 1;
            }
            Message::Notification(_) => {
                self.notifications += 1;
            }
            Message::RouteRefresh(_) => {
                self.route_refreshes += 1;
            }
            _ => {}
        }
    }
}
