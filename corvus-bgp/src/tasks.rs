//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::sync::{Arc, atomic};
use std::time::Duration;

use corvus_utils::socket::{OwnedReadHalf, OwnedWriteHalf, TcpListener};
use corvus_utils::task::{IntervalTask, Task, TimeoutTask};
use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tracing::{Instrument, debug_span, error};

use crate::debug::Debug;
use crate::error::NbrRxError;
use crate::event::EventSender;
use crate::neighbor::{Neighbor, fsm};
use crate::network;
use crate::packet::message::{
    Capability, DecodeCxt, EncodeCxt, KeepaliveMsg, Message,
};

//
// BGP tasks diagram:
//
//                                     +--------------+
//                tcp_listener (1x) -> |              |
//                 tcp_connect (Nx) -> |              | -> (Nx) nbr_tx
//                      nbr_rx (Nx) -> |   session    | -> (Nx) nbr_kalive_interval
//                   nbr_timer (Nx) -> |    driver    |
//                         api (1x) -> |              |
//                                     +--------------+
//                                           |
//                                           V
//                                     event channel
//

// BGP inter-task message types.
pub mod messages {
    use std::net::IpAddr;

    use bytes::Bytes;
    use corvus_utils::socket::{TcpConnInfo, TcpStream};
    use serde::{Deserialize, Serialize};

    use crate::error::NbrRxError;
    use crate::neighbor::fsm;
    use crate::packet::message::Message;

    // Input messages (child task -> session driver).
    pub mod input {
        use super::*;

        #[derive(Debug, Deserialize, Serialize)]
        pub struct TcpAcceptMsg {
            #[serde(skip)]
            pub stream: Option<TcpStream>,
            pub conn_info: TcpConnInfo,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct TcpConnectMsg {
            pub nbr_addr: IpAddr,
            // `None` means the connection attempt failed.
            #[serde(skip)]
            pub stream: Option<TcpStream>,
            pub conn_info: Option<TcpConnInfo>,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NbrRxMsg {
            pub nbr_addr: IpAddr,
            pub msg: Result<Message, NbrRxError>,
            // Original wire bytes of the message, for packets-level
            // event detail.
            pub raw: Option<Bytes>,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NbrTimerMsg {
            pub nbr_addr: IpAddr,
            pub timer: fsm::Timer,
        }

        impl TcpAcceptMsg {
            pub(crate) fn stream(&mut self) -> TcpStream {
                self.stream.take().unwrap()
            }
        }
    }

    // Output messages (session driver -> child task).
    pub mod output {
        use std::collections::BTreeSet;

        use crate::packet::message::NegotiatedCapability;

        use super::*;

        #[derive(Debug, Serialize)]
        pub enum NbrTxMsg {
            SendMessage {
                nbr_addr: IpAddr,
                msg: Message,
            },
            SendMessageList {
                nbr_addr: IpAddr,
                msg_list: Vec<Message>,
            },
            UpdateCapabilities(BTreeSet<NegotiatedCapability>),
        }
    }
}

// ===== BGP tasks =====

// TCP listening task.
pub(crate) fn tcp_listener(
    session_socket: &Arc<TcpListener>,
    tcp_acceptp: &Sender<messages::input::TcpAcceptMsg>,
) -> Task<()> {
    let span1 = debug_span!("session");
    let _span1_guard = span1.enter();
    let span2 = debug_span!("input");
    let _span2_guard = span2.enter();

    let session_socket = session_socket.clone();
    let tcp_acceptp = tcp_acceptp.clone();
    Task::spawn(
        async move {
            let _ = network::listen_loop(session_socket, tcp_acceptp).await;
        }
        .in_current_span(),
    )
}

// TCP connect task.
//
// A single connection attempt is made; the FSM owns the retry policy.
pub(crate) fn tcp_connect(
    nbr: &Neighbor,
    port: u16,
    tcp_connectp: &Sender<messages::input::TcpConnectMsg>,
) -> Task<()> {
    let span = debug_span!("neighbor", addr = %nbr.remote_addr);
    let _span_guard = span.enter();

    let remote_addr = nbr.remote_addr;
    let local_addr = nbr.config.transport.local_addr;
    let ttl = nbr.tx_ttl();
    let ttl_security = nbr.config.transport.ttl_security;
    let tcp_mss = nbr.config.transport.tcp_mss;
    let auth = nbr.config.auth.clone();
    let tcp_connectp = tcp_connectp.clone();
    Task::spawn(
        async move {
            let msg = match network::connect(
                remote_addr,
                port,
                local_addr,
                ttl,
                ttl_security,
                tcp_mss,
                &auth,
            )
            .await
            {
                Ok((stream, conn_info)) => messages::input::TcpConnectMsg {
                    nbr_addr: remote_addr,
                    stream: Some(stream),
                    conn_info: Some(conn_info),
                },
                Err(error) => {
                    error.log();
                    messages::input::TcpConnectMsg {
                        nbr_addr: remote_addr,
                        stream: None,
                        conn_info: None,
                    }
                }
            };
            let _ = tcp_connectp.send(msg).await;
        }
        .in_current_span(),
    )
}

// Neighbor TCP Rx task.
pub(crate) fn nbr_rx(
    nbr: &Neighbor,
    cxt: DecodeCxt,
    advertised: BTreeSet<Capability>,
    read_half: OwnedReadHalf,
    nbr_msg_rxp: &Sender<messages::input::NbrRxMsg>,
) -> Task<()> {
    let span1 = debug_span!("neighbor", addr = %nbr.remote_addr);
    let _span1_guard = span1.enter();
    let span2 = debug_span!("input");
    let _span2_guard = span2.enter();

    let nbr_addr = nbr.remote_addr;
    let nbr_msg_rxp = nbr_msg_rxp.clone();

    // Spawn a supervised task for this neighbor.
    //
    // The TCP read loop runs inside an inner supervised task, which lets us
    // catch panics (for example, from malformed or malicious input) and
    // handle them gracefully. Rather than propagating the panic, we treat
    // it as if the TCP connection was closed, containing the failure.
    Task::spawn(
        async move {
            let worker_task = {
                let nbr_msg_rxp = nbr_msg_rxp.clone();
                Task::spawn(async move {
                    let _ = network::nbr_read_loop(
                        read_half,
                        nbr_addr,
                        cxt,
                        advertised,
                        nbr_msg_rxp,
                    )
                    .await;
                })
            };
            if let Err(error) = worker_task.await
                && error.is_panic()
            {
                error!(%error, "task panicked");
                let msg = messages::input::NbrRxMsg {
                    nbr_addr,
                    msg: Err(NbrRxError::TcpConnClosed),
                    raw: None,
                };
                let _ = nbr_msg_rxp.send(msg).await;
            }
        }
        .in_current_span(),
    )
}

// Neighbor TCP Tx task.
pub(crate) fn nbr_tx(
    nbr: &Neighbor,
    cxt: EncodeCxt,
    write_half: OwnedWriteHalf,
    msg_txc: UnboundedReceiver<messages::output::NbrTxMsg>,
) -> Task<()> {
    let span1 = debug_span!("neighbor", addr = %nbr.remote_addr);
    let _span1_guard = span1.enter();
    let span2 = debug_span!("output");
    let _span2_guard = span2.enter();

    Task::spawn(
        async move {
            network::nbr_write_loop(write_half, cxt, msg_txc).await;
        }
        .in_current_span(),
    )
}

// Neighbor timer task.
pub(crate) fn nbr_timer(
    nbr: &Neighbor,
    timer: fsm::Timer,
    timeout: Duration,
    nbr_timerp: &Sender<messages::input::NbrTimerMsg>,
) -> TimeoutTask {
    let nbr_timerp = nbr_timerp.clone();
    let nbr_addr = nbr.remote_addr;

    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::NbrTimerMsg { nbr_addr, timer };
        let _ = nbr_timerp.send(msg).await;
    })
}

// Send periodic keepalive messages.
pub(crate) fn nbr_kalive_interval(
    nbr: &Neighbor,
    interval: u16,
    events: &EventSender,
) -> IntervalTask {
    let msg_txp = nbr.msg_txp.as_ref().unwrap().clone();
    let nbr_addr = nbr.remote_addr;
    let msg_counter = nbr.statistics.msgs_sent.total.clone();
    let events = events.clone();

    IntervalTask::new(
        Duration::from_secs(interval.into()),
        false,
        move || {
            let msg_txp = msg_txp.clone();
            let msg_counter = msg_counter.clone();
            let events = events.clone();

            async move {
                let msg = Message::Keepalive(KeepaliveMsg {});
                Debug::NbrMsgTx(&nbr_addr, &msg).log();

                events.send(crate::event::Event::Sent {
                    peer: nbr_addr,
                    msg: Box::new(msg.clone()),
                    raw: None,
                });

                let msg = messages::output::NbrTxMsg::SendMessage {
                    nbr_addr,
                    msg,
                };
                let _ = msg_txp.send(msg);
                msg_counter.fetch_add(1, atomic::Ordering::Relaxed);
            }
        },
    )
}
