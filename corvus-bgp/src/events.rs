//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use corvus_utils::ip::IpAddrExt;
use corvus_utils::socket::{TcpConnInfo, TcpStream};

use crate::debug::Debug;
use crate::error::{Error, IoError, NbrRxError};
use crate::event::{Direction, Event};
use crate::instance::{ApiMsg, InstanceUpView};
use crate::neighbor::{Neighbor, Neighbors, fsm};
use crate::packet::consts::{CeaseSubcode, ErrorCode, RouteRefreshSubtype};
use crate::packet::message::{
    Message, NotificationMsg, RouteRefreshMsg, UpdateMsg,
};
use crate::rib::{Change, ChangeAction, attrs_tx_update};
use crate::{network, rib};

// ===== TCP connection request =====

pub(crate) fn process_tcp_accept(
    instance: &mut InstanceUpView<'_>,
    neighbors: &mut Neighbors,
    stream: TcpStream,
    conn_info: TcpConnInfo,
) -> Result<(), Error> {
    // Lookup neighbor.
    let Some(nbr) = neighbors.get_mut(&conn_info.remote_addr) else {
        return Ok(());
    };

    // Workaround to prevent connection collision until collision resolution
    // is implemented.
    if nbr.conn_info.is_some() {
        return Ok(());
    }

    // Initialize the accepted stream.
    network::accepted_stream_init(
        &stream,
        nbr.remote_addr.address_family(),
        nbr.tx_ttl(),
        nbr.config.transport.ttl_security,
        nbr.config.transport.tcp_mss,
    )
    .map_err(IoError::TcpSocketError)?;

    // Invoke FSM event.
    nbr.fsm_event(instance, fsm::Event::Connected(stream, conn_info));

    Ok(())
}

// ===== TCP connection established (or refused) =====

pub(crate) fn process_tcp_connect(
    instance: &mut InstanceUpView<'_>,
    neighbors: &mut Neighbors,
    nbr_addr: IpAddr,
    stream: Option<TcpStream>,
    conn_info: Option<TcpConnInfo>,
) -> Result<(), Error> {
    // Lookup neighbor.
    let Some(nbr) = neighbors.get_mut(&nbr_addr) else {
        return Ok(());
    };
    nbr.tasks.connect = None;

    match (stream, conn_info) {
        (Some(stream), Some(conn_info)) => {
            // Workaround to prevent connection collision until collision
            // resolution is implemented.
            if nbr.conn_info.is_some() {
                return Ok(());
            }

            // Invoke FSM event.
            nbr.fsm_event(instance, fsm::Event::Connected(stream, conn_info));
        }
        _ => {
            nbr.fsm_event(instance, fsm::Event::ConnFail);
        }
    }

    Ok(())
}

// ===== neighbor message receipt =====

pub(crate) fn process_nbr_msg(
    instance: &mut InstanceUpView<'_>,
    neighbors: &mut Neighbors,
    nbr_addr: IpAddr,
    msg: Result<Message, NbrRxError>,
    raw: Option<Bytes>,
) -> Result<(), Error> {
    // Lookup neighbor.
    let Some(nbr) = neighbors.get_mut(&nbr_addr) else {
        return Ok(());
    };

    // Process received message.
    match msg {
        Ok(msg) => {
            Debug::NbrMsgRx(&nbr.remote_addr, &msg).log();

            // Update statistics.
            nbr.statistics.msgs_rcvd.update(&msg);

            // Surface the message to the event stream.
            let raw = instance.tx.events.raw_messages.then_some(raw).flatten();
            instance.tx.events.send(Event::Received {
                peer: nbr.remote_addr,
                msg: Box::new(msg.clone()),
                raw,
            });

            match msg {
                Message::Open(msg) => {
                    nbr.fsm_event(instance, fsm::Event::RcvdOpen(msg));
                }
                Message::Update(msg) => {
                    nbr.fsm_event(instance, fsm::Event::RcvdUpdate);
                    process_nbr_update(instance, nbr, msg)?;
                }
                Message::Notification(msg) => {
                    instance.tx.events.send(Event::Notification {
                        peer: nbr.remote_addr,
                        direction: Direction::Received,
                        msg: msg.clone(),
                    });
                    nbr.fsm_event(instance, fsm::Event::RcvdNotif(msg.clone()));
                    // Keep track of the last received notification.
                    nbr.notification_rcvd = Some((Utc::now(), msg));
                }
                Message::Keepalive(_) => {
                    nbr.fsm_event(instance, fsm::Event::RcvdKalive);
                }
                Message::RouteRefresh(msg) => {
                    nbr.holdtime_restart();
                    process_nbr_route_refresh(instance, nbr, msg);
                }
                Message::Operational(_) => {
                    // Opaque; already surfaced through the event stream.
                    nbr.holdtime_restart();
                }
            }
        }
        Err(error) => match error {
            NbrRxError::TcpConnClosed => {
                nbr.fsm_event(instance, fsm::Event::ConnFail);
            }
            NbrRxError::MsgDecodeError(error) => {
                nbr.fsm_event(instance, fsm::Event::RcvdError(error));
            }
        },
    }

    Ok(())
}

fn process_nbr_update(
    instance: &mut InstanceUpView<'_>,
    nbr: &mut Neighbor,
    msg: UpdateMsg,
) -> Result<(), Error> {
    // End-of-RIB marker (RFC 4724).
    if let Some((afi, safi)) = msg.is_eor() {
        Debug::NbrEorRcvd(&nbr.remote_addr, afi, safi).log();
        nbr.eor_rcvd.insert((afi, safi));
        instance.tx.events.send(Event::EndOfRib {
            peer: nbr.remote_addr,
            afi,
            safi,
        });
        return Ok(());
    }

    // Treat-as-withdraw accounting (RFC 7606).
    if let Some(attr_type) = msg.malformed_attr {
        nbr.statistics.erroneous_updates_withdrawn += 1;
        *nbr.statistics.treat_as_withdraw.entry(attr_type).or_default() += 1;
    }

    // Process IPv4 reachable NLRIs.
    //
    // Use nexthop from the NEXTHOP attribute. When the attributes were
    // dropped (treat-as-withdraw), the reachable NLRIs turn into
    // withdrawals instead.
    if let Some(reach) = msg.reach {
        if let Some(attrs) = &msg.attrs {
            let mut attrs = attrs.clone();
            attrs.base.nexthop = Some(reach.nexthop.into());
            for nlri in reach.prefixes {
                instance.tx.events.send(Event::Announce {
                    peer: nbr.remote_addr,
                    nlri,
                    attrs: Box::new(attrs.clone()),
                });
            }
        } else {
            for nlri in reach.prefixes {
                instance.tx.events.send(Event::Withdraw {
                    peer: nbr.remote_addr,
                    nlri,
                });
            }
        }
    }

    // Process multiprotocol reachable NLRIs.
    //
    // Use nexthop(s) from the MP_REACH_NLRI attribute.
    if let Some(mp_reach) = msg.mp_reach {
        if let Some(mut attrs) = msg.attrs {
            attrs.base.nexthop = Some(mp_reach.nexthop);
            attrs.base.ll_nexthop = mp_reach.ll_nexthop;
            for nlri in mp_reach.prefixes {
                instance.tx.events.send(Event::Announce {
                    peer: nbr.remote_addr,
                    nlri,
                    attrs: Box::new(attrs.clone()),
                });
            }
        } else {
            for nlri in mp_reach.prefixes {
                instance.tx.events.send(Event::Withdraw {
                    peer: nbr.remote_addr,
                    nlri,
                });
            }
        }
    }

    // Process IPv4 unreachable NLRIs.
    if let Some(unreach) = msg.unreach {
        for nlri in unreach.prefixes {
            instance.tx.events.send(Event::Withdraw {
                peer: nbr.remote_addr,
                nlri,
            });
        }
    }

    // Process multiprotocol unreachable NLRIs.
    if let Some(mp_unreach) = msg.mp_unreach {
        for nlri in mp_unreach.prefixes {
            instance.tx.events.send(Event::Withdraw {
                peer: nbr.remote_addr,
                nlri,
            });
        }
    }

    Ok(())
}

fn process_nbr_route_refresh(
    instance: &mut InstanceUpView<'_>,
    nbr: &mut Neighbor,
    msg: RouteRefreshMsg,
) {
    // Ignore requests for unknown or non-negotiated families.
    let Some((afi, safi)) = msg.family() else {
        return;
    };
    if !nbr.is_af_enabled(afi, safi) {
        return;
    }

    match msg.subtype {
        RouteRefreshSubtype::Normal => {
            // Replay the Adj-RIB-Out for the requested family, bracketed
            // with BoRR/EoRR on enhanced-refresh sessions.
            let enhanced = nbr
                .negotiated
                .as_ref()
                .is_some_and(|negotiated| {
                    negotiated.refresh
                        == crate::neighbor::RefreshMode::Enhanced
                });
            nbr.rib.resend(Some(&[(afi, safi)].into()), enhanced);
            flush_updates(nbr, instance);
        }
        RouteRefreshSubtype::Begin | RouteRefreshSubtype::End => {
            // Stale-path bookkeeping of the peer's refresh cycle belongs to
            // the inbound RIB, which lives outside this core. The markers
            // were already surfaced through the event stream.
        }
    }
}

// ===== neighbor timeout =====

pub(crate) fn process_nbr_timer(
    instance: &mut InstanceUpView<'_>,
    neighbors: &mut Neighbors,
    nbr_addr: IpAddr,
    timer: fsm::Timer,
) -> Result<(), Error> {
    // Lookup neighbor.
    let Some(nbr) = neighbors.get_mut(&nbr_addr) else {
        return Ok(());
    };

    nbr.fsm_event(instance, fsm::Event::Timer(timer));

    Ok(())
}

// ===== producer commands =====

pub(crate) fn process_api_msg(
    instance: &mut InstanceUpView<'_>,
    neighbors: &mut Neighbors,
    msg: ApiMsg,
) -> Result<(), Error> {
    match msg {
        ApiMsg::Routes { nbr_addr, changes } => {
            for nbr in neighbors
                .values_mut()
                .filter(|nbr| applies_to(nbr, nbr_addr))
            {
                for change in &changes {
                    let change = export_change(nbr, instance, change.clone());
                    nbr.rib.add_change(change);
                }
                flush_updates(nbr, instance);
            }
        }
        ApiMsg::Replace {
            nbr_addr,
            previous,
            changes,
        } => {
            for nbr in neighbors
                .values_mut()
                .filter(|nbr| applies_to(nbr, nbr_addr))
            {
                let previous = previous
                    .iter()
                    .map(|change| export_change(nbr, instance, change.clone()))
                    .collect();
                let changes = changes
                    .iter()
                    .map(|change| export_change(nbr, instance, change.clone()))
                    .collect();
                nbr.rib.replace(previous, changes);
                flush_updates(nbr, instance);
            }
        }
        ApiMsg::WithdrawAll { nbr_addr, families } => {
            for nbr in neighbors
                .values_mut()
                .filter(|nbr| applies_to(nbr, nbr_addr))
            {
                let families = match &families {
                    Some(families) => families.clone(),
                    None => nbr
                        .negotiated
                        .as_ref()
                        .map(|negotiated| negotiated.families.clone())
                        .unwrap_or_default(),
                };
                for family in families {
                    nbr.rib.remove_all(family);
                }
                flush_updates(nbr, instance);
            }
        }
        ApiMsg::Clear {
            nbr_addr,
            clear_type,
        } => {
            for nbr in neighbors
                .values_mut()
                .filter(|nbr| applies_to(nbr, nbr_addr))
            {
                nbr.clear_session(instance, clear_type);
            }
        }
        ApiMsg::Stop {
            nbr_addr,
            communication,
        } => {
            for nbr in neighbors
                .values_mut()
                .filter(|nbr| applies_to(nbr, nbr_addr))
            {
                let msg = match &communication {
                    Some(communication) => {
                        NotificationMsg::new_with_communication(
                            CeaseSubcode::AdministrativeShutdown,
                            communication,
                        )
                    }
                    None => NotificationMsg::new(ErrorCode::Cease, 0u8),
                };
                nbr.fsm_event(instance, fsm::Event::Stop(Some(msg)));
            }
        }
    }

    Ok(())
}

fn applies_to(nbr: &Neighbor, nbr_addr: Option<IpAddr>) -> bool {
    match nbr_addr {
        Some(addr) => nbr.remote_addr == addr,
        None => true,
    }
}

// ===== update generation =====

// Turns the queued changes into UPDATE messages and ships them. A
// generation error tears the session down (Cease/Out of Resources) rather
// than corrupt the wire.
pub(crate) fn flush_updates(
    nbr: &mut Neighbor,
    instance: &mut InstanceUpView<'_>,
) {
    if nbr.state != fsm::State::Established {
        return;
    }
    let Some(negotiated) = nbr.negotiated.clone() else {
        return;
    };

    match nbr.rib.updates(&negotiated, nbr.config.group_updates) {
        Ok(msgs) => {
            if !msgs.is_empty() {
                nbr.message_list_send(msgs, instance.tx);
            }
        }
        Err(error) => {
            nbr.internal_close(instance, error);
        }
    }
}

// Prepares a producer change for transmission to the given neighbor:
// rewrites the attributes for the session type and resolves a missing
// nexthop to the session source address.
pub(crate) fn export_change(
    nbr: &Neighbor,
    instance: &InstanceUpView<'_>,
    mut change: Change,
) -> Change {
    if change.action != ChangeAction::Announce {
        return change;
    }

    let mut attrs = (*change.attrs).clone();
    attrs_tx_update(&mut attrs, nbr.peer_type, nbr.local_as(instance));

    // Nexthop self.
    if attrs.base.nexthop.is_none()
        && let Some(conn_info) = &nbr.conn_info
    {
        attrs.base.nexthop =
            rib::nexthop_self(change.nlri.afi(), conn_info.local_addr);
    }

    change.attrs = Arc::new(attrs);
    change
}
