//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use bytes::Bytes;
use corvus_utils::UnboundedSender;
use serde::Serialize;

use crate::neighbor::Negotiated;
use crate::packet::attribute::Attrs;
use crate::packet::consts::{Afi, Safi};
use crate::packet::error::DecodeError;
use crate::packet::message::{Message, NotificationMsg};
use crate::packet::nlri::Nlri;

// Typed event stream delivered to the embedding application.
//
// Events flow out through a one-way channel; the consumer never calls back
// into the session driver.
#[derive(Debug)]
#[derive(Serialize)]
pub enum Event {
    SessionUp {
        peer: IpAddr,
        negotiated: Box<Negotiated>,
    },
    SessionDown {
        peer: IpAddr,
        reason: DownReason,
    },
    Received {
        peer: IpAddr,
        msg: Box<Message>,
        // Wire bytes, included when packets-level detail was requested.
        raw: Option<Bytes>,
    },
    Sent {
        peer: IpAddr,
        msg: Box<Message>,
        raw: Option<Bytes>,
    },
    Announce {
        peer: IpAddr,
        nlri: Nlri,
        // The effective nexthop rides in `attrs.base`.
        attrs: Box<Attrs>,
    },
    Withdraw {
        peer: IpAddr,
        nlri: Nlri,
    },
    EndOfRib {
        peer: IpAddr,
        afi: Afi,
        safi: Safi,
    },
    Notification {
        peer: IpAddr,
        direction: Direction,
        msg: NotificationMsg,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Serialize)]
pub enum Direction {
    Sent,
    Received,
}

// Reason a session left the Established state (or failed to get there).
#[derive(Clone, Debug)]
#[derive(Serialize)]
pub enum DownReason {
    AdminStop,
    NotificationSent(NotificationMsg),
    NotificationReceived(NotificationMsg),
    ConnectionClosed,
    ConnectionFailed,
    DecodeError(DecodeError),
    InternalError(String),
}

// Outward event channel handle.
#[derive(Clone, Debug)]
pub struct EventSender {
    txp: UnboundedSender<Event>,
    pub raw_messages: bool,
}

// ===== impl DownReason =====

impl std::fmt::Display for DownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownReason::AdminStop => {
                write!(f, "administrative stop")
            }
            DownReason::NotificationSent(msg) => {
                write!(
                    f,
                    "notification sent ({}, {})",
                    msg.error_code, msg.error_subcode
                )?;
                if let Some(comm) = msg.shutdown_communication() {
                    write!(f, ": {comm}")?;
                }
                Ok(())
            }
            DownReason::NotificationReceived(msg) => {
                write!(
                    f,
                    "notification received ({}, {})",
                    msg.error_code, msg.error_subcode
                )?;
                if let Some(comm) = msg.shutdown_communication() {
                    write!(f, ": {comm}")?;
                }
                Ok(())
            }
            DownReason::ConnectionClosed => {
                write!(f, "connection closed by remote end")
            }
            DownReason::ConnectionFailed => {
                write!(f, "connection failed")
            }
            DownReason::DecodeError(error) => {
                write!(f, "message decoding error: {error}")
            }
            DownReason::InternalError(reason) => {
                write!(f, "internal error: {reason}")
            }
        }
    }
}

// ===== impl EventSender =====

impl EventSender {
    pub fn new(txp: UnboundedSender<Event>, raw_messages: bool) -> EventSender {
        EventSender { txp, raw_messages }
    }

    // Delivers one event, ignoring errors as the consumer might have gone
    // away during shutdown.
    pub fn send(&self, event: Event) {
        let _ = self.txp.send(event);
    }
}
