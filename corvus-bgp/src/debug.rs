//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use tracing::{debug, debug_span};

use crate::neighbor::fsm;
use crate::packet::consts::{Afi, AttrType, Safi};
use crate::packet::error::AttrError;
use crate::packet::message::Message;

// BGP debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    InstanceStart,
    InstanceStop,
    ListenerStart(&'a IpAddr),
    NbrCreate(&'a IpAddr),
    NbrDelete(&'a IpAddr),
    NbrFsmEvent(&'a IpAddr, &'a fsm::Event),
    NbrFsmTransition(&'a IpAddr, &'a fsm::State, &'a fsm::State),
    NbrMsgRx(&'a IpAddr, &'a Message),
    NbrMsgTx(&'a IpAddr, &'a Message),
    NbrAttrError(AttrType, AttrError),
    NbrEorRcvd(&'a IpAddr, Afi, Safi),
    NbrGrTimerStart(&'a IpAddr, u16),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceStart | Debug::InstanceStop => {
                debug!("{}", self);
            }
            Debug::ListenerStart(addr) => {
                debug!(%addr, "{}", self);
            }
            Debug::NbrCreate(addr) | Debug::NbrDelete(addr) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::NbrFsmEvent(addr, event) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("fsm").in_scope(|| {
                        debug!(?event, "{}", self);
                    })
                });
            }
            Debug::NbrFsmTransition(addr, old_state, new_state) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("fsm").in_scope(|| {
                        debug!(?old_state, ?new_state, "{}", self);
                    })
                });
            }
            Debug::NbrMsgRx(addr, msg) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        let data = serde_json::to_string(&msg).unwrap();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::NbrMsgTx(addr, msg) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("output").in_scope(|| {
                        let data = serde_json::to_string(&msg).unwrap();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::NbrAttrError(attr_type, action) => {
                debug!(?attr_type, ?action, "{}", self);
            }
            Debug::NbrEorRcvd(addr, afi, safi) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!(%afi, ?safi, "{}", self);
                });
            }
            Debug::NbrGrTimerStart(addr, restart_time) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!(%restart_time, "{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceStart => {
                write!(f, "starting instance")
            }
            Debug::InstanceStop => {
                write!(f, "stopping instance")
            }
            Debug::ListenerStart(..) => {
                write!(f, "starting listener")
            }
            Debug::NbrCreate(..) => {
                write!(f, "neighbor created")
            }
            Debug::NbrDelete(..) => {
                write!(f, "neighbor deleted")
            }
            Debug::NbrFsmEvent(..) => {
                write!(f, "event")
            }
            Debug::NbrFsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::NbrMsgRx(..) | Debug::NbrMsgTx(..) => {
                write!(f, "message")
            }
            Debug::NbrAttrError(..) => {
                write!(f, "malformed attribute")
            }
            Debug::NbrEorRcvd(..) => {
                write!(f, "end-of-rib received")
            }
            Debug::NbrGrTimerStart(..) => {
                write!(f, "graceful restart timer started")
            }
        }
    }
}
