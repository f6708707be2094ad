//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use corvus_bgp::neighbor::PeerType;
use corvus_bgp::packet::message::{DecodeCxt, Message, NegotiatedCapability};

// Tiny deterministic PRNG so the corpus is reproducible.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn fill(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.next() as u8;
        }
    }
}

fn decode_cxt() -> DecodeCxt {
    DecodeCxt {
        peer_type: PeerType::External,
        peer_as: 65001,
        capabilities: [
            NegotiatedCapability::FourOctetAsNumber,
            NegotiatedCapability::AddPath {
                afi: corvus_bgp::packet::consts::Afi::Ipv4,
                safi: corvus_bgp::packet::consts::Safi::Unicast,
                send: false,
                recv: true,
            },
        ]
        .into(),
    }
}

// For any byte string, the framer either produces a parsed message or a
// decode error mapping to a NOTIFICATION; it never panics and never reads
// past the declared bounds.
#[test]
fn test_decode_random_input() {
    let cxt = decode_cxt();
    let mut rng = XorShift(0x2545f4914f6cdd1d);

    for _ in 0..20_000 {
        let len = 19 + (rng.next() as usize % 200);
        let mut data = vec![0; len];
        rng.fill(&mut data);

        if let Some(msg_size) = Message::get_message_len(&data) {
            let _ = Message::decode(&data[0..msg_size], &cxt);
        }
    }
}

// Same, with a valid marker, a consistent length field and a plausible
// message type so the per-message bodies get exercised.
#[test]
fn test_decode_random_bodies() {
    let cxt = decode_cxt();
    let mut rng = XorShift(0x9e3779b97f4a7c15);

    for _ in 0..20_000 {
        let len = 19 + (rng.next() as usize % 150);
        let mut data = vec![0; len];
        rng.fill(&mut data);

        data[..16].fill(0xff);
        data[16..18].copy_from_slice(&(len as u16).to_be_bytes());
        data[18] = (rng.next() % 7) as u8;

        let msg_size = Message::get_message_len(&data)
            .expect("Buffer doesn't contain a full BGP message");
        let _ = Message::decode(&data[0..msg_size], &cxt);
    }
}
