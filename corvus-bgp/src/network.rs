//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use corvus_utils::ip::{AddressFamily, IpAddrExt};
use corvus_utils::socket::{
    OwnedReadHalf, OwnedWriteHalf, SocketExt, TTL_MAX, TcpConnInfo,
    TcpListener, TcpSocket, TcpSocketExt, TcpStream, TcpStreamExt,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use crate::config::AuthCfg;
use crate::error::{Error, IoError, NbrRxError};
use crate::packet::message::{
    Capability, DecodeCxt, EncodeCxt, Message, negotiate_capabilities,
};
use crate::tasks::messages::input::{NbrRxMsg, TcpAcceptMsg};
use crate::tasks::messages::output::NbrTxMsg;

// ===== global functions =====

// Applies the configured TCP authentication option to a socket, before
// connect() or accept() (RFC 2385 / RFC 5925).
pub fn apply_auth<S: TcpSocketExt>(
    socket: &S,
    remote_addr: &IpAddr,
    auth: &AuthCfg,
) -> Result<(), std::io::Error> {
    match auth {
        AuthCfg::Md5 { password } => {
            socket.set_md5sig(remote_addr, Some(password))
        }
        AuthCfg::TcpAo { keys } => {
            for key in keys {
                socket.set_ao_key(
                    remote_addr,
                    key.send_id,
                    key.recv_id,
                    &key.algorithm,
                    &key.key,
                )?;
            }
            Ok(())
        }
    }
}

pub(crate) fn listen_socket(
    af: AddressFamily,
    port: u16,
) -> Result<TcpListener, std::io::Error> {
    // Create TCP socket.
    let socket = socket(af)?;

    // Bind socket.
    let sockaddr = SocketAddr::from((IpAddr::unspecified(af), port));
    socket.set_reuseaddr(true)?;
    socket.bind(sockaddr)?;

    // GTSM Procedure: set TTL to max for outgoing packets.
    match af {
        AddressFamily::Ipv4 => {
            socket.set_ipv4_ttl(TTL_MAX)?;
        }
        AddressFamily::Ipv6 => {
            socket.set_ipv6_unicast_hops(TTL_MAX)?;
        }
    }

    // Convert the socket into a TcpListener.
    let socket = socket.listen(4096)?;

    Ok(socket)
}

// Provisions the per-neighbor authentication keys on the listening socket
// so inbound connections are accepted.
pub(crate) fn listen_socket_auth_update(
    socket: &TcpListener,
    nbr_addr: &IpAddr,
    auth: &AuthCfg,
) {
    if let Err(error) = apply_auth(socket, nbr_addr, auth) {
        IoError::TcpAuthError(error).log();
    }
}

pub(crate) async fn listen_loop(
    listener: Arc<TcpListener>,
    tcp_acceptp: Sender<TcpAcceptMsg>,
) -> Result<(), SendError<TcpAcceptMsg>> {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => match stream.conn_info() {
                Ok(conn_info) => {
                    let msg = TcpAcceptMsg {
                        stream: Some(stream),
                        conn_info,
                    };
                    tcp_acceptp.send(msg).await?;
                }
                Err(error) => {
                    IoError::TcpInfoError(error).log();
                }
            },
            Err(error) => {
                IoError::TcpAcceptError(error).log();
            }
        }
    }
}

pub(crate) fn accepted_stream_init(
    stream: &TcpStream,
    af: AddressFamily,
    ttl: u8,
    ttl_security: Option<u8>,
    tcp_mss: Option<u16>,
) -> Result<(), std::io::Error> {
    // Set TTL.
    match af {
        AddressFamily::Ipv4 => stream.set_ipv4_ttl(ttl)?,
        AddressFamily::Ipv6 => stream.set_ipv6_unicast_hops(ttl)?,
    }

    // Set TTL security check.
    if let Some(ttl_security_hops) = ttl_security {
        let ttl = TTL_MAX - ttl_security_hops + 1;
        match af {
            AddressFamily::Ipv4 => stream.set_ipv4_minttl(ttl)?,
            AddressFamily::Ipv6 => stream.set_ipv6_min_hopcount(ttl)?,
        }
    }

    // Set the TCP Maximum Segment Size.
    if let Some(tcp_mss) = tcp_mss {
        stream.set_mss(tcp_mss.into())?;
    }

    Ok(())
}

pub(crate) async fn connect(
    remote_addr: IpAddr,
    port: u16,
    local_addr: Option<IpAddr>,
    ttl: u8,
    ttl_security: Option<u8>,
    tcp_mss: Option<u16>,
    auth: &Option<AuthCfg>,
) -> Result<(TcpStream, TcpConnInfo), Error> {
    let af = remote_addr.address_family();

    // Create TCP socket.
    let socket = socket(af).map_err(IoError::TcpSocketError)?;

    // Bind socket.
    if let Some(local_addr) = local_addr {
        let sockaddr = SocketAddr::from((local_addr, 0));
        socket
            .set_reuseaddr(true)
            .map_err(IoError::TcpSocketError)?;
        socket.bind(sockaddr).map_err(IoError::TcpSocketError)?;
    }

    // Set TTL.
    match af {
        AddressFamily::Ipv4 => socket.set_ipv4_ttl(ttl),
        AddressFamily::Ipv6 => socket.set_ipv6_unicast_hops(ttl),
    }
    .map_err(IoError::TcpSocketError)?;

    // Set TTL security check.
    if let Some(ttl_security_hops) = ttl_security {
        let ttl = TTL_MAX - ttl_security_hops + 1;
        match af {
            AddressFamily::Ipv4 => socket.set_ipv4_minttl(ttl),
            AddressFamily::Ipv6 => socket.set_ipv6_min_hopcount(ttl),
        }
        .map_err(IoError::TcpSocketError)?;
    }

    // Set the TCP Maximum Segment Size.
    if let Some(tcp_mss) = tcp_mss {
        socket
            .set_mss(tcp_mss.into())
            .map_err(IoError::TcpSocketError)?;
    }

    // Set the TCP authentication option.
    if let Some(auth) = auth {
        apply_auth(&socket, &remote_addr, auth)
            .map_err(IoError::TcpAuthError)?;
    }

    // Connect to remote address on the BGP port.
    let sockaddr = SocketAddr::from((remote_addr, port));
    let stream = socket
        .connect(sockaddr)
        .await
        .map_err(IoError::TcpConnectError)?;

    // Obtain TCP connection address/port information.
    let conn_info = stream.conn_info().map_err(IoError::TcpInfoError)?;

    Ok((stream, conn_info))
}

pub(crate) async fn nbr_write_loop(
    mut stream: OwnedWriteHalf,
    mut cxt: EncodeCxt,
    mut nbr_msg_txc: UnboundedReceiver<NbrTxMsg>,
) {
    while let Some(msg) = nbr_msg_txc.recv().await {
        match msg {
            // Send message to the peer.
            NbrTxMsg::SendMessage { msg, .. } => {
                write_message(&mut stream, &msg, &cxt).await;
            }
            // Send list of messages to the peer.
            NbrTxMsg::SendMessageList { msg_list, .. } => {
                for msg in msg_list {
                    write_message(&mut stream, &msg, &cxt).await;
                }
            }
            // Update negotiated capabilities.
            NbrTxMsg::UpdateCapabilities(caps) => cxt.capabilities = caps,
        }
    }
}

async fn write_message(
    stream: &mut OwnedWriteHalf,
    msg: &Message,
    cxt: &EncodeCxt,
) {
    let buf = msg.encode(cxt);

    // Never put anything above the negotiated size on the wire; a message
    // this large indicates a packing bug upstream.
    let max_len = cxt.max_msg_len();
    if buf.len() > max_len as usize {
        IoError::TcpOversizedMessage(buf.len(), max_len).log();
        return;
    }

    if let Err(error) = stream.write_all(&buf).await {
        IoError::TcpSendError(error).log();
    }
}

pub(crate) async fn nbr_read_loop(
    mut stream: OwnedReadHalf,
    nbr_addr: IpAddr,
    mut cxt: DecodeCxt,
    advertised: BTreeSet<Capability>,
    nbr_msg_rxp: Sender<NbrRxMsg>,
) -> Result<(), SendError<NbrRxMsg>> {
    const BUF_SIZE: usize = 65535;
    let mut buf = [0; BUF_SIZE];
    let mut data = Vec::with_capacity(BUF_SIZE);

    loop {
        // Read data from the network.
        match stream.read(&mut buf).await {
            Ok(0) => {
                // Notify that the connection was closed by the remote end.
                let msg = NbrRxMsg {
                    nbr_addr,
                    msg: Err(NbrRxError::TcpConnClosed),
                    raw: None,
                };
                nbr_msg_rxp.send(msg).await?;
                return Ok(());
            }
            Ok(num_bytes) => data.extend_from_slice(&buf[..num_bytes]),
            Err(error) => {
                IoError::TcpRecvError(error).log();
                continue;
            }
        };

        // Decode message(s).
        while let Some(msg_size) = Message::get_message_len(&data) {
            let raw = Bytes::copy_from_slice(&data[0..msg_size]);
            let msg =
                Message::decode(&raw, &cxt).map_err(NbrRxError::MsgDecodeError);
            data.drain(..msg_size);

            // Keep track of the session capabilities as they influence how
            // subsequent messages are decoded.
            if let Ok(Message::Open(msg)) = &msg {
                cxt.capabilities =
                    negotiate_capabilities(&advertised, &msg.capabilities);
            }

            // Notify that the BGP message was received.
            let msg = NbrRxMsg {
                nbr_addr,
                msg,
                raw: Some(raw),
            };
            nbr_msg_rxp.send(msg).await?;
        }
    }
}

// ===== helper functions =====

fn socket(af: AddressFamily) -> Result<TcpSocket, std::io::Error> {
    let socket = match af {
        AddressFamily::Ipv4 => TcpSocket::new_v4()?,
        AddressFamily::Ipv6 => {
            let socket = TcpSocket::new_v6()?;
            socket.set_ipv6_only(true)?;
            socket
        }
    };

    // Set socket options.
    match af {
        AddressFamily::Ipv4 => {
            socket.set_ipv4_tos(libc::IPTOS_PREC_INTERNETCONTROL)?;
        }
        AddressFamily::Ipv6 => {
            socket.set_ipv6_tclass(libc::IPTOS_PREC_INTERNETCONTROL)?;
        }
    }

    Ok(socket)
}
