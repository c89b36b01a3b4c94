use std::io;
use std::net::{SocketAddr, SocketAddrV6, UdpSocket};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use dhcproto::{
    v6::{self, DhcpOption, DhcpOptions, Message, MessageType, RelayMessage},
    Decodable, Encodable,
};
use tracing::{debug, error, info, trace, warn};

use crate::addrdb::{self, AddrDb};
use crate::config::Config;
use crate::v6::extensions::RelayMessageExtV6;
use crate::v6::handlers::{self, V6Response};

/// First wire byte of a RELAY-FORW message.
const RELAY_FORW: u8 = 12;

fn read_db(db: &RwLock<AddrDb>) -> RwLockReadGuard<'_, AddrDb> {
    db.read().unwrap_or_else(|e| e.into_inner())
}

fn write_db(db: &RwLock<AddrDb>) -> RwLockWriteGuard<'_, AddrDb> {
    db.write().unwrap_or_else(|e| e.into_inner())
}

/// Serve DHCPv6 until the process dies. Handles messages sent directly by
/// on-link clients and messages forwarded one level through a relay.
pub fn v6_worker(config: Arc<ArcSwap<Config>>, db: Arc<RwLock<AddrDb>>) {
    let bind_addr = config.load().bind_address;
    let socket = UdpSocket::bind(bind_addr).expect("udp bind");
    info!("listening on {bind_addr}");
    let mut read_buf = [0u8; 2048];

    loop {
        // wake for the nearest lease timer even when the link is quiet
        let wake = {
            let db = read_db(&db);
            [db.min_t1(), db.min_t2(), db.min_preferred(), db.min_valid()]
                .into_iter()
                .min()
                .unwrap_or(u64::MAX)
                .clamp(1, 60)
        };
        socket
            .set_read_timeout(Some(Duration::from_secs(wake)))
            .ok();

        let (amount, src) = match socket.recv_from(&mut read_buf) {
            Ok((amount, src)) => (amount, src),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                run_duties(&db);
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                // the peer answered our last reply with ICMP unreachable
                error!("response rejected with ICMP unreachable");
                continue;
            }
            Err(e) => {
                error!(%e, "error receiving");
                continue;
            }
        };
        debug!("received {amount} bytes from {src:?}");

        let src6 = match src {
            SocketAddr::V6(s) => s,
            SocketAddr::V4(_) => continue,
        };
        let cfg = config.load();
        let packet = &read_buf[..amount];

        let response = if packet.first() == Some(&RELAY_FORW) {
            handle_relayed(&cfg, &db, packet, &src6)
        } else {
            handle_direct(&cfg, &db, packet, &src6)
        };

        if let Some(write_buf) = response {
            match socket.send_to(&write_buf, src) {
                Ok(sent) => debug!("responded with {sent} bytes"),
                Err(e) => error!(%e, "problem sending response message"),
            }
            if mutating_exchange(packet) {
                dump_db(&db);
            }
        }
    }
}

/// Message types whose handling can change the lease database. Relayed
/// packets count: the inner message may be any of the committing kinds.
fn mutating_exchange(packet: &[u8]) -> bool {
    // first wire byte is the message type
    matches!(packet.first().copied(), Some(1 | 3 | 5 | 6 | 8 | 9 | RELAY_FORW))
}

fn handle_direct(
    config: &Config,
    db: &RwLock<AddrDb>,
    packet: &[u8],
    src: &SocketAddrV6,
) -> Option<Vec<u8>> {
    let msg = match Message::from_bytes(packet) {
        Ok(msg) => msg,
        Err(e) => {
            error!("unable to parse dhcp message: {e}");
            return None;
        }
    };
    trace!("message: {msg:#?}");
    let response = {
        let mut db = write_db(db);
        handlers::handle_message(config, &mut db, &msg, src)
    };
    encode_response(response)
}

/// Unwrap a RELAY-FORW one level, handle the inner message, wrap the answer
/// in RELAY-REPL echoing the relay's Interface-Id.
fn handle_relayed(
    config: &Config,
    db: &RwLock<AddrDb>,
    packet: &[u8],
    src: &SocketAddrV6,
) -> Option<Vec<u8>> {
    let relay_msg = match RelayMessage::from_bytes(packet) {
        Ok(msg) => msg,
        Err(e) => {
            error!("unable to parse relay message: {e}");
            return None;
        }
    };
    trace!("relay message: {relay_msg:#?}");
    relay_msg
        .hw_addr()
        .inspect(|hw| debug!("client hw_addr per relay: {hw:?}"));
    relay_msg
        .interface_id()
        .inspect(|id| debug!(interface = %id, "relayed via"));

    let inner_msg = match relay_msg.opts().iter().find_map(|opt| match opt {
        DhcpOption::RelayMsg(data) => Some(data.clone()),
        _ => None,
    }) {
        Some(v6::RelayMessageData::Message(m)) => m,
        // multi-hop relay chains are not unwrapped
        Some(v6::RelayMessageData::Relay(_)) => {
            warn!("nested relay message, dropping");
            return None;
        }
        None => return None,
    };

    let response = {
        let mut db = write_db(db);
        handlers::handle_message(config, &mut db, &inner_msg, src)
    };
    let response_msg = match response {
        V6Response::Message(msg) => msg,
        V6Response::NoResponse(reason) => {
            debug!(reason = reason.as_str(), "not responding");
            return None;
        }
    };

    let mut relay_reply_opts = DhcpOptions::new();
    relay_reply_opts.insert(DhcpOption::RelayMsg(v6::RelayMessageData::Message(
        response_msg,
    )));
    // echo InterfaceId so the relay can route the reply to the right link
    if let Some(interface_id) = relay_msg
        .opts()
        .iter()
        .find(|opt| matches!(opt, DhcpOption::InterfaceId(_)))
    {
        relay_reply_opts.insert(interface_id.clone());
    }

    let relay_reply = RelayMessage {
        msg_type: MessageType::RelayRepl,
        hop_count: relay_msg.hop_count,
        link_addr: relay_msg.link_addr,
        peer_addr: relay_msg.peer_addr,
        opts: relay_reply_opts,
    };
    match relay_reply.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(%e, "encoding relay reply failed");
            None
        }
    }
}

fn encode_response(response: V6Response) -> Option<Vec<u8>> {
    match response {
        V6Response::Message(msg) => match msg.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(%e, "encoding response message failed");
                None
            }
        },
        V6Response::NoResponse(reason) => {
            debug!(reason = reason.as_str(), "not responding");
            None
        }
    }
}

/// Timer-driven housekeeping: expire leases and persist when anything went.
fn run_duties(db: &RwLock<AddrDb>) {
    let removed = write_db(db).sweep_expired();
    if removed > 0 {
        info!(removed, "expired leases removed");
        dump_db(db);
    }
}

fn dump_db(db: &RwLock<AddrDb>) {
    if let Err(e) = addrdb::dump_locked(db) {
        warn!(%e, "lease database dump failed");
    }
}
