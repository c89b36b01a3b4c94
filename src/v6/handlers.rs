use std::net::{Ipv6Addr, SocketAddrV6};

use dhcproto::v6::{
    DhcpOption, DhcpOptions, IAAddr, IAPrefix, Message, MessageType, Status, StatusCode, IANA,
    IAPD,
};
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::addrdb::{AddrDb, IaKind};
use crate::config::Config;
use crate::v6::alloc;
use crate::v6::extensions::{ia_addr_hints, ia_prefix_hints, MessageExtV6};
use crate::Duid;

#[derive(Debug, Copy, Clone)]
pub enum NoResponseReason {
    NoClientId,
    UnexpectedServerId,
    WrongServerId,
    NoServerId,
    Discarded,
}

impl NoResponseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoResponseReason::NoClientId => "NoClientId",
            NoResponseReason::UnexpectedServerId => "UnexpectedServerId",
            NoResponseReason::WrongServerId => "WrongServerId",
            NoResponseReason::NoServerId => "NoServerId",
            NoResponseReason::Discarded => "Discarded",
        }
    }
}

/// Result of processing an incoming DHCPv6 message: either a message to
/// send back, or a deliberate silence.
pub enum V6Response {
    Message(Message),
    NoResponse(NoResponseReason),
}

fn status_code(status: Status, text: &str) -> DhcpOption {
    DhcpOption::StatusCode(StatusCode {
        status,
        msg: text.into(),
    })
}

fn addr_option(addr: Ipv6Addr, pref: u32, valid: u32) -> DhcpOption {
    DhcpOption::IAAddr(IAAddr {
        addr,
        preferred_life: pref,
        valid_life: valid,
        opts: DhcpOptions::new(),
    })
}

fn prefix_option(prefix: Ipv6Addr, length: u8, pref: u32, valid: u32) -> DhcpOption {
    DhcpOption::IAPrefix(IAPrefix {
        preferred_lifetime: pref,
        valid_lifetime: valid,
        prefix_len: length,
        prefix_ip: prefix,
        opts: DhcpOptions::new(),
    })
}

fn iana_option(id: u32, t1: u32, t2: u32, inner: DhcpOptions) -> DhcpOption {
    DhcpOption::IANA(IANA {
        id,
        t1,
        t2,
        opts: inner,
    })
}

fn iapd_option(id: u32, t1: u32, t2: u32, inner: DhcpOptions) -> DhcpOption {
    DhcpOption::IAPD(IAPD {
        id,
        t1,
        t2,
        opts: inner,
    })
}

fn finish_reply(reply: &mut Message, config: &Config, client_id: Duid) {
    let opts = reply.opts_mut();
    opts.insert(DhcpOption::ServerId(config.server_duid.bytes.clone()));
    opts.insert(DhcpOption::ClientId(client_id.bytes));
}

/// Addresses currently leased to the client across its IA_NAs.
fn leased_count(db: &AddrDb, duid: &Duid) -> usize {
    db.get_client_by_duid(duid)
        .map(|c| c.ias(IaKind::Na).map(|ia| ia.count_addrs()).sum())
        .unwrap_or(0)
}

/// Allocate and record bindings for every IA in the message. Used by
/// Request and by Solicit with rapid commit.
fn commit_bindings(
    config: &Config,
    db: &mut AddrDb,
    msg: &Message,
    client_id: &Duid,
    src: &SocketAddrV6,
    reply: &mut Message,
) {
    let iface = src.scope_id() as i32;
    let src_ip = Some(*src.ip());

    for iana in msg.ia_nas() {
        let mut inner = DhcpOptions::new();
        let hint = ia_addr_hints(iana).first().map(|a| a.addr);

        // a client re-requesting a lease it already holds gets it refreshed
        let refreshed = hint.is_some_and(|addr| {
            db.update_address(
                client_id,
                iana.id,
                config.t1,
                config.t2,
                addr,
                config.preferred_lifetime,
                config.valid_lifetime,
                true,
            )
            .is_ok()
        });

        if refreshed {
            if let Some(addr) = hint {
                inner.insert(addr_option(
                    addr,
                    config.preferred_lifetime,
                    config.valid_lifetime,
                ));
            }
        } else if leased_count(db, client_id) >= config.client_max_leases {
            warn!(duid = %client_id, "client reached its address lease cap");
            inner.insert(status_code(Status::NoAddrsAvail, "lease limit reached"));
        } else {
            match alloc::pick_address(db, &config.addr_pool, hint) {
                Some(addr) => match db.add_address(
                    client_id,
                    src_ip,
                    iface,
                    iana.id,
                    config.t1,
                    config.t2,
                    addr,
                    config.preferred_lifetime,
                    config.valid_lifetime,
                    false,
                ) {
                    Ok(()) => inner.insert(addr_option(
                        addr,
                        config.preferred_lifetime,
                        config.valid_lifetime,
                    )),
                    Err(e) => {
                        warn!(%e, iaid = iana.id, "address commit failed");
                        inner.insert(status_code(Status::NoAddrsAvail, "no addresses available"));
                    }
                },
                None => {
                    info!(iaid = iana.id, "address pool exhausted");
                    inner.insert(status_code(Status::NoAddrsAvail, "no addresses available"));
                }
            }
        }
        reply
            .opts_mut()
            .insert(iana_option(iana.id, config.t1, config.t2, inner));
    }

    for iapd in msg.ia_pds() {
        let mut inner = DhcpOptions::new();
        let (hint, length) = match ia_prefix_hints(iapd).first() {
            Some(p) if p.prefix_len > 0 => (Some(p.prefix_ip), p.prefix_len),
            _ => (None, config.pd_length),
        };

        let refreshed = hint.is_some_and(|prefix| {
            db.update_prefix(
                client_id,
                iapd.id,
                config.t1,
                config.t2,
                prefix,
                config.preferred_lifetime,
                config.valid_lifetime,
                true,
            )
            .is_ok()
        });

        if refreshed {
            if let Some(prefix) = hint {
                inner.insert(prefix_option(
                    prefix,
                    length,
                    config.preferred_lifetime,
                    config.valid_lifetime,
                ));
            }
        } else {
            let choice = alloc::pick_prefix(db, &config.pd_pool, length, hint)
                .map(|p| (p, length))
                .or_else(|| {
                    // client asked for a length we cannot serve
                    (length != config.pd_length)
                        .then(|| {
                            alloc::pick_prefix(db, &config.pd_pool, config.pd_length, None)
                                .map(|p| (p, config.pd_length))
                        })
                        .flatten()
                });
            match choice {
                Some((prefix, length)) => match db.add_prefix(
                    client_id,
                    src_ip,
                    iface,
                    iapd.id,
                    config.t1,
                    config.t2,
                    prefix,
                    config.preferred_lifetime,
                    config.valid_lifetime,
                    length,
                    false,
                ) {
                    Ok(()) => inner.insert(prefix_option(
                        prefix,
                        length,
                        config.preferred_lifetime,
                        config.valid_lifetime,
                    )),
                    Err(e) => {
                        warn!(%e, iaid = iapd.id, "prefix commit failed");
                        inner.insert(status_code(Status::NoPrefixAvail, "no prefixes available"));
                    }
                },
                None => {
                    info!(iaid = iapd.id, "prefix pool exhausted");
                    inner.insert(status_code(Status::NoPrefixAvail, "no prefixes available"));
                }
            }
        }
        reply
            .opts_mut()
            .insert(iapd_option(iapd.id, config.t1, config.t2, inner));
    }
}

/// Propose bindings without recording anything, for the Advertise leg of the
/// four-message exchange.
fn offer_bindings(config: &Config, db: &AddrDb, msg: &Message, reply: &mut Message) {
    for iana in msg.ia_nas() {
        let mut inner = DhcpOptions::new();
        let hint = ia_addr_hints(iana).first().map(|a| a.addr);
        match alloc::pick_address(db, &config.addr_pool, hint) {
            Some(addr) => inner.insert(addr_option(
                addr,
                config.preferred_lifetime,
                config.valid_lifetime,
            )),
            None => {
                info!(iaid = iana.id, "address pool exhausted");
                inner.insert(status_code(Status::NoAddrsAvail, "no addresses available"));
            }
        }
        reply
            .opts_mut()
            .insert(iana_option(iana.id, config.t1, config.t2, inner));
    }
    for iapd in msg.ia_pds() {
        let mut inner = DhcpOptions::new();
        let (hint, length) = match ia_prefix_hints(iapd).first() {
            Some(p) if p.prefix_len > 0 => (Some(p.prefix_ip), p.prefix_len),
            _ => (None, config.pd_length),
        };
        let choice = alloc::pick_prefix(db, &config.pd_pool, length, hint)
            .map(|p| (p, length))
            .or_else(|| {
                (length != config.pd_length)
                    .then(|| {
                        alloc::pick_prefix(db, &config.pd_pool, config.pd_length, None)
                            .map(|p| (p, config.pd_length))
                    })
                    .flatten()
            });
        match choice {
            Some((prefix, length)) => inner.insert(prefix_option(
                prefix,
                length,
                config.preferred_lifetime,
                config.valid_lifetime,
            )),
            None => {
                info!(iaid = iapd.id, "prefix pool exhausted");
                inner.insert(status_code(Status::NoPrefixAvail, "no prefixes available"));
            }
        }
        reply
            .opts_mut()
            .insert(iapd_option(iapd.id, config.t1, config.t2, inner));
    }
}

/// Extend existing bindings for every IA in the message. IAs the database
/// does not know get a NoBinding status inside the IA (RFC 8415 18.3.4/18.3.5),
/// never at message level.
fn refresh_bindings(
    config: &Config,
    db: &mut AddrDb,
    msg: &Message,
    client_id: &Duid,
    reply: &mut Message,
) {
    for iana in msg.ia_nas() {
        let mut inner = DhcpOptions::new();
        let hints = ia_addr_hints(iana);
        let known = db
            .get_client_by_duid(client_id)
            .map(|c| c.get_ia(IaKind::Na, iana.id).is_some())
            .unwrap_or(false);
        if !known {
            for a in &hints {
                inner.insert(addr_option(a.addr, 0, 0));
            }
            inner.insert(status_code(Status::NoBinding, "no binding for this IA"));
        } else {
            // no hints means "extend whatever you have for this IA"
            let addrs: Vec<Ipv6Addr> = if hints.is_empty() {
                db.get_client_by_duid(client_id)
                    .and_then(|c| c.get_ia(IaKind::Na, iana.id))
                    .map(|ia| ia.addrs().map(|l| l.addr()).collect())
                    .unwrap_or_default()
            } else {
                hints.iter().map(|a| a.addr).collect()
            };
            for addr in addrs {
                match db.update_address(
                    client_id,
                    iana.id,
                    config.t1,
                    config.t2,
                    addr,
                    config.preferred_lifetime,
                    config.valid_lifetime,
                    false,
                ) {
                    Ok(()) => inner.insert(addr_option(
                        addr,
                        config.preferred_lifetime,
                        config.valid_lifetime,
                    )),
                    // not a lease we handed out: zero its lifetimes
                    Err(_) => inner.insert(addr_option(addr, 0, 0)),
                }
            }
        }
        reply
            .opts_mut()
            .insert(iana_option(iana.id, config.t1, config.t2, inner));
    }

    for iapd in msg.ia_pds() {
        let mut inner = DhcpOptions::new();
        let hints = ia_prefix_hints(iapd);
        let known = db
            .get_client_by_duid(client_id)
            .map(|c| c.get_ia(IaKind::Pd, iapd.id).is_some())
            .unwrap_or(false);
        if !known {
            for p in &hints {
                inner.insert(prefix_option(p.prefix_ip, p.prefix_len, 0, 0));
            }
            inner.insert(status_code(Status::NoBinding, "no binding for this IA"));
        } else {
            let prefixes: Vec<(Ipv6Addr, u8)> = if hints.is_empty() {
                db.get_client_by_duid(client_id)
                    .and_then(|c| c.get_ia(IaKind::Pd, iapd.id))
                    .map(|ia| ia.prefixes().map(|p| (p.prefix(), p.length())).collect())
                    .unwrap_or_default()
            } else {
                hints.iter().map(|p| (p.prefix_ip, p.prefix_len)).collect()
            };
            for (prefix, length) in prefixes {
                match db.update_prefix(
                    client_id,
                    iapd.id,
                    config.t1,
                    config.t2,
                    prefix,
                    config.preferred_lifetime,
                    config.valid_lifetime,
                    false,
                ) {
                    Ok(()) => inner.insert(prefix_option(
                        prefix,
                        length,
                        config.preferred_lifetime,
                        config.valid_lifetime,
                    )),
                    Err(_) => inner.insert(prefix_option(prefix, length, 0, 0)),
                }
            }
        }
        reply
            .opts_mut()
            .insert(iapd_option(iapd.id, config.t1, config.t2, inner));
    }
}

#[instrument(skip(config, db, msg, src), fields(client_id = field::Empty, xid = ?msg.xid()))]
fn handle_solicit(
    config: &Config,
    db: &mut AddrDb,
    msg: &Message,
    src: &SocketAddrV6,
) -> V6Response {
    // Servers MUST discard Solicit messages lacking a Client Identifier or
    // carrying a Server Identifier
    let client_id = match msg.client_id() {
        Some(bytes) => Duid::from(bytes),
        None => return V6Response::NoResponse(NoResponseReason::NoClientId),
    };
    Span::current().record("client_id", field::display(client_id.to_colon_string()));
    if msg.server_id().is_some() {
        info!("client included a server_id in Solicit, ignoring message");
        return V6Response::NoResponse(NoResponseReason::UnexpectedServerId);
    }
    if let Some(elapsed) = msg.elapsed_time() {
        debug!(elapsed, "client has been trying this long (1/100s)");
    }

    // https://datatracker.ietf.org/doc/html/rfc8415#section-18.3.1
    let rapid = msg.rapid_commit() && config.rapid_commit;
    let mut reply = if rapid {
        debug!("solicit with rapid commit, two message exchange");
        let mut reply = Message::new_with_id(MessageType::Reply, msg.xid());
        reply.opts_mut().insert(DhcpOption::RapidCommit);
        reply
    } else {
        debug!("solicit, four message exchange");
        let mut reply = Message::new_with_id(MessageType::Advertise, msg.xid());
        // the Preference option steers clients between competing servers
        reply
            .opts_mut()
            .insert(DhcpOption::Preference(config.preference));
        reply
    };

    if rapid {
        commit_bindings(config, db, msg, &client_id, src, &mut reply);
    } else {
        offer_bindings(config, db, msg, &mut reply);
    }
    finish_reply(&mut reply, config, client_id);
    V6Response::Message(reply)
}

#[instrument(skip(config, db, msg, src), fields(client_id = field::Empty, xid = ?msg.xid()))]
fn handle_request(
    config: &Config,
    db: &mut AddrDb,
    msg: &Message,
    src: &SocketAddrV6,
) -> V6Response {
    // Request MUST carry our Server Identifier and a Client Identifier
    let client_id = match msg.client_id() {
        Some(bytes) => Duid::from(bytes),
        None => return V6Response::NoResponse(NoResponseReason::NoClientId),
    };
    Span::current().record("client_id", field::display(client_id.to_colon_string()));
    match msg.server_id() {
        Some(bytes) if bytes == config.server_duid.bytes => (),
        Some(_) => return V6Response::NoResponse(NoResponseReason::WrongServerId),
        None => return V6Response::NoResponse(NoResponseReason::NoServerId),
    }

    let mut reply = Message::new_with_id(MessageType::Reply, msg.xid());
    commit_bindings(config, db, msg, &client_id, src, &mut reply);
    finish_reply(&mut reply, config, client_id);
    V6Response::Message(reply)
}

#[instrument(skip(config, db, msg), fields(client_id = field::Empty, xid = ?msg.xid()))]
fn handle_renew(config: &Config, db: &mut AddrDb, msg: &Message) -> V6Response {
    let client_id = match msg.client_id() {
        Some(bytes) => Duid::from(bytes),
        None => return V6Response::NoResponse(NoResponseReason::NoClientId),
    };
    Span::current().record("client_id", field::display(client_id.to_colon_string()));
    // Renew goes to the server that granted the lease
    match msg.server_id() {
        Some(bytes) if bytes == config.server_duid.bytes => (),
        Some(_) => return V6Response::NoResponse(NoResponseReason::WrongServerId),
        None => return V6Response::NoResponse(NoResponseReason::NoServerId),
    }

    let mut reply = Message::new_with_id(MessageType::Reply, msg.xid());
    refresh_bindings(config, db, msg, &client_id, &mut reply);
    finish_reply(&mut reply, config, client_id);
    V6Response::Message(reply)
}

/// Rebind is Renew addressed to any server, after the original one went
/// quiet (RFC 8415 Section 18.3.5).
#[instrument(skip(config, db, msg), fields(client_id = field::Empty, xid = ?msg.xid()))]
fn handle_rebind(config: &Config, db: &mut AddrDb, msg: &Message) -> V6Response {
    let client_id = match msg.client_id() {
        Some(bytes) => Duid::from(bytes),
        None => return V6Response::NoResponse(NoResponseReason::NoClientId),
    };
    Span::current().record("client_id", field::display(client_id.to_colon_string()));
    if msg.server_id().is_some() {
        debug!("rebind carries a server_id (unusual but allowed)");
    }

    let mut reply = Message::new_with_id(MessageType::Reply, msg.xid());
    refresh_bindings(config, db, msg, &client_id, &mut reply);
    finish_reply(&mut reply, config, client_id);
    V6Response::Message(reply)
}

#[instrument(skip(config, db, msg), fields(client_id = field::Empty, xid = ?msg.xid()))]
fn handle_release(config: &Config, db: &mut AddrDb, msg: &Message) -> V6Response {
    let client_id = match msg.client_id() {
        Some(bytes) => Duid::from(bytes),
        None => return V6Response::NoResponse(NoResponseReason::NoClientId),
    };
    Span::current().record("client_id", field::display(client_id.to_colon_string()));
    match msg.server_id() {
        Some(bytes) if bytes == config.server_duid.bytes => (),
        Some(_) => return V6Response::NoResponse(NoResponseReason::WrongServerId),
        None => return V6Response::NoResponse(NoResponseReason::NoServerId),
    }

    let mut reply = Message::new_with_id(MessageType::Reply, msg.xid());
    for iana in msg.ia_nas() {
        let mut all = true;
        let mut any = false;
        for a in ia_addr_hints(iana) {
            any = true;
            all &= db.del_address(&client_id, iana.id, a.addr, false);
        }
        let mut inner = DhcpOptions::new();
        if any && all {
            inner.insert(status_code(Status::Success, "address released"));
        } else {
            inner.insert(status_code(Status::NoBinding, "no binding for this IA"));
        }
        reply.opts_mut().insert(iana_option(iana.id, 0, 0, inner));
    }
    for iapd in msg.ia_pds() {
        let mut all = true;
        let mut any = false;
        for p in ia_prefix_hints(iapd) {
            any = true;
            all &= db.del_prefix(&client_id, iapd.id, p.prefix_ip, false);
        }
        let mut inner = DhcpOptions::new();
        if any && all {
            inner.insert(status_code(Status::Success, "prefix released"));
        } else {
            inner.insert(status_code(Status::NoBinding, "no binding for this IA"));
        }
        reply.opts_mut().insert(iapd_option(iapd.id, 0, 0, inner));
    }
    reply
        .opts_mut()
        .insert(status_code(Status::Success, "release processed"));
    finish_reply(&mut reply, config, client_id);
    V6Response::Message(reply)
}

/// Decline means the client detected the address in use elsewhere. Drop the
/// lease; the address stays out of circulation only as long as the conflict
/// does.
#[instrument(skip(config, db, msg), fields(client_id = field::Empty, xid = ?msg.xid()))]
fn handle_decline(config: &Config, db: &mut AddrDb, msg: &Message) -> V6Response {
    let client_id = match msg.client_id() {
        Some(bytes) => Duid::from(bytes),
        None => return V6Response::NoResponse(NoResponseReason::NoClientId),
    };
    Span::current().record("client_id", field::display(client_id.to_colon_string()));
    match msg.server_id() {
        Some(bytes) if bytes == config.server_duid.bytes => (),
        Some(_) => return V6Response::NoResponse(NoResponseReason::WrongServerId),
        None => return V6Response::NoResponse(NoResponseReason::NoServerId),
    }

    let mut reply = Message::new_with_id(MessageType::Reply, msg.xid());
    for iana in msg.ia_nas() {
        let mut inner = DhcpOptions::new();
        let mut any = false;
        for a in ia_addr_hints(iana) {
            warn!(addr = %a.addr, duid = %client_id, "client declined address");
            any |= db.del_address(&client_id, iana.id, a.addr, false);
        }
        if any {
            inner.insert(status_code(Status::Success, "decline recorded"));
        } else {
            inner.insert(status_code(Status::NoBinding, "no binding for this IA"));
        }
        reply.opts_mut().insert(iana_option(iana.id, 0, 0, inner));
    }
    finish_reply(&mut reply, config, client_id);
    V6Response::Message(reply)
}

/// Confirm only asks "are these addresses still on-link?"; it does not
/// refresh bindings (RFC 8415 Section 18.3.3).
#[instrument(skip(config, msg), fields(client_id = field::Empty, xid = ?msg.xid()))]
fn handle_confirm(config: &Config, msg: &Message) -> V6Response {
    let client_id = match msg.client_id() {
        Some(bytes) => Duid::from(bytes),
        None => return V6Response::NoResponse(NoResponseReason::NoClientId),
    };
    Span::current().record("client_id", field::display(client_id.to_colon_string()));

    let mut checked = 0usize;
    let mut off_link = 0usize;
    for iana in msg.ia_nas() {
        for a in ia_addr_hints(iana) {
            checked += 1;
            if !config.addr_pool.contains(&a.addr) {
                off_link += 1;
            }
        }
    }
    // with nothing to judge, stay silent per RFC 8415 Section 18.3.3
    if checked == 0 {
        return V6Response::NoResponse(NoResponseReason::Discarded);
    }

    let mut reply = Message::new_with_id(MessageType::Reply, msg.xid());
    if off_link == 0 {
        reply
            .opts_mut()
            .insert(status_code(Status::Success, "all addresses on-link"));
    } else {
        info!(checked, off_link, "confirm rejected, client moved links");
        reply
            .opts_mut()
            .insert(status_code(Status::NotOnLink, "addresses not on-link"));
    }
    finish_reply(&mut reply, config, client_id);
    V6Response::Message(reply)
}

pub fn handle_message(
    config: &Config,
    db: &mut AddrDb,
    msg: &Message,
    src: &SocketAddrV6,
) -> V6Response {
    match msg.msg_type() {
        // Solicit locates servers; Advertise or (rapid commit) Reply comes back
        // https://datatracker.ietf.org/doc/html/rfc8415#section-16.2
        MessageType::Solicit => handle_solicit(config, db, msg, src),
        // the committing leg of the four message exchange
        MessageType::Request => handle_request(config, db, msg, src),
        MessageType::Renew => handle_renew(config, db, msg),
        MessageType::Rebind => handle_rebind(config, db, msg),
        MessageType::Release => handle_release(config, db, msg),
        MessageType::Decline => handle_decline(config, db, msg),
        MessageType::Confirm => handle_confirm(config, msg),
        // server-originated and relay-level types never reach this point
        other => {
            error!("MessageType `{other:?}` not handled by driftdhcp");
            V6Response::NoResponse(NoResponseReason::Discarded)
        }
    }
}
