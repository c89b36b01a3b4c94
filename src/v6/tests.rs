#![cfg(test)]

use std::net::{Ipv6Addr, SocketAddrV6};

use dhcproto::v6::{
    DhcpOption, DhcpOptions, IAAddr, IAPrefix, Message, MessageType, Status, IANA, IAPD,
};
use ipnet::Ipv6Net;

use crate::addrdb::{AddrDb, IaKind};
use crate::config::Config;
use crate::v6::extensions::MessageExtV6;
use crate::v6::handlers::{handle_message, V6Response};
use crate::Duid;

const CLIENT_DUID: [u8; 3] = [0xaa, 0xbb, 0xcc];

fn create_env() -> (Config, AddrDb) {
    let config = Config {
        server_duid: Duid::from(vec![0, 1, 2, 3]),
        addr_pool: "2001:db8:1::/64".parse().unwrap(),
        pd_pool: "2001:db8:8000::/40".parse().unwrap(),
        pd_length: 56,
        ..Default::default()
    };
    (config, AddrDb::new("test-db.xml"))
}

fn src() -> SocketAddrV6 {
    SocketAddrV6::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1), 546, 0, 3)
}

fn base_message(msg_type: MessageType, with_server_id: Option<&Config>) -> Message {
    let mut msg = Message::new(msg_type);
    let opts = msg.opts_mut();
    opts.insert(DhcpOption::ClientId(CLIENT_DUID.to_vec()));
    if let Some(config) = with_server_id {
        opts.insert(DhcpOption::ServerId(config.server_duid.bytes.clone()));
    }
    msg
}

fn empty_iana(id: u32) -> DhcpOption {
    DhcpOption::IANA(IANA {
        id,
        t1: 0,
        t2: 0,
        opts: DhcpOptions::new(),
    })
}

fn iana_with_addr(id: u32, addr: Ipv6Addr) -> DhcpOption {
    let mut o = DhcpOptions::new();
    o.insert(DhcpOption::IAAddr(IAAddr {
        addr,
        preferred_life: 100,
        valid_life: 200,
        opts: DhcpOptions::new(),
    }));
    DhcpOption::IANA(IANA {
        id,
        t1: 0,
        t2: 0,
        opts: o,
    })
}

fn empty_iapd(id: u32) -> DhcpOption {
    DhcpOption::IAPD(IAPD {
        id,
        t1: 0,
        t2: 0,
        opts: DhcpOptions::new(),
    })
}

fn iapd_with_prefix(id: u32, prefix: Ipv6Net) -> DhcpOption {
    let mut o = DhcpOptions::new();
    o.insert(DhcpOption::IAPrefix(IAPrefix {
        prefix_ip: prefix.addr(),
        prefix_len: prefix.prefix_len(),
        preferred_lifetime: 100,
        valid_lifetime: 200,
        opts: DhcpOptions::new(),
    }));
    DhcpOption::IAPD(IAPD {
        id,
        t1: 0,
        t2: 0,
        opts: o,
    })
}

fn expect_reply(response: V6Response) -> Message {
    match response {
        V6Response::Message(msg) => msg,
        V6Response::NoResponse(reason) => panic!("expected a message, got {}", reason.as_str()),
    }
}

fn first_addr(msg: &Message) -> Option<Ipv6Addr> {
    msg.ia_nas().first().and_then(|iana| {
        iana.opts.iter().find_map(|opt| match opt {
            DhcpOption::IAAddr(a) => Some(a.addr),
            _ => None,
        })
    })
}

fn first_prefix(msg: &Message) -> Option<(Ipv6Addr, u8)> {
    msg.ia_pds().first().and_then(|iapd| {
        iapd.opts.iter().find_map(|opt| match opt {
            DhcpOption::IAPrefix(p) => Some((p.prefix_ip, p.prefix_len)),
            _ => None,
        })
    })
}

fn ia_status(msg: &Message, id: u32) -> Option<Status> {
    msg.ia_nas()
        .iter()
        .find(|iana| iana.id == id)
        .and_then(|iana| {
            iana.opts.iter().find_map(|opt| match opt {
                DhcpOption::StatusCode(code) => Some(code.status),
                _ => None,
            })
        })
}

#[test]
fn solicit_advertises_without_committing() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Solicit, None);
    msg.opts_mut().insert(empty_iana(314));
    msg.opts_mut().insert(empty_iapd(2718));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    assert!(matches!(resp.msg_type(), MessageType::Advertise));

    // IAIDs echoed
    assert_eq!(resp.ia_nas()[0].id, 314);
    assert_eq!(resp.ia_pds()[0].id, 2718);
    assert_eq!(resp.ia_nas()[0].t1, config.t1);
    assert_eq!(resp.ia_nas()[0].t2, config.t2);

    // offered out of the configured pools
    let offered = first_addr(&resp).unwrap();
    assert!(config.addr_pool.contains(&offered));
    let (prefix, length) = first_prefix(&resp).unwrap();
    assert!(config.pd_pool.contains(&prefix));
    assert_eq!(length, config.pd_length);

    // an Advertise is a proposal, not a lease
    assert_eq!(db.count_clients(), 0);
    assert!(db.address_is_free(offered));
}

#[test]
fn advertise_includes_preference_option() {
    let (mut config, mut db) = create_env();
    config.preference = 255;
    let mut msg = base_message(MessageType::Solicit, None);
    msg.opts_mut().insert(empty_iana(1));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    let preference = resp
        .opts()
        .iter()
        .find_map(|opt| match opt {
            DhcpOption::Preference(p) => Some(*p),
            _ => None,
        })
        .expect("Advertise should carry a Preference option");
    assert_eq!(preference, 255);
}

#[test]
fn rapid_commit_solicit_commits_a_lease() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Solicit, None);
    msg.opts_mut().insert(DhcpOption::RapidCommit);
    msg.opts_mut().insert(empty_iana(7));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    assert!(matches!(resp.msg_type(), MessageType::Reply));
    assert!(resp
        .opts()
        .iter()
        .any(|opt| matches!(opt, DhcpOption::RapidCommit)));

    let leased = first_addr(&resp).unwrap();
    assert!(!db.address_is_free(leased));
    let client = db.get_client_by_duid(&Duid::from(CLIENT_DUID.to_vec())).unwrap();
    assert!(client.get_ia(IaKind::Na, 7).is_some());
}

#[test]
fn rapid_commit_can_be_disabled() {
    let (mut config, mut db) = create_env();
    config.rapid_commit = false;
    let mut msg = base_message(MessageType::Solicit, None);
    msg.opts_mut().insert(DhcpOption::RapidCommit);
    msg.opts_mut().insert(empty_iana(7));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    assert!(matches!(resp.msg_type(), MessageType::Advertise));
    assert_eq!(db.count_clients(), 0);
}

#[test]
fn solicit_with_server_id_is_dropped() {
    let (config, mut db) = create_env();
    let msg = base_message(MessageType::Solicit, Some(&config));
    assert!(matches!(
        handle_message(&config, &mut db, &msg, &src()),
        V6Response::NoResponse(_)
    ));
}

#[test]
fn solicit_without_client_id_is_dropped() {
    let (config, mut db) = create_env();
    let msg = Message::new(MessageType::Solicit);
    assert!(matches!(
        handle_message(&config, &mut db, &msg, &src()),
        V6Response::NoResponse(_)
    ));
}

#[test]
fn request_commits_address_and_prefix() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Request, Some(&config));
    msg.opts_mut().insert(empty_iana(10));
    msg.opts_mut().insert(empty_iapd(20));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    assert!(matches!(resp.msg_type(), MessageType::Reply));
    assert_eq!(resp.ia_nas()[0].id, 10);
    assert_eq!(resp.ia_pds()[0].id, 20);

    let leased = first_addr(&resp).unwrap();
    let (prefix, length) = first_prefix(&resp).unwrap();
    assert!(!db.address_is_free(leased));
    assert!(!db.prefix_is_free(prefix));
    assert_eq!(length, config.pd_length);

    let duid = Duid::from(CLIENT_DUID.to_vec());
    let client = db.get_client_by_duid(&duid).unwrap();
    assert_eq!(client.count(IaKind::Na), 1);
    assert_eq!(client.count(IaKind::Pd), 1);
    // source address and interface recorded on the association
    assert_eq!(client.last_unicast(), Some(*src().ip()));
    assert_eq!(client.get_ia(IaKind::Na, 10).unwrap().iface(), 3);
    assert_eq!(
        client.get_ia(IaKind::Na, 10).unwrap().unicast(),
        Some(*src().ip())
    );
}

#[test]
fn request_honours_a_free_in_pool_hint() {
    let (config, mut db) = create_env();
    let wanted: Ipv6Addr = "2001:db8:1::1234".parse().unwrap();
    let mut msg = base_message(MessageType::Request, Some(&config));
    msg.opts_mut().insert(iana_with_addr(1, wanted));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    assert_eq!(first_addr(&resp), Some(wanted));
    assert!(!db.address_is_free(wanted));
}

#[test]
fn request_without_server_id_is_dropped() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Request, None);
    msg.opts_mut().insert(empty_iana(1));
    assert!(matches!(
        handle_message(&config, &mut db, &msg, &src()),
        V6Response::NoResponse(_)
    ));
}

#[test]
fn request_for_another_server_is_dropped() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Request, None);
    msg.opts_mut()
        .insert(DhcpOption::ServerId(vec![9, 9, 9, 9]));
    msg.opts_mut().insert(empty_iana(1));
    assert!(matches!(
        handle_message(&config, &mut db, &msg, &src()),
        V6Response::NoResponse(_)
    ));
    assert_eq!(db.count_clients(), 0);
}

#[test]
fn repeated_request_refreshes_instead_of_duplicating() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Request, Some(&config));
    msg.opts_mut().insert(empty_iana(1));
    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    let leased = first_addr(&resp).unwrap();

    // same client re-requests the very address it was given
    let mut again = base_message(MessageType::Request, Some(&config));
    again.opts_mut().insert(iana_with_addr(1, leased));
    let resp = expect_reply(handle_message(&config, &mut db, &again, &src()));
    assert_eq!(first_addr(&resp), Some(leased));

    let client = db.get_client_by_duid(&Duid::from(CLIENT_DUID.to_vec())).unwrap();
    assert_eq!(client.get_ia(IaKind::Na, 1).unwrap().count_addrs(), 1);
}

#[test]
fn lease_cap_limits_a_greedy_client() {
    let (mut config, mut db) = create_env();
    config.client_max_leases = 1;

    let mut msg = base_message(MessageType::Request, Some(&config));
    msg.opts_mut().insert(empty_iana(1));
    expect_reply(handle_message(&config, &mut db, &msg, &src()));

    let mut msg = base_message(MessageType::Request, Some(&config));
    msg.opts_mut().insert(empty_iana(2));
    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    assert_eq!(ia_status(&resp, 2), Some(Status::NoAddrsAvail));

    let client = db.get_client_by_duid(&Duid::from(CLIENT_DUID.to_vec())).unwrap();
    assert_eq!(client.ias(IaKind::Na).map(|ia| ia.count_addrs()).sum::<usize>(), 1);
}

#[test]
fn renew_refreshes_known_bindings() {
    let (config, mut db) = create_env();
    let duid = Duid::from(CLIENT_DUID.to_vec());
    let addr: Ipv6Addr = "2001:db8:1::42".parse().unwrap();
    db.add_address(&duid, None, 3, 5, 100, 200, addr, 300, 600, true)
        .unwrap();

    let mut msg = base_message(MessageType::Renew, Some(&config));
    msg.opts_mut().insert(iana_with_addr(5, addr));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    assert!(matches!(resp.msg_type(), MessageType::Reply));
    assert_eq!(first_addr(&resp), Some(addr));

    let ia = db
        .get_client_by_duid(&duid)
        .unwrap()
        .get_ia(IaKind::Na, 5)
        .unwrap();
    assert_eq!(ia.t1(), config.t1);
    assert_eq!(ia.t2(), config.t2);
    let lease = ia.get_addr(addr).unwrap();
    assert_eq!(lease.pref(), config.preferred_lifetime);
    assert_eq!(lease.valid(), config.valid_lifetime);
}

#[test]
fn renew_unknown_ia_returns_no_binding_inside_the_ia() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Renew, Some(&config));
    msg.opts_mut()
        .insert(iana_with_addr(1, "2001:db8:1::77".parse().unwrap()));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));

    // no message-level status code
    assert!(!resp
        .opts()
        .iter()
        .any(|opt| matches!(opt, DhcpOption::StatusCode(_))));
    assert_eq!(ia_status(&resp, 1), Some(Status::NoBinding));

    // echoed address has zeroed lifetimes
    let iana = resp.ia_nas()[0];
    let addr = iana
        .opts
        .iter()
        .find_map(|opt| match opt {
            DhcpOption::IAAddr(a) => Some(a),
            _ => None,
        })
        .unwrap();
    assert_eq!(addr.preferred_life, 0);
    assert_eq!(addr.valid_life, 0);
}

#[test]
fn renew_unknown_prefix_ia_returns_no_binding() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Renew, Some(&config));
    msg.opts_mut()
        .insert(iapd_with_prefix(9, "2001:db8:8000:100::/56".parse().unwrap()));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    let iapd = resp.ia_pds()[0];
    let status = iapd
        .opts
        .iter()
        .find_map(|opt| match opt {
            DhcpOption::StatusCode(code) => Some(code.status),
            _ => None,
        })
        .unwrap();
    assert_eq!(status, Status::NoBinding);
    let prefix = iapd
        .opts
        .iter()
        .find_map(|opt| match opt {
            DhcpOption::IAPrefix(p) => Some(p),
            _ => None,
        })
        .unwrap();
    assert_eq!(prefix.preferred_lifetime, 0);
    assert_eq!(prefix.valid_lifetime, 0);
}

#[test]
fn rebind_works_without_server_id() {
    let (config, mut db) = create_env();
    let duid = Duid::from(CLIENT_DUID.to_vec());
    let addr: Ipv6Addr = "2001:db8:1::9".parse().unwrap();
    db.add_address(&duid, None, 3, 4, 100, 200, addr, 300, 600, true)
        .unwrap();

    let mut msg = base_message(MessageType::Rebind, None);
    msg.opts_mut().insert(iana_with_addr(4, addr));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    assert!(matches!(resp.msg_type(), MessageType::Reply));
    assert_eq!(first_addr(&resp), Some(addr));
    assert_eq!(resp.ia_nas()[0].t1, config.t1);
}

#[test]
fn renew_without_hints_extends_everything_in_the_ia() {
    let (config, mut db) = create_env();
    let duid = Duid::from(CLIENT_DUID.to_vec());
    let a1: Ipv6Addr = "2001:db8:1::a1".parse().unwrap();
    let a2: Ipv6Addr = "2001:db8:1::a2".parse().unwrap();
    db.add_address(&duid, None, 3, 6, 100, 200, a1, 300, 600, true)
        .unwrap();
    db.add_address(&duid, None, 3, 6, 100, 200, a2, 300, 600, true)
        .unwrap();

    let mut msg = base_message(MessageType::Renew, Some(&config));
    msg.opts_mut().insert(empty_iana(6));

    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    let iana = resp.ia_nas()[0];
    let returned: Vec<Ipv6Addr> = iana
        .opts
        .iter()
        .filter_map(|opt| match opt {
            DhcpOption::IAAddr(a) => Some(a.addr),
            _ => None,
        })
        .collect();
    assert_eq!(returned.len(), 2);
    assert!(returned.contains(&a1));
    assert!(returned.contains(&a2));
}

#[test]
fn release_removes_bindings_and_reaps_the_client() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Request, Some(&config));
    msg.opts_mut().insert(empty_iana(1));
    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));
    let leased = first_addr(&resp).unwrap();
    assert_eq!(db.count_clients(), 1);

    let mut release = base_message(MessageType::Release, Some(&config));
    release.opts_mut().insert(iana_with_addr(1, leased));
    let resp = expect_reply(handle_message(&config, &mut db, &release, &src()));
    assert!(matches!(resp.msg_type(), MessageType::Reply));
    assert_eq!(ia_status(&resp, 1), Some(Status::Success));

    assert!(db.address_is_free(leased));
    assert_eq!(db.count_clients(), 0);
}

#[test]
fn release_of_unknown_binding_reports_no_binding() {
    let (config, mut db) = create_env();
    let mut release = base_message(MessageType::Release, Some(&config));
    release
        .opts_mut()
        .insert(iana_with_addr(1, "2001:db8:1::dead".parse().unwrap()));
    let resp = expect_reply(handle_message(&config, &mut db, &release, &src()));
    assert_eq!(ia_status(&resp, 1), Some(Status::NoBinding));
}

#[test]
fn decline_drops_the_conflicted_address() {
    let (config, mut db) = create_env();
    let duid = Duid::from(CLIENT_DUID.to_vec());
    let addr: Ipv6Addr = "2001:db8:1::bad".parse().unwrap();
    db.add_address(&duid, None, 3, 2, 100, 200, addr, 300, 600, true)
        .unwrap();

    let mut decline = base_message(MessageType::Decline, Some(&config));
    decline.opts_mut().insert(iana_with_addr(2, addr));
    let resp = expect_reply(handle_message(&config, &mut db, &decline, &src()));
    assert_eq!(ia_status(&resp, 2), Some(Status::Success));
    assert!(db.address_is_free(addr));
}

#[test]
fn confirm_succeeds_on_link_and_rejects_off_link() {
    let (config, mut db) = create_env();

    let mut on_link = base_message(MessageType::Confirm, None);
    on_link
        .opts_mut()
        .insert(iana_with_addr(1, "2001:db8:1::5".parse().unwrap()));
    let resp = expect_reply(handle_message(&config, &mut db, &on_link, &src()));
    let status = resp
        .opts()
        .iter()
        .find_map(|opt| match opt {
            DhcpOption::StatusCode(code) => Some(code.status),
            _ => None,
        })
        .unwrap();
    assert_eq!(status, Status::Success);

    let mut moved = base_message(MessageType::Confirm, None);
    moved
        .opts_mut()
        .insert(iana_with_addr(1, "2001:db8:ffff::5".parse().unwrap()));
    let resp = expect_reply(handle_message(&config, &mut db, &moved, &src()));
    let status = resp
        .opts()
        .iter()
        .find_map(|opt| match opt {
            DhcpOption::StatusCode(code) => Some(code.status),
            _ => None,
        })
        .unwrap();
    assert_eq!(status, Status::NotOnLink);

    // confirm never touches the database
    assert_eq!(db.count_clients(), 0);
}

#[test]
fn confirm_with_nothing_to_check_stays_silent() {
    let (config, mut db) = create_env();
    let msg = base_message(MessageType::Confirm, None);
    assert!(matches!(
        handle_message(&config, &mut db, &msg, &src()),
        V6Response::NoResponse(_)
    ));
}

#[test]
fn reply_carries_server_and_client_ids() {
    let (config, mut db) = create_env();
    let mut msg = base_message(MessageType::Request, Some(&config));
    msg.opts_mut().insert(empty_iana(1));
    let resp = expect_reply(handle_message(&config, &mut db, &msg, &src()));

    assert_eq!(resp.server_id(), Some(config.server_duid.bytes.as_slice()));
    assert_eq!(resp.client_id(), Some(CLIENT_DUID.as_slice()));
}

#[test]
fn two_clients_never_share_an_address() {
    let (config, mut db) = create_env();

    let mut first = base_message(MessageType::Request, Some(&config));
    first.opts_mut().insert(empty_iana(1));
    let resp = expect_reply(handle_message(&config, &mut db, &first, &src()));
    let leased = first_addr(&resp).unwrap();

    // second client hints the address the first one holds
    let mut second = Message::new(MessageType::Request);
    second
        .opts_mut()
        .insert(DhcpOption::ClientId(vec![0xde, 0xad]));
    second
        .opts_mut()
        .insert(DhcpOption::ServerId(config.server_duid.bytes.clone()));
    second.opts_mut().insert(iana_with_addr(1, leased));

    let resp = expect_reply(handle_message(&config, &mut db, &second, &src()));
    let granted = first_addr(&resp).unwrap();
    assert_ne!(granted, leased);
    assert_eq!(db.get_client_by_leased_addr(leased).unwrap().duid(), &Duid::from(CLIENT_DUID.to_vec()));
}
