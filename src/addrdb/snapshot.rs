//! On-disk form of the lease database: a line-oriented pseudo-XML file,
//! written one element per line and read back by substring scanning. The
//! reader recovers at element granularity: a malformed lease line loses that
//! lease, a malformed association loses that association, a malformed client
//! loses that client, and nothing aborts the load.

use std::fs;
use std::io::{self, Write};
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{unix_now, Duid, INFINITY};

use super::client::ClientRecord;
use super::ia::{Ia, IaKind, IaState};
use super::resource::{LeasedAddress, LeasedPrefix, Tentative};
use super::{AddrDb, AddrDbError};

/// Prefix-length hint assumed for addresses restored without one.
const DEFAULT_PREFIX_HINT: u8 = 64;

// --- writer ---

pub(super) fn render(db: &AddrDb) -> String {
    let mut out = String::new();
    out.push_str("<AddrMgr>\n");
    out.push_str(&format!("  <timestamp>{}</timestamp>\n", unix_now()));
    for client in db.clients() {
        render_client(&mut out, client);
    }
    out.push_str("</AddrMgr>\n");
    out
}

fn render_client(out: &mut String, client: &ClientRecord) {
    out.push_str("  <AddrClient>\n");
    out.push_str(&format!("    <duid>{}</duid>\n", client.duid()));
    for ia in client.ias(IaKind::Na) {
        render_ia(out, ia, "AddrIA", "IAID");
    }
    for ia in client.ias(IaKind::Ta) {
        render_ia(out, ia, "AddrTA", "IAID");
    }
    for ia in client.ias(IaKind::Pd) {
        render_ia(out, ia, "AddrPD", "PDID");
    }
    out.push_str("  </AddrClient>\n");
}

fn render_ia(out: &mut String, ia: &Ia, tag: &str, id_attr: &str) {
    out.push_str(&format!(
        "    <{tag} T1=\"{}\" T2=\"{}\" {id_attr}=\"{}\" iface=\"{}\">\n",
        ia.t1(),
        ia.t2(),
        ia.iaid(),
        ia.iface()
    ));
    out.push_str(&format!("      <duid>{}</duid>\n", ia.duid()));
    for addr in ia.addrs() {
        out.push_str(&format!(
            "      <AddrAddr timestamp=\"{}\" pref=\"{}\" valid=\"{}\" prefix=\"{}\">{}</AddrAddr>\n",
            addr.timestamp(),
            addr.pref(),
            addr.valid(),
            addr.prefix_hint(),
            addr.addr()
        ));
    }
    for prefix in ia.prefixes() {
        out.push_str(&format!(
            "      <AddrPrefix timestamp=\"{}\" pref=\"{}\" valid=\"{}\" length=\"{}\">{}</AddrPrefix>\n",
            prefix.timestamp(),
            prefix.pref(),
            prefix.valid(),
            prefix.length(),
            prefix.prefix()
        ));
    }
    out.push_str(&format!("    </{tag}>\n"));
}

/// Write-temp-then-rename replace. A stale temp file from a crashed write is
/// simply overwritten.
pub(super) fn write_atomic(path: &Path, contents: &str) -> Result<(), AddrDbError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let failed = |err: io::Error| AddrDbError::PersistenceWrite {
        err,
        path: path.to_path_buf(),
    };
    let mut file = fs::File::create(&tmp).map_err(failed)?;
    file.write_all(contents.as_bytes()).map_err(failed)?;
    file.flush().map_err(failed)?;
    file.sync_all().map_err(failed)?;
    fs::rename(&tmp, path).map_err(failed)?;
    debug!(path = %path.display(), "lease database dumped");
    Ok(())
}

// --- reader ---

type LineIter<'a> = &'a mut dyn Iterator<Item = io::Result<String>>;

/// Returns true once at least one client was reconstructed. Hitting EOF
/// inside any element is treated like its closing tag.
pub(super) fn restore<R: io::BufRead>(db: &mut AddrDb, reader: R) -> bool {
    let mut lines = reader.lines();
    let mut any = false;
    let mut in_db = false;
    loop {
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(%e, "snapshot read failed mid-stream");
                break;
            }
            None => break,
        };
        if line.contains("<AddrMgr>") {
            in_db = true;
            continue;
        }
        if line.contains("</AddrMgr>") {
            break;
        }
        if in_db && line.contains("<AddrClient") {
            if let Some(client) = parse_client(&mut lines) {
                let duid = client.duid().clone();
                match db.add_client(client) {
                    Ok(()) => {
                        debug!(duid = %duid, "client restored from snapshot");
                        any = true;
                    }
                    Err(e) => warn!(%e, "skipping snapshot client"),
                }
            }
        }
    }
    any
}

fn parse_client(lines: LineIter) -> Option<ClientRecord> {
    let mut client: Option<ClientRecord> = None;
    let mut bad = false;
    loop {
        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };
        if line.contains("</AddrClient>") {
            break;
        }
        if line.contains("<duid>") {
            match tag_text(&line, "<duid>", "</duid>").and_then(|t| t.parse::<Duid>().ok()) {
                Some(duid) if client.is_none() && !bad => {
                    client = Some(ClientRecord::new(duid));
                }
                Some(_) => {}
                None => {
                    warn!(%line, "malformed client duid, skipping client");
                    bad = true;
                    client = None;
                }
            }
            continue;
        }
        if line.contains("<AddrIA ") {
            if let Some(ia) = parse_ia(&line, lines, IaKind::Na) {
                attach_ia(&mut client, bad, ia);
            }
            continue;
        }
        if line.contains("<AddrTA") {
            // temporary addresses are not restored
            skim_to(lines, "</AddrTA>");
            debug!("discarded temporary address section from snapshot");
            continue;
        }
        if line.contains("<AddrPD ") {
            if let Some(ia) = parse_ia(&line, lines, IaKind::Pd) {
                attach_ia(&mut client, bad, ia);
            }
            continue;
        }
        // unknown tags are skipped silently
    }
    if bad {
        return None;
    }
    client
}

fn attach_ia(client: &mut Option<ClientRecord>, bad: bool, ia: Ia) {
    if bad {
        return;
    }
    match client {
        Some(c) => {
            if let Err(e) = c.add_ia(ia) {
                warn!(%e, "skipping snapshot IA");
            }
        }
        None => warn!("IA before client duid in snapshot, dropped"),
    }
}

fn parse_ia(open_line: &str, lines: LineIter, kind: IaKind) -> Option<Ia> {
    let (id_attr, close_tag) = match kind {
        IaKind::Pd => ("PDID=", "</AddrPD>"),
        _ => ("IAID=", "</AddrIA>"),
    };
    let iaid = match scan_attr(open_line, id_attr).and_then(|v| u32::try_from(v).ok()) {
        Some(iaid) => iaid,
        None => {
            warn!(line = %open_line, "IA without usable {} attribute, skipping", id_attr);
            skim_to(lines, close_tag);
            return None;
        }
    };
    let t1 = scan_attr_u32(open_line, "T1=").unwrap_or(0);
    let t2 = scan_attr_u32(open_line, "T2=").unwrap_or(0);
    let iface = scan_attr(open_line, "iface=")
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(0);

    let mut ia = Ia::new(kind, iface, None, Duid::default(), t1, t2, iaid);
    ia.set_state(IaState::ConfirmMe);

    loop {
        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };
        if line.contains(close_tag) {
            break;
        }
        if line.contains("<duid>") {
            match tag_text(&line, "<duid>", "</duid>").and_then(|t| t.parse::<Duid>().ok()) {
                Some(duid) => ia.set_duid(duid),
                None => warn!(%line, "malformed IA duid, keeping empty one"),
            }
            continue;
        }
        if kind != IaKind::Pd && line.contains("<AddrAddr") {
            match parse_addr_line(&line) {
                Some(lease) => {
                    if let Err(e) = ia.add_addr(lease) {
                        warn!(%e, "skipping snapshot address");
                    }
                }
                None => warn!(%line, "malformed address entry, skipped"),
            }
            continue;
        }
        if kind == IaKind::Pd && line.contains("<AddrPrefix") {
            match parse_prefix_line(&line) {
                Some(lease) => {
                    if let Err(e) = ia.add_prefix(lease) {
                        warn!(%e, "skipping snapshot prefix");
                    }
                }
                None => warn!(%line, "malformed prefix entry, skipped"),
            }
            continue;
        }
    }
    ia.set_tentative();
    debug!(iaid, t1, t2, iface, "IA restored from snapshot");
    Some(ia)
}

fn parse_addr_line(line: &str) -> Option<LeasedAddress> {
    let timestamp = scan_attr(line, "timestamp=")?;
    let pref = scan_attr_u32(line, "pref=").unwrap_or(INFINITY);
    let valid = scan_attr_u32(line, "valid=").unwrap_or(INFINITY);
    let hint = match scan_attr(line, "prefix=") {
        Some(v) => u8::try_from(v).ok().filter(|h| *h <= 128)?,
        None => DEFAULT_PREFIX_HINT,
    };
    let addr: Ipv6Addr = tag_text(line, ">", "</AddrAddr>")?.trim().parse().ok()?;

    let mut lease = LeasedAddress::new(addr, pref, valid);
    lease.set_timestamp(timestamp);
    lease.set_prefix_hint(hint);
    lease.set_tentative(Tentative::No);
    Some(lease)
}

fn parse_prefix_line(line: &str) -> Option<LeasedPrefix> {
    let timestamp = scan_attr(line, "timestamp=")?;
    let pref = scan_attr_u32(line, "pref=").unwrap_or(INFINITY);
    let valid = scan_attr_u32(line, "valid=").unwrap_or(INFINITY);
    let length = u8::try_from(scan_attr(line, "length=")?)
        .ok()
        .filter(|l| *l <= 128)?;
    let prefix: Ipv6Addr = tag_text(line, ">", "</AddrPrefix>")?.trim().parse().ok()?;

    let mut lease = LeasedPrefix::new(prefix, length, pref, valid);
    lease.set_timestamp(timestamp);
    lease.set_tentative(Tentative::No);
    Some(lease)
}

/// Consume lines until one containing `close_tag` (or EOF).
fn skim_to(lines: LineIter, close_tag: &str) {
    loop {
        match lines.next() {
            Some(Ok(line)) if line.contains(close_tag) => break,
            Some(Ok(_)) => continue,
            _ => break,
        }
    }
}

/// Find `key` (e.g. `T1=`) and parse the decimal value right behind it,
/// tolerating the quote the writer emits. Unknown attributes on a line are
/// simply never scanned for.
fn scan_attr(line: &str, key: &str) -> Option<u64> {
    let at = line.find(key)? + key.len();
    let rest = line[at..].strip_prefix('"').unwrap_or(&line[at..]);
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    rest[..end].parse().ok()
}

fn scan_attr_u32(line: &str, key: &str) -> Option<u32> {
    scan_attr(line, key).and_then(|v| u32::try_from(v).ok())
}

/// Text strictly between the first `open` and the following `close`.
fn tag_text<'a>(line: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = line.find(open)? + open.len();
    let end = line[start..].find(close)? + start;
    Some(&line[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_attr_handles_quotes_and_neighbours() {
        let line = r#"      <AddrAddr timestamp="1000" valid="200" prefix="64">2001:db8::1</AddrAddr>"#;
        assert_eq!(scan_attr(line, "timestamp="), Some(1000));
        assert_eq!(scan_attr(line, "valid="), Some(200));
        // `pref=` must not match inside `prefix=`
        assert_eq!(scan_attr(line, "pref="), None);
        assert_eq!(scan_attr(line, "prefix="), Some(64));
        assert_eq!(scan_attr(line, "length="), None);
    }

    #[test]
    fn addr_line_defaults_to_infinite_lifetimes() {
        let lease =
            parse_addr_line(r#"<AddrAddr timestamp="5">2001:db8::7</AddrAddr>"#).unwrap();
        assert_eq!(lease.pref(), INFINITY);
        assert_eq!(lease.valid(), INFINITY);
        assert_eq!(lease.prefix_hint(), DEFAULT_PREFIX_HINT);
        assert_eq!(lease.timestamp(), 5);
    }

    #[test]
    fn addr_line_without_timestamp_is_malformed() {
        assert!(parse_addr_line(r#"<AddrAddr pref="1" valid="2">2001:db8::7</AddrAddr>"#).is_none());
        assert!(parse_addr_line(r#"<AddrAddr timestamp="1">not-an-address</AddrAddr>"#).is_none());
    }

    #[test]
    fn prefix_line_requires_sane_length() {
        let ok = parse_prefix_line(
            r#"<AddrPrefix timestamp="9" pref="10" valid="20" length="56">2001:db8:ff::</AddrPrefix>"#,
        )
        .unwrap();
        assert_eq!(ok.length(), 56);
        assert!(parse_prefix_line(
            r#"<AddrPrefix timestamp="9" pref="10" valid="20" length="200">2001:db8:ff::</AddrPrefix>"#,
        )
        .is_none());
    }
}
