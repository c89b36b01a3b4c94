//! Candidate selection for new leases. The database's free/used queries are
//! the authority; this module only proposes candidates out of the configured
//! pools, honouring client hints when possible.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::debug;

use crate::addrdb::AddrDb;

/// Upper bound on probes per allocation, so a densely used pool cannot
/// stall the worker.
const MAX_PROBES: u128 = 4096;

/// Pick a free address from `pool`. A hinted address wins when it lies in
/// the pool and nobody holds it; otherwise candidates are probed upward from
/// the pool base (skipping the base itself).
pub fn pick_address(db: &AddrDb, pool: &Ipv6Net, hint: Option<Ipv6Addr>) -> Option<Ipv6Addr> {
    if let Some(addr) = hint {
        if pool.contains(&addr) && !addr.is_unspecified() && db.address_is_free(addr) {
            debug!(%addr, "honouring client address hint");
            return Some(addr);
        }
    }
    let base = u128::from(pool.network());
    let span = match 128 - pool.prefix_len() {
        0 => 0u128,
        128 => u128::MAX,
        host_bits => (1u128 << host_bits) - 1,
    };
    for offset in 1..=span.min(MAX_PROBES) {
        let candidate = Ipv6Addr::from(base + offset);
        if db.address_is_free(candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Pick a free `/length` prefix out of `pool`. A hinted base wins when it is
/// a properly aligned sub-prefix of the pool and free.
pub fn pick_prefix(
    db: &AddrDb,
    pool: &Ipv6Net,
    length: u8,
    hint: Option<Ipv6Addr>,
) -> Option<Ipv6Addr> {
    if length == 0 || length > 128 || length < pool.prefix_len() {
        return None;
    }
    if let Some(base) = hint {
        if pool.contains(&base)
            && !base.is_unspecified()
            && aligned(base, length)
            && db.prefix_is_free(base)
        {
            debug!(prefix = %base, length, "honouring client prefix hint");
            return Some(base);
        }
    }
    let base = u128::from(pool.network());
    let step = if length == 128 {
        1u128
    } else {
        1u128 << (128 - length)
    };
    let slots = {
        let bits = length - pool.prefix_len();
        if u128::from(bits) >= MAX_PROBES.trailing_zeros() as u128 {
            MAX_PROBES
        } else {
            1u128 << bits
        }
    };
    for i in 0..slots.min(MAX_PROBES) {
        let candidate = Ipv6Addr::from(base + i * step);
        if db.prefix_is_free(candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Is `base` clean below its prefix length?
fn aligned(base: Ipv6Addr, length: u8) -> bool {
    if length == 128 {
        return true;
    }
    u128::from(base) & ((1u128 << (128 - length)) - 1) == 0
}
