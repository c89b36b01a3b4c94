use std::fmt;
use std::net::Ipv6Addr;

use crate::Duid;

use super::resource::{remaining, LeasedAddress, LeasedPrefix, Tentative};
use super::AddrDbError;

/// The three identity-association flavours of RFC 8415. `Na` and `Ta` carry
/// addresses, `Pd` carries delegated prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IaKind {
    Na,
    Ta,
    Pd,
}

impl fmt::Display for IaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IaKind::Na => "IA_NA",
            IaKind::Ta => "IA_TA",
            IaKind::Pd => "IA_PD",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IaState {
    #[default]
    NotConfigured,
    /// Leases in this association are live.
    Configured,
    /// Restored from disk; must be re-confirmed with the peer before use.
    ConfirmMe,
    Failed,
}

/// An identity association: an IAID-scoped bundle of leases within a client,
/// carrying the T1/T2 renew/rebind timers.
///
/// The child collection is homogeneous per `IaKind`; address calls against a
/// `Pd` association (and vice versa) are rejected with `WrongIaVariant`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ia {
    kind: IaKind,
    iaid: u32,
    iface: i32,
    t1: u32,
    t2: u32,
    state: IaState,
    /// Unix seconds of the last lease refresh.
    timestamp: u64,
    /// Address the peer talked to us from, when known.
    unicast: Option<Ipv6Addr>,
    /// DUID of the other side of this association.
    duid: Duid,
    tentative: Tentative,
    addrs: Vec<LeasedAddress>,
    prefixes: Vec<LeasedPrefix>,
}

impl Ia {
    pub fn new(
        kind: IaKind,
        iface: i32,
        unicast: Option<Ipv6Addr>,
        duid: Duid,
        t1: u32,
        t2: u32,
        iaid: u32,
    ) -> Self {
        Ia {
            kind,
            iaid,
            iface,
            t1,
            t2,
            state: IaState::NotConfigured,
            timestamp: crate::unix_now(),
            unicast,
            duid,
            tentative: Tentative::Unknown,
            addrs: Vec::new(),
            prefixes: Vec::new(),
        }
    }

    pub fn kind(&self) -> IaKind {
        self.kind
    }

    pub fn iaid(&self) -> u32 {
        self.iaid
    }

    pub fn iface(&self) -> i32 {
        self.iface
    }

    pub fn t1(&self) -> u32 {
        self.t1
    }

    pub fn t2(&self) -> u32 {
        self.t2
    }

    pub fn state(&self) -> IaState {
        self.state
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn unicast(&self) -> Option<Ipv6Addr> {
        self.unicast
    }

    pub fn duid(&self) -> &Duid {
        &self.duid
    }

    pub fn tentative(&self) -> Tentative {
        self.tentative
    }

    pub fn set_t1(&mut self, t1: u32) {
        self.t1 = t1;
    }

    pub fn set_t2(&mut self, t2: u32) {
        self.t2 = t2;
    }

    pub fn set_state(&mut self, state: IaState) {
        self.state = state;
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    pub fn set_unicast(&mut self, unicast: Option<Ipv6Addr>) {
        self.unicast = unicast;
    }

    pub fn set_duid(&mut self, duid: Duid) {
        self.duid = duid;
    }

    /// Recompute the association's tentative flag from its children: `Yes`
    /// if any child is tentative, else `Unknown` if any child is undecided.
    pub fn set_tentative(&mut self) {
        let mut result = Tentative::No;
        let children = self
            .addrs
            .iter()
            .map(LeasedAddress::tentative)
            .chain(self.prefixes.iter().map(LeasedPrefix::tentative));
        for t in children {
            match t {
                Tentative::Yes => {
                    self.tentative = Tentative::Yes;
                    return;
                }
                Tentative::Unknown => result = Tentative::Unknown,
                Tentative::No => {}
            }
        }
        self.tentative = result;
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.prefixes.is_empty()
    }

    // --- address children (Na/Ta) ---

    pub fn add_addr(&mut self, lease: LeasedAddress) -> Result<(), AddrDbError> {
        if self.kind == IaKind::Pd {
            return Err(AddrDbError::WrongIaVariant { kind: self.kind });
        }
        if self.get_addr(lease.addr()).is_some() {
            return Err(AddrDbError::AlreadyAssigned(lease.addr()));
        }
        self.addrs.push(lease);
        self.set_tentative();
        Ok(())
    }

    pub fn get_addr(&self, addr: Ipv6Addr) -> Option<&LeasedAddress> {
        self.addrs.iter().find(|a| a.addr() == addr)
    }

    pub fn get_addr_mut(&mut self, addr: Ipv6Addr) -> Option<&mut LeasedAddress> {
        self.addrs.iter_mut().find(|a| a.addr() == addr)
    }

    pub fn del_addr(&mut self, addr: Ipv6Addr) -> bool {
        let before = self.addrs.len();
        self.addrs.retain(|a| a.addr() != addr);
        let deleted = self.addrs.len() != before;
        if deleted {
            self.set_tentative();
        }
        deleted
    }

    pub fn count_addrs(&self) -> usize {
        self.addrs.len()
    }

    pub fn addrs(&self) -> impl Iterator<Item = &LeasedAddress> {
        self.addrs.iter()
    }

    // --- prefix children (Pd) ---

    pub fn add_prefix(&mut self, lease: LeasedPrefix) -> Result<(), AddrDbError> {
        if self.kind != IaKind::Pd {
            return Err(AddrDbError::WrongIaVariant { kind: self.kind });
        }
        if self
            .prefixes
            .iter()
            .any(|p| p.prefix() == lease.prefix() && p.length() == lease.length())
        {
            return Err(AddrDbError::AlreadyAssigned(lease.prefix()));
        }
        self.prefixes.push(lease);
        self.set_tentative();
        Ok(())
    }

    pub fn get_prefix(&self, prefix: Ipv6Addr) -> Option<&LeasedPrefix> {
        self.prefixes.iter().find(|p| p.prefix() == prefix)
    }

    pub fn get_prefix_mut(&mut self, prefix: Ipv6Addr) -> Option<&mut LeasedPrefix> {
        self.prefixes.iter_mut().find(|p| p.prefix() == prefix)
    }

    pub fn del_prefix(&mut self, prefix: Ipv6Addr) -> bool {
        let before = self.prefixes.len();
        self.prefixes.retain(|p| p.prefix() != prefix);
        let deleted = self.prefixes.len() != before;
        if deleted {
            self.set_tentative();
        }
        deleted
    }

    pub fn count_prefixes(&self) -> usize {
        self.prefixes.len()
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &LeasedPrefix> {
        self.prefixes.iter()
    }

    // --- timers ---

    pub fn t1_remaining(&self, now: u64) -> u64 {
        remaining(self.timestamp, self.t1, now)
    }

    pub fn t2_remaining(&self, now: u64) -> u64 {
        remaining(self.timestamp, self.t2, now)
    }

    pub fn preferred_remaining(&self, now: u64) -> u64 {
        self.addrs
            .iter()
            .map(|a| a.preferred_remaining(now))
            .chain(self.prefixes.iter().map(|p| p.preferred_remaining(now)))
            .min()
            .unwrap_or(u64::MAX)
    }

    pub fn valid_remaining(&self, now: u64) -> u64 {
        self.addrs
            .iter()
            .map(|a| a.valid_remaining(now))
            .chain(self.prefixes.iter().map(|p| p.valid_remaining(now)))
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Drop every child whose valid lifetime has elapsed. Returns the number
    /// of leases removed.
    pub fn sweep_expired(&mut self, now: u64) -> usize {
        let before = self.addrs.len() + self.prefixes.len();
        self.addrs.retain(|a| !a.expired(now));
        self.prefixes.retain(|p| !p.expired(now));
        let removed = before - self.addrs.len() - self.prefixes.len();
        if removed > 0 {
            self.set_tentative();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn na() -> Ia {
        Ia::new(IaKind::Na, 2, None, Duid::from(vec![1, 2, 3]), 1000, 1600, 42)
    }

    #[test]
    fn cross_variant_calls_are_rejected() {
        let mut pd = Ia::new(IaKind::Pd, 2, None, Duid::default(), 100, 200, 1);
        let err = pd
            .add_addr(LeasedAddress::new("2001:db8::1".parse().unwrap(), 100, 200))
            .unwrap_err();
        assert!(matches!(err, AddrDbError::WrongIaVariant { kind: IaKind::Pd }));

        let mut ia = na();
        let err = ia
            .add_prefix(LeasedPrefix::new(
                "2001:db8:1::".parse().unwrap(),
                48,
                100,
                200,
            ))
            .unwrap_err();
        assert!(matches!(err, AddrDbError::WrongIaVariant { kind: IaKind::Na }));
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let mut ia = na();
        let addr = "2001:db8::1".parse().unwrap();
        ia.add_addr(LeasedAddress::new(addr, 100, 200)).unwrap();
        let err = ia.add_addr(LeasedAddress::new(addr, 300, 600)).unwrap_err();
        assert!(matches!(err, AddrDbError::AlreadyAssigned(a) if a == addr));
        assert_eq!(ia.count_addrs(), 1);
    }

    #[test]
    fn same_base_different_length_prefixes_coexist() {
        let mut pd = Ia::new(IaKind::Pd, 2, None, Duid::default(), 100, 200, 1);
        let base = "2001:db8:1::".parse().unwrap();
        pd.add_prefix(LeasedPrefix::new(base, 48, 100, 200)).unwrap();
        pd.add_prefix(LeasedPrefix::new(base, 56, 100, 200)).unwrap();
        assert!(pd
            .add_prefix(LeasedPrefix::new(base, 48, 100, 200))
            .is_err());
        assert_eq!(pd.count_prefixes(), 2);
    }

    #[test]
    fn tentative_recomputed_from_children() {
        let mut ia = na();
        let mut a = LeasedAddress::new("2001:db8::1".parse().unwrap(), 100, 200);
        a.set_tentative(Tentative::No);
        let mut b = LeasedAddress::new("2001:db8::2".parse().unwrap(), 100, 200);
        b.set_tentative(Tentative::Yes);
        ia.add_addr(a).unwrap();
        assert_eq!(ia.tentative(), Tentative::No);
        ia.add_addr(b).unwrap();
        assert_eq!(ia.tentative(), Tentative::Yes);
        assert!(ia.del_addr("2001:db8::2".parse().unwrap()));
        assert_eq!(ia.tentative(), Tentative::No);
    }

    #[test]
    fn sweep_drops_only_expired() {
        let mut ia = na();
        let mut fresh = LeasedAddress::new("2001:db8::1".parse().unwrap(), 100, 200);
        fresh.set_timestamp(1000);
        let mut stale = LeasedAddress::new("2001:db8::2".parse().unwrap(), 100, 200);
        stale.set_timestamp(100);
        ia.add_addr(fresh).unwrap();
        ia.add_addr(stale).unwrap();

        assert_eq!(ia.sweep_expired(1100), 1);
        assert!(ia.get_addr("2001:db8::1".parse().unwrap()).is_some());
        assert!(ia.get_addr("2001:db8::2".parse().unwrap()).is_none());
    }
}
