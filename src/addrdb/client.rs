use std::net::Ipv6Addr;

use crate::Duid;

use super::ia::{Ia, IaKind};
use super::AddrDbError;

/// Everything the server knows about one DHCP participant, keyed by DUID:
/// its non-temporary, temporary and prefix-delegation associations plus a
/// couple of per-client attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    duid: Duid,
    /// Security Parameters Index, populated once an authentication
    /// subsystem exists. Nothing sets it today.
    spi: Option<u32>,
    last_unicast: Option<Ipv6Addr>,
    ia_na: Vec<Ia>,
    ia_ta: Vec<Ia>,
    ia_pd: Vec<Ia>,
}

impl ClientRecord {
    pub fn new(duid: Duid) -> Self {
        ClientRecord {
            duid,
            spi: None,
            last_unicast: None,
            ia_na: Vec::new(),
            ia_ta: Vec::new(),
            ia_pd: Vec::new(),
        }
    }

    pub fn duid(&self) -> &Duid {
        &self.duid
    }

    pub fn spi(&self) -> Option<u32> {
        self.spi
    }

    pub fn set_spi(&mut self, spi: Option<u32>) {
        self.spi = spi;
    }

    pub fn last_unicast(&self) -> Option<Ipv6Addr> {
        self.last_unicast
    }

    pub fn set_last_unicast(&mut self, addr: Option<Ipv6Addr>) {
        self.last_unicast = addr;
    }

    fn list(&self, kind: IaKind) -> &Vec<Ia> {
        match kind {
            IaKind::Na => &self.ia_na,
            IaKind::Ta => &self.ia_ta,
            IaKind::Pd => &self.ia_pd,
        }
    }

    fn list_mut(&mut self, kind: IaKind) -> &mut Vec<Ia> {
        match kind {
            IaKind::Na => &mut self.ia_na,
            IaKind::Ta => &mut self.ia_ta,
            IaKind::Pd => &mut self.ia_pd,
        }
    }

    pub fn add_ia(&mut self, ia: Ia) -> Result<(), AddrDbError> {
        if self.get_ia(ia.kind(), ia.iaid()).is_some() {
            return Err(AddrDbError::DuplicateIaid {
                kind: ia.kind(),
                iaid: ia.iaid(),
            });
        }
        self.list_mut(ia.kind()).push(ia);
        Ok(())
    }

    pub fn get_ia(&self, kind: IaKind, iaid: u32) -> Option<&Ia> {
        self.list(kind).iter().find(|ia| ia.iaid() == iaid)
    }

    pub fn get_ia_mut(&mut self, kind: IaKind, iaid: u32) -> Option<&mut Ia> {
        self.list_mut(kind).iter_mut().find(|ia| ia.iaid() == iaid)
    }

    pub fn del_ia(&mut self, kind: IaKind, iaid: u32) -> bool {
        let list = self.list_mut(kind);
        let before = list.len();
        list.retain(|ia| ia.iaid() != iaid);
        list.len() != before
    }

    pub fn count(&self, kind: IaKind) -> usize {
        self.list(kind).len()
    }

    pub fn ias(&self, kind: IaKind) -> impl Iterator<Item = &Ia> {
        self.list(kind).iter()
    }

    pub(super) fn ias_mut(&mut self, kind: IaKind) -> impl Iterator<Item = &mut Ia> {
        self.list_mut(kind).iter_mut()
    }

    /// True once every association of every kind is gone.
    pub fn is_empty(&self) -> bool {
        self.ia_na.is_empty() && self.ia_ta.is_empty() && self.ia_pd.is_empty()
    }

    /// Does any address association (non-temporary or temporary) hold `addr`?
    pub fn has_leased_addr(&self, addr: Ipv6Addr) -> bool {
        self.ia_na
            .iter()
            .chain(self.ia_ta.iter())
            .any(|ia| ia.get_addr(addr).is_some())
    }

    fn all_ias(&self) -> impl Iterator<Item = &Ia> {
        self.ia_na
            .iter()
            .chain(self.ia_ta.iter())
            .chain(self.ia_pd.iter())
    }

    pub fn t1_remaining(&self, now: u64) -> u64 {
        self.all_ias()
            .map(|ia| ia.t1_remaining(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    pub fn t2_remaining(&self, now: u64) -> u64 {
        self.all_ias()
            .map(|ia| ia.t2_remaining(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    pub fn preferred_remaining(&self, now: u64) -> u64 {
        self.all_ias()
            .map(|ia| ia.preferred_remaining(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    pub fn valid_remaining(&self, now: u64) -> u64 {
        self.all_ias()
            .map(|ia| ia.valid_remaining(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Expire leases across all associations and drop associations that end
    /// up empty. Returns the number of leases removed.
    pub fn sweep_expired(&mut self, now: u64) -> usize {
        let mut removed = 0;
        for kind in [IaKind::Na, IaKind::Ta, IaKind::Pd] {
            for ia in self.ias_mut(kind) {
                removed += ia.sweep_expired(now);
            }
            self.list_mut(kind).retain(|ia| !ia.is_empty());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iaid_unique_per_kind_not_across_kinds() {
        let mut client = ClientRecord::new(Duid::from(vec![1]));
        let na = Ia::new(IaKind::Na, 1, None, Duid::default(), 100, 200, 7);
        let pd = Ia::new(IaKind::Pd, 1, None, Duid::default(), 100, 200, 7);
        client.add_ia(na).unwrap();
        client.add_ia(pd).unwrap();

        let dup = Ia::new(IaKind::Na, 1, None, Duid::default(), 300, 400, 7);
        let err = client.add_ia(dup).unwrap_err();
        assert!(matches!(
            err,
            AddrDbError::DuplicateIaid {
                kind: IaKind::Na,
                iaid: 7
            }
        ));
        assert_eq!(client.count(IaKind::Na), 1);
        assert_eq!(client.count(IaKind::Pd), 1);
    }

    #[test]
    fn del_ia_is_idempotent() {
        let mut client = ClientRecord::new(Duid::from(vec![1]));
        client
            .add_ia(Ia::new(IaKind::Na, 1, None, Duid::default(), 100, 200, 7))
            .unwrap();
        assert!(client.del_ia(IaKind::Na, 7));
        assert!(!client.del_ia(IaKind::Na, 7));
        assert!(client.is_empty());
    }
}
