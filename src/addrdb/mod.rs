//! The authoritative lease database: clients keyed by DUID, each owning its
//! identity associations, each association owning leased addresses or
//! delegated prefixes. Single writer; iteration is insertion-ordered.

use std::fmt;
use std::fs;
use std::io::{self, BufRead};
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::{unix_now, Duid, INFINITY};

mod client;
mod ia;
mod resource;
mod snapshot;

pub use client::ClientRecord;
pub use ia::{Ia, IaKind, IaState};
pub use resource::{LeasedAddress, LeasedPrefix, Tentative};

#[derive(Debug)]
pub enum AddrDbError {
    DuplicateDuid(Duid),
    DuplicateIaid { kind: IaKind, iaid: u32 },
    AlreadyAssigned(Ipv6Addr),
    UnknownClient(Duid),
    UnknownIa { kind: IaKind, iaid: u32 },
    UnknownAddress(Ipv6Addr),
    UnknownPrefix(Ipv6Addr),
    WrongIaVariant { kind: IaKind },
    NullResource,
    PersistenceRead { err: io::Error, path: PathBuf },
    PersistenceWrite { err: io::Error, path: PathBuf },
}

impl fmt::Display for AddrDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrDbError::DuplicateDuid(duid) => {
                write!(f, "client with DUID {duid} already exists")
            }
            AddrDbError::DuplicateIaid { kind, iaid } => {
                write!(f, "{kind} with iaid={iaid} already exists on this client")
            }
            AddrDbError::AlreadyAssigned(what) => write!(f, "{what} is already assigned"),
            AddrDbError::UnknownClient(duid) => write!(f, "no client with DUID {duid}"),
            AddrDbError::UnknownIa { kind, iaid } => {
                write!(f, "client has no {kind} with iaid={iaid}")
            }
            AddrDbError::UnknownAddress(addr) => write!(f, "address {addr} is not leased"),
            AddrDbError::UnknownPrefix(prefix) => write!(f, "prefix {prefix} is not leased"),
            AddrDbError::WrongIaVariant { kind } => {
                write!(f, "operation not applicable to an {kind}")
            }
            AddrDbError::NullResource => f.write_str("null address or prefix supplied"),
            AddrDbError::PersistenceRead { err, path } => {
                write!(f, "reading `{}`: {err}", path.to_string_lossy())
            }
            AddrDbError::PersistenceWrite { err, path } => {
                write!(f, "writing `{}`: {err}", path.to_string_lossy())
            }
        }
    }
}

impl std::error::Error for AddrDbError {}

/// The lease database. All mutation happens through `&mut self`; callers
/// wanting shared access wrap it in a lock and keep file I/O outside it
/// (see [`dump_locked`]).
#[derive(Debug, Clone)]
pub struct AddrDb {
    clients: Vec<ClientRecord>,
    db_path: PathBuf,
    /// Drop a client record once its last association is gone.
    pub delete_empty_clients: bool,
}

impl PartialEq for AddrDb {
    fn eq(&self, other: &Self) -> bool {
        self.clients == other.clients
    }
}

impl AddrDb {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        AddrDb {
            clients: Vec::new(),
            db_path: db_path.into(),
            delete_empty_clients: true,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // --- client store ---

    pub fn add_client(&mut self, client: ClientRecord) -> Result<(), AddrDbError> {
        if self.get_client_by_duid(client.duid()).is_some() {
            return Err(AddrDbError::DuplicateDuid(client.duid().clone()));
        }
        self.clients.push(client);
        Ok(())
    }

    pub fn get_client_by_duid(&self, duid: &Duid) -> Option<&ClientRecord> {
        self.clients.iter().find(|c| c.duid() == duid)
    }

    pub fn get_client_by_spi(&self, spi: u32) -> Option<&ClientRecord> {
        self.clients.iter().find(|c| c.spi() == Some(spi))
    }

    pub fn get_client_by_leased_addr(&self, addr: Ipv6Addr) -> Option<&ClientRecord> {
        self.clients.iter().find(|c| c.has_leased_addr(addr))
    }

    pub fn del_client(&mut self, duid: &Duid) -> bool {
        let before = self.clients.len();
        self.clients.retain(|c| c.duid() != duid);
        self.clients.len() != before
    }

    pub fn count_clients(&self) -> usize {
        self.clients.len()
    }

    /// Clients in insertion order; stable across non-mutating queries.
    pub fn clients(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.iter()
    }

    pub(crate) fn clients_mut(&mut self) -> impl Iterator<Item = &mut ClientRecord> {
        self.clients.iter_mut()
    }

    fn client_idx(&self, duid: &Duid) -> Option<usize> {
        self.clients.iter().position(|c| c.duid() == duid)
    }

    // --- allocator queries ---

    /// True iff no address association anywhere holds `addr`.
    pub fn address_is_free(&self, addr: Ipv6Addr) -> bool {
        !self.clients.iter().any(|c| c.has_leased_addr(addr))
    }

    /// True iff no prefix delegation anywhere holds a prefix with this base.
    /// The length is not considered.
    pub fn prefix_is_free(&self, prefix: Ipv6Addr) -> bool {
        !self.clients.iter().any(|c| {
            c.ias(IaKind::Pd)
                .any(|ia| ia.get_prefix(prefix).is_some())
        })
    }

    // --- protocol operations ---

    /// Lease `addr` to `client_duid` under the non-temporary association
    /// `iaid`, creating the client and the association as needed.
    #[allow(clippy::too_many_arguments)]
    pub fn add_address(
        &mut self,
        client_duid: &Duid,
        client_addr: Option<Ipv6Addr>,
        iface: i32,
        iaid: u32,
        t1: u32,
        t2: u32,
        addr: Ipv6Addr,
        pref: u32,
        valid: u32,
        quiet: bool,
    ) -> Result<(), AddrDbError> {
        self.add_address_at(
            client_duid,
            client_addr,
            iface,
            iaid,
            t1,
            t2,
            addr,
            pref,
            valid,
            quiet,
            unix_now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_address_at(
        &mut self,
        client_duid: &Duid,
        client_addr: Option<Ipv6Addr>,
        iface: i32,
        iaid: u32,
        t1: u32,
        t2: u32,
        addr: Ipv6Addr,
        pref: u32,
        valid: u32,
        quiet: bool,
        now: u64,
    ) -> Result<(), AddrDbError> {
        if addr.is_unspecified() {
            warn!("refusing to add the unspecified address");
            return Err(AddrDbError::NullResource);
        }
        let (pref, valid) = ordered_lifetimes(pref, valid);

        let idx = self.ensure_client(client_duid, quiet);
        if let Some(unicast) = client_addr {
            self.clients[idx].set_last_unicast(Some(unicast));
        }
        self.ensure_ia(idx, IaKind::Na, iface, client_addr, t1, t2, iaid, now, quiet);

        if !self.address_is_free(addr) {
            warn!(%addr, "address is already assigned");
            // undo the client/IA shells this call may have created
            self.drop_if_empty(idx, IaKind::Na, iaid, quiet);
            return Err(AddrDbError::AlreadyAssigned(addr));
        }

        let mut lease = LeasedAddress::new(addr, pref, valid);
        lease.set_timestamp(now);
        lease.set_tentative(Tentative::No);
        match self.clients[idx].get_ia_mut(IaKind::Na, iaid) {
            Some(ia) => {
                ia.add_addr(lease)?;
                ia.set_state(IaState::Configured);
            }
            None => return Err(AddrDbError::UnknownIa { kind: IaKind::Na, iaid }),
        }
        if !quiet {
            debug!(duid = %client_duid, iaid, %addr, pref, valid, "address leased");
        }
        Ok(())
    }

    /// Delegate `prefix/length` to `client_duid` under the prefix
    /// association `iaid`, creating the client and the association as needed.
    #[allow(clippy::too_many_arguments)]
    pub fn add_prefix(
        &mut self,
        client_duid: &Duid,
        client_addr: Option<Ipv6Addr>,
        iface: i32,
        iaid: u32,
        t1: u32,
        t2: u32,
        prefix: Ipv6Addr,
        pref: u32,
        valid: u32,
        length: u8,
        quiet: bool,
    ) -> Result<(), AddrDbError> {
        self.add_prefix_at(
            client_duid,
            client_addr,
            iface,
            iaid,
            t1,
            t2,
            prefix,
            pref,
            valid,
            length,
            quiet,
            unix_now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_prefix_at(
        &mut self,
        client_duid: &Duid,
        client_addr: Option<Ipv6Addr>,
        iface: i32,
        iaid: u32,
        t1: u32,
        t2: u32,
        prefix: Ipv6Addr,
        pref: u32,
        valid: u32,
        length: u8,
        quiet: bool,
        now: u64,
    ) -> Result<(), AddrDbError> {
        if prefix.is_unspecified() {
            warn!("refusing to add a null prefix");
            return Err(AddrDbError::NullResource);
        }
        let (pref, valid) = ordered_lifetimes(pref, valid);

        let idx = self.ensure_client(client_duid, quiet);
        if let Some(unicast) = client_addr {
            self.clients[idx].set_last_unicast(Some(unicast));
        }
        self.ensure_ia(idx, IaKind::Pd, iface, client_addr, t1, t2, iaid, now, quiet);

        if !self.prefix_is_free(prefix) {
            warn!(%prefix, length, "prefix is already assigned");
            // undo the client/IA shells this call may have created
            self.drop_if_empty(idx, IaKind::Pd, iaid, quiet);
            return Err(AddrDbError::AlreadyAssigned(prefix));
        }

        let mut lease = LeasedPrefix::new(prefix, length, pref, valid);
        lease.set_timestamp(now);
        lease.set_tentative(Tentative::No);
        match self.clients[idx].get_ia_mut(IaKind::Pd, iaid) {
            Some(ia) => {
                ia.add_prefix(lease)?;
                ia.set_state(IaState::Configured);
            }
            None => return Err(AddrDbError::UnknownIa { kind: IaKind::Pd, iaid }),
        }
        if !quiet {
            debug!(duid = %client_duid, iaid, %prefix, length, "prefix delegated");
        }
        Ok(())
    }

    /// Refresh an existing address lease: bumps the association timestamp
    /// and T1/T2, then rewrites the lease lifetimes and timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn update_address(
        &mut self,
        client_duid: &Duid,
        iaid: u32,
        t1: u32,
        t2: u32,
        addr: Ipv6Addr,
        pref: u32,
        valid: u32,
        quiet: bool,
    ) -> Result<(), AddrDbError> {
        self.update_address_at(client_duid, iaid, t1, t2, addr, pref, valid, quiet, unix_now())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn update_address_at(
        &mut self,
        client_duid: &Duid,
        iaid: u32,
        t1: u32,
        t2: u32,
        addr: Ipv6Addr,
        pref: u32,
        valid: u32,
        quiet: bool,
        now: u64,
    ) -> Result<(), AddrDbError> {
        if addr.is_unspecified() {
            return Err(AddrDbError::NullResource);
        }
        let (pref, valid) = ordered_lifetimes(pref, valid);
        let client = match self.clients.iter_mut().find(|c| c.duid() == client_duid) {
            Some(c) => c,
            None => {
                warn!(duid = %client_duid, %addr, "cannot update address of unknown client");
                return Err(AddrDbError::UnknownClient(client_duid.clone()));
            }
        };
        let ia = match client.get_ia_mut(IaKind::Na, iaid) {
            Some(ia) => ia,
            None => {
                warn!(duid = %client_duid, iaid, "cannot update address, no such IA_NA");
                return Err(AddrDbError::UnknownIa { kind: IaKind::Na, iaid });
            }
        };
        ia.set_timestamp(now);
        ia.set_t1(t1);
        ia.set_t2(t2);
        let lease = match ia.get_addr_mut(addr) {
            Some(lease) => lease,
            None => {
                warn!(%addr, iaid, "address not in this IA, cannot update");
                return Err(AddrDbError::UnknownAddress(addr));
            }
        };
        lease.set_pref(pref);
        lease.set_valid(valid);
        lease.set_timestamp(now);
        ia.set_state(IaState::Configured);
        if !quiet {
            debug!(duid = %client_duid, iaid, %addr, pref, valid, "address refreshed");
        }
        Ok(())
    }

    /// Refresh an existing delegated prefix, analogous to
    /// [`AddrDb::update_address`].
    #[allow(clippy::too_many_arguments)]
    pub fn update_prefix(
        &mut self,
        client_duid: &Duid,
        iaid: u32,
        t1: u32,
        t2: u32,
        prefix: Ipv6Addr,
        pref: u32,
        valid: u32,
        quiet: bool,
    ) -> Result<(), AddrDbError> {
        self.update_prefix_at(client_duid, iaid, t1, t2, prefix, pref, valid, quiet, unix_now())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn update_prefix_at(
        &mut self,
        client_duid: &Duid,
        iaid: u32,
        t1: u32,
        t2: u32,
        prefix: Ipv6Addr,
        pref: u32,
        valid: u32,
        quiet: bool,
        now: u64,
    ) -> Result<(), AddrDbError> {
        if prefix.is_unspecified() {
            return Err(AddrDbError::NullResource);
        }
        let (pref, valid) = ordered_lifetimes(pref, valid);
        let client = match self.clients.iter_mut().find(|c| c.duid() == client_duid) {
            Some(c) => c,
            None => {
                warn!(duid = %client_duid, %prefix, "cannot update prefix of unknown client");
                return Err(AddrDbError::UnknownClient(client_duid.clone()));
            }
        };
        let ia = match client.get_ia_mut(IaKind::Pd, iaid) {
            Some(ia) => ia,
            None => {
                warn!(duid = %client_duid, iaid, "cannot update prefix, no such IA_PD");
                return Err(AddrDbError::UnknownIa { kind: IaKind::Pd, iaid });
            }
        };
        ia.set_timestamp(now);
        ia.set_t1(t1);
        ia.set_t2(t2);
        let lease = match ia.get_prefix_mut(prefix) {
            Some(lease) => lease,
            None => {
                warn!(%prefix, iaid, "prefix not in this IA, cannot update");
                return Err(AddrDbError::UnknownPrefix(prefix));
            }
        };
        lease.set_pref(pref);
        lease.set_valid(valid);
        lease.set_timestamp(now);
        ia.set_state(IaState::Configured);
        if !quiet {
            debug!(duid = %client_duid, iaid, %prefix, pref, valid, "prefix refreshed");
        }
        Ok(())
    }

    /// Remove a leased address. Also removes the association if it becomes
    /// empty, and the client if that was its last association. Missing
    /// client/IA/address are warnings, not errors.
    pub fn del_address(&mut self, client_duid: &Duid, iaid: u32, addr: Ipv6Addr, quiet: bool) -> bool {
        let idx = match self.client_idx(client_duid) {
            Some(idx) => idx,
            None => {
                warn!(duid = %client_duid, "client not found, cannot delete address");
                return false;
            }
        };
        match self.clients[idx].get_ia_mut(IaKind::Na, iaid) {
            Some(ia) => {
                if !ia.del_addr(addr) {
                    warn!(%addr, iaid, "address not assigned, cannot delete");
                    return false;
                }
            }
            None => {
                warn!(iaid, "IA_NA not assigned to client, cannot delete address");
                return false;
            }
        }
        if !quiet {
            debug!(duid = %client_duid, iaid, %addr, "address deleted");
        }
        self.drop_if_empty(idx, IaKind::Na, iaid, quiet);
        true
    }

    /// Remove a delegated prefix, analogous to [`AddrDb::del_address`].
    pub fn del_prefix(&mut self, client_duid: &Duid, iaid: u32, prefix: Ipv6Addr, quiet: bool) -> bool {
        let idx = match self.client_idx(client_duid) {
            Some(idx) => idx,
            None => {
                warn!(duid = %client_duid, "client not found, cannot delete prefix");
                return false;
            }
        };
        match self.clients[idx].get_ia_mut(IaKind::Pd, iaid) {
            Some(ia) => {
                if !ia.del_prefix(prefix) {
                    warn!(%prefix, iaid, "prefix not assigned, cannot delete");
                    return false;
                }
            }
            None => {
                warn!(iaid, "IA_PD not assigned to client, cannot delete prefix");
                return false;
            }
        }
        if !quiet {
            debug!(duid = %client_duid, iaid, %prefix, "prefix deleted");
        }
        self.drop_if_empty(idx, IaKind::Pd, iaid, quiet);
        true
    }

    // --- timers ---

    /// Seconds until the nearest T1 (renew) event, `u64::MAX` when none.
    pub fn min_t1(&self) -> u64 {
        self.min_t1_at(unix_now())
    }

    pub fn min_t1_at(&self, now: u64) -> u64 {
        self.clients
            .iter()
            .map(|c| c.t1_remaining(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Seconds until the nearest T2 (rebind) event.
    pub fn min_t2(&self) -> u64 {
        self.min_t2_at(unix_now())
    }

    pub fn min_t2_at(&self, now: u64) -> u64 {
        self.clients
            .iter()
            .map(|c| c.t2_remaining(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Seconds until the first lease becomes deprecated.
    pub fn min_preferred(&self) -> u64 {
        self.min_preferred_at(unix_now())
    }

    pub fn min_preferred_at(&self, now: u64) -> u64 {
        self.clients
            .iter()
            .map(|c| c.preferred_remaining(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Seconds until the first lease expires outright.
    pub fn min_valid(&self) -> u64 {
        self.min_valid_at(unix_now())
    }

    pub fn min_valid_at(&self, now: u64) -> u64 {
        self.clients
            .iter()
            .map(|c| c.valid_remaining(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    // --- lifecycle ---

    /// Drop leases whose valid lifetime elapsed, then empty associations,
    /// then (when enabled) empty clients. Returns the lease count removed.
    pub fn sweep_expired(&mut self) -> usize {
        self.sweep_expired_at(unix_now())
    }

    pub fn sweep_expired_at(&mut self, now: u64) -> usize {
        let mut removed = 0;
        for client in &mut self.clients {
            removed += client.sweep_expired(now);
        }
        if removed > 0 {
            debug!(removed, "expired leases swept");
        }
        self.reap_empty_clients();
        removed
    }

    fn reap_empty_clients(&mut self) {
        if !self.delete_empty_clients {
            return;
        }
        self.clients.retain(|c| {
            if c.is_empty() {
                debug!(duid = %c.duid(), "removing empty client");
                false
            } else {
                true
            }
        });
    }

    fn ensure_client(&mut self, duid: &Duid, quiet: bool) -> usize {
        match self.client_idx(duid) {
            Some(idx) => idx,
            None => {
                if !quiet {
                    debug!(duid = %duid, "adding new client");
                }
                self.clients.push(ClientRecord::new(duid.clone()));
                self.clients.len() - 1
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ensure_ia(
        &mut self,
        idx: usize,
        kind: IaKind,
        iface: i32,
        unicast: Option<Ipv6Addr>,
        t1: u32,
        t2: u32,
        iaid: u32,
        now: u64,
        quiet: bool,
    ) {
        if self.clients[idx].get_ia(kind, iaid).is_some() {
            return;
        }
        let mut ia = Ia::new(kind, iface, unicast, self.clients[idx].duid().clone(), t1, t2, iaid);
        ia.set_timestamp(now);
        if self.clients[idx].add_ia(ia).is_ok() && !quiet {
            debug!(%kind, iaid, "adding new IA");
        }
    }

    fn drop_if_empty(&mut self, idx: usize, kind: IaKind, iaid: u32, quiet: bool) {
        let ia_empty = self.clients[idx]
            .get_ia(kind, iaid)
            .map(Ia::is_empty)
            .unwrap_or(false);
        if ia_empty {
            self.clients[idx].del_ia(kind, iaid);
            if !quiet {
                debug!(%kind, iaid, "deleted empty IA");
            }
        }
        if self.clients[idx].is_empty() && self.delete_empty_clients {
            let duid = self.clients[idx].duid().clone();
            self.clients.remove(idx);
            if !quiet {
                debug!(duid = %duid, "deleted empty client");
            }
        }
    }

    // --- persistence ---

    /// Render the database in its on-disk form.
    pub fn snapshot_buffer(&self) -> String {
        snapshot::render(self)
    }

    /// Render and atomically replace the snapshot file.
    pub fn dump(&self) -> Result<(), AddrDbError> {
        snapshot::write_atomic(&self.db_path, &self.snapshot_buffer())
    }

    /// Restore the database from its snapshot file. `Ok(true)` once at
    /// least one client was reconstructed; malformed elements are skipped
    /// with warnings and never abort the load.
    pub fn load(&mut self) -> Result<bool, AddrDbError> {
        let file = fs::File::open(&self.db_path).map_err(|err| AddrDbError::PersistenceRead {
            err,
            path: self.db_path.clone(),
        })?;
        Ok(self.restore_from_reader(io::BufReader::new(file)))
    }

    /// Restore from any snapshot stream, same recovery rules as
    /// [`AddrDb::load`].
    pub fn restore_from_reader<R: BufRead>(&mut self, reader: R) -> bool {
        snapshot::restore(self, reader)
    }
}

/// Serialize under the read lock, write outside it. Lock poisoning is
/// tolerated: a panicked handler leaves the tree intact.
pub fn dump_locked(db: &RwLock<AddrDb>) -> Result<(), AddrDbError> {
    let (path, buf) = {
        let guard = db.read().unwrap_or_else(|e| e.into_inner());
        (guard.db_path().to_path_buf(), guard.snapshot_buffer())
    };
    snapshot::write_atomic(&path, &buf)
}

/// Lifetimes must satisfy preferred <= valid; a violating pair is clamped
/// with a warning rather than rejected, since the lease itself is sound.
fn ordered_lifetimes(pref: u32, valid: u32) -> (u32, u32) {
    if valid != INFINITY && (pref == INFINITY || pref > valid) {
        warn!(pref, valid, "preferred lifetime exceeds valid lifetime, clamping");
        (valid, valid)
    } else {
        (pref, valid)
    }
}
