//! Registry of installed probe sites, keyed by address space and runtime address.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use super::{ProbeDescriptor, ProbeSite, ProbeType};
use crate::error::{Error, Result};
use crate::ops::Pid;

/// One row of [`ProbeRegistry::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeListing {
    pub kind: ProbeType,
    pub pid: Option<Pid>,
    /// Runtime address, Thumb bit included.
    pub addr: u64,
    pub hits: u64,
    pub handlers: usize,
    /// Calls missed by the return probe, if any.
    pub nmissed: u64,
    /// Executed out of line rather than simulated.
    pub stepped: bool,
}

struct InstalledSite {
    site: ProbeSite,
    descriptor: Arc<ProbeDescriptor>,
}

type SiteKey = (Option<Pid>, u64);

/// Installed sites. Read-mostly: trap handlers only take the read lock.
pub struct ProbeRegistry {
    sites: RwLock<BTreeMap<SiteKey, InstalledSite>>,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self {
            sites: RwLock::new(BTreeMap::new()),
        }
    }

    /// The site planted at `addr` (Thumb bit ignored) in `pid`. `f` runs on
    /// the site before the lock is dropped, so nothing can remove it in
    /// between.
    pub fn lookup_with(
        &self,
        pid: Option<Pid>,
        addr: u64,
        f: impl FnOnce(&ProbeSite),
    ) -> Option<(ProbeSite, Arc<ProbeDescriptor>)> {
        let sites = self.sites.read();
        let installed = sites.get(&(pid, addr & !1))?;
        f(&installed.site);
        Some((installed.site, installed.descriptor.clone()))
    }

    pub fn descriptor(&self, pid: Option<Pid>, addr: u64) -> Option<Arc<ProbeDescriptor>> {
        self.sites
            .read()
            .get(&(pid, addr & !1))
            .map(|s| s.descriptor.clone())
    }

    pub fn contains(&self, pid: Option<Pid>, addr: u64) -> bool {
        self.sites.read().contains_key(&(pid, addr & !1))
    }

    /// Record an installed site.
    pub fn insert(&self, site: ProbeSite, descriptor: Arc<ProbeDescriptor>) -> Result<()> {
        let key = (site.pid, site.addr.addr);
        let mut sites = self.sites.write();
        if sites.contains_key(&key) {
            return Err(Error::AlreadyInstalled);
        }
        sites.insert(key, InstalledSite { site, descriptor });
        Ok(())
    }

    /// Forget a site, returning it so the caller can restore its bytes.
    pub fn remove(&self, pid: Option<Pid>, addr: u64) -> Option<ProbeSite> {
        self.sites.write().remove(&(pid, addr & !1)).map(|s| s.site)
    }

    /// Forget every site of `pid`.
    pub fn remove_process(&self, pid: Pid) -> Vec<ProbeSite> {
        let mut sites = self.sites.write();
        let keys: Vec<SiteKey> = sites
            .range((Some(pid), 0)..=(Some(pid), u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| sites.remove(&k))
            .map(|s| s.site)
            .collect()
    }

    /// Sites of `pid` whose address lies in `[lo, hi)`.
    pub fn in_range(&self, pid: Pid, lo: u64, hi: u64) -> Vec<ProbeSite> {
        if lo >= hi {
            return Vec::new();
        }
        self.sites
            .read()
            .range((Some(pid), lo)..(Some(pid), hi))
            .map(|(_, s)| s.site)
            .collect()
    }

    /// Remove everything, for teardown.
    pub fn take_all(&self) -> Vec<ProbeSite> {
        let sites = core::mem::take(&mut *self.sites.write());
        sites.into_values().map(|s| s.site).collect()
    }

    pub fn len(&self) -> usize {
        self.sites.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every installed site.
    pub fn list(&self) -> Vec<ProbeListing> {
        self.sites
            .read()
            .values()
            .map(|s| {
                let ret = s.descriptor.return_probe();
                ProbeListing {
                    kind: ProbeType::new(s.site.pid.is_some(), ret.is_some()),
                    pid: s.site.pid,
                    addr: s.site.addr.tagged(),
                    hits: s.descriptor.stats().hits(),
                    handlers: s.descriptor.handler_count(),
                    nmissed: ret.map(|r| r.nmissed()).unwrap_or(0),
                    stepped: s.site.copy.is_some(),
                }
            })
            .collect()
    }

    /// Flat `(pid, addr, hits, is_return, nmissed)` tuples for simple
    /// listing consumers.
    pub fn list_flat(&self) -> Vec<(Option<Pid>, u64, u64, bool, u64)> {
        self.list()
            .into_iter()
            .map(|l| (l.pid, l.addr, l.hits, l.kind.is_return_probe(), l.nmissed))
            .collect()
    }
}
