//! Image/probe-site tracker.
//!
//! Image probes are registered against a (file, image-relative address)
//! pair. Every caller attaching the same pair shares one
//! [`ProbeDescriptor`]; the descriptor is reference counted and the site
//! disappears when the last caller detaches. Per process, the site is only
//! patched once a page covering it is touched; the tracker records which
//! processes currently carry an installed copy so the last detach can undo
//! all of them.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

use crate::decode::ProbeAddress;
use crate::error::{Error, Result};
use crate::ops::{FileId, Pid};
use crate::probe::{ActionHint, ProbeDescriptor};

struct ImageSite {
    descriptor: Arc<ProbeDescriptor>,
    /// Processes with the site patched, and the runtime address there.
    installed: BTreeMap<Pid, u64>,
}

#[derive(Default)]
struct ImageFile {
    /// Sites keyed by image-relative address.
    sites: BTreeMap<u64, ImageSite>,
}

/// A site not yet patched in some process.
#[derive(Debug, Clone)]
pub struct PendingSite {
    pub offset: ProbeAddress,
    pub descriptor: Arc<ProbeDescriptor>,
}

/// Per-file probe sites.
pub struct ImageTracker {
    files: Mutex<HashMap<FileId, ImageFile>>,
}

impl Default for ImageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageTracker {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Reference the site at `addr` in `file`, creating it if needed.
    ///
    /// `hint` of `None` accepts whatever the existing site uses; a new site
    /// then defaults to [`ActionHint::Auto`].
    pub fn attach(
        &self,
        file: FileId,
        addr: ProbeAddress,
        hint: Option<ActionHint>,
    ) -> Result<Arc<ProbeDescriptor>> {
        addr.check_alignment()?;
        let mut files = self.files.lock();
        let image = files.entry(file).or_default();
        if let Some(site) = image.sites.get(&addr.addr) {
            if site.descriptor.addr.isa != addr.isa {
                return Err(Error::Conflict);
            }
            site.descriptor.check_hint(hint)?;
            site.descriptor.acquire();
            return Ok(site.descriptor.clone());
        }
        let descriptor = Arc::new(ProbeDescriptor::new(addr, hint.unwrap_or(ActionHint::Auto)));
        descriptor.acquire();
        image.sites.insert(
            addr.addr,
            ImageSite {
                descriptor: descriptor.clone(),
                installed: BTreeMap::new(),
            },
        );
        debug!("image: new site {:?}+{:#x}", file, addr.addr);
        Ok(descriptor)
    }

    pub fn descriptor(&self, file: FileId, addr: u64) -> Option<Arc<ProbeDescriptor>> {
        let files = self.files.lock();
        files
            .get(&file)?
            .sites
            .get(&(addr & !1))
            .map(|s| s.descriptor.clone())
    }

    /// Drop one reference to the site. On the last one, `uninstall` is
    /// called for every process carrying the site, with the tracker lock
    /// held, and the site is forgotten. Returns true on the last release.
    pub fn detach(
        &self,
        file: FileId,
        addr: u64,
        mut uninstall: impl FnMut(Pid, u64),
    ) -> Result<bool> {
        let addr = addr & !1;
        let mut files = self.files.lock();
        let image = files.get_mut(&file).ok_or(Error::NotFound)?;
        let site = image.sites.get(&addr).ok_or(Error::NotFound)?;
        if !site.descriptor.release() {
            return Ok(false);
        }
        if let Some(site) = image.sites.remove(&addr) {
            for (pid, vaddr) in site.installed {
                uninstall(pid, vaddr);
            }
        }
        if image.sites.is_empty() {
            files.remove(&file);
        }
        debug!("image: site {:?}+{:#x} gone", file, addr);
        Ok(true)
    }

    /// Record that `pid` now carries the site at `vaddr`.
    pub fn mark_installed(&self, file: FileId, addr: u64, pid: Pid, vaddr: u64) -> Result<()> {
        let mut files = self.files.lock();
        let site = files
            .get_mut(&file)
            .and_then(|f| f.sites.get_mut(&(addr & !1)))
            .ok_or(Error::NotFound)?;
        if site.installed.insert(pid, vaddr).is_some() {
            return Err(Error::AlreadyInstalled);
        }
        Ok(())
    }

    /// Record that `pid` no longer carries the site.
    pub fn mark_removed(&self, file: FileId, addr: u64, pid: Pid) -> Option<u64> {
        let mut files = self.files.lock();
        files
            .get_mut(&file)?
            .sites
            .get_mut(&(addr & !1))?
            .installed
            .remove(&pid)
    }

    /// Sites of `file` with image offset in `[lo, hi)` not yet installed in `pid`.
    pub fn pending_sites(&self, file: FileId, pid: Pid, lo: u64, hi: u64) -> Vec<PendingSite> {
        if lo >= hi {
            return Vec::new();
        }
        let files = self.files.lock();
        let Some(image) = files.get(&file) else {
            return Vec::new();
        };
        image
            .sites
            .range(lo..hi)
            .filter(|(_, s)| !s.installed.contains_key(&pid))
            .map(|(_, s)| PendingSite {
                offset: s.descriptor.addr,
                descriptor: s.descriptor.clone(),
            })
            .collect()
    }

    /// Image offsets of `file` installed in `pid` within `[lo, hi)`.
    pub fn installed_in_range(&self, file: FileId, pid: Pid, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        if lo >= hi {
            return Vec::new();
        }
        let files = self.files.lock();
        let Some(image) = files.get(&file) else {
            return Vec::new();
        };
        image
            .sites
            .range(lo..hi)
            .filter_map(|(offset, s)| s.installed.get(&pid).map(|vaddr| (*offset, *vaddr)))
            .collect()
    }

    /// Forget every installation in `pid`. Returns `(file, offset, vaddr)`.
    pub fn remove_process(&self, pid: Pid) -> Vec<(FileId, u64, u64)> {
        let mut out = Vec::new();
        let mut files = self.files.lock();
        for (file, image) in files.iter_mut() {
            for (offset, site) in image.sites.iter_mut() {
                if let Some(vaddr) = site.installed.remove(&pid) {
                    out.push((*file, *offset, vaddr));
                }
            }
        }
        out
    }

    /// Number of sites and total per-process installations.
    pub fn counts(&self) -> (usize, usize) {
        let files = self.files.lock();
        files.values().fold((0, 0), |(sites, pages), f| {
            (
                sites + f.sites.len(),
                pages + f.sites.values().map(|s| s.installed.len()).sum::<usize>(),
            )
        })
    }

    pub fn clear(&self) {
        self.files.lock().clear();
    }
}
