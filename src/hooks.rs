//! Hook dispatch registry.
//!
//! Host paths (syscalls, scheduler, signals, file close, exit, mmap) call
//! [`HookRegistry::dispatch`] unconditionally. Each category keeps an
//! atomic subscriber count so a category nobody listens to costs one load.
//! Subscribers pin their [`Owner`] for as long as they are registered, which
//! keeps a module from unloading under a live callback.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::RwLock;

use crate::error::{Error, Result};
use crate::event::{Event, MAX_ARGS};
use crate::ops::{FileId, Pid, Tid};
use crate::transport::{Delivery, Transport};

/// Event sources hooks can subscribe to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookCategory {
    SyscallEntry = 0,
    SyscallExit = 1,
    ContextSwitch = 2,
    SignalDeliver = 3,
    FileClose = 4,
    ProcessExit = 5,
    ImageMap = 6,
}

const NR_CATEGORIES: usize = 7;

impl HookCategory {
    pub const ALL: [HookCategory; NR_CATEGORIES] = [
        HookCategory::SyscallEntry,
        HookCategory::SyscallExit,
        HookCategory::ContextSwitch,
        HookCategory::SignalDeliver,
        HookCategory::FileClose,
        HookCategory::ProcessExit,
        HookCategory::ImageMap,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Arguments handed to hook callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookArgs {
    SyscallEntry {
        pid: Pid,
        tid: Tid,
        nr: u32,
        args: [u64; MAX_ARGS],
        nr_args: u32,
    },
    SyscallExit {
        pid: Pid,
        tid: Tid,
        nr: u32,
        ret: i64,
    },
    ContextSwitch {
        cpu: u32,
        prev_tid: Tid,
        next_tid: Tid,
    },
    SignalDeliver {
        pid: Pid,
        tid: Tid,
        signo: u32,
    },
    FileClose {
        pid: Pid,
        tid: Tid,
        fd: u32,
    },
    ProcessExit {
        pid: Pid,
        code: i32,
    },
    ImageMap {
        pid: Pid,
        file: FileId,
        base: u64,
    },
}

impl HookArgs {
    pub fn category(&self) -> HookCategory {
        match self {
            HookArgs::SyscallEntry { .. } => HookCategory::SyscallEntry,
            HookArgs::SyscallExit { .. } => HookCategory::SyscallExit,
            HookArgs::ContextSwitch { .. } => HookCategory::ContextSwitch,
            HookArgs::SignalDeliver { .. } => HookCategory::SignalDeliver,
            HookArgs::FileClose { .. } => HookCategory::FileClose,
            HookArgs::ProcessExit { .. } => HookCategory::ProcessExit,
            HookArgs::ImageMap { .. } => HookCategory::ImageMap,
        }
    }

    /// Transport event for these arguments. Image maps have no record kind.
    pub fn event(&self) -> Option<Event<'static>> {
        Some(match *self {
            HookArgs::SyscallEntry {
                pid,
                tid,
                nr,
                args,
                nr_args,
            } => Event::SyscallEntry {
                pid,
                tid,
                nr,
                nr_args,
                args,
            },
            HookArgs::SyscallExit { pid, tid, nr, ret } => Event::SyscallExit { pid, tid, nr, ret },
            HookArgs::ContextSwitch {
                cpu,
                prev_tid,
                next_tid,
            } => Event::ContextSwitch {
                cpu,
                prev_tid,
                next_tid,
            },
            HookArgs::SignalDeliver { pid, tid, signo } => Event::Signal { pid, tid, signo },
            HookArgs::FileClose { pid, tid, fd } => Event::FileClose { pid, tid, fd },
            HookArgs::ProcessExit { pid, code } => Event::ProcessExit { pid, code },
            HookArgs::ImageMap { .. } => return None,
        })
    }
}

/// A loadable unit that owns hook subscriptions.
pub struct Owner {
    name: String,
    pins: AtomicUsize,
    unloading: AtomicBool,
}

impl Owner {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            pins: AtomicUsize::new(0),
            unloading: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pin the owner; fails once it has started unloading.
    pub fn try_pin(&self) -> Result<()> {
        self.pins.fetch_add(1, Ordering::AcqRel);
        if self.unloading.load(Ordering::Acquire) {
            self.unpin();
            return Err(Error::OwnerGone);
        }
        Ok(())
    }

    pub fn unpin(&self) {
        let _ = self
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Refuse further pins. Returns true if nothing is pinned and the
    /// owner may go away now.
    pub fn begin_unload(&self) -> bool {
        self.unloading.store(true, Ordering::Release);
        self.pins() == 0
    }

    pub fn is_unloading(&self) -> bool {
        self.unloading.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for Owner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Owner")
            .field("name", &self.name)
            .field("pins", &self.pins())
            .field("unloading", &self.is_unloading())
            .finish()
    }
}

/// Hook callback.
pub type HookCallback = Arc<dyn Fn(&Transport, &HookArgs) + Send + Sync>;

/// Returned by [`HookRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    pub id: u64,
    pub category: HookCategory,
}

struct Subscription {
    id: u64,
    owner: Arc<Owner>,
    callback: HookCallback,
}

struct CategorySlot {
    subscribers: AtomicUsize,
    list: RwLock<Vec<Subscription>>,
}

impl CategorySlot {
    fn new() -> Self {
        Self {
            subscribers: AtomicUsize::new(0),
            list: RwLock::new(Vec::new()),
        }
    }
}

/// Category publish/subscribe registry.
pub struct HookRegistry {
    categories: [CategorySlot; NR_CATEGORIES],
    next_id: AtomicU64,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            categories: core::array::from_fn(|_| CategorySlot::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn slot(&self, category: HookCategory) -> &CategorySlot {
        &self.categories[category.index()]
    }

    /// Subscribe `callback` to `category` on behalf of `owner`.
    pub fn register(
        &self,
        category: HookCategory,
        owner: &Arc<Owner>,
        callback: HookCallback,
    ) -> Result<HookHandle> {
        owner.try_pin()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = self.slot(category);
        slot.list.write().push(Subscription {
            id,
            owner: owner.clone(),
            callback,
        });
        slot.subscribers.fetch_add(1, Ordering::AcqRel);
        info!("hook: {} subscribed to {:?} (id {})", owner.name(), category, id);
        Ok(HookHandle { id, category })
    }

    /// Remove a subscription and unpin its owner.
    pub fn unregister(&self, handle: HookHandle) -> Result<()> {
        let slot = self.slot(handle.category);
        let sub = {
            let mut list = slot.list.write();
            let pos = list
                .iter()
                .position(|s| s.id == handle.id)
                .ok_or(Error::NotFound)?;
            list.remove(pos)
        };
        let dec = slot
            .subscribers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if dec.is_err() {
            error!(
                "hook: {:?} counter underflow on id {}: {}",
                handle.category,
                handle.id,
                Error::CounterUnderflow
            );
        }
        sub.owner.unpin();
        info!("hook: {} unsubscribed from {:?}", sub.owner.name(), handle.category);
        Ok(())
    }

    /// Drop every subscription of `owner`. Returns how many were removed.
    pub fn unregister_owner(&self, owner: &Arc<Owner>) -> usize {
        let mut removed = 0;
        for category in HookCategory::ALL {
            let ids: Vec<u64> = self
                .slot(category)
                .list
                .read()
                .iter()
                .filter(|s| Arc::ptr_eq(&s.owner, owner))
                .map(|s| s.id)
                .collect();
            for id in ids {
                if self.unregister(HookHandle { id, category }).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn subscribers(&self, category: HookCategory) -> usize {
        self.slot(category).subscribers.load(Ordering::Acquire)
    }

    /// Run the callbacks subscribed to the category of `args`.
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, transport: &Transport, args: &HookArgs) -> usize {
        let slot = self.slot(args.category());
        if slot.subscribers.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let list = slot.list.read();
        for sub in list.iter() {
            (sub.callback)(transport, args);
        }
        list.len()
    }
}

/// Callback that writes each hook event to the transport.
pub fn recorder(delivery: Delivery) -> HookCallback {
    Arc::new(move |transport: &Transport, args: &HookArgs| {
        if let Some(event) = args.event() {
            if let Err(e) = transport.emit(&event, delivery) {
                debug!("hook: {:?} record dropped: {:?}", args.category(), e);
            }
        }
    })
}
