//! Event record kinds and payload codecs.
//!
//! A record on the wire is `{kind: u16, length: u16, payload[length]}`,
//! little-endian. Payload layouts are fixed per kind; consumers skip kinds
//! they do not know by `length`.

/// Bytes of the `{kind, length}` record header.
pub const HEADER_LEN: usize = 4;
/// Most argument words carried by an entry record.
pub const MAX_ARGS: usize = 6;

/// Record kind tags.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    FunctionEntry = 1,
    FunctionExit = 2,
    SyscallEntry = 3,
    SyscallExit = 4,
    ContextSwitch = 5,
    Signal = 6,
    FileClose = 7,
    ProcessExit = 8,
}

impl RecordKind {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => Self::FunctionEntry,
            2 => Self::FunctionExit,
            3 => Self::SyscallEntry,
            4 => Self::SyscallExit,
            5 => Self::ContextSwitch,
            6 => Self::Signal,
            7 => Self::FileClose,
            8 => Self::ProcessExit,
            _ => return None,
        })
    }

    /// Human-readable kind.
    pub fn label(self) -> &'static str {
        match self {
            Self::FunctionEntry => "entry",
            Self::FunctionExit => "exit",
            Self::SyscallEntry => "sys_enter",
            Self::SyscallExit => "sys_exit",
            Self::ContextSwitch => "sched_switch",
            Self::Signal => "signal",
            Self::FileClose => "close",
            Self::ProcessExit => "exit_group",
        }
    }
}

/// Bounded little-endian writer over a record payload.
pub struct PayloadWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    overflow: bool,
}

impl<'a> PayloadWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            overflow: false,
        }
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        let end = self.pos + data.len();
        if self.overflow || end > self.buf.len() {
            self.overflow = true;
        } else {
            self.buf[self.pos..end].copy_from_slice(data);
            self.pos = end;
        }
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    /// Bytes written, or `None` if anything did not fit.
    pub fn finish(&self) -> Option<usize> {
        (!self.overflow).then_some(self.pos)
    }
}

/// Little-endian reader over a record payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.bytes(N)?.try_into().ok()
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.array().map(i32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_le_bytes)
    }
}

/// A decoded (or to-be-encoded) event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    FunctionEntry {
        pid: u32,
        tid: u32,
        addr: u64,
        nr_args: u16,
        args: [u64; MAX_ARGS],
        /// Optional label, e.g. a probe name.
        name: &'a [u8],
    },
    FunctionExit {
        pid: u32,
        tid: u32,
        /// Entry address of the returning function.
        addr: u64,
        ret_addr: u64,
        retval: u64,
    },
    SyscallEntry {
        pid: u32,
        tid: u32,
        nr: u32,
        nr_args: u32,
        args: [u64; MAX_ARGS],
    },
    SyscallExit {
        pid: u32,
        tid: u32,
        nr: u32,
        ret: i64,
    },
    ContextSwitch {
        cpu: u32,
        prev_tid: u32,
        next_tid: u32,
    },
    Signal {
        pid: u32,
        tid: u32,
        signo: u32,
    },
    FileClose {
        pid: u32,
        tid: u32,
        fd: u32,
    },
    ProcessExit {
        pid: u32,
        code: i32,
    },
}

impl<'a> Event<'a> {
    pub fn kind(&self) -> RecordKind {
        match self {
            Event::FunctionEntry { .. } => RecordKind::FunctionEntry,
            Event::FunctionExit { .. } => RecordKind::FunctionExit,
            Event::SyscallEntry { .. } => RecordKind::SyscallEntry,
            Event::SyscallExit { .. } => RecordKind::SyscallExit,
            Event::ContextSwitch { .. } => RecordKind::ContextSwitch,
            Event::Signal { .. } => RecordKind::Signal,
            Event::FileClose { .. } => RecordKind::FileClose,
            Event::ProcessExit { .. } => RecordKind::ProcessExit,
        }
    }

    /// Write the payload into `buf`; `None` if it does not fit.
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let mut w = PayloadWriter::new(buf);
        match *self {
            Event::FunctionEntry {
                pid,
                tid,
                addr,
                nr_args,
                ref args,
                name,
            } => {
                let n = (nr_args as usize).min(MAX_ARGS);
                let name_len = u16::try_from(name.len()).ok()?;
                w.u32(pid).u32(tid).u64(addr).u16(n as u16).u16(name_len);
                for arg in &args[..n] {
                    w.u64(*arg);
                }
                w.bytes(name);
            }
            Event::FunctionExit {
                pid,
                tid,
                addr,
                ret_addr,
                retval,
            } => {
                w.u32(pid).u32(tid).u64(addr).u64(ret_addr).u64(retval);
            }
            Event::SyscallEntry {
                pid,
                tid,
                nr,
                nr_args,
                ref args,
            } => {
                let n = (nr_args as usize).min(MAX_ARGS);
                w.u32(pid).u32(tid).u32(nr).u32(n as u32);
                for arg in &args[..n] {
                    w.u64(*arg);
                }
            }
            Event::SyscallExit { pid, tid, nr, ret } => {
                w.u32(pid).u32(tid).u32(nr).u32(0).i64(ret);
            }
            Event::ContextSwitch {
                cpu,
                prev_tid,
                next_tid,
            } => {
                w.u32(cpu).u32(prev_tid).u32(next_tid);
            }
            Event::Signal { pid, tid, signo } => {
                w.u32(pid).u32(tid).u32(signo);
            }
            Event::FileClose { pid, tid, fd } => {
                w.u32(pid).u32(tid).u32(fd);
            }
            Event::ProcessExit { pid, code } => {
                w.u32(pid).i32(code);
            }
        }
        w.finish()
    }

    /// Parse a payload of `kind`. Unknown kinds and short payloads give `None`.
    pub fn decode(kind: u16, payload: &'a [u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        let event = match RecordKind::from_u16(kind)? {
            RecordKind::FunctionEntry => {
                let pid = r.u32()?;
                let tid = r.u32()?;
                let addr = r.u64()?;
                let nr_args = r.u16()?;
                let name_len = r.u16()?;
                let args = read_args(&mut r, nr_args as usize)?;
                Event::FunctionEntry {
                    pid,
                    tid,
                    addr,
                    nr_args,
                    args,
                    name: r.bytes(name_len as usize)?,
                }
            }
            RecordKind::FunctionExit => Event::FunctionExit {
                pid: r.u32()?,
                tid: r.u32()?,
                addr: r.u64()?,
                ret_addr: r.u64()?,
                retval: r.u64()?,
            },
            RecordKind::SyscallEntry => {
                let pid = r.u32()?;
                let tid = r.u32()?;
                let nr = r.u32()?;
                let nr_args = r.u32()?;
                Event::SyscallEntry {
                    pid,
                    tid,
                    nr,
                    nr_args,
                    args: read_args(&mut r, nr_args as usize)?,
                }
            }
            RecordKind::SyscallExit => {
                let pid = r.u32()?;
                let tid = r.u32()?;
                let nr = r.u32()?;
                r.u32()?;
                Event::SyscallExit {
                    pid,
                    tid,
                    nr,
                    ret: r.i64()?,
                }
            }
            RecordKind::ContextSwitch => Event::ContextSwitch {
                cpu: r.u32()?,
                prev_tid: r.u32()?,
                next_tid: r.u32()?,
            },
            RecordKind::Signal => Event::Signal {
                pid: r.u32()?,
                tid: r.u32()?,
                signo: r.u32()?,
            },
            RecordKind::FileClose => Event::FileClose {
                pid: r.u32()?,
                tid: r.u32()?,
                fd: r.u32()?,
            },
            RecordKind::ProcessExit => Event::ProcessExit {
                pid: r.u32()?,
                code: r.i32()?,
            },
        };
        Some(event)
    }
}

fn read_args(r: &mut PayloadReader<'_>, n: usize) -> Option<[u64; MAX_ARGS]> {
    if n > MAX_ARGS {
        return None;
    }
    let mut args = [0u64; MAX_ARGS];
    for arg in args.iter_mut().take(n) {
        *arg = r.u64()?;
    }
    Some(args)
}
