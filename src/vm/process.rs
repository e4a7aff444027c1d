//! Process contexts and handle entries
//!
//! Contexts live in a fixed-size slot table indexed by pid; handles in
//! a parallel table of small integers. Indices, not pointers: cheap to
//! copy, stable across operations, easy to print when debugging.

use std::collections::{HashSet, VecDeque};

use bitflags::bitflags;

use super::frame::FrameId;
use super::heap::HeapAllocator;
use super::page_table::PageTable;
use crate::vfs::NodeId;

bitflags! {
    /// Context attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtxFlags: u32 {
        /// Slot holds a live context
        const VALID = 1 << 0;
        /// Kernel-owned process
        const KERNEL = 1 << 1;
        /// Runs guest code in user mode
        const USER_MODE = 1 << 2;
        /// Owns the display focus
        const FOREGROUND = 1 << 3;
    }
}

/// Scheduler-visible process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxState {
    /// Eligible for the round-robin
    Running,
    /// Suspended on a resume predicate
    Waiting,
    /// Finished; retains only parent link and exit code until reaped
    Zombie,
    /// Slot queued for release
    Dead,
}

/// Resume predicate of a waiting process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Wake when the clock reaches the deadline
    Sleep {
        /// Absolute deadline in clock milliseconds
        deadline_ms: u64,
    },
    /// Wake when a byte is available to read
    Input,
    /// Wake when a child becomes a zombie
    Child,
}

/// One guest process
#[derive(Debug)]
pub struct Context {
    /// Process id (slot index + 1; pid 0 means "no process")
    pub pid: u32,
    /// Parent pid; 0 for the first process
    pub parent: u32,
    /// Live children pids
    pub children: HashSet<u32>,
    /// Scheduler state
    pub state: CtxState,
    /// Attribute flags
    pub flags: CtxFlags,
    /// Path the image was loaded from
    pub path: String,
    /// Entry word offset within the text segment
    pub entry: u32,
    /// Program counter (full virtual address)
    pub pc: u32,
    /// Stack pointer
    pub sp: u32,
    /// Frame base pointer
    pub bp: u32,
    /// Accumulator
    pub ax: i64,
    /// Scratch register
    pub bx: i64,
    /// Address-space mapping; absent once the process is a zombie
    pub page_table: Option<PageTable>,
    /// Every frame this process owns, tables and directory included
    pub frames: Vec<FrameId>,
    /// Per-process heap bookkeeping
    pub heap: HeapAllocator,
    /// Pid whose input queue feeds this process, if redirected
    pub input_redirect: Option<u32>,
    /// Pid whose input queue receives this process's output, if redirected
    pub output_redirect: Option<u32>,
    /// Bytes queued for this process to read
    pub input_queue: VecDeque<u8>,
    /// Open handle ids
    pub handles: HashSet<u32>,
    /// Resume predicate while `state` is `Waiting`
    pub wait: Option<WaitReason>,
    /// Exit code retained for the parent's reap
    pub exit_code: i32,
}

impl Context {
    /// Creates a fresh context in the running state
    pub fn new(pid: u32, parent: u32, path: String) -> Self {
        Context {
            pid,
            parent,
            children: HashSet::new(),
            state: CtxState::Running,
            flags: CtxFlags::VALID | CtxFlags::USER_MODE,
            path,
            entry: 0,
            pc: 0,
            sp: 0,
            bp: 0,
            ax: 0,
            bx: 0,
            page_table: None,
            frames: Vec::new(),
            heap: HeapAllocator::new(),
            input_redirect: None,
            output_redirect: None,
            input_queue: VecDeque::new(),
            handles: HashSet::new(),
            wait: None,
            exit_code: 0,
        }
    }

    /// True when the scheduler may hand this process a slice
    pub fn runnable(&self) -> bool {
        self.state == CtxState::Running
    }
}

/// What a handle reads from
#[derive(Debug, Clone)]
pub enum HandleKind {
    /// Live file node with a read cursor
    File {
        /// VFS node backing the handle
        node: NodeId,
        /// Next byte to read
        cursor: usize,
    },
    /// Snapshot content (callback nodes, directory listings)
    Cached {
        /// Captured bytes
        data: Vec<u8>,
        /// Next byte to read
        cursor: usize,
    },
}

/// One open-handle table entry
#[derive(Debug, Clone)]
pub struct Handle {
    /// Owning process
    pub owner: u32,
    /// Path the handle was opened with
    pub path: String,
    /// Data source
    pub kind: HandleKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_is_runnable() {
        let ctx = Context::new(1, 0, "/bin/init".into());
        assert!(ctx.runnable());
        assert!(ctx.flags.contains(CtxFlags::VALID));
        assert_eq!(ctx.parent, 0);
    }

    #[test]
    fn test_waiting_context_not_runnable() {
        let mut ctx = Context::new(2, 1, "/bin/sh".into());
        ctx.state = CtxState::Waiting;
        ctx.wait = Some(WaitReason::Sleep { deadline_ms: 100 });
        assert!(!ctx.runnable());
    }
}
