//! # Virtual machine — interpreter core, processes, syscalls
//!
//! A register/stack machine (`pc sp bp ax bx`) executing the code
//! generator's 32-bit instruction stream over two-level paged virtual
//! memory. The machine is also the scheduler: guest processes run
//! cooperatively, round-robin by pid, each receiving a per-tick cycle
//! budget. Syscalls may suspend the caller with a resume predicate;
//! the global interrupt flag is consulted at syscall entry and at the
//! end of every tick slice, cancelling blocked calls with a negative
//! return.

pub mod frame;
pub mod heap;
pub mod page_table;
pub mod process;

pub use frame::{FrameId, FramePool, PAGE_SIZE};
pub use heap::HeapAllocator;
pub use page_table::{MemResult, PageTable, PteFlags};
pub use process::{Context, CtxFlags, CtxState, Handle, HandleKind, WaitReason};

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::compiler::{
    Codegen, Image, Linker, Opcode, DATA_BASE, EXIT_PC, HEAP_BASE, STACK_BASE, TEXT_BASE,
};
use crate::console::{Console, KeyEvent};
use crate::error::{Error, Result};
use crate::host::{Clock, StreamProvider, SystemClock};
use crate::lexer::Scanner;
use crate::parser::Parser;
use crate::vfs::{OpenTarget, Vfs};

/// Process table capacity
pub const TASK_LIMIT: usize = 64;
/// Handle table capacity
pub const HANDLE_LIMIT: usize = 256;
/// Pages backing each process stack
pub const STACK_PAGES: u32 = 32;
/// Frames in the default physical pool
pub const DEFAULT_FRAMES: u32 = 4096;

/// Lowest mapped stack address
const STACK_LIMIT: u32 = STACK_BASE - STACK_PAGES * PAGE_SIZE;

/// Syscall numbers
pub mod sys {
    /// Write the byte in `ax`; `ax` keeps its value
    pub const PUT_CHAR: i32 = 0;
    /// Print `ax` as a signed 32-bit decimal
    pub const PUT_INT: i32 = 1;
    /// Print `ax` as unsigned hex
    pub const PUT_HEX: i32 = 2;
    /// Print `ax` as a signed 64-bit decimal
    pub const PUT_LONG: i32 = 3;
    /// Print `ax` as a float
    pub const PUT_FLOAT: i32 = 4;
    /// Print `ax` as a float
    pub const PUT_DOUBLE: i32 = 5;
    /// Claim console line input
    pub const INPUT_LOCK: i32 = 10;
    /// Read one input byte, blocking until available
    pub const INPUT_CHAR: i32 = 11;
    /// Release console line input
    pub const INPUT_UNLOCK: i32 = 12;
    /// 1 when committed input waits
    pub const INPUT_STATE: i32 = 13;
    /// Resize the grid to `rows << 16 | cols`
    pub const RESIZE: i32 = 20;
    /// Set the foreground color to `ax`
    pub const SET_FG: i32 = 21;
    /// Set the background color to `ax`
    pub const SET_BG: i32 = 22;
    /// Push a color: `ax` 1 = background, 2 = foreground
    pub const SAVE_COLOR: i32 = 23;
    /// Pop a color: `ax` 3 = background, 4 = foreground
    pub const RESTORE_COLOR: i32 = 24;
    /// Pin the per-tick cycle budget to `ax`
    pub const SET_CYCLE: i32 = 30;
    /// Allocate `ax` heap bytes; returns the chunk address or 0
    pub const MALLOC: i32 = 40;
    /// Release the heap chunk at `ax`
    pub const FREE: i32 = 41;
    /// Sleep `ax` milliseconds
    pub const SLEEP: i32 = 50;
    /// Compile and spawn the program at the path in `ax`
    pub const EXEC: i32 = 51;
    /// Duplicate the calling process
    pub const FORK: i32 = 52;
    /// Block until a child exits; returns its exit code
    pub const WAIT: i32 = 53;
    /// Terminate with exit code `ax`
    pub const EXIT: i32 = 54;
    /// Open the path in `ax` for reading
    pub const OPEN: i32 = 60;
    /// Read one byte from handle `ax`
    pub const READ: i32 = 61;
    /// Write `ax & 0xFF` to handle `ax >> 8`
    pub const WRITE: i32 = 62;
    /// Close handle `ax`
    pub const CLOSE: i32 = 63;
}

/// Guest runtime library installed at `/bin/io`
const IO_SOURCE: &str = r#"
int put_char(char c) {
    c;
    interrupt 0;
}
int put_string(char *text) {
    while (put_char(*text++));
}
int put_int(int number) {
    number;
    interrupt 1;
}
int put_hex(int number) {
    number;
    interrupt 2;
}
long put_long(long number) {
    number;
    interrupt 3;
}
float put_float(float number) {
    number;
    interrupt 4;
}
double put_double(double number) {
    number;
    interrupt 5;
}
int input_lock() {
    interrupt 10;
}
int input_char() {
    interrupt 11;
}
int input_unlock() {
    interrupt 12;
}
int input_state() {
    interrupt 13;
}
int resize(int rows, int cols) {
    (rows << 16) | cols;
    interrupt 20;
}
int set_fg(int r, int g, int b) {
    put_char('\e');
    put_char('F');
    put_hex((0xff << 24) | (r << 16) | (g << 8) | b);
    put_char('\e');
}
int set_bg(int r, int g, int b) {
    put_char('\e');
    put_char('B');
    put_hex((0xff << 24) | (r << 16) | (g << 8) | b);
    put_char('\e');
}
int gui_cfg(char c) {
    put_char('\e');
    put_char('S');
    put_char(c);
    put_char('\e');
}
int save_bg() {
    gui_cfg('1');
}
int save_fg() {
    gui_cfg('2');
}
int restore_bg() {
    gui_cfg('3');
}
int restore_fg() {
    gui_cfg('4');
}
int set_cycle(int cycle) {
    cycle;
    interrupt 30;
}
int malloc(int size) {
    size;
    interrupt 40;
}
int free(int addr) {
    addr;
    interrupt 41;
}
int sleep(int ms) {
    ms;
    interrupt 50;
}
int exec(char *path) {
    path;
    interrupt 51;
}
int fork() {
    interrupt 52;
}
int wait() {
    interrupt 53;
}
int exit(int code) {
    code;
    interrupt 54;
}
int open(char *path) {
    path;
    interrupt 60;
}
int read(int handle) {
    handle;
    interrupt 61;
}
int write(int handle, char c) {
    (handle << 8) | (c & 0xff);
    interrupt 62;
}
int close(int handle) {
    handle;
    interrupt 63;
}
"#;

/// One interpreter step's outcome
enum Step {
    /// Fall through to the next instruction
    Next,
    /// Suspend with a resume predicate
    Block(WaitReason),
    /// The process finished
    Exit(i64),
}

/// The toy operating environment
///
/// Owns the frame pool, the process and handle tables, the file
/// system, the console, and the compile pipeline's linker and image
/// cache.
pub struct Machine {
    pool: FramePool,
    tasks: Vec<Option<Context>>,
    handles: Vec<Option<Handle>>,
    vfs: Vfs,
    console: Console,
    linker: Linker,
    images: HashMap<String, Image>,
    clock: Box<dyn Clock>,
    start_ms: u64,
    interrupt: bool,
    input_owner: Option<u32>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Creates a machine on the system clock
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemClock))
    }

    /// Creates a machine on the given clock
    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        let start_ms = clock.now_ms();
        let mut machine = Machine {
            pool: FramePool::new(DEFAULT_FRAMES),
            tasks: (0..TASK_LIMIT).map(|_| None).collect(),
            handles: (0..HANDLE_LIMIT).map(|_| None).collect(),
            vfs: Vfs::new(start_ms / 1000),
            console: Console::default(),
            linker: Linker::new(),
            images: HashMap::new(),
            clock,
            start_ms,
            interrupt: false,
            input_owner: None,
        };
        machine.init_fs();
        machine
    }

    /// Builds the initial tree: `/bin`, `/home`, `/bin/io`, `/proc`
    fn init_fs(&mut self) {
        let now = self.clock.now_ms() / 1000;
        self.vfs.as_root(true);
        let _ = self.vfs.mkdir("/bin", now);
        let _ = self.vfs.mkdir("/home", now);
        let _ = self.vfs.mkdir("/proc", now);
        let _ = self.vfs.write_file("/bin/io", IO_SOURCE.as_bytes(), now);
        let _ = self.vfs.install_callback("/proc/ps", now);
        let _ = self.vfs.install_callback("/proc/uptime", now);
        self.vfs.as_root(false);
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn now_secs(&self) -> u64 {
        self.clock.now_ms() / 1000
    }

    // -------------------------------------------------------------------
    // Host surface
    // -------------------------------------------------------------------

    /// The console grid, for painting and assertions
    pub fn console(&self) -> &Console {
        &self.console
    }

    /// The console, mutably (host-driven resize, tuning)
    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.console
    }

    /// The file system
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// The physical frame pool
    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Borrows a live process context
    pub fn process(&self, pid: u32) -> Option<&Context> {
        self.slot(pid).and_then(|s| self.tasks[s].as_ref())
    }

    fn slot(&self, pid: u32) -> Option<usize> {
        (pid >= 1 && pid as usize <= TASK_LIMIT).then(|| pid as usize - 1)
    }

    fn alive(&self, pid: u32) -> bool {
        matches!(
            self.process(pid),
            Some(c) if matches!(c.state, CtxState::Running | CtxState::Waiting)
        )
    }

    /// Writes a file as the kernel (impersonation released on return)
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let now = self.now_secs();
        self.vfs.as_root(true);
        let result = self.vfs.write_file(path, data, now).map(|_| ());
        self.vfs.as_root(false);
        result
    }

    /// Reads a file as the kernel
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let now = self.now_secs();
        self.vfs.as_root(true);
        let result = self.vfs.read_file(path, now);
        self.vfs.as_root(false);
        result
    }

    /// Sets the global interrupt flag (the host's Ctrl-C path)
    pub fn raise_interrupt(&mut self) {
        self.interrupt = true;
    }

    /// Feeds one key event from the host
    pub fn key_press(&mut self, c: u8) {
        if self.console.key(c) == KeyEvent::Interrupt {
            self.interrupt = true;
        }
    }

    /// Pipes `pid`'s output into `target`'s input queue
    ///
    /// Bytes arrive in emission order; `None` restores console output.
    pub fn set_output_redirect(&mut self, pid: u32, target: Option<u32>) -> Result<()> {
        let slot = self
            .slot(pid)
            .filter(|&s| self.tasks[s].is_some())
            .ok_or(Error::NoSuchProcess { pid })?;
        if let Some(t) = target {
            let tslot = self
                .slot(t)
                .filter(|&s| self.tasks[s].is_some())
                .ok_or(Error::NoSuchProcess { pid: t })?;
            self.tasks[tslot].as_mut().unwrap().input_redirect = Some(pid);
        }
        self.tasks[slot].as_mut().unwrap().output_redirect = target;
        Ok(())
    }

    /// Reads guest memory through the process page table
    pub fn read_memory(&mut self, pid: u32, va: u32, len: usize) -> Result<Vec<u8>> {
        let slot = self.slot(pid).ok_or(Error::NoSuchProcess { pid })?;
        let ctx = self.tasks[slot]
            .as_ref()
            .ok_or(Error::NoSuchProcess { pid })?;
        let pt = ctx
            .page_table
            .ok_or(Error::NoSuchProcess { pid })?;
        let mut buf = vec![0u8; len];
        pt.read_bytes(&mut self.pool, va, &mut buf)
            .map_err(|addr| Error::PageFault { pid, addr })?;
        Ok(buf)
    }

    /// Reaps a zombie, freeing its slot and returning the exit code
    pub fn reap(&mut self, pid: u32) -> Option<i32> {
        let slot = self.slot(pid)?;
        if matches!(self.tasks[slot], Some(ref c) if c.state == CtxState::Zombie) {
            let ctx = self.tasks[slot].take().unwrap();
            if let Some(pslot) = self.slot(ctx.parent) {
                if let Some(parent) = self.tasks[pslot].as_mut() {
                    parent.children.remove(&pid);
                }
            }
            Some(ctx.exit_code)
        } else {
            None
        }
    }

    // -------------------------------------------------------------------
    // Compile and load
    // -------------------------------------------------------------------

    /// Links and compiles the program at `path`, caching the image
    pub fn compile(&mut self, path: &str) -> Result<Image> {
        let resolved = Linker::resolve_name(path);
        if let Some(image) = self.images.get(&resolved) {
            return Ok(image.clone());
        }
        let Machine { linker, vfs, .. } = self;
        let reader =
            |p: &str| vfs.read_quiet(p).map(|b| String::from_utf8_lossy(&b).into_owned());
        let source = linker.link(&resolved, &reader)?;
        let tokens = Scanner::new(&source).scan_tokens()?;
        let unit = Parser::new(tokens).parse()?;
        let image = Codegen::new().generate(&unit)?;
        debug!(path = %resolved, words = image.text.len(), "compiled");
        self.images.insert(resolved, image.clone());
        Ok(image)
    }

    /// Compiles and starts a foreground program (no parent)
    pub fn exec(&mut self, path: &str, args: &[String]) -> Result<u32> {
        let image = self.compile(path)?;
        self.load(path, &image, args, 0)
    }

    fn free_task_slot(&self, skip_pid: u32) -> Result<usize> {
        self.tasks
            .iter()
            .enumerate()
            .position(|(i, t)| t.is_none() && (i as u32 + 1) != skip_pid)
            .ok_or(Error::ProcessTableFull)
    }

    /// Installs an image into a fresh process
    ///
    /// Allocates and fills text, data, and stack pages, pushes `argv`,
    /// and points `pc` at the resolved entry.
    pub fn load(&mut self, path: &str, image: &Image, args: &[String], parent: u32) -> Result<u32> {
        let slot = self.free_task_slot(0)?;
        let pid = slot as u32 + 1;
        let mut ctx = Context::new(pid, parent, path.to_string());
        match self.load_into(&mut ctx, image, args) {
            Ok(()) => {}
            Err(e) => {
                for f in ctx.frames.drain(..) {
                    self.pool.free(f);
                }
                return Err(e);
            }
        }
        if parent == 0 {
            ctx.flags |= CtxFlags::FOREGROUND;
        } else if let Some(pslot) = self.slot(parent) {
            if let Some(p) = self.tasks[pslot].as_mut() {
                p.children.insert(pid);
            }
        }
        debug!(pid, path = %path, "loaded process");
        self.tasks[slot] = Some(ctx);
        Ok(pid)
    }

    fn load_into(&mut self, ctx: &mut Context, image: &Image, args: &[String]) -> Result<()> {
        let (pt, dir) = PageTable::new(&mut self.pool)?;
        ctx.frames.push(dir);
        ctx.page_table = Some(pt);
        ctx.entry = image.entry;

        let text_bytes: Vec<u8> = image
            .text
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        self.map_segment(ctx, TEXT_BASE, &text_bytes, PteFlags::USER)?;
        self.map_segment(
            ctx,
            DATA_BASE,
            &image.data,
            PteFlags::USER | PteFlags::WRITABLE,
        )?;
        for i in 0..STACK_PAGES {
            let frame = self.pool.alloc()?;
            ctx.frames.push(frame);
            let va = STACK_BASE - (i + 1) * PAGE_SIZE;
            if let Some(table) =
                pt.map(&mut self.pool, va, frame, PteFlags::USER | PteFlags::WRITABLE)?
            {
                ctx.frames.push(table);
            }
        }

        // argv strings and pointer array live at the stack top
        let fault = |addr| Error::PageFault { pid: ctx.pid, addr };
        let mut sp = STACK_BASE;
        let mut arg_ptrs = Vec::with_capacity(args.len());
        for arg in args {
            sp -= arg.len() as u32 + 1;
            pt.set_str(&mut self.pool, sp, arg).map_err(fault)?;
            arg_ptrs.push(sp);
        }
        sp &= !7;
        sp -= (arg_ptrs.len() as u32) * 4;
        sp &= !7;
        let argv_base = sp;
        for (i, p) in arg_ptrs.iter().enumerate() {
            pt.write_u32(&mut self.pool, argv_base + i as u32 * 4, *p)
                .map_err(fault)?;
        }
        // the simulated caller pushed argc then argv, then the return
        // address that terminates the process
        pt.push(&mut self.pool, &mut sp, args.len() as u64)
            .map_err(fault)?;
        pt.push(&mut self.pool, &mut sp, argv_base as u64)
            .map_err(fault)?;
        pt.push(&mut self.pool, &mut sp, EXIT_PC as u64)
            .map_err(fault)?;

        ctx.sp = sp;
        ctx.bp = sp;
        ctx.pc = TEXT_BASE + image.entry * 4;
        Ok(())
    }

    fn map_segment(
        &mut self,
        ctx: &mut Context,
        base: u32,
        bytes: &[u8],
        flags: PteFlags,
    ) -> Result<()> {
        let pt = ctx.page_table.expect("page table installed before mapping");
        let pages = (bytes.len() as u32).div_ceil(PAGE_SIZE).max(1);
        for i in 0..pages {
            let frame = self.pool.alloc()?;
            ctx.frames.push(frame);
            if let Some(table) = pt.map(&mut self.pool, base + i * PAGE_SIZE, frame, flags)? {
                ctx.frames.push(table);
            }
            let off = (i * PAGE_SIZE) as usize;
            if off < bytes.len() {
                let end = bytes.len().min(off + PAGE_SIZE as usize);
                self.pool.write(frame, 0, &bytes[off..end]);
            }
        }
        Ok(())
    }

    /// Duplicates the caller: every mapped frame is copied by value
    /// into newly allocated frames; no memory is shared
    fn fork_process(&mut self, parent: &mut Context) -> Result<u32> {
        let slot = self.free_task_slot(parent.pid)?;
        let pid = slot as u32 + 1;
        let parent_pt = parent.page_table.expect("running process has a table");
        let mut child = Context::new(pid, parent.pid, parent.path.clone());
        let build = (|| -> Result<()> {
            let (pt, dir) = PageTable::new(&mut self.pool)?;
            child.frames.push(dir);
            child.page_table = Some(pt);
            for (va, frame) in parent_pt.mappings(&self.pool) {
                let copy = self.pool.alloc()?;
                self.pool.copy_frame(frame, copy);
                child.frames.push(copy);
                let flags = parent_pt
                    .flags_of(&self.pool, va)
                    .unwrap_or(PteFlags::USER | PteFlags::WRITABLE);
                if let Some(table) = pt.map(&mut self.pool, va, copy, flags)? {
                    child.frames.push(table);
                }
            }
            Ok(())
        })();
        if let Err(e) = build {
            for f in child.frames.drain(..) {
                self.pool.free(f);
            }
            return Err(e);
        }
        child.entry = parent.entry;
        child.pc = parent.pc;
        child.sp = parent.sp;
        child.bp = parent.bp;
        child.ax = 0; // the child observes fork() == 0
        child.bx = parent.bx;
        child.heap.copy_from(&parent.heap);
        child.flags = (parent.flags | CtxFlags::VALID) - CtxFlags::FOREGROUND;
        parent.children.insert(pid);
        debug!(parent = parent.pid, child = pid, "fork");
        self.tasks[slot] = Some(child);
        Ok(pid)
    }

    /// Returns every frame, closes every handle, and leaves a zombie
    /// holding only the parent link and exit code
    fn finish(&mut self, ctx: &mut Context, code: i32) {
        for h in ctx.handles.drain() {
            if let Some(handle) = self.handles[h as usize].take() {
                debug!(pid = ctx.pid, path = %handle.path, "closing leaked handle");
                if let HandleKind::File { node, .. } = handle.kind {
                    self.vfs.release(node);
                }
            }
        }
        for f in ctx.frames.drain(..) {
            self.pool.free(f);
        }
        ctx.page_table = None;
        ctx.heap = HeapAllocator::new();
        ctx.input_queue.clear();
        ctx.wait = None;
        ctx.state = CtxState::Zombie;
        ctx.exit_code = code;
        if self.input_owner == Some(ctx.pid) {
            self.input_owner = None;
            self.console.end_input();
        }
        debug!(pid = ctx.pid, code, "process finished");
    }

    // -------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------

    /// Runs one scheduler tick: every runnable process gets up to the
    /// current cycle budget, wakeups are applied, and the interrupt
    /// flag is consulted once at the end.
    ///
    /// Returns true while any process is running or waiting.
    pub fn tick(&mut self) -> bool {
        let budget = self.console.tuner().cycle();
        for slot in 0..TASK_LIMIT {
            let runnable = matches!(&self.tasks[slot], Some(c) if c.runnable());
            if runnable {
                self.run_slice(slot, budget);
            }
        }
        self.wake_processes();
        if self.interrupt {
            self.cancel_blocked();
            self.interrupt = false;
        }
        self.tasks
            .iter()
            .flatten()
            .any(|c| matches!(c.state, CtxState::Running | CtxState::Waiting))
    }

    /// Ticks until no process is runnable or `max_ticks` pass;
    /// returns the tick count consumed
    pub fn run(&mut self, max_ticks: usize) -> usize {
        for n in 0..max_ticks {
            let any_running = self
                .tasks
                .iter()
                .flatten()
                .any(|c| c.state == CtxState::Running);
            if !any_running {
                return n;
            }
            self.tick();
        }
        max_ticks
    }

    /// Feeds a framerate observation to the cycle tuner
    pub fn observe_fps(&mut self, fps: f64) {
        self.console.tuner_mut().observe(fps);
    }

    fn run_slice(&mut self, slot: usize, budget: u32) {
        let Some(mut ctx) = self.tasks[slot].take() else {
            return;
        };
        let mut exit = None;
        let mut fault = None;
        for _ in 0..budget {
            match self.step(&mut ctx) {
                Ok(Step::Next) => {}
                Ok(Step::Block(reason)) => {
                    ctx.state = CtxState::Waiting;
                    ctx.wait = Some(reason);
                    break;
                }
                Ok(Step::Exit(code)) => {
                    exit = Some(code as i32);
                    break;
                }
                Err(e) => {
                    fault = Some(e);
                    break;
                }
            }
        }
        if let Some(code) = exit {
            self.finish(&mut ctx, code);
        }
        if let Some(e) = fault {
            warn!(pid = ctx.pid, error = %e, "runtime fault");
            self.console.put_str(&format!("\n{}\n", e));
            self.finish(&mut ctx, -1);
        }
        self.tasks[slot] = Some(ctx);
    }

    /// Applies resume predicates of waiting processes
    fn wake_processes(&mut self) {
        let now = self.now_ms();
        for slot in 0..TASK_LIMIT {
            let Some(ctx) = self.tasks[slot].as_ref() else {
                continue;
            };
            if ctx.state != CtxState::Waiting {
                continue;
            }
            match ctx.wait {
                Some(WaitReason::Sleep { deadline_ms }) if now >= deadline_ms => {
                    let c = self.tasks[slot].as_mut().unwrap();
                    c.ax = 0;
                    c.state = CtxState::Running;
                    c.wait = None;
                }
                Some(WaitReason::Input) => {
                    let pid = ctx.pid;
                    let has_queue = !ctx.input_queue.is_empty();
                    let src_gone = ctx
                        .input_redirect
                        .map(|src| !self.alive(src))
                        .unwrap_or(false);
                    let is_owner = self.input_owner == Some(pid);
                    let console_ready = is_owner && self.console.has_pending_input();
                    let console_done =
                        is_owner && !self.console.input_active() && !self.console.has_pending_input();
                    if has_queue {
                        let c = self.tasks[slot].as_mut().unwrap();
                        c.ax = c.input_queue.pop_front().unwrap() as i64;
                        c.state = CtxState::Running;
                        c.wait = None;
                    } else if console_ready {
                        let b = self.console.next_input_byte().unwrap();
                        let c = self.tasks[slot].as_mut().unwrap();
                        c.ax = b as i64;
                        c.state = CtxState::Running;
                        c.wait = None;
                    } else if src_gone || console_done {
                        let c = self.tasks[slot].as_mut().unwrap();
                        c.ax = -1;
                        c.state = CtxState::Running;
                        c.wait = None;
                    }
                }
                Some(WaitReason::Child) => {
                    let zombie = ctx
                        .children
                        .iter()
                        .copied()
                        .find(|&cid| {
                            matches!(
                                self.slot(cid).and_then(|s| self.tasks[s].as_ref()),
                                Some(z) if z.state == CtxState::Zombie
                            )
                        });
                    if let Some(cid) = zombie {
                        let cslot = self.slot(cid).unwrap();
                        let code = self.tasks[cslot].take().unwrap().exit_code;
                        let c = self.tasks[slot].as_mut().unwrap();
                        c.children.remove(&cid);
                        c.ax = code as i64;
                        c.state = CtxState::Running;
                        c.wait = None;
                    }
                }
                _ => {}
            }
        }
    }

    /// Interrupt delivery: every blocked process resumes with a
    /// cancellation indication
    fn cancel_blocked(&mut self) {
        for ctx in self.tasks.iter_mut().flatten() {
            if ctx.state == CtxState::Waiting {
                ctx.ax = -1;
                ctx.state = CtxState::Running;
                ctx.wait = None;
            }
        }
    }

    // -------------------------------------------------------------------
    // Interpreter core
    // -------------------------------------------------------------------

    fn fetch(&mut self, ctx: &mut Context) -> Result<u32> {
        let pt = ctx.page_table.expect("running process has a table");
        let word = pt
            .read_u32(&mut self.pool, ctx.pc)
            .map_err(|addr| Error::PageFault { pid: ctx.pid, addr })?;
        ctx.pc = ctx.pc.wrapping_add(4);
        Ok(word)
    }

    fn push_val(&mut self, ctx: &mut Context, v: u64) -> Result<()> {
        if ctx.sp.wrapping_sub(8) < STACK_LIMIT {
            return Err(Error::StackOverflow { pid: ctx.pid });
        }
        let pt = ctx.page_table.expect("running process has a table");
        let mut sp = ctx.sp;
        pt.push(&mut self.pool, &mut sp, v)
            .map_err(|addr| Error::PageFault { pid: ctx.pid, addr })?;
        ctx.sp = sp;
        Ok(())
    }

    fn pop_val(&mut self, ctx: &mut Context) -> Result<u64> {
        let pt = ctx.page_table.expect("running process has a table");
        let mut sp = ctx.sp;
        let v = pt
            .pop(&mut self.pool, &mut sp)
            .map_err(|addr| Error::PageFault { pid: ctx.pid, addr })?;
        ctx.sp = sp;
        Ok(v)
    }

    /// Fetch, decode, execute one instruction
    fn step(&mut self, ctx: &mut Context) -> Result<Step> {
        let pid = ctx.pid;
        let pc_at = ctx.pc;
        let word = self.fetch(ctx)?;
        let op = Opcode::decode(word).ok_or(Error::InvalidInstruction {
            pid,
            pc: pc_at,
            word,
        })?;
        let pt = ctx.page_table.expect("running process has a table");
        let fault = |addr| Error::PageFault { pid, addr };

        match op {
            Opcode::Nop => {}
            Opcode::Imm => {
                let imm = self.fetch(ctx)? as i32;
                ctx.ax = imm as i64;
            }
            Opcode::Imx => {
                let lo = self.fetch(ctx)?;
                let hi = self.fetch(ctx)?;
                ctx.ax = ((hi as u64) << 32 | lo as u64) as i64;
            }
            Opcode::Lea => {
                let off = self.fetch(ctx)? as i32;
                ctx.ax = ctx.bp.wrapping_add(off as u32) as i32 as i64;
            }
            Opcode::Jmp => {
                let target = self.fetch(ctx)?;
                ctx.pc = TEXT_BASE.wrapping_add(target.wrapping_mul(4));
            }
            Opcode::Jz => {
                let target = self.fetch(ctx)?;
                if ctx.ax == 0 {
                    ctx.pc = TEXT_BASE.wrapping_add(target.wrapping_mul(4));
                }
            }
            Opcode::Jnz => {
                let target = self.fetch(ctx)?;
                if ctx.ax != 0 {
                    ctx.pc = TEXT_BASE.wrapping_add(target.wrapping_mul(4));
                }
            }
            Opcode::Call => {
                let target = self.fetch(ctx)?;
                self.push_val(ctx, ctx.pc as u64)?;
                ctx.pc = TEXT_BASE.wrapping_add(target.wrapping_mul(4));
            }
            Opcode::Ent => {
                let frame = self.fetch(ctx)?;
                self.push_val(ctx, ctx.bp as u64)?;
                ctx.bp = ctx.sp;
                if ctx.sp.wrapping_sub(frame) < STACK_LIMIT {
                    return Err(Error::StackOverflow { pid });
                }
                ctx.sp = ctx.sp.wrapping_sub(frame);
            }
            Opcode::Adj => {
                let n = self.fetch(ctx)?;
                ctx.sp = ctx.sp.wrapping_add(n);
            }
            Opcode::Lev => {
                ctx.sp = ctx.bp;
                ctx.bp = self.pop_val(ctx)? as u32;
                let ret = self.pop_val(ctx)? as u32;
                if ret == EXIT_PC {
                    return Ok(Step::Exit(ctx.ax));
                }
                ctx.pc = ret;
            }
            Opcode::Lb => {
                let addr = ctx.ax as u32;
                ctx.ax = pt.read_u8(&mut self.pool, addr).map_err(fault)? as i8 as i64;
            }
            Opcode::Lw => {
                let addr = ctx.ax as u32;
                ctx.ax = pt.read_u32(&mut self.pool, addr).map_err(fault)? as i32 as i64;
            }
            Opcode::Ld => {
                let addr = ctx.ax as u32;
                ctx.ax = pt.read_u64(&mut self.pool, addr).map_err(fault)? as i64;
            }
            Opcode::Sb => {
                let addr = self.pop_val(ctx)? as u32;
                pt.write_u8(&mut self.pool, addr, ctx.ax as u8)
                    .map_err(fault)?;
            }
            Opcode::Sw => {
                let addr = self.pop_val(ctx)? as u32;
                pt.write_u32(&mut self.pool, addr, ctx.ax as u32)
                    .map_err(fault)?;
            }
            Opcode::Sd => {
                let addr = self.pop_val(ctx)? as u32;
                pt.write_u64(&mut self.pool, addr, ctx.ax as u64)
                    .map_err(fault)?;
            }
            Opcode::Push => self.push_val(ctx, ctx.ax as u64)?,
            Opcode::Neg => ctx.ax = ctx.ax.wrapping_neg(),
            Opcode::Not => ctx.ax = !ctx.ax,
            Opcode::LNot => ctx.ax = (ctx.ax == 0) as i64,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Gt
            | Opcode::Le
            | Opcode::Ge => {
                let lhs = self.pop_val(ctx)? as i64;
                let rhs = ctx.ax;
                ctx.ax = match op {
                    Opcode::Add => lhs.wrapping_add(rhs),
                    Opcode::Sub => lhs.wrapping_sub(rhs),
                    Opcode::Mul => lhs.wrapping_mul(rhs),
                    Opcode::Div => {
                        if rhs == 0 {
                            return Err(Error::DivideByZero { pid, pc: pc_at });
                        }
                        lhs.wrapping_div(rhs)
                    }
                    Opcode::Mod => {
                        if rhs == 0 {
                            return Err(Error::DivideByZero { pid, pc: pc_at });
                        }
                        lhs.wrapping_rem(rhs)
                    }
                    Opcode::Shl => lhs.wrapping_shl(rhs as u32 & 63),
                    Opcode::Shr => lhs.wrapping_shr(rhs as u32 & 63),
                    Opcode::And => lhs & rhs,
                    Opcode::Or => lhs | rhs,
                    Opcode::Xor => lhs ^ rhs,
                    Opcode::Eq => (lhs == rhs) as i64,
                    Opcode::Ne => (lhs != rhs) as i64,
                    Opcode::Lt => (lhs < rhs) as i64,
                    Opcode::Gt => (lhs > rhs) as i64,
                    Opcode::Le => (lhs <= rhs) as i64,
                    Opcode::Ge => (lhs >= rhs) as i64,
                    _ => unreachable!("integer family matched above"),
                };
            }
            Opcode::FAdd
            | Opcode::FSub
            | Opcode::FMul
            | Opcode::FDiv
            | Opcode::FEq
            | Opcode::FNe
            | Opcode::FLt
            | Opcode::FGt
            | Opcode::FLe
            | Opcode::FGe => {
                let lhs = f64::from_bits(self.pop_val(ctx)?);
                let rhs = f64::from_bits(ctx.ax as u64);
                ctx.ax = match op {
                    Opcode::FAdd => (lhs + rhs).to_bits() as i64,
                    Opcode::FSub => (lhs - rhs).to_bits() as i64,
                    Opcode::FMul => (lhs * rhs).to_bits() as i64,
                    Opcode::FDiv => (lhs / rhs).to_bits() as i64,
                    Opcode::FEq => (lhs == rhs) as i64,
                    Opcode::FNe => (lhs != rhs) as i64,
                    Opcode::FLt => (lhs < rhs) as i64,
                    Opcode::FGt => (lhs > rhs) as i64,
                    Opcode::FLe => (lhs <= rhs) as i64,
                    Opcode::FGe => (lhs >= rhs) as i64,
                    _ => unreachable!("float family matched above"),
                };
            }
            Opcode::FNeg => ctx.ax = (-f64::from_bits(ctx.ax as u64)).to_bits() as i64,
            Opcode::I2F => ctx.ax = (ctx.ax as f64).to_bits() as i64,
            Opcode::F2I => ctx.ax = f64::from_bits(ctx.ax as u64) as i64,
            Opcode::Intr => {
                let num = self.fetch(ctx)? as i32;
                return self.syscall(ctx, num);
            }
        }
        Ok(Step::Next)
    }

    // -------------------------------------------------------------------
    // Syscalls
    // -------------------------------------------------------------------

    fn write_output(&mut self, ctx: &mut Context, byte: u8) {
        match ctx.output_redirect {
            Some(target) => {
                if let Some(slot) = self.slot(target) {
                    if let Some(t) = self.tasks[slot].as_mut() {
                        t.input_queue.push_back(byte);
                    }
                }
            }
            None => self.console.put_byte(byte),
        }
    }

    fn write_output_str(&mut self, ctx: &mut Context, s: &str) {
        for b in s.bytes() {
            self.write_output(ctx, b);
        }
    }

    fn guest_str(&mut self, ctx: &Context, va: u32) -> Result<String> {
        let pt = ctx.page_table.expect("running process has a table");
        pt.get_str(&mut self.pool, va)
            .map_err(|addr| Error::PageFault { pid: ctx.pid, addr })
    }

    fn syscall(&mut self, ctx: &mut Context, num: i32) -> Result<Step> {
        // uniform cancellation check at dispatch entry
        if self.interrupt {
            ctx.ax = -1;
            return Ok(Step::Next);
        }
        match num {
            sys::PUT_CHAR => {
                let b = ctx.ax as u8;
                self.write_output(ctx, b);
            }
            sys::PUT_INT => {
                let s = format!("{}", ctx.ax as i32);
                self.write_output_str(ctx, &s);
            }
            sys::PUT_HEX => {
                let s = format!("{:x}", ctx.ax as u32);
                self.write_output_str(ctx, &s);
            }
            sys::PUT_LONG => {
                let s = format!("{}", ctx.ax);
                self.write_output_str(ctx, &s);
            }
            sys::PUT_FLOAT | sys::PUT_DOUBLE => {
                let s = format!("{}", f64::from_bits(ctx.ax as u64));
                self.write_output_str(ctx, &s);
            }
            sys::INPUT_LOCK => {
                if self.input_owner.is_none() || self.input_owner == Some(ctx.pid) {
                    self.input_owner = Some(ctx.pid);
                    if ctx.input_redirect.is_none() {
                        self.console.begin_input();
                    }
                    ctx.ax = 0;
                } else {
                    ctx.ax = -1;
                }
            }
            sys::INPUT_CHAR => return self.sys_input_char(ctx),
            sys::INPUT_UNLOCK => {
                if self.input_owner == Some(ctx.pid) {
                    self.input_owner = None;
                    self.console.end_input();
                }
                ctx.ax = 0;
            }
            sys::INPUT_STATE => {
                let pending =
                    self.console.has_pending_input() || !ctx.input_queue.is_empty();
                ctx.ax = pending as i64;
            }
            sys::RESIZE => {
                let rows = (ctx.ax >> 16) as usize & 0xFFFF;
                let cols = ctx.ax as usize & 0xFFFF;
                self.console.resize(rows, cols);
                ctx.ax = 0;
            }
            sys::SET_FG => {
                self.console.set_fg(ctx.ax as u32);
                ctx.ax = 0;
            }
            sys::SET_BG => {
                self.console.set_bg(ctx.ax as u32);
                ctx.ax = 0;
            }
            sys::SAVE_COLOR => {
                if ctx.ax == 1 {
                    self.console.save_bg();
                } else {
                    self.console.save_fg();
                }
                ctx.ax = 0;
            }
            sys::RESTORE_COLOR => {
                if ctx.ax == 3 {
                    self.console.restore_bg();
                } else {
                    self.console.restore_fg();
                }
                ctx.ax = 0;
            }
            sys::SET_CYCLE => {
                self.console.tuner_mut().pin(ctx.ax as u32);
                ctx.ax = 0;
            }
            sys::MALLOC => self.sys_malloc(ctx)?,
            sys::FREE => {
                ctx.ax = match ctx.heap.release(ctx.ax as u32) {
                    Some(_) => 0,
                    None => -1,
                };
            }
            sys::SLEEP => {
                let deadline_ms = self.now_ms().saturating_add(ctx.ax.max(0) as u64);
                return Ok(Step::Block(WaitReason::Sleep { deadline_ms }));
            }
            sys::EXEC => {
                let path = self.guest_str(ctx, ctx.ax as u32)?;
                ctx.ax = match self.spawn_child(ctx, &path) {
                    Ok(pid) => pid as i64,
                    Err(Error::FileNotFound { .. }) | Err(Error::IncludeNotFound { .. }) => -1,
                    Err(Error::ProcessTableFull) => -2,
                    Err(e) => {
                        warn!(error = %e, "exec failed");
                        self.console.put_str(&format!("\n{}\n", e));
                        -3
                    }
                };
            }
            sys::FORK => {
                ctx.ax = match self.fork_process(ctx) {
                    Ok(pid) => pid as i64,
                    Err(_) => -1,
                };
            }
            sys::WAIT => return self.sys_wait(ctx),
            sys::EXIT => return Ok(Step::Exit(ctx.ax)),
            sys::OPEN => {
                let path = self.guest_str(ctx, ctx.ax as u32)?;
                ctx.ax = self.sys_open(ctx.pid, &path);
                if ctx.ax >= 0 {
                    ctx.handles.insert(ctx.ax as u32);
                }
            }
            sys::READ => ctx.ax = self.sys_read(ctx),
            sys::WRITE => ctx.ax = self.sys_write(ctx),
            sys::CLOSE => {
                let h = ctx.ax as u32;
                ctx.ax = if ctx.handles.remove(&h) {
                    self.close_handle(h);
                    0
                } else {
                    -1
                };
            }
            other => {
                warn!(num = other, "unknown syscall");
                ctx.ax = -1;
            }
        }
        Ok(Step::Next)
    }

    fn spawn_child(&mut self, parent: &mut Context, path: &str) -> Result<u32> {
        let image = self.compile(path)?;
        let slot = self.free_task_slot(parent.pid)?;
        let pid = slot as u32 + 1;
        let mut child = Context::new(pid, parent.pid, Linker::resolve_name(path));
        match self.load_into(&mut child, &image, &[]) {
            Ok(()) => {}
            Err(e) => {
                for f in child.frames.drain(..) {
                    self.pool.free(f);
                }
                return Err(e);
            }
        }
        parent.children.insert(pid);
        debug!(parent = parent.pid, child = pid, path, "exec");
        self.tasks[slot] = Some(child);
        Ok(pid)
    }

    fn sys_input_char(&mut self, ctx: &mut Context) -> Result<Step> {
        if let Some(b) = ctx.input_queue.pop_front() {
            ctx.ax = b as i64;
            return Ok(Step::Next);
        }
        if let Some(src) = ctx.input_redirect {
            if !self.alive(src) {
                ctx.ax = -1;
                return Ok(Step::Next);
            }
            return Ok(Step::Block(WaitReason::Input));
        }
        if self.input_owner == Some(ctx.pid) {
            if let Some(b) = self.console.next_input_byte() {
                ctx.ax = b as i64;
                return Ok(Step::Next);
            }
            if self.console.input_active() {
                return Ok(Step::Block(WaitReason::Input));
            }
            // line fully drained
            ctx.ax = -1;
            return Ok(Step::Next);
        }
        ctx.ax = -1;
        Ok(Step::Next)
    }

    fn sys_wait(&mut self, ctx: &mut Context) -> Result<Step> {
        if ctx.children.is_empty() {
            ctx.ax = -1;
            return Ok(Step::Next);
        }
        let zombie = ctx
            .children
            .iter()
            .copied()
            .find(|&cid| {
                matches!(
                    self.slot(cid).and_then(|s| self.tasks[s].as_ref()),
                    Some(z) if z.state == CtxState::Zombie
                )
            });
        match zombie {
            Some(cid) => {
                let cslot = self.slot(cid).unwrap();
                let code = self.tasks[cslot].take().unwrap().exit_code;
                ctx.children.remove(&cid);
                ctx.ax = code as i64;
                Ok(Step::Next)
            }
            None => Ok(Step::Block(WaitReason::Child)),
        }
    }

    fn sys_malloc(&mut self, ctx: &mut Context) -> Result<()> {
        let size = (ctx.ax.max(0) as u32).next_multiple_of(8);
        if size == 0 {
            ctx.ax = 0;
            return Ok(());
        }
        if ctx.heap.fit(size).is_none() {
            let pt = ctx.page_table.expect("running process has a table");
            let pages = ctx.heap.pages_for(size);
            for i in 0..pages {
                let frame = match self.pool.alloc() {
                    Ok(f) => f,
                    Err(_) => {
                        ctx.ax = 0;
                        return Ok(());
                    }
                };
                ctx.frames.push(frame);
                let va = HEAP_BASE + ctx.heap.extent() + i * PAGE_SIZE;
                if let Some(table) =
                    pt.map(&mut self.pool, va, frame, PteFlags::USER | PteFlags::WRITABLE)?
                {
                    ctx.frames.push(table);
                }
            }
            ctx.heap.grow(pages);
        }
        ctx.ax = match ctx.heap.fit(size) {
            Some(addr) => ctx.heap.take(addr, size) as i32 as i64,
            None => 0,
        };
        Ok(())
    }

    fn alloc_handle(&mut self, handle: Handle) -> Option<u32> {
        let slot = self.handles.iter().position(|h| h.is_none())?;
        self.handles[slot] = Some(handle);
        Some(slot as u32)
    }

    fn sys_open(&mut self, pid: u32, path: &str) -> i64 {
        let now = self.now_secs();
        let target = match self.vfs.open(path, now) {
            Ok(t) => t,
            Err(Error::FileNotFound { .. }) => return -1,
            Err(_) => return -3,
        };
        let kind = match target {
            OpenTarget::File(node) => HandleKind::File { node, cursor: 0 },
            OpenTarget::Cached(data) => HandleKind::Cached { data, cursor: 0 },
            OpenTarget::Callback(abs) => {
                let content = self.stream_content(&abs).unwrap_or_default();
                HandleKind::Cached {
                    data: content.into_bytes(),
                    cursor: 0,
                }
            }
        };
        let file_node = match &kind {
            HandleKind::File { node, .. } => Some(*node),
            _ => None,
        };
        match self.alloc_handle(Handle {
            owner: pid,
            path: path.to_string(),
            kind,
        }) {
            Some(id) => id as i64,
            None => {
                // undo the refcount taken by open
                if let Some(node) = file_node {
                    self.vfs.release(node);
                }
                -2
            }
        }
    }

    fn sys_read(&mut self, ctx: &mut Context) -> i64 {
        let h = ctx.ax as u32;
        if !ctx.handles.contains(&h) || h as usize >= HANDLE_LIMIT {
            return -2;
        }
        match self.handles[h as usize].as_mut() {
            Some(handle) if handle.owner == ctx.pid => match &mut handle.kind {
                HandleKind::File { node, cursor } => {
                    let data = &self.vfs.node(*node).data;
                    match data.get(*cursor) {
                        Some(&b) => {
                            *cursor += 1;
                            b as i64
                        }
                        None => -1,
                    }
                }
                HandleKind::Cached { data, cursor } => match data.get(*cursor) {
                    Some(&b) => {
                        *cursor += 1;
                        b as i64
                    }
                    None => -1,
                },
            },
            _ => -2,
        }
    }

    fn sys_write(&mut self, ctx: &mut Context) -> i64 {
        let h = (ctx.ax >> 8) as u32;
        let byte = ctx.ax as u8;
        if !ctx.handles.contains(&h) || h as usize >= HANDLE_LIMIT {
            return -2;
        }
        let now = self.now_secs();
        match self.handles[h as usize].as_ref() {
            Some(Handle {
                owner,
                kind: HandleKind::File { node, .. },
                ..
            }) if *owner == ctx.pid => {
                let node = *node;
                let n = self.vfs.node_mut(node);
                n.data.push(byte);
                n.modified = now;
                0
            }
            _ => -2,
        }
    }

    fn close_handle(&mut self, h: u32) {
        if let Some(Handle {
            kind: HandleKind::File { node, .. },
            ..
        }) = self.handles[h as usize].take()
        {
            self.vfs.release(node);
        }
    }
}

impl StreamProvider for Machine {
    /// `/proc` synthesis: process listing and uptime
    fn stream_content(&self, path: &str) -> Option<String> {
        match path {
            "/proc/uptime" => Some(format!("{}\n", self.now_ms() - self.start_ms)),
            "/proc/ps" => {
                let mut out = String::from("PID   STATE     PATH\n");
                for ctx in self.tasks.iter().flatten() {
                    let state = match ctx.state {
                        CtxState::Running => "running",
                        CtxState::Waiting => "waiting",
                        CtxState::Zombie => "zombie",
                        CtxState::Dead => "dead",
                    };
                    out.push_str(&format!("{:<5} {:<9} {}\n", ctx.pid, state, ctx.path));
                }
                Some(out)
            }
            _ => None,
        }
    }
}
