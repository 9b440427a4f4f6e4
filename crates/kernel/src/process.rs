//! The process table.
//!
//! Process records live in a slot-indexed arena. Runnable processes are
//! threaded through the arena by `prev`/`next` slot links forming the
//! scheduler's list, which allows O(1) unlink from interrupt context without
//! aliasing record ownership. The distinguished idle process occupies a slot
//! but is never on the runnable list; it is selected only when the list is
//! empty.

use alloc::{boxed::Box, vec, vec::Vec};

use vmm::{AddressSpace, Protection};

use crate::errno::Errno;
use crate::fs::{terminal, FileHandle, Vnode};
use crate::interrupts::{
    InterruptContext, RegisterFrame, EFLAGS_INTERRUPT_ENABLE, USER_CODE_SELECTOR,
    USER_DATA_SELECTOR,
};
use crate::loader;

/// Process identifier.
pub type Pid = i32;

/// Maximum number of open file descriptors per process.
pub const OPEN_MAX: usize = 20;

/// Size of a process's kernel stack: one page.
pub const KERNEL_STACK_SIZE: usize = 4096;

/// Index of a process record in the process table arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(pub(crate) usize);

/// A process's kernel stack.
///
/// The initial [`InterruptContext`] is written at the top so that the first
/// return-from-interrupt on this stack unwinds straight into user mode.
#[repr(C, align(16))]
pub struct KernelStack([u8; KERNEL_STACK_SIZE]);

impl KernelStack {
    fn new() -> Box<Self> {
        Box::new(Self([0; KERNEL_STACK_SIZE]))
    }

    /// Returns the address one past the stack's highest byte.
    pub fn top(&self) -> usize {
        self.0.as_ptr() as usize + KERNEL_STACK_SIZE
    }

    /// Returns the slot for the saved register frame at the top of the stack.
    fn context_slot(&mut self) -> *mut InterruptContext {
        (self.top() - core::mem::size_of::<InterruptContext>()) as *mut InterruptContext
    }
}

/// The address space a process runs in.
enum SpaceRef {
    /// The shared kernel address space, borrowed; used by the idle process
    /// and by records that do not (or no longer) own an image.
    Kernel,
    /// An address space owned by this process.
    Owned(AddressSpace),
}

/// A process record.
pub struct Process {
    pid: Pid,
    address_space: SpaceRef,
    kernel_stack: Option<Box<KernelStack>>,
    /// The saved register frame to resume this process from. Points into the
    /// kernel stack (or, between ticks, at the frame the ISR pushed).
    context: *mut InterruptContext,
    fd: [Option<FileHandle>; OPEN_MAX],
    root: Option<FileHandle>,
    cwd: Option<FileHandle>,
    prev: Option<Slot>,
    next: Option<Slot>,
    /// Set when a freshly written context must survive the next tick instead
    /// of being overwritten with the in-flight interrupt frame.
    context_changed: bool,
    fd_initialized: bool,
    /// Set by exit; the record stays in the arena until the scheduler has
    /// switched off its kernel stack.
    dead: bool,
}

// SAFETY: The context pointer aims into the record's own kernel stack (or at
// an ISR frame that outlives the tick). Records are only touched from boot
// and from interrupt context, serialized by the table lock.
unsafe impl Send for Process {}

impl Process {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            address_space: SpaceRef::Kernel,
            kernel_stack: None,
            context: core::ptr::null_mut(),
            fd: Default::default(),
            root: None,
            cwd: None,
            prev: None,
            next: None,
            context_changed: false,
            fd_initialized: false,
            dead: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn next_slot(&self) -> Option<Slot> {
        self.next
    }

    pub fn prev_slot(&self) -> Option<Slot> {
        self.prev
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn context_ptr(&self) -> *mut InterruptContext {
        self.context
    }

    pub fn context_changed(&self) -> bool {
        self.context_changed
    }

    pub(crate) fn set_context(&mut self, context: *mut InterruptContext) {
        self.context = context;
    }

    pub(crate) fn clear_context_changed(&mut self) {
        self.context_changed = false;
    }

    /// Returns the owned address space, or None for processes running in the
    /// kernel's.
    pub fn address_space(&self) -> Option<&AddressSpace> {
        match &self.address_space {
            SpaceRef::Owned(space) => Some(space),
            SpaceRef::Kernel => None,
        }
    }

    /// Returns the address one past the top of the kernel stack, if any.
    pub fn kernel_stack_top(&self) -> Option<usize> {
        self.kernel_stack.as_deref().map(KernelStack::top)
    }

    pub fn descriptor(&self, fd: usize) -> Option<&FileHandle> {
        self.fd.get(fd).and_then(Option::as_ref)
    }

    pub fn root_handle(&self) -> Option<&FileHandle> {
        self.root.as_ref()
    }

    pub fn cwd_handle(&self) -> Option<&FileHandle> {
        self.cwd.as_ref()
    }
}

/// The process table: the arena of records plus the scheduler's view of it.
pub struct ProcessTable {
    records: Vec<Option<Process>>,
    /// Head of the runnable list.
    pub(crate) first: Option<Slot>,
    /// The process whose address space is active on the CPU.
    pub(crate) current: Slot,
    /// The distinguished idle process.
    pub(crate) idle: Slot,
    next_pid: Pid,
    /// Record retired by the previous tick, freed on the next one.
    pub(crate) reap_next: Option<Slot>,
}

impl ProcessTable {
    /// One-shot initialization of the process subsystem.
    ///
    /// Creates the idle process: it runs in the kernel address space, starts
    /// from an empty saved context and holds the boot filesystem root. The
    /// idle process becomes `current`; the runnable list starts empty.
    pub fn initialize(root: FileHandle) -> Self {
        let mut table = Self {
            records: Vec::new(),
            first: None,
            current: Slot(0),
            idle: Slot(0),
            next_pid: 0,
            reap_next: None,
        };

        let idle = table.create_process();
        let record = table.record_mut(idle);
        record.context = Box::leak(Box::new(InterruptContext::default()));
        record.root = Some(root);

        table.idle = idle;
        table.current = idle;
        table
    }

    /// Creates an empty process record and returns its slot.
    ///
    /// The record is not runnable until it has been populated (by `execute`
    /// or `fork`) and linked with [`ProcessTable::add_process`].
    pub fn create_process(&mut self) -> Slot {
        let pid = self.next_pid;
        self.next_pid += 1;

        let process = Process::new(pid);
        match self.records.iter().position(Option::is_none) {
            Some(index) => {
                self.records[index] = Some(process);
                Slot(index)
            }
            None => {
                self.records.push(Some(process));
                Slot(self.records.len() - 1)
            }
        }
    }

    /// Prepends the process to the runnable list.
    pub fn add_process(&mut self, slot: Slot) {
        let first = self.first;
        {
            let record = self.record_mut(slot);
            record.next = first;
            record.prev = None;
        }
        if let Some(first) = first {
            self.record_mut(first).prev = Some(slot);
        }
        self.first = Some(slot);
    }

    /// Replaces the process image with the ELF image backing `handle`.
    ///
    /// Loads the executable into a fresh address space, allocates the initial
    /// user stack and a kernel stack, and writes a synthetic interrupt frame
    /// at the top of the kernel stack that enters user mode at the image's
    /// entry point with interrupts enabled. First-time callers also get their
    /// standard descriptors (terminal on 0, 1 and 2) and root/cwd handles.
    ///
    /// Argv and envp are accepted but not yet passed to the new image.
    pub fn execute(
        &mut self,
        slot: Slot,
        handle: &FileHandle,
        _argv: &[&str],
        _envp: &[&str],
    ) -> Result<(), Errno> {
        let image = match handle.node().as_ref() {
            Vnode::File(file) => {
                let mut buffer = vec![0u8; file.size()];
                file.read(&mut buffer, 0);
                buffer
            }
            _ => return Err(Errno::NoExec),
        };

        // Any previous image is discarded along with its whole address space.
        let mut space = AddressSpace::new();
        let entry = loader::load(&image, &mut space)?;

        let stack = space
            .map_memory(vmm::PAGE_SIZE, Protection::READ | Protection::WRITE)
            .map_err(Errno::from)?;

        let mut kernel_stack = KernelStack::new();
        let context = kernel_stack.context_slot();
        // SAFETY: context points at owned kernel stack memory.
        unsafe {
            context.write(InterruptContext {
                eip: entry.as_usize() as u32,
                cs: USER_CODE_SELECTOR,
                eflags: EFLAGS_INTERRUPT_ENABLE,
                esp: (stack.as_usize() + vmm::PAGE_SIZE) as u32,
                ss: USER_DATA_SELECTOR,
                ..InterruptContext::default()
            });
        }

        let idle_root = self.record(self.idle).root.clone();
        let is_current = slot == self.current;

        let record = self.record_mut(slot);
        record.address_space = SpaceRef::Owned(space);
        record.kernel_stack = Some(kernel_stack);
        record.context = context;

        if !record.fd_initialized {
            let terminal = terminal::handle();
            record.fd[0] = Some(terminal.clone()); // stdin
            record.fd[1] = Some(terminal.clone()); // stdout
            record.fd[2] = Some(terminal); // stderr

            record.root = idle_root.clone();
            record.cwd = idle_root;
            record.fd_initialized = true;
        }

        if is_current {
            // The next tick must not clobber the frame written above with the
            // interrupt frame of the syscall that invoked execute.
            record.context_changed = true;
        }

        Ok(())
    }

    /// Forks the process from a caller-supplied register image.
    ///
    /// The child gets a deep copy of the parent's address space, a kernel
    /// stack whose initial frame resumes in user mode with exactly the
    /// supplied registers, and clones of every open descriptor. The child is
    /// linked runnable before this returns.
    pub fn fork(&mut self, parent: Slot, registers: &RegisterFrame) -> Result<Slot, Errno> {
        let forked_space = match &self.record(parent).address_space {
            SpaceRef::Owned(space) => space.fork().map_err(Errno::from)?,
            SpaceRef::Kernel => return Err(Errno::Inval),
        };

        let (fd, root, cwd) = {
            let parent = self.record(parent);
            (parent.fd.clone(), parent.root.clone(), parent.cwd.clone())
        };

        let slot = self.create_process();

        let mut kernel_stack = KernelStack::new();
        let context = kernel_stack.context_slot();
        // SAFETY: context points at owned kernel stack memory.
        unsafe {
            context.write(InterruptContext {
                eax: registers.eax,
                ebx: registers.ebx,
                ecx: registers.ecx,
                edx: registers.edx,
                esi: registers.esi,
                edi: registers.edi,
                ebp: registers.ebp,
                eip: registers.eip,
                esp: registers.esp,
                // Registers that are not controlled by the user.
                interrupt: 0,
                error: 0,
                cs: USER_CODE_SELECTOR,
                eflags: EFLAGS_INTERRUPT_ENABLE,
                ss: USER_DATA_SELECTOR,
            });
        }

        let record = self.record_mut(slot);
        record.address_space = SpaceRef::Owned(forked_space);
        record.kernel_stack = Some(kernel_stack);
        record.context = context;
        record.fd = fd;
        record.root = root;
        record.cwd = cwd;
        record.fd_initialized = true;

        self.add_process(slot);
        Ok(slot)
    }

    /// Terminates the process.
    ///
    /// Unlinks the record from the runnable list and releases its address
    /// space and descriptors. The record itself and its kernel stack survive:
    /// the CPU is still executing on that stack, so the scheduler reaps them
    /// after it has switched away.
    pub fn exit(&mut self, slot: Slot, status: i32) {
        let (prev, next) = {
            let record = self.record(slot);
            (record.prev, record.next)
        };
        // The record's own links are deliberately left intact so the
        // scheduler can still step off it.
        if let Some(next) = next {
            self.record_mut(next).prev = prev;
        }
        if let Some(prev) = prev {
            self.record_mut(prev).next = next;
        }
        if self.first == Some(slot) {
            self.first = next;
        }

        let record = self.record_mut(slot);
        record.address_space = SpaceRef::Kernel;
        for descriptor in record.fd.iter_mut() {
            *descriptor = None;
        }
        record.root = None;
        record.cwd = None;
        record.dead = true;

        log::info!("process {} exited with status {}", record.pid, status);
    }

    /// Registers an open descriptor in the lowest free table slot.
    ///
    /// Fails with `EMFILE` when the table is full.
    pub fn register_file_descriptor(
        &mut self,
        slot: Slot,
        handle: FileHandle,
    ) -> Result<usize, Errno> {
        let record = self.record_mut(slot);
        for (index, entry) in record.fd.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(handle);
                return Ok(index);
            }
        }
        Err(Errno::MFile)
    }

    pub fn current_slot(&self) -> Slot {
        self.current
    }

    pub fn idle_slot(&self) -> Slot {
        self.idle
    }

    pub fn first_slot(&self) -> Option<Slot> {
        self.first
    }

    /// Returns whether the arena still holds a record in `slot`.
    pub fn slot_in_use(&self, slot: Slot) -> bool {
        self.records.get(slot.0).is_some_and(Option::is_some)
    }

    /// Returns the record in `slot`.
    ///
    /// # Panics
    /// Panics if the slot is empty.
    pub fn record(&self, slot: Slot) -> &Process {
        self.records[slot.0].as_ref().expect("empty process slot")
    }

    pub(crate) fn record_mut(&mut self, slot: Slot) -> &mut Process {
        self.records[slot.0].as_mut().expect("empty process slot")
    }

    /// Frees an arena slot whose kernel stack is no longer in use.
    pub(crate) fn release_slot(&mut self, slot: Slot) {
        self.records[slot.0] = None;
    }
}
