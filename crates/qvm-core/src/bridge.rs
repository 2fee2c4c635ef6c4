//! Host ↔ module call bridge types.
//!
//! Host code enters a module with [`CallArgs`]; modules come back into the
//! host through the [`SyscallHandler`] registered at creation, which sees the
//! caller's memory through a [`SyscallContext`].

use std::rc::Rc;

use qvm_bytecode::{MAX_CALL_ARGS, MAX_SYSCALL_ARGS};

use crate::error::VmResult;
use crate::instance::VmHandle;
use crate::memory::Sandbox;
use crate::registry::ModuleRegistry;

/// Fixed argument block of a host → module call.
///
/// Arguments past [`MAX_CALL_ARGS`] are dropped; missing ones are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallArgs([i32; MAX_CALL_ARGS]);

impl CallArgs {
    /// Pack `args`, truncating to [`MAX_CALL_ARGS`].
    pub fn new(args: &[i32]) -> Self {
        if args.len() > MAX_CALL_ARGS {
            tracing::debug!(
                given = args.len(),
                kept = MAX_CALL_ARGS,
                "call arguments truncated"
            );
        }
        let mut packed = [0; MAX_CALL_ARGS];
        let count = args.len().min(MAX_CALL_ARGS);
        packed[..count].copy_from_slice(&args[..count]);
        Self(packed)
    }

    /// Argument `index`, zero past the end.
    pub fn get(&self, index: usize) -> i32 {
        self.0.get(index).copied().unwrap_or(0)
    }

    /// All slots.
    pub fn as_array(&self) -> &[i32; MAX_CALL_ARGS] {
        &self.0
    }
}

impl From<&[i32]> for CallArgs {
    fn from(args: &[i32]) -> Self {
        Self::new(args)
    }
}

/// Slots of a module → host call. Slot 0 is the syscall number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallArgs([isize; MAX_SYSCALL_ARGS]);

impl SyscallArgs {
    /// Pack `slots`, truncating to [`MAX_SYSCALL_ARGS`].
    pub fn new(slots: &[isize]) -> Self {
        let mut packed = [0; MAX_SYSCALL_ARGS];
        let count = slots.len().min(MAX_SYSCALL_ARGS);
        packed[..count].copy_from_slice(&slots[..count]);
        Self(packed)
    }

    /// Widen 32-bit bytecode words, sign-extending.
    pub fn from_words(words: &[i32; MAX_SYSCALL_ARGS]) -> Self {
        Self(words.map(|w| w as isize))
    }

    /// Syscall number.
    pub fn number(&self) -> isize {
        self.0[0]
    }

    /// Slot `index` (1-based for arguments), zero past the end.
    pub fn get(&self, index: usize) -> isize {
        self.0.get(index).copied().unwrap_or(0)
    }

    /// Slot `index` truncated to 32 bits, as bytecode modules see it.
    pub fn int(&self, index: usize) -> i32 {
        self.get(index) as i32
    }

    /// Slot `index` reinterpreted as a float's bits.
    pub fn float(&self, index: usize) -> f32 {
        f32::from_bits(self.int(index) as u32)
    }

    /// All slots.
    pub fn as_slice(&self) -> &[isize] {
        &self.0
    }
}

/// Host side of a module's syscalls.
///
/// Any `Fn(&mut SyscallContext, &SyscallArgs) -> VmResult<isize>` is a
/// handler; see [`syscall_fn`].
pub trait SyscallHandler {
    /// Serve one syscall. An error aborts the whole module call.
    fn syscall(&self, ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<isize>;
}

impl<F> SyscallHandler for F
where
    F: Fn(&mut SyscallContext<'_>, &SyscallArgs) -> VmResult<isize>,
{
    fn syscall(&self, ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<isize> {
        self(ctx, args)
    }
}

/// Wrap a closure as a shareable handler.
pub fn syscall_fn<F>(handler: F) -> Rc<dyn SyscallHandler>
where
    F: Fn(&mut SyscallContext<'_>, &SyscallArgs) -> VmResult<isize> + 'static,
{
    Rc::new(handler)
}

/// What a syscall handler can reach: the registry (for nested calls) and the
/// calling module's memory.
pub struct SyscallContext<'r> {
    registry: &'r mut ModuleRegistry,
    caller: VmHandle,
}

impl<'r> SyscallContext<'r> {
    pub(crate) fn new(registry: &'r mut ModuleRegistry, caller: VmHandle) -> Self {
        Self { registry, caller }
    }

    /// Module that issued the syscall.
    pub fn caller(&self) -> VmHandle {
        self.caller
    }

    /// Name of the calling module.
    pub fn caller_name(&self) -> VmResult<&str> {
        Ok(self.registry.instance(self.caller)?.name())
    }

    /// The registry, for nested calls or lifecycle operations.
    pub fn registry(&mut self) -> &mut ModuleRegistry {
        self.registry
    }

    /// Nested host → module call, possibly back into the caller.
    pub fn call(&mut self, handle: VmHandle, selector: i32, args: &[i32]) -> VmResult<isize> {
        self.registry.call(handle, selector, args)
    }

    /// The caller's sandbox. Fails for native modules.
    pub fn memory(&mut self) -> VmResult<&mut Sandbox> {
        self.registry.sandbox_mut(self.caller)
    }

    /// Read a word at a module address.
    pub fn read_i32(&mut self, address: isize) -> VmResult<i32> {
        Ok(self.memory()?.read_i32(address as i32))
    }

    /// Write a word at a module address.
    pub fn write_i32(&mut self, address: isize, value: i32) -> VmResult<()> {
        self.memory()?.write_i32(address as i32, value);
        Ok(())
    }

    /// Copy up to `len` bytes out of module memory.
    pub fn read_bytes(&mut self, address: isize, len: usize) -> VmResult<Vec<u8>> {
        Ok(self.memory()?.read_bytes(address as i32, len).to_vec())
    }

    /// Copy bytes into module memory; returns how many fit.
    pub fn write_bytes(&mut self, address: isize, data: &[u8]) -> VmResult<usize> {
        Ok(self.memory()?.write_bytes(address as i32, data))
    }

    /// NUL-terminated string in module memory.
    pub fn read_string(&mut self, address: isize) -> VmResult<String> {
        Ok(self.memory()?.read_string(address as i32))
    }

    /// Translate a module pointer for the caller. Native modules get their
    /// value back unchanged.
    pub fn to_host_address(&mut self, address: isize) -> VmResult<*mut u8> {
        self.registry.to_host_address(self.caller, address)
    }
}
