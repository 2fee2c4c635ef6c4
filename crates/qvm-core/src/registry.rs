//! The module registry: a fixed table of loaded modules and the call bridge
//! between them and the host.
//!
//! The registry is single-threaded. Syscall handlers get it back through
//! [`SyscallContext`], so a module may call into any module, including
//! itself, from inside a syscall.

use std::rc::Rc;
use std::sync::Arc;

use qvm_bytecode::layout::{ENTRY_FRAME_SIZE, RETURN_SENTINEL};
use qvm_bytecode::{MAX_SYSCALL_ARGS, Program};
use qvm_profiler::{CallProfile, ProfileReport};

use crate::bridge::{CallArgs, SyscallArgs, SyscallContext, SyscallHandler};
use crate::config::{ExecutionMode, VmConfig};
use crate::diagnostics::{self, ModuleInfo, RegistryInfo};
use crate::error::{VmError, VmResult};
use crate::instance::{Backend, BytecodeModule, ModuleInstance, Symbols, VmHandle};
use crate::interpreter::{Exit, Interpreter, Trap};
use crate::loader;
use crate::memory::Sandbox;
use crate::native::{self, DylibLoader, NativeLoader, VmMainFn};
use crate::source::ImageSource;
use crate::symbols::{SymbolName, SymbolTable};

#[cfg(feature = "jit")]
use crate::compiled::{self, CompiledEntry, CraneliftTranslator, Translator};

/// Number of registry slots.
pub const MAX_VM: usize = 3;

#[derive(Default)]
struct Slot {
    generation: u32,
    instance: Option<ModuleInstance>,
}

/// One prepared call into a module, whatever its backend.
///
/// Bytecode variants carry an entry frame already written to the sandbox;
/// both paths honor the same frame layout.
enum Executable {
    Native(VmMainFn),
    Interpreted {
        program: Rc<Program>,
        ps: i32,
        stack_bottom: i32,
        profile: Option<Arc<CallProfile>>,
    },
    #[cfg(feature = "jit")]
    Compiled {
        code: Rc<qvm_jit::CompiledProgram>,
        entry: CompiledEntry,
    },
}

impl Executable {
    /// Run the call. The outer error is a host failure, the inner one a
    /// bytecode fault.
    fn invoke(
        self,
        registry: &mut ModuleRegistry,
        handle: VmHandle,
        selector: i32,
        args: &CallArgs,
    ) -> VmResult<Result<isize, Trap>> {
        match self {
            Self::Native(vm_main) => native::call(registry, handle, vm_main, selector, args).map(Ok),
            Self::Interpreted {
                program,
                ps,
                stack_bottom,
                profile,
            } => {
                let outcome =
                    registry.interpret(handle, &program, ps, stack_bottom, profile.as_deref())?;
                Ok(outcome.map(|value| value as isize))
            }
            #[cfg(feature = "jit")]
            Self::Compiled { code, entry } => {
                let outcome = compiled::run(registry, handle, &code, entry)?;
                Ok(outcome.map(|value| value as isize))
            }
        }
    }
}

/// Owner of every loaded module.
pub struct ModuleRegistry {
    config: VmConfig,
    source: Box<dyn ImageSource>,
    native_loader: Box<dyn NativeLoader>,
    #[cfg(feature = "jit")]
    translator: Box<dyn Translator>,
    slots: [Slot; MAX_VM],
    current: Option<VmHandle>,
    last: Option<VmHandle>,
    forced_unload: bool,
    depth: u32,
    /// Modules force-freed while running, kept alive until the outermost
    /// call returns because their code or memory may still be in use.
    retired: Vec<(VmHandle, ModuleInstance)>,
}

impl ModuleRegistry {
    /// Registry reading images from `source`.
    pub fn new(config: VmConfig, source: impl ImageSource + 'static) -> Self {
        Self {
            config,
            source: Box::new(source),
            native_loader: Box::new(DylibLoader),
            #[cfg(feature = "jit")]
            translator: Box::new(CraneliftTranslator),
            slots: Default::default(),
            current: None,
            last: None,
            forced_unload: false,
            depth: 0,
            retired: Vec::new(),
        }
    }

    /// Replace the native library loader.
    pub fn with_native_loader(mut self, loader: impl NativeLoader + 'static) -> Self {
        self.native_loader = Box::new(loader);
        self
    }

    /// Replace the bytecode translator.
    #[cfg(feature = "jit")]
    pub fn with_translator(mut self, translator: impl Translator + 'static) -> Self {
        self.translator = Box::new(translator);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    // ==================== Lifecycle ====================

    /// Load `name` with the mode configured for it.
    pub fn create_configured(
        &mut self,
        name: &str,
        handler: Rc<dyn SyscallHandler>,
    ) -> VmResult<Option<VmHandle>> {
        let mode = self.config.mode_for(name);
        self.create(name, handler, mode)
    }

    /// Load a module.
    ///
    /// A module that is already loaded (compared case-insensitively) is
    /// returned as is. `Ok(None)` means no image was found; nothing stays
    /// allocated in that case.
    pub fn create(
        &mut self,
        name: &str,
        handler: Rc<dyn SyscallHandler>,
        mode: ExecutionMode,
    ) -> VmResult<Option<VmHandle>> {
        if name.is_empty() {
            tracing::error!("create called with an empty module name");
            return Err(VmError::BadParameters);
        }
        if let Some(handle) = self.find(name) {
            return Ok(Some(handle));
        }
        let Some(slot) = self.slots.iter().position(|s| s.instance.is_none()) else {
            tracing::error!(module = name, "no free vm slot");
            return Err(VmError::NoFreeSlot {
                name: name.to_string(),
            });
        };

        let mut mode = mode;
        if mode == ExecutionMode::Native {
            tracing::info!(module = name, "loading dll file");
            match self.native_loader.load(name, &self.config.search_dirs()) {
                Ok(module) => {
                    let handle = self.install(slot, name, handler, Backend::Native(module));
                    return Ok(Some(handle));
                }
                Err(error) => {
                    tracing::warn!(module = name, %error, "failed to load dll, looking for qvm");
                    mode = ExecutionMode::Compiled;
                }
            }
        }

        let Some(image) = loader::read_image(self.source.as_ref(), name, self.config.quiet)? else {
            return Ok(None);
        };
        let mut module = loader::instantiate(image, self.config.profile);
        if mode == ExecutionMode::Compiled {
            self.translate(name, &mut module);
        }

        let size = module.sandbox.size();
        let handle = self.install(slot, name, handler, Backend::Bytecode(module));
        let mode = self.slots[slot]
            .instance
            .as_ref()
            .map_or(ExecutionMode::Interpreted, ModuleInstance::mode);
        if self.config.quiet {
            tracing::debug!(module = name, %mode, data_size = size, "vm loaded");
        } else {
            tracing::info!(module = name, %mode, data_size = size, "vm loaded");
        }
        Ok(Some(handle))
    }

    #[cfg(feature = "jit")]
    fn translate(&self, name: &str, module: &mut BytecodeModule) {
        if !self.config.jit_enabled() {
            tracing::info!(module = name, "bytecode compiler disabled, using interpreter");
            return;
        }
        let options = qvm_jit::TranslateOptions {
            data_mask: module.sandbox.mask(),
            stack_bottom: module.stack_bottom,
            profile: module.profile.is_some(),
        };
        match self.translator.translate(name, &module.program, &options) {
            Ok(code) => module.compiled = Some(Rc::new(code)),
            Err(error) => {
                tracing::warn!(module = name, %error, "compilation failed, using interpreter");
            }
        }
    }

    #[cfg(not(feature = "jit"))]
    fn translate(&self, name: &str, _module: &mut BytecodeModule) {
        tracing::info!(
            module = name,
            "built without a bytecode compiler, using interpreter"
        );
    }

    fn install(
        &mut self,
        slot: usize,
        name: &str,
        handler: Rc<dyn SyscallHandler>,
        backend: Backend,
    ) -> VmHandle {
        let entry = &mut self.slots[slot];
        entry.instance = Some(ModuleInstance {
            name: Rc::from(name),
            handler,
            backend,
            call_level: 0,
            symbols: Symbols::Unloaded,
        });
        VmHandle {
            slot: slot as u32,
            generation: entry.generation,
        }
    }

    /// Unload a module.
    ///
    /// Fails for a running module unless a forced unload
    /// ([`ModuleRegistry::recover`]) is in progress.
    pub fn free(&mut self, handle: VmHandle) -> VmResult<()> {
        let instance = self.instance(handle)?;
        if instance.is_running() {
            if !self.forced_unload {
                tracing::error!(module = %instance.name, "free on running vm");
                return Err(VmError::FreeWhileRunning {
                    name: instance.name.to_string(),
                });
            }
            tracing::warn!(module = %instance.name, "forcefully unloading vm");
        }

        let slot = &mut self.slots[handle.slot()];
        let Some(instance) = slot.instance.take() else {
            return Err(VmError::StaleHandle);
        };
        slot.generation = slot.generation.wrapping_add(1);

        if let Some(sandbox) = instance.sandbox() {
            if !sandbox.guard_intact() {
                tracing::warn!(
                    module = %instance.name,
                    base = ?sandbox.segment().as_ptr(),
                    "data segment guard region was overwritten"
                );
            }
        }
        tracing::debug!(module = %instance.name, "vm freed");

        if instance.is_running() {
            self.retired.push((handle, instance));
        }
        if self.current == Some(handle) {
            self.current = None;
        }
        if self.last == Some(handle) {
            self.last = None;
        }
        Ok(())
    }

    /// Unload every module.
    pub fn clear_all(&mut self) -> VmResult<()> {
        let mut first_error = None;
        for handle in self.handles().collect::<Vec<_>>() {
            if let Err(error) = self.free(handle) {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Top-level recovery after an error: unload every module, running or
    /// not.
    pub fn recover(&mut self, error: &VmError) {
        tracing::warn!(%error, severity = ?error.severity(), "unloading all vms");
        self.forced_unload = true;
        for handle in self.handles().collect::<Vec<_>>() {
            if let Ok(instance) = self.instance(handle) {
                tracing::warn!(module = %instance.name, "unloading vm");
            }
            if let Err(error) = self.free(handle) {
                tracing::warn!(%error, "unload failed");
            }
        }
        self.forced_unload = false;
    }

    /// Reload a module's data in place.
    ///
    /// Native modules cannot be reset in place: they are unloaded and loaded
    /// again, so the returned handle differs from `handle`.
    pub fn restart(&mut self, handle: VmHandle) -> VmResult<VmHandle> {
        let instance = self.instance(handle)?;
        let name = Rc::clone(&instance.name);
        if instance.is_running() {
            return Err(VmError::Running {
                name: name.to_string(),
            });
        }

        if let Backend::Native(_) = instance.backend {
            let handler = Rc::clone(&instance.handler);
            self.free(handle)?;
            return self
                .create(&name, handler, ExecutionMode::Native)?
                .ok_or_else(|| VmError::RestartFailed {
                    name: name.to_string(),
                });
        }

        tracing::info!(module = %name, "vm restart");
        let Some(image) = loader::read_image(self.source.as_ref(), &name, self.config.quiet)? else {
            self.free(handle)?;
            return Err(VmError::RestartFailed {
                name: name.to_string(),
            });
        };
        let module = self
            .instance_mut(handle)?
            .bytecode_mut()
            .ok_or(VmError::StaleHandle)?;
        loader::reload(module, &image, &name)?;
        Ok(handle)
    }

    // ==================== Lookup ====================

    /// Module named `name`, compared case-insensitively.
    pub fn find(&self, name: &str) -> Option<VmHandle> {
        self.handles().find(|handle| {
            self.instance(*handle)
                .is_ok_and(|instance| instance.name.eq_ignore_ascii_case(name))
        })
    }

    /// Handles of all loaded modules in slot order.
    pub fn handles(&self) -> impl Iterator<Item = VmHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry.instance.as_ref().map(|_| VmHandle {
                slot: slot as u32,
                generation: entry.generation,
            })
        })
    }

    /// The module a handle refers to.
    pub fn instance(&self, handle: VmHandle) -> VmResult<&ModuleInstance> {
        self.slots
            .get(handle.slot())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.instance.as_ref())
            .ok_or(VmError::StaleHandle)
    }

    fn instance_mut(&mut self, handle: VmHandle) -> VmResult<&mut ModuleInstance> {
        self.slots
            .get_mut(handle.slot())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.instance.as_mut())
            .ok_or(VmError::StaleHandle)
    }

    /// Like `instance_mut`, but a module unloaded mid-call is reported by
    /// name.
    fn running_instance(&mut self, handle: VmHandle) -> VmResult<&mut ModuleInstance> {
        if self.instance(handle).is_err() {
            return Err(self.gone(handle));
        }
        self.instance_mut(handle)
    }

    fn gone(&self, handle: VmHandle) -> VmError {
        self.retired
            .iter()
            .find(|(retired, _)| *retired == handle)
            .map_or(VmError::StaleHandle, |(_, instance)| VmError::InstanceGone {
                name: instance.name.to_string(),
            })
    }

    /// Module currently executing, if any.
    pub fn current(&self) -> Option<VmHandle> {
        self.current.filter(|h| self.instance(*h).is_ok())
    }

    /// Module most recently called.
    pub fn last(&self) -> Option<VmHandle> {
        self.last.filter(|h| self.instance(*h).is_ok())
    }

    /// Calls in progress into `handle`.
    pub fn call_level(&self, handle: VmHandle) -> VmResult<u32> {
        Ok(self.instance(handle)?.call_level)
    }

    // ==================== Memory ====================

    /// Sandbox of a bytecode module.
    pub fn sandbox(&self, handle: VmHandle) -> VmResult<&Sandbox> {
        let instance = self.instance(handle)?;
        instance.sandbox().ok_or_else(|| VmError::NotSandboxed {
            name: instance.name.to_string(),
        })
    }

    /// Mutable sandbox of a bytecode module.
    pub fn sandbox_mut(&mut self, handle: VmHandle) -> VmResult<&mut Sandbox> {
        let instance = self.instance_mut(handle)?;
        let name = Rc::clone(&instance.name);
        instance
            .bytecode_mut()
            .map(|module| &mut module.sandbox)
            .ok_or_else(|| VmError::NotSandboxed {
                name: name.to_string(),
            })
    }

    /// Host pointer for a module address.
    ///
    /// Address 0 is null. Bytecode addresses are masked into the module's
    /// segment; native modules already use host addresses and get `address`
    /// back unchanged.
    pub fn to_host_address(&mut self, handle: VmHandle, address: isize) -> VmResult<*mut u8> {
        if address == 0 {
            return Ok(std::ptr::null_mut());
        }
        match &mut self.instance_mut(handle)?.backend {
            Backend::Native(_) => Ok(address as *mut u8),
            Backend::Bytecode(module) => Ok(module.sandbox.host_address(address as i32)),
        }
    }

    // ==================== Calls ====================

    /// Call into a module.
    ///
    /// `args` beyond [`qvm_bytecode::MAX_CALL_ARGS`] are dropped. The
    /// previously current module is current again when this returns, error
    /// or not.
    pub fn call(&mut self, handle: VmHandle, selector: i32, args: &[i32]) -> VmResult<isize> {
        let args = CallArgs::new(args);
        let instance = self.instance_mut(handle)?;
        instance.call_level += 1;
        let name = Rc::clone(&instance.name);

        let previous = self.current.replace(handle);
        self.last = Some(handle);
        self.depth += 1;
        if self.config.debug_level > 0 {
            tracing::debug!(module = %name, selector, "vm call");
        }

        let result = self.invoke(handle, selector, &args);

        self.depth -= 1;
        if let Ok(instance) = self.instance_mut(handle) {
            instance.call_level -= 1;
        }
        self.current = previous;
        if self.depth == 0 {
            self.retired.clear();
        }
        if self.config.debug_level > 0 {
            tracing::debug!(module = %name, selector, ok = result.is_ok(), "vm call returned");
        }
        result
    }

    fn invoke(&mut self, handle: VmHandle, selector: i32, args: &CallArgs) -> VmResult<isize> {
        let (executable, entry_stack) = self.prepare(handle, selector, args)?;
        let outcome = executable.invoke(self, handle, selector, args);

        match self.instance_mut(handle) {
            Ok(instance) => {
                if let Some(module) = instance.bytecode_mut() {
                    module.program_stack = entry_stack;
                }
            }
            // unloaded from inside one of its own syscalls
            Err(_) if outcome.is_ok() => return Err(self.gone(handle)),
            Err(_) => {}
        }

        match outcome? {
            Ok(value) => Ok(value),
            Err(trap) => Err(self.fault_error(handle, trap)),
        }
    }

    /// Write the entry frame (bytecode) and pick the path for this call.
    /// Also returns the program stack to restore afterwards.
    fn prepare(
        &mut self,
        handle: VmHandle,
        selector: i32,
        args: &CallArgs,
    ) -> VmResult<(Executable, i32)> {
        let instance = self.instance_mut(handle)?;
        let module = match &mut instance.backend {
            Backend::Native(native) => return Ok((Executable::Native(native.entry_point()), 0)),
            Backend::Bytecode(module) => module,
        };

        let entry_stack = module.program_stack;
        let ps = entry_stack.wrapping_sub(ENTRY_FRAME_SIZE);
        let memory = &mut module.sandbox;
        memory.store_word(ps, RETURN_SENTINEL);
        memory.store_word(ps.wrapping_add(4), 0);
        memory.store_word(ps.wrapping_add(8), selector);
        for (i, &arg) in args.as_array().iter().enumerate() {
            memory.store_word(ps.wrapping_add(12 + 4 * i as i32), arg);
        }

        #[cfg(feature = "jit")]
        if let Some(code) = &module.compiled {
            let entry = CompiledEntry {
                data_base: module.sandbox.as_mut_ptr(),
                data_mask: module.sandbox.mask(),
                ps,
                profile: module.profile.clone(),
            };
            return Ok((
                Executable::Compiled {
                    code: Rc::clone(code),
                    entry,
                },
                entry_stack,
            ));
        }

        Ok((
            Executable::Interpreted {
                program: Rc::clone(&module.program),
                ps,
                stack_bottom: module.stack_bottom,
                profile: module.profile.clone(),
            },
            entry_stack,
        ))
    }

    fn interpret(
        &mut self,
        handle: VmHandle,
        program: &Program,
        ps: i32,
        stack_bottom: i32,
        profile: Option<&CallProfile>,
    ) -> VmResult<Result<i32, Trap>> {
        let mut interpreter = Interpreter::new(ps);
        loop {
            let instance = self.running_instance(handle)?;
            let Some(module) = instance.bytecode_mut() else {
                return Err(VmError::StaleHandle);
            };
            match interpreter.run(program, &mut module.sandbox, stack_bottom, profile) {
                Ok(Exit::Returned(value)) => return Ok(Ok(value)),
                Ok(Exit::Syscall { ps }) => {
                    let result = self.bytecode_syscall(handle, ps)?;
                    interpreter.resume(result);
                }
                Err(trap) => return Ok(Err(trap)),
            }
        }
    }

    /// Serve a syscall trapped by bytecode whose frame is at `ps`.
    pub(crate) fn bytecode_syscall(&mut self, handle: VmHandle, ps: i32) -> VmResult<i32> {
        let debug_level = self.config.debug_level;
        let instance = self.running_instance(handle)?;
        let handler = Rc::clone(&instance.handler);
        let name = Rc::clone(&instance.name);
        let Some(module) = instance.bytecode_mut() else {
            return Err(VmError::StaleHandle);
        };

        let mut words = [0i32; MAX_SYSCALL_ARGS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = module.sandbox.load_word(ps.wrapping_add(4 + 4 * i as i32));
        }
        // CALL left its return site at [ps]
        module.last_pc = Some(module.sandbox.load_word(ps).wrapping_sub(1));
        // nested calls build their frames below this one
        module.program_stack = ps.wrapping_sub(4);

        if debug_level > 1 {
            tracing::debug!(
                module = %name,
                syscall = words[0],
                args = ?&words[1..5],
                "syscall"
            );
        }
        let args = SyscallArgs::from_words(&words);
        let result = handler.syscall(&mut SyscallContext::new(self, handle), &args)?;
        Ok(result as i32)
    }

    /// Serve a syscall from a native module.
    pub(crate) fn native_syscall(&mut self, handle: VmHandle, args: &SyscallArgs) -> VmResult<isize> {
        let handler = Rc::clone(&self.running_instance(handle)?.handler);
        if self.config.debug_level > 1 {
            tracing::debug!(syscall = args.number(), "native syscall");
        }
        handler.syscall(&mut SyscallContext::new(self, handle), args)
    }

    fn fault_error(&mut self, handle: VmHandle, trap: Trap) -> VmError {
        if let Some(module) = self
            .instance_mut(handle)
            .ok()
            .and_then(ModuleInstance::bytecode_mut)
        {
            module.last_pc = Some(trap.pc);
        }
        let symbol = self.symbol_name(handle, trap.pc).to_string();
        let module = match self.instance(handle) {
            Ok(instance) => instance.name.to_string(),
            Err(_) => match self.gone(handle) {
                VmError::InstanceGone { name } => name,
                _ => String::new(),
            },
        };
        tracing::error!(%module, fault = %trap.fault, pc = trap.pc, %symbol, "vm fault");
        VmError::Fault {
            module,
            fault: trap.fault,
            pc: trap.pc,
            symbol,
        }
    }

    // ==================== Diagnostics ====================

    fn ensure_symbols(&mut self, handle: VmHandle) {
        let Ok(instance) = self.instance(handle) else {
            return;
        };
        if !matches!(instance.symbols, Symbols::Unloaded) {
            return;
        }
        let name = Rc::clone(&instance.name);
        let mut symbols = Symbols::Missing;
        for path in [format!("vm/{name}.map"), format!("{name}.map")] {
            match self.source.read(&path) {
                Ok(Some(bytes)) => {
                    let table = SymbolTable::parse(&String::from_utf8_lossy(&bytes));
                    tracing::debug!(module = %name, %path, symbols = table.len(), "loaded map file");
                    symbols = Symbols::Loaded(table);
                    break;
                }
                Ok(None) => {}
                Err(error) => tracing::debug!(module = %name, %path, %error, "unreadable map file"),
            }
        }
        if let Ok(instance) = self.instance_mut(handle) {
            instance.symbols = symbols;
        }
    }

    /// Symbol containing instruction `pc`, loading the map file on first use.
    pub fn symbol_name(&mut self, handle: VmHandle, pc: i32) -> SymbolName {
        self.ensure_symbols(handle);
        let table = self.instance(handle).ok().and_then(ModuleInstance::symbol_table);
        SymbolName::resolve(table, pc)
    }

    /// Call profile of the last called module; counters are reset.
    pub fn profile_report(&mut self) -> Option<ProfileReport> {
        let handle = self.last()?;
        self.profile_report_for(handle).ok().flatten()
    }

    /// Call profile of `handle`, or `None` when profiling is off for it.
    /// Counters are reset.
    pub fn profile_report_for(&mut self, handle: VmHandle) -> VmResult<Option<ProfileReport>> {
        self.ensure_symbols(handle);
        let instance = self.instance(handle)?;
        let Some(profile) = instance.bytecode().and_then(|m| m.profile.as_ref()) else {
            return Ok(None);
        };
        let snapshot = profile.snapshot();
        profile.reset();
        let table = instance.symbol_table();
        let report = ProfileReport::build(&instance.name, &snapshot, |pc| {
            table
                .and_then(|t| t.lookup(pc as u32))
                .unwrap_or_else(|| format!("0x{pc:x}"))
        });
        Ok(Some(report))
    }

    /// Summary of every loaded module.
    pub fn info_report(&self) -> RegistryInfo {
        RegistryInfo {
            modules: self
                .handles()
                .filter_map(|handle| self.instance(handle).ok())
                .map(ModuleInfo::from_instance)
                .collect(),
        }
    }

    /// Write a crash summary of the current (else last) module into `buf`.
    ///
    /// Returns the number of bytes written; output that does not fit is cut.
    pub fn crash_dump(&self, buf: &mut [u8]) -> usize {
        let Some(instance) = self
            .current()
            .or_else(|| self.last())
            .and_then(|handle| self.instance(handle).ok())
        else {
            return 0;
        };
        diagnostics::write_crash_dump(instance, buf)
    }
}
