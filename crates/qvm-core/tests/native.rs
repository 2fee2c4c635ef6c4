//! Native modules, using in-process functions in place of a shared library.

use std::path::PathBuf;
use std::sync::OnceLock;

use qvm_core::native::{SyscallTrampoline, VariadicSyscall};
use qvm_core::{
    ExecutionMode, ImageBuilder, MemorySource, ModuleRegistry, NativeError, NativeLoader,
    NativeModule, Opcode, VmConfig, VmError, syscall_fn,
};

static SYSCALL: OnceLock<SyscallTrampoline> = OnceLock::new();

unsafe extern "C" fn dll_entry(syscall: SyscallTrampoline) {
    let _ = SYSCALL.set(syscall);
}

/// Called the way a C module calls its `syscall` pointer.
fn variadic() -> Option<VariadicSyscall> {
    let trampoline = *SYSCALL.get()?;
    // SAFETY: the trampoline accepts integer variadic calls.
    Some(unsafe { std::mem::transmute::<SyscallTrampoline, VariadicSyscall>(trampoline) })
}

/// Selector 0 adds its first two arguments; selector 1 returns
/// `syscall(3, arg0) + 1`; selector 2 passes eight arguments to syscall 9.
#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn vm_main(
    command: i32,
    a0: i32,
    a1: i32,
    _a2: i32,
    _a3: i32,
    _a4: i32,
    _a5: i32,
    _a6: i32,
    _a7: i32,
    _a8: i32,
    _a9: i32,
) -> isize {
    match (command, variadic()) {
        (0, _) => (a0 + a1) as isize,
        (1, Some(syscall)) => unsafe { syscall(3, a0 as isize) + 1 },
        (2, Some(syscall)) => unsafe {
            syscall(
                9,
                a0 as isize,
                a1 as isize,
                3isize,
                4isize,
                5isize,
                6isize,
                7isize,
                -8isize,
            )
        },
        _ => -1,
    }
}

/// Serves `qagame` from the functions above and nothing else.
struct InProcessLoader;

impl NativeLoader for InProcessLoader {
    fn load(&self, name: &str, dirs: &[PathBuf]) -> Result<NativeModule, NativeError> {
        if name != "qagame" {
            return Err(NativeError::NotFound {
                file: name.to_string(),
                searched: dirs.to_vec(),
            });
        }
        // SAFETY: both functions follow the native module contract.
        Ok(unsafe { NativeModule::from_fns(dll_entry, vm_main) })
    }
}

fn registry() -> ModuleRegistry {
    let ui = ImageBuilder::new()
        .ops([
            (Opcode::Enter, 8),
            (Opcode::Const, 1),
            (Opcode::Leave, 8),
        ])
        .bss(0x1000);
    let source = MemorySource::new().with("vm/ui.qvm", ui.build());
    ModuleRegistry::new(
        VmConfig {
            quiet: true,
            ..VmConfig::default()
        },
        source,
    )
    .with_native_loader(InProcessLoader)
}

#[test]
fn test_native_call() {
    let mut registry = registry();
    let handle = registry
        .create("qagame", syscall_fn(|_, _| Ok(0)), ExecutionMode::Native)
        .unwrap()
        .unwrap();
    assert_eq!(
        registry.instance(handle).unwrap().mode(),
        ExecutionMode::Native
    );
    assert_eq!(registry.call(handle, 0, &[40, 2]).unwrap(), 42);
    assert!(matches!(
        registry.sandbox(handle),
        Err(VmError::NotSandboxed { .. })
    ));
}

#[test]
fn test_native_syscall() {
    let mut registry = registry();
    let handler = syscall_fn(|ctx, args| {
        assert_eq!(args.number(), 3);
        assert_eq!(ctx.caller_name()?, "qagame");
        // native modules pass host addresses through untouched
        assert_eq!(ctx.to_host_address(0x1234)?, 0x1234 as *mut u8);
        assert!(matches!(ctx.memory(), Err(VmError::NotSandboxed { .. })));
        Ok(args.get(1) * 2)
    });
    let handle = registry
        .create("qagame", handler, ExecutionMode::Native)
        .unwrap()
        .unwrap();
    assert_eq!(registry.call(handle, 1, &[5]).unwrap(), 11);
    assert_eq!(registry.call_level(handle).unwrap(), 0);
}

#[test]
fn test_native_syscall_arguments_arrive_in_order() {
    let mut registry = registry();
    let handler = syscall_fn(|_, args| {
        assert_eq!(args.number(), 9);
        let passed: Vec<isize> = (1..=8).map(|i| args.get(i)).collect();
        assert_eq!(passed, [1, 2, 3, 4, 5, 6, 7, -8]);
        Ok(args.as_slice()[1..=8].iter().sum())
    });
    let handle = registry
        .create("qagame", handler, ExecutionMode::Native)
        .unwrap()
        .unwrap();
    assert_eq!(registry.call(handle, 2, &[1, 2]).unwrap(), 20);
}

#[test]
fn test_native_handler_error_is_reported() {
    let mut registry = registry();
    let handler = syscall_fn(|_, _| Err(VmError::Host("no such syscall".into())));
    let handle = registry
        .create("qagame", handler, ExecutionMode::Native)
        .unwrap()
        .unwrap();
    let err = registry.call(handle, 1, &[5]).unwrap_err();
    assert!(matches!(err, VmError::Host(ref message) if message == "no such syscall"));

    // the next call starts clean
    assert_eq!(registry.call(handle, 0, &[1, 1]).unwrap(), 2);
}

#[test]
fn test_missing_native_falls_back_to_bytecode() {
    let mut registry = registry();
    let handle = registry
        .create("ui", syscall_fn(|_, _| Ok(0)), ExecutionMode::Native)
        .unwrap()
        .unwrap();
    assert_ne!(
        registry.instance(handle).unwrap().mode(),
        ExecutionMode::Native
    );
    assert_eq!(registry.call(handle, 0, &[]).unwrap(), 1);
}

#[test]
fn test_native_restart_reloads() {
    let mut registry = registry();
    let handle = registry
        .create("qagame", syscall_fn(|_, _| Ok(0)), ExecutionMode::Native)
        .unwrap()
        .unwrap();
    let restarted = registry.restart(handle).unwrap();
    assert_ne!(restarted, handle);
    assert!(registry.instance(handle).is_err());
    assert_eq!(registry.call(restarted, 0, &[2, 3]).unwrap(), 5);
}

#[test]
fn test_info_lists_native_modules() {
    let mut registry = registry();
    registry
        .create("qagame", syscall_fn(|_, _| Ok(0)), ExecutionMode::Native)
        .unwrap();
    let text = registry.info_report().to_string();
    assert!(text.contains("qagame : native\n"));
    assert!(!text.contains("code length"));
}
