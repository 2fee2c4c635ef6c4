//! Demo host: the syscalls the command-line front end offers to modules.

use std::rc::Rc;
use std::time::Instant;

use qvm_core::{SyscallArgs, SyscallContext, SyscallHandler, VmError, VmResult};

/// `print(const char *text)`
pub const SYS_PRINT: isize = 0;
/// `error(const char *text)`: aborts the call
pub const SYS_ERROR: isize = 1;
/// `milliseconds()` since the host started
pub const SYS_MILLISECONDS: isize = 2;

/// Console host for modules run from the command line.
pub struct ConsoleHost {
    started: Instant,
}

impl ConsoleHost {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            started: Instant::now(),
        })
    }

    fn text(ctx: &mut SyscallContext<'_>, address: isize) -> VmResult<String> {
        match ctx.read_string(address) {
            Err(VmError::NotSandboxed { .. }) => {
                // native modules hand over host pointers
                let ptr = ctx.to_host_address(address)?;
                if ptr.is_null() {
                    return Ok(String::new());
                }
                // SAFETY: native modules are trusted to pass NUL-terminated
                // strings.
                let text = unsafe { std::ffi::CStr::from_ptr(ptr.cast()) };
                Ok(text.to_string_lossy().into_owned())
            }
            other => other,
        }
    }
}

impl SyscallHandler for ConsoleHost {
    fn syscall(&self, ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<isize> {
        match args.number() {
            SYS_PRINT => {
                print!("{}", Self::text(ctx, args.get(1))?);
                Ok(0)
            }
            SYS_ERROR => {
                let message = Self::text(ctx, args.get(1))?;
                Err(VmError::Host(message))
            }
            SYS_MILLISECONDS => Ok(self.started.elapsed().as_millis() as isize),
            number => {
                tracing::warn!(module = ctx.caller_name()?, number, "unknown syscall");
                Err(VmError::Host(format!("bad syscall number {number}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qvm_core::{ExecutionMode, ImageBuilder, MemorySource, ModuleRegistry, Opcode, VmConfig};

    fn module(syscall: i32) -> Vec<u8> {
        ImageBuilder::new()
            .ops([
                (Opcode::Enter, 16),
                (Opcode::Const, 0),
                (Opcode::Arg, 8),
                (Opcode::Const, !syscall),
                (Opcode::Call, 0),
                (Opcode::Leave, 16),
            ])
            .literal(b"boom\0")
            .bss(0x1000)
            .build()
    }

    fn call(syscall: i32) -> VmResult<isize> {
        let source = MemorySource::new().with("vm/ui.qvm", module(syscall));
        let mut registry = ModuleRegistry::new(
            VmConfig {
                quiet: true,
                ..VmConfig::default()
            },
            source,
        );
        let handle = registry
            .create("ui", ConsoleHost::new(), ExecutionMode::Interpreted)
            .unwrap()
            .unwrap();
        registry.call(handle, 0, &[])
    }

    #[test]
    fn test_error_syscall_carries_message() {
        let err = call(SYS_ERROR as i32).unwrap_err();
        assert!(matches!(err, VmError::Host(ref m) if m == "boom"));
    }

    #[test]
    fn test_print_returns_zero() {
        assert_eq!(call(SYS_PRINT as i32).unwrap(), 0);
    }

    #[test]
    fn test_unknown_syscall() {
        assert!(matches!(call(40), Err(VmError::Host(_))));
    }
}
