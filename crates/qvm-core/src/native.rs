//! Native backend: modules built as host shared libraries.
//!
//! A native module exports `dllEntry(syscall)` and `vmMain(cmd, a0..a9)`.
//! `dllEntry` is handed a C-ABI trampoline that routes the module's
//! syscalls back to the registry. Native code shares the host address
//! space, so none of the sandbox guarantees apply.

use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};

use libloading::Library;
use thiserror::Error;

use crate::bridge::{CallArgs, SyscallArgs};
use crate::error::{VmError, VmResult};
use crate::instance::VmHandle;
use crate::registry::ModuleRegistry;

/// Entry the module calls for every syscall.
///
/// Modules declare it as `intptr_t (*)(intptr_t, ...)`. Integer variadic
/// arguments travel in the same registers and stack slots as sixteen fixed
/// `isize` parameters on the SysV and Win64 ABIs, so the trampoline reads
/// all sixteen and the handler ignores slots the module did not pass.
pub type SyscallTrampoline = extern "C" fn(
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
) -> isize;

/// The trampoline as native modules call it.
pub type VariadicSyscall = unsafe extern "C" fn(isize, ...) -> isize;

/// `dllEntry` export.
pub type DllEntryFn = unsafe extern "C" fn(SyscallTrampoline);

/// `vmMain` export: selector followed by ten integer arguments.
pub type VmMainFn =
    unsafe extern "C" fn(i32, i32, i32, i32, i32, i32, i32, i32, i32, i32, i32) -> isize;

/// Why a native library could not be used.
#[derive(Debug, Error)]
pub enum NativeError {
    /// No library file in any search directory
    #[error("{file} not found in {searched:?}")]
    NotFound {
        /// Library file name
        file: String,
        /// Directories searched
        searched: Vec<PathBuf>,
    },

    /// The dynamic loader rejected the file
    #[error("failed to load {}: {source}", path.display())]
    Load {
        /// Library path
        path: PathBuf,
        /// Loader error
        #[source]
        source: libloading::Error,
    },

    /// A required export is missing
    #[error("{} does not export {symbol}", path.display())]
    MissingSymbol {
        /// Library path
        path: PathBuf,
        /// Export name
        symbol: &'static str,
        /// Loader error
        #[source]
        source: libloading::Error,
    },
}

/// File name of the native library for `name` on this host, e.g.
/// `qagamex86_64.so`.
pub fn library_file_name(name: &str) -> String {
    format!(
        "{name}{}{}",
        std::env::consts::ARCH,
        std::env::consts::DLL_SUFFIX
    )
}

/// A loaded native module.
pub struct NativeModule {
    vm_main: VmMainFn,
    path: Option<PathBuf>,
    // Dropped last: the function pointers above point into it.
    _library: Option<Library>,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl NativeModule {
    /// Load a library and hand it the syscall trampoline.
    ///
    /// # Safety
    ///
    /// Loading runs the library's initializers, and its `dllEntry`/`vmMain`
    /// exports must have the documented signatures.
    pub unsafe fn open(path: &Path) -> Result<Self, NativeError> {
        let library = unsafe { Library::new(path) }.map_err(|source| NativeError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let symbol = |name: &'static str, source| NativeError::MissingSymbol {
            path: path.to_path_buf(),
            symbol: name,
            source,
        };
        let dll_entry = *unsafe { library.get::<DllEntryFn>(b"dllEntry\0") }
            .map_err(|e| symbol("dllEntry", e))?;
        let vm_main = *unsafe { library.get::<VmMainFn>(b"vmMain\0") }
            .map_err(|e| symbol("vmMain", e))?;

        unsafe { dll_entry(native_syscall) };
        Ok(Self {
            vm_main,
            path: Some(path.to_path_buf()),
            _library: Some(library),
        })
    }

    /// Module made of in-process functions instead of a library.
    ///
    /// # Safety
    ///
    /// Both functions are called with the native module contract:
    /// `dll_entry` once now, `vm_main` on every call.
    pub unsafe fn from_fns(dll_entry: DllEntryFn, vm_main: VmMainFn) -> Self {
        unsafe { dll_entry(native_syscall) };
        Self {
            vm_main,
            path: None,
            _library: None,
        }
    }

    /// Library path, if loaded from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn entry_point(&self) -> VmMainFn {
        self.vm_main
    }
}

/// Locates and opens native modules.
pub trait NativeLoader {
    /// Load the native module `name`, searching `dirs` in order.
    fn load(&self, name: &str, dirs: &[PathBuf]) -> Result<NativeModule, NativeError>;
}

/// Loads `<name><arch><dll suffix>` with the platform dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl NativeLoader for DylibLoader {
    fn load(&self, name: &str, dirs: &[PathBuf]) -> Result<NativeModule, NativeError> {
        let file = library_file_name(name);
        let Some(path) = dirs.iter().map(|dir| dir.join(&file)).find(|p| p.is_file()) else {
            return Err(NativeError::NotFound {
                file,
                searched: dirs.to_vec(),
            });
        };
        tracing::info!(path = %path.display(), "loading native module");
        // SAFETY: native modules are trusted code by contract.
        unsafe { NativeModule::open(&path) }
    }
}

thread_local! {
    /// Registry and module of the innermost native call on this thread.
    static ACTIVE: Cell<Option<(*mut ModuleRegistry, VmHandle)>> = const { Cell::new(None) };
    /// First handler error raised during the innermost native call.
    static PENDING: RefCell<Option<VmError>> = const { RefCell::new(None) };
}

/// Call `vmMain` with the registry reachable from the trampoline.
pub(crate) fn call(
    registry: &mut ModuleRegistry,
    handle: VmHandle,
    vm_main: VmMainFn,
    selector: i32,
    args: &CallArgs,
) -> VmResult<isize> {
    let outer_pending = PENDING.take();
    let previous = ACTIVE.replace(Some((registry as *mut ModuleRegistry, handle)));

    let a = args.as_array();
    // SAFETY: `vm_main` comes from a live native module kept loaded until
    // the outermost call returns.
    let result = unsafe { vm_main(selector, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9]) };

    ACTIVE.set(previous);
    let pending = PENDING.replace(outer_pending);
    match pending {
        Some(error) => Err(error),
        None => Ok(result),
    }
}

fn park(error: VmError) {
    PENDING.with_borrow_mut(|pending| {
        if pending.is_none() {
            *pending = Some(error);
        }
    });
}

/// Trampoline handed to `dllEntry`. Errors cannot unwind through the
/// module's C frames, so they are parked and 0 is returned.
#[allow(clippy::too_many_arguments)]
extern "C" fn native_syscall(
    number: isize,
    a1: isize,
    a2: isize,
    a3: isize,
    a4: isize,
    a5: isize,
    a6: isize,
    a7: isize,
    a8: isize,
    a9: isize,
    a10: isize,
    a11: isize,
    a12: isize,
    a13: isize,
    a14: isize,
    a15: isize,
) -> isize {
    let args = SyscallArgs::new(&[
        number, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15,
    ]);
    let Some((registry, handle)) = ACTIVE.get() else {
        tracing::error!(
            syscall = args.number(),
            "native syscall outside of a module call"
        );
        return 0;
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the registry pointer was installed by `call`, which is
        // still on the stack below this frame.
        let registry = unsafe { &mut *registry };
        registry.native_syscall(handle, &args)
    }));
    match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(error)) => {
            park(error);
            0
        }
        Err(_) => {
            park(VmError::Host("syscall handler panicked".to_string()));
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_file_name() {
        let file = library_file_name("qagame");
        assert!(file.starts_with("qagame"));
        assert!(file.contains(std::env::consts::ARCH));
        assert!(file.ends_with(std::env::consts::DLL_SUFFIX));
    }

    #[test]
    fn test_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        let err = DylibLoader
            .load("qagame", &[dir.path().to_path_buf()])
            .unwrap_err();
        assert!(matches!(err, NativeError::NotFound { .. }));
    }

    #[test]
    fn test_garbage_library_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(library_file_name("ui")), b"not a library").unwrap();
        let err = DylibLoader
            .load("ui", &[dir.path().to_path_buf()])
            .unwrap_err();
        assert!(matches!(err, NativeError::Load { .. }));
    }
}
