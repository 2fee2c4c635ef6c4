//! Reading images and placing them in sandboxes.

use std::rc::Rc;
use std::sync::Arc;

use qvm_bytecode::layout::PROGRAM_STACK_SIZE;
use qvm_bytecode::{Image, ImageVersion};
use qvm_profiler::CallProfile;

use crate::error::{VmError, VmResult};
use crate::instance::BytecodeModule;
use crate::memory::Sandbox;
use crate::source::ImageSource;

/// Game-relative path of a module image.
pub fn image_path(name: &str) -> String {
    format!("vm/{name}.qvm")
}

/// Read and validate `vm/<name>.qvm`. A missing file is `Ok(None)`.
///
/// Validation happens here, before any sandbox exists.
pub(crate) fn read_image(source: &dyn ImageSource, name: &str, quiet: bool) -> VmResult<Option<Image>> {
    let file = image_path(name);
    if quiet {
        tracing::debug!(%file, "loading vm file");
    } else {
        tracing::info!(%file, "loading vm file");
    }

    let bytes = match source.read(&file) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            tracing::info!(%file, "vm file not found");
            return Ok(None);
        }
        Err(source) => return Err(VmError::Io { file, source }),
    };

    let image = Image::parse(&bytes).map_err(|source| {
        tracing::error!(%file, error = %source, "bad vm image");
        VmError::Image { file: file.clone(), source }
    })?;

    if image.header.version == ImageVersion::JumpTable {
        tracing::debug!(
            %file,
            targets = image.program.jump_table().len(),
            "loading jump table targets"
        );
    }
    Ok(Some(image))
}

/// Allocate a sandbox for `image` and copy its initialized data in.
pub(crate) fn instantiate(image: Image, profile: bool) -> BytecodeModule {
    let size = image.header.sandbox_size();
    let mut sandbox = Sandbox::new(size);
    image.write_initial_data(sandbox.segment_mut());

    let program_stack = size as i32;
    let profile = profile.then(|| Arc::new(CallProfile::new(image.program.len())));
    BytecodeModule {
        header: image.header,
        program: Rc::new(image.program),
        sandbox,
        program_stack,
        stack_bottom: program_stack - PROGRAM_STACK_SIZE,
        last_pc: None,
        profile,
        #[cfg(feature = "jit")]
        compiled: None,
    }
}

/// Reset a module's data from a fresh copy of its image, keeping the
/// allocation. Code (and any translation of it) stays as loaded.
pub(crate) fn reload(module: &mut BytecodeModule, image: &Image, name: &str) -> VmResult<()> {
    let found = image.header.sandbox_size();
    let expected = module.sandbox.size();
    if found != expected {
        tracing::error!(module = name, expected, found, "sandbox size changed on restart");
        return Err(VmError::SizeMismatch {
            name: name.to_string(),
            expected,
            found,
        });
    }

    module.sandbox.zero();
    image.write_initial_data(module.sandbox.segment_mut());
    module.program_stack = found as i32;
    module.last_pc = None;
    if let Some(profile) = &module.profile {
        profile.reset();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use qvm_bytecode::{ImageBuilder, Opcode};

    fn image(data_words: &[i32], bss: u32) -> Vec<u8> {
        let mut builder = ImageBuilder::new()
            .op(Opcode::Enter, 8)
            .op(Opcode::Const, 0)
            .op(Opcode::Leave, 8);
        for &w in data_words {
            builder = builder.data_word(w);
        }
        builder.bss(bss).build()
    }

    #[test]
    fn test_missing_image() {
        let source = MemorySource::new();
        assert!(read_image(&source, "ui", true).unwrap().is_none());
    }

    #[test]
    fn test_bad_image_is_rejected() {
        let source = MemorySource::new().with(image_path("ui"), vec![0u8; 40]);
        let err = read_image(&source, "ui", true).unwrap_err();
        assert!(matches!(err, VmError::Image { .. }));
    }

    #[test]
    fn test_instantiate_layout() {
        let bytes = image(&[0x0102_0304, -1], 100);
        let module = instantiate(Image::parse(&bytes).unwrap(), false);
        assert_eq!(module.sandbox.size(), 128);
        assert_eq!(module.program_stack, 128);
        assert_eq!(module.stack_bottom, 128 - PROGRAM_STACK_SIZE);
        assert_eq!(module.sandbox.read_i32(0), 0x0102_0304);
        assert_eq!(module.sandbox.read_i32(4), -1);
        assert!(module.sandbox.guard_intact());
    }

    #[test]
    fn test_reload_checks_size_and_clears() {
        let bytes = image(&[7], 60);
        let mut module = instantiate(Image::parse(&bytes).unwrap(), false);
        module.sandbox.write_i32(32, 99);
        module.program_stack = 12;

        reload(&mut module, &Image::parse(&bytes).unwrap(), "ui").unwrap();
        assert_eq!(module.sandbox.read_i32(32), 0);
        assert_eq!(module.sandbox.read_i32(0), 7);
        assert_eq!(module.program_stack, 64);

        let bigger = image(&[7], 600);
        let err = reload(&mut module, &Image::parse(&bigger).unwrap(), "ui").unwrap_err();
        assert!(matches!(
            err,
            VmError::SizeMismatch {
                expected: 64,
                found: 1024,
                ..
            }
        ));
    }
}
