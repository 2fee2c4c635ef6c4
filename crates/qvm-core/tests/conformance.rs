//! The interpreter and the compiled backend must agree on every program:
//! same return values, same memory afterwards, same faults at the same
//! instruction.

#![cfg(feature = "jit")]

use qvm_core::{
    ExecutionMode, Fault, ImageBuilder, MemorySource, ModuleRegistry, Opcode, VmConfig, VmError,
    syscall_fn,
};

#[derive(Debug, PartialEq)]
struct Outcome {
    result: Result<isize, String>,
    memory: Vec<u8>,
}

fn run_in(mode: ExecutionMode, image: &[u8], selector: i32, args: &[i32]) -> Outcome {
    let source = MemorySource::new().with("vm/conformance.qvm", image.to_vec());
    let mut registry = ModuleRegistry::new(
        VmConfig {
            quiet: true,
            ..VmConfig::default()
        },
        source,
    );
    let handler = syscall_fn(|ctx, args| {
        // slot 0: store arg2 at arg1, return arg1 + arg2
        if args.number() == 0 {
            ctx.write_i32(args.get(1), args.int(2))?;
        }
        Ok(args.get(1) + args.get(2))
    });
    let handle = registry
        .create("conformance", handler, mode)
        .unwrap()
        .unwrap();
    assert_eq!(registry.instance(handle).unwrap().mode(), mode);

    let result = registry.call(handle, selector, args).map_err(|err| match err {
        VmError::Fault { fault, pc, .. } => format!("{fault:?} at {pc}"),
        other => other.to_string(),
    });
    let memory = registry.sandbox(handle).unwrap().segment().to_vec();
    Outcome { result, memory }
}

fn assert_conforms(image: ImageBuilder, selector: i32, args: &[i32]) -> Outcome {
    let bytes = image.bss(0x1000).build();
    let interpreted = run_in(ExecutionMode::Interpreted, &bytes, selector, args);
    if qvm_core::config::is_jit_disabled_by_env() {
        return interpreted;
    }
    let compiled = run_in(ExecutionMode::Compiled, &bytes, selector, args);
    assert_eq!(interpreted.result, compiled.result);
    assert!(
        interpreted.memory == compiled.memory,
        "sandbox contents differ between backends"
    );
    interpreted
}

fn fault(fault: Fault, pc: i32) -> Result<isize, String> {
    Err(format!("{fault:?} at {pc}"))
}

#[test]
fn test_loop_and_branches() {
    // sum = 0; i = selector; while i > 0 { sum += i; i -= 1 } return sum
    let image = ImageBuilder::new().ops([
        (Opcode::Enter, 16),
        (Opcode::Local, 8),
        (Opcode::Const, 0),
        (Opcode::Store4, 0),
        (Opcode::Local, 12),
        (Opcode::Local, 24),
        (Opcode::Load4, 0),
        (Opcode::Store4, 0),
        // 8:
        (Opcode::Local, 12),
        (Opcode::Load4, 0),
        (Opcode::Const, 0),
        (Opcode::Lei, 27),
        (Opcode::Local, 8),
        (Opcode::Local, 8),
        (Opcode::Load4, 0),
        (Opcode::Local, 12),
        (Opcode::Load4, 0),
        (Opcode::Add, 0),
        (Opcode::Store4, 0),
        (Opcode::Local, 12),
        (Opcode::Local, 12),
        (Opcode::Load4, 0),
        (Opcode::Const, 1),
        (Opcode::Sub, 0),
        (Opcode::Store4, 0),
        (Opcode::Const, 8),
        (Opcode::Jump, 0),
        // 27:
        (Opcode::Local, 8),
        (Opcode::Load4, 0),
        (Opcode::Leave, 16),
    ]);
    let outcome = assert_conforms(image, 100, &[]);
    assert_eq!(outcome.result, Ok(5050));
}

#[test]
fn test_narrow_loads_and_stores() {
    let image = ImageBuilder::new().ops([
        (Opcode::Enter, 8),
        (Opcode::Const, 0x100),
        (Opcode::Const, -2),
        (Opcode::Store1, 0),
        // unaligned halfword store lands on 0x102
        (Opcode::Const, 0x103),
        (Opcode::Const, 0x8001),
        (Opcode::Store2, 0),
        // unaligned word store lands on 0x200
        (Opcode::Const, 0x203),
        (Opcode::Const, 0x0102_0304),
        (Opcode::Store4, 0),
        (Opcode::Const, 0x100),
        (Opcode::Load1, 0),
        (Opcode::Sex8, 0),
        (Opcode::Const, 0x102),
        (Opcode::Load2, 0),
        (Opcode::Sex16, 0),
        (Opcode::Add, 0),
        (Opcode::Const, 0x201),
        (Opcode::Load4, 0),
        (Opcode::Bxor, 0),
        (Opcode::Leave, 8),
    ]);
    let outcome = assert_conforms(image, 0, &[]);
    assert_eq!(outcome.result, Ok((-2 + -32767) ^ 0x0102_0304));
    assert_eq!(outcome.memory[0x100], 0xFE);
}

#[test]
fn test_float_arithmetic() {
    // ((float)selector * 0.5 + 1.25) / -2.0, returned as raw bits
    let image = ImageBuilder::new().ops([
        (Opcode::Enter, 8),
        (Opcode::Local, 16),
        (Opcode::Load4, 0),
        (Opcode::Cvif, 0),
        (Opcode::Const, 0.5f32.to_bits() as i32),
        (Opcode::Mulf, 0),
        (Opcode::Const, 1.25f32.to_bits() as i32),
        (Opcode::Addf, 0),
        (Opcode::Const, 2.0f32.to_bits() as i32),
        (Opcode::Negf, 0),
        (Opcode::Divf, 0),
        (Opcode::Leave, 8),
    ]);
    let outcome = assert_conforms(image, 7, &[]);
    assert_eq!(outcome.result, Ok((-2.375f32).to_bits() as i32 as isize));
}

#[test]
fn test_integer_edges() {
    let image = ImageBuilder::new().ops([
        (Opcode::Enter, 8),
        (Opcode::Const, i32::MIN),
        (Opcode::Const, -1),
        (Opcode::Modi, 0),
        (Opcode::Const, -7),
        (Opcode::Const, 28),
        (Opcode::Rshu, 0),
        (Opcode::Add, 0),
        (Opcode::Const, -9),
        (Opcode::Const, 2),
        (Opcode::Divi, 0),
        (Opcode::Add, 0),
        (Opcode::Leave, 8),
    ]);
    let outcome = assert_conforms(image, 0, &[]);
    // 0 + 15 + -4
    assert_eq!(outcome.result, Ok(11));
}

#[test]
fn test_block_copy() {
    let mut image = ImageBuilder::new().ops([
        (Opcode::Enter, 8),
        (Opcode::Const, 0x40),
        (Opcode::Const, 0),
        (Opcode::BlockCopy, 16),
        (Opcode::Const, 0x4c),
        (Opcode::Load4, 0),
        (Opcode::Leave, 8),
    ]);
    for word in [11, 22, 33, 44] {
        image = image.data_word(word);
    }
    let outcome = assert_conforms(image, 0, &[]);
    assert_eq!(outcome.result, Ok(44));
}

#[test]
fn test_procedure_arguments() {
    let image = ImageBuilder::new().ops([
        (Opcode::Enter, 24),
        (Opcode::Const, 20),
        (Opcode::Arg, 8),
        (Opcode::Const, 22),
        (Opcode::Arg, 12),
        (Opcode::Const, 8),
        (Opcode::Call, 0),
        (Opcode::Leave, 24),
        // 8:
        (Opcode::Enter, 8),
        (Opcode::Local, 16),
        (Opcode::Load4, 0),
        (Opcode::Local, 20),
        (Opcode::Load4, 0),
        (Opcode::Add, 0),
        (Opcode::Leave, 8),
    ]);
    let outcome = assert_conforms(image, 0, &[]);
    assert_eq!(outcome.result, Ok(42));
}

#[test]
fn test_syscall_round_trip() {
    let image = ImageBuilder::new().ops([
        (Opcode::Enter, 20),
        (Opcode::Const, 0x300),
        (Opcode::Arg, 8),
        (Opcode::Local, 32),
        (Opcode::Load4, 0),
        (Opcode::Arg, 12),
        (Opcode::Const, -1),
        (Opcode::Call, 0),
        (Opcode::Const, 0x300),
        (Opcode::Load4, 0),
        (Opcode::Sub, 0),
        (Opcode::Leave, 20),
    ]);
    let outcome = assert_conforms(image, 0, &[9]);
    assert_eq!(outcome.result, Ok(0x300));
    assert_eq!(&outcome.memory[0x300..0x304], &9i32.to_le_bytes());
}

#[test]
fn test_faults_agree() {
    let cases: Vec<(ImageBuilder, Result<isize, String>)> = vec![
        (
            ImageBuilder::new().ops([
                (Opcode::Enter, 8),
                (Opcode::Const, 1),
                (Opcode::Const, 0),
                (Opcode::Divu, 0),
                (Opcode::Leave, 8),
            ]),
            fault(Fault::DivideByZero, 3),
        ),
        (
            ImageBuilder::new().ops([
                (Opcode::Enter, 8),
                (Opcode::Const, 1),
                (Opcode::Const, 2),
                (Opcode::Add, 0),
                (Opcode::Jump, 0),
                (Opcode::Const, 0),
                (Opcode::Leave, 8),
            ]),
            fault(Fault::BadJumpTarget, 4),
        ),
        (
            ImageBuilder::new().ops([
                (Opcode::Enter, 8),
                (Opcode::Const, 2),
                (Opcode::Call, 0),
                (Opcode::Leave, 8),
            ]),
            fault(Fault::BadCallTarget, 2),
        ),
        (
            ImageBuilder::new().ops([
                (Opcode::Enter, 0x4000),
                (Opcode::Const, 0),
                (Opcode::Call, 0),
                (Opcode::Leave, 0x4000),
            ]),
            fault(Fault::StackOverflow, 0),
        ),
        (
            ImageBuilder::new().ops([
                (Opcode::Enter, 8),
                (Opcode::Const, 1),
                (Opcode::Const, 2),
                (Opcode::Leave, 8),
            ]),
            fault(Fault::OpstackCorrupted, 3),
        ),
        (
            ImageBuilder::new().ops([
                (Opcode::Enter, 8),
                (Opcode::Local, 8),
                (Opcode::Const, 5),
                (Opcode::Store4, 0),
                (Opcode::Const, 0),
                (Opcode::Leave, 8),
            ]),
            fault(Fault::BadReturnAddress, 5),
        ),
        (
            ImageBuilder::new().ops([
                (Opcode::Enter, 8),
                (Opcode::Const, 0),
                (Opcode::Const, 0x10),
                (Opcode::BlockCopy, 0x10_0000),
                (Opcode::Const, 0),
                (Opcode::Leave, 8),
            ]),
            fault(Fault::BlockCopyOutOfRange, 3),
        ),
        (
            ImageBuilder::new().ops([(Opcode::Enter, 8), (Opcode::Const, 1)]),
            fault(Fault::FellOffEnd, 2),
        ),
    ];
    for (image, expected) in cases {
        let outcome = assert_conforms(image, 0, &[]);
        assert_eq!(outcome.result, expected);
    }
}

#[test]
fn test_profile_counts_agree() {
    let image = ImageBuilder::new()
        .ops([
            (Opcode::Enter, 16),
            (Opcode::Const, 4),
            (Opcode::Call, 0),
            (Opcode::Leave, 16),
            (Opcode::Enter, 8),
            (Opcode::Const, 7),
            (Opcode::Leave, 8),
        ])
        .bss(0x1000)
        .build();
    if qvm_core::config::is_jit_disabled_by_env() {
        return;
    }
    let mut totals = Vec::new();
    for mode in [ExecutionMode::Interpreted, ExecutionMode::Compiled] {
        let source = MemorySource::new().with("vm/ui.qvm", image.clone());
        let mut registry = ModuleRegistry::new(
            VmConfig {
                quiet: true,
                profile: true,
                ..VmConfig::default()
            },
            source,
        );
        let handle = registry
            .create("ui", syscall_fn(|_, _| Ok(0)), mode)
            .unwrap()
            .unwrap();
        registry.call(handle, 0, &[]).unwrap();
        registry.call(handle, 0, &[]).unwrap();
        let report = registry.profile_report().unwrap();
        let labels: Vec<_> = report
            .entries
            .iter()
            .map(|e| (e.label.clone(), e.count))
            .collect();
        totals.push(labels);
    }
    assert_eq!(totals[0], totals[1]);
    assert_eq!(totals[0], vec![("0x0".to_string(), 2), ("0x4".to_string(), 2)]);
}

struct RefusingTranslator;

impl qvm_core::Translator for RefusingTranslator {
    fn translate(
        &self,
        _name: &str,
        _program: &qvm_bytecode::Program,
        _options: &qvm_core::TranslateOptions,
    ) -> Result<qvm_core::CompiledProgram, qvm_core::JitError> {
        Err(qvm_core::JitError::UnsupportedTarget("test".into()))
    }
}

#[test]
fn test_failed_translation_falls_back_to_interpreter() {
    let image = ImageBuilder::new()
        .ops([(Opcode::Enter, 8), (Opcode::Const, 9), (Opcode::Leave, 8)])
        .bss(0x1000)
        .build();
    let source = MemorySource::new().with("vm/ui.qvm", image);
    let mut registry = ModuleRegistry::new(
        VmConfig {
            quiet: true,
            ..VmConfig::default()
        },
        source,
    )
    .with_translator(RefusingTranslator);
    let handle = registry
        .create("ui", syscall_fn(|_, _| Ok(0)), ExecutionMode::Compiled)
        .unwrap()
        .unwrap();
    assert_eq!(
        registry.instance(handle).unwrap().mode(),
        ExecutionMode::Interpreted
    );
    assert_eq!(registry.call(handle, 0, &[]).unwrap(), 9);
}
