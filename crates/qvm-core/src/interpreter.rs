//! Bytecode interpreter
//!
//! Executes a module's program against its sandbox. The interpreter stops
//! at every syscall so the registry can run the host handler without
//! holding a borrow of the module; the call continues with
//! [`Interpreter::resume`].

use qvm_bytecode::layout::RETURN_SENTINEL;
use qvm_bytecode::{Fault, Instruction, OPSTACK_SIZE, Opcode, Program};
use qvm_profiler::CallProfile;

use crate::memory::Sandbox;

const _: () = assert!(OPSTACK_SIZE == 256, "operand stack index is a wrapping u8");

/// Why [`Interpreter::run`] stopped without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// The outermost frame returned this value.
    Returned(i32),
    /// `CALL` with a negative target. Arguments start at `ps + 4`.
    Syscall {
        /// Program stack of the calling frame
        ps: i32,
    },
}

/// A fault and the instruction that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Trap {
    pub fault: Fault,
    pub pc: i32,
}

/// Per-call interpreter state.
pub(crate) struct Interpreter {
    pc: usize,
    ps: i32,
    top: u8,
    opstack: [i32; OPSTACK_SIZE],
}

/// Result of executing one instruction
enum Step {
    /// Fall through to the next instruction
    Continue,
    /// Continue at an instruction index
    Jump(usize),
    /// Hand a syscall to the host
    Syscall(i32),
    /// Outermost frame returned
    Return(i32),
}

impl Interpreter {
    /// State for a call whose entry frame sits at `ps`.
    pub fn new(ps: i32) -> Self {
        Self {
            pc: 0,
            ps,
            top: 0,
            opstack: [0; OPSTACK_SIZE],
        }
    }

    /// Push a syscall result and continue after the `CALL`.
    pub fn resume(&mut self, result: i32) {
        self.push(result);
    }

    /// Run until the call returns, traps into the host, or faults.
    pub fn run(
        &mut self,
        program: &Program,
        memory: &mut Sandbox,
        stack_bottom: i32,
        profile: Option<&CallProfile>,
    ) -> Result<Exit, Trap> {
        let instructions = program.instructions();
        loop {
            let Some(&instruction) = instructions.get(self.pc) else {
                return Err(Trap {
                    fault: Fault::FellOffEnd,
                    pc: instructions.len() as i32,
                });
            };
            let pc = self.pc;
            let step = self
                .execute_instruction(instruction, program, memory, stack_bottom, profile)
                .map_err(|fault| Trap {
                    fault,
                    pc: pc as i32,
                })?;
            match step {
                Step::Continue => self.pc += 1,
                Step::Jump(target) => self.pc = target,
                Step::Syscall(ps) => {
                    self.pc += 1;
                    return Ok(Exit::Syscall { ps });
                }
                Step::Return(value) => return Ok(Exit::Returned(value)),
            }
        }
    }

    #[inline]
    fn push(&mut self, value: i32) {
        self.top = self.top.wrapping_add(1);
        self.opstack[self.top as usize] = value;
    }

    #[inline]
    fn pop(&mut self) -> i32 {
        let value = self.opstack[self.top as usize];
        self.top = self.top.wrapping_sub(1);
        value
    }

    #[inline]
    fn pop_pair(&mut self) -> (i32, i32) {
        let rhs = self.pop();
        let lhs = self.pop();
        (lhs, rhs)
    }

    #[inline]
    fn pop_floats(&mut self) -> (f32, f32) {
        let (lhs, rhs) = self.pop_pair();
        (f32::from_bits(lhs as u32), f32::from_bits(rhs as u32))
    }

    fn push_float(&mut self, value: f32) {
        self.push(value.to_bits() as i32);
    }

    fn execute_instruction(
        &mut self,
        instruction: Instruction,
        program: &Program,
        memory: &mut Sandbox,
        stack_bottom: i32,
        profile: Option<&CallProfile>,
    ) -> Result<Step, Fault> {
        let operand = instruction.operand;
        let branch = |taken: bool| {
            if taken {
                Step::Jump(operand as usize)
            } else {
                Step::Continue
            }
        };

        match instruction.opcode {
            Opcode::Undef => return Err(Fault::BadOpcode),
            Opcode::Break => return Err(Fault::Breakpoint),
            Opcode::Ignore => {}

            // ==================== Frames ====================
            Opcode::Enter => {
                self.ps = self.ps.wrapping_sub(operand);
                if self.ps < stack_bottom {
                    return Err(Fault::StackOverflow);
                }
                if let Some(profile) = profile {
                    profile.record(self.pc);
                }
            }
            Opcode::Leave => {
                self.ps = self.ps.wrapping_add(operand);
                let ret = memory.load_word(self.ps);
                if ret == RETURN_SENTINEL {
                    if self.top != 1 {
                        return Err(Fault::OpstackCorrupted);
                    }
                    return Ok(Step::Return(self.opstack[1]));
                }
                if !program.is_return_site(ret) {
                    return Err(Fault::BadReturnAddress);
                }
                return Ok(Step::Jump(ret as usize));
            }
            Opcode::Call => {
                let target = self.pop();
                memory.store_word(self.ps, self.pc as i32 + 1);
                if target < 0 {
                    memory.store_word(self.ps.wrapping_add(4), !target);
                    return Ok(Step::Syscall(self.ps));
                }
                if !program.is_procedure_entry(target) {
                    return Err(Fault::BadCallTarget);
                }
                return Ok(Step::Jump(target as usize));
            }
            Opcode::Jump => {
                let target = self.pop();
                if !program.is_jump_target(target) {
                    return Err(Fault::BadJumpTarget);
                }
                return Ok(Step::Jump(target as usize));
            }

            // ==================== Operand stack ====================
            Opcode::Push => self.push(0),
            Opcode::Pop => {
                self.pop();
            }
            Opcode::Const => self.push(operand),
            Opcode::Local => self.push(self.ps.wrapping_add(operand)),

            // ==================== Compare and branch ====================
            Opcode::Eq => {
                let (l, r) = self.pop_pair();
                return Ok(branch(l == r));
            }
            Opcode::Ne => {
                let (l, r) = self.pop_pair();
                return Ok(branch(l != r));
            }
            Opcode::Lti => {
                let (l, r) = self.pop_pair();
                return Ok(branch(l < r));
            }
            Opcode::Lei => {
                let (l, r) = self.pop_pair();
                return Ok(branch(l <= r));
            }
            Opcode::Gti => {
                let (l, r) = self.pop_pair();
                return Ok(branch(l > r));
            }
            Opcode::Gei => {
                let (l, r) = self.pop_pair();
                return Ok(branch(l >= r));
            }
            Opcode::Ltu => {
                let (l, r) = self.pop_pair();
                return Ok(branch((l as u32) < r as u32));
            }
            Opcode::Leu => {
                let (l, r) = self.pop_pair();
                return Ok(branch(l as u32 <= r as u32));
            }
            Opcode::Gtu => {
                let (l, r) = self.pop_pair();
                return Ok(branch(l as u32 > r as u32));
            }
            Opcode::Geu => {
                let (l, r) = self.pop_pair();
                return Ok(branch(l as u32 >= r as u32));
            }
            Opcode::Eqf => {
                let (l, r) = self.pop_floats();
                return Ok(branch(l == r));
            }
            Opcode::Nef => {
                let (l, r) = self.pop_floats();
                return Ok(branch(l != r));
            }
            Opcode::Ltf => {
                let (l, r) = self.pop_floats();
                return Ok(branch(l < r));
            }
            Opcode::Lef => {
                let (l, r) = self.pop_floats();
                return Ok(branch(l <= r));
            }
            Opcode::Gtf => {
                let (l, r) = self.pop_floats();
                return Ok(branch(l > r));
            }
            Opcode::Gef => {
                let (l, r) = self.pop_floats();
                return Ok(branch(l >= r));
            }

            // ==================== Memory ====================
            Opcode::Load1 => {
                let addr = self.pop();
                self.push(memory.load_u8(addr) as i32);
            }
            Opcode::Load2 => {
                let addr = self.pop();
                self.push(memory.load_u16(addr) as i32);
            }
            Opcode::Load4 => {
                let addr = self.pop();
                self.push(memory.load_word(addr));
            }
            Opcode::Store1 => {
                let (addr, value) = self.pop_pair();
                memory.store_u8(addr, value as u8);
            }
            Opcode::Store2 => {
                let (addr, value) = self.pop_pair();
                memory.store_u16(addr, value as u16);
            }
            Opcode::Store4 => {
                let (addr, value) = self.pop_pair();
                memory.store_word(addr, value);
            }
            Opcode::Arg => {
                let value = self.pop();
                memory.store_word(self.ps.wrapping_add(operand), value);
            }
            Opcode::BlockCopy => {
                let (dest, src) = self.pop_pair();
                memory.block_copy(dest, src, operand as u32)?;
            }

            // ==================== Integer arithmetic ====================
            Opcode::Sex8 => {
                let v = self.pop();
                self.push(v as i8 as i32);
            }
            Opcode::Sex16 => {
                let v = self.pop();
                self.push(v as i16 as i32);
            }
            Opcode::Negi => {
                let v = self.pop();
                self.push(v.wrapping_neg());
            }
            Opcode::Bcom => {
                let v = self.pop();
                self.push(!v);
            }
            Opcode::Add => {
                let (l, r) = self.pop_pair();
                self.push(l.wrapping_add(r));
            }
            Opcode::Sub => {
                let (l, r) = self.pop_pair();
                self.push(l.wrapping_sub(r));
            }
            Opcode::Muli | Opcode::Mulu => {
                let (l, r) = self.pop_pair();
                self.push(l.wrapping_mul(r));
            }
            Opcode::Divi => {
                let (l, r) = self.pop_pair();
                if r == 0 {
                    return Err(Fault::DivideByZero);
                }
                self.push(l.wrapping_div(r));
            }
            Opcode::Modi => {
                let (l, r) = self.pop_pair();
                if r == 0 {
                    return Err(Fault::DivideByZero);
                }
                self.push(l.wrapping_rem(r));
            }
            Opcode::Divu => {
                let (l, r) = self.pop_pair();
                if r == 0 {
                    return Err(Fault::DivideByZero);
                }
                self.push((l as u32 / r as u32) as i32);
            }
            Opcode::Modu => {
                let (l, r) = self.pop_pair();
                if r == 0 {
                    return Err(Fault::DivideByZero);
                }
                self.push((l as u32 % r as u32) as i32);
            }
            Opcode::Band => {
                let (l, r) = self.pop_pair();
                self.push(l & r);
            }
            Opcode::Bor => {
                let (l, r) = self.pop_pair();
                self.push(l | r);
            }
            Opcode::Bxor => {
                let (l, r) = self.pop_pair();
                self.push(l ^ r);
            }
            Opcode::Lsh => {
                let (l, r) = self.pop_pair();
                self.push(l.wrapping_shl(r as u32));
            }
            Opcode::Rshi => {
                let (l, r) = self.pop_pair();
                self.push(l.wrapping_shr(r as u32));
            }
            Opcode::Rshu => {
                let (l, r) = self.pop_pair();
                self.push((l as u32).wrapping_shr(r as u32) as i32);
            }

            // ==================== Floating point ====================
            Opcode::Negf => {
                let v = f32::from_bits(self.pop() as u32);
                self.push_float(-v);
            }
            Opcode::Addf => {
                let (l, r) = self.pop_floats();
                self.push_float(l + r);
            }
            Opcode::Subf => {
                let (l, r) = self.pop_floats();
                self.push_float(l - r);
            }
            Opcode::Divf => {
                let (l, r) = self.pop_floats();
                self.push_float(l / r);
            }
            Opcode::Mulf => {
                let (l, r) = self.pop_floats();
                self.push_float(l * r);
            }
            Opcode::Cvif => {
                let v = self.pop();
                self.push_float(v as f32);
            }
            Opcode::Cvfi => {
                // `as` saturates and maps NaN to 0
                let v = f32::from_bits(self.pop() as u32);
                self.push(v as i32);
            }
        }
        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qvm_bytecode::layout::ENTRY_FRAME_SIZE;
    use qvm_bytecode::{Image, ImageBuilder};

    const SIZE: u32 = 0x1000;

    fn load(builder: ImageBuilder) -> Program {
        Image::parse(&builder.build()).unwrap().program
    }

    fn start(memory: &mut Sandbox, args: &[i32]) -> Interpreter {
        let ps = SIZE as i32 - ENTRY_FRAME_SIZE;
        memory.store_word(ps, RETURN_SENTINEL);
        memory.store_word(ps + 4, 0);
        for (i, &arg) in args.iter().enumerate() {
            memory.store_word(ps + 8 + 4 * i as i32, arg);
        }
        Interpreter::new(ps)
    }

    fn run(builder: ImageBuilder, args: &[i32]) -> Result<Exit, Trap> {
        let program = load(builder);
        let mut memory = Sandbox::new(SIZE);
        start(&mut memory, args).run(&program, &mut memory, 0, None)
    }

    fn returning(ops: &[(Opcode, i32)]) -> ImageBuilder {
        ImageBuilder::new()
            .op(Opcode::Enter, 8)
            .ops(ops.iter().copied())
            .op(Opcode::Leave, 8)
    }

    #[test]
    fn test_returns_selector_plus_argument() {
        let exit = run(
            returning(&[
                (Opcode::Local, 16),
                (Opcode::Load4, 0),
                (Opcode::Local, 20),
                (Opcode::Load4, 0),
                (Opcode::Add, 0),
            ]),
            &[40, 2],
        );
        assert_eq!(exit, Ok(Exit::Returned(42)));
    }

    #[test]
    fn test_signed_division_edges() {
        let exit = run(
            returning(&[
                (Opcode::Const, i32::MIN),
                (Opcode::Const, -1),
                (Opcode::Divi, 0),
            ]),
            &[],
        );
        assert_eq!(exit, Ok(Exit::Returned(i32::MIN)));

        let exit = run(
            returning(&[
                (Opcode::Const, 7),
                (Opcode::Const, 0),
                (Opcode::Modu, 0),
            ]),
            &[],
        );
        assert_eq!(
            exit,
            Err(Trap {
                fault: Fault::DivideByZero,
                pc: 3
            })
        );
    }

    #[test]
    fn test_float_conversions() {
        let exit = run(
            returning(&[(Opcode::Const, f32::NAN.to_bits() as i32), (Opcode::Cvfi, 0)]),
            &[],
        );
        assert_eq!(exit, Ok(Exit::Returned(0)));

        let exit = run(
            returning(&[(Opcode::Const, 1e20f32.to_bits() as i32), (Opcode::Cvfi, 0)]),
            &[],
        );
        assert_eq!(exit, Ok(Exit::Returned(i32::MAX)));
    }

    #[test]
    fn test_syscall_trap_and_resume() {
        let program = load(ImageBuilder::new().ops([
            (Opcode::Enter, 16),
            (Opcode::Const, 5),
            (Opcode::Arg, 8),
            (Opcode::Const, -3),
            (Opcode::Call, 0),
            (Opcode::Leave, 16),
        ]));
        let mut memory = Sandbox::new(SIZE);
        let mut interpreter = start(&mut memory, &[]);

        let exit = interpreter.run(&program, &mut memory, 0, None).unwrap();
        let Exit::Syscall { ps } = exit else {
            panic!("expected a syscall, got {exit:?}");
        };
        // syscall number -3 is slot 2 of the host table
        assert_eq!(memory.load_word(ps + 4), 2);
        assert_eq!(memory.load_word(ps + 8), 5);

        interpreter.resume(99);
        let exit = interpreter.run(&program, &mut memory, 0, None);
        assert_eq!(exit, Ok(Exit::Returned(99)));
    }

    #[test]
    fn test_procedure_call_and_return() {
        // 0: ENTER 16; CONST 4; CALL; LEAVE 16  4: ENTER 8; CONST 7; LEAVE 8
        let builder = ImageBuilder::new().ops([
            (Opcode::Enter, 16),
            (Opcode::Const, 4),
            (Opcode::Call, 0),
            (Opcode::Leave, 16),
            (Opcode::Enter, 8),
            (Opcode::Const, 7),
            (Opcode::Leave, 8),
        ]);
        assert_eq!(run(builder, &[]), Ok(Exit::Returned(7)));
    }

    #[test]
    fn test_bad_call_target() {
        let builder = returning(&[(Opcode::Const, 2), (Opcode::Call, 0)]);
        assert_eq!(
            run(builder, &[]),
            Err(Trap {
                fault: Fault::BadCallTarget,
                pc: 2
            })
        );
    }

    #[test]
    fn test_stack_overflow() {
        let program = load(returning(&[(Opcode::Const, 1)]));
        let mut memory = Sandbox::new(SIZE);
        let mut interpreter = start(&mut memory, &[]);
        let exit = interpreter.run(&program, &mut memory, SIZE as i32 - 32, None);
        assert_eq!(
            exit,
            Err(Trap {
                fault: Fault::StackOverflow,
                pc: 0
            })
        );
    }

    #[test]
    fn test_opstack_must_hold_one_value() {
        let exit = run(returning(&[(Opcode::Const, 1), (Opcode::Const, 2)]), &[]);
        assert_eq!(
            exit,
            Err(Trap {
                fault: Fault::OpstackCorrupted,
                pc: 3
            })
        );
    }

    #[test]
    fn test_undef_and_break() {
        let exit = run(ImageBuilder::new().ops([(Opcode::Enter, 8), (Opcode::Undef, 0)]), &[]);
        assert_eq!(exit.map_err(|t| t.fault), Err(Fault::BadOpcode));
        let exit = run(ImageBuilder::new().ops([(Opcode::Enter, 8), (Opcode::Break, 0)]), &[]);
        assert_eq!(exit.map_err(|t| t.fault), Err(Fault::Breakpoint));
    }

    #[test]
    fn test_falls_off_end() {
        let exit = run(ImageBuilder::new().ops([(Opcode::Enter, 8), (Opcode::Const, 1)]), &[]);
        assert_eq!(
            exit,
            Err(Trap {
                fault: Fault::FellOffEnd,
                pc: 2
            })
        );
    }

    #[test]
    fn test_profile_counts_entries() {
        let program = load(returning(&[(Opcode::Const, 1)]));
        let profile = CallProfile::new(program.len());
        let mut memory = Sandbox::new(SIZE);
        start(&mut memory, &[])
            .run(&program, &mut memory, 0, Some(&profile))
            .unwrap();
        assert_eq!(profile.count(0), 1);
    }
}
