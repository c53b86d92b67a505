//! Abstract semantics of Arm64
//!
//! Registers `x0`..`x30` and `sp` are tracked; `xzr` reads as zero and ignores
//! writes. Flags are not modelled, so a conditional branch on flags keeps both
//! of its successors without refining the state. Opcodes without a transfer
//! function forget their destination register. Those with a memory operand
//! forget every register they name and all of memory.

use cfg::{BasicInstruction, CfgInstruction};
use yaxpeax_arm::armv8::a64::{Opcode, Operand, ShiftStyle, SizeCode};

use crate::decode::{decode_at, DecodedInstruction};
use crate::image::CodeImage;
use crate::semantics::{
    BinaryOp, InstructionSemantics, RegisterFile, Relation, SemanticsError, ValueDomain,
};
use crate::state::AbstractState;

const REGISTERS: [&str; 32] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp",
];

const LINK_REGISTER: usize = 30;
const FRAME_POINTER: usize = 29;
const WORD_MASK: u64 = 0xffff_ffff;

/// The Arm64 instruction set
#[derive(Debug, Clone, Copy, Default)]
pub struct Arm64Semantics;

/// A general-purpose register operand
#[derive(Debug, Clone, Copy)]
enum Reg {
    /// `xzr`/`wzr`
    Zero,
    /// Index into [`REGISTERS`] and access width.
    Index(usize, SizeCode),
}

fn reg(operand: &Operand) -> Option<Reg> {
    match *operand {
        Operand::Register(_, 31) => Some(Reg::Zero),
        Operand::Register(size, n) | Operand::RegisterOrSP(size, n) => {
            Some(Reg::Index(usize::from(n), size))
        }
        _ => None,
    }
}

fn read_reg<D: ValueDomain>(state: &AbstractState<D::Value>, reg: Reg, domain: &D) -> D::Value {
    match reg {
        Reg::Zero => domain.constant(0),
        Reg::Index(index, size) => {
            let value = state
                .register(index)
                .cloned()
                .unwrap_or_else(|| domain.top());
            match size {
                SizeCode::W => domain.arithmetic(BinaryOp::And, &value, &domain.constant(WORD_MASK)),
                SizeCode::X => value,
            }
        }
    }
}

fn write_reg<D: ValueDomain>(state: &mut AbstractState<D::Value>, reg: Reg, value: D::Value, domain: &D) {
    match reg {
        Reg::Zero => {}
        Reg::Index(index, SizeCode::W) => state.set_register(
            index,
            domain.arithmetic(BinaryOp::And, &value, &domain.constant(WORD_MASK)),
        ),
        Reg::Index(index, SizeCode::X) => state.set_register(index, value),
    }
}

/// Value of a source operand, if it has one.
fn read<D: ValueDomain>(
    state: &AbstractState<D::Value>,
    operand: &Operand,
    pc: u64,
    domain: &D,
) -> Option<D::Value> {
    if let Some(r) = reg(operand) {
        return Some(read_reg(state, r, domain));
    }
    Some(match *operand {
        Operand::Immediate(value) => domain.constant(u64::from(value)),
        Operand::Imm16(value) => domain.constant(u64::from(value)),
        Operand::Imm64(value) => domain.constant(value),
        Operand::ImmShift(value, shift) => domain.constant(u64::from(value) << shift),
        Operand::PCOffset(offset) => domain.constant(pc.wrapping_add_signed(offset)),
        Operand::RegShift(style, amount, size, n) => {
            let value = read_reg(state, reg(&Operand::Register(size, n))?, domain);
            let amount = domain.constant(u64::from(amount));
            match style {
                _ if domain.as_constant(&amount) == Some(0) => value,
                ShiftStyle::LSL => domain.arithmetic(BinaryOp::Shl, &value, &amount),
                ShiftStyle::LSR => domain.arithmetic(BinaryOp::Shr, &value, &amount),
                _ => domain.top(),
            }
        }
        _ => return None,
    })
}

/// Effective address of a memory operand and the base register update it
/// performs, if any.
fn address<D: ValueDomain>(
    state: &AbstractState<D::Value>,
    operand: &Operand,
    pc: u64,
    domain: &D,
) -> (D::Value, Option<(Reg, D::Value)>) {
    let base = |n: u16| Reg::Index(usize::from(n), SizeCode::X);
    let offset = |off: i32| domain.constant(i64::from(off) as u64);
    match *operand {
        Operand::RegPreIndex(n, off, writeback) => {
            let address =
                domain.arithmetic(BinaryOp::Add, &read_reg(state, base(n), domain), &offset(off));
            let update = writeback.then(|| (base(n), address.clone()));
            (address, update)
        }
        Operand::RegPostIndex(n, off) => {
            let address = read_reg(state, base(n), domain);
            let updated = domain.arithmetic(BinaryOp::Add, &address, &offset(off));
            (address, Some((base(n), updated)))
        }
        Operand::PCOffset(off) => (domain.constant(pc.wrapping_add_signed(off)), None),
        _ => (domain.top(), None),
    }
}

fn is_memory(operand: &Operand) -> bool {
    matches!(
        operand,
        Operand::RegPreIndex(..)
            | Operand::RegPostIndex(..)
            | Operand::RegRegOffset(..)
            | Operand::RegPostIndexReg(..)
    )
}

/// Width of the memory access of an LSE atomic.
fn atomic_size(opcode: Opcode, data: &Operand) -> u8 {
    match opcode {
        Opcode::SWPB(_)
        | Opcode::LDADDB(_)
        | Opcode::LDCLRB(_)
        | Opcode::LDEORB(_)
        | Opcode::LDSETB(_)
        | Opcode::LDSMAXB(_)
        | Opcode::LDSMINB(_)
        | Opcode::LDUMAXB(_)
        | Opcode::LDUMINB(_)
        | Opcode::CASB(_) => 1,
        Opcode::SWPH(_)
        | Opcode::LDADDH(_)
        | Opcode::LDCLRH(_)
        | Opcode::LDEORH(_)
        | Opcode::LDSETH(_)
        | Opcode::LDSMAXH(_)
        | Opcode::LDSMINH(_)
        | Opcode::LDUMAXH(_)
        | Opcode::LDUMINH(_)
        | Opcode::CASH(_) => 2,
        _ => match data {
            Operand::Register(SizeCode::W, _) | Operand::RegisterPair(SizeCode::W, _) => 4,
            _ => 8,
        },
    }
}

fn access_size(opcode: Opcode, data: &Operand) -> u8 {
    match opcode {
        Opcode::LDRB | Opcode::STRB => 1,
        Opcode::LDRH | Opcode::STRH => 2,
        _ => match data {
            Operand::Register(SizeCode::W, _) => 4,
            _ => 8,
        },
    }
}

/// Register holding the destination of a register branch.
fn target_register(instruction: &DecodedInstruction) -> Option<Reg> {
    match instruction.operands()[0] {
        Operand::Nothing if instruction.is_return() => {
            Some(Reg::Index(LINK_REGISTER, SizeCode::X))
        }
        ref operand => reg(operand),
    }
}

impl Arm64Semantics {
    fn apply_load<D: ValueDomain>(
        &self,
        instruction: &DecodedInstruction,
        state: &mut AbstractState<D::Value>,
        domain: &D,
    ) {
        let ops = instruction.operands();
        let (pair, memory) = match ops[1] {
            Operand::Register(..) => (reg(&ops[1]), &ops[2]),
            _ => (None, &ops[1]),
        };
        let size = access_size(instruction.opcode(), &ops[0]);
        let (address, update) = address(state, memory, instruction.address, domain);

        let first = state.load(&address, size, domain);
        let second_address =
            domain.arithmetic(BinaryOp::Add, &address, &domain.constant(u64::from(size)));
        let second = state.load(&second_address, size, domain);

        if let Some((base, value)) = update {
            write_reg(state, base, value, domain);
        }
        if let Some(r) = reg(&ops[0]) {
            write_reg(state, r, first, domain);
        }
        if let Some(r) = pair {
            write_reg(state, r, second, domain);
        }
    }

    fn apply_store<D: ValueDomain>(
        &self,
        instruction: &DecodedInstruction,
        state: &mut AbstractState<D::Value>,
        domain: &D,
    ) {
        let ops = instruction.operands();
        let (pair, memory) = match ops[1] {
            Operand::Register(..) => (reg(&ops[1]), &ops[2]),
            _ => (None, &ops[1]),
        };
        let size = access_size(instruction.opcode(), &ops[0]);
        let (address, update) = address(state, memory, instruction.address, domain);

        let first = reg(&ops[0]).map(|r| read_reg(state, r, domain));
        let second = pair.map(|r| read_reg(state, r, domain));

        state.store(&address, size, first.unwrap_or_else(|| domain.top()), domain);
        if let Some(value) = second {
            let next = domain.arithmetic(BinaryOp::Add, &address, &domain.constant(u64::from(size)));
            state.store(&next, size, value, domain);
        }
        if let Some((base, value)) = update {
            write_reg(state, base, value, domain);
        }
    }

    /// Read-modify-write of the LSE extension.
    ///
    /// `swp`/`ld<op>` load the old value into their second register, `cas`
    /// into its first and `casp` into its first pair. Only `swp` stores a
    /// known value; the others leave the cell unknown.
    fn apply_atomic<D: ValueDomain>(
        &self,
        instruction: &DecodedInstruction,
        state: &mut AbstractState<D::Value>,
        domain: &D,
    ) {
        let ops = instruction.operands();
        let opcode = instruction.opcode();
        let size = atomic_size(opcode, &ops[0]);
        let (address, _) = address(state, &ops[2], instruction.address, domain);

        if let Operand::RegisterPair(_, first) = ops[0] {
            for index in [first, first + 1] {
                if index < 31 {
                    state.havoc_register(usize::from(index), domain);
                }
            }
            let high = domain.arithmetic(BinaryOp::Add, &address, &domain.constant(u64::from(size)));
            state.store(&address, size, domain.top(), domain);
            state.store(&high, size, domain.top(), domain);
            return;
        }

        let old = state.load(&address, size, domain);
        let stored = match opcode {
            Opcode::SWP(_) | Opcode::SWPB(_) | Opcode::SWPH(_) => reg(&ops[0])
                .map(|r| read_reg(state, r, domain))
                .unwrap_or_else(|| domain.top()),
            _ => domain.top(),
        };
        state.store(&address, size, stored, domain);

        let destination = match opcode {
            Opcode::CAS(_) | Opcode::CASB(_) | Opcode::CASH(_) => &ops[0],
            _ => &ops[1],
        };
        if let Some(r) = reg(destination) {
            write_reg(state, r, old, domain);
        }
    }

    /// Forget what an instruction without a transfer function may write.
    fn havoc<D: ValueDomain>(
        &self,
        instruction: &DecodedInstruction,
        state: &mut AbstractState<D::Value>,
        domain: &D,
    ) {
        let ops = instruction.operands();
        let touches_memory = ops.iter().any(is_memory);
        for operand in ops {
            match *operand {
                Operand::RegPreIndex(n, _, true)
                | Operand::RegPostIndex(n, _)
                | Operand::RegPostIndexReg(n, _) => state.havoc_register(usize::from(n), domain),
                Operand::RegisterPair(_, n) if touches_memory => {
                    for index in [n, n + 1] {
                        if index < 31 {
                            state.havoc_register(usize::from(index), domain);
                        }
                    }
                }
                ref operand if touches_memory => {
                    if let Some(Reg::Index(index, _)) = reg(operand) {
                        state.havoc_register(index, domain);
                    }
                }
                _ => {}
            }
        }
        if let Some(Reg::Index(index, _)) = reg(&ops[0]) {
            state.havoc_register(index, domain);
        }
        if touches_memory {
            state.havoc_memory();
        }
    }
}

impl RegisterFile for Arm64Semantics {
    fn registers(&self) -> &[&'static str] {
        &REGISTERS
    }

    /// Also accepts `wN`, `rN`, `lr` and `fp`.
    fn register_index(&self, name: &str) -> Option<usize> {
        let name = name.to_ascii_lowercase();
        match name.as_str() {
            "lr" => return Some(LINK_REGISTER),
            "fp" => return Some(FRAME_POINTER),
            _ => {}
        }
        if let Some(index) = REGISTERS.iter().position(|r| *r == name) {
            return Some(index);
        }
        let number = name.strip_prefix('w').or_else(|| name.strip_prefix('r'))?;
        number
            .parse::<usize>()
            .ok()
            .filter(|&n| n <= LINK_REGISTER)
    }
}

impl InstructionSemantics for Arm64Semantics {
    type Instruction = DecodedInstruction;

    fn name(&self) -> &'static str {
        "arm64"
    }

    fn alignment(&self) -> u64 {
        4
    }

    fn decode(&self, image: &CodeImage, address: u64) -> Result<DecodedInstruction, SemanticsError> {
        decode_at(image, address)
    }

    fn apply<D: ValueDomain>(
        &self,
        instruction: &DecodedInstruction,
        state: &mut AbstractState<D::Value>,
        domain: &D,
    ) -> Result<(), SemanticsError> {
        let ops = instruction.operands();
        let pc = instruction.address;
        let source = |state: &AbstractState<D::Value>, i: usize| {
            read(state, &ops[i], pc, domain).unwrap_or_else(|| domain.top())
        };
        let binary = |state: &mut AbstractState<D::Value>, op: BinaryOp| {
            let value = domain.arithmetic(op, &source(state, 1), &source(state, 2));
            if let Some(r) = reg(&ops[0]) {
                write_reg(state, r, value, domain);
            }
        };

        match instruction.opcode() {
            Opcode::HINT | Opcode::B | Opcode::Bcc(_) => {}
            Opcode::CBZ | Opcode::CBNZ | Opcode::TBZ | Opcode::TBNZ | Opcode::BR | Opcode::RET => {}
            Opcode::BL | Opcode::BLR => state.set_register(
                LINK_REGISTER,
                domain.constant(instruction.next_address()),
            ),
            Opcode::MOVZ => {
                let value = source(state, 1);
                if let Some(r) = reg(&ops[0]) {
                    write_reg(state, r, value, domain);
                }
            }
            Opcode::MOVN => {
                let value = domain.arithmetic(
                    BinaryOp::Xor,
                    &source(state, 1),
                    &domain.constant(u64::MAX),
                );
                if let Some(r) = reg(&ops[0]) {
                    write_reg(state, r, value, domain);
                }
            }
            Opcode::MOVK => {
                let (Some(r), &Operand::ImmShift(imm, shift)) = (reg(&ops[0]), &ops[1]) else {
                    self.havoc(instruction, state, domain);
                    return Ok(());
                };
                let kept = !(0xffffu64 << shift);
                let old = domain.arithmetic(
                    BinaryOp::And,
                    &read_reg(state, r, domain),
                    &domain.constant(kept),
                );
                let value = domain.arithmetic(
                    BinaryOp::Or,
                    &old,
                    &domain.constant(u64::from(imm) << shift),
                );
                write_reg(state, r, value, domain);
            }
            Opcode::ADD | Opcode::ADDS => binary(state, BinaryOp::Add),
            Opcode::SUB | Opcode::SUBS => binary(state, BinaryOp::Sub),
            Opcode::AND | Opcode::ANDS => binary(state, BinaryOp::And),
            Opcode::ORR => binary(state, BinaryOp::Or),
            Opcode::EOR => binary(state, BinaryOp::Xor),
            Opcode::LSLV => binary(state, BinaryOp::Shl),
            Opcode::LSRV => binary(state, BinaryOp::Shr),
            Opcode::MADD => {
                let product = domain.arithmetic(BinaryOp::Mul, &source(state, 1), &source(state, 2));
                let value = domain.arithmetic(BinaryOp::Add, &product, &source(state, 3));
                if let Some(r) = reg(&ops[0]) {
                    write_reg(state, r, value, domain);
                }
            }
            Opcode::ADR => {
                let value = source(state, 1);
                if let Some(r) = reg(&ops[0]) {
                    write_reg(state, r, value, domain);
                }
            }
            Opcode::ADRP => {
                let page = domain.constant(pc & !0xfff);
                let value = match ops[1] {
                    Operand::PCOffset(offset) => {
                        domain.arithmetic(BinaryOp::Add, &page, &domain.constant(offset as u64))
                    }
                    _ => domain.top(),
                };
                if let Some(r) = reg(&ops[0]) {
                    write_reg(state, r, value, domain);
                }
            }
            Opcode::LDR | Opcode::LDRB | Opcode::LDRH | Opcode::LDUR | Opcode::LDP => {
                self.apply_load(instruction, state, domain)
            }
            Opcode::STR | Opcode::STRB | Opcode::STRH | Opcode::STUR | Opcode::STP => {
                self.apply_store(instruction, state, domain)
            }
            Opcode::SWP(_)
            | Opcode::SWPB(_)
            | Opcode::SWPH(_)
            | Opcode::LDADD(_)
            | Opcode::LDADDB(_)
            | Opcode::LDADDH(_)
            | Opcode::LDCLR(_)
            | Opcode::LDCLRB(_)
            | Opcode::LDCLRH(_)
            | Opcode::LDEOR(_)
            | Opcode::LDEORB(_)
            | Opcode::LDEORH(_)
            | Opcode::LDSET(_)
            | Opcode::LDSETB(_)
            | Opcode::LDSETH(_)
            | Opcode::LDSMAX(_)
            | Opcode::LDSMAXB(_)
            | Opcode::LDSMAXH(_)
            | Opcode::LDSMIN(_)
            | Opcode::LDSMINB(_)
            | Opcode::LDSMINH(_)
            | Opcode::LDUMAX(_)
            | Opcode::LDUMAXB(_)
            | Opcode::LDUMAXH(_)
            | Opcode::LDUMIN(_)
            | Opcode::LDUMINB(_)
            | Opcode::LDUMINH(_)
            | Opcode::CAS(_)
            | Opcode::CASB(_)
            | Opcode::CASH(_)
            | Opcode::CASP(_) => self.apply_atomic(instruction, state, domain),
            _ => self.havoc(instruction, state, domain),
        }
        Ok(())
    }

    fn resolve_targets<D: ValueDomain>(
        &self,
        instruction: &DecodedInstruction,
        state: &AbstractState<D::Value>,
        domain: &D,
        bound: usize,
    ) -> Result<Vec<u64>, SemanticsError> {
        let unbounded = || SemanticsError::UnboundedTarget {
            address: instruction.address,
            instruction: instruction.to_string(),
        };
        let register = target_register(instruction).ok_or_else(unbounded)?;
        let value = read_reg(state, register, domain);
        let mut targets = domain.enumerate(&value, bound).ok_or_else(unbounded)?;
        targets.retain(|target| target % 4 == 0);
        if targets.is_empty() {
            return Err(unbounded());
        }
        Ok(targets)
    }

    fn assume_target<D: ValueDomain>(
        &self,
        instruction: &DecodedInstruction,
        target: u64,
        state: &mut AbstractState<D::Value>,
        domain: &D,
    ) {
        let ops = instruction.operands();
        let taken = instruction.branch_target() == Some(target)
            && target != instruction.next_address();

        let (register, relation, value) = match instruction.opcode() {
            Opcode::CBZ | Opcode::CBNZ => {
                let Some(r @ Reg::Index(_, SizeCode::X)) = reg(&ops[0]) else {
                    return;
                };
                let zero = (instruction.opcode() == Opcode::CBZ) == taken;
                let relation = if zero { Relation::Eq } else { Relation::Ne };
                (r, relation, 0)
            }
            // The link register already holds the return address
            Opcode::BLR
                if matches!(
                    target_register(instruction),
                    Some(Reg::Index(LINK_REGISTER, _))
                ) =>
            {
                return
            }
            Opcode::BR | Opcode::BLR | Opcode::RET => {
                let Some(r) = target_register(instruction) else {
                    return;
                };
                (r, Relation::Eq, target)
            }
            _ => return,
        };

        let current = read_reg(state, register, domain);
        match domain.refine(relation, &current, &domain.constant(value)) {
            Some(refined) => write_reg(state, register, refined, domain),
            None => state.set_bottom(),
        }
    }
}
