use thiserror::Error;

use crate::data::{BytecodeOffset, ConstPoolIdx, IfCond, Instr, Opcode, ValueKind};

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum ReadError {
    #[error("unknown opcode byte {byte:#04x} at offset {offset}")]
    UnknownOpcode { byte: u8, offset: u32 },
    #[error("pseudo-opcode {opcode} encoded at offset {offset}")]
    PseudoOpcode { opcode: Opcode, offset: u32 },
    #[error("unknown value kind byte {byte:#04x} at offset {offset}")]
    UnknownKind { byte: u8, offset: u32 },
    #[error("unknown branch condition byte {byte:#04x} at offset {offset}")]
    UnknownCondition { byte: u8, offset: u32 },
    #[error("truncated instruction at offset {offset}")]
    Truncated { offset: u32 },
}

/// Decodes method bytecode into `(offset, instruction)` pairs. The
/// offset is the position of the opcode byte, which is also what
/// branch targets refer to.
pub struct BytecodeReader<'a> {
    code: &'a [u8],
    pos: usize,
    instruction_start: u32,
}

impl<'a> BytecodeReader<'a> {
    pub fn new(code: &'a [u8]) -> BytecodeReader<'a> {
        BytecodeReader {
            code,
            pos: 0,
            instruction_start: 0,
        }
    }

    fn read_instr(&mut self) -> Result<Instr, ReadError> {
        let byte = self.read_u8()?;
        let opcode = Opcode::try_from(byte).map_err(|_| ReadError::UnknownOpcode {
            byte,
            offset: self.instruction_start,
        })?;

        let instr = match opcode {
            Opcode::Nop => Instr::Nop,
            Opcode::Const => Instr::Const {
                idx: self.read_idx()?,
            },
            Opcode::Load => Instr::Load {
                kind: self.read_kind()?,
                index: self.read_u32()?,
            },
            Opcode::Store => Instr::Store {
                kind: self.read_kind()?,
                index: self.read_u32()?,
            },
            Opcode::Pop => Instr::Pop,
            Opcode::Pop2 => Instr::Pop2,
            Opcode::Dup => Instr::Dup,
            Opcode::DupX1 => Instr::DupX1,
            Opcode::Swap => Instr::Swap,
            Opcode::Add => Instr::Add {
                kind: self.read_kind()?,
            },
            Opcode::Sub => Instr::Sub {
                kind: self.read_kind()?,
            },
            Opcode::Mul => Instr::Mul {
                kind: self.read_kind()?,
            },
            Opcode::Div => Instr::Div {
                kind: self.read_kind()?,
            },
            Opcode::Neg => Instr::Neg {
                kind: self.read_kind()?,
            },
            Opcode::Cmp => Instr::Cmp {
                kind: self.read_kind()?,
            },
            Opcode::If => Instr::If {
                cond: self.read_cond()?,
                target: self.read_target()?,
            },
            Opcode::IfCmp => Instr::IfCmp {
                cond: self.read_cond()?,
                target: self.read_target()?,
            },
            Opcode::IfRefCmp => Instr::IfRefCmp {
                cond: self.read_cond()?,
                target: self.read_target()?,
            },
            Opcode::IfNull => Instr::IfNull {
                test_null: self.read_u8()? != 0,
                target: self.read_target()?,
            },
            Opcode::Goto => Instr::Goto {
                target: self.read_target()?,
            },
            Opcode::GetField => Instr::GetField {
                idx: self.read_idx()?,
            },
            Opcode::PutField => Instr::PutField {
                idx: self.read_idx()?,
            },
            Opcode::GetStatic => Instr::GetStatic {
                idx: self.read_idx()?,
            },
            Opcode::PutStatic => Instr::PutStatic {
                idx: self.read_idx()?,
            },
            Opcode::ArrayLoad => Instr::ArrayLoad {
                kind: self.read_kind()?,
            },
            Opcode::ArrayStore => Instr::ArrayStore {
                kind: self.read_kind()?,
            },
            Opcode::ArrayLength => Instr::ArrayLength,
            Opcode::New => Instr::New {
                idx: self.read_idx()?,
            },
            Opcode::NewArray => Instr::NewArray {
                kind: self.read_kind()?,
            },
            Opcode::CheckCast => Instr::CheckCast {
                idx: self.read_idx()?,
            },
            Opcode::InstanceOf => Instr::InstanceOf {
                idx: self.read_idx()?,
            },
            Opcode::MonitorEnter => Instr::MonitorEnter,
            Opcode::MonitorExit => Instr::MonitorExit,
            Opcode::Throw => Instr::Throw,
            Opcode::InvokeVirtual => Instr::InvokeVirtual {
                idx: self.read_idx()?,
            },
            Opcode::InvokeInterface => Instr::InvokeInterface {
                idx: self.read_idx()?,
            },
            Opcode::InvokeSpecial => Instr::InvokeSpecial {
                idx: self.read_idx()?,
            },
            Opcode::InvokeStatic => Instr::InvokeStatic {
                idx: self.read_idx()?,
            },
            Opcode::Return => {
                let byte = self.read_u8()?;
                let kind = if byte == 0 {
                    None
                } else {
                    Some(self.kind_from_byte(byte)?)
                };
                Instr::Return { kind }
            }
            Opcode::MethodEntry => {
                return Err(ReadError::PseudoOpcode {
                    opcode,
                    offset: self.instruction_start,
                });
            }
        };

        Ok(instr)
    }

    fn read_u8(&mut self) -> Result<u8, ReadError> {
        let byte = *self.code.get(self.pos).ok_or(ReadError::Truncated {
            offset: self.instruction_start,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u32(&mut self) -> Result<u32, ReadError> {
        if self.pos + 4 > self.code.len() {
            return Err(ReadError::Truncated {
                offset: self.instruction_start,
            });
        }
        let bytes: [u8; 4] = self.code[self.pos..self.pos + 4].try_into().unwrap();
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_idx(&mut self) -> Result<ConstPoolIdx, ReadError> {
        Ok(ConstPoolIdx(self.read_u32()?))
    }

    fn read_target(&mut self) -> Result<BytecodeOffset, ReadError> {
        Ok(BytecodeOffset(self.read_u32()?))
    }

    fn read_kind(&mut self) -> Result<ValueKind, ReadError> {
        let byte = self.read_u8()?;
        self.kind_from_byte(byte)
    }

    fn kind_from_byte(&self, byte: u8) -> Result<ValueKind, ReadError> {
        ValueKind::try_from(byte).map_err(|_| ReadError::UnknownKind {
            byte,
            offset: self.instruction_start,
        })
    }

    fn read_cond(&mut self) -> Result<IfCond, ReadError> {
        let byte = self.read_u8()?;
        IfCond::try_from(byte).map_err(|_| ReadError::UnknownCondition {
            byte,
            offset: self.instruction_start,
        })
    }
}

impl<'a> Iterator for BytecodeReader<'a> {
    type Item = Result<(BytecodeOffset, Instr), ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.code.len() {
            return None;
        }

        self.instruction_start = self.pos as u32;
        let offset = BytecodeOffset(self.instruction_start);

        match self.read_instr() {
            Ok(instr) => Some(Ok((offset, instr))),
            Err(err) => {
                // Make further iteration stop after an error.
                self.pos = self.code.len();
                Some(Err(err))
            }
        }
    }
}
