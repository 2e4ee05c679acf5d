//! # Contract Virtual Machine
//!
//! A tiny bytecode interpreter that runs one transaction's payload against
//! the chain's [`ContractState`].
//!
//! ## Execution Model
//!
//! The payload is scanned once, front to back, one byte per step. Every byte
//! is looked up as an opcode; bytes that aren't opcodes do nothing. An opcode
//! that needs an argument takes the byte *immediately before it* as that
//! argument, so `0x03 0x0a` reads as "push the integer 3".
//!
//! ```text
//! 0x03 0x0a 0x02 0x0a 0x0e
//!  └─arg─┘   └─arg─┘   Sub     queue: [3] → [3, 2] → [1]
//!       PushInt   PushInt
//! ```
//!
//! ## The operand queue is FIFO
//!
//! Operands are removed oldest-first. `Sub` on `[3, 2]` computes `3 - 2`, and
//! `Pack` reads its length before the bytes it packs. Programs written for a
//! last-in-first-out stack do not run here; they fail with a type mismatch
//! rather than being reinterpreted.
//!
//! ## Errors
//!
//! Underflow, type mismatches, arithmetic overflow and unstorable values all
//! surface as [`VmError`]. Nothing in here panics on bad bytecode. There is
//! no gas and no rollback: writes made before an error stay in the state.

use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;

use crate::storage::state::ContractState;

// ---------------------------------------------------------------------------
// Instructions & Values
// ---------------------------------------------------------------------------

/// Single-byte opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Instruction {
    /// Enqueue the preceding byte as an integer.
    PushInt = 0x0a,
    /// Dequeue `a`, then `b`; enqueue `a + b`.
    Add = 0x0b,
    /// Enqueue the preceding byte as a byte.
    PushByte = 0x0c,
    /// Dequeue a length `n`, then `n` bytes; enqueue them as one byte string.
    Pack = 0x0d,
    /// Dequeue `a`, then `b`; enqueue `a - b`.
    Sub = 0x0e,
    /// Dequeue a byte-string key, then a value; write the value to state.
    Store = 0x0f,
}

impl TryFrom<u8> for Instruction {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x0a => Ok(Self::PushInt),
            0x0b => Ok(Self::Add),
            0x0c => Ok(Self::PushByte),
            0x0d => Ok(Self::Pack),
            0x0e => Ok(Self::Sub),
            0x0f => Ok(Self::Store),
            other => Err(other),
        }
    }
}

/// A runtime operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Byte(u8),
    Bytes(Vec<u8>),
}

impl Value {
    fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Byte(_) => ValueKind::Byte,
            Value::Bytes(_) => ValueKind::Bytes,
        }
    }
}

/// The tag of a [`Value`], for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Byte,
    Bytes,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "int",
            ValueKind::Byte => "byte",
            ValueKind::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// Recoverable execution failures. `offset` is the payload position of the
/// failing opcode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("operand queue underflow at offset {offset}")]
    StackUnderflow { offset: usize },

    #[error("type mismatch at offset {offset}: expected {expected}, found {found}")]
    TypeMismatch {
        offset: usize,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("opcode at offset {offset} has no preceding operand byte")]
    MissingOperand { offset: usize },

    #[error("arithmetic overflow at offset {offset}")]
    Overflow { offset: usize },

    #[error("invalid pack length {len} at offset {offset}")]
    InvalidPackLength { offset: usize, len: i64 },

    #[error("cannot store a {kind} value at offset {offset}")]
    UnsupportedStoreValue { offset: usize, kind: ValueKind },
}

// ---------------------------------------------------------------------------
// Vm
// ---------------------------------------------------------------------------

/// One program execution over a borrowed contract state.
pub struct Vm<'a> {
    /// Program bytes.
    data: &'a [u8],
    /// Offset of the opcode being executed.
    ip: usize,
    /// FIFO operand queue.
    queue: VecDeque<Value>,
    /// Shared contract state this program writes into.
    state: &'a mut ContractState,
}

impl<'a> Vm<'a> {
    pub fn new(data: &'a [u8], state: &'a mut ContractState) -> Self {
        Self {
            data,
            ip: 0,
            queue: VecDeque::with_capacity(16),
            state,
        }
    }

    /// Execute the whole program.
    pub fn run(&mut self) -> Result<(), VmError> {
        while self.ip < self.data.len() {
            if let Ok(instr) = Instruction::try_from(self.data[self.ip]) {
                self.exec(instr)?;
            }
            self.ip += 1;
        }
        Ok(())
    }

    /// Dequeue the oldest operand. Used to read results after [`run`](Self::run).
    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.queue
            .pop_front()
            .ok_or(VmError::StackUnderflow { offset: self.ip })
    }

    /// Operands currently queued, oldest first.
    pub fn queue(&self) -> &VecDeque<Value> {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn exec(&mut self, instr: Instruction) -> Result<(), VmError> {
        match instr {
            Instruction::PushInt => {
                let operand = self.operand()?;
                self.queue.push_back(Value::Int(i64::from(operand)));
            }
            Instruction::PushByte => {
                let operand = self.operand()?;
                self.queue.push_back(Value::Byte(operand));
            }
            Instruction::Add => {
                let a = self.pop_int()?;
                let b = self.pop_int()?;
                let sum = a.checked_add(b).ok_or(VmError::Overflow { offset: self.ip })?;
                self.queue.push_back(Value::Int(sum));
            }
            Instruction::Sub => {
                let a = self.pop_int()?;
                let b = self.pop_int()?;
                let diff = a.checked_sub(b).ok_or(VmError::Overflow { offset: self.ip })?;
                self.queue.push_back(Value::Int(diff));
            }
            Instruction::Pack => {
                let n = self.pop_int()?;
                let len = usize::try_from(n).map_err(|_| VmError::InvalidPackLength {
                    offset: self.ip,
                    len: n,
                })?;
                let mut packed = Vec::with_capacity(len.min(self.queue.len()));
                for _ in 0..len {
                    packed.push(self.pop_byte()?);
                }
                self.queue.push_back(Value::Bytes(packed));
            }
            Instruction::Store => {
                let key = self.pop_bytes()?;
                let value = match self.pop()? {
                    Value::Int(v) => v.to_le_bytes().to_vec(),
                    other => {
                        return Err(VmError::UnsupportedStoreValue {
                            offset: self.ip,
                            kind: other.kind(),
                        })
                    }
                };
                self.state.put(key, value);
            }
        }
        Ok(())
    }

    fn operand(&self) -> Result<u8, VmError> {
        self.ip
            .checked_sub(1)
            .map(|i| self.data[i])
            .ok_or(VmError::MissingOperand { offset: self.ip })
    }

    fn pop_int(&mut self) -> Result<i64, VmError> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            other => Err(self.mismatch(ValueKind::Int, &other)),
        }
    }

    fn pop_byte(&mut self) -> Result<u8, VmError> {
        match self.pop()? {
            Value::Byte(b) => Ok(b),
            other => Err(self.mismatch(ValueKind::Byte, &other)),
        }
    }

    fn pop_bytes(&mut self) -> Result<Vec<u8>, VmError> {
        match self.pop()? {
            Value::Bytes(b) => Ok(b),
            other => Err(self.mismatch(ValueKind::Bytes, &other)),
        }
    }

    fn mismatch(&self, expected: ValueKind, found: &Value) -> VmError {
        VmError::TypeMismatch {
            offset: self.ip,
            expected,
            found: found.kind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
