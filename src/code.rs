//! Bytecode representation and control flow queries.
//!
//! The drivers of [`crate::analysis`] only interact with a [`Code`] object
//! through instruction classification predicates (`is_label`, `is_jump`,
//! ...), jump targets, successor sets and location stepping. Opcodes carry
//! no semantics here; their abstract effects are defined by the
//! [`crate::dispatch::Receiver`] of each analysis.

use crate::errors::{AnalysisError, AnalysisResult};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Instruction address: a position in the instruction sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub usize);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl Addr {
    /// Address of the next instruction in program order.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Address of the previous instruction in program order.
    ///
    /// # Panics
    ///
    /// Panics when called on the first instruction address.
    #[must_use]
    pub fn prev(self) -> Self {
        self.0
            .checked_sub(1)
            .map(Self)
            .expect("stepped before the first instruction")
    }
}

/// Symbolic jump target, resolved to an [`Addr`] at code construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, ".L{}", self.0)
    }
}

/// Instruction set of the analyzed bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// Join point pseudo-instruction.
    Label(Label),
    Push(i64),
    Pop,
    Dup,
    Add,
    Load(String),
    Store(String),
    Jump(Label),
    /// Conditional jump: falls through or jumps to the label.
    Branch(Label),
    Call(u8),
    Ret,
    Nop,
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Label(l) => write!(f, "label {l}"),
            Self::Push(v) => write!(f, "push {v}"),
            Self::Pop => write!(f, "pop"),
            Self::Dup => write!(f, "dup"),
            Self::Add => write!(f, "add"),
            Self::Load(name) => write!(f, "load {name}"),
            Self::Store(name) => write!(f, "store {name}"),
            Self::Jump(l) => write!(f, "jump {l}"),
            Self::Branch(l) => write!(f, "branch {l}"),
            Self::Call(argc) => write!(f, "call {argc}"),
            Self::Ret => write!(f, "ret"),
            Self::Nop => write!(f, "nop"),
        }
    }
}

/// A validated instruction sequence with resolved labels.
#[derive(Debug, Clone)]
pub struct Code {
    instrs: Vec<Instr>,
    labels: BTreeMap<Label, Addr>,
}

impl Code {
    /// Builds a code object from an instruction sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence is empty, defines the same label
    /// twice, or jumps to a label that is never defined.
    pub fn new(instrs: Vec<Instr>) -> AnalysisResult<Self> {
        if instrs.is_empty() {
            return Err(AnalysisError::NoCode);
        }

        let mut labels = BTreeMap::new();
        for (i, instr) in instrs.iter().enumerate() {
            if let Instr::Label(l) = instr {
                if labels.insert(*l, Addr(i)).is_some() {
                    return Err(AnalysisError::DuplicateLabel(*l));
                }
            }
        }
        for (i, instr) in instrs.iter().enumerate() {
            if let Instr::Jump(l) | Instr::Branch(l) = instr {
                if !labels.contains_key(l) {
                    return Err(AnalysisError::UndefinedLabel(*l, Addr(i)));
                }
            }
        }

        Ok(Self { instrs, labels })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// First instruction address.
    #[must_use]
    pub fn begin(&self) -> Addr {
        Addr(0)
    }

    /// One past the last instruction address.
    #[must_use]
    pub fn end(&self) -> Addr {
        Addr(self.instrs.len())
    }

    /// Last instruction address, the starting point of reverse traversals.
    #[must_use]
    pub fn rbegin(&self) -> Addr {
        Addr(self.instrs.len() - 1)
    }

    /// Iterates over all instruction addresses in program order.
    pub fn addrs(&self) -> impl Iterator<Item = Addr> {
        (0..self.instrs.len()).map(Addr)
    }

    /// The instruction at the given address.
    ///
    /// # Panics
    ///
    /// Panics if the address is out of bounds.
    #[must_use]
    pub fn instr(&self, addr: Addr) -> &Instr {
        &self.instrs[addr.0]
    }

    #[must_use]
    pub fn is_label(&self, addr: Addr) -> bool {
        matches!(self.instrs.get(addr.0), Some(Instr::Label(_)))
    }

    #[must_use]
    pub fn is_jump(&self, addr: Addr) -> bool {
        matches!(
            self.instrs.get(addr.0),
            Some(Instr::Jump(_) | Instr::Branch(_))
        )
    }

    #[must_use]
    pub fn is_uncond_jump(&self, addr: Addr) -> bool {
        matches!(self.instrs.get(addr.0), Some(Instr::Jump(_)))
    }

    #[must_use]
    pub fn is_entry_point(&self, addr: Addr) -> bool {
        addr == self.begin()
    }

    #[must_use]
    pub fn is_exit_point(&self, addr: Addr) -> bool {
        matches!(self.instrs.get(addr.0), Some(Instr::Ret))
    }

    /// The jump destination of the jump instruction at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the instruction at `addr` is not a jump.
    #[must_use]
    pub fn target(&self, addr: Addr) -> Addr {
        match self.instr(addr) {
            Instr::Jump(l) | Instr::Branch(l) => self.labels[l],
            other => panic!("target() on non-jump instruction `{other}` at {addr}"),
        }
    }

    /// The set of locations structurally reachable as immediate next
    /// instructions from `addr`.
    #[must_use]
    pub fn successors(&self, addr: Addr) -> BTreeSet<Addr> {
        let mut succs = BTreeSet::new();
        match self.instr(addr) {
            Instr::Ret => {}
            Instr::Jump(l) => {
                succs.insert(self.labels[l]);
            }
            Instr::Branch(l) => {
                succs.insert(self.labels[l]);
                if addr.next() != self.end() {
                    succs.insert(addr.next());
                }
            }
            _ => {
                if addr.next() != self.end() {
                    succs.insert(addr.next());
                }
            }
        }
        succs
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for addr in self.addrs() {
            writeln!(f, "{:>5}: {}", addr.to_string(), self.instr(addr))?;
        }
        Ok(())
    }
}
