//! Instruction dispatch: the seam between the worklist drivers and the
//! per-opcode transfer functions of an analysis.
//!
//! A [`Dispatcher`] decides what the instruction at a location is and runs
//! the matching piece of analysis logic against the current abstract
//! state. It never advances the location; sequencing belongs to the
//! driver. [`InstructionDispatcher`] is the standard dispatcher: a visitor
//! routing every opcode to exactly one [`Receiver`] method.

use crate::code::{Addr, Code, Instr};

/// Outcome flag threaded through a single dispatch.
///
/// Failing a dispatch is a soft signal meant for chaining dispatchers; it
/// does not indicate an error and the drivers of [`crate::analysis`] do
/// not act on it.
pub struct Dispatch {
    success: bool,
}

impl Dispatch {
    fn new() -> Self {
        Self { success: true }
    }

    /// Marks the current dispatch as failed.
    pub fn fail(&mut self) {
        self.success = false;
    }
}

/// Dispatcher contract used by the analysis drivers.
pub trait Dispatcher<S> {
    /// Dispatches on the instruction at `addr`, mutating the abstract
    /// state, and returns whether the dispatched logic completed without
    /// calling [`Dispatch::fail`].
    ///
    /// The success flag is reset at every call, so a failure in one
    /// dispatch does not leak into the next.
    fn dispatch(&mut self, code: &Code, addr: Addr, state: &mut S) -> bool {
        let mut outcome = Dispatch::new();
        self.do_dispatch(code, addr, state, &mut outcome);
        outcome.success
    }

    /// The actual dispatch logic.
    fn do_dispatch(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch);
}

/// Per-opcode visitor implementing the abstract effects of an analysis.
///
/// Every method defaults to [`Receiver::any`], so an analysis only spells
/// out the opcodes it cares about. The [`Receiver::label`] hook is called
/// at join points. Operands are read back from `code.instr(addr)` by the
/// handlers that need them.
#[allow(unused_variables)]
pub trait Receiver<S> {
    /// Fallback handler for all opcodes not refined by the implementation.
    fn any(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {}

    /// Called at join point pseudo-instructions.
    fn label(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn push(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn pop(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn dup(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn add(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn load(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn store(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn jump(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn branch(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn call(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn ret(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }

    fn nop(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        self.any(code, addr, state, outcome);
    }
}

/// Opcode-based dispatcher routing each instruction to the matching
/// [`Receiver`] method.
///
/// The match over [`Instr`] is exhaustive: extending the instruction set
/// without extending the routing is a compile error, so an opcode unknown
/// to the receiver cannot be reached at runtime.
pub struct InstructionDispatcher<R> {
    receiver: R,
}

impl<R> InstructionDispatcher<R> {
    pub fn new(receiver: R) -> Self {
        Self { receiver }
    }

    pub fn receiver(&self) -> &R {
        &self.receiver
    }

    pub fn receiver_mut(&mut self) -> &mut R {
        &mut self.receiver
    }
}

impl<S, R: Receiver<S>> Dispatcher<S> for InstructionDispatcher<R> {
    fn do_dispatch(&mut self, code: &Code, addr: Addr, state: &mut S, outcome: &mut Dispatch) {
        match code.instr(addr) {
            Instr::Label(_) => self.receiver.label(code, addr, state, outcome),
            Instr::Push(_) => self.receiver.push(code, addr, state, outcome),
            Instr::Pop => self.receiver.pop(code, addr, state, outcome),
            Instr::Dup => self.receiver.dup(code, addr, state, outcome),
            Instr::Add => self.receiver.add(code, addr, state, outcome),
            Instr::Load(_) => self.receiver.load(code, addr, state, outcome),
            Instr::Store(_) => self.receiver.store(code, addr, state, outcome),
            Instr::Jump(_) => self.receiver.jump(code, addr, state, outcome),
            Instr::Branch(_) => self.receiver.branch(code, addr, state, outcome),
            Instr::Call(_) => self.receiver.call(code, addr, state, outcome),
            Instr::Ret => self.receiver.ret(code, addr, state, outcome),
            Instr::Nop => self.receiver.nop(code, addr, state, outcome),
        }
    }
}
