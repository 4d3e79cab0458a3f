use std::sync::atomic::{AtomicBool, Ordering};

use tela_bytecode::{BytecodeOffset, ClassId, FieldTarget, FunctionId, InvokeKind, ValueKind};

use crate::heap::Value;

/// Process-wide switch for advising. Every instrumented template reads
/// the gate once per advice point; the read is a relaxed atomic load so
/// that disabled advising costs no more than a flag test on the hot
/// path. Staleness of a couple of instructions after a flip is
/// tolerated.
pub struct AdviceGate {
    active: AtomicBool,
}

impl AdviceGate {
    pub fn new() -> AdviceGate {
        AdviceGate {
            active: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Cmp,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StackOp {
    Pop,
    Pop2,
    Dup,
    DupX1,
    Swap,
}

/// Consumer side of advising: one entry point per semantic event.
/// Implementations record or react to events; the weaving core only
/// ever calls in, it never depends on what a handler does. All methods
/// default to no-ops so handlers implement just what they need.
///
/// "Before" events observe operands as they were before the
/// instruction's effect; "after" events observe the result.
#[allow(unused_variables)]
pub trait AdviceHandler: Send + Sync {
    fn const_load(&self, value: Value) {}

    fn load(&self, kind: ValueKind, index: u32) {}

    fn store(&self, kind: ValueKind, index: u32, value: Value) {}

    fn stack_adjust(&self, op: StackOp) {}

    fn operation(&self, op: ArithOp, kind: ValueKind, inputs: &[Value]) {}

    fn branch(&self, inputs: &[Value], target: BytecodeOffset) {}

    fn field_read(&self, object: Value, field: FieldTarget) {}

    fn field_write(&self, object: Value, field: FieldTarget, value: Value) {}

    fn static_read(&self, field: FieldTarget) {}

    fn static_write(&self, field: FieldTarget, value: Value) {}

    fn array_read(&self, array: Value, index: i32) {}

    fn array_write(&self, array: Value, index: i32, value: Value) {}

    fn array_length(&self, array: Value) {}

    fn object_created(&self, object: Value) {}

    fn array_created(&self, array: Value) {}

    fn before_invoke(&self, kind: InvokeKind, receiver: Option<Value>, method: FunctionId) {}

    fn after_invoke(
        &self,
        kind: InvokeKind,
        receiver: Option<Value>,
        method: FunctionId,
        result: Option<Value>,
    ) {
    }

    fn method_return(&self, value: Option<Value>) {}

    fn monitor_enter(&self, object: Value) {}

    fn monitor_exit(&self, object: Value) {}

    fn check_cast(&self, object: Value, class: ClassId) {}

    fn instance_of(&self, object: Value, class: ClassId) {}

    fn thrown(&self, object: Value) {}

    fn method_entry(&self, method: FunctionId, receiver: Option<Value>) {}
}

pub struct NullAdviceHandler;

impl AdviceHandler for NullAdviceHandler {}
