use std::collections::HashMap;
use std::sync::Arc;

use tela_bytecode::{
    BytecodeOffset, ClassId, ConstPoolIdx, FieldTarget, FunctionId, IfCond, ValueKind,
};

use crate::templates::Template;

/// How an invoke template finds its callee. Advice-bearing templates
/// always receive the full method identity; only the uninstrumented
/// fast path of a resolved virtual/interface dispatch gets away with a
/// bare vtable index.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Callee {
    Unresolved(ConstPoolIdx),
    Identity(FunctionId),
    VtableIndex(u32),
}

/// What a monitor-releasing return unlocks.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MonitorTarget {
    ReceiverLocal(u32),
    ClassObject(ClassId),
}

/// Operands bound to a template at emission time.
#[derive(Clone, PartialEq, Debug)]
pub enum Operands {
    None,
    Pool {
        idx: ConstPoolIdx,
    },
    Local {
        index: u32,
    },
    Branch {
        cond: Option<IfCond>,
        test_null: bool,
        target: BytecodeOffset,
    },
    FieldFast {
        target: FieldTarget,
    },
    ClassRef {
        class: ClassId,
    },
    NewArray {
        kind: ValueKind,
    },
    Invoke {
        callee: Callee,
        idx: ConstPoolIdx,
    },
    Return {
        monitor: Option<MonitorTarget>,
    },
    Entry {
        method: FunctionId,
        receiver_local: Option<u32>,
    },
}

impl Operands {
    pub fn pool_idx(&self) -> ConstPoolIdx {
        match self {
            Operands::Pool { idx } => *idx,
            _ => panic!("template bound without pool operand: {:?}", self),
        }
    }

    pub fn local_index(&self) -> u32 {
        match self {
            Operands::Local { index } => *index,
            _ => panic!("template bound without local operand: {:?}", self),
        }
    }

    pub fn branch(&self) -> (Option<IfCond>, bool, BytecodeOffset) {
        match self {
            Operands::Branch {
                cond,
                test_null,
                target,
            } => (*cond, *test_null, *target),
            _ => panic!("template bound without branch operand: {:?}", self),
        }
    }

    pub fn field_target(&self) -> FieldTarget {
        match self {
            Operands::FieldFast { target } => *target,
            _ => panic!("template bound without field operand: {:?}", self),
        }
    }

    pub fn class(&self) -> ClassId {
        match self {
            Operands::ClassRef { class } => *class,
            _ => panic!("template bound without class operand: {:?}", self),
        }
    }

    pub fn array_kind(&self) -> ValueKind {
        match self {
            Operands::NewArray { kind } => *kind,
            _ => panic!("template bound without array-kind operand: {:?}", self),
        }
    }

    pub fn invoke(&self) -> (Callee, ConstPoolIdx) {
        match self {
            Operands::Invoke { callee, idx } => (*callee, *idx),
            _ => panic!("template bound without invoke operand: {:?}", self),
        }
    }

    pub fn monitor(&self) -> Option<MonitorTarget> {
        match self {
            Operands::Return { monitor } => *monitor,
            _ => panic!("template bound without return operand: {:?}", self),
        }
    }

    pub fn entry(&self) -> (FunctionId, Option<u32>) {
        match self {
            Operands::Entry {
                method,
                receiver_local,
            } => (*method, *receiver_local),
            _ => panic!("template bound without entry operand: {:?}", self),
        }
    }
}

/// Control outcome of running one template.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Effect {
    Next,
    Branch(BytecodeOffset),
    Return(Option<crate::heap::Value>),
}

#[derive(Debug)]
pub struct EmittedInstr {
    pub offset: BytecodeOffset,
    pub template: Arc<Template>,
    pub operands: Operands,
}

/// The compiled form of one method: the emitted template invocation
/// sequence plus the branch-target map and the operand-stack shape
/// recorded at every instruction boundary.
#[derive(Debug)]
pub struct Code {
    fct: FunctionId,
    entry: Option<EmittedInstr>,
    instrs: Vec<EmittedInstr>,
    offset_to_index: HashMap<BytecodeOffset, usize>,
    shapes: Vec<(BytecodeOffset, Vec<ValueKind>)>,
}

impl Code {
    pub fn new(
        fct: FunctionId,
        entry: Option<EmittedInstr>,
        instrs: Vec<EmittedInstr>,
        offset_to_index: HashMap<BytecodeOffset, usize>,
        shapes: Vec<(BytecodeOffset, Vec<ValueKind>)>,
    ) -> Code {
        Code {
            fct,
            entry,
            instrs,
            offset_to_index,
            shapes,
        }
    }

    pub fn fct(&self) -> FunctionId {
        self.fct
    }

    pub fn entry(&self) -> Option<&EmittedInstr> {
        self.entry.as_ref()
    }

    pub fn instrs(&self) -> &[EmittedInstr] {
        &self.instrs
    }

    pub fn index_of(&self, offset: BytecodeOffset) -> Option<usize> {
        self.offset_to_index.get(&offset).copied()
    }

    /// Operand-stack shape at each instruction boundary, as value kinds
    /// (wide kinds stand for two slots).
    pub fn shapes(&self) -> &[(BytecodeOffset, Vec<ValueKind>)] {
        &self.shapes
    }
}
