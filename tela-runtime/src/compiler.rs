use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use tela_bytecode::{
    display_fct, BytecodeFunction, BytecodeOffset, BytecodeReader, ClassId, ConstPoolEntry,
    ConstPoolIdx, FunctionData, FunctionId, Instr, InvokeKind, Opcode, ReadError, ValueKind,
};

use crate::advice::ArithOp;
use crate::policy::{AdviceModes, AdvicePolicy};
use crate::templates::{InvokeState, TemplateTable, TemplateTag};
use crate::vm::code::{Callee, Code, EmittedInstr, MonitorTarget, Operands};
use crate::vm::VM;

#[derive(Clone, PartialEq, Debug, Error)]
pub enum WeaveError {
    /// The selected variant table has no template for the tag the
    /// instruction resolved to. The store was built incompletely
    /// relative to the bytecode dialect; the method cannot be compiled.
    #[error("no template for {opcode} (tag {tag:?}) in selected variant table")]
    MissingTemplate { opcode: Opcode, tag: TemplateTag },
    #[error("function `{0}` has no bytecode")]
    MissingBytecode(String),
    #[error(transparent)]
    MalformedBytecode(#[from] ReadError),
}

/// Compiles one method, deduplicating concurrent requests through the
/// compilation database. A configuration fault aborts this method's
/// compilation; it is never papered over with the plain template.
pub fn compile_fct(vm: &VM, fct_id: FunctionId) -> Result<Arc<Code>, WeaveError> {
    // Block here if compilation is already in progress.
    if let Some(code) = vm.compilation_database.compilation_request(vm, fct_id) {
        return Ok(code);
    }

    match weave_fct(vm, fct_id) {
        Ok(code) => {
            let code = Arc::new(code);
            let code_id = vm.code_objects.add(code.clone());
            vm.compilation_database.finish_compilation(fct_id, code_id);
            Ok(code)
        }

        Err(err) => {
            vm.compilation_database.abort_compilation(fct_id);
            Err(err)
        }
    }
}

fn weave_fct(vm: &VM, fct_id: FunctionId) -> Result<Code, WeaveError> {
    let fct = vm.program().fct(fct_id);
    let name = display_fct(vm.program(), fct_id);
    let bytecode = fct
        .bytecode
        .as_ref()
        .ok_or_else(|| WeaveError::MissingBytecode(name.clone()))?;

    // Holding the read guard for the whole compilation keeps the policy
    // stable within this method; writers wait until every session is
    // done.
    let policy = vm.policy();

    let instrument = vm.method_filter().instrument(&name);
    if !instrument {
        log::trace!("instrumentation filtered out for {}", name);
    }

    let codegen = WeaveCodeGen {
        vm,
        fct_id,
        fct,
        bytecode,
        policy: &*policy,
        instrument,
        active: vm.templates().default_table(),
        stack: Vec::new(),
        instrs: Vec::new(),
        offset_to_index: HashMap::new(),
        shapes: Vec::new(),
    };

    let code = codegen.generate()?;
    log::debug!("compiled {} ({} templates)", name, code.instrs().len());
    Ok(code)
}

/// Per-method compilation session. Owns the session-local mutable
/// state: the active template table, the simulated operand-stack shape
/// and the emitted-code buffer. Never shared between sessions.
struct WeaveCodeGen<'a> {
    vm: &'a VM,
    fct_id: FunctionId,
    fct: &'a FunctionData,
    bytecode: &'a BytecodeFunction,
    policy: &'a AdvicePolicy,
    instrument: bool,

    active: &'a TemplateTable,
    stack: Vec<ValueKind>,
    instrs: Vec<EmittedInstr>,
    offset_to_index: HashMap<BytecodeOffset, usize>,
    shapes: Vec<(BytecodeOffset, Vec<ValueKind>)>,
}

impl<'a> WeaveCodeGen<'a> {
    fn generate(mut self) -> Result<Code, WeaveError> {
        let entry = self.select_entry()?;

        for result in BytecodeReader::new(self.bytecode.code()) {
            let (offset, instr) = result?;
            self.translate(offset, instr)?;
        }

        Ok(Code::new(
            self.fct_id,
            entry,
            self.instrs,
            self.offset_to_index,
            self.shapes,
        ))
    }

    /// Entry tracing is itself advice: the method-entry pseudo-opcode
    /// goes through variant selection like any real instruction, and
    /// only a non-default selection synthesizes the entry template,
    /// bound to the method identity and the receiver's local slot.
    fn select_entry(&mut self) -> Result<Option<EmittedInstr>, WeaveError> {
        let table = self.select(Opcode::MethodEntry);
        if self.vm.templates().is_default(table) {
            return Ok(None);
        }

        let tag = TemplateTag::MethodEntry;
        let template = table.get(tag).cloned().ok_or(WeaveError::MissingTemplate {
            opcode: Opcode::MethodEntry,
            tag,
        })?;

        let receiver_local = if self.fct.is_static { None } else { Some(0) };

        Ok(Some(EmittedInstr {
            offset: BytecodeOffset(0),
            template,
            operands: Operands::Entry {
                method: self.fct_id,
                receiver_local,
            },
        }))
    }

    /// One instruction: SELECT_VARIANT, RESOLVE_TAG, BIND_OPERANDS,
    /// EMIT. Any failure is a compile-time fault for this method.
    fn translate(&mut self, offset: BytecodeOffset, instr: Instr) -> Result<(), WeaveError> {
        let opcode = instr.opcode();

        self.offset_to_index.insert(offset, self.instrs.len());
        self.shapes.push((offset, self.stack.clone()));

        // Nops compile to nothing; the offset map makes branches to a
        // nop land on the following instruction.
        if instr == Instr::Nop {
            return Ok(());
        }

        self.active = self.select(opcode);
        let (tag, operands) = self.resolve(&instr);
        let template = self
            .active
            .get(tag)
            .cloned()
            .ok_or(WeaveError::MissingTemplate { opcode, tag })?;

        self.simulate(&instr);
        self.instrs.push(EmittedInstr {
            offset,
            template,
            operands,
        });

        Ok(())
    }

    /// Evaluated fresh for every instruction occurrence: the policy may
    /// differ between compilations, so nothing is cached across methods.
    fn select(&self, opcode: Opcode) -> &'a TemplateTable {
        let modes = if self.instrument {
            self.policy.modes(opcode)
        } else {
            AdviceModes::NONE
        };

        self.vm.templates().select(modes)
    }

    /// Specializes the opcode into its template tag from the
    /// instruction operands and const-pool resolution state, and binds
    /// the operands the template expects.
    fn resolve(&self, instr: &Instr) -> (TemplateTag, Operands) {
        match *instr {
            Instr::Nop => unreachable!("nops are dropped before tag resolution"),

            Instr::Const { idx } => {
                let kind = self
                    .bytecode
                    .const_pool(idx)
                    .kind()
                    .expect("constant load from non-value pool entry");
                (TemplateTag::const_load(kind), Operands::Pool { idx })
            }

            Instr::Load { kind, index } => (TemplateTag::load(kind), Operands::Local { index }),
            Instr::Store { kind, index } => (TemplateTag::store(kind), Operands::Local { index }),

            Instr::Pop => (TemplateTag::Pop, Operands::None),
            Instr::Pop2 => (TemplateTag::Pop2, Operands::None),
            Instr::Dup => (TemplateTag::Dup, Operands::None),
            Instr::DupX1 => (TemplateTag::DupX1, Operands::None),
            Instr::Swap => (TemplateTag::Swap, Operands::None),

            Instr::Add { kind } => (TemplateTag::arith(ArithOp::Add, kind), Operands::None),
            Instr::Sub { kind } => (TemplateTag::arith(ArithOp::Sub, kind), Operands::None),
            Instr::Mul { kind } => (TemplateTag::arith(ArithOp::Mul, kind), Operands::None),
            Instr::Div { kind } => (TemplateTag::arith(ArithOp::Div, kind), Operands::None),
            Instr::Neg { kind } => (TemplateTag::arith(ArithOp::Neg, kind), Operands::None),
            Instr::Cmp { kind } => (TemplateTag::cmp(kind), Operands::None),

            Instr::If { cond, target } => (
                TemplateTag::If,
                Operands::Branch {
                    cond: Some(cond),
                    test_null: false,
                    target,
                },
            ),
            Instr::IfCmp { cond, target } => (
                TemplateTag::IfCmp,
                Operands::Branch {
                    cond: Some(cond),
                    test_null: false,
                    target,
                },
            ),
            Instr::IfRefCmp { cond, target } => (
                TemplateTag::IfRefCmp,
                Operands::Branch {
                    cond: Some(cond),
                    test_null: false,
                    target,
                },
            ),
            Instr::IfNull { test_null, target } => (
                TemplateTag::IfNull,
                Operands::Branch {
                    cond: None,
                    test_null,
                    target,
                },
            ),
            Instr::Goto { target } => (
                TemplateTag::Goto,
                Operands::Branch {
                    cond: None,
                    test_null: false,
                    target,
                },
            ),

            Instr::GetField { idx } => self.field_access(idx, TemplateTag::get_field),
            Instr::PutField { idx } => self.field_access(idx, TemplateTag::put_field),
            Instr::GetStatic { idx } => self.static_access(idx, TemplateTag::get_static),
            Instr::PutStatic { idx } => self.static_access(idx, TemplateTag::put_static),

            Instr::ArrayLoad { kind } => (TemplateTag::array_load(kind), Operands::None),
            Instr::ArrayStore { kind } => (TemplateTag::array_store(kind), Operands::None),
            Instr::ArrayLength => (TemplateTag::ArrayLength, Operands::None),

            Instr::New { idx } => match self.resolved_class(idx) {
                Some(class) if self.vm.heap().class_initialized(class) => {
                    (TemplateTag::NewInit, Operands::ClassRef { class })
                }
                _ => (TemplateTag::New, Operands::Pool { idx }),
            },
            Instr::NewArray { kind } => (TemplateTag::NewArray, Operands::NewArray { kind }),

            Instr::CheckCast { idx } => match self.resolved_class(idx) {
                Some(class) => (TemplateTag::check_cast(true), Operands::ClassRef { class }),
                None => (TemplateTag::check_cast(false), Operands::Pool { idx }),
            },
            Instr::InstanceOf { idx } => match self.resolved_class(idx) {
                Some(class) => (TemplateTag::instance_of(true), Operands::ClassRef { class }),
                None => (TemplateTag::instance_of(false), Operands::Pool { idx }),
            },

            Instr::MonitorEnter => (TemplateTag::MonitorEnter, Operands::None),
            Instr::MonitorExit => (TemplateTag::MonitorExit, Operands::None),
            Instr::Throw => (TemplateTag::Throw, Operands::None),

            Instr::InvokeVirtual { idx } => self.invoke(InvokeKind::Virtual, idx),
            Instr::InvokeInterface { idx } => self.invoke(InvokeKind::Interface, idx),
            Instr::InvokeSpecial { idx } => self.invoke(InvokeKind::Special, idx),
            Instr::InvokeStatic { idx } => self.invoke(InvokeKind::Static, idx),

            Instr::Return { kind } => {
                let unlock = self.fct.is_synchronized;
                let monitor = if unlock {
                    Some(if self.fct.is_static {
                        MonitorTarget::ClassObject(
                            self.fct.holder.expect("synchronized function without holder"),
                        )
                    } else {
                        MonitorTarget::ReceiverLocal(0)
                    })
                } else {
                    None
                };

                (TemplateTag::ret(kind, unlock), Operands::Return { monitor })
            }
        }
    }

    fn field_access(
        &self,
        idx: ConstPoolIdx,
        tag: fn(ValueKind, bool) -> TemplateTag,
    ) -> (TemplateTag, Operands) {
        match self.bytecode.const_pool(idx) {
            ConstPoolEntry::FieldRef { kind, resolved, .. } => match resolved {
                Some(target) => (tag(*kind, true), Operands::FieldFast { target: *target }),
                None => (tag(*kind, false), Operands::Pool { idx }),
            },
            entry => panic!("field access against non-field pool entry {:?}", entry),
        }
    }

    /// Static accesses take the fast tag only when the reference is
    /// resolved and the holder class is already initialized at weave
    /// time; otherwise the slow template initializes on first use.
    fn static_access(
        &self,
        idx: ConstPoolIdx,
        tag: fn(ValueKind, bool) -> TemplateTag,
    ) -> (TemplateTag, Operands) {
        match self.bytecode.const_pool(idx) {
            ConstPoolEntry::FieldRef { kind, resolved, .. } => match resolved {
                Some(target) if self.vm.heap().class_initialized(target.class) => {
                    (tag(*kind, true), Operands::FieldFast { target: *target })
                }
                _ => (tag(*kind, false), Operands::Pool { idx }),
            },
            entry => panic!("field access against non-field pool entry {:?}", entry),
        }
    }

    fn resolved_class(&self, idx: ConstPoolIdx) -> Option<ClassId> {
        match self.bytecode.const_pool(idx) {
            ConstPoolEntry::ClassRef { resolved, .. } => *resolved,
            entry => panic!("class reference against non-class pool entry {:?}", entry),
        }
    }

    /// Invoke binding override: under a non-default table the callee is
    /// always the full method identity, because the advice calls need
    /// to name the callee. Only the uninstrumented fast path of a
    /// resolved virtual/interface dispatch binds the bare vtable index.
    fn invoke(&self, kind: InvokeKind, idx: ConstPoolIdx) -> (TemplateTag, Operands) {
        let (return_kind, resolved) = match self.bytecode.const_pool(idx) {
            ConstPoolEntry::MethodRef {
                return_kind,
                resolved,
                ..
            } => (*return_kind, *resolved),
            entry => panic!("invoke against non-method pool entry {:?}", entry),
        };

        let state = match resolved {
            None => InvokeState::Unresolved,
            Some(_)
                if matches!(kind, InvokeKind::Virtual | InvokeKind::Interface)
                    && self.vm.flags().profile_virtual_calls =>
            {
                InvokeState::Instrumented
            }
            Some(_) => InvokeState::Resolved,
        };

        let instrumented_table = !self.vm.templates().is_default(self.active);
        let callee = match resolved {
            None => Callee::Unresolved(idx),
            Some(target) => {
                if instrumented_table {
                    Callee::Identity(target.function)
                } else {
                    match (kind, target.vtable_index) {
                        (InvokeKind::Virtual | InvokeKind::Interface, Some(vtable_index)) => {
                            Callee::VtableIndex(vtable_index)
                        }
                        _ => Callee::Identity(target.function),
                    }
                }
            }
        };

        (
            TemplateTag::invoke(kind, return_kind, state),
            Operands::Invoke { callee, idx },
        )
    }

    /// Tracks the operand-stack shape the plain template family
    /// produces. Instrumented variants keep their slot transformations
    /// in the same relative positions, so this simulation is valid for
    /// all four tables.
    fn simulate(&mut self, instr: &Instr) {
        match *instr {
            Instr::Nop => {}

            Instr::Const { idx } => {
                let kind = self
                    .bytecode
                    .const_pool(idx)
                    .kind()
                    .expect("constant load from non-value pool entry");
                self.stack.push(kind);
            }

            Instr::Load { kind, .. } => self.stack.push(kind),
            Instr::Store { .. } => {
                self.pop();
            }

            Instr::Pop => {
                self.pop();
            }
            Instr::Pop2 => {
                if self.pop().is_wide() {
                    // One wide value fills both slots.
                } else {
                    self.pop();
                }
            }
            Instr::Dup => {
                let top = *self.stack.last().expect("operand stack underflow");
                self.stack.push(top);
            }
            Instr::DupX1 => {
                let top = self.pop();
                let below = self.pop();
                self.stack.push(top);
                self.stack.push(below);
                self.stack.push(top);
            }
            Instr::Swap => {
                let top = self.pop();
                let below = self.pop();
                self.stack.push(top);
                self.stack.push(below);
            }

            Instr::Add { kind }
            | Instr::Sub { kind }
            | Instr::Mul { kind }
            | Instr::Div { kind } => {
                self.pop();
                self.pop();
                self.stack.push(kind);
            }
            Instr::Neg { .. } => {}
            Instr::Cmp { .. } => {
                self.pop();
                self.pop();
                self.stack.push(ValueKind::Int);
            }

            Instr::If { .. } | Instr::IfNull { .. } => {
                self.pop();
            }
            Instr::IfCmp { .. } | Instr::IfRefCmp { .. } => {
                self.pop();
                self.pop();
            }
            Instr::Goto { .. } => {}

            Instr::GetField { idx } => {
                let kind = self.field_kind(idx);
                self.pop();
                self.stack.push(kind);
            }
            Instr::PutField { .. } => {
                self.pop();
                self.pop();
            }
            Instr::GetStatic { idx } => {
                let kind = self.field_kind(idx);
                self.stack.push(kind);
            }
            Instr::PutStatic { .. } => {
                self.pop();
            }

            Instr::ArrayLoad { kind } => {
                self.pop();
                self.pop();
                self.stack.push(kind);
            }
            Instr::ArrayStore { .. } => {
                self.pop();
                self.pop();
                self.pop();
            }
            Instr::ArrayLength => {
                self.pop();
                self.stack.push(ValueKind::Int);
            }

            Instr::New { .. } => self.stack.push(ValueKind::Ref),
            Instr::NewArray { .. } => {
                self.pop();
                self.stack.push(ValueKind::Ref);
            }

            Instr::CheckCast { .. } => {}
            Instr::InstanceOf { .. } => {
                self.pop();
                self.stack.push(ValueKind::Int);
            }

            Instr::MonitorEnter | Instr::MonitorExit | Instr::Throw => {
                self.pop();
            }

            Instr::InvokeVirtual { idx }
            | Instr::InvokeInterface { idx }
            | Instr::InvokeSpecial { idx } => self.simulate_invoke(idx, true),
            Instr::InvokeStatic { idx } => self.simulate_invoke(idx, false),

            Instr::Return { kind } => {
                if kind.is_some() {
                    self.pop();
                }
            }
        }
    }

    fn simulate_invoke(&mut self, idx: ConstPoolIdx, has_receiver: bool) {
        let (param_count, return_kind) = match self.bytecode.const_pool(idx) {
            ConstPoolEntry::MethodRef {
                params,
                return_kind,
                ..
            } => (params.len(), *return_kind),
            entry => panic!("invoke against non-method pool entry {:?}", entry),
        };

        for _ in 0..param_count {
            self.pop();
        }
        if has_receiver {
            self.pop();
        }
        if let Some(kind) = return_kind {
            self.stack.push(kind);
        }
    }

    fn field_kind(&self, idx: ConstPoolIdx) -> ValueKind {
        match self.bytecode.const_pool(idx) {
            ConstPoolEntry::FieldRef { kind, .. } => *kind,
            entry => panic!("field access against non-field pool entry {:?}", entry),
        }
    }

    fn pop(&mut self) -> ValueKind {
        self.stack
            .pop()
            .expect("operand stack underflow during compilation")
    }
}
