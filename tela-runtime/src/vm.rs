use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use thiserror::Error;

use tela_bytecode::{
    display_fct, BytecodeFunction, ClassId, ConstPoolEntry, ConstPoolIdx, FieldTarget, FunctionId,
    MethodTarget, Program,
};

use crate::advice::{AdviceGate, AdviceHandler};
use crate::compiler::{self, WeaveError};
use crate::heap::{Heap, ObjRef, Value};
use crate::policy::{AdvicePolicy, MethodFilter};
use crate::stack::Frame;
use crate::templates::TemplateStore;
use crate::vm::code::{Code, Effect};

pub mod code;

/// Abnormal termination of template execution. Traps originate in the
/// instruction effects themselves and are propagated unchanged through
/// the weaving core.
#[derive(Clone, PartialEq, Debug, Error)]
pub enum Trap {
    #[error("null pointer dereference")]
    NullPointer,
    #[error("division by zero")]
    DivisionByZero,
    #[error("array index out of bounds")]
    IndexOutOfBounds,
    #[error("cast target is not an instance of the class")]
    ClassCast,
    #[error("negative array size")]
    NegativeArraySize,
    #[error("monitor released without matching acquisition")]
    IllegalMonitorState,
    #[error("field reference did not resolve")]
    UnresolvedField,
    #[error("method reference did not resolve")]
    UnresolvedMethod,
    #[error("class reference did not resolve")]
    UnresolvedClass,
    #[error("uncaught exception")]
    Exception(ObjRef),
    #[error("lazy compilation failed: {0}")]
    CompileFault(Box<WeaveError>),
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Weave(#[from] WeaveError),
    #[error(transparent)]
    Trap(Trap),
}

#[derive(Clone, Debug, Default)]
pub struct VmFlags {
    /// Compile resolved virtual/interface call sites through the
    /// receiver-profiling template variants.
    pub profile_virtual_calls: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CodeId(usize);

pub struct CodeObjects {
    data: RwLock<Vec<Arc<Code>>>,
}

impl CodeObjects {
    pub fn new() -> CodeObjects {
        CodeObjects {
            data: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self, id: CodeId) -> Arc<Code> {
        let data = self.data.read();
        data[id.0].clone()
    }

    pub fn add(&self, object: Arc<Code>) -> CodeId {
        let mut data = self.data.write();
        let code_id = CodeId(data.len());
        data.push(object);
        code_id
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }
}

#[derive(PartialEq, Debug)]
enum CompilationStatus {
    Compiled(CodeId),
    InProgress,
}

/// Deduplicates concurrent compilation requests for one method: the
/// first requester compiles, everyone else blocks until the winner
/// installs the code (or aborts, in which case one waiter retries).
pub struct CompilationDatabase {
    inner: Mutex<HashMap<FunctionId, CompilationStatus>>,
    cv_notify: Condvar,
}

impl CompilationDatabase {
    pub fn new() -> CompilationDatabase {
        CompilationDatabase {
            inner: Mutex::new(HashMap::new()),
            cv_notify: Condvar::new(),
        }
    }

    /// Returns the installed code if it exists, blocking while another
    /// session compiles the same method. Returns `None` when the caller
    /// won the race and is now responsible for compiling.
    pub fn compilation_request(&self, vm: &VM, id: FunctionId) -> Option<Arc<Code>> {
        let mut inner = self.inner.lock();

        loop {
            if let Some(status) = inner.get(&id) {
                match status {
                    CompilationStatus::Compiled(code_id) => {
                        return Some(vm.code_objects.get(*code_id));
                    }

                    CompilationStatus::InProgress => {
                        self.cv_notify.wait(&mut inner);
                    }
                }
            } else {
                inner.insert(id, CompilationStatus::InProgress);
                return None;
            }
        }
    }

    pub fn finish_compilation(&self, id: FunctionId, code_id: CodeId) {
        let mut inner = self.inner.lock();

        let old_value = inner.insert(id, CompilationStatus::Compiled(code_id));
        assert_eq!(old_value, Some(CompilationStatus::InProgress));

        self.cv_notify.notify_all();
    }

    pub fn abort_compilation(&self, id: FunctionId) {
        let mut inner = self.inner.lock();

        let old_value = inner.remove(&id);
        assert_eq!(old_value, Some(CompilationStatus::InProgress));

        self.cv_notify.notify_all();
    }
}

pub struct VM {
    program: Program,
    templates: TemplateStore,
    policy: RwLock<AdvicePolicy>,
    method_filter: MethodFilter,
    gate: AdviceGate,
    advice: Box<dyn AdviceHandler>,
    pub compilation_database: CompilationDatabase,
    pub code_objects: CodeObjects,
    heap: Heap,
    flags: VmFlags,
}

impl VM {
    pub fn new(program: Program, flags: VmFlags, advice: Box<dyn AdviceHandler>) -> VM {
        let heap = Heap::new(&program);

        VM {
            program,
            templates: TemplateStore::build(),
            policy: RwLock::new(AdvicePolicy::none()),
            method_filter: MethodFilter::all(),
            gate: AdviceGate::new(),
            advice,
            compilation_database: CompilationDatabase::new(),
            code_objects: CodeObjects::new(),
            heap,
            flags,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    #[cfg(test)]
    pub fn templates_mut(&mut self) -> &mut TemplateStore {
        &mut self.templates
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn gate(&self) -> &AdviceGate {
        &self.gate
    }

    pub fn advice(&self) -> &dyn AdviceHandler {
        &*self.advice
    }

    pub fn flags(&self) -> &VmFlags {
        &self.flags
    }

    pub fn method_filter(&self) -> &MethodFilter {
        &self.method_filter
    }

    /// Must be configured before any compilation request for a method
    /// the filter should cover.
    pub fn set_method_filter(&mut self, filter: MethodFilter) {
        self.method_filter = filter;
    }

    /// Installs a new per-opcode policy. The write lock excludes every
    /// in-flight compilation, so a session never observes a mid-method
    /// policy change.
    pub fn set_policy(&self, policy: AdvicePolicy) {
        policy.log_settings();
        *self.policy.write() = policy;
    }

    pub fn policy(&self) -> RwLockReadGuard<'_, AdvicePolicy> {
        self.policy.read()
    }

    pub fn ensure_compiled(&self, fct_id: FunctionId) -> Result<Arc<Code>, WeaveError> {
        compiler::compile_fct(self, fct_id)
    }

    /// Compiles the function on demand and interprets its emitted
    /// template sequence.
    pub fn run(&self, fct_id: FunctionId, args: Vec<Value>) -> Result<Option<Value>, VmError> {
        let code = self.ensure_compiled(fct_id)?;

        self.execute(&code, args).map_err(|trap| match trap {
            Trap::CompileFault(err) => VmError::Weave(*err),
            trap => VmError::Trap(trap),
        })
    }

    /// Entry point for invoke templates: compiles the callee if needed
    /// and runs it in a fresh activation.
    pub fn call_function(
        &self,
        fct_id: FunctionId,
        args: Vec<Value>,
    ) -> Result<Option<Value>, Trap> {
        let code = self
            .ensure_compiled(fct_id)
            .map_err(|err| Trap::CompileFault(Box::new(err)))?;

        self.execute(&code, args)
    }

    fn execute(&self, code: &Code, args: Vec<Value>) -> Result<Option<Value>, Trap> {
        let fct = self.program.fct(code.fct());
        let bytecode = fct
            .bytecode
            .as_ref()
            .expect("compiled function without bytecode");

        let mut frame = Frame::new(bytecode.num_locals());
        let mut slot = 0;
        for value in args {
            let slots = value.kind().slots();
            frame.set_local(slot, value);
            slot += slots;
        }
        debug_assert_eq!(slot, fct.param_slots());

        // The matching release happens in the Return*Unlock templates.
        if fct.is_synchronized {
            let monitor = if fct.is_static {
                self.heap
                    .class_mirror(fct.holder.expect("synchronized function without holder"))
            } else {
                frame.local(0).as_ref().ok_or(Trap::NullPointer)?
            };
            self.heap.monitor_enter(monitor);
        }

        let mut ctx = ExecContext {
            vm: self,
            frame: &mut frame,
            bytecode,
        };

        if let Some(entry) = code.entry() {
            match entry.template.run(&mut ctx, &entry.operands)? {
                Effect::Next => {}
                effect => panic!("method-entry template produced {:?}", effect),
            }
        }

        let mut index = 0;
        loop {
            let instr = match code.instrs().get(index) {
                Some(instr) => instr,
                None => panic!(
                    "control fell off the end of {}",
                    display_fct(&self.program, code.fct())
                ),
            };

            match instr.template.run(&mut ctx, &instr.operands)? {
                Effect::Next => index += 1,
                Effect::Branch(target) => {
                    index = code
                        .index_of(target)
                        .expect("branch to offset without instruction");
                }
                Effect::Return(value) => return Ok(value),
            }
        }
    }

    pub fn allocate_instance(&self, class: ClassId) -> ObjRef {
        self.heap.allocate_instance(&self.program, class)
    }

    /// The dialect has no subtyping, so instance-of is class identity.
    /// Arrays belong to no class.
    pub fn instance_of(&self, obj: ObjRef, class: ClassId) -> bool {
        self.heap.object_class(obj) == Some(class)
    }

    pub fn dispatch_vtable(&self, obj: ObjRef, vtable_index: u32) -> Result<FunctionId, Trap> {
        let class = self.heap.object_class(obj).ok_or(Trap::UnresolvedMethod)?;
        self.program
            .class(class)
            .vtable
            .get(vtable_index as usize)
            .copied()
            .ok_or(Trap::UnresolvedMethod)
    }

    /// There are no class initializers in the dialect; initialization
    /// just flips the flag the `Init`-tag templates rely on.
    pub fn ensure_class_initialized(&self, class: ClassId) {
        if !self.heap.class_initialized(class) {
            self.heap.initialize_class(class);
        }
    }
}

/// Everything a template body sees while it runs: the VM, the current
/// activation and the const pool of the executing function.
pub struct ExecContext<'a> {
    pub vm: &'a VM,
    pub frame: &'a mut Frame,
    bytecode: &'a BytecodeFunction,
}

impl<'a> ExecContext<'a> {
    #[inline]
    pub fn advising(&self) -> bool {
        self.vm.gate.is_active()
    }

    pub fn const_value(&self, idx: ConstPoolIdx) -> Value {
        match self.bytecode.const_pool(idx) {
            ConstPoolEntry::Int32(value) => Value::Int(*value),
            ConstPoolEntry::Int64(value) => Value::Long(*value),
            ConstPoolEntry::Float32(value) => Value::Float(*value),
            ConstPoolEntry::Float64(value) => Value::Double(*value),
            ConstPoolEntry::Null => Value::Ref(None),
            entry => panic!("constant load from non-value pool entry {:?}", entry),
        }
    }

    pub fn method_param_count(&self, idx: ConstPoolIdx) -> usize {
        match self.bytecode.const_pool(idx) {
            ConstPoolEntry::MethodRef { params, .. } => params.len(),
            entry => panic!("invoke against non-method pool entry {:?}", entry),
        }
    }

    pub fn resolve_field_ref(&self, idx: ConstPoolIdx) -> Result<FieldTarget, Trap> {
        match self.bytecode.const_pool(idx) {
            ConstPoolEntry::FieldRef {
                class,
                name,
                resolved,
                ..
            } => {
                if let Some(target) = resolved {
                    return Ok(*target);
                }

                let class = *class;
                if let Some(index) = self.vm.program.field_index(class, name, false) {
                    Ok(FieldTarget {
                        class,
                        index,
                        is_static: false,
                    })
                } else if let Some(index) = self.vm.program.field_index(class, name, true) {
                    Ok(FieldTarget {
                        class,
                        index,
                        is_static: true,
                    })
                } else {
                    Err(Trap::UnresolvedField)
                }
            }
            entry => panic!("field access against non-field pool entry {:?}", entry),
        }
    }

    pub fn resolve_method_ref(&self, idx: ConstPoolIdx) -> Result<MethodTarget, Trap> {
        match self.bytecode.const_pool(idx) {
            ConstPoolEntry::MethodRef {
                class,
                name,
                resolved,
                ..
            } => {
                if let Some(target) = resolved {
                    return Ok(*target);
                }

                let function = self
                    .vm
                    .program
                    .method_by_name(*class, name)
                    .ok_or(Trap::UnresolvedMethod)?;

                Ok(MethodTarget {
                    function,
                    vtable_index: self.vm.program.fct(function).vtable_index,
                })
            }
            entry => panic!("invoke against non-method pool entry {:?}", entry),
        }
    }

    pub fn resolve_class_ref(&self, idx: ConstPoolIdx) -> Result<ClassId, Trap> {
        match self.bytecode.const_pool(idx) {
            ConstPoolEntry::ClassRef { name, resolved } => {
                if let Some(class) = resolved {
                    return Ok(*class);
                }

                self.vm
                    .program
                    .class_by_name(name)
                    .ok_or(Trap::UnresolvedClass)
            }
            entry => panic!("class reference against non-class pool entry {:?}", entry),
        }
    }
}
