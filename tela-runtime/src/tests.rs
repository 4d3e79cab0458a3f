use std::sync::Arc;

use parking_lot::Mutex;

use tela_bytecode::{
    display_field, BytecodeOffset, BytecodeWriter, ClassData, ClassId, ConstPoolEntry, FieldData,
    FieldTarget, FunctionData, FunctionId, IfCond, InvokeKind, MethodTarget, Opcode, Program,
    ProgramBuilder, ValueKind,
};

use crate::advice::{AdviceHandler, ArithOp, NullAdviceHandler, StackOp};
use crate::compiler::WeaveError;
use crate::heap::Value;
use crate::policy::{AdviceModes, AdvicePolicy, MethodFilter, PolicyError};
use crate::templates::{TemplateStore, TemplateTag};
use crate::vm::code::{Callee, Operands};
use crate::vm::{Trap, VmError, VmFlags, VM};

#[derive(Clone, PartialEq, Debug)]
enum Event {
    ConstLoad(Value),
    Load(ValueKind, u32),
    Store(ValueKind, u32, Value),
    StackAdjust(StackOp),
    Operation(ArithOp, ValueKind, Vec<Value>),
    Branch(BytecodeOffset),
    FieldRead(Value, FieldTarget),
    FieldWrite(Value, FieldTarget, Value),
    StaticRead(FieldTarget),
    StaticWrite(FieldTarget, Value),
    ArrayRead(Value, i32),
    ArrayWrite(Value, i32, Value),
    ArrayLength(Value),
    ObjectCreated(Value),
    ArrayCreated(Value),
    BeforeInvoke(InvokeKind, Option<Value>, FunctionId),
    AfterInvoke(InvokeKind, Option<Value>, FunctionId, Option<Value>),
    MethodReturn(Option<Value>),
    MonitorEnter(Value),
    MonitorExit(Value),
    CheckCast(Value, ClassId),
    InstanceOf(Value, ClassId),
    Thrown(Value),
    MethodEntry(FunctionId, Option<Value>),
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

struct Recorder {
    log: Arc<EventLog>,
}

impl AdviceHandler for Recorder {
    fn const_load(&self, value: Value) {
        self.log.push(Event::ConstLoad(value));
    }

    fn load(&self, kind: ValueKind, index: u32) {
        self.log.push(Event::Load(kind, index));
    }

    fn store(&self, kind: ValueKind, index: u32, value: Value) {
        self.log.push(Event::Store(kind, index, value));
    }

    fn stack_adjust(&self, op: StackOp) {
        self.log.push(Event::StackAdjust(op));
    }

    fn operation(&self, op: ArithOp, kind: ValueKind, inputs: &[Value]) {
        self.log.push(Event::Operation(op, kind, inputs.to_vec()));
    }

    fn branch(&self, _inputs: &[Value], target: BytecodeOffset) {
        self.log.push(Event::Branch(target));
    }

    fn field_read(&self, object: Value, field: FieldTarget) {
        self.log.push(Event::FieldRead(object, field));
    }

    fn field_write(&self, object: Value, field: FieldTarget, value: Value) {
        self.log.push(Event::FieldWrite(object, field, value));
    }

    fn static_read(&self, field: FieldTarget) {
        self.log.push(Event::StaticRead(field));
    }

    fn static_write(&self, field: FieldTarget, value: Value) {
        self.log.push(Event::StaticWrite(field, value));
    }

    fn array_read(&self, array: Value, index: i32) {
        self.log.push(Event::ArrayRead(array, index));
    }

    fn array_write(&self, array: Value, index: i32, value: Value) {
        self.log.push(Event::ArrayWrite(array, index, value));
    }

    fn array_length(&self, array: Value) {
        self.log.push(Event::ArrayLength(array));
    }

    fn object_created(&self, object: Value) {
        self.log.push(Event::ObjectCreated(object));
    }

    fn array_created(&self, array: Value) {
        self.log.push(Event::ArrayCreated(array));
    }

    fn before_invoke(&self, kind: InvokeKind, receiver: Option<Value>, method: FunctionId) {
        self.log.push(Event::BeforeInvoke(kind, receiver, method));
    }

    fn after_invoke(
        &self,
        kind: InvokeKind,
        receiver: Option<Value>,
        method: FunctionId,
        result: Option<Value>,
    ) {
        self.log.push(Event::AfterInvoke(kind, receiver, method, result));
    }

    fn method_return(&self, value: Option<Value>) {
        self.log.push(Event::MethodReturn(value));
    }

    fn monitor_enter(&self, object: Value) {
        self.log.push(Event::MonitorEnter(object));
    }

    fn monitor_exit(&self, object: Value) {
        self.log.push(Event::MonitorExit(object));
    }

    fn check_cast(&self, object: Value, class: ClassId) {
        self.log.push(Event::CheckCast(object, class));
    }

    fn instance_of(&self, object: Value, class: ClassId) {
        self.log.push(Event::InstanceOf(object, class));
    }

    fn thrown(&self, object: Value) {
        self.log.push(Event::Thrown(object));
    }

    fn method_entry(&self, method: FunctionId, receiver: Option<Value>) {
        self.log.push(Event::MethodEntry(method, receiver));
    }
}

fn recording_vm(program: Program) -> (VM, Arc<EventLog>) {
    let log = Arc::new(EventLog::default());
    let vm = VM::new(
        program,
        VmFlags::default(),
        Box::new(Recorder { log: log.clone() }),
    );
    (vm, log)
}

fn uniform_policy(modes: AdviceModes) -> AdvicePolicy {
    let mut policy = AdvicePolicy::none();
    for opcode in Opcode::VARIANTS {
        policy.set(opcode, modes);
    }
    policy
}

fn spec_policy(spec: &str) -> AdvicePolicy {
    let mut policy = AdvicePolicy::none();
    policy.apply_spec(spec, true).expect("bad policy spec");
    policy
}

fn instance_method(
    name: &str,
    holder: ClassId,
    params: Vec<ValueKind>,
    return_kind: Option<ValueKind>,
    vtable_index: u32,
) -> FunctionData {
    FunctionData {
        name: name.into(),
        holder: Some(holder),
        params,
        return_kind,
        is_static: false,
        is_synchronized: false,
        vtable_index: Some(vtable_index),
        bytecode: None,
    }
}

fn static_function(name: &str, return_kind: Option<ValueKind>) -> FunctionData {
    FunctionData {
        name: name.into(),
        holder: None,
        params: Vec::new(),
        return_kind,
        is_static: true,
        is_synchronized: false,
        vtable_index: None,
        bytecode: None,
    }
}

fn x_field(point: ClassId, resolved: bool) -> ConstPoolEntry {
    ConstPoolEntry::FieldRef {
        class: point,
        name: "x".into(),
        kind: ValueKind::Int,
        resolved: resolved.then(|| FieldTarget {
            class: point,
            index: 0,
            is_static: false,
        }),
    }
}

fn x_target(point: ClassId) -> FieldTarget {
    FieldTarget {
        class: point,
        index: 0,
        is_static: false,
    }
}

struct PointFixture {
    program: Program,
    point: ClassId,
    get_x: FunctionId,
    main: FunctionId,
    sync_main: FunctionId,
    unresolved_main: FunctionId,
    cast_main: FunctionId,
}

/// A class with a virtual getter and a synchronized virtual setter,
/// plus a family of driver functions compiled against resolved or
/// unresolved const-pool entries.
fn build_point_program() -> PointFixture {
    let mut builder = ProgramBuilder::new();

    let point = builder.add_class(ClassData {
        name: "Point".into(),
        fields: vec![
            FieldData {
                name: "x".into(),
                kind: ValueKind::Int,
            },
            FieldData {
                name: "y".into(),
                kind: ValueKind::Int,
            },
        ],
        static_fields: Vec::new(),
        vtable: Vec::new(),
    });

    let get_x = builder.add_function(instance_method(
        "get_x",
        point,
        Vec::new(),
        Some(ValueKind::Int),
        0,
    ));

    let mut sync_set_data =
        instance_method("sync_set", point, vec![ValueKind::Int], None, 1);
    sync_set_data.is_synchronized = true;
    let sync_set = builder.add_function(sync_set_data);

    let main = builder.add_function(static_function("main", Some(ValueKind::Int)));
    let sync_main = builder.add_function(static_function("sync_main", Some(ValueKind::Int)));
    let unresolved_main =
        builder.add_function(static_function("unresolved_main", Some(ValueKind::Int)));
    let cast_main = builder.add_function(static_function("cast_main", Some(ValueKind::Int)));

    builder.set_vtable(point, vec![get_x, sync_set]);

    // fn get_x(self) -> Int { self.x }
    let mut w = BytecodeWriter::new();
    w.set_num_locals(1);
    let field = w.add_const(x_field(point, true));
    w.emit_load(ValueKind::Ref, 0);
    w.emit_get_field(field);
    w.emit_ret(ValueKind::Int);
    builder.set_bytecode(get_x, w.generate());

    // synchronized fn sync_set(self, value: Int) { self.x = value }
    let mut w = BytecodeWriter::new();
    w.set_num_locals(2);
    let field = w.add_const(x_field(point, true));
    w.emit_load(ValueKind::Ref, 0);
    w.emit_load(ValueKind::Int, 1);
    w.emit_put_field(field);
    w.emit_ret_void();
    builder.set_bytecode(sync_set, w.generate());

    // fn main() -> Int { let p = Point(); p.x = 7; p.get_x() }
    let mut w = BytecodeWriter::new();
    w.set_num_locals(1);
    let cls = w.add_const(ConstPoolEntry::ClassRef {
        name: "Point".into(),
        resolved: Some(point),
    });
    let field = w.add_const(x_field(point, true));
    let callee = w.add_const(ConstPoolEntry::MethodRef {
        class: point,
        name: "get_x".into(),
        params: Vec::new(),
        return_kind: Some(ValueKind::Int),
        resolved: Some(MethodTarget {
            function: get_x,
            vtable_index: Some(0),
        }),
    });
    w.emit_new(cls);
    w.emit_store(ValueKind::Ref, 0);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_const_int32(7);
    w.emit_put_field(field);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_invoke_virtual(callee);
    w.emit_ret(ValueKind::Int);
    builder.set_bytecode(main, w.generate());

    // fn sync_main() -> Int { let p = Point(); p.sync_set(9); p.x }
    let mut w = BytecodeWriter::new();
    w.set_num_locals(1);
    let cls = w.add_const(ConstPoolEntry::ClassRef {
        name: "Point".into(),
        resolved: Some(point),
    });
    let field = w.add_const(x_field(point, true));
    let callee = w.add_const(ConstPoolEntry::MethodRef {
        class: point,
        name: "sync_set".into(),
        params: vec![ValueKind::Int],
        return_kind: None,
        resolved: Some(MethodTarget {
            function: sync_set,
            vtable_index: Some(1),
        }),
    });
    w.emit_new(cls);
    w.emit_store(ValueKind::Ref, 0);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_const_int32(9);
    w.emit_invoke_virtual(callee);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_get_field(field);
    w.emit_ret(ValueKind::Int);
    builder.set_bytecode(sync_main, w.generate());

    // Same shape as main, but every const-pool reference unresolved so
    // the slow templates resolve by name at execution time.
    let mut w = BytecodeWriter::new();
    w.set_num_locals(1);
    let cls = w.add_const(ConstPoolEntry::ClassRef {
        name: "Point".into(),
        resolved: None,
    });
    let field = w.add_const(x_field(point, false));
    let callee = w.add_const(ConstPoolEntry::MethodRef {
        class: point,
        name: "get_x".into(),
        params: Vec::new(),
        return_kind: Some(ValueKind::Int),
        resolved: None,
    });
    w.emit_new(cls);
    w.emit_store(ValueKind::Ref, 0);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_const_int32(7);
    w.emit_put_field(field);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_invoke_virtual(callee);
    w.emit_ret(ValueKind::Int);
    builder.set_bytecode(unresolved_main, w.generate());

    // fn cast_main() -> Int { let p = Point(); p as Point; p is Point }
    let mut w = BytecodeWriter::new();
    w.set_num_locals(1);
    let cls = w.add_const(ConstPoolEntry::ClassRef {
        name: "Point".into(),
        resolved: Some(point),
    });
    w.emit_new(cls);
    w.emit_store(ValueKind::Ref, 0);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_check_cast(cls);
    w.emit_pop();
    w.emit_load(ValueKind::Ref, 0);
    w.emit_instance_of(cls);
    w.emit_ret(ValueKind::Int);
    builder.set_bytecode(cast_main, w.generate());

    PointFixture {
        program: builder.generate(),
        point,
        get_x,
        main,
        sync_main,
        unresolved_main,
        cast_main,
    }
}

/// A branchy arithmetic function touching wide and narrow kinds, used
/// for the stack-shape comparisons. Returns 14.
fn build_calc_program() -> (Program, FunctionId) {
    let mut builder = ProgramBuilder::new();
    let calc = builder.add_function(static_function("calc", Some(ValueKind::Int)));

    let mut w = BytecodeWriter::new();
    w.set_num_locals(1);
    w.emit_const_int64(5);
    w.emit_const_int64(6);
    w.emit_add(ValueKind::Long);
    w.emit_pop2();
    w.emit_const_int32(10);
    w.emit_const_int32(3);
    w.emit_sub(ValueKind::Int);
    w.emit_store(ValueKind::Int, 0);
    w.emit_load(ValueKind::Int, 0);
    w.emit_const_int32(0);
    let taken = w.create_label();
    w.emit_if_cmp(IfCond::Gt, taken);
    w.emit_const_int32(-1);
    w.emit_ret(ValueKind::Int);
    w.bind_label(taken);
    w.emit_load(ValueKind::Int, 0);
    w.emit_dup();
    w.emit_add(ValueKind::Int);
    w.emit_ret(ValueKind::Int);
    builder.set_bytecode(calc, w.generate());

    (builder.generate(), calc)
}

/// Allocates an int array, writes and reads one element and adds the
/// length. Returns 45.
fn build_array_program() -> (Program, FunctionId) {
    let mut builder = ProgramBuilder::new();
    let main = builder.add_function(static_function("arr_main", Some(ValueKind::Int)));

    let mut w = BytecodeWriter::new();
    w.set_num_locals(1);
    w.emit_const_int32(3);
    w.emit_new_array(ValueKind::Int);
    w.emit_store(ValueKind::Ref, 0);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_const_int32(1);
    w.emit_const_int32(42);
    w.emit_array_store(ValueKind::Int);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_const_int32(1);
    w.emit_array_load(ValueKind::Int);
    w.emit_load(ValueKind::Ref, 0);
    w.emit_array_length();
    w.emit_add(ValueKind::Int);
    w.emit_ret(ValueKind::Int);
    builder.set_bytecode(main, w.generate());

    (builder.generate(), main)
}

/// A static synchronized counter bumped twice through invoke-static.
fn build_counter_program() -> (Program, ClassId, FunctionId) {
    let mut builder = ProgramBuilder::new();

    let counter = builder.add_class(ClassData {
        name: "Counter".into(),
        fields: Vec::new(),
        static_fields: vec![FieldData {
            name: "count".into(),
            kind: ValueKind::Int,
        }],
        vtable: Vec::new(),
    });

    let bump = builder.add_function(FunctionData {
        name: "bump".into(),
        holder: Some(counter),
        params: Vec::new(),
        return_kind: None,
        is_static: true,
        is_synchronized: true,
        vtable_index: None,
        bytecode: None,
    });

    let main = builder.add_function(static_function("counter_main", None));

    let count_ref = || ConstPoolEntry::FieldRef {
        class: counter,
        name: "count".into(),
        kind: ValueKind::Int,
        resolved: Some(FieldTarget {
            class: counter,
            index: 0,
            is_static: true,
        }),
    };

    // synchronized static fn bump() { Counter::count = Counter::count + 1 }
    let mut w = BytecodeWriter::new();
    w.set_num_locals(0);
    let read = w.add_const(count_ref());
    let write = w.add_const(count_ref());
    w.emit_get_static(read);
    w.emit_const_int32(1);
    w.emit_add(ValueKind::Int);
    w.emit_put_static(write);
    w.emit_ret_void();
    builder.set_bytecode(bump, w.generate());

    let mut w = BytecodeWriter::new();
    w.set_num_locals(0);
    let callee = w.add_const(ConstPoolEntry::MethodRef {
        class: counter,
        name: "bump".into(),
        params: Vec::new(),
        return_kind: None,
        resolved: Some(MethodTarget {
            function: bump,
            vtable_index: None,
        }),
    });
    w.emit_invoke_static(callee);
    w.emit_invoke_static(callee);
    w.emit_ret_void();
    builder.set_bytecode(main, w.generate());

    (builder.generate(), counter, main)
}

#[test]
fn selector_truth_table() {
    let store = TemplateStore::build();

    assert!(std::ptr::eq(store.select(AdviceModes::NONE), &store.plain));
    assert!(std::ptr::eq(
        store.select(AdviceModes::BEFORE),
        &store.before_only
    ));
    assert!(std::ptr::eq(
        store.select(AdviceModes::AFTER),
        &store.after_only
    ));
    assert!(std::ptr::eq(
        store.select(AdviceModes::BOTH),
        &store.before_and_after
    ));

    assert!(store.is_default(store.select(AdviceModes::NONE)));
    assert!(!store.is_default(store.select(AdviceModes::BEFORE)));
}

#[test]
fn every_tag_present_in_all_variant_tables() {
    let store = TemplateStore::build();

    for tag in TemplateTag::all() {
        assert!(store.plain.get(tag).is_some(), "{:?} missing in plain", tag);
        assert!(
            store.before_only.get(tag).is_some(),
            "{:?} missing in before_only",
            tag
        );
        assert!(
            store.after_only.get(tag).is_some(),
            "{:?} missing in after_only",
            tag
        );
        assert!(
            store.before_and_after.get(tag).is_some(),
            "{:?} missing in before_and_after",
            tag
        );
    }
}

#[test]
fn incapable_slots_alias_the_plain_template() {
    let store = TemplateStore::build();

    // Field reads carry only before-advice.
    let tag = TemplateTag::GetFieldResolvedInt;
    assert!(store.before_capable(tag));
    assert!(!store.after_capable(tag));
    assert!(Arc::ptr_eq(
        store.after_only.get(tag).unwrap(),
        store.plain.get(tag).unwrap()
    ));
    assert!(!Arc::ptr_eq(
        store.before_only.get(tag).unwrap(),
        store.plain.get(tag).unwrap()
    ));
    assert_eq!(
        store.before_and_after.get(tag).unwrap().hooks(),
        AdviceModes::BEFORE
    );

    // Method entry carries only after-advice.
    let entry = TemplateTag::MethodEntry;
    assert!(Arc::ptr_eq(
        store.before_only.get(entry).unwrap(),
        store.plain.get(entry).unwrap()
    ));
    assert_eq!(store.after_only.get(entry).unwrap().hooks(), AdviceModes::AFTER);

    // Invokes carry both.
    let invoke = TemplateTag::InvokeStaticResolvedInt;
    assert_eq!(
        store.before_and_after.get(invoke).unwrap().hooks(),
        AdviceModes::BOTH
    );
    assert_eq!(store.plain.get(invoke).unwrap().hooks(), AdviceModes::NONE);
    assert_eq!(store.plain.get(invoke).unwrap().tag(), invoke);
}

#[test]
fn stack_shapes_identical_across_variants() {
    let mut all_shapes = Vec::new();

    for modes in [
        AdviceModes::NONE,
        AdviceModes::BEFORE,
        AdviceModes::AFTER,
        AdviceModes::BOTH,
    ] {
        let (program, calc) = build_calc_program();
        let (vm, _log) = recording_vm(program);
        vm.set_policy(uniform_policy(modes));

        let code = vm.ensure_compiled(calc).unwrap();
        all_shapes.push(code.shapes().to_vec());

        // With the gate inactive every variant behaves like plain.
        assert_eq!(vm.run(calc, Vec::new()).unwrap(), Some(Value::Int(14)));
    }

    assert_eq!(all_shapes[0][0], (BytecodeOffset(0), Vec::new()));
    for shapes in &all_shapes[1..] {
        assert_eq!(&all_shapes[0], shapes);
    }
}

#[test]
fn resolved_pool_entries_select_fast_tags() {
    let fixture = build_point_program();
    let (vm, _log) = recording_vm(fixture.program);
    vm.ensure_class_initialized(fixture.point);

    let code = vm.ensure_compiled(fixture.main).unwrap();
    let tags: Vec<_> = code.instrs().iter().map(|i| i.template.tag()).collect();

    assert_eq!(
        tags,
        vec![
            TemplateTag::NewInit,
            TemplateTag::StoreRef,
            TemplateTag::LoadRef,
            TemplateTag::ConstInt,
            TemplateTag::PutFieldResolvedInt,
            TemplateTag::LoadRef,
            TemplateTag::InvokeVirtualResolvedInt,
            TemplateTag::ReturnInt,
        ]
    );
    assert!(code.entry().is_none());
    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));
    assert_eq!(display_field(vm.program(), fixture.point, 0, false), "Point.x");
}

#[test]
fn unresolved_pool_entries_select_slow_tags() {
    let fixture = build_point_program();
    let (vm, _log) = recording_vm(fixture.program);

    let code = vm.ensure_compiled(fixture.unresolved_main).unwrap();
    let tags: Vec<_> = code.instrs().iter().map(|i| i.template.tag()).collect();

    assert_eq!(
        tags,
        vec![
            TemplateTag::New,
            TemplateTag::StoreRef,
            TemplateTag::LoadRef,
            TemplateTag::ConstInt,
            TemplateTag::PutFieldInt,
            TemplateTag::LoadRef,
            TemplateTag::InvokeVirtualInt,
            TemplateTag::ReturnInt,
        ]
    );

    // The slow templates resolve by name at execution time.
    assert_eq!(
        vm.run(fixture.unresolved_main, Vec::new()).unwrap(),
        Some(Value::Int(7))
    );
}

#[test]
fn inactive_gate_suppresses_all_advice() {
    let fixture = build_point_program();
    let (vm, log) = recording_vm(fixture.program);
    vm.set_policy(AdvicePolicy::all());

    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));
    assert!(log.take().is_empty());

    // The same compiled code starts reporting once the gate flips.
    vm.gate().start();
    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));
    assert!(!log.take().is_empty());

    vm.gate().stop();
    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));
    assert!(log.take().is_empty());
}

#[test]
fn field_write_advice_sees_value_before_it_is_readable() {
    let fixture = build_point_program();
    let (vm, log) = recording_vm(fixture.program);
    vm.set_policy(spec_policy("New:A,PutField:B,GetField:B"));
    vm.gate().start();

    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));

    let events = log.take();
    let object = match events[0] {
        Event::ObjectCreated(object) => object,
        ref event => panic!("expected allocation first, found {:?}", event),
    };

    assert_eq!(
        events,
        vec![
            Event::ObjectCreated(object),
            Event::FieldWrite(object, x_target(fixture.point), Value::Int(7)),
            Event::FieldRead(object, x_target(fixture.point)),
        ]
    );
}

#[test]
fn invoke_binding_depends_on_selected_table() {
    let find_callee = |vm: &VM, fct: FunctionId| {
        let code = vm.ensure_compiled(fct).unwrap();
        code.instrs()
            .iter()
            .find_map(|i| match i.operands {
                Operands::Invoke { callee, .. } => Some(callee),
                _ => None,
            })
            .expect("no invoke emitted")
    };

    // Default table: resolved virtual dispatch binds the vtable index.
    let fixture = build_point_program();
    let (vm, _log) = recording_vm(fixture.program);
    assert_eq!(find_callee(&vm, fixture.main), Callee::VtableIndex(0));

    // Instrumented table: the full method identity.
    let fixture = build_point_program();
    let (vm, _log) = recording_vm(fixture.program);
    vm.set_policy(AdvicePolicy::from_std_configs("invoke").unwrap());
    assert_eq!(
        find_callee(&vm, fixture.main),
        Callee::Identity(fixture.get_x)
    );
}

#[test]
fn invoke_advice_brackets_the_call() {
    let fixture = build_point_program();
    let (vm, log) = recording_vm(fixture.program);
    vm.set_policy(spec_policy("New:A,InvokeVirtual:AB"));
    vm.gate().start();

    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));

    let events = log.take();
    let object = match events[0] {
        Event::ObjectCreated(object) => object,
        ref event => panic!("expected allocation first, found {:?}", event),
    };

    assert_eq!(
        events,
        vec![
            Event::ObjectCreated(object),
            Event::BeforeInvoke(InvokeKind::Virtual, Some(object), fixture.get_x),
            Event::AfterInvoke(
                InvokeKind::Virtual,
                Some(object),
                fixture.get_x,
                Some(Value::Int(7))
            ),
        ]
    );
}

#[test]
fn profiled_virtual_dispatch_selects_instrumented_tag() {
    let fixture = build_point_program();
    let log = Arc::new(EventLog::default());
    let vm = VM::new(
        fixture.program,
        VmFlags {
            profile_virtual_calls: true,
        },
        Box::new(Recorder { log }),
    );

    let code = vm.ensure_compiled(fixture.main).unwrap();
    let tags: Vec<_> = code.instrs().iter().map(|i| i.template.tag()).collect();
    assert!(tags.contains(&TemplateTag::InvokeVirtualInstrumentedInt));

    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));
}

#[test]
fn entry_trace_fires_once_per_activation() {
    let fixture = build_point_program();
    let (vm, log) = recording_vm(fixture.program);
    vm.set_policy(AdvicePolicy::from_std_configs("entry").unwrap());
    vm.gate().start();

    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));

    let events = log.take();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], Event::MethodEntry(fixture.main, None));
    assert!(matches!(
        events[1],
        Event::MethodEntry(method, Some(Value::Ref(Some(_)))) if method == fixture.get_x
    ));

    let code = vm.ensure_compiled(fixture.main).unwrap();
    assert_eq!(
        code.entry().unwrap().operands,
        Operands::Entry {
            method: fixture.main,
            receiver_local: None,
        }
    );
}

#[test]
fn method_filter_compiles_rejected_methods_plain() {
    let fixture = build_point_program();
    let log = Arc::new(EventLog::default());
    let mut vm = VM::new(
        fixture.program,
        VmFlags::default(),
        Box::new(Recorder { log: log.clone() }),
    );
    vm.set_method_filter(MethodFilter::new(Vec::new(), vec!["main".into()]));
    vm.set_policy(AdvicePolicy::from_std_configs("entry").unwrap());
    vm.gate().start();

    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));

    // Only the callee is instrumented; main itself compiled plain.
    let events = log.take();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Event::MethodEntry(method, _) if method == fixture.get_x));
    assert!(vm.ensure_compiled(fixture.main).unwrap().entry().is_none());
}

#[test]
fn method_filter_patterns() {
    let filter = MethodFilter::new(vec!["Point::*".into()], vec!["Point::sync_set".into()]);
    assert!(filter.instrument("Point::get_x"));
    assert!(!filter.instrument("Point::sync_set"));
    assert!(!filter.instrument("main"));

    assert!(MethodFilter::all().instrument("anything"));
}

#[test]
fn synchronized_return_unlocks_before_return_advice() {
    let fixture = build_point_program();
    let (vm, log) = recording_vm(fixture.program);
    vm.set_policy(spec_policy("New:A,PutField:B,GetField:B,Return:B"));
    vm.gate().start();

    assert_eq!(
        vm.run(fixture.sync_main, Vec::new()).unwrap(),
        Some(Value::Int(9))
    );

    let events = log.take();
    let object = match events[0] {
        Event::ObjectCreated(object) => object,
        ref event => panic!("expected allocation first, found {:?}", event),
    };

    assert_eq!(
        events,
        vec![
            Event::ObjectCreated(object),
            Event::FieldWrite(object, x_target(fixture.point), Value::Int(9)),
            Event::MonitorExit(object),
            Event::MethodReturn(None),
            Event::FieldRead(object, x_target(fixture.point)),
            Event::MethodReturn(Some(Value::Int(9))),
        ]
    );

    let obj = object.as_ref().unwrap();
    assert_eq!(vm.heap().monitor_count(obj), 0);
}

#[test]
fn static_synchronized_method_uses_class_monitor() {
    let (program, counter, main) = build_counter_program();
    let (vm, log) = recording_vm(program);
    vm.set_policy(spec_policy("Return:B,GetStatic:B,PutStatic:B"));
    vm.gate().start();

    assert_eq!(vm.run(main, Vec::new()).unwrap(), None);
    assert_eq!(vm.heap().static_load(counter, 0), Value::Int(2));

    let events = log.take();
    let mirror = match events[2] {
        Event::MonitorExit(mirror) => mirror,
        ref event => panic!("expected monitor exit, found {:?}", event),
    };
    let count = FieldTarget {
        class: counter,
        index: 0,
        is_static: true,
    };

    assert_eq!(
        events,
        vec![
            Event::StaticRead(count),
            Event::StaticWrite(count, Value::Int(1)),
            Event::MonitorExit(mirror),
            Event::MethodReturn(None),
            Event::StaticRead(count),
            Event::StaticWrite(count, Value::Int(2)),
            Event::MonitorExit(mirror),
            Event::MethodReturn(None),
            Event::MethodReturn(None),
        ]
    );
}

#[test]
fn array_advice_events() {
    let (program, main) = build_array_program();
    let (vm, log) = recording_vm(program);
    vm.set_policy(AdvicePolicy::from_std_configs("read,write").unwrap());
    vm.gate().start();

    assert_eq!(vm.run(main, Vec::new()).unwrap(), Some(Value::Int(45)));

    let events = log.take();
    let array = match events[0] {
        Event::ArrayCreated(array) => array,
        ref event => panic!("expected array allocation first, found {:?}", event),
    };

    assert_eq!(
        events,
        vec![
            Event::ArrayCreated(array),
            Event::ArrayWrite(array, 1, Value::Int(42)),
            Event::ArrayRead(array, 1),
            Event::ArrayLength(array),
        ]
    );
}

#[test]
fn after_advice_on_incapable_opcode_is_silently_plain() {
    let fixture = build_point_program();
    let (vm, log) = recording_vm(fixture.program);
    vm.set_policy(spec_policy("GetField:A"));
    vm.gate().start();

    assert_eq!(vm.run(fixture.main, Vec::new()).unwrap(), Some(Value::Int(7)));
    assert!(log.take().is_empty());

    // The fetched slot aliases the plain template.
    let code = vm.ensure_compiled(fixture.get_x).unwrap();
    let get_field = &code.instrs()[1];
    assert_eq!(get_field.template.tag(), TemplateTag::GetFieldResolvedInt);
    assert_eq!(get_field.template.hooks(), AdviceModes::NONE);
}

#[test]
fn missing_template_aborts_compilation() {
    let (program, calc) = build_calc_program();
    let mut vm = VM::new(program, VmFlags::default(), Box::new(NullAdviceHandler));
    vm.templates_mut().plain.clear(TemplateTag::ConstInt);

    let err = vm.ensure_compiled(calc).unwrap_err();
    assert_eq!(
        err,
        WeaveError::MissingTemplate {
            opcode: Opcode::Const,
            tag: TemplateTag::ConstInt,
        }
    );
}

#[test]
fn policy_std_configs() {
    let policy = AdvicePolicy::from_std_configs("read,monitor").unwrap();
    assert_eq!(policy.modes(Opcode::GetField), AdviceModes::BEFORE);
    assert_eq!(policy.modes(Opcode::ArrayLoad), AdviceModes::BEFORE);
    assert_eq!(policy.modes(Opcode::MonitorEnter), AdviceModes::BEFORE);
    assert_eq!(policy.modes(Opcode::New), AdviceModes::AFTER);
    assert_eq!(policy.modes(Opcode::PutField), AdviceModes::NONE);
    assert_eq!(policy.modes(Opcode::Store), AdviceModes::NONE);

    let policy = AdvicePolicy::from_std_configs("entryexit").unwrap();
    assert_eq!(policy.modes(Opcode::MethodEntry), AdviceModes::AFTER);
    assert_eq!(policy.modes(Opcode::Return), AdviceModes::BEFORE);

    let policy = AdvicePolicy::from_std_configs("null").unwrap();
    assert_eq!(policy, AdvicePolicy::none());

    assert_eq!(
        AdvicePolicy::from_std_configs("read,nope"),
        Err(PolicyError::UnknownConfig("nope".into()))
    );
}

#[test]
fn policy_spec_strings() {
    let mut policy = AdvicePolicy::none();
    policy
        .apply_spec("GetField:B,PutField:AB,Return", true)
        .unwrap();
    assert_eq!(policy.modes(Opcode::GetField), AdviceModes::BEFORE);
    assert_eq!(policy.modes(Opcode::PutField), AdviceModes::BOTH);
    assert_eq!(policy.modes(Opcode::Return), AdviceModes::BOTH);

    // Disabling clears only the named hooks.
    policy.apply_spec("PutField:A", false).unwrap();
    assert_eq!(policy.modes(Opcode::PutField), AdviceModes::BEFORE);
}

#[test]
fn policy_load_time_faults() {
    let mut policy = AdvicePolicy::none();
    assert_eq!(
        policy.apply_spec("Frobnicate:B", true),
        Err(PolicyError::UnknownOpcode("Frobnicate".into()))
    );
    assert_eq!(
        policy.apply_spec("GetField:Z", true),
        Err(PolicyError::UnknownMode("Z".into()))
    );
}

#[test]
fn policy_changes_apply_to_later_compilations() {
    let fixture = build_point_program();
    let (vm, _log) = recording_vm(fixture.program);

    let get_x = vm.ensure_compiled(fixture.get_x).unwrap();
    assert!(get_x.entry().is_none());

    vm.set_policy(AdvicePolicy::from_std_configs("entry").unwrap());

    // A later compilation sees the new policy; already-installed code
    // is untouched.
    let main = vm.ensure_compiled(fixture.main).unwrap();
    assert!(main.entry().is_some());
    assert!(Arc::ptr_eq(
        &get_x,
        &vm.ensure_compiled(fixture.get_x).unwrap()
    ));
}

#[test]
fn concurrent_requests_compile_once() {
    let fixture = build_point_program();
    let (vm, _log) = recording_vm(fixture.program);
    let main = fixture.main;

    let codes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| vm.ensure_compiled(main).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for code in &codes[1..] {
        assert!(Arc::ptr_eq(&codes[0], code));
    }
    assert_eq!(vm.code_objects.len(), 1);
}

#[test]
fn concurrent_compilation_of_distinct_methods() {
    let fixture = build_point_program();
    let (vm, _log) = recording_vm(fixture.program);
    let (main, get_x) = (fixture.main, fixture.get_x);

    std::thread::scope(|s| {
        s.spawn(|| vm.ensure_compiled(main).unwrap());
        s.spawn(|| vm.ensure_compiled(get_x).unwrap());
    });

    assert_eq!(vm.code_objects.len(), 2);
}

#[test]
fn casts_observe_class_identity() {
    let fixture = build_point_program();
    let (vm, _log) = recording_vm(fixture.program);

    assert_eq!(
        vm.run(fixture.cast_main, Vec::new()).unwrap(),
        Some(Value::Int(1))
    );
}

#[test]
fn traps_propagate_unchanged() {
    let mut builder = ProgramBuilder::new();
    let crash = builder.add_class(ClassData {
        name: "Crash".into(),
        fields: Vec::new(),
        static_fields: Vec::new(),
        vtable: Vec::new(),
    });

    let div0 = builder.add_function(static_function("div0", Some(ValueKind::Int)));
    let thrown = builder.add_function(static_function("thrown", None));
    let bad_monitor = builder.add_function(static_function("bad_monitor", None));
    let bad_field = builder.add_function(static_function("bad_field", Some(ValueKind::Int)));

    let mut w = BytecodeWriter::new();
    w.set_num_locals(0);
    w.emit_const_int32(1);
    w.emit_const_int32(0);
    w.emit_div(ValueKind::Int);
    w.emit_ret(ValueKind::Int);
    builder.set_bytecode(div0, w.generate());

    let mut w = BytecodeWriter::new();
    w.set_num_locals(0);
    let cls = w.add_const(ConstPoolEntry::ClassRef {
        name: "Crash".into(),
        resolved: Some(crash),
    });
    w.emit_new(cls);
    w.emit_throw();
    builder.set_bytecode(thrown, w.generate());

    let mut w = BytecodeWriter::new();
    w.set_num_locals(0);
    let cls = w.add_const(ConstPoolEntry::ClassRef {
        name: "Crash".into(),
        resolved: Some(crash),
    });
    w.emit_new(cls);
    w.emit_monitor_exit();
    w.emit_ret_void();
    builder.set_bytecode(bad_monitor, w.generate());

    let mut w = BytecodeWriter::new();
    w.set_num_locals(0);
    let cls = w.add_const(ConstPoolEntry::ClassRef {
        name: "Crash".into(),
        resolved: Some(crash),
    });
    let field = w.add_const(ConstPoolEntry::FieldRef {
        class: crash,
        name: "nope".into(),
        kind: ValueKind::Int,
        resolved: None,
    });
    w.emit_new(cls);
    w.emit_get_field(field);
    w.emit_ret(ValueKind::Int);
    builder.set_bytecode(bad_field, w.generate());

    let (vm, _log) = recording_vm(builder.generate());

    assert_eq!(
        vm.run(div0, Vec::new()),
        Err(VmError::Trap(Trap::DivisionByZero))
    );
    assert!(matches!(
        vm.run(thrown, Vec::new()),
        Err(VmError::Trap(Trap::Exception(_)))
    ));
    assert_eq!(
        vm.run(bad_monitor, Vec::new()),
        Err(VmError::Trap(Trap::IllegalMonitorState))
    );
    assert_eq!(
        vm.run(bad_field, Vec::new()),
        Err(VmError::Trap(Trap::UnresolvedField))
    );
}
