use parking_lot::Mutex;

use tela_bytecode::{ClassId, Program, ValueKind};

use crate::vm::Trap;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObjRef(pub u32);

impl ObjRef {
    fn to_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(Option<ObjRef>),
}

impl Value {
    pub fn default_of(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Int => Value::Int(0),
            ValueKind::Long => Value::Long(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Double => Value::Double(0.0),
            ValueKind::Ref => Value::Ref(None),
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Ref(_) => ValueKind::Ref,
        }
    }

    pub fn as_int(self) -> i32 {
        match self {
            Value::Int(value) => value,
            _ => panic!("expected int value, found {:?}", self),
        }
    }

    pub fn as_ref(self) -> Option<ObjRef> {
        match self {
            Value::Ref(value) => value,
            _ => panic!("expected reference value, found {:?}", self),
        }
    }
}

struct HeapObject {
    data: ObjectData,
    monitor: u32,
}

enum ObjectData {
    Instance { class: ClassId, fields: Vec<Value> },
    Array { elems: Vec<Value> },
}

struct StaticArea {
    initialized: bool,
    values: Vec<Value>,
    mirror: Option<ObjRef>,
}

/// Minimal object store backing template execution: instances, arrays,
/// per-class static areas and per-object monitor counts. Everything
/// sits behind one lock; templates hold it only for the duration of a
/// single access.
pub struct Heap {
    inner: Mutex<HeapInner>,
}

struct HeapInner {
    objects: Vec<HeapObject>,
    statics: Vec<StaticArea>,
}

impl Heap {
    pub fn new(program: &Program) -> Heap {
        let statics = program
            .classes
            .iter()
            .map(|class| StaticArea {
                initialized: false,
                values: class
                    .static_fields
                    .iter()
                    .map(|f| Value::default_of(f.kind))
                    .collect(),
                mirror: None,
            })
            .collect();

        Heap {
            inner: Mutex::new(HeapInner {
                objects: Vec::new(),
                statics,
            }),
        }
    }

    pub fn allocate_instance(&self, program: &Program, class: ClassId) -> ObjRef {
        let fields = program
            .class(class)
            .fields
            .iter()
            .map(|f| Value::default_of(f.kind))
            .collect();

        let mut inner = self.inner.lock();
        inner.push(ObjectData::Instance { class, fields })
    }

    pub fn allocate_array(&self, kind: ValueKind, length: i32) -> Result<ObjRef, Trap> {
        if length < 0 {
            return Err(Trap::NegativeArraySize);
        }

        let elems = vec![Value::default_of(kind); length as usize];
        let mut inner = self.inner.lock();
        Ok(inner.push(ObjectData::Array { elems }))
    }

    /// Surrogate object representing a class, used as the monitor
    /// target of static synchronized methods. Allocated on first use.
    pub fn class_mirror(&self, class: ClassId) -> ObjRef {
        let mut inner = self.inner.lock();

        if let Some(mirror) = inner.statics[class.to_usize()].mirror {
            return mirror;
        }

        let mirror = inner.push(ObjectData::Instance {
            class,
            fields: Vec::new(),
        });
        inner.statics[class.to_usize()].mirror = Some(mirror);
        mirror
    }

    pub fn object_class(&self, obj: ObjRef) -> Option<ClassId> {
        let inner = self.inner.lock();
        match inner.objects[obj.to_usize()].data {
            ObjectData::Instance { class, .. } => Some(class),
            ObjectData::Array { .. } => None,
        }
    }

    pub fn field_load(&self, obj: ObjRef, index: u32) -> Value {
        let inner = self.inner.lock();
        match &inner.objects[obj.to_usize()].data {
            ObjectData::Instance { fields, .. } => fields[index as usize],
            ObjectData::Array { .. } => panic!("field access on array"),
        }
    }

    pub fn field_store(&self, obj: ObjRef, index: u32, value: Value) {
        let mut inner = self.inner.lock();
        match &mut inner.objects[obj.to_usize()].data {
            ObjectData::Instance { fields, .. } => fields[index as usize] = value,
            ObjectData::Array { .. } => panic!("field access on array"),
        }
    }

    pub fn array_load(&self, obj: ObjRef, index: i32) -> Result<Value, Trap> {
        let inner = self.inner.lock();
        match &inner.objects[obj.to_usize()].data {
            ObjectData::Array { elems } => elems
                .get(usize::try_from(index).map_err(|_| Trap::IndexOutOfBounds)?)
                .copied()
                .ok_or(Trap::IndexOutOfBounds),
            ObjectData::Instance { .. } => panic!("array access on instance"),
        }
    }

    pub fn array_store(&self, obj: ObjRef, index: i32, value: Value) -> Result<(), Trap> {
        let mut inner = self.inner.lock();
        match &mut inner.objects[obj.to_usize()].data {
            ObjectData::Array { elems } => {
                let index = usize::try_from(index).map_err(|_| Trap::IndexOutOfBounds)?;
                let slot = elems.get_mut(index).ok_or(Trap::IndexOutOfBounds)?;
                *slot = value;
                Ok(())
            }
            ObjectData::Instance { .. } => panic!("array access on instance"),
        }
    }

    pub fn array_length(&self, obj: ObjRef) -> i32 {
        let inner = self.inner.lock();
        match &inner.objects[obj.to_usize()].data {
            ObjectData::Array { elems } => elems.len() as i32,
            ObjectData::Instance { .. } => panic!("array access on instance"),
        }
    }

    pub fn static_load(&self, class: ClassId, index: u32) -> Value {
        let inner = self.inner.lock();
        inner.statics[class.to_usize()].values[index as usize]
    }

    pub fn static_store(&self, class: ClassId, index: u32, value: Value) {
        let mut inner = self.inner.lock();
        inner.statics[class.to_usize()].values[index as usize] = value;
    }

    pub fn class_initialized(&self, class: ClassId) -> bool {
        let inner = self.inner.lock();
        inner.statics[class.to_usize()].initialized
    }

    pub fn initialize_class(&self, class: ClassId) {
        let mut inner = self.inner.lock();
        inner.statics[class.to_usize()].initialized = true;
    }

    pub fn monitor_enter(&self, obj: ObjRef) {
        let mut inner = self.inner.lock();
        inner.objects[obj.to_usize()].monitor += 1;
    }

    pub fn monitor_exit(&self, obj: ObjRef) -> Result<(), Trap> {
        let mut inner = self.inner.lock();
        let object = &mut inner.objects[obj.to_usize()];
        if object.monitor == 0 {
            return Err(Trap::IllegalMonitorState);
        }
        object.monitor -= 1;
        Ok(())
    }

    pub fn monitor_count(&self, obj: ObjRef) -> u32 {
        let inner = self.inner.lock();
        inner.objects[obj.to_usize()].monitor
    }
}

impl HeapInner {
    fn push(&mut self, data: ObjectData) -> ObjRef {
        self.objects.push(HeapObject { data, monitor: 0 });
        ObjRef(self.objects.len() as u32 - 1)
    }
}
