use crate::data::{BytecodeFunction, ValueKind};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ClassId(pub u32);

impl ClassId {
    pub fn to_usize(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FunctionId(pub u32);

impl FunctionId {
    pub fn to_usize(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct FieldData {
    pub name: String,
    pub kind: ValueKind,
}

pub struct ClassData {
    pub name: String,
    pub fields: Vec<FieldData>,
    pub static_fields: Vec<FieldData>,
    pub vtable: Vec<FunctionId>,
}

pub struct FunctionData {
    pub name: String,
    pub holder: Option<ClassId>,
    pub params: Vec<ValueKind>,
    pub return_kind: Option<ValueKind>,
    pub is_static: bool,
    pub is_synchronized: bool,
    pub vtable_index: Option<u32>,
    pub bytecode: Option<BytecodeFunction>,
}

impl FunctionData {
    /// Number of local-variable slots occupied by the parameters,
    /// including the receiver for instance methods.
    pub fn param_slots(&self) -> u32 {
        let receiver = if self.is_static { 0 } else { 1 };
        receiver + self.params.iter().map(|k| k.slots()).sum::<u32>()
    }
}

pub struct Program {
    pub classes: Vec<ClassData>,
    pub functions: Vec<FunctionData>,
}

impl Program {
    pub fn new() -> Program {
        Program {
            classes: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn class(&self, id: ClassId) -> &ClassData {
        &self.classes[id.to_usize()]
    }

    pub fn fct(&self, id: FunctionId) -> &FunctionData {
        &self.functions[id.to_usize()]
    }

    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(|idx| ClassId(idx as u32))
    }

    pub fn field_index(&self, class: ClassId, name: &str, is_static: bool) -> Option<u32> {
        let class = self.class(class);
        let fields = if is_static {
            &class.static_fields
        } else {
            &class.fields
        };
        fields
            .iter()
            .position(|f| f.name == name)
            .map(|idx| idx as u32)
    }

    pub fn method_by_name(&self, class: ClassId, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.holder == Some(class) && f.name == name)
            .map(|idx| FunctionId(idx as u32))
    }
}

pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn new() -> ProgramBuilder {
        ProgramBuilder {
            program: Program::new(),
        }
    }

    pub fn add_class(&mut self, class: ClassData) -> ClassId {
        self.program.classes.push(class);
        ClassId(self.program.classes.len() as u32 - 1)
    }

    pub fn add_function(&mut self, fct: FunctionData) -> FunctionId {
        self.program.functions.push(fct);
        FunctionId(self.program.functions.len() as u32 - 1)
    }

    pub fn set_bytecode(&mut self, id: FunctionId, bytecode: BytecodeFunction) {
        self.program.functions[id.to_usize()].bytecode = Some(bytecode);
    }

    /// Installs the virtual dispatch table of a class. Separate from
    /// `add_class` because the member functions get their ids only
    /// after the class exists.
    pub fn set_vtable(&mut self, id: ClassId, vtable: Vec<FunctionId>) {
        self.program.classes[id.to_usize()].vtable = vtable;
    }

    pub fn generate(self) -> Program {
        self.program
    }
}
