use num_enum::TryFromPrimitive;

use tela_bytecode::{InvokeKind, ValueKind};

use crate::advice::ArithOp;

/// Resolution state of an invoke site, part of the specialized tag.
/// `Instrumented` is the receiver-profiling form of virtual/interface
/// dispatch.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InvokeState {
    Unresolved,
    Resolved,
    Instrumented,
}

/// Identifies one concrete template. Tags are finer-grained than
/// opcodes: one opcode fans out by value kind and by operand-resolution
/// state. The discriminant is the ordinal indexing the four variant
/// tables.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, TryFromPrimitive)]
#[repr(u16)]
pub enum TemplateTag {
    ConstInt,
    ConstLong,
    ConstFloat,
    ConstDouble,
    ConstNull,

    LoadInt,
    LoadLong,
    LoadFloat,
    LoadDouble,
    LoadRef,

    StoreInt,
    StoreLong,
    StoreFloat,
    StoreDouble,
    StoreRef,

    Pop,
    Pop2,
    Dup,
    DupX1,
    Swap,

    AddInt,
    AddLong,
    AddFloat,
    AddDouble,
    SubInt,
    SubLong,
    SubFloat,
    SubDouble,
    MulInt,
    MulLong,
    MulFloat,
    MulDouble,
    DivInt,
    DivLong,
    DivFloat,
    DivDouble,
    NegInt,
    NegLong,
    NegFloat,
    NegDouble,

    CmpLong,
    CmpFloat,
    CmpDouble,

    If,
    IfCmp,
    IfRefCmp,
    IfNull,
    Goto,

    GetFieldInt,
    GetFieldLong,
    GetFieldFloat,
    GetFieldDouble,
    GetFieldRef,
    GetFieldResolvedInt,
    GetFieldResolvedLong,
    GetFieldResolvedFloat,
    GetFieldResolvedDouble,
    GetFieldResolvedRef,

    PutFieldInt,
    PutFieldLong,
    PutFieldFloat,
    PutFieldDouble,
    PutFieldRef,
    PutFieldResolvedInt,
    PutFieldResolvedLong,
    PutFieldResolvedFloat,
    PutFieldResolvedDouble,
    PutFieldResolvedRef,

    GetStaticInt,
    GetStaticLong,
    GetStaticFloat,
    GetStaticDouble,
    GetStaticRef,
    GetStaticInitInt,
    GetStaticInitLong,
    GetStaticInitFloat,
    GetStaticInitDouble,
    GetStaticInitRef,

    PutStaticInt,
    PutStaticLong,
    PutStaticFloat,
    PutStaticDouble,
    PutStaticRef,
    PutStaticInitInt,
    PutStaticInitLong,
    PutStaticInitFloat,
    PutStaticInitDouble,
    PutStaticInitRef,

    ArrayLoadInt,
    ArrayLoadLong,
    ArrayLoadFloat,
    ArrayLoadDouble,
    ArrayLoadRef,

    ArrayStoreInt,
    ArrayStoreLong,
    ArrayStoreFloat,
    ArrayStoreDouble,
    ArrayStoreRef,

    ArrayLength,

    New,
    NewInit,
    NewArray,

    CheckCast,
    CheckCastResolved,
    InstanceOf,
    InstanceOfResolved,

    MonitorEnter,
    MonitorExit,
    Throw,

    InvokeVirtualVoid,
    InvokeVirtualInt,
    InvokeVirtualLong,
    InvokeVirtualFloat,
    InvokeVirtualDouble,
    InvokeVirtualRef,
    InvokeVirtualResolvedVoid,
    InvokeVirtualResolvedInt,
    InvokeVirtualResolvedLong,
    InvokeVirtualResolvedFloat,
    InvokeVirtualResolvedDouble,
    InvokeVirtualResolvedRef,
    InvokeVirtualInstrumentedVoid,
    InvokeVirtualInstrumentedInt,
    InvokeVirtualInstrumentedLong,
    InvokeVirtualInstrumentedFloat,
    InvokeVirtualInstrumentedDouble,
    InvokeVirtualInstrumentedRef,

    InvokeInterfaceVoid,
    InvokeInterfaceInt,
    InvokeInterfaceLong,
    InvokeInterfaceFloat,
    InvokeInterfaceDouble,
    InvokeInterfaceRef,
    InvokeInterfaceResolvedVoid,
    InvokeInterfaceResolvedInt,
    InvokeInterfaceResolvedLong,
    InvokeInterfaceResolvedFloat,
    InvokeInterfaceResolvedDouble,
    InvokeInterfaceResolvedRef,
    InvokeInterfaceInstrumentedVoid,
    InvokeInterfaceInstrumentedInt,
    InvokeInterfaceInstrumentedLong,
    InvokeInterfaceInstrumentedFloat,
    InvokeInterfaceInstrumentedDouble,
    InvokeInterfaceInstrumentedRef,

    InvokeSpecialVoid,
    InvokeSpecialInt,
    InvokeSpecialLong,
    InvokeSpecialFloat,
    InvokeSpecialDouble,
    InvokeSpecialRef,
    InvokeSpecialResolvedVoid,
    InvokeSpecialResolvedInt,
    InvokeSpecialResolvedLong,
    InvokeSpecialResolvedFloat,
    InvokeSpecialResolvedDouble,
    InvokeSpecialResolvedRef,

    InvokeStaticVoid,
    InvokeStaticInt,
    InvokeStaticLong,
    InvokeStaticFloat,
    InvokeStaticDouble,
    InvokeStaticRef,
    InvokeStaticResolvedVoid,
    InvokeStaticResolvedInt,
    InvokeStaticResolvedLong,
    InvokeStaticResolvedFloat,
    InvokeStaticResolvedDouble,
    InvokeStaticResolvedRef,

    ReturnVoid,
    ReturnInt,
    ReturnLong,
    ReturnFloat,
    ReturnDouble,
    ReturnRef,
    ReturnVoidUnlock,
    ReturnIntUnlock,
    ReturnLongUnlock,
    ReturnFloatUnlock,
    ReturnDoubleUnlock,
    ReturnRefUnlock,

    MethodEntry,
}

impl TemplateTag {
    pub const COUNT: usize = TemplateTag::MethodEntry as usize + 1;

    pub fn to_usize(self) -> usize {
        self as usize
    }

    pub fn all() -> impl Iterator<Item = TemplateTag> {
        (0..TemplateTag::COUNT as u16).map(|ordinal| {
            TemplateTag::try_from(ordinal).expect("tag ordinal out of range")
        })
    }

    pub fn const_load(kind: ValueKind) -> TemplateTag {
        match kind {
            ValueKind::Int => TemplateTag::ConstInt,
            ValueKind::Long => TemplateTag::ConstLong,
            ValueKind::Float => TemplateTag::ConstFloat,
            ValueKind::Double => TemplateTag::ConstDouble,
            ValueKind::Ref => TemplateTag::ConstNull,
        }
    }

    pub fn load(kind: ValueKind) -> TemplateTag {
        match kind {
            ValueKind::Int => TemplateTag::LoadInt,
            ValueKind::Long => TemplateTag::LoadLong,
            ValueKind::Float => TemplateTag::LoadFloat,
            ValueKind::Double => TemplateTag::LoadDouble,
            ValueKind::Ref => TemplateTag::LoadRef,
        }
    }

    pub fn store(kind: ValueKind) -> TemplateTag {
        match kind {
            ValueKind::Int => TemplateTag::StoreInt,
            ValueKind::Long => TemplateTag::StoreLong,
            ValueKind::Float => TemplateTag::StoreFloat,
            ValueKind::Double => TemplateTag::StoreDouble,
            ValueKind::Ref => TemplateTag::StoreRef,
        }
    }

    pub fn arith(op: ArithOp, kind: ValueKind) -> TemplateTag {
        assert!(kind != ValueKind::Ref);
        match op {
            ArithOp::Add => match kind {
                ValueKind::Int => TemplateTag::AddInt,
                ValueKind::Long => TemplateTag::AddLong,
                ValueKind::Float => TemplateTag::AddFloat,
                ValueKind::Double => TemplateTag::AddDouble,
                ValueKind::Ref => unreachable!(),
            },
            ArithOp::Sub => match kind {
                ValueKind::Int => TemplateTag::SubInt,
                ValueKind::Long => TemplateTag::SubLong,
                ValueKind::Float => TemplateTag::SubFloat,
                ValueKind::Double => TemplateTag::SubDouble,
                ValueKind::Ref => unreachable!(),
            },
            ArithOp::Mul => match kind {
                ValueKind::Int => TemplateTag::MulInt,
                ValueKind::Long => TemplateTag::MulLong,
                ValueKind::Float => TemplateTag::MulFloat,
                ValueKind::Double => TemplateTag::MulDouble,
                ValueKind::Ref => unreachable!(),
            },
            ArithOp::Div => match kind {
                ValueKind::Int => TemplateTag::DivInt,
                ValueKind::Long => TemplateTag::DivLong,
                ValueKind::Float => TemplateTag::DivFloat,
                ValueKind::Double => TemplateTag::DivDouble,
                ValueKind::Ref => unreachable!(),
            },
            ArithOp::Neg => match kind {
                ValueKind::Int => TemplateTag::NegInt,
                ValueKind::Long => TemplateTag::NegLong,
                ValueKind::Float => TemplateTag::NegFloat,
                ValueKind::Double => TemplateTag::NegDouble,
                ValueKind::Ref => unreachable!(),
            },
            ArithOp::Cmp => TemplateTag::cmp(kind),
        }
    }

    pub fn cmp(kind: ValueKind) -> TemplateTag {
        match kind {
            ValueKind::Long => TemplateTag::CmpLong,
            ValueKind::Float => TemplateTag::CmpFloat,
            ValueKind::Double => TemplateTag::CmpDouble,
            _ => panic!("no comparison template for {}", kind),
        }
    }

    pub fn get_field(kind: ValueKind, resolved: bool) -> TemplateTag {
        match (kind, resolved) {
            (ValueKind::Int, false) => TemplateTag::GetFieldInt,
            (ValueKind::Long, false) => TemplateTag::GetFieldLong,
            (ValueKind::Float, false) => TemplateTag::GetFieldFloat,
            (ValueKind::Double, false) => TemplateTag::GetFieldDouble,
            (ValueKind::Ref, false) => TemplateTag::GetFieldRef,
            (ValueKind::Int, true) => TemplateTag::GetFieldResolvedInt,
            (ValueKind::Long, true) => TemplateTag::GetFieldResolvedLong,
            (ValueKind::Float, true) => TemplateTag::GetFieldResolvedFloat,
            (ValueKind::Double, true) => TemplateTag::GetFieldResolvedDouble,
            (ValueKind::Ref, true) => TemplateTag::GetFieldResolvedRef,
        }
    }

    pub fn put_field(kind: ValueKind, resolved: bool) -> TemplateTag {
        match (kind, resolved) {
            (ValueKind::Int, false) => TemplateTag::PutFieldInt,
            (ValueKind::Long, false) => TemplateTag::PutFieldLong,
            (ValueKind::Float, false) => TemplateTag::PutFieldFloat,
            (ValueKind::Double, false) => TemplateTag::PutFieldDouble,
            (ValueKind::Ref, false) => TemplateTag::PutFieldRef,
            (ValueKind::Int, true) => TemplateTag::PutFieldResolvedInt,
            (ValueKind::Long, true) => TemplateTag::PutFieldResolvedLong,
            (ValueKind::Float, true) => TemplateTag::PutFieldResolvedFloat,
            (ValueKind::Double, true) => TemplateTag::PutFieldResolvedDouble,
            (ValueKind::Ref, true) => TemplateTag::PutFieldResolvedRef,
        }
    }

    pub fn get_static(kind: ValueKind, initialized: bool) -> TemplateTag {
        match (kind, initialized) {
            (ValueKind::Int, false) => TemplateTag::GetStaticInt,
            (ValueKind::Long, false) => TemplateTag::GetStaticLong,
            (ValueKind::Float, false) => TemplateTag::GetStaticFloat,
            (ValueKind::Double, false) => TemplateTag::GetStaticDouble,
            (ValueKind::Ref, false) => TemplateTag::GetStaticRef,
            (ValueKind::Int, true) => TemplateTag::GetStaticInitInt,
            (ValueKind::Long, true) => TemplateTag::GetStaticInitLong,
            (ValueKind::Float, true) => TemplateTag::GetStaticInitFloat,
            (ValueKind::Double, true) => TemplateTag::GetStaticInitDouble,
            (ValueKind::Ref, true) => TemplateTag::GetStaticInitRef,
        }
    }

    pub fn put_static(kind: ValueKind, initialized: bool) -> TemplateTag {
        match (kind, initialized) {
            (ValueKind::Int, false) => TemplateTag::PutStaticInt,
            (ValueKind::Long, false) => TemplateTag::PutStaticLong,
            (ValueKind::Float, false) => TemplateTag::PutStaticFloat,
            (ValueKind::Double, false) => TemplateTag::PutStaticDouble,
            (ValueKind::Ref, false) => TemplateTag::PutStaticRef,
            (ValueKind::Int, true) => TemplateTag::PutStaticInitInt,
            (ValueKind::Long, true) => TemplateTag::PutStaticInitLong,
            (ValueKind::Float, true) => TemplateTag::PutStaticInitFloat,
            (ValueKind::Double, true) => TemplateTag::PutStaticInitDouble,
            (ValueKind::Ref, true) => TemplateTag::PutStaticInitRef,
        }
    }

    pub fn array_load(kind: ValueKind) -> TemplateTag {
        match kind {
            ValueKind::Int => TemplateTag::ArrayLoadInt,
            ValueKind::Long => TemplateTag::ArrayLoadLong,
            ValueKind::Float => TemplateTag::ArrayLoadFloat,
            ValueKind::Double => TemplateTag::ArrayLoadDouble,
            ValueKind::Ref => TemplateTag::ArrayLoadRef,
        }
    }

    pub fn array_store(kind: ValueKind) -> TemplateTag {
        match kind {
            ValueKind::Int => TemplateTag::ArrayStoreInt,
            ValueKind::Long => TemplateTag::ArrayStoreLong,
            ValueKind::Float => TemplateTag::ArrayStoreFloat,
            ValueKind::Double => TemplateTag::ArrayStoreDouble,
            ValueKind::Ref => TemplateTag::ArrayStoreRef,
        }
    }

    pub fn new_instance(initialized: bool) -> TemplateTag {
        if initialized {
            TemplateTag::NewInit
        } else {
            TemplateTag::New
        }
    }

    pub fn check_cast(resolved: bool) -> TemplateTag {
        if resolved {
            TemplateTag::CheckCastResolved
        } else {
            TemplateTag::CheckCast
        }
    }

    pub fn instance_of(resolved: bool) -> TemplateTag {
        if resolved {
            TemplateTag::InstanceOfResolved
        } else {
            TemplateTag::InstanceOf
        }
    }

    pub fn invoke(
        kind: InvokeKind,
        return_kind: Option<ValueKind>,
        state: InvokeState,
    ) -> TemplateTag {
        let base = match (kind, state) {
            (InvokeKind::Virtual, InvokeState::Unresolved) => TemplateTag::InvokeVirtualVoid,
            (InvokeKind::Virtual, InvokeState::Resolved) => TemplateTag::InvokeVirtualResolvedVoid,
            (InvokeKind::Virtual, InvokeState::Instrumented) => {
                TemplateTag::InvokeVirtualInstrumentedVoid
            }
            (InvokeKind::Interface, InvokeState::Unresolved) => TemplateTag::InvokeInterfaceVoid,
            (InvokeKind::Interface, InvokeState::Resolved) => {
                TemplateTag::InvokeInterfaceResolvedVoid
            }
            (InvokeKind::Interface, InvokeState::Instrumented) => {
                TemplateTag::InvokeInterfaceInstrumentedVoid
            }
            (InvokeKind::Special, InvokeState::Unresolved) => TemplateTag::InvokeSpecialVoid,
            (InvokeKind::Special, InvokeState::Resolved) => TemplateTag::InvokeSpecialResolvedVoid,
            (InvokeKind::Static, InvokeState::Unresolved) => TemplateTag::InvokeStaticVoid,
            (InvokeKind::Static, InvokeState::Resolved) => TemplateTag::InvokeStaticResolvedVoid,
            (InvokeKind::Special | InvokeKind::Static, InvokeState::Instrumented) => {
                panic!("no instrumented dispatch for {:?}", kind)
            }
        };

        TemplateTag::offset_by_return_kind(base, return_kind)
    }

    pub fn ret(return_kind: Option<ValueKind>, unlock: bool) -> TemplateTag {
        let base = if unlock {
            TemplateTag::ReturnVoidUnlock
        } else {
            TemplateTag::ReturnVoid
        };
        TemplateTag::offset_by_return_kind(base, return_kind)
    }

    fn offset_by_return_kind(base: TemplateTag, return_kind: Option<ValueKind>) -> TemplateTag {
        let offset = match return_kind {
            None => 0,
            Some(ValueKind::Int) => 1,
            Some(ValueKind::Long) => 2,
            Some(ValueKind::Float) => 3,
            Some(ValueKind::Double) => 4,
            Some(ValueKind::Ref) => 5,
        };

        TemplateTag::try_from(base as u16 + offset).expect("return-kind offset out of range")
    }
}
