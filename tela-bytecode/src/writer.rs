use byteorder::{LittleEndian, WriteBytesExt};

use crate::data::{
    BytecodeFunction, BytecodeOffset, ConstPoolEntry, ConstPoolIdx, IfCond, Opcode, ValueKind,
};

#[derive(Copy, Clone, PartialEq, Debug, Eq, Hash)]
pub struct Label(pub usize);

/// Assembles method bytecode: opcode bytes followed by fixed-width
/// little-endian operands. Forward branches go through labels and are
/// back-patched in `generate`.
pub struct BytecodeWriter {
    code: Vec<u8>,
    const_pool: Vec<ConstPoolEntry>,
    num_locals: u32,

    label_offsets: Vec<Option<BytecodeOffset>>,
    unresolved_jumps: Vec<(usize, Label)>,
}

impl BytecodeWriter {
    pub fn new() -> BytecodeWriter {
        BytecodeWriter {
            code: Vec::new(),
            const_pool: Vec::new(),
            num_locals: 0,

            label_offsets: Vec::new(),
            unresolved_jumps: Vec::new(),
        }
    }

    pub fn set_num_locals(&mut self, num_locals: u32) {
        self.num_locals = num_locals;
    }

    pub fn offset(&self) -> BytecodeOffset {
        BytecodeOffset(self.code.len() as u32)
    }

    pub fn create_label(&mut self) -> Label {
        self.label_offsets.push(None);
        Label(self.label_offsets.len() - 1)
    }

    pub fn define_label(&mut self) -> Label {
        let offset = self.offset();
        self.label_offsets.push(Some(offset));
        Label(self.label_offsets.len() - 1)
    }

    pub fn bind_label(&mut self, lbl: Label) {
        assert!(self.label_offsets[lbl.0].is_none(), "bind label twice");
        self.label_offsets[lbl.0] = Some(self.offset());
    }

    pub fn add_const(&mut self, entry: ConstPoolEntry) -> ConstPoolIdx {
        self.const_pool.push(entry);
        ConstPoolIdx(self.const_pool.len() as u32 - 1)
    }

    pub fn emit_nop(&mut self) {
        self.emit_op(Opcode::Nop);
    }

    pub fn emit_const_int32(&mut self, value: i32) {
        let idx = self.add_const(ConstPoolEntry::Int32(value));
        self.emit_op_idx(Opcode::Const, idx);
    }

    pub fn emit_const_int64(&mut self, value: i64) {
        let idx = self.add_const(ConstPoolEntry::Int64(value));
        self.emit_op_idx(Opcode::Const, idx);
    }

    pub fn emit_const_float32(&mut self, value: f32) {
        let idx = self.add_const(ConstPoolEntry::Float32(value));
        self.emit_op_idx(Opcode::Const, idx);
    }

    pub fn emit_const_float64(&mut self, value: f64) {
        let idx = self.add_const(ConstPoolEntry::Float64(value));
        self.emit_op_idx(Opcode::Const, idx);
    }

    pub fn emit_const_null(&mut self) {
        let idx = self.add_const(ConstPoolEntry::Null);
        self.emit_op_idx(Opcode::Const, idx);
    }

    pub fn emit_load(&mut self, kind: ValueKind, index: u32) {
        self.emit_op(Opcode::Load);
        self.emit_kind(kind);
        self.emit_u32(index);
    }

    pub fn emit_store(&mut self, kind: ValueKind, index: u32) {
        self.emit_op(Opcode::Store);
        self.emit_kind(kind);
        self.emit_u32(index);
    }

    pub fn emit_pop(&mut self) {
        self.emit_op(Opcode::Pop);
    }

    pub fn emit_pop2(&mut self) {
        self.emit_op(Opcode::Pop2);
    }

    pub fn emit_dup(&mut self) {
        self.emit_op(Opcode::Dup);
    }

    pub fn emit_dup_x1(&mut self) {
        self.emit_op(Opcode::DupX1);
    }

    pub fn emit_swap(&mut self) {
        self.emit_op(Opcode::Swap);
    }

    pub fn emit_add(&mut self, kind: ValueKind) {
        self.emit_op_kind(Opcode::Add, kind);
    }

    pub fn emit_sub(&mut self, kind: ValueKind) {
        self.emit_op_kind(Opcode::Sub, kind);
    }

    pub fn emit_mul(&mut self, kind: ValueKind) {
        self.emit_op_kind(Opcode::Mul, kind);
    }

    pub fn emit_div(&mut self, kind: ValueKind) {
        self.emit_op_kind(Opcode::Div, kind);
    }

    pub fn emit_neg(&mut self, kind: ValueKind) {
        self.emit_op_kind(Opcode::Neg, kind);
    }

    pub fn emit_cmp(&mut self, kind: ValueKind) {
        assert!(kind.is_wide() || kind == ValueKind::Float);
        self.emit_op_kind(Opcode::Cmp, kind);
    }

    pub fn emit_if(&mut self, cond: IfCond, lbl: Label) {
        self.emit_op(Opcode::If);
        self.emit_u8(cond.into());
        self.emit_jump_target(lbl);
    }

    pub fn emit_if_cmp(&mut self, cond: IfCond, lbl: Label) {
        self.emit_op(Opcode::IfCmp);
        self.emit_u8(cond.into());
        self.emit_jump_target(lbl);
    }

    pub fn emit_if_ref_cmp(&mut self, cond: IfCond, lbl: Label) {
        assert!(cond == IfCond::Eq || cond == IfCond::Ne);
        self.emit_op(Opcode::IfRefCmp);
        self.emit_u8(cond.into());
        self.emit_jump_target(lbl);
    }

    pub fn emit_if_null(&mut self, test_null: bool, lbl: Label) {
        self.emit_op(Opcode::IfNull);
        self.emit_u8(test_null as u8);
        self.emit_jump_target(lbl);
    }

    pub fn emit_goto(&mut self, lbl: Label) {
        self.emit_op(Opcode::Goto);
        self.emit_jump_target(lbl);
    }

    pub fn emit_get_field(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::GetField, idx);
    }

    pub fn emit_put_field(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::PutField, idx);
    }

    pub fn emit_get_static(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::GetStatic, idx);
    }

    pub fn emit_put_static(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::PutStatic, idx);
    }

    pub fn emit_array_load(&mut self, kind: ValueKind) {
        self.emit_op_kind(Opcode::ArrayLoad, kind);
    }

    pub fn emit_array_store(&mut self, kind: ValueKind) {
        self.emit_op_kind(Opcode::ArrayStore, kind);
    }

    pub fn emit_array_length(&mut self) {
        self.emit_op(Opcode::ArrayLength);
    }

    pub fn emit_new(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::New, idx);
    }

    pub fn emit_new_array(&mut self, kind: ValueKind) {
        self.emit_op_kind(Opcode::NewArray, kind);
    }

    pub fn emit_check_cast(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::CheckCast, idx);
    }

    pub fn emit_instance_of(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::InstanceOf, idx);
    }

    pub fn emit_monitor_enter(&mut self) {
        self.emit_op(Opcode::MonitorEnter);
    }

    pub fn emit_monitor_exit(&mut self) {
        self.emit_op(Opcode::MonitorExit);
    }

    pub fn emit_throw(&mut self) {
        self.emit_op(Opcode::Throw);
    }

    pub fn emit_invoke_virtual(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::InvokeVirtual, idx);
    }

    pub fn emit_invoke_interface(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::InvokeInterface, idx);
    }

    pub fn emit_invoke_special(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::InvokeSpecial, idx);
    }

    pub fn emit_invoke_static(&mut self, idx: ConstPoolIdx) {
        self.emit_op_idx(Opcode::InvokeStatic, idx);
    }

    pub fn emit_ret(&mut self, kind: ValueKind) {
        self.emit_op(Opcode::Return);
        self.emit_kind(kind);
    }

    pub fn emit_ret_void(&mut self) {
        self.emit_op(Opcode::Return);
        self.emit_u8(0);
    }

    pub fn generate(mut self) -> BytecodeFunction {
        self.resolve_forward_jumps();

        BytecodeFunction::new(self.code, self.const_pool, self.num_locals)
    }

    fn resolve_forward_jumps(&mut self) {
        let unresolved_jumps = std::mem::replace(&mut self.unresolved_jumps, Vec::new());

        for (pos, lbl) in unresolved_jumps {
            let target = self.label_offsets[lbl.0].expect("label not bound");
            self.code[pos..pos + 4].copy_from_slice(&target.to_u32().to_le_bytes());
        }
    }

    fn emit_jump_target(&mut self, lbl: Label) {
        match self.label_offsets[lbl.0] {
            Some(target) => self.emit_u32(target.to_u32()),
            None => {
                self.unresolved_jumps.push((self.code.len(), lbl));
                self.emit_u32(0);
            }
        }
    }

    fn emit_op(&mut self, opcode: Opcode) {
        assert!(opcode != Opcode::MethodEntry);
        self.emit_u8(opcode.into());
    }

    fn emit_op_kind(&mut self, opcode: Opcode, kind: ValueKind) {
        self.emit_op(opcode);
        self.emit_kind(kind);
    }

    fn emit_op_idx(&mut self, opcode: Opcode, idx: ConstPoolIdx) {
        self.emit_op(opcode);
        self.emit_u32(idx.0);
    }

    fn emit_kind(&mut self, kind: ValueKind) {
        self.emit_u8(kind.into());
    }

    fn emit_u8(&mut self, value: u8) {
        self.code.write_u8(value).expect("write failed");
    }

    fn emit_u32(&mut self, value: u32) {
        self.code
            .write_u32::<LittleEndian>(value)
            .expect("write failed");
    }
}
