//! Generic template bodies. Each function here is one kind-parameterized
//! operation; the store instantiates it once per tag and advice variant.
//! The dispatch discipline is uniform: "before" hooks observe operands
//! prior to any stack or memory mutation, "after" hooks observe the
//! result before the final push, and every hook call performs its own
//! gate read.

use tela_bytecode::{IfCond, InvokeKind, ValueKind};

use crate::advice::{ArithOp, StackOp};
use crate::heap::Value;
use crate::policy::AdviceModes;
use crate::templates::TemplateFn;
use crate::vm::code::{Callee, Effect, MonitorTarget};
use crate::vm::Trap;

pub(super) fn const_load(kind: ValueKind, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let value = ctx.const_value(operands.pool_idx());
        debug_assert_eq!(value.kind(), kind);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().const_load(value);
        }
        ctx.frame.stack.push(value);
        Ok(Effect::Next)
    })
}

pub(super) fn local_load(kind: ValueKind, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let index = operands.local_index();
        if hooks.before && ctx.advising() {
            ctx.vm.advice().load(kind, index);
        }
        let value = ctx.frame.local(index);
        debug_assert_eq!(value.kind(), kind);
        ctx.frame.stack.push(value);
        Ok(Effect::Next)
    })
}

pub(super) fn local_store(kind: ValueKind, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let index = operands.local_index();
        let value = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().store(kind, index, value);
        }
        ctx.frame.stack.pop();
        ctx.frame.set_local(index, value);
        Ok(Effect::Next)
    })
}

pub(super) fn stack_shuffle(op: StackOp, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        if hooks.before && ctx.advising() {
            ctx.vm.advice().stack_adjust(op);
        }

        let stack = &mut ctx.frame.stack;
        match op {
            StackOp::Pop => {
                stack.pop();
            }
            StackOp::Pop2 => {
                if stack.peek(0).kind().is_wide() {
                    stack.pop();
                } else {
                    stack.pop();
                    stack.pop();
                }
            }
            StackOp::Dup => {
                let top = stack.peek(0);
                stack.push(top);
            }
            StackOp::DupX1 => {
                let top = stack.pop();
                let below = stack.pop();
                stack.push(top);
                stack.push(below);
                stack.push(top);
            }
            StackOp::Swap => {
                let top = stack.pop();
                let below = stack.pop();
                stack.push(top);
                stack.push(below);
            }
        }

        Ok(Effect::Next)
    })
}

pub(super) fn arith(op: ArithOp, kind: ValueKind, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        let lhs = ctx.frame.stack.peek(1);
        let rhs = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().operation(op, kind, &[lhs, rhs]);
        }
        ctx.frame.stack.pop();
        ctx.frame.stack.pop();
        let result = apply_binop(op, lhs, rhs)?;
        ctx.frame.stack.push(result);
        Ok(Effect::Next)
    })
}

pub(super) fn neg(kind: ValueKind, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        let value = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().operation(ArithOp::Neg, kind, &[value]);
        }
        ctx.frame.stack.pop();
        let result = match value {
            Value::Int(v) => Value::Int(v.wrapping_neg()),
            Value::Long(v) => Value::Long(v.wrapping_neg()),
            Value::Float(v) => Value::Float(-v),
            Value::Double(v) => Value::Double(-v),
            Value::Ref(_) => panic!("negation of reference"),
        };
        ctx.frame.stack.push(result);
        Ok(Effect::Next)
    })
}

pub(super) fn cmp(kind: ValueKind, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        let lhs = ctx.frame.stack.peek(1);
        let rhs = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().operation(ArithOp::Cmp, kind, &[lhs, rhs]);
        }
        ctx.frame.stack.pop();
        ctx.frame.stack.pop();

        let ordering = match (lhs, rhs) {
            (Value::Long(l), Value::Long(r)) => l.cmp(&r) as i32,
            // NaN compares as greater, matching the cmpg flavor.
            (Value::Float(l), Value::Float(r)) => l.partial_cmp(&r).map(|o| o as i32).unwrap_or(1),
            (Value::Double(l), Value::Double(r)) => {
                l.partial_cmp(&r).map(|o| o as i32).unwrap_or(1)
            }
            _ => panic!("comparison of mismatched values"),
        };

        ctx.frame.stack.push(Value::Int(ordering));
        Ok(Effect::Next)
    })
}

pub(super) fn if_zero(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let (cond, _, target) = operands.branch();
        let cond = cond.expect("missing branch condition");
        let value = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().branch(&[value], target);
        }
        let value = ctx.frame.stack.pop().as_int();
        if eval_int_cond(cond, value, 0) {
            Ok(Effect::Branch(target))
        } else {
            Ok(Effect::Next)
        }
    })
}

pub(super) fn if_cmp(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let (cond, _, target) = operands.branch();
        let cond = cond.expect("missing branch condition");
        let lhs = ctx.frame.stack.peek(1);
        let rhs = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().branch(&[lhs, rhs], target);
        }
        let rhs = ctx.frame.stack.pop().as_int();
        let lhs = ctx.frame.stack.pop().as_int();
        if eval_int_cond(cond, lhs, rhs) {
            Ok(Effect::Branch(target))
        } else {
            Ok(Effect::Next)
        }
    })
}

pub(super) fn if_ref_cmp(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let (cond, _, target) = operands.branch();
        let cond = cond.expect("missing branch condition");
        let lhs = ctx.frame.stack.peek(1);
        let rhs = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().branch(&[lhs, rhs], target);
        }
        let rhs = ctx.frame.stack.pop().as_ref();
        let lhs = ctx.frame.stack.pop().as_ref();
        let equal = lhs == rhs;
        let taken = match cond {
            IfCond::Eq => equal,
            IfCond::Ne => !equal,
            _ => panic!("invalid reference comparison {:?}", cond),
        };
        if taken {
            Ok(Effect::Branch(target))
        } else {
            Ok(Effect::Next)
        }
    })
}

pub(super) fn if_null(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let (_, test_null, target) = operands.branch();
        let value = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().branch(&[value], target);
        }
        let is_null = ctx.frame.stack.pop().as_ref().is_none();
        if is_null == test_null {
            Ok(Effect::Branch(target))
        } else {
            Ok(Effect::Next)
        }
    })
}

pub(super) fn goto(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let (_, _, target) = operands.branch();
        if hooks.before && ctx.advising() {
            ctx.vm.advice().branch(&[], target);
        }
        Ok(Effect::Branch(target))
    })
}

pub(super) fn get_field(kind: ValueKind, resolved: bool, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let target = if resolved {
            operands.field_target()
        } else {
            ctx.resolve_field_ref(operands.pool_idx())?
        };

        let object = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().field_read(object, target);
        }

        let obj = object.as_ref().ok_or(Trap::NullPointer)?;
        ctx.frame.stack.pop();
        let value = ctx.vm.heap().field_load(obj, target.index);
        debug_assert_eq!(value.kind(), kind);
        ctx.frame.stack.push(value);
        Ok(Effect::Next)
    })
}

pub(super) fn put_field(kind: ValueKind, resolved: bool, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let target = if resolved {
            operands.field_target()
        } else {
            ctx.resolve_field_ref(operands.pool_idx())?
        };

        let value = ctx.frame.stack.peek(0);
        let object = ctx.frame.stack.peek(1);
        debug_assert_eq!(value.kind(), kind);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().field_write(object, target, value);
        }

        let obj = object.as_ref().ok_or(Trap::NullPointer)?;
        ctx.frame.stack.pop();
        ctx.frame.stack.pop();
        ctx.vm.heap().field_store(obj, target.index, value);
        Ok(Effect::Next)
    })
}

pub(super) fn get_static(kind: ValueKind, initialized: bool, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let target = if initialized {
            operands.field_target()
        } else {
            let target = ctx.resolve_field_ref(operands.pool_idx())?;
            ctx.vm.ensure_class_initialized(target.class);
            target
        };

        if hooks.before && ctx.advising() {
            ctx.vm.advice().static_read(target);
        }

        let value = ctx.vm.heap().static_load(target.class, target.index);
        debug_assert_eq!(value.kind(), kind);
        ctx.frame.stack.push(value);
        Ok(Effect::Next)
    })
}

pub(super) fn put_static(kind: ValueKind, initialized: bool, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let target = if initialized {
            operands.field_target()
        } else {
            let target = ctx.resolve_field_ref(operands.pool_idx())?;
            ctx.vm.ensure_class_initialized(target.class);
            target
        };

        let value = ctx.frame.stack.peek(0);
        debug_assert_eq!(value.kind(), kind);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().static_write(target, value);
        }

        ctx.frame.stack.pop();
        ctx.vm.heap().static_store(target.class, target.index, value);
        Ok(Effect::Next)
    })
}

pub(super) fn array_load(kind: ValueKind, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        let index = ctx.frame.stack.peek(0);
        let array = ctx.frame.stack.peek(1);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().array_read(array, index.as_int());
        }

        let arr = array.as_ref().ok_or(Trap::NullPointer)?;
        ctx.frame.stack.pop();
        ctx.frame.stack.pop();
        let value = ctx.vm.heap().array_load(arr, index.as_int())?;
        debug_assert_eq!(value.kind(), kind);
        ctx.frame.stack.push(value);
        Ok(Effect::Next)
    })
}

pub(super) fn array_store(kind: ValueKind, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        let value = ctx.frame.stack.peek(0);
        let index = ctx.frame.stack.peek(1);
        let array = ctx.frame.stack.peek(2);
        debug_assert_eq!(value.kind(), kind);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().array_write(array, index.as_int(), value);
        }

        let arr = array.as_ref().ok_or(Trap::NullPointer)?;
        ctx.frame.stack.pop();
        ctx.frame.stack.pop();
        ctx.frame.stack.pop();
        ctx.vm.heap().array_store(arr, index.as_int(), value)?;
        Ok(Effect::Next)
    })
}

pub(super) fn array_length(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        let array = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().array_length(array);
        }

        let arr = array.as_ref().ok_or(Trap::NullPointer)?;
        ctx.frame.stack.pop();
        let length = ctx.vm.heap().array_length(arr);
        ctx.frame.stack.push(Value::Int(length));
        Ok(Effect::Next)
    })
}

pub(super) fn new_instance(initialized: bool, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let class = if initialized {
            operands.class()
        } else {
            let class = ctx.resolve_class_ref(operands.pool_idx())?;
            ctx.vm.ensure_class_initialized(class);
            class
        };

        let obj = ctx.vm.allocate_instance(class);
        let value = Value::Ref(Some(obj));
        if hooks.after && ctx.advising() {
            ctx.vm.advice().object_created(value);
        }
        ctx.frame.stack.push(value);
        Ok(Effect::Next)
    })
}

pub(super) fn new_array(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let kind = operands.array_kind();
        let length = ctx.frame.stack.pop().as_int();
        let array = ctx.vm.heap().allocate_array(kind, length)?;
        let value = Value::Ref(Some(array));
        if hooks.after && ctx.advising() {
            ctx.vm.advice().array_created(value);
        }
        ctx.frame.stack.push(value);
        Ok(Effect::Next)
    })
}

pub(super) fn check_cast(resolved: bool, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let class = if resolved {
            operands.class()
        } else {
            ctx.resolve_class_ref(operands.pool_idx())?
        };

        let object = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().check_cast(object, class);
        }

        // A null reference passes any cast; the operand stays on the stack.
        if let Some(obj) = object.as_ref() {
            if !ctx.vm.instance_of(obj, class) {
                return Err(Trap::ClassCast);
            }
        }
        Ok(Effect::Next)
    })
}

pub(super) fn instance_of(resolved: bool, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let class = if resolved {
            operands.class()
        } else {
            ctx.resolve_class_ref(operands.pool_idx())?
        };

        let object = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().instance_of(object, class);
        }

        let result = match ctx.frame.stack.pop().as_ref() {
            Some(obj) => ctx.vm.instance_of(obj, class),
            None => false,
        };
        ctx.frame.stack.push(Value::Int(result as i32));
        Ok(Effect::Next)
    })
}

pub(super) fn monitor_enter(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        let object = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().monitor_enter(object);
        }

        let obj = object.as_ref().ok_or(Trap::NullPointer)?;
        ctx.frame.stack.pop();
        ctx.vm.heap().monitor_enter(obj);
        Ok(Effect::Next)
    })
}

pub(super) fn monitor_exit(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        let object = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().monitor_exit(object);
        }

        let obj = object.as_ref().ok_or(Trap::NullPointer)?;
        ctx.frame.stack.pop();
        ctx.vm.heap().monitor_exit(obj)?;
        Ok(Effect::Next)
    })
}

pub(super) fn throw_value(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, _operands| {
        let object = ctx.frame.stack.peek(0);
        if hooks.before && ctx.advising() {
            ctx.vm.advice().thrown(object);
        }

        let obj = ctx.frame.stack.pop().as_ref().ok_or(Trap::NullPointer)?;
        Err(Trap::Exception(obj))
    })
}

pub(super) fn invoke(
    kind: InvokeKind,
    return_kind: Option<ValueKind>,
    hooks: AdviceModes,
) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let (callee, idx) = operands.invoke();
        let param_count = ctx.method_param_count(idx);
        let has_receiver = kind != InvokeKind::Static;

        let receiver = if has_receiver {
            Some(ctx.frame.stack.peek(param_count))
        } else {
            None
        };

        let target = match callee {
            Callee::Unresolved(pool_idx) => {
                let target = ctx.resolve_method_ref(pool_idx)?;
                if kind == InvokeKind::Static {
                    let holder = ctx
                        .vm
                        .program()
                        .fct(target.function)
                        .holder
                        .ok_or(Trap::UnresolvedMethod)?;
                    ctx.vm.ensure_class_initialized(holder);
                }
                dispatch(ctx, kind, receiver, target.function)?
            }
            Callee::Identity(fct_id) => dispatch(ctx, kind, receiver, fct_id)?,
            Callee::VtableIndex(vtable_index) => {
                let recv = receiver
                    .expect("vtable dispatch without receiver")
                    .as_ref()
                    .ok_or(Trap::NullPointer)?;
                ctx.vm.dispatch_vtable(recv, vtable_index)?
            }
        };

        if hooks.before && ctx.advising() {
            ctx.vm.advice().before_invoke(kind, receiver, target);
        }

        let mut args = vec![Value::Int(0); param_count + has_receiver as usize];
        for slot in args.iter_mut().rev() {
            *slot = ctx.frame.stack.pop();
        }

        let result = ctx.vm.call_function(target, args)?;
        debug_assert_eq!(result.map(|v| v.kind()), return_kind);

        if hooks.after && ctx.advising() {
            ctx.vm.advice().after_invoke(kind, receiver, target, result);
        }

        if let Some(value) = result {
            ctx.frame.stack.push(value);
        }
        Ok(Effect::Next)
    })
}

pub(super) fn ret(return_kind: Option<ValueKind>, unlock: bool, hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        if unlock {
            let monitor = operands.monitor().expect("unlock return without monitor");
            let object = match monitor {
                MonitorTarget::ReceiverLocal(index) => ctx.frame.local(index),
                MonitorTarget::ClassObject(class) => {
                    Value::Ref(Some(ctx.vm.heap().class_mirror(class)))
                }
            };

            if hooks.before && ctx.advising() {
                ctx.vm.advice().monitor_exit(object);
            }
            let obj = object.as_ref().ok_or(Trap::NullPointer)?;
            ctx.vm.heap().monitor_exit(obj)?;
        }

        let value = return_kind.map(|kind| {
            let value = ctx.frame.stack.pop();
            debug_assert_eq!(value.kind(), kind);
            value
        });

        if hooks.before && ctx.advising() {
            ctx.vm.advice().method_return(value);
        }

        Ok(Effect::Return(value))
    })
}

pub(super) fn method_entry(hooks: AdviceModes) -> TemplateFn {
    Box::new(move |ctx, operands| {
        let (method, receiver_local) = operands.entry();
        if hooks.after && ctx.advising() {
            let receiver = receiver_local.map(|index| ctx.frame.local(index));
            ctx.vm.advice().method_entry(method, receiver);
        }
        Ok(Effect::Next)
    })
}

/// Virtual and interface dispatch select the target through the
/// receiver's class even when the callee identity is known statically.
fn dispatch(
    ctx: &crate::vm::ExecContext<'_>,
    kind: InvokeKind,
    receiver: Option<Value>,
    target: tela_bytecode::FunctionId,
) -> Result<tela_bytecode::FunctionId, Trap> {
    match kind {
        InvokeKind::Virtual | InvokeKind::Interface => {
            let recv = receiver
                .expect("virtual dispatch without receiver")
                .as_ref()
                .ok_or(Trap::NullPointer)?;
            match ctx.vm.program().fct(target).vtable_index {
                Some(vtable_index) => ctx.vm.dispatch_vtable(recv, vtable_index),
                None => Ok(target),
            }
        }
        InvokeKind::Special | InvokeKind::Static => Ok(target),
    }
}

fn apply_binop(op: ArithOp, lhs: Value, rhs: Value) -> Result<Value, Trap> {
    let result = match (lhs, rhs) {
        (Value::Int(l), Value::Int(r)) => Value::Int(match op {
            ArithOp::Add => l.wrapping_add(r),
            ArithOp::Sub => l.wrapping_sub(r),
            ArithOp::Mul => l.wrapping_mul(r),
            ArithOp::Div => {
                if r == 0 {
                    return Err(Trap::DivisionByZero);
                }
                l.wrapping_div(r)
            }
            _ => panic!("unexpected binary operation {:?}", op),
        }),
        (Value::Long(l), Value::Long(r)) => Value::Long(match op {
            ArithOp::Add => l.wrapping_add(r),
            ArithOp::Sub => l.wrapping_sub(r),
            ArithOp::Mul => l.wrapping_mul(r),
            ArithOp::Div => {
                if r == 0 {
                    return Err(Trap::DivisionByZero);
                }
                l.wrapping_div(r)
            }
            _ => panic!("unexpected binary operation {:?}", op),
        }),
        (Value::Float(l), Value::Float(r)) => Value::Float(match op {
            ArithOp::Add => l + r,
            ArithOp::Sub => l - r,
            ArithOp::Mul => l * r,
            ArithOp::Div => l / r,
            _ => panic!("unexpected binary operation {:?}", op),
        }),
        (Value::Double(l), Value::Double(r)) => Value::Double(match op {
            ArithOp::Add => l + r,
            ArithOp::Sub => l - r,
            ArithOp::Mul => l * r,
            ArithOp::Div => l / r,
            _ => panic!("unexpected binary operation {:?}", op),
        }),
        _ => panic!("binary operation on mismatched values"),
    };

    Ok(result)
}

fn eval_int_cond(cond: IfCond, lhs: i32, rhs: i32) -> bool {
    match cond {
        IfCond::Eq => lhs == rhs,
        IfCond::Ne => lhs != rhs,
        IfCond::Lt => lhs < rhs,
        IfCond::Le => lhs <= rhs,
        IfCond::Gt => lhs > rhs,
        IfCond::Ge => lhs >= rhs,
    }
}
