use std::sync::Arc;

use fixedbitset::FixedBitSet;

use tela_bytecode::{InvokeKind, ValueKind};

use crate::advice::{ArithOp, StackOp};
use crate::policy::AdviceModes;
use crate::vm::code::{Effect, Operands};
use crate::vm::{ExecContext, Trap};

mod ops;
pub mod tag;

pub use tag::{InvokeState, TemplateTag};

pub type TemplateFn =
    Box<dyn Fn(&mut ExecContext<'_>, &Operands) -> Result<Effect, Trap> + Send + Sync>;

/// One pre-expanded code fragment: the instruction effect for a tag,
/// optionally interleaved with advice calls. Built once per store,
/// immutable and shared read-only across all compilations.
pub struct Template {
    tag: TemplateTag,
    hooks: AdviceModes,
    body: TemplateFn,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("tag", &self.tag)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Template {
    fn new(tag: TemplateTag, hooks: AdviceModes, body: TemplateFn) -> Template {
        Template { tag, hooks, body }
    }

    pub fn tag(&self) -> TemplateTag {
        self.tag
    }

    /// The advice hooks this body actually invokes. May be narrower
    /// than the table the template sits in when the tag is not capable
    /// of a requested hook.
    pub fn hooks(&self) -> AdviceModes {
        self.hooks
    }

    pub fn run(&self, ctx: &mut ExecContext<'_>, operands: &Operands) -> Result<Effect, Trap> {
        (self.body)(ctx, operands)
    }
}

/// One template per tag ordinal.
pub struct TemplateTable {
    slots: Vec<Option<Arc<Template>>>,
}

impl TemplateTable {
    fn new() -> TemplateTable {
        TemplateTable {
            slots: (0..TemplateTag::COUNT).map(|_| None).collect(),
        }
    }

    fn set(&mut self, tag: TemplateTag, template: Arc<Template>) {
        assert!(
            self.slots[tag.to_usize()].is_none(),
            "template for {:?} registered twice",
            tag
        );
        self.slots[tag.to_usize()] = Some(template);
    }

    pub fn get(&self, tag: TemplateTag) -> Option<&Arc<Template>> {
        self.slots[tag.to_usize()].as_ref()
    }

    /// Removes a template, leaving a hole. Used by tests exercising the
    /// incomplete-store fault path.
    #[cfg(test)]
    pub fn clear(&mut self, tag: TemplateTag) {
        self.slots[tag.to_usize()] = None;
    }
}

/// The four variant tables, built once per VM. Slots of an
/// instrumented table whose tag cannot carry the requested hooks alias
/// the plain template, so every tag is present in all four tables.
pub struct TemplateStore {
    pub plain: TemplateTable,
    pub before_only: TemplateTable,
    pub after_only: TemplateTable,
    pub before_and_after: TemplateTable,

    before_capable: FixedBitSet,
    after_capable: FixedBitSet,
}

impl TemplateStore {
    pub fn build() -> TemplateStore {
        let mut builder = StoreBuilder::new();
        register_templates(&mut builder);
        builder.finish()
    }

    /// The variant-selection truth table: maps an opcode's policy pair
    /// to one of the four tables.
    pub fn select(&self, modes: AdviceModes) -> &TemplateTable {
        match (modes.before, modes.after) {
            (false, false) => &self.plain,
            (true, false) => &self.before_only,
            (false, true) => &self.after_only,
            (true, true) => &self.before_and_after,
        }
    }

    pub fn default_table(&self) -> &TemplateTable {
        &self.plain
    }

    pub fn is_default(&self, table: &TemplateTable) -> bool {
        std::ptr::eq(table, &self.plain)
    }

    pub fn before_capable(&self, tag: TemplateTag) -> bool {
        self.before_capable.contains(tag.to_usize())
    }

    pub fn after_capable(&self, tag: TemplateTag) -> bool {
        self.after_capable.contains(tag.to_usize())
    }
}

struct StoreBuilder {
    plain: TemplateTable,
    before_only: TemplateTable,
    after_only: TemplateTable,
    before_and_after: TemplateTable,
    before_capable: FixedBitSet,
    after_capable: FixedBitSet,
}

impl StoreBuilder {
    fn new() -> StoreBuilder {
        StoreBuilder {
            plain: TemplateTable::new(),
            before_only: TemplateTable::new(),
            after_only: TemplateTable::new(),
            before_and_after: TemplateTable::new(),
            before_capable: FixedBitSet::with_capacity(TemplateTag::COUNT),
            after_capable: FixedBitSet::with_capacity(TemplateTag::COUNT),
        }
    }

    /// Registers one tag: the plain body plus one body per instrumented
    /// table, restricted to the hooks the tag is capable of. A table
    /// whose restricted hook set is empty shares the plain template.
    fn add(&mut self, tag: TemplateTag, caps: AdviceModes, factory: &dyn Fn(AdviceModes) -> TemplateFn) {
        let plain = Arc::new(Template::new(tag, AdviceModes::NONE, factory(AdviceModes::NONE)));
        self.plain.set(tag, plain.clone());

        if caps.before {
            self.before_capable.insert(tag.to_usize());
        }
        if caps.after {
            self.after_capable.insert(tag.to_usize());
        }

        let tables = [
            (&mut self.before_only, AdviceModes::BEFORE),
            (&mut self.after_only, AdviceModes::AFTER),
            (&mut self.before_and_after, AdviceModes::BOTH),
        ];

        for (table, modes) in tables {
            let effective = modes.intersect(caps);
            if effective.any() {
                table.set(tag, Arc::new(Template::new(tag, effective, factory(effective))));
            } else {
                table.set(tag, plain.clone());
            }
        }
    }

    fn finish(self) -> TemplateStore {
        let store = TemplateStore {
            plain: self.plain,
            before_only: self.before_only,
            after_only: self.after_only,
            before_and_after: self.before_and_after,
            before_capable: self.before_capable,
            after_capable: self.after_capable,
        };

        for tag in TemplateTag::all() {
            assert!(store.plain.get(tag).is_some(), "missing template for {:?}", tag);
        }

        store
    }
}

const RETURN_KINDS: [Option<ValueKind>; 6] = [
    None,
    Some(ValueKind::Int),
    Some(ValueKind::Long),
    Some(ValueKind::Float),
    Some(ValueKind::Double),
    Some(ValueKind::Ref),
];

/// The advice capability of each tag family is declared here alongside
/// its body: "before" for nearly everything, "after" only for
/// allocations, invokes and method entry. This table is fixed by the
/// advice surface, not derived from the policy.
fn register_templates(b: &mut StoreBuilder) {
    use AdviceModes as M;

    for kind in ValueKind::ALL {
        b.add(TemplateTag::const_load(kind), M::BEFORE, &|h| {
            ops::const_load(kind, h)
        });
        b.add(TemplateTag::load(kind), M::BEFORE, &|h| ops::local_load(kind, h));
        b.add(TemplateTag::store(kind), M::BEFORE, &|h| {
            ops::local_store(kind, h)
        });

        for resolved in [false, true] {
            b.add(TemplateTag::get_field(kind, resolved), M::BEFORE, &|h| {
                ops::get_field(kind, resolved, h)
            });
            b.add(TemplateTag::put_field(kind, resolved), M::BEFORE, &|h| {
                ops::put_field(kind, resolved, h)
            });
            b.add(TemplateTag::get_static(kind, resolved), M::BEFORE, &|h| {
                ops::get_static(kind, resolved, h)
            });
            b.add(TemplateTag::put_static(kind, resolved), M::BEFORE, &|h| {
                ops::put_static(kind, resolved, h)
            });
        }

        b.add(TemplateTag::array_load(kind), M::BEFORE, &|h| {
            ops::array_load(kind, h)
        });
        b.add(TemplateTag::array_store(kind), M::BEFORE, &|h| {
            ops::array_store(kind, h)
        });
    }

    for (tag, op) in [
        (TemplateTag::Pop, StackOp::Pop),
        (TemplateTag::Pop2, StackOp::Pop2),
        (TemplateTag::Dup, StackOp::Dup),
        (TemplateTag::DupX1, StackOp::DupX1),
        (TemplateTag::Swap, StackOp::Swap),
    ] {
        b.add(tag, M::BEFORE, &|h| ops::stack_shuffle(op, h));
    }

    for kind in [
        ValueKind::Int,
        ValueKind::Long,
        ValueKind::Float,
        ValueKind::Double,
    ] {
        for op in [ArithOp::Add, ArithOp::Sub, ArithOp::Mul, ArithOp::Div] {
            b.add(TemplateTag::arith(op, kind), M::BEFORE, &|h| {
                ops::arith(op, kind, h)
            });
        }
        b.add(TemplateTag::arith(ArithOp::Neg, kind), M::BEFORE, &|h| {
            ops::neg(kind, h)
        });
    }

    for kind in [ValueKind::Long, ValueKind::Float, ValueKind::Double] {
        b.add(TemplateTag::cmp(kind), M::BEFORE, &|h| ops::cmp(kind, h));
    }

    b.add(TemplateTag::If, M::BEFORE, &|h| ops::if_zero(h));
    b.add(TemplateTag::IfCmp, M::BEFORE, &|h| ops::if_cmp(h));
    b.add(TemplateTag::IfRefCmp, M::BEFORE, &|h| ops::if_ref_cmp(h));
    b.add(TemplateTag::IfNull, M::BEFORE, &|h| ops::if_null(h));
    b.add(TemplateTag::Goto, M::BEFORE, &|h| ops::goto(h));

    b.add(TemplateTag::ArrayLength, M::BEFORE, &|h| ops::array_length(h));

    b.add(TemplateTag::New, M::AFTER, &|h| ops::new_instance(false, h));
    b.add(TemplateTag::NewInit, M::AFTER, &|h| ops::new_instance(true, h));
    b.add(TemplateTag::NewArray, M::AFTER, &|h| ops::new_array(h));

    for resolved in [false, true] {
        b.add(TemplateTag::check_cast(resolved), M::BEFORE, &|h| {
            ops::check_cast(resolved, h)
        });
        b.add(TemplateTag::instance_of(resolved), M::BEFORE, &|h| {
            ops::instance_of(resolved, h)
        });
    }

    b.add(TemplateTag::MonitorEnter, M::BEFORE, &|h| ops::monitor_enter(h));
    b.add(TemplateTag::MonitorExit, M::BEFORE, &|h| ops::monitor_exit(h));
    b.add(TemplateTag::Throw, M::BEFORE, &|h| ops::throw_value(h));

    for return_kind in RETURN_KINDS {
        for (invoke_kind, states) in [
            (
                InvokeKind::Virtual,
                &[
                    InvokeState::Unresolved,
                    InvokeState::Resolved,
                    InvokeState::Instrumented,
                ][..],
            ),
            (
                InvokeKind::Interface,
                &[
                    InvokeState::Unresolved,
                    InvokeState::Resolved,
                    InvokeState::Instrumented,
                ][..],
            ),
            (
                InvokeKind::Special,
                &[InvokeState::Unresolved, InvokeState::Resolved][..],
            ),
            (
                InvokeKind::Static,
                &[InvokeState::Unresolved, InvokeState::Resolved][..],
            ),
        ] {
            for &state in states {
                b.add(
                    TemplateTag::invoke(invoke_kind, return_kind, state),
                    M::BOTH,
                    &|h| ops::invoke(invoke_kind, return_kind, h),
                );
            }
        }

        for unlock in [false, true] {
            b.add(TemplateTag::ret(return_kind, unlock), M::BEFORE, &|h| {
                ops::ret(return_kind, unlock, h)
            });
        }
    }

    b.add(TemplateTag::MethodEntry, M::AFTER, &|h| ops::method_entry(h));
}
