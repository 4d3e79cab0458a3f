use crate::program::{ClassId, FunctionId, Program};

/// Returns the display name of a function, e.g. `Point::move` for an
/// instance method or a bare `main` for a free function.
pub fn display_fct(prog: &Program, fct_id: FunctionId) -> String {
    let fct = prog.fct(fct_id);

    match fct.holder {
        Some(class_id) => {
            let class = prog.class(class_id);
            format!("{}::{}", class.name, fct.name)
        }
        None => fct.name.clone(),
    }
}

pub fn display_field(prog: &Program, class_id: ClassId, index: u32, is_static: bool) -> String {
    let class = prog.class(class_id);
    let fields = if is_static {
        &class.static_fields
    } else {
        &class.fields
    };

    match fields.get(index as usize) {
        Some(field) => format!("{}.{}", class.name, field.name),
        None => format!("{}.<field {}>", class.name, index),
    }
}
