pub mod data;
pub mod display;
pub mod program;
pub mod reader;
pub mod writer;


pub use data::*;
pub use display::{display_fct, display_field};
pub use program::{
    ClassData, ClassId, FieldData, FunctionData, FunctionId, Program, ProgramBuilder,
};
pub use reader::{BytecodeReader, ReadError};
pub use writer::{BytecodeWriter, Label};
