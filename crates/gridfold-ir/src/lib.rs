//! The typed, SSA-form intermediate representation that the gridfold
//! lowering operates on: modules of procedures, procedures as petgraph
//! control-flow graphs of basic blocks, φ-nodes, tagged terminators, and the
//! ambient pieces the rest of the workspace shares — a CFG builder, a
//! textual printer and a reference interpreter.

mod block;
mod builder;
mod debug;
pub mod interp;
mod item;
mod module;
mod operation;
mod procedure;
pub mod symbols;
mod variable;

pub use block::*;
pub use builder::*;
pub use item::*;
pub use module::*;
pub use operation::*;
pub use procedure::*;
pub use variable::*;

pub use petgraph::graph::NodeIndex;
