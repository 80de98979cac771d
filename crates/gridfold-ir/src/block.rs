use petgraph::graph::NodeIndex;
use smallvec::SmallVec;
use stable_vec::StableVec;

use crate::{Instruction, Variable};

/// One incoming value of a φ-node.
#[derive(Debug, Clone, PartialEq)]
pub struct PhiEntry {
    pub block: NodeIndex,
    pub value: Variable,
}

/// A φ-node. `out` is always an [`Inst`](crate::VariableKind::Inst) variable;
/// φ-nodes share the instruction id space of their procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct PhiInstruction {
    pub out: Variable,
    pub entries: Vec<PhiEntry>,
}

/// Control flow that terminates a block. Only branches and returns may occur
/// inside kernels handed to the lowering; the remaining variants exist so the
/// input contract can express them and the pass can reject them explicitly.
#[derive(Default, Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Unterminated. Only legal while a block is under construction.
    #[default]
    None,
    Branch {
        target: NodeIndex,
    },
    CondBranch {
        cond: Variable,
        then_target: NodeIndex,
        else_target: NodeIndex,
    },
    Switch {
        value: Variable,
        default: NodeIndex,
        cases: Vec<(i64, NodeIndex)>,
    },
    Return {
        value: Option<Variable>,
    },
    IndirectBranch,
    Unwind,
    CleanupReturn,
    CatchReturn,
    CatchSwitch,
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> SmallVec<[NodeIndex; 2]> {
        let mut out: SmallVec<[NodeIndex; 2]> = SmallVec::new();
        match self {
            Terminator::Branch { target } => out.push(*target),
            Terminator::CondBranch {
                then_target,
                else_target,
                ..
            } => {
                out.push(*then_target);
                out.push(*else_target);
            }
            Terminator::Switch { default, cases, .. } => {
                out.push(*default);
                out.extend(cases.iter().map(|(_, target)| *target));
            }
            _ => {}
        }
        out
    }

    /// Rewrite every successor equal to `from` into `to`.
    pub fn retarget(&mut self, from: NodeIndex, to: NodeIndex) {
        let update = |id: &mut NodeIndex| {
            if *id == from {
                *id = to;
            }
        };
        match self {
            Terminator::Branch { target } => update(target),
            Terminator::CondBranch {
                then_target,
                else_target,
                ..
            } => {
                update(then_target);
                update(else_target);
            }
            Terminator::Switch { default, cases, .. } => {
                update(default);
                for (_, target) in cases {
                    update(target);
                }
            }
            _ => {}
        }
    }

    pub fn visit_operands(&mut self, mut visit: impl FnMut(&mut Variable)) {
        match self {
            Terminator::CondBranch { cond, .. } => visit(cond),
            Terminator::Switch { value, .. } => visit(value),
            Terminator::Return { value: Some(value) } => visit(value),
            _ => {}
        }
    }

    pub fn operands(&self) -> Option<&Variable> {
        match self {
            Terminator::CondBranch { cond, .. } => Some(cond),
            Terminator::Switch { value, .. } => Some(value),
            Terminator::Return { value } => value.as_ref(),
            _ => None,
        }
    }
}

/// A basic block: φ-nodes, then ordinary instructions, then a terminator.
/// Instruction order within `ops` is execution order; `StableVec` keeps
/// indices stable under removal.
#[derive(Default, Debug, Clone)]
pub struct BasicBlock {
    pub phi_nodes: Vec<PhiInstruction>,
    pub ops: StableVec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn ops_in_order(&self) -> impl Iterator<Item = (usize, &Instruction)> {
        self.ops.indices().map(|idx| (idx, &self.ops[idx]))
    }
}
