use hashbrown::HashMap;
use petgraph::{Direction, graph::NodeIndex, stable_graph::StableDiGraph, visit::EdgeRef};
use stable_vec::StableVec;

use crate::{Instruction, InstId, Operation, Terminator, Type, Variable};

use super::BasicBlock;

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Where an SSA value is defined inside its block. φ-nodes precede all
/// ordinary instructions, which precede the terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefPos {
    Phi(usize),
    Op(usize),
}

impl DefPos {
    /// Rank comparable across φ and op positions within one block.
    pub fn rank(&self) -> (u8, usize) {
        match self {
            DefPos::Phi(idx) => (0, *idx),
            DefPos::Op(idx) => (1, *idx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefSite {
    pub block: NodeIndex,
    pub pos: DefPos,
}

/// A procedure: parameters plus a control-flow graph of basic blocks. Graph
/// edges always mirror terminator successors. Cloning a procedure preserves
/// every `NodeIndex` and instruction id, so clones are addressed by the same
/// handles as the original.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub name: String,
    pub params: Vec<Param>,
    pub ret_ty: Option<Type>,
    pub body: StableDiGraph<BasicBlock, ()>,
    pub entry: NodeIndex,
    /// Marks a kernel entry to be lowered.
    pub kernel_entry: bool,
    /// Marks a procedure without observable side effects; consulted by the
    /// rematerialisation analysis.
    pub pure: bool,
    /// A declaration has no body.
    pub declaration: bool,
    next_inst_id: u32,
}

impl Procedure {
    pub fn new(name: impl Into<String>, params: Vec<Param>, ret_ty: Option<Type>) -> Self {
        let mut body = StableDiGraph::default();
        let entry = body.add_node(BasicBlock::default());
        Self {
            name: name.into(),
            params,
            ret_ty,
            body,
            entry,
            kernel_entry: false,
            pure: false,
            declaration: false,
            next_inst_id: 0,
        }
    }

    pub fn declaration(name: impl Into<String>, params: Vec<Param>, ret_ty: Option<Type>) -> Self {
        Self {
            name: name.into(),
            params,
            ret_ty,
            body: StableDiGraph::default(),
            entry: NodeIndex::end(),
            kernel_entry: false,
            pure: false,
            declaration: true,
            next_inst_id: 0,
        }
    }

    pub fn block(&self, block: NodeIndex) -> &BasicBlock {
        &self.body[block]
    }

    pub fn block_mut(&mut self, block: NodeIndex) -> &mut BasicBlock {
        &mut self.body[block]
    }

    pub fn node_ids(&self) -> Vec<NodeIndex> {
        self.body.node_indices().collect()
    }

    pub fn predecessors(&self, block: NodeIndex) -> Vec<NodeIndex> {
        let mut preds: Vec<_> = self
            .body
            .neighbors_directed(block, Direction::Incoming)
            .collect();
        preds.sort_unstable();
        preds.dedup();
        preds
    }

    pub fn successors(&self, block: NodeIndex) -> Vec<NodeIndex> {
        let mut succs: Vec<_> = self
            .body
            .neighbors_directed(block, Direction::Outgoing)
            .collect();
        succs.sort_unstable();
        succs.dedup();
        succs
    }

    pub fn add_block(&mut self) -> NodeIndex {
        self.body.add_node(BasicBlock::default())
    }

    pub fn new_inst_id(&mut self) -> InstId {
        let id = InstId(self.next_inst_id);
        self.next_inst_id += 1;
        id
    }

    /// Append an instruction to a block, returning its result when it has one.
    pub fn push_inst(
        &mut self,
        block: NodeIndex,
        operation: Operation,
        out_ty: Option<Type>,
    ) -> Option<Variable> {
        let id = self.new_inst_id();
        let inst = Instruction::new(id, operation, out_ty);
        let out = inst.out_var();
        self.body[block].ops.push(inst);
        out
    }

    /// Replace a block's terminator and re-derive its outgoing edges.
    pub fn set_terminator(&mut self, block: NodeIndex, terminator: Terminator) {
        let outgoing: Vec<_> = self
            .body
            .edges_directed(block, Direction::Outgoing)
            .map(|edge| edge.id())
            .collect();
        for edge in outgoing {
            self.body.remove_edge(edge);
        }
        for successor in terminator.successors() {
            self.body.add_edge(block, successor, ());
        }
        self.body[block].terminator = terminator;
    }

    pub fn param_var(&self, index: u16) -> Variable {
        Variable::param(index, self.params[index as usize].ty.clone())
    }

    /// Visit every operand slot of the procedure: φ incoming values,
    /// instruction operands and terminator operands. Definitions (φ outs,
    /// instruction results) are not visited.
    pub fn visit_operands(&mut self, mut visit: impl FnMut(&mut Variable)) {
        for block in self.node_ids() {
            let bb = &mut self.body[block];
            for phi in &mut bb.phi_nodes {
                for entry in &mut phi.entries {
                    visit(&mut entry.value);
                }
            }
            for idx in bb.ops.indices().collect::<Vec<_>>() {
                bb.ops[idx].operation.visit_operands(&mut visit);
            }
            bb.terminator.visit_operands(&mut visit);
        }
    }

    /// Replace every use of the value `id` with `new`.
    pub fn replace_uses(&mut self, id: InstId, new: &Variable) {
        self.visit_operands(|var| {
            if var.as_inst() == Some(id) {
                *var = new.clone();
            }
        });
    }

    /// Definition sites of every φ-node and instruction result.
    pub fn def_sites(&self) -> HashMap<InstId, DefSite> {
        let mut sites = HashMap::new();
        for block in self.body.node_indices() {
            let bb = &self.body[block];
            for (idx, phi) in bb.phi_nodes.iter().enumerate() {
                if let Some(id) = phi.out.as_inst() {
                    sites.insert(
                        id,
                        DefSite {
                            block,
                            pos: DefPos::Phi(idx),
                        },
                    );
                }
            }
            for (idx, inst) in bb.ops_in_order() {
                if inst.out_ty.is_some() {
                    sites.insert(
                        inst.id,
                        DefSite {
                            block,
                            pos: DefPos::Op(idx),
                        },
                    );
                }
            }
        }
        sites
    }

    /// Rebuild a block's instruction list from a plain vector, renumbering
    /// the stable indices from zero.
    pub fn rebuild_ops(&mut self, block: NodeIndex, ops: Vec<Instruction>) {
        self.body[block].ops = StableVec::from_iter(ops);
    }

    /// Split `block` after the instruction at stable index `op_idx`. The
    /// trailing instructions and the terminator move to a fresh block; the
    /// original block falls through with an unconditional branch. φ entries
    /// in former successors are retargeted at the new block.
    pub fn split_block_after(&mut self, block: NodeIndex, op_idx: usize) -> NodeIndex {
        self.split_block_before(block, op_idx + 1)
    }

    /// Split `block` before the instruction at stable index `op_idx`: that
    /// instruction and everything after it move to the fresh block.
    pub fn split_block_before(&mut self, block: NodeIndex, op_idx: usize) -> NodeIndex {
        let successors = self.successors(block);
        let ordered: Vec<usize> = self.body[block].ops.indices().collect();
        let keep: Vec<Instruction> = ordered
            .iter()
            .take_while(|idx| **idx < op_idx)
            .map(|idx| self.body[block].ops[*idx].clone())
            .collect();
        let moved: Vec<Instruction> = ordered
            .iter()
            .skip_while(|idx| **idx < op_idx)
            .map(|idx| self.body[block].ops[*idx].clone())
            .collect();

        let terminator = core::mem::take(&mut self.body[block].terminator);
        self.rebuild_ops(block, keep);

        let new_block = self.add_block();
        self.rebuild_ops(new_block, moved);
        self.set_terminator(new_block, terminator);
        self.set_terminator(block, Terminator::Branch { target: new_block });

        for successor in successors {
            for phi in &mut self.body[successor].phi_nodes {
                for entry in &mut phi.entries {
                    if entry.block == block {
                        entry.block = new_block;
                    }
                }
            }
        }
        new_block
    }

    /// Blocks reachable from the entry.
    pub fn reachable_blocks(&self) -> Vec<NodeIndex> {
        if self.declaration {
            return Vec::new();
        }
        let mut visited = vec![self.entry];
        let mut queue = vec![self.entry];
        while let Some(block) = queue.pop() {
            for succ in self.successors(block) {
                if !visited.contains(&succ) {
                    visited.push(succ);
                    queue.push(succ);
                }
            }
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElemType, Operation, Variable};

    fn scalar() -> Type {
        Type::Scalar(ElemType::I32)
    }

    #[test]
    fn split_moves_trailing_ops_and_terminator() {
        let mut proc = Procedure::new("p", vec![], None);
        let entry = proc.entry;
        let a = proc
            .push_inst(entry, Operation::Copy(Variable::i32(1)), Some(scalar()))
            .unwrap();
        let _b = proc
            .push_inst(
                entry,
                Operation::Copy(a.clone()),
                Some(scalar()),
            )
            .unwrap();
        proc.set_terminator(entry, Terminator::Return { value: None });

        let tail = proc.split_block_after(entry, 0);
        assert_eq!(proc.block(entry).ops.num_elements(), 1);
        assert_eq!(proc.block(tail).ops.num_elements(), 1);
        assert_eq!(
            proc.block(entry).terminator,
            Terminator::Branch { target: tail }
        );
        assert_eq!(
            proc.block(tail).terminator,
            Terminator::Return { value: None }
        );
        assert_eq!(proc.successors(entry), vec![tail]);
    }

    #[test]
    fn set_terminator_keeps_edges_in_sync() {
        let mut proc = Procedure::new("p", vec![], None);
        let entry = proc.entry;
        let then_target = proc.add_block();
        let else_target = proc.add_block();
        proc.set_terminator(
            entry,
            Terminator::CondBranch {
                cond: Variable::bool(true),
                then_target,
                else_target,
            },
        );
        assert_eq!(proc.successors(entry), vec![then_target, else_target]);

        proc.set_terminator(entry, Terminator::Branch { target: else_target });
        assert_eq!(proc.successors(entry), vec![else_target]);
        assert_eq!(proc.predecessors(then_target), vec![]);
    }
}
