//! Barrier splitting: every block containing a barrier call is split right
//! after the barrier, the barrier is erased, and the post-barrier block is
//! recorded. Splitting guarantees that each post-barrier block has exactly
//! one predecessor, reached by an unconditional branch; `validate` turns any
//! violation of the kernel terminator contract into the fatal errors of the
//! error taxonomy.

use hashbrown::HashSet;
use gridfold_ir::{NodeIndex, Procedure, Terminator};

use crate::error::{LowerError, Result};
use crate::runtime;

pub fn split(kernel: &mut Procedure) -> HashSet<NodeIndex> {
    let mut post_barrier = HashSet::new();
    while let Some((block, idx)) = next_barrier(kernel) {
        let after = kernel.split_block_before(block, idx);
        // The barrier sits at the head of the new block; erase it.
        kernel.block_mut(after).ops.remove(0);
        post_barrier.insert(after);
    }
    post_barrier
}

fn next_barrier(kernel: &Procedure) -> Option<(NodeIndex, usize)> {
    for block in kernel.body.node_indices() {
        for (idx, inst) in kernel.block(block).ops_in_order() {
            if runtime::is_barrier(&inst.operation) {
                return Some((block, idx));
            }
        }
    }
    None
}

fn terminator_kind(terminator: &Terminator) -> &'static str {
    match terminator {
        Terminator::None => "unterminated",
        Terminator::Branch { .. } => "branch",
        Terminator::CondBranch { .. } => "conditional branch",
        Terminator::Switch { .. } => "switch",
        Terminator::Return { .. } => "return",
        Terminator::IndirectBranch => "indirect branch",
        Terminator::Unwind => "unwind",
        Terminator::CleanupReturn => "cleanup return",
        Terminator::CatchReturn => "catch return",
        Terminator::CatchSwitch => "catch switch",
        Terminator::Unreachable => "unreachable",
    }
}

/// Check the preprocessed kernel against the input contract: only branches
/// and returns terminate blocks, no conditional edge reaches a post-barrier
/// block, and every post-barrier block has a single unconditional
/// predecessor.
pub fn validate(kernel: &Procedure, post_barrier: &HashSet<NodeIndex>) -> Result<()> {
    for block in kernel.body.node_indices() {
        match &kernel.block(block).terminator {
            Terminator::Branch { .. } | Terminator::Return { .. } => {}
            Terminator::CondBranch {
                then_target,
                else_target,
                ..
            } => {
                if post_barrier.contains(then_target) || post_barrier.contains(else_target) {
                    return Err(LowerError::ConditionalBarrierEdge {
                        proc: kernel.name.clone(),
                        block: block.index(),
                    });
                }
            }
            other => {
                return Err(LowerError::UnsupportedTerminator {
                    proc: kernel.name.clone(),
                    block: block.index(),
                    kind: terminator_kind(other).to_string(),
                });
            }
        }
    }
    for &block in post_barrier {
        let preds = kernel.predecessors(block);
        if preds.len() != 1 {
            return Err(LowerError::MultiplePredecessors {
                proc: kernel.name.clone(),
                block: block.index(),
            });
        }
        if !matches!(
            kernel.block(preds[0]).terminator,
            Terminator::Branch { .. }
        ) {
            return Err(LowerError::ConditionalBarrierEdge {
                proc: kernel.name.clone(),
                block: preds[0].index(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfold_ir::{ProcBuilder, Variable, symbols};

    #[test]
    fn splits_after_each_barrier_and_erases_it() {
        let mut builder = ProcBuilder::kernel("k", vec![]);
        builder.copy(Variable::i32(1));
        builder.call(symbols::BARRIER, vec![], None);
        builder.copy(Variable::i32(2));
        builder.call(symbols::BARRIER, vec![], None);
        builder.copy(Variable::i32(3));
        builder.ret(None);
        let mut kernel = builder.finish();

        let post = split(&mut kernel);
        assert_eq!(post.len(), 2);
        assert_eq!(kernel.body.node_count(), 3);
        for &block in &post {
            let preds = kernel.predecessors(block);
            assert_eq!(preds.len(), 1);
            assert!(matches!(
                kernel.block(preds[0]).terminator,
                Terminator::Branch { .. }
            ));
            // No barrier call survives.
            assert!(
                kernel
                    .block(block)
                    .ops_in_order()
                    .all(|(_, inst)| !runtime::is_barrier(&inst.operation))
            );
        }
        validate(&kernel, &post).unwrap();
    }

    #[test]
    fn rejects_switch_terminators() {
        let mut builder = ProcBuilder::kernel("k", vec![]);
        let a = builder.create_block();
        let b = builder.create_block();
        builder.switch(Variable::i32(0), a, vec![(1, b)]);
        builder.switch_to(a);
        builder.ret(None);
        builder.switch_to(b);
        builder.ret(None);
        let kernel = builder.finish();

        let err = validate(&kernel, &HashSet::new()).unwrap_err();
        assert!(matches!(err, LowerError::UnsupportedTerminator { .. }));
    }
}
