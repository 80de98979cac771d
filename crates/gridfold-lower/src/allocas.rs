//! Stack allocations whose lifetime can cross a barrier are rewritten into
//! heap allocations: each subkernel becomes a separate procedure with its own
//! frame, so a stack slot would die at the first barrier. Deallocation goes
//! to the lifetime-end marker when one exists, otherwise before every return.

use hashbrown::HashSet;
use gridfold_ir::{InstId, NodeIndex, Operation, Procedure, Terminator, Type, Variable};

struct AllocaSite {
    block: NodeIndex,
    idx: usize,
    id: InstId,
    elem: Type,
}

pub fn lower(kernel: &mut Procedure, post_barrier: &HashSet<NodeIndex>) {
    // Without barriers every frame lives for the whole kernel; nothing to do.
    if post_barrier.is_empty() {
        return;
    }

    let sites: Vec<AllocaSite> = kernel
        .body
        .node_indices()
        .flat_map(|block| {
            kernel
                .block(block)
                .ops_in_order()
                .filter_map(move |(idx, inst)| match &inst.operation {
                    Operation::StackAlloc { elem, .. } => Some(AllocaSite {
                        block,
                        idx,
                        id: inst.id,
                        elem: elem.clone(),
                    }),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .collect();

    for site in sites {
        let Operation::StackAlloc { elem, count } =
            kernel.block(site.block).ops[site.idx].operation.clone()
        else {
            unreachable!("alloca site moved");
        };
        kernel.block_mut(site.block).ops[site.idx].operation =
            Operation::HeapAlloc { elem, count };

        let ptr = Variable::inst(site.id, site.elem.clone().ptr_to());
        let mut saw_lifetime_end = false;
        for block in kernel.node_ids() {
            let indices: Vec<usize> = kernel.block(block).ops.indices().collect();
            for idx in indices {
                enum Marker {
                    None,
                    Start,
                    End,
                }
                let marker = match &kernel.block(block).ops[idx].operation {
                    Operation::LifetimeStart { ptr: marked } if marked.as_inst() == Some(site.id) => {
                        Marker::Start
                    }
                    Operation::LifetimeEnd { ptr: marked } if marked.as_inst() == Some(site.id) => {
                        Marker::End
                    }
                    _ => Marker::None,
                };
                match marker {
                    Marker::Start => {
                        kernel.block_mut(block).ops.remove(idx);
                    }
                    Marker::End => {
                        saw_lifetime_end = true;
                        kernel.block_mut(block).ops[idx].operation =
                            Operation::HeapFree { ptr: ptr.clone() };
                    }
                    Marker::None => {}
                }
            }
        }

        if !saw_lifetime_end {
            for block in kernel.node_ids() {
                if matches!(kernel.block(block).terminator, Terminator::Return { .. }) {
                    kernel.push_inst(
                        block,
                        Operation::HeapFree { ptr: ptr.clone() },
                        None,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfold_ir::{ElemType, NodeIndex, ProcBuilder, Variable};

    fn f32_ty() -> Type {
        Type::Scalar(ElemType::F32)
    }

    #[test]
    fn no_barriers_means_no_change() {
        let mut builder = ProcBuilder::kernel("k", vec![]);
        builder.stack_alloc(f32_ty(), Variable::u32(4));
        builder.ret(None);
        let mut kernel = builder.finish();

        lower(&mut kernel, &HashSet::new());
        assert!(kernel.block(kernel.entry).ops_in_order().any(|(_, inst)| {
            matches!(inst.operation, Operation::StackAlloc { .. })
        }));
    }

    #[test]
    fn heapifies_and_frees_at_returns() {
        let mut builder = ProcBuilder::kernel("k", vec![]);
        builder.stack_alloc(f32_ty(), Variable::u32(4));
        builder.ret(None);
        let mut kernel = builder.finish();

        let fake_post: HashSet<NodeIndex> = [kernel.entry].into_iter().collect();
        lower(&mut kernel, &fake_post);

        let ops: Vec<_> = kernel
            .block(kernel.entry)
            .ops_in_order()
            .map(|(_, inst)| inst.operation.clone())
            .collect();
        assert!(matches!(ops[0], Operation::HeapAlloc { .. }));
        assert!(matches!(ops[1], Operation::HeapFree { .. }));
    }

    #[test]
    fn lifetime_markers_drive_the_free() {
        let mut builder = ProcBuilder::kernel("k", vec![]);
        let ptr = builder.stack_alloc(f32_ty(), Variable::u32(1));
        builder.push(
            Operation::LifetimeStart { ptr: ptr.clone() },
            None,
        );
        builder.push(Operation::LifetimeEnd { ptr: ptr.clone() }, None);
        builder.copy(Variable::i32(0));
        builder.ret(None);
        let mut kernel = builder.finish();

        let fake_post: HashSet<NodeIndex> = [kernel.entry].into_iter().collect();
        lower(&mut kernel, &fake_post);

        let ops: Vec<_> = kernel
            .block(kernel.entry)
            .ops_in_order()
            .map(|(_, inst)| inst.operation.clone())
            .collect();
        // start erased, end became the free, nothing added at the return.
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], Operation::HeapAlloc { .. }));
        assert!(matches!(ops[1], Operation::HeapFree { .. }));
        assert!(matches!(ops[2], Operation::Copy(_)));
    }
}
