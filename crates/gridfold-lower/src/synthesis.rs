//! Subkernel synthesis: turn one barrier-free region of a preprocessed
//! kernel into a standalone procedure. The clone keeps the kernel's block
//! indices and value ids, so the preserved-record layout and the dominance
//! information computed on the kernel apply to the clone unchanged.
//!
//! Signature of the result:
//! `(from_bb_id, preserved, static_shared, dyn_shared, original-params…) ->
//! (from_bb_id, next_subkernel_id)`.

use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};
use gridfold_ir::{
    DefPos, ElemType, InstId, Instruction, Module, NodeIndex, Operation, Param, PhiEntry,
    Procedure, StructId, Terminator, Type, Variable, VariableKind,
};

use crate::analyses::UseSite;
use crate::analyses::live_across::{LiveAcross, remat_tree};
use crate::error::{LowerError, Result};
use crate::preserved::{PreservedLayout, PreservedValue, SharedLayout};
use crate::subkernels::{SubkernelId, Subkernels};

const EXTRA_PARAMS: u16 = 4;

fn i32_ty() -> Type {
    Type::Scalar(ElemType::I32)
}

pub fn subkernel_name(original: &str, sk: SubkernelId) -> String {
    format!("{original}.subkernel.{sk}")
}

pub fn synthesize(
    module: &mut Module,
    kernel: &Procedure,
    original_name: &str,
    post_barrier: &HashSet<NodeIndex>,
    subs: &Subkernels,
    live: &LiveAcross,
    preserved: &PreservedLayout,
    shared: &SharedLayout,
    pair_struct: StructId,
    sk: SubkernelId,
) -> Result<String> {
    let sub = &subs.list[sk];
    let def_sites = kernel.def_sites();
    let mut n = kernel.clone();

    // New signature; original parameter reads shift by the four leading ones.
    let mut params = vec![
        Param::new("from_bb_id", i32_ty()),
        Param::new(
            "preserved_data",
            Type::Struct(preserved.struct_id).ptr_to(),
        ),
        Param::new(
            "static_shared_data",
            Type::Struct(shared.struct_id).ptr_to(),
        ),
        Param::new(
            "dynamic_shared_data",
            Type::Scalar(ElemType::U8).ptr_to(),
        ),
    ];
    params.extend(kernel.params.iter().cloned());
    n.params = params;
    n.visit_operands(|var| {
        if let VariableKind::Param(index) = var.kind {
            var.kind = VariableKind::Param(index + EXTRA_PARAMS);
        }
    });
    let preserved_param = n.param_var(1);
    let shared_param = n.param_var(2);
    let dyn_param = n.param_var(3);

    // Synthetic entry: shared-record addresses, the dynamic-shared cast,
    // rematerialised expressions, then the preserved-record loads.
    let entry_block = n.add_block();
    let mut entry_ops: Vec<Instruction> = Vec::new();
    let mut global_map: HashMap<String, Variable> = HashMap::new();

    for name in &shared.statics {
        let field = shared.index_of[name];
        let pointee = module.global(name).expect("collected shared global").ty.clone();
        let id = n.new_inst_id();
        entry_ops.push(Instruction::new(
            id,
            Operation::FieldAddr {
                base: shared_param.clone(),
                field,
            },
            Some(pointee.clone().ptr_to()),
        ));
        global_map.insert(name.clone(), Variable::inst(id, pointee.ptr_to()));
    }
    if let Some(name) = &shared.dynamic {
        let pointee = module.global(name).expect("dynamic shared global").ty.clone();
        let id = n.new_inst_id();
        entry_ops.push(Instruction::new(
            id,
            Operation::Cast {
                value: dyn_param.clone(),
                to: pointee.clone().ptr_to(),
            },
            Some(pointee.clone().ptr_to()),
        ));
        global_map.insert(name.clone(), Variable::inst(id, pointee.ptr_to()));
    }

    // Rematerialised values: clone the expression tree into the entry.
    let mut replacement: HashMap<InstId, Variable> = HashMap::new();
    let mut remat_map: HashMap<InstId, Variable> = HashMap::new();
    for &id in &live.remat[sk] {
        for tree_id in remat_tree(kernel, &def_sites, id) {
            if remat_map.contains_key(&tree_id) {
                continue;
            }
            let def = def_sites[&tree_id];
            let DefPos::Op(idx) = def.pos else {
                unreachable!("rematerialised values never come from φ-nodes");
            };
            let src = kernel.block(def.block).ops[idx].clone();
            let mut operation = src.operation;
            operation.visit_operands(|var| {
                if let Some(op_id) = var.as_inst() {
                    *var = remat_map[&op_id].clone();
                } else if let Some(index) = var.as_param() {
                    var.kind = VariableKind::Param(index + EXTRA_PARAMS);
                }
            });
            let new_id = n.new_inst_id();
            let out_ty = src.out_ty.expect("rematerialised values have results");
            entry_ops.push(Instruction::new(new_id, operation, Some(out_ty.clone())));
            remat_map.insert(tree_id, Variable::inst(new_id, out_ty));
        }
        replacement.insert(id, remat_map[&id].clone());
    }

    // Preserved loads, in record order.
    let mut live_sorted = live.live_in[sk].clone();
    live_sorted.sort_by_key(|id| preserved.index_of(*id));
    for id in live_sorted {
        let field = preserved
            .index_of(id)
            .ok_or_else(|| LowerError::PreservedIndexMismatch {
                proc: kernel.name.clone(),
            })?;
        let ty = preserved.fields[field as usize].1.clone();
        let addr_id = n.new_inst_id();
        entry_ops.push(Instruction::new(
            addr_id,
            Operation::FieldAddr {
                base: preserved_param.clone(),
                field,
            },
            Some(ty.clone().ptr_to()),
        ));
        let load_id = n.new_inst_id();
        entry_ops.push(Instruction::new(
            load_id,
            Operation::Load {
                addr: Variable::inst(addr_id, ty.clone().ptr_to()),
            },
            Some(ty.clone()),
        ));
        replacement.insert(id, Variable::inst(load_id, ty));
    }
    n.rebuild_ops(entry_block, entry_ops);

    // Shared-global uses now go through the record addresses.
    if !global_map.is_empty() {
        n.visit_operands(|var| {
            let new = var.as_global().and_then(|name| global_map.get(name)).cloned();
            if let Some(new) = new {
                *var = new;
            }
        });
    }

    // Replace uses of live-in and rematerialised values, except where the
    // original definition already dominates the use in this region's cut
    // CFG (a value may dominate some uses and not others, e.g. through a
    // φ on a back edge).
    let dom = &live.doms[sk];
    for &block in &sub.blocks {
        let mut bb = std::mem::take(n.block_mut(block));
        for phi in &mut bb.phi_nodes {
            for entry in &mut phi.entries {
                rewrite_use(
                    &mut entry.value,
                    UseSite::PhiIncoming { pred: entry.block },
                    &replacement,
                    &def_sites,
                    dom,
                );
            }
        }
        let indices: Vec<usize> = bb.ops.indices().collect();
        for idx in indices {
            bb.ops[idx].operation.visit_operands(|var| {
                rewrite_use(var, UseSite::Op { block, idx }, &replacement, &def_sites, dom);
            });
        }
        bb.terminator.visit_operands(|var| {
            rewrite_use(
                var,
                UseSite::Terminator { block },
                &replacement,
                &def_sites,
                dom,
            );
        });
        *n.block_mut(block) = bb;
    }

    // Live-out stores: every preserved value defined in this region is
    // written to its slot right after its definition (φ definitions store at
    // the head of the block's instructions).
    insert_live_out_stores(&mut n, sub, preserved, &def_sites, &preserved_param);

    // Terminators: returns yield ⟨-1, -1⟩; branches across a barrier yield
    // ⟨id of the source block, id of the target subkernel⟩ from a fresh
    // return block.
    let mut ret_blocks: Vec<NodeIndex> = Vec::new();
    for &block in &sub.blocks {
        match n.block(block).terminator.clone() {
            Terminator::Return { .. } => {
                let pair = make_pair(&mut n, block, -1, -1, pair_struct);
                n.set_terminator(block, Terminator::Return { value: Some(pair) });
            }
            Terminator::Branch { target } if post_barrier.contains(&target) => {
                let next = subs.entered_at(target).ok_or_else(|| {
                    LowerError::PreservedIndexMismatch {
                        proc: kernel.name.clone(),
                    }
                })?;
                let ret_block = n.add_block();
                let pair = make_pair(
                    &mut n,
                    ret_block,
                    block.index() as i32,
                    next as i32,
                    pair_struct,
                );
                n.set_terminator(ret_block, Terminator::Return { value: Some(pair) });
                n.set_terminator(block, Terminator::Branch { target: ret_block });
                ret_blocks.push(ret_block);
            }
            Terminator::Branch { .. } => {}
            Terminator::CondBranch {
                then_target,
                else_target,
                ..
            } => {
                if post_barrier.contains(&then_target) || post_barrier.contains(&else_target) {
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
                    kind: format!("{other:?}"),
                });
            }
        }
    }

    // Control-flow reconstruction: a switch on `from_bb_id` enters the
    // region. Every block a φ of the region's entry names as predecessor
    // gets a handler block whose sole job is to branch to the entry, so φ
    // selection observes it as the actual predecessor.
    let region_entry = sub.entry();
    let referenced: BTreeSet<NodeIndex> = n
        .block(region_entry)
        .phi_nodes
        .iter()
        .flat_map(|phi| phi.entries.iter().map(|entry| entry.block))
        .collect();
    let mut handlers: Vec<NodeIndex> = Vec::new();
    let mut cases: Vec<(i64, NodeIndex)> = Vec::new();
    for pred in referenced {
        let handler = n.add_block();
        n.set_terminator(handler, Terminator::Branch { target: region_entry });
        if sub.contains(pred) {
            // The predecessor still exists here; duplicate its incoming
            // values for the handler path.
            let mut duplicates: Vec<(usize, PhiEntry)> = Vec::new();
            for (idx, phi) in n.block(region_entry).phi_nodes.iter().enumerate() {
                if let Some(entry) = phi.entries.iter().find(|entry| entry.block == pred) {
                    duplicates.push((
                        idx,
                        PhiEntry {
                            block: handler,
                            value: entry.value.clone(),
                        },
                    ));
                }
            }
            for (idx, entry) in duplicates {
                n.block_mut(region_entry).phi_nodes[idx].entries.push(entry);
            }
        } else {
            for phi in &mut n.block_mut(region_entry).phi_nodes {
                for entry in &mut phi.entries {
                    if entry.block == pred {
                        entry.block = handler;
                    }
                }
            }
        }
        cases.push((pred.index() as i64, handler));
        handlers.push(handler);
    }
    n.set_terminator(
        entry_block,
        Terminator::Switch {
            value: n.param_var(0),
            default: region_entry,
            cases,
        },
    );

    // Prune everything outside the region. Definitions that escape into
    // surviving blocks are first degraded to undef; φ entries from erased
    // blocks are repaired away.
    let keep: HashSet<NodeIndex> = sub
        .blocks
        .iter()
        .copied()
        .chain([entry_block])
        .chain(handlers.iter().copied())
        .chain(ret_blocks.iter().copied())
        .collect();
    let removed: HashSet<NodeIndex> = n
        .body
        .node_indices()
        .filter(|node| !keep.contains(node))
        .collect();

    let mut removed_defs: HashMap<InstId, Type> = HashMap::new();
    for &block in &removed {
        let bb = n.block(block);
        for phi in &bb.phi_nodes {
            let id = phi.out.as_inst().expect("phi out is an inst");
            removed_defs.insert(id, phi.out.ty.clone());
        }
        for (_, inst) in bb.ops_in_order() {
            if let Some(ty) = &inst.out_ty {
                removed_defs.insert(inst.id, ty.clone());
            }
        }
    }
    n.visit_operands(|var| {
        if let Some(id) = var.as_inst()
            && let Some(ty) = removed_defs.get(&id)
        {
            *var = Variable::undef(ty.clone());
        }
    });
    crate::phi_repair::repair(&mut n, &removed, &HashMap::new());
    for block in removed {
        n.body.remove_node(block);
    }

    n.entry = entry_block;
    n.name = subkernel_name(original_name, sk);
    n.ret_ty = Some(Type::Struct(pair_struct));
    n.kernel_entry = false;
    let name = n.name.clone();
    module.add_proc(n);
    Ok(name)
}

fn rewrite_use(
    var: &mut Variable,
    site: UseSite,
    replacement: &HashMap<InstId, Variable>,
    def_sites: &HashMap<InstId, gridfold_ir::DefSite>,
    dom: &crate::analyses::dominators::DomTree,
) {
    let Some(id) = var.as_inst() else {
        return;
    };
    let Some(new) = replacement.get(&id) else {
        return;
    };
    let def = def_sites[&id];
    if !dom.dominates_use(def, site) {
        *var = new.clone();
    }
}

fn insert_live_out_stores(
    n: &mut Procedure,
    sub: &crate::subkernels::Subkernel,
    preserved: &PreservedLayout,
    def_sites: &HashMap<InstId, gridfold_ir::DefSite>,
    preserved_param: &Variable,
) {
    let mut by_block: HashMap<NodeIndex, Vec<(Option<usize>, u32, InstId, Type)>> = HashMap::new();
    for (field, (value, ty)) in preserved.fields.iter().enumerate() {
        let PreservedValue::Inst(id) = value else {
            continue;
        };
        let Some(def) = def_sites.get(id) else {
            continue;
        };
        if !sub.contains(def.block) {
            continue;
        }
        let after = match def.pos {
            DefPos::Phi(_) => None,
            DefPos::Op(idx) => Some(idx),
        };
        by_block
            .entry(def.block)
            .or_default()
            .push((after, field as u32, *id, ty.clone()));
    }

    for (block, stores) in by_block {
        let ops: Vec<(usize, Instruction)> = n
            .block(block)
            .ops_in_order()
            .map(|(idx, inst)| (idx, inst.clone()))
            .collect();
        let mut rebuilt: Vec<Instruction> = Vec::new();
        for (after, field, id, ty) in stores.iter().filter(|(after, ..)| after.is_none()) {
            debug_assert!(after.is_none());
            push_store(n, &mut rebuilt, preserved_param, *field, *id, ty);
        }
        for (idx, inst) in ops {
            rebuilt.push(inst);
            for (after, field, id, ty) in &stores {
                if *after == Some(idx) {
                    push_store(n, &mut rebuilt, preserved_param, *field, *id, ty);
                }
            }
        }
        n.rebuild_ops(block, rebuilt);
    }
}

fn push_store(
    n: &mut Procedure,
    rebuilt: &mut Vec<Instruction>,
    preserved_param: &Variable,
    field: u32,
    id: InstId,
    ty: &Type,
) {
    let addr_id = n.new_inst_id();
    rebuilt.push(Instruction::new(
        addr_id,
        Operation::FieldAddr {
            base: preserved_param.clone(),
            field,
        },
        Some(ty.clone().ptr_to()),
    ));
    rebuilt.push(Instruction::new(
        n.new_inst_id(),
        Operation::Store {
            addr: Variable::inst(addr_id, ty.clone().ptr_to()),
            value: Variable::inst(id, ty.clone()),
        },
        None,
    ));
}

fn make_pair(
    n: &mut Procedure,
    block: NodeIndex,
    from: i32,
    next: i32,
    pair_struct: StructId,
) -> Variable {
    n.push_inst(
        block,
        Operation::MakeStruct {
            fields: vec![Variable::i32(from), Variable::i32(next)],
        },
        Some(Type::Struct(pair_struct)),
    )
    .expect("pair construction has a result")
}
