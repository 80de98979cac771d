//! Procedure inlining. The dim helper templates are always inlined at their
//! call sites; subkernel calls in the driver are inlined when
//! `Options::inline_subkernels` is set. Single-block helpers are spliced in
//! place; multi-block callees are stitched in with a split at the call site.

use hashbrown::HashMap;
use gridfold_ir::{
    InstId, Instruction, Module, NodeIndex, Operation, PhiEntry, PhiInstruction, Procedure,
    Terminator, Variable, VariableKind,
};

/// Rewrites a callee-side variable into the caller's frame: parameters become
/// the call arguments, instruction ids are renumbered.
fn remap_var(var: &mut Variable, args: &[Variable], id_map: &HashMap<InstId, InstId>) {
    if let Some(index) = var.as_param() {
        *var = args[index as usize].clone();
    } else if let Some(id) = var.as_inst() {
        let new = id_map
            .get(&id)
            .expect("callee value escaped the inline id map");
        var.kind = VariableKind::Inst(*new);
    }
}

/// Inline the `Call` at stable index `op_idx` of `block`. The callee must
/// have a body. Returns the variable that replaced the call's result, when
/// the call produced one.
pub fn inline_call(
    caller: &mut Procedure,
    callee: &Procedure,
    block: NodeIndex,
    op_idx: usize,
) -> Option<Variable> {
    let call = caller.block(block).ops[op_idx].clone();
    let Operation::Call { args, .. } = &call.operation else {
        panic!("inline_call on a non-call instruction");
    };
    let args = args.clone();

    // Fresh ids for every callee-defined value.
    let mut id_map: HashMap<InstId, InstId> = HashMap::new();
    for node in callee.body.node_indices() {
        let bb = callee.block(node);
        for phi in &bb.phi_nodes {
            let id = phi.out.as_inst().expect("phi out is an inst");
            id_map.insert(id, caller.new_inst_id());
        }
        for (_, inst) in bb.ops_in_order() {
            id_map.insert(inst.id, caller.new_inst_id());
        }
    }

    let clone_inst = |inst: &Instruction, caller_args: &[Variable], id_map: &HashMap<InstId, InstId>| {
        let mut operation = inst.operation.clone();
        operation.visit_operands(|var| remap_var(var, caller_args, id_map));
        Instruction::new(id_map[&inst.id], operation, inst.out_ty.clone())
    };

    let single_block = callee.body.node_count() == 1
        && matches!(
            callee.block(callee.entry).terminator,
            Terminator::Return { .. }
        );

    if single_block {
        let entry = callee.block(callee.entry);
        let spliced: Vec<Instruction> = entry
            .ops_in_order()
            .map(|(_, inst)| clone_inst(inst, &args, &id_map))
            .collect();

        let ordered: Vec<usize> = caller.block(block).ops.indices().collect();
        let mut rebuilt = Vec::new();
        for idx in ordered {
            if idx == op_idx {
                rebuilt.extend(spliced.iter().cloned());
            } else {
                rebuilt.push(caller.block(block).ops[idx].clone());
            }
        }
        caller.rebuild_ops(block, rebuilt);

        if call.out_ty.is_some() {
            let Terminator::Return { value: Some(value) } = &entry.terminator else {
                panic!("value call into a void helper");
            };
            let mut value = value.clone();
            remap_var(&mut value, &args, &id_map);
            caller.replace_uses(call.id, &value);
            return Some(value);
        }
        return None;
    }

    // General path: split the call site and stitch the callee graph in. The
    // call is the last instruction left in `block`; indices were renumbered
    // by the split.
    let cont = caller.split_block_after(block, op_idx);
    let call_idx = caller
        .block(block)
        .ops
        .indices()
        .last()
        .expect("the call stayed in the split block");
    caller.block_mut(block).ops.remove(call_idx);

    let mut node_map: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    for node in callee.body.node_indices() {
        node_map.insert(node, caller.add_block());
    }

    let mut returns: Vec<(NodeIndex, Option<Variable>)> = Vec::new();
    for node in callee.body.node_indices() {
        let new_node = node_map[&node];
        let bb = callee.block(node);

        let phi_nodes = bb
            .phi_nodes
            .iter()
            .map(|phi| {
                let out_id = phi.out.as_inst().expect("phi out is an inst");
                let entries = phi
                    .entries
                    .iter()
                    .map(|entry| {
                        let mut value = entry.value.clone();
                        remap_var(&mut value, &args, &id_map);
                        PhiEntry {
                            block: node_map[&entry.block],
                            value,
                        }
                    })
                    .collect();
                PhiInstruction {
                    out: Variable::inst(id_map[&out_id], phi.out.ty.clone()),
                    entries,
                }
            })
            .collect();
        caller.block_mut(new_node).phi_nodes = phi_nodes;

        let ops: Vec<Instruction> = bb
            .ops_in_order()
            .map(|(_, inst)| clone_inst(inst, &args, &id_map))
            .collect();
        caller.rebuild_ops(new_node, ops);

        let mut terminator = bb.terminator.clone();
        terminator.visit_operands(|var| remap_var(var, &args, &id_map));
        let terminator = match terminator {
            Terminator::Return { value } => {
                returns.push((new_node, value));
                Terminator::Branch { target: cont }
            }
            Terminator::Branch { target } => Terminator::Branch {
                target: node_map[&target],
            },
            Terminator::CondBranch {
                cond,
                then_target,
                else_target,
            } => Terminator::CondBranch {
                cond,
                then_target: node_map[&then_target],
                else_target: node_map[&else_target],
            },
            Terminator::Switch {
                value,
                default,
                cases,
            } => Terminator::Switch {
                value,
                default: node_map[&default],
                cases: cases
                    .into_iter()
                    .map(|(case, target)| (case, node_map[&target]))
                    .collect(),
            },
            other => other,
        };
        caller.set_terminator(new_node, terminator);
    }

    caller.set_terminator(
        block,
        Terminator::Branch {
            target: node_map[&callee.entry],
        },
    );

    if call.out_ty.is_some() {
        let values: Vec<(NodeIndex, Variable)> = returns
            .iter()
            .filter_map(|(node, value)| value.clone().map(|value| (*node, value)))
            .collect();
        let replacement = match values.as_slice() {
            [] => Variable::undef(call.out_ty.clone().expect("call has a result type")),
            [(_, value)] => value.clone(),
            _ => {
                let id = caller.new_inst_id();
                let ty = call.out_ty.clone().expect("call has a result type");
                let out = Variable::inst(id, ty);
                caller.block_mut(cont).phi_nodes.push(PhiInstruction {
                    out: out.clone(),
                    entries: values
                        .into_iter()
                        .map(|(block, value)| PhiEntry { block, value })
                        .collect(),
                });
                out
            }
        };
        caller.replace_uses(call.id, &replacement);
        Some(replacement)
    } else {
        None
    }
}

/// Look up a helper template by name and inline it at the call site. Returns
/// the variable carrying the helper's result.
pub(crate) fn inline_helper(
    caller: &mut Procedure,
    module: &Module,
    name: &str,
    block: NodeIndex,
    op_idx: usize,
) -> crate::error::Result<Option<Variable>> {
    let helper = crate::runtime::expect_proc(module, name)?;
    if helper.declaration {
        return Err(crate::error::LowerError::MissingSupportSymbol {
            name: name.to_string(),
        });
    }
    let helper = helper.clone();
    Ok(inline_call(caller, &helper, block, op_idx))
}
