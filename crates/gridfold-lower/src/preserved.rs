//! Layout of the two per-kernel aggregates: the preserved-data record R(K)
//! that carries live-across values between subkernels, and the shared-vars
//! record S(K) holding the static shared globals. Field order is fully
//! deterministic — globals by name, parameters by index, instructions by
//! (owning subkernel, block id, position in block) — and identical for every
//! subkernel of the kernel.

use hashbrown::HashMap;
use gridfold_ir::{InstId, Module, Procedure, StructId, Type};

use crate::analyses::for_each_operand;
use crate::analyses::live_across::LiveAcross;
use crate::error::{LowerError, Result};
use crate::subkernels::Subkernels;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreservedValue {
    Global(String),
    Param(u16),
    Inst(InstId),
}

#[derive(Debug)]
pub struct PreservedLayout {
    pub fields: Vec<(PreservedValue, Type)>,
    pub index_of: HashMap<InstId, u32>,
    pub struct_id: StructId,
}

impl PreservedLayout {
    pub fn index_of(&self, id: InstId) -> Option<u32> {
        self.index_of.get(&id).copied()
    }
}

#[derive(Debug)]
pub struct SharedLayout {
    /// Static shared globals used by the kernel, sorted by name.
    pub statics: Vec<String>,
    pub index_of: HashMap<String, u32>,
    pub struct_id: StructId,
    /// The single dynamic shared global, when the kernel uses one.
    pub dynamic: Option<String>,
}

/// Find the shared globals the kernel touches and intern S(K). At most one
/// dynamic shared global may be used per kernel.
pub fn collect_shared(
    module: &mut Module,
    kernel: &Procedure,
) -> Result<SharedLayout> {
    let mut statics: Vec<String> = Vec::new();
    let mut dynamic: Option<String> = None;
    let mut conflict: Option<(String, String)> = None;

    for_each_operand(kernel, |operand| {
        let Some(name) = operand.as_global() else {
            return;
        };
        let Some(global) = module.global(name) else {
            return;
        };
        if global.is_static_shared() {
            if !statics.iter().any(|existing| existing == name) {
                statics.push(name.to_string());
            }
        } else if global.is_dynamic_shared() {
            match &dynamic {
                None => dynamic = Some(name.to_string()),
                Some(existing) if existing != name && conflict.is_none() => {
                    conflict = Some((existing.clone(), name.to_string()));
                }
                Some(_) => {}
            }
        }
    });

    if let Some((first, second)) = conflict {
        return Err(LowerError::MultipleDynamicShared {
            proc: kernel.name.clone(),
            first,
            second,
        });
    }

    statics.sort();
    let index_of = statics
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.clone(), idx as u32))
        .collect();
    let field_tys: Vec<Type> = statics
        .iter()
        .map(|name| module.global(name).expect("collected above").ty.clone())
        .collect();
    let struct_id = module.intern_struct(format!("{}.shared", kernel.name), field_tys);

    Ok(SharedLayout {
        statics,
        index_of,
        struct_id,
        dynamic,
    })
}

/// Assign preserved-record indices to the union of all live-across values and
/// intern R(K).
pub fn layout(
    module: &mut Module,
    kernel: &Procedure,
    subs: &Subkernels,
    live: &LiveAcross,
) -> Result<PreservedLayout> {
    let def_sites = kernel.def_sites();

    let mut values: Vec<(PreservedValue, Type)> = Vec::new();
    for id in live.union() {
        let ty = find_out_ty(kernel, &def_sites, id).ok_or_else(|| {
            LowerError::PreservedIndexMismatch {
                proc: kernel.name.clone(),
            }
        })?;
        values.push((PreservedValue::Inst(id), ty));
    }

    // Globals first, then parameters by index, then instructions by
    // (subkernel, block, position). Only instructions occur in practice —
    // parameters reach every subkernel as arguments — but the order is
    // defined for all three.
    values.sort_by_key(|(value, _)| match value {
        PreservedValue::Global(name) => (0, 0, 0, (0, 0), name.clone()),
        PreservedValue::Param(index) => (1, *index as usize, 0, (0, 0), String::new()),
        PreservedValue::Inst(id) => {
            let def = def_sites[id];
            let owner = subs.owner_of(def.block).unwrap_or(usize::MAX);
            (2, owner, def.block.index(), def.pos.rank(), String::new())
        }
    });

    let mut index_of = HashMap::new();
    for (idx, (value, _)) in values.iter().enumerate() {
        if let PreservedValue::Inst(id) = value {
            index_of.insert(*id, idx as u32);
        }
    }

    let field_tys: Vec<Type> = values.iter().map(|(_, ty)| ty.clone()).collect();
    let struct_id = module.intern_struct(format!("{}.preserved", kernel.name), field_tys);

    let layout = PreservedLayout {
        fields: values,
        index_of,
        struct_id,
    };

    // Every subkernel's live-in values must resolve to a slot; a miss means
    // the record would disagree across subkernels.
    for set in &live.live_in {
        for id in set {
            if layout.index_of(*id).is_none() {
                return Err(LowerError::PreservedIndexMismatch {
                    proc: kernel.name.clone(),
                });
            }
        }
    }

    Ok(layout)
}

fn find_out_ty(
    kernel: &Procedure,
    def_sites: &HashMap<InstId, gridfold_ir::DefSite>,
    id: InstId,
) -> Option<Type> {
    let def = def_sites.get(&id)?;
    match def.pos {
        gridfold_ir::DefPos::Phi(idx) => {
            Some(kernel.block(def.block).phi_nodes[idx].out.ty.clone())
        }
        gridfold_ir::DefPos::Op(idx) => kernel.block(def.block).ops[idx].out_ty.clone(),
    }
}
