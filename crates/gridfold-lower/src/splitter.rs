//! Orchestration of the per-kernel pipeline: dim substitution, barrier
//! splitting, alloca lowering, subkernel discovery, live-across analysis,
//! record layout, subkernel synthesis, then driver and outer assembly. The
//! original kernel stays in the module untouched until the module-level
//! cleanup; every stage here works on a detached, preprocessed clone.

use hashbrown::HashMap;
use gridfold_ir::{ElemType, InstId, Module, StructId, Type};

use crate::analyses::live_across;
use crate::error::{LowerError, Result};
use crate::preserved::{PreservedValue};
use crate::subkernels::SubkernelId;
use crate::{Options, allocas, barriers, dim3, driver, outer, preserved, subkernels, synthesis};

/// Everything the lowering produced for one kernel. Names reflect the module
/// state after cleanup: the chosen outer variant carries the kernel's
/// original name.
#[derive(Debug)]
pub struct LoweredKernel {
    pub original: String,
    pub subkernels: Vec<String>,
    pub driver: String,
    pub wrapper: String,
    pub self_contained: String,
    pub entry_subkernel: SubkernelId,
    pub preserved_struct: StructId,
    pub shared_struct: StructId,
    pub pair_struct: StructId,
    pub preserved_fields: Vec<(PreservedValue, Type)>,
    pub static_shared: Vec<String>,
    pub dynamic_shared: Option<String>,
    /// Live-across sets per ordered subkernel pair, for inspection.
    pub live_pairs: HashMap<(SubkernelId, SubkernelId), Vec<InstId>>,
}

pub fn split_kernel(
    module: &mut Module,
    name: &str,
    options: &Options,
) -> Result<LoweredKernel> {
    let mut kernel = module
        .proc(name)
        .cloned()
        .ok_or_else(|| LowerError::MissingSupportSymbol {
            name: name.to_string(),
        })?;
    let original_params = kernel.params.clone();

    log::debug!("@{name}: substituting dim sources");
    dim3::substitute(module, &mut kernel)?;

    log::debug!("@{name}: splitting blocks around barriers");
    let post_barrier = barriers::split(&mut kernel);
    barriers::validate(&kernel, &post_barrier)?;

    log::debug!("@{name}: lowering allocas ({} barriers)", post_barrier.len());
    allocas::lower(&mut kernel, &post_barrier);

    let subs = subkernels::discover(&kernel, &post_barrier);
    log::debug!("@{name}: {} subkernels", subs.list.len());

    let shared = preserved::collect_shared(module, &kernel)?;
    let live = live_across::compute(module, &kernel, &post_barrier, &subs);
    let layout = preserved::layout(module, &kernel, &subs, &live)?;
    log::debug!(
        "@{name}: preserved record has {} fields, {} static shared",
        layout.fields.len(),
        shared.statics.len()
    );

    let pair_struct = module.intern_struct(
        format!("{name}.subkernel_ret"),
        vec![Type::Scalar(ElemType::I32), Type::Scalar(ElemType::I32)],
    );

    let mut subkernel_names = Vec::with_capacity(subs.list.len());
    for sk in subs.ids() {
        subkernel_names.push(synthesis::synthesize(
            module,
            &kernel,
            name,
            &post_barrier,
            &subs,
            &live,
            &layout,
            &shared,
            pair_struct,
            sk,
        )?);
    }

    let driver = driver::build(
        module,
        name,
        &original_params,
        &subs,
        &layout,
        &shared,
        pair_struct,
        options,
    )?;
    let wrapper = outer::build_wrapper(module, name, &original_params)?;
    let self_contained = outer::build_self_contained(module, name, &original_params)?;

    Ok(LoweredKernel {
        original: name.to_string(),
        subkernels: subkernel_names,
        driver,
        wrapper,
        self_contained,
        entry_subkernel: subs.entry_subkernel,
        preserved_struct: layout.struct_id,
        shared_struct: shared.struct_id,
        pair_struct,
        preserved_fields: layout.fields,
        static_shared: shared.statics,
        dynamic_shared: shared.dynamic,
        live_pairs: live.pairs,
    })
}
