//! Dim-source substitution: rewrites the dim-query intrinsic calls of a
//! kernel into reads of four appended `Dim3` parameters, so that downstream
//! analyses see dim values as ordinary SSA values rooted in parameters. The
//! axis extraction is materialised by cloning the recognised getter helper
//! at each call site, never by hard-coding the field access here.

use gridfold_ir::{Module, NodeIndex, Operation, Param, Procedure, Type, symbols};

use crate::error::Result;
use crate::inline;

pub fn substitute(module: &Module, kernel: &mut Procedure) -> Result<()> {
    let base = kernel.params.len() as u16;
    for triple in symbols::DimTriple::ALL {
        kernel.params.push(Param::new(triple.name(), Type::Dim3));
    }

    while let Some((block, idx, triple, axis)) = next_dim_query(kernel) {
        let dim_param = kernel.param_var(base + triple as u16);
        let getter = symbols::DIM3_GET[axis as usize];
        kernel.block_mut(block).ops[idx].operation = Operation::Call {
            callee: getter.to_string(),
            args: vec![dim_param],
        };
        inline::inline_helper(kernel, module, getter, block, idx)?;
    }
    Ok(())
}

fn next_dim_query(
    kernel: &Procedure,
) -> Option<(NodeIndex, usize, symbols::DimTriple, symbols::Axis)> {
    for block in kernel.body.node_indices() {
        for (idx, inst) in kernel.block(block).ops_in_order() {
            if let Operation::Call { callee, .. } = &inst.operation
                && let Some((triple, axis)) = symbols::parse_dim_query(callee)
            {
                return Some((block, idx, triple, axis));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use gridfold_ir::{ElemType, ProcBuilder, VariableKind};

    #[test]
    fn rewrites_queries_into_param_extracts() {
        let mut module = Module::default();
        runtime::declare_support(&mut module);

        let mut builder = ProcBuilder::kernel("k", vec![]);
        let tid = builder
            .call(
                symbols::dim_query_name(symbols::DimTriple::ThreadIdx, symbols::Axis::X),
                vec![],
                Some(Type::Scalar(ElemType::U32)),
            )
            .unwrap();
        let _use = builder.copy(tid);
        builder.ret(None);
        let mut kernel = builder.finish();

        substitute(&module, &mut kernel).unwrap();

        assert_eq!(kernel.params.len(), 4);
        let entry = kernel.entry;
        let ops: Vec<_> = kernel.block(entry).ops_in_order().collect();
        // The intrinsic call is gone; an extract of the threadIdx param is in
        // its place.
        assert!(ops.iter().all(|(_, inst)| !matches!(
            &inst.operation,
            Operation::Call { .. }
        )));
        let extract = ops
            .iter()
            .find_map(|(_, inst)| match &inst.operation {
                Operation::Extract { base, field } => Some((base, *field)),
                _ => None,
            })
            .expect("extract emitted");
        assert_eq!(extract.1, 0);
        assert_eq!(
            extract.0.kind,
            VariableKind::Param(3),
        );
    }
}
