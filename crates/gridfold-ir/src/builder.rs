use petgraph::graph::NodeIndex;

use crate::{
    ArithmeticOp, BinaryOperator, ComparisonOp, ElemType, Operation, Param, PhiEntry,
    PhiInstruction, Procedure, Terminator, Type, Variable,
};

/// Convenience layer for constructing procedure CFGs: tracks a current block,
/// assigns instruction ids and keeps graph edges in sync with terminators.
/// Used by the runtime-support constructors, the synthesis stages of the
/// lowering and by tests that need input kernels.
pub struct ProcBuilder {
    proc: Procedure,
    pub current: NodeIndex,
}

impl ProcBuilder {
    pub fn new(name: impl Into<String>, params: Vec<Param>, ret_ty: Option<Type>) -> Self {
        let proc = Procedure::new(name, params, ret_ty);
        let current = proc.entry;
        Self { proc, current }
    }

    pub fn kernel(name: impl Into<String>, params: Vec<Param>) -> Self {
        let mut builder = Self::new(name, params, None);
        builder.proc.kernel_entry = true;
        builder
    }

    pub fn proc(&self) -> &Procedure {
        &self.proc
    }

    pub fn proc_mut(&mut self) -> &mut Procedure {
        &mut self.proc
    }

    pub fn entry(&self) -> NodeIndex {
        self.proc.entry
    }

    pub fn param(&self, index: u16) -> Variable {
        self.proc.param_var(index)
    }

    pub fn create_block(&mut self) -> NodeIndex {
        self.proc.add_block()
    }

    pub fn switch_to(&mut self, block: NodeIndex) {
        self.current = block;
    }

    pub fn push(&mut self, operation: Operation, out_ty: Option<Type>) -> Option<Variable> {
        self.proc.push_inst(self.current, operation, out_ty)
    }

    pub fn arith(&mut self, op: ArithmeticOp, lhs: Variable, rhs: Variable) -> Variable {
        let ty = lhs.ty.clone();
        self.push(
            Operation::Arithmetic(op, BinaryOperator { lhs, rhs }),
            Some(ty),
        )
        .unwrap()
    }

    pub fn cmp(&mut self, op: ComparisonOp, lhs: Variable, rhs: Variable) -> Variable {
        self.push(
            Operation::Comparison(op, BinaryOperator { lhs, rhs }),
            Some(Type::Scalar(ElemType::Bool)),
        )
        .unwrap()
    }

    pub fn copy(&mut self, value: Variable) -> Variable {
        let ty = value.ty.clone();
        self.push(Operation::Copy(value), Some(ty)).unwrap()
    }

    pub fn cast(&mut self, value: Variable, to: Type) -> Variable {
        self.push(
            Operation::Cast {
                value,
                to: to.clone(),
            },
            Some(to),
        )
        .unwrap()
    }

    /// Load through a typed pointer; the result type is the pointee.
    pub fn load(&mut self, addr: Variable) -> Variable {
        let ty = addr
            .ty
            .pointee()
            .expect("load requires a pointer operand")
            .clone();
        self.push(Operation::Load { addr }, Some(ty)).unwrap()
    }

    pub fn store(&mut self, addr: Variable, value: Variable) {
        self.push(Operation::Store { addr, value }, None);
    }

    pub fn field_addr(&mut self, base: Variable, field: u32, field_ty: Type) -> Variable {
        self.push(
            Operation::FieldAddr { base, field },
            Some(field_ty.ptr_to()),
        )
        .unwrap()
    }

    pub fn index_addr(&mut self, base: Variable, index: Variable) -> Variable {
        let ty = match base.ty.pointee() {
            Some(Type::Array(elem, _)) => Type::Ptr(elem.clone()),
            _ => base.ty.clone(),
        };
        self.push(Operation::IndexAddr { base, index }, Some(ty))
            .unwrap()
    }

    pub fn extract(&mut self, base: Variable, field: u32, field_ty: Type) -> Variable {
        self.push(Operation::Extract { base, field }, Some(field_ty))
            .unwrap()
    }

    pub fn make_struct(&mut self, fields: Vec<Variable>, ty: Type) -> Variable {
        self.push(Operation::MakeStruct { fields }, Some(ty)).unwrap()
    }

    pub fn stack_alloc(&mut self, elem: Type, count: Variable) -> Variable {
        self.push(
            Operation::StackAlloc {
                elem: elem.clone(),
                count,
            },
            Some(elem.ptr_to()),
        )
        .unwrap()
    }

    pub fn heap_alloc(&mut self, elem: Type, count: Variable) -> Variable {
        self.push(
            Operation::HeapAlloc {
                elem: elem.clone(),
                count,
            },
            Some(elem.ptr_to()),
        )
        .unwrap()
    }

    pub fn heap_free(&mut self, ptr: Variable) {
        self.push(Operation::HeapFree { ptr }, None);
    }

    pub fn call(
        &mut self,
        callee: impl Into<String>,
        args: Vec<Variable>,
        out_ty: Option<Type>,
    ) -> Option<Variable> {
        self.push(
            Operation::Call {
                callee: callee.into(),
                args,
            },
            out_ty,
        )
    }

    /// Add a φ-node at the start of `block`.
    pub fn phi(&mut self, block: NodeIndex, ty: Type, entries: Vec<(NodeIndex, Variable)>) -> Variable {
        let id = self.proc.new_inst_id();
        let out = Variable::inst(id, ty);
        let entries = entries
            .into_iter()
            .map(|(block, value)| PhiEntry { block, value })
            .collect();
        self.proc.block_mut(block).phi_nodes.push(PhiInstruction {
            out: out.clone(),
            entries,
        });
        out
    }

    pub fn branch(&mut self, target: NodeIndex) {
        self.proc
            .set_terminator(self.current, Terminator::Branch { target });
    }

    pub fn cond_branch(&mut self, cond: Variable, then_target: NodeIndex, else_target: NodeIndex) {
        self.proc.set_terminator(
            self.current,
            Terminator::CondBranch {
                cond,
                then_target,
                else_target,
            },
        );
    }

    pub fn switch(&mut self, value: Variable, default: NodeIndex, cases: Vec<(i64, NodeIndex)>) {
        self.proc.set_terminator(
            self.current,
            Terminator::Switch {
                value,
                default,
                cases,
            },
        );
    }

    pub fn ret(&mut self, value: Option<Variable>) {
        self.proc
            .set_terminator(self.current, Terminator::Return { value });
    }

    pub fn finish(self) -> Procedure {
        self.proc
    }
}
