use core::fmt::Display;

use smallvec::SmallVec;

use crate::{InstId, Type, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ComparisonOp {
    Equal,
    NotEqual,
    Lower,
    LowerEqual,
    Greater,
    GreaterEqual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryOperator {
    pub lhs: Variable,
    pub rhs: Variable,
}

/// An operation performed by an [`Instruction`]. The SSA result, when one
/// exists, is identified by the owning instruction's id rather than stored
/// here.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Arithmetic(ArithmeticOp, BinaryOperator),
    Comparison(ComparisonOp, BinaryOperator),
    Copy(Variable),
    Cast {
        value: Variable,
        to: Type,
    },
    Load {
        addr: Variable,
    },
    Store {
        addr: Variable,
        value: Variable,
    },
    /// Address of a struct or dim field through a pointer base.
    FieldAddr {
        base: Variable,
        field: u32,
    },
    /// Address of an array element / pointer offset. Stepping is by element
    /// size of the base's pointee (or of the pointee's element for arrays).
    IndexAddr {
        base: Variable,
        index: Variable,
    },
    /// By-value field read of a struct or dim record.
    Extract {
        base: Variable,
        field: u32,
    },
    /// By-value aggregate construction.
    MakeStruct {
        fields: Vec<Variable>,
    },
    StackAlloc {
        elem: Type,
        count: Variable,
    },
    HeapAlloc {
        elem: Type,
        count: Variable,
    },
    HeapFree {
        ptr: Variable,
    },
    LifetimeStart {
        ptr: Variable,
    },
    LifetimeEnd {
        ptr: Variable,
    },
    Call {
        callee: String,
        args: Vec<Variable>,
    },
}

impl Operation {
    /// Visit every operand slot.
    pub fn visit_operands(&mut self, mut visit: impl FnMut(&mut Variable)) {
        match self {
            Operation::Arithmetic(_, bin) | Operation::Comparison(_, bin) => {
                visit(&mut bin.lhs);
                visit(&mut bin.rhs);
            }
            Operation::Copy(value) => visit(value),
            Operation::Cast { value, .. } => visit(value),
            Operation::Load { addr } => visit(addr),
            Operation::Store { addr, value } => {
                visit(addr);
                visit(value);
            }
            Operation::FieldAddr { base, .. } | Operation::Extract { base, .. } => visit(base),
            Operation::IndexAddr { base, index } => {
                visit(base);
                visit(index);
            }
            Operation::MakeStruct { fields } => {
                for field in fields {
                    visit(field);
                }
            }
            Operation::StackAlloc { count, .. } | Operation::HeapAlloc { count, .. } => {
                visit(count)
            }
            Operation::HeapFree { ptr }
            | Operation::LifetimeStart { ptr }
            | Operation::LifetimeEnd { ptr } => visit(ptr),
            Operation::Call { args, .. } => {
                for arg in args {
                    visit(arg);
                }
            }
        }
    }

    pub fn operands(&self) -> SmallVec<[&Variable; 4]> {
        let mut out: SmallVec<[&Variable; 4]> = SmallVec::new();
        match self {
            Operation::Arithmetic(_, bin) | Operation::Comparison(_, bin) => {
                out.push(&bin.lhs);
                out.push(&bin.rhs);
            }
            Operation::Copy(value) | Operation::Cast { value, .. } => out.push(value),
            Operation::Load { addr } => out.push(addr),
            Operation::Store { addr, value } => {
                out.push(addr);
                out.push(value);
            }
            Operation::FieldAddr { base, .. } | Operation::Extract { base, .. } => out.push(base),
            Operation::IndexAddr { base, index } => {
                out.push(base);
                out.push(index);
            }
            Operation::MakeStruct { fields } => out.extend(fields.iter()),
            Operation::StackAlloc { count, .. } | Operation::HeapAlloc { count, .. } => {
                out.push(count)
            }
            Operation::HeapFree { ptr }
            | Operation::LifetimeStart { ptr }
            | Operation::LifetimeEnd { ptr } => out.push(ptr),
            Operation::Call { args, .. } => out.extend(args.iter()),
        }
        out
    }

    /// Whether the operation writes memory, allocates, or may do either
    /// through a call.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Operation::Store { .. }
                | Operation::StackAlloc { .. }
                | Operation::HeapAlloc { .. }
                | Operation::HeapFree { .. }
                | Operation::LifetimeStart { .. }
                | Operation::LifetimeEnd { .. }
                | Operation::Call { .. }
        )
    }
}

/// An instruction: an operation plus the identity and type of its SSA result.
/// `out_ty` is `None` for operations that produce no value.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub id: InstId,
    pub operation: Operation,
    pub out_ty: Option<Type>,
}

impl Instruction {
    pub fn new(id: InstId, operation: Operation, out_ty: Option<Type>) -> Self {
        Self {
            id,
            operation,
            out_ty,
        }
    }

    /// The result of this instruction as an operand, when it produces one.
    pub fn out_var(&self) -> Option<Variable> {
        self.out_ty
            .clone()
            .map(|ty| Variable::inst(self.id, ty))
    }
}

impl Display for ArithmeticOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ArithmeticOp::Add => "add",
            ArithmeticOp::Sub => "sub",
            ArithmeticOp::Mul => "mul",
            ArithmeticOp::Div => "div",
            ArithmeticOp::Rem => "rem",
        };
        f.write_str(name)
    }
}

impl Display for ComparisonOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ComparisonOp::Equal => "eq",
            ComparisonOp::NotEqual => "ne",
            ComparisonOp::Lower => "lt",
            ComparisonOp::LowerEqual => "le",
            ComparisonOp::Greater => "gt",
            ComparisonOp::GreaterEqual => "ge",
        };
        f.write_str(name)
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.out_ty.is_some() {
            write!(f, "{} = ", self.id)?;
        }
        match &self.operation {
            Operation::Arithmetic(op, bin) => write!(f, "{op} {}, {}", bin.lhs, bin.rhs),
            Operation::Comparison(op, bin) => write!(f, "{op} {}, {}", bin.lhs, bin.rhs),
            Operation::Copy(value) => write!(f, "copy {value}"),
            Operation::Cast { value, to } => write!(f, "cast {value} to {to:?}"),
            Operation::Load { addr } => write!(f, "load {addr}"),
            Operation::Store { addr, value } => write!(f, "store {value} -> {addr}"),
            Operation::FieldAddr { base, field } => write!(f, "field_addr {base}, {field}"),
            Operation::IndexAddr { base, index } => write!(f, "index_addr {base}, {index}"),
            Operation::Extract { base, field } => write!(f, "extract {base}, {field}"),
            Operation::MakeStruct { fields } => {
                write!(f, "make_struct {{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, "}}")
            }
            Operation::StackAlloc { elem, count } => write!(f, "stack_alloc {elem:?} x {count}"),
            Operation::HeapAlloc { elem, count } => write!(f, "heap_alloc {elem:?} x {count}"),
            Operation::HeapFree { ptr } => write!(f, "heap_free {ptr}"),
            Operation::LifetimeStart { ptr } => write!(f, "lifetime_start {ptr}"),
            Operation::LifetimeEnd { ptr } => write!(f, "lifetime_end {ptr}"),
            Operation::Call { callee, args } => {
                write!(f, "call @{callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}
