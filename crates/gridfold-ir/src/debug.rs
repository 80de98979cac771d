use std::fmt::Display;

use crate::{Module, Procedure, SharedKind, Terminator};

impl Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (id, def) in self.structs.iter() {
            write!(f, "struct %{id} \"{}\" {{ ", def.name)?;
            for (i, field) in def.fields.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{field:?}")?;
            }
            f.write_str(" }\n")?;
        }
        for global in &self.globals {
            let shared = match global.shared {
                Some(SharedKind::Static) => " shared",
                Some(SharedKind::Dynamic) => " shared dynamic",
                None => "",
            };
            let decl = if global.declaration { " declare" } else { "" };
            writeln!(f, "global @{}: {:?}{shared}{decl};", global.name, global.ty)?;
        }
        if !self.globals.is_empty() || self.structs.iter().next().is_some() {
            writeln!(f)?;
        }
        for proc in &self.procedures {
            write!(f, "{proc}")?;
        }
        Ok(())
    }
}

impl Display for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.declaration { "declare" } else { "proc" };
        write!(f, "{kind} @{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {:?}", param.name, param.ty)?;
        }
        write!(f, ")")?;
        if let Some(ret) = &self.ret_ty {
            write!(f, " -> {ret:?}")?;
        }
        if self.kernel_entry {
            write!(f, " kernel")?;
        }
        if self.declaration {
            f.write_str(";\n\n")?;
            return Ok(());
        }
        writeln!(f, " {{")?;

        let mut nodes = self.node_ids();
        nodes.sort_unstable();
        for node in nodes {
            let id = node.index();
            let bb = self.block(node);
            let entry = if node == self.entry { " (entry)" } else { "" };
            writeln!(f, "bb{id}{entry}:")?;

            for phi in &bb.phi_nodes {
                write!(f, "    {} = phi ", phi.out)?;
                for entry in &phi.entries {
                    write!(f, "[bb{}: {}]", entry.block.index(), entry.value)?;
                }
                f.write_str(";\n")?;
            }
            for (_, op) in bb.ops_in_order() {
                writeln!(f, "    {op};")?;
            }
            match &bb.terminator {
                Terminator::None => writeln!(f, "    <unterminated>;")?,
                Terminator::Branch { target } => writeln!(f, "    branch bb{};", target.index())?,
                Terminator::CondBranch {
                    cond,
                    then_target,
                    else_target,
                } => writeln!(
                    f,
                    "    {cond} ? bb{} : bb{};",
                    then_target.index(),
                    else_target.index()
                )?,
                Terminator::Switch {
                    value,
                    default,
                    cases,
                } => {
                    write!(f, "    switch({value}) ")?;
                    for (val, block) in cases {
                        write!(f, "[{val}: bb{}] ", block.index())?;
                    }
                    writeln!(f, "[default: bb{}];", default.index())?;
                }
                Terminator::Return { value } => match value {
                    Some(value) => writeln!(f, "    return {value};")?,
                    None => writeln!(f, "    return;")?,
                },
                other => writeln!(f, "    {other:?};")?,
            }
        }
        f.write_str("}\n\n")?;
        Ok(())
    }
}
