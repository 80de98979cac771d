use crate::{Procedure, StructDef, StructId, StructTable, Type};

/// Shared-memory attribute on a global. Static shared memory is sized at
/// compile time; dynamic shared memory is a declaration sized at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedKind {
    Static,
    Dynamic,
}

/// A module global. `ty` is the pointee type; uses of the global are typed
/// `Ptr(ty)`.
#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    pub ty: Type,
    pub shared: Option<SharedKind>,
    pub declaration: bool,
}

impl GlobalVar {
    pub fn shared_static(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            shared: Some(SharedKind::Static),
            declaration: false,
        }
    }

    pub fn shared_dynamic(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            shared: Some(SharedKind::Dynamic),
            declaration: true,
        }
    }

    pub fn is_static_shared(&self) -> bool {
        self.shared == Some(SharedKind::Static) && !self.declaration
    }

    pub fn is_dynamic_shared(&self) -> bool {
        self.shared == Some(SharedKind::Dynamic) || (self.shared.is_some() && self.declaration)
    }
}

/// A whole program: procedures, globals and the named-aggregate table.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub procedures: Vec<Procedure>,
    pub globals: Vec<GlobalVar>,
    pub structs: StructTable,
}

impl Module {
    pub fn proc(&self, name: &str) -> Option<&Procedure> {
        self.procedures.iter().find(|proc| proc.name == name)
    }

    pub fn proc_mut(&mut self, name: &str) -> Option<&mut Procedure> {
        self.procedures.iter_mut().find(|proc| proc.name == name)
    }

    pub fn add_proc(&mut self, proc: Procedure) {
        debug_assert!(
            self.proc(&proc.name).is_none(),
            "duplicate procedure {}",
            proc.name
        );
        self.procedures.push(proc);
    }

    pub fn remove_proc(&mut self, name: &str) -> Option<Procedure> {
        let idx = self.procedures.iter().position(|proc| proc.name == name)?;
        Some(self.procedures.remove(idx))
    }

    pub fn global(&self, name: &str) -> Option<&GlobalVar> {
        self.globals.iter().find(|global| global.name == name)
    }

    pub fn add_global(&mut self, global: GlobalVar) {
        debug_assert!(
            self.global(&global.name).is_none(),
            "duplicate global {}",
            global.name
        );
        self.globals.push(global);
    }

    pub fn remove_global(&mut self, name: &str) -> Option<GlobalVar> {
        let idx = self.globals.iter().position(|global| global.name == name)?;
        Some(self.globals.remove(idx))
    }

    pub fn intern_struct(&mut self, name: impl Into<String>, fields: Vec<Type>) -> StructId {
        self.structs.intern(StructDef {
            name: name.into(),
            fields,
        })
    }

    pub fn kernel_entries(&self) -> Vec<String> {
        self.procedures
            .iter()
            .filter(|proc| proc.kernel_entry && !proc.declaration)
            .map(|proc| proc.name.clone())
            .collect()
    }
}
