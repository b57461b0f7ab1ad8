//! Namespace assembly
//!
//! Layers are applied in a fixed order and later layers shadow earlier ones:
//! guards (restricted tier only), then libraries, then datasets, then caller
//! variables. A binding that cannot be produced is skipped with a warning;
//! assembly itself only fails when the interpreter refuses a plain dict write.

use rustpython_vm::builtins::PyStr;
use rustpython_vm::function::FuncArgs;
use rustpython_vm::scope::Scope;
use rustpython_vm::{AsObject, PyObjectRef, PyResult, VirtualMachine};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::capability::{CapabilityProfile, LibraryHandle};
use crate::dataset::{DatasetBundle, Table, NULL_CELL};
use crate::identifier::{to_python_identifier, validate_python_identifier};
use crate::interpreter::{cell_to_pyobject, json_to_pyobject};
use crate::output::OutputSink;
use crate::protocol::VariableBindings;
use crate::restricted::guards::{install_guards, ViolationLog};

/// Which layer produced a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingLayer {
    Guard,
    Library,
    Dataset,
    Variable,
}

/// The scope a snippet runs in, plus where each name came from
pub struct ExecutionNamespace {
    pub scope: Scope,
    pub bindings: BTreeMap<String, BindingLayer>,
}

impl ExecutionNamespace {
    pub fn layer_of(&self, name: &str) -> Option<BindingLayer> {
        self.bindings.get(name).copied()
    }
}

pub struct EnvironmentBuilder<'a> {
    profile: &'a CapabilityProfile,
    datasets: &'a DatasetBundle,
    guards: Option<(&'a OutputSink, &'a ViolationLog)>,
}

impl<'a> EnvironmentBuilder<'a> {
    pub fn new(profile: &'a CapabilityProfile, datasets: &'a DatasetBundle) -> Self {
        Self {
            profile,
            datasets,
            guards: None,
        }
    }

    /// Install the restricted guard layer first; prints go to `sink`
    pub fn with_guards(mut self, sink: &'a OutputSink, violations: &'a ViolationLog) -> Self {
        self.guards = Some((sink, violations));
        self
    }

    fn refuses_reserved(&self) -> bool {
        self.profile.guarded_attribute_access
    }

    fn is_refused(&self, name: &str) -> bool {
        self.refuses_reserved() && self.profile.attribute_policy.is_reserved(name)
    }

    /// Identifiers a build would bind, without an interpreter
    pub fn namespace_names(&self, variables: &VariableBindings) -> HashSet<String> {
        let mut names: HashSet<String> = self
            .profile
            .libraries
            .iter()
            .filter(|lib| lib.validate().is_ok())
            .flat_map(|lib| lib.binding_names().map(str::to_string))
            .collect();
        names.extend(self.datasets.names().map(dataset_binding_name));
        names.extend(variables.keys().cloned());
        names.retain(|name| !self.is_refused(name));
        names
    }

    pub fn build(&self, vm: &VirtualMachine, variables: &VariableBindings) -> PyResult<ExecutionNamespace> {
        let scope = vm.new_scope_with_builtins();
        scope.globals.set_item("__name__", vm.ctx.new_str("__main__").into(), vm)?;

        let mut namespace = ExecutionNamespace {
            scope,
            bindings: BTreeMap::new(),
        };

        if let Some((sink, violations)) = self.guards {
            for name in install_guards(vm, &namespace.scope, self.profile, sink, violations)? {
                namespace.bindings.insert(name, BindingLayer::Guard);
            }
        }

        self.bind_libraries(vm, &mut namespace)?;
        self.bind_datasets(vm, &mut namespace)?;
        self.bind_variables(vm, &mut namespace, variables)?;

        tracing::debug!(bindings = namespace.bindings.len(), "execution namespace assembled");
        Ok(namespace)
    }

    fn bind(
        &self,
        vm: &VirtualMachine,
        namespace: &mut ExecutionNamespace,
        name: &str,
        value: PyObjectRef,
        layer: BindingLayer,
    ) -> PyResult<()> {
        namespace.scope.globals.set_item(name, value, vm)?;
        namespace.bindings.insert(name.to_string(), layer);
        Ok(())
    }

    fn bind_libraries(&self, vm: &VirtualMachine, namespace: &mut ExecutionNamespace) -> PyResult<()> {
        for library in &self.profile.libraries {
            if let Err(reason) = library.validate() {
                tracing::warn!(library = %library.name, %reason, "skipping library binding");
                continue;
            }
            let module = match import_library(vm, library) {
                Ok(module) => module,
                Err(exc) => {
                    let reason = exc
                        .as_object()
                        .str(vm)
                        .map(|s| s.as_str().to_owned())
                        .unwrap_or_default();
                    tracing::warn!(
                        library = %library.name,
                        module = library.module_path(),
                        %reason,
                        "library unavailable, binding omitted"
                    );
                    continue;
                }
            };
            for name in library.binding_names() {
                if self.is_refused(name) {
                    tracing::warn!(library = %library.name, binding = name, "reserved library binding refused");
                    continue;
                }
                self.bind(vm, namespace, name, module.clone(), BindingLayer::Library)?;
            }
        }
        Ok(())
    }

    fn bind_datasets(&self, vm: &VirtualMachine, namespace: &mut ExecutionNamespace) -> PyResult<()> {
        let mut claimed: BTreeMap<String, &str> = BTreeMap::new();
        for (name, table) in self.datasets.iter() {
            let binding = dataset_binding_name(name);
            if let Some(first) = claimed.get(&binding) {
                tracing::warn!(
                    dataset = name,
                    binding = %binding,
                    bound_by = *first,
                    "dataset name collides with an earlier dataset, skipping"
                );
                continue;
            }
            if binding != name {
                tracing::warn!(dataset = name, binding = %binding, "dataset bound under a sanitized name");
            }
            if self.is_refused(&binding) {
                tracing::warn!(dataset = name, "reserved dataset name refused");
                continue;
            }
            match dataset_object(vm, name, table) {
                Ok(value) => {
                    self.bind(vm, namespace, &binding, value, BindingLayer::Dataset)?;
                    claimed.insert(binding, name);
                }
                Err(_) => tracing::warn!(dataset = name, "dataset could not be injected, skipping"),
            }
        }
        Ok(())
    }

    fn bind_variables(
        &self,
        vm: &VirtualMachine,
        namespace: &mut ExecutionNamespace,
        variables: &VariableBindings,
    ) -> PyResult<()> {
        for (name, value) in variables {
            if self.is_refused(name) {
                tracing::warn!(variable = %name, "reserved variable name refused");
                continue;
            }
            if let Err(reason) = validate_python_identifier(name) {
                tracing::warn!(variable = %name, %reason, "variable skipped");
                continue;
            }
            match json_to_pyobject(value, vm) {
                Ok(obj) => self.bind(vm, namespace, name, obj, BindingLayer::Variable)?,
                Err(_) => tracing::warn!(variable = %name, "variable could not be converted, skipping"),
            }
        }
        Ok(())
    }
}

/// Identifier a dataset is bound under
pub fn dataset_binding_name(name: &str) -> String {
    match validate_python_identifier(name) {
        Ok(()) => name.to_string(),
        Err(_) => to_python_identifier(name),
    }
}

/// `import <module path> as library` in a scratch scope, so dotted paths
/// resolve to the leaf module
fn import_library(vm: &VirtualMachine, library: &LibraryHandle) -> PyResult {
    let source = format!("import {} as library\n", library.module_path());
    let code = vm
        .compile(&source, rustpython_compiler::Mode::Exec, "<library>".to_owned())
        .map_err(|e| vm.new_import_error(e.to_string(), vm.ctx.new_str(library.module_path())))?;
    let scratch = vm.new_scope_with_builtins();
    vm.run_code_obj(code, scratch.clone())?;
    scratch.globals.get_item("library", vm)
}

/// A module object exposing the table: `name`, `columns`, `rows`, `shape`,
/// `column(name)` and `records()`
fn dataset_object(vm: &VirtualMachine, name: &str, table: &Arc<Table>) -> PyResult {
    let module = vm.new_module(name, vm.ctx.new_dict(), None);

    let columns: Vec<PyObjectRef> = table.columns.iter().map(|c| vm.ctx.new_str(c.as_str()).into()).collect();
    let rows: Vec<PyObjectRef> = table
        .rows
        .iter()
        .map(|row| {
            let cells = row.iter().map(|cell| cell_to_pyobject(cell, vm)).collect();
            vm.ctx.new_tuple(cells).into()
        })
        .collect();
    let shape = vm.ctx.new_tuple(vec![
        vm.ctx.new_int(table.row_count()).into(),
        vm.ctx.new_int(table.column_count()).into(),
    ]);

    module.set_attr("name", vm.ctx.new_str(name), vm)?;
    module.set_attr("columns", vm.ctx.new_list(columns), vm)?;
    module.set_attr("rows", vm.ctx.new_list(rows), vm)?;
    module.set_attr("shape", shape, vm)?;

    let column_fn = {
        let table = Arc::clone(table);
        vm.new_function("column", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let key = args
                .args
                .first()
                .and_then(|o| o.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()))
                .ok_or_else(|| vm.new_type_error("column() expects a column name".to_owned()))?;
            match table.column(&key) {
                Some(cells) => {
                    let values = cells.into_iter().map(|cell| cell_to_pyobject(cell, vm)).collect();
                    Ok(vm.ctx.new_list(values).into())
                }
                None => Err(vm.new_key_error(vm.ctx.new_str(key).into())),
            }
        })
    };
    module.set_attr("column", column_fn, vm)?;

    let records_fn = {
        let table = Arc::clone(table);
        vm.new_function("records", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let mut records = Vec::with_capacity(table.row_count());
            for row in &table.rows {
                let record = vm.ctx.new_dict();
                for (idx, column) in table.columns.iter().enumerate() {
                    let cell = row.get(idx).unwrap_or(&NULL_CELL);
                    record.set_item(column.as_str(), cell_to_pyobject(cell, vm), vm)?;
                }
                records.push(record.into());
            }
            Ok(vm.ctx.new_list(records).into())
        })
    };
    module.set_attr("records", records_fn, vm)?;

    Ok(module.into())
}
