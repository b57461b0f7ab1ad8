//! Runtime guard layer for the restricted tier
//!
//! Installed into the snippet's globals before any other layer:
//! - `_getattr_`, the target of every rewritten attribute read
//! - guarded `getattr` / `hasattr`
//! - a `print` hook writing straight into the capture sink
//! - denial stubs shadowing every builtin outside [`SAFE_BUILTINS`]
//!
//! The interpreter's `__import__` is also replaced so that imports issued by
//! snippet code only reach approved libraries. Attribute reads that land on a
//! module outside the approved set are refused too, so a library cannot hand
//! out the modules it imported itself. Every refusal is recorded in the
//! [`ViolationLog`], so a snippet that swallows the exception still fails.

use rustpython_vm::builtins::{PyBaseExceptionRef, PyModule, PyStr, PyType};
use rustpython_vm::function::FuncArgs;
use rustpython_vm::scope::Scope;
use rustpython_vm::{AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::capability::{AttributePolicy, CapabilityProfile, STRING_FORMAT_ATTRIBUTES};
use crate::output::OutputSink;

/// Name of the attribute-read hook rewritten code calls
pub const GETATTR_HOOK: &str = "_getattr_";

/// Builtins snippets may reach. Exception classes are allowed separately.
pub const SAFE_BUILTINS: &[&str] = &[
    "abs", "all", "any", "ascii", "bin", "bool", "bytearray", "bytes", "callable",
    "chr", "complex", "dict", "divmod", "enumerate", "filter", "float", "format",
    "frozenset", "getattr", "hasattr", "hash", "hex", "id", "int", "isinstance",
    "issubclass", "iter", "len", "list", "map", "max", "min", "next", "oct", "ord",
    "pow", "print", "range", "repr", "reversed", "round", "set", "slice", "sorted",
    "str", "sum", "tuple", "zip", "Ellipsis", "NotImplemented",
];

/// Builtins whose mere mention is refused at compile time, unless the
/// namespace or the snippet binds the name itself
pub const DISALLOWED_BUILTINS: &[&str] = &[
    "eval", "exec", "compile", "open", "input", "breakpoint", "globals", "locals",
    "vars", "dir", "memoryview", "type", "object", "super", "setattr", "delattr",
    "help", "exit", "quit", "classmethod", "staticmethod",
];

/// Modules refused as attribute results even when a profile approves them
pub const ALWAYS_DENIED_MODULES: &[&str] = &["sys", "builtins"];

/// A refusal raised while the snippet ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeViolation {
    pub construct: String,
    pub message: String,
}

/// Refusals recorded during one execution
#[derive(Debug, Clone, Default)]
pub struct ViolationLog {
    entries: Arc<Mutex<Vec<RuntimeViolation>>>,
}

impl ViolationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, construct: impl Into<String>, message: impl Into<String>) {
        let violation = RuntimeViolation {
            construct: construct.into(),
            message: message.into(),
        };
        tracing::debug!(construct = %violation.construct, "restricted runtime refusal");
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(violation);
    }

    pub fn first(&self) -> Option<RuntimeViolation> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .first()
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.is_empty())
            .unwrap_or(false)
    }
}

fn permission_error(vm: &VirtualMachine, message: String) -> PyBaseExceptionRef {
    vm.new_exception_msg(vm.ctx.exceptions.permission_error.to_owned(), message)
}

/// Install the guard layer into `scope` and the import hook into `vm`.
/// Returns the names bound into the scope.
pub fn install_guards(
    vm: &VirtualMachine,
    scope: &Scope,
    profile: &CapabilityProfile,
    sink: &OutputSink,
    violations: &ViolationLog,
) -> PyResult<Vec<String>> {
    let mut bound = install_denial_stubs(vm, scope, violations)?;

    let original_getattr = vm.builtins.get_attr("getattr", vm)?;
    let original_hasattr = vm.builtins.get_attr("hasattr", vm)?;
    let rules = Arc::new(LookupRules {
        policy: profile.attribute_policy.clone(),
        approved: profile.approved_modules(),
    });

    let hook = {
        let (rules, log, original) = (Arc::clone(&rules), violations.clone(), original_getattr.clone());
        vm.new_function(GETATTR_HOOK, move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            guarded_lookup(args, vm, &rules, &log, &original)
        })
    };
    scope.globals.set_item(GETATTR_HOOK, hook.into(), vm)?;

    let getattr = {
        let (rules, log, original) = (Arc::clone(&rules), violations.clone(), original_getattr);
        vm.new_function("getattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            guarded_lookup(args, vm, &rules, &log, &original)
        })
    };
    scope.globals.set_item("getattr", getattr.into(), vm)?;

    let hasattr = {
        let (rules, log, original) = (Arc::clone(&rules), violations.clone(), original_hasattr);
        vm.new_function("hasattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            guarded_lookup(args, vm, &rules, &log, &original)
        })
    };
    scope.globals.set_item("hasattr", hasattr.into(), vm)?;

    let print = {
        let sink = sink.clone();
        vm.new_function("print", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            print_to_sink(args, vm, &sink)
        })
    };
    scope.globals.set_item("print", print.into(), vm)?;

    bound.extend([GETATTR_HOOK, "getattr", "hasattr", "print"].map(str::to_string));

    install_import_hook(vm, rules, violations.clone())?;
    Ok(bound)
}

/// Shadow every builtin outside the safe set with a stub that refuses to run
fn install_denial_stubs(vm: &VirtualMachine, scope: &Scope, violations: &ViolationLog) -> PyResult<Vec<String>> {
    let base_exception = vm.ctx.exceptions.base_exception_type.as_object();
    let builtins = vm.builtins.dict();
    let mut denied = Vec::new();

    for (key, value) in &*builtins {
        let Some(name) = key.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()) else {
            continue;
        };
        // Dunders are unreachable from validated source
        if name.starts_with('_') || SAFE_BUILTINS.contains(&name.as_str()) {
            continue;
        }
        if value.is_subclass(base_exception, vm).unwrap_or(false) {
            continue;
        }
        denied.push(name);
    }

    for name in &denied {
        let log = violations.clone();
        let stub_name = name.clone();
        let stub = vm.new_function("unavailable", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let message = format!("'{}' is not available in the restricted tier", stub_name);
            log.record(stub_name.clone(), message.clone());
            Err(permission_error(vm, message))
        });
        scope.globals.set_item(name.as_str(), stub.into(), vm)?;
    }

    Ok(denied)
}

/// What the attribute guard checks a lookup against
struct LookupRules {
    policy: AttributePolicy,
    /// Top-level names of modules an attribute read may return
    approved: BTreeSet<String>,
}

impl LookupRules {
    fn allows_module(&self, module_name: &str) -> bool {
        let top = module_name.split('.').next().unwrap_or_default();
        !ALWAYS_DENIED_MODULES.contains(&top) && self.approved.contains(top)
    }
}

/// Shared body of `_getattr_`, `getattr` and `hasattr`: vet the name,
/// delegate to the interpreter's own implementation, then vet the result
fn guarded_lookup(
    args: FuncArgs,
    vm: &VirtualMachine,
    rules: &LookupRules,
    violations: &ViolationLog,
    original: &PyObjectRef,
) -> PyResult {
    let (Some(obj), Some(name)) = (args.args.first(), args.args.get(1)) else {
        return Err(vm.new_type_error("attribute lookup expects an object and a name".to_owned()));
    };
    let name = name
        .downcast_ref::<PyStr>()
        .map(|s| s.as_str().to_owned())
        .ok_or_else(|| vm.new_type_error("attribute name must be string".to_owned()))?;

    check_attribute(vm, obj, &name, &rules.policy, violations)?;
    let value = original.call(args, vm)?;
    check_module_result(vm, &value, &name, rules, violations)?;
    Ok(value)
}

/// Refuse module objects outside the approved libraries, however they were reached
fn check_module_result(
    vm: &VirtualMachine,
    value: &PyObjectRef,
    attribute: &str,
    rules: &LookupRules,
    violations: &ViolationLog,
) -> PyResult<()> {
    if value.downcast_ref::<PyModule>().is_none() {
        return Ok(());
    }
    let module_name = value
        .get_attr("__name__", vm)
        .ok()
        .and_then(|name| name.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()))
        .unwrap_or_default();
    if rules.allows_module(&module_name) {
        return Ok(());
    }

    let message = format!(
        "attribute '{}' leads to module '{}', which is not an approved library",
        attribute, module_name
    );
    violations.record(format!("module '{}'", module_name), message.clone());
    Err(permission_error(vm, message))
}

/// `format` and `format_map` reached through a string or through `str` itself
fn is_string_receiver(obj: &PyObjectRef, vm: &VirtualMachine) -> bool {
    obj.downcast_ref::<PyStr>().is_some()
        || obj
            .downcast_ref::<PyType>()
            .map(|ty| ty.fast_issubclass(vm.ctx.types.str_type))
            .unwrap_or(false)
}

fn check_attribute(
    vm: &VirtualMachine,
    obj: &PyObjectRef,
    name: &str,
    policy: &AttributePolicy,
    violations: &ViolationLog,
) -> PyResult<()> {
    let refusal = if policy.is_reserved(name) {
        Some(format!("access to reserved attribute '{}' is not allowed", name))
    } else if policy.denied_names.contains(name) {
        Some(format!("access to attribute '{}' is not allowed", name))
    } else if STRING_FORMAT_ATTRIBUTES.contains(&name) && is_string_receiver(obj, vm) {
        Some(format!("str.{} is not allowed; use f-strings or concatenation", name))
    } else {
        None
    };

    match refusal {
        Some(message) => {
            violations.record(format!("attribute '{}'", name), message.clone());
            Err(permission_error(vm, message))
        }
        None => Ok(()),
    }
}

fn kwarg_text(args: &FuncArgs, key: &str, default: &str, vm: &VirtualMachine) -> PyResult<String> {
    match args.kwargs.get(key) {
        None => Ok(default.to_owned()),
        Some(value) if vm.is_none(value) => Ok(default.to_owned()),
        Some(value) => value
            .downcast_ref::<PyStr>()
            .map(|s| s.as_str().to_owned())
            .ok_or_else(|| vm.new_type_error(format!("{} must be None or a string", key))),
    }
}

/// `print(*values, sep=' ', end='\n')`; `file` and `flush` are accepted and ignored
fn print_to_sink(args: FuncArgs, vm: &VirtualMachine, sink: &OutputSink) -> PyResult {
    let sep = kwarg_text(&args, "sep", " ", vm)?;
    let end = kwarg_text(&args, "end", "\n", vm)?;

    let mut output = String::new();
    for (i, arg) in args.args.iter().enumerate() {
        if i > 0 {
            output.push_str(&sep);
        }
        output.push_str(arg.str(vm)?.as_str());
    }
    output.push_str(&end);
    sink.write(&output);
    Ok(vm.ctx.none())
}

/// Imports issued from snippet code run with `__name__ == "__main__"`.
/// Library internals importing their own dependencies, and the interpreter's
/// own imports (which pass no globals), are let through.
fn is_snippet_import(args: &FuncArgs, vm: &VirtualMachine) -> bool {
    let Some(globals) = args.args.get(1).filter(|globals| !vm.is_none(globals)) else {
        return false;
    };
    match vm.call_method(globals, "get", (vm.ctx.new_str("__name__"),)) {
        Ok(name) => name
            .downcast_ref::<PyStr>()
            .map(|s| s.as_str() == "__main__")
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn install_import_hook(vm: &VirtualMachine, rules: Arc<LookupRules>, violations: ViolationLog) -> PyResult<()> {
    let original_import = vm.builtins.get_attr("__import__", vm)?;

    let hook = vm.new_function("__import__", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        if !is_snippet_import(&args, vm) {
            return original_import.call(args, vm);
        }

        let module_name = args
            .args
            .first()
            .and_then(|o| o.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()))
            .unwrap_or_default();
        let level = args
            .args
            .get(4)
            .and_then(|o| i64::try_from_object(vm, o.clone()).ok())
            .unwrap_or(0);
        let top_level = module_name.split('.').next().unwrap_or_default();

        if level > 0 || !rules.approved.contains(top_level) {
            let message = format!("module '{}' is not an approved library", module_name);
            violations.record(format!("import {}", module_name), message.clone());
            return Err(vm.new_import_error(message, vm.ctx.new_str(module_name)));
        }

        let fromlist = args.args.get(3).cloned();
        let module = original_import.call(args, vm)?;

        // `from approved import submodule` must not hand out unapproved modules
        if let Some(fromlist) = fromlist.filter(|f| !vm.is_none(f)) {
            let names = Vec::<PyObjectRef>::try_from_object(vm, fromlist)?;
            for name in names {
                let Some(name) = name.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()) else {
                    continue;
                };
                if let Ok(value) = module.get_attr(&vm.ctx.new_str(name.as_str()), vm) {
                    check_module_result(vm, &value, &name, &rules, &violations)?;
                }
            }
        }
        Ok(module)
    });

    vm.builtins.set_attr("__import__", hook, vm)?;
    Ok(())
}
