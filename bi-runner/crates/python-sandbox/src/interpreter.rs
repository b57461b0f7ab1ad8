//! RustPython interpreter setup and value/error translation
//!
//! Every execution gets its own interpreter, so nothing a snippet binds can
//! outlive the call.

use rustpython_parser::{ast, Parse, ParseError};
use rustpython_vm::builtins::{PyBaseExceptionRef, PyCode, PyDict, PyFloat, PyInt, PyList, PyStr, PyTuple};
use rustpython_vm::{AsObject, Interpreter, PyObjectRef, PyRef, PyResult, Settings, VirtualMachine};
use serde_json::Value;

use crate::dataset::CellValue;
use crate::protocol::ExecutionError;

/// Source name compiled snippets are reported under
pub const SNIPPET_SOURCE_NAME: &str = "<snippet>";

/// Create a fresh interpreter with the native and frozen standard library
pub fn create_interpreter() -> Interpreter {
    let mut settings = Settings::default();
    settings.isolated = true;
    settings.user_site_directory = false;
    settings.import_site = false;

    Interpreter::with_init(settings, |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
    })
}

/// Parse `code` into a module body, translating parse failures
pub fn parse_snippet(code: &str) -> Result<ast::Suite, ExecutionError> {
    ast::Suite::parse(code, SNIPPET_SOURCE_NAME).map_err(|err| parse_error_to_execution_error(code, &err))
}

pub fn parse_error_to_execution_error(code: &str, err: &ParseError) -> ExecutionError {
    let offset = usize::from(err.offset);
    let (line, column) = line_and_column(code, offset);
    ExecutionError::compilation(err.error.to_string(), Some(line), Some(column))
}

/// 1-based line and column of a byte offset into `code`
pub fn line_and_column(code: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(code.len());
    let before = code.get(..offset).unwrap_or(code);
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = before[line_start..].chars().count() + 1;
    (line, column)
}

pub fn line_of(code: &str, offset: usize) -> usize {
    line_and_column(code, offset).0
}

/// Compile source the parser accepted; code generation can still refuse it
/// (e.g. `return` outside a function).
pub fn compile_snippet(vm: &VirtualMachine, source: &str) -> Result<PyRef<PyCode>, ExecutionError> {
    vm.compile(source, rustpython_compiler::Mode::Exec, SNIPPET_SOURCE_NAME.to_owned())
        .map_err(|e| ExecutionError::compilation(e.to_string(), None, None))
}

/// Translate an exception that escaped a snippet
pub fn exception_to_execution_error(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> ExecutionError {
    let exception = exc.class().name().to_string();
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "<unprintable exception>".to_owned());

    let mut traceback = String::new();
    let traceback = match vm.write_exception(&mut traceback, exc) {
        Ok(()) if !traceback.is_empty() => Some(traceback),
        _ => None,
    };

    ExecutionError::Runtime {
        exception,
        message,
        traceback,
    }
}

/// Convert a JSON value to a Python object
pub fn json_to_pyobject(value: &Value, vm: &VirtualMachine) -> PyResult {
    match value {
        Value::Null => Ok(vm.ctx.none()),
        Value::Bool(b) => Ok(vm.ctx.new_bool(*b).into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(vm.ctx.new_int(i).into())
            } else if let Some(u) = n.as_u64() {
                Ok(vm.ctx.new_int(u).into())
            } else if let Some(f) = n.as_f64() {
                Ok(vm.ctx.new_float(f).into())
            } else {
                Ok(vm.ctx.none())
            }
        }
        Value::String(s) => Ok(vm.ctx.new_str(s.clone()).into()),
        Value::Array(arr) => {
            let items: Result<Vec<_>, _> = arr.iter().map(|v| json_to_pyobject(v, vm)).collect();
            Ok(vm.ctx.new_list(items?).into())
        }
        Value::Object(obj) => {
            let dict = PyDict::new_ref(&vm.ctx);
            for (k, v) in obj {
                let py_value = json_to_pyobject(v, vm)?;
                dict.set_item(k.as_str(), py_value, vm)?;
            }
            Ok(dict.into())
        }
    }
}

/// Convert a Python object to JSON; unknown types fall back to `str(obj)`
pub fn pyobject_to_json(obj: &PyObjectRef, vm: &VirtualMachine) -> PyResult<Value> {
    if vm.is_none(obj) {
        return Ok(Value::Null);
    }

    // bool before int: bool subclasses int
    if obj.class().is(vm.ctx.types.bool_type) {
        if let Ok(b) = obj.try_to_value::<bool>(vm) {
            return Ok(Value::Bool(b));
        }
    }

    if let Some(i) = obj.downcast_ref::<PyInt>() {
        if let Ok(n) = i.try_to_primitive::<i64>(vm) {
            return Ok(Value::Number(n.into()));
        }
    }

    if let Some(f) = obj.downcast_ref::<PyFloat>() {
        return Ok(serde_json::Number::from_f64(f.to_f64())
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }

    if let Some(s) = obj.downcast_ref::<PyStr>() {
        return Ok(Value::String(s.as_str().to_string()));
    }

    if let Some(list) = obj.downcast_ref::<PyList>() {
        let items: Result<Vec<Value>, _> = list.borrow_vec().iter().map(|item| pyobject_to_json(item, vm)).collect();
        return Ok(Value::Array(items?));
    }

    if let Some(tuple) = obj.downcast_ref::<PyTuple>() {
        let items: Result<Vec<Value>, _> = tuple.as_slice().iter().map(|item| pyobject_to_json(item, vm)).collect();
        return Ok(Value::Array(items?));
    }

    if let Some(dict) = obj.downcast_ref::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (k, v) in dict {
            let key_str: String = k.str(vm)?.to_string();
            map.insert(key_str, pyobject_to_json(&v, vm)?);
        }
        return Ok(Value::Object(map));
    }

    let s: String = obj.str(vm)?.to_string();
    Ok(Value::String(s))
}

/// Convert a dataset cell to a Python object. Timestamps stay ISO strings.
pub fn cell_to_pyobject(cell: &CellValue, vm: &VirtualMachine) -> PyObjectRef {
    match cell {
        CellValue::Null => vm.ctx.none(),
        CellValue::Bool(b) => vm.ctx.new_bool(*b).into(),
        CellValue::Int(i) => vm.ctx.new_int(*i).into(),
        CellValue::Float(f) => vm.ctx.new_float(*f).into(),
        CellValue::DateTime(s) | CellValue::Text(s) => vm.ctx.new_str(s.as_str()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_and_column() {
        let code = "x = 1\ny = (\nprint(z)";
        assert_eq!(line_and_column(code, 0), (1, 1));
        assert_eq!(line_and_column(code, 6), (2, 1));
        assert_eq!(line_and_column(code, 10), (2, 5));
        assert_eq!(line_and_column(code, 1000).0, 3);
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = parse_snippet("x = 1\nif x >:\n    pass").unwrap_err();
        match err {
            ExecutionError::Compilation { line, column, .. } => {
                assert_eq!(line, Some(2));
                assert!(column.is_some());
            }
            other => panic!("expected compilation error, got {:?}", other),
        }
    }

    #[test]
    fn test_comment_only_snippet_parses_empty() {
        assert!(parse_snippet("").unwrap().is_empty());
        assert!(parse_snippet("   \n\n").unwrap().is_empty());
        assert!(parse_snippet("# just a note\n").unwrap().is_empty());
    }

    #[test]
    fn test_json_round_trip_through_interpreter() {
        let interpreter = create_interpreter();
        interpreter.enter(|vm| {
            let value = serde_json::json!({"region": "north", "units": [1, 2, 3], "share": 0.5, "active": true, "note": null});
            let obj = json_to_pyobject(&value, vm).unwrap();
            assert_eq!(pyobject_to_json(&obj, vm).unwrap(), value);
        });
    }
}
