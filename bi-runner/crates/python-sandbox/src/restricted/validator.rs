//! Static checks over the parsed snippet
//!
//! One walk over the AST both refuses constructs the restricted tier does not
//! allow and records every attribute read the rewrite must route through the
//! runtime guard.

use rustpython_parser::ast::{self, Ranged};
use std::collections::HashSet;

use super::guards::DISALLOWED_BUILTINS;
use crate::capability::{AttributePolicy, CapabilityProfile, STRING_FORMAT_ATTRIBUTES};
use crate::interpreter::line_of;
use crate::protocol::ExecutionError;

/// Byte offsets of one `value.attr` read in Load context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeLoad {
    /// Start of the whole attribute expression
    pub start: usize,
    /// Start of the `value` sub-expression
    pub value_start: usize,
    /// End of the `value` sub-expression
    pub value_end: usize,
    /// End of the whole attribute expression
    pub end: usize,
    pub attr: String,
}

/// What the rewrite needs from a snippet that passed validation
#[derive(Debug, Default)]
pub struct SnippetAnalysis {
    /// Attribute reads outside f-strings, outermost first
    pub attribute_loads: Vec<AttributeLoad>,
}

/// Validate `suite` (parsed from `source`) against `profile`.
///
/// `namespace_names` are the identifiers the environment will bind; a
/// disallowed builtin name is fine when the namespace or the snippet binds it.
/// The earliest violation in source order is reported.
pub fn validate_snippet(
    source: &str,
    suite: &ast::Suite,
    profile: &CapabilityProfile,
    namespace_names: &HashSet<String>,
) -> Result<SnippetAnalysis, ExecutionError> {
    let mut walker = Walker {
        profile,
        policy: &profile.attribute_policy,
        violations: Vec::new(),
        builtin_refs: Vec::new(),
        bound: HashSet::new(),
        loads: Vec::new(),
        fstring_depth: 0,
    };
    walker.visit_body(suite);

    let Walker {
        mut violations,
        builtin_refs,
        bound,
        loads,
        ..
    } = walker;

    for (offset, name) in builtin_refs {
        if !namespace_names.contains(&name) && !bound.contains(&name) {
            violations.push(Violation {
                offset,
                construct: name.clone(),
                message: format!("name '{}' is not available in the restricted tier", name),
            });
        }
    }

    match violations.into_iter().min_by_key(|v| v.offset) {
        Some(v) => Err(ExecutionError::violation(v.construct, v.message, Some(line_of(source, v.offset)))),
        None => Ok(SnippetAnalysis { attribute_loads: loads }),
    }
}

struct Violation {
    offset: usize,
    construct: String,
    message: String,
}

struct Walker<'a> {
    profile: &'a CapabilityProfile,
    policy: &'a AttributePolicy,
    violations: Vec<Violation>,
    /// Loads of disallowed builtin names, judged once all bindings are known
    builtin_refs: Vec<(usize, String)>,
    /// Names the snippet binds itself
    bound: HashSet<String>,
    loads: Vec<AttributeLoad>,
    fstring_depth: usize,
}

impl Walker<'_> {
    fn deny(&mut self, offset: usize, construct: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            offset,
            construct: construct.into(),
            message: message.into(),
        });
    }

    fn unsupported(&mut self, offset: usize, construct: &str) {
        self.deny(
            offset,
            construct,
            format!("'{}' is not allowed in the restricted tier", construct),
        );
    }

    /// A name the snippet introduces: must not be reserved
    fn bind(&mut self, name: &str, offset: usize) {
        if self.policy.is_reserved(name) {
            self.deny(
                offset,
                format!("name '{}'", name),
                format!("names starting with '{}' are reserved: '{}'", self.policy.reserved_prefix, name),
            );
        }
        self.bound.insert(name.to_string());
    }

    fn visit_body(&mut self, body: &[ast::Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_exprs(&mut self, exprs: &[ast::Expr]) {
        for expr in exprs {
            self.visit_expr(expr);
        }
    }

    fn visit_opt(&mut self, expr: &Option<Box<ast::Expr>>) {
        if let Some(expr) = expr {
            self.visit_expr(expr);
        }
    }

    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        let offset = usize::from(stmt.start());
        match stmt {
            ast::Stmt::FunctionDef(ast::StmtFunctionDef {
                name,
                args,
                body,
                decorator_list,
                returns,
                type_params,
                ..
            }) => {
                self.bind(name.as_str(), offset);
                if !type_params.is_empty() {
                    self.unsupported(offset, "type parameters");
                }
                self.visit_exprs(decorator_list);
                self.visit_arguments(args);
                self.visit_opt(returns);
                self.visit_body(body);
            }
            ast::Stmt::ClassDef(ast::StmtClassDef {
                name,
                bases,
                keywords,
                body,
                decorator_list,
                type_params,
                ..
            }) => {
                self.bind(name.as_str(), offset);
                if !type_params.is_empty() {
                    self.unsupported(offset, "type parameters");
                }
                self.visit_exprs(decorator_list);
                self.visit_exprs(bases);
                self.visit_keywords(keywords);
                self.visit_body(body);
            }
            ast::Stmt::Return(ast::StmtReturn { value, .. }) => self.visit_opt(value),
            ast::Stmt::Delete(ast::StmtDelete { targets, .. }) => self.visit_exprs(targets),
            ast::Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.visit_exprs(targets);
                self.visit_expr(value);
            }
            ast::Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.visit_expr(target);
                self.visit_expr(value);
            }
            ast::Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                self.visit_expr(target);
                self.visit_expr(annotation);
                self.visit_opt(value);
            }
            ast::Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.visit_expr(target);
                self.visit_expr(iter);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            ast::Stmt::While(ast::StmtWhile { test, body, orelse, .. })
            | ast::Stmt::If(ast::StmtIf { test, body, orelse, .. }) => {
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            ast::Stmt::With(ast::StmtWith { items, body, .. }) => {
                for item in items {
                    self.visit_expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.visit_expr(vars);
                    }
                }
                self.visit_body(body);
            }
            ast::Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                self.visit_opt(exc);
                self.visit_opt(cause);
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.visit_body(body);
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    let handler_offset = usize::from(handler.range.start());
                    if let Some(name) = &handler.name {
                        self.bind(name.as_str(), handler_offset);
                    }
                    self.visit_opt(&handler.type_);
                    self.visit_body(&handler.body);
                }
                self.visit_body(orelse);
                self.visit_body(finalbody);
            }
            ast::Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.visit_expr(test);
                self.visit_opt(msg);
            }
            ast::Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    let module = alias.name.as_str();
                    self.check_import(offset, module, &format!("import {}", module));
                    let binding = match &alias.asname {
                        Some(asname) => asname.as_str(),
                        None => module.split('.').next().unwrap_or(module),
                    };
                    self.bind(binding, offset);
                }
            }
            ast::Stmt::ImportFrom(ast::StmtImportFrom {
                module,
                names,
                level,
                ..
            }) => {
                let level = level.as_ref().map_or(0, |l| l.to_u32());
                let module = module.as_ref().map(|m| m.as_str()).unwrap_or_default();
                if level > 0 {
                    self.deny(
                        offset,
                        format!("from {}{} import", ".".repeat(level as usize), module),
                        "relative imports are not allowed in the restricted tier",
                    );
                } else {
                    self.check_import(offset, module, &format!("from {} import", module));
                }
                for alias in names {
                    let name = alias.name.as_str();
                    if name == "*" {
                        self.deny(
                            offset,
                            format!("from {} import *", module),
                            "star imports are not allowed in the restricted tier",
                        );
                        continue;
                    }
                    if self.policy.is_denied(name) {
                        self.deny(
                            offset,
                            format!("from {} import {}", module, name),
                            format!("importing '{}' is not allowed", name),
                        );
                    }
                    let binding = alias.asname.as_ref().map(|a| a.as_str()).unwrap_or(name);
                    self.bind(binding, offset);
                }
            }
            ast::Stmt::Expr(ast::StmtExpr { value, .. }) => self.visit_expr(value),
            ast::Stmt::Pass(_) | ast::Stmt::Break(_) | ast::Stmt::Continue(_) => {}
            ast::Stmt::AsyncFunctionDef(_) => self.unsupported(offset, "async def"),
            ast::Stmt::AsyncFor(_) => self.unsupported(offset, "async for"),
            ast::Stmt::AsyncWith(_) => self.unsupported(offset, "async with"),
            ast::Stmt::Global(_) => self.unsupported(offset, "global"),
            ast::Stmt::Nonlocal(_) => self.unsupported(offset, "nonlocal"),
            ast::Stmt::Match(_) => self.unsupported(offset, "match"),
            ast::Stmt::TryStar(_) => self.unsupported(offset, "try/except*"),
            ast::Stmt::TypeAlias(_) => self.unsupported(offset, "type alias"),
            #[allow(unreachable_patterns)]
            _ => self.unsupported(offset, "statement"),
        }
    }

    fn check_import(&mut self, offset: usize, module: &str, construct: &str) {
        let reserved_segment = module.split('.').any(|segment| self.policy.is_reserved(segment));
        if reserved_segment || !self.profile.is_module_approved(module) {
            self.deny(
                offset,
                construct,
                format!("module '{}' is not an approved library", module),
            );
        }
    }

    fn visit_arguments(&mut self, args: &ast::Arguments) {
        for arg in args.posonlyargs.iter().chain(&args.args).chain(&args.kwonlyargs) {
            self.visit_arg(&arg.def);
            self.visit_opt(&arg.default);
        }
        if let Some(arg) = &args.vararg {
            self.visit_arg(arg);
        }
        if let Some(arg) = &args.kwarg {
            self.visit_arg(arg);
        }
    }

    fn visit_arg(&mut self, arg: &ast::Arg) {
        self.bind(arg.arg.as_str(), usize::from(arg.range.start()));
        self.visit_opt(&arg.annotation);
    }

    fn visit_keywords(&mut self, keywords: &[ast::Keyword]) {
        for keyword in keywords {
            self.visit_expr(&keyword.value);
        }
    }

    fn visit_comprehensions(&mut self, generators: &[ast::Comprehension]) {
        for generator in generators {
            if generator.is_async {
                self.unsupported(usize::from(generator.target.start()), "async comprehension");
            }
            self.visit_expr(&generator.target);
            self.visit_expr(&generator.iter);
            self.visit_exprs(&generator.ifs);
        }
    }

    fn visit_expr(&mut self, expr: &ast::Expr) {
        let offset = usize::from(expr.start());
        match expr {
            ast::Expr::BoolOp(ast::ExprBoolOp { values, .. }) => self.visit_exprs(values),
            ast::Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.visit_expr(target);
                self.visit_expr(value);
            }
            ast::Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            ast::Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.visit_expr(operand),
            ast::Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                self.visit_arguments(args);
                self.visit_expr(body);
            }
            ast::Expr::IfExp(ast::ExprIfExp { test, body, orelse, .. }) => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
            ast::Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                for key in keys.iter().flatten() {
                    self.visit_expr(key);
                }
                self.visit_exprs(values);
            }
            ast::Expr::Set(ast::ExprSet { elts, .. })
            | ast::Expr::List(ast::ExprList { elts, .. })
            | ast::Expr::Tuple(ast::ExprTuple { elts, .. }) => self.visit_exprs(elts),
            ast::Expr::ListComp(ast::ExprListComp { elt, generators, .. })
            | ast::Expr::SetComp(ast::ExprSetComp { elt, generators, .. })
            | ast::Expr::GeneratorExp(ast::ExprGeneratorExp { elt, generators, .. }) => {
                self.visit_comprehensions(generators);
                self.visit_expr(elt);
            }
            ast::Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.visit_comprehensions(generators);
                self.visit_expr(key);
                self.visit_expr(value);
            }
            ast::Expr::Await(_) => self.unsupported(offset, "await"),
            ast::Expr::Yield(ast::ExprYield { value, .. }) => self.visit_opt(value),
            ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => self.visit_expr(value),
            ast::Expr::Compare(ast::ExprCompare { left, comparators, .. }) => {
                self.visit_expr(left);
                self.visit_exprs(comparators);
            }
            ast::Expr::Call(ast::ExprCall { func, args, keywords, .. }) => {
                self.visit_expr(func);
                self.visit_exprs(args);
                self.visit_keywords(keywords);
            }
            ast::Expr::FormattedValue(ast::ExprFormattedValue { value, format_spec, .. }) => {
                self.fstring_depth += 1;
                self.visit_expr(value);
                self.visit_opt(format_spec);
                self.fstring_depth -= 1;
            }
            ast::Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => {
                self.fstring_depth += 1;
                self.visit_exprs(values);
                self.fstring_depth -= 1;
            }
            ast::Expr::Constant(_) => {}
            ast::Expr::Attribute(ast::ExprAttribute {
                value,
                attr,
                ctx,
                range,
                ..
            }) => {
                let attr = attr.as_str();
                if self.policy.is_denied(attr) {
                    self.deny(
                        offset,
                        format!("attribute '{}'", attr),
                        format!("access to attribute '{}' is not allowed", attr),
                    );
                } else if self.fstring_depth > 0 && STRING_FORMAT_ATTRIBUTES.contains(&attr) {
                    // f-string fields are not rewritten, so the runtime guard never sees them
                    self.deny(
                        offset,
                        format!("attribute '{}'", attr),
                        format!("'{}' is not allowed inside f-strings", attr),
                    );
                }
                if matches!(ctx, ast::ExprContext::Load) && self.fstring_depth == 0 {
                    self.loads.push(AttributeLoad {
                        start: usize::from(range.start()),
                        value_start: usize::from(value.start()),
                        value_end: usize::from(value.end()),
                        end: usize::from(range.end()),
                        attr: attr.to_string(),
                    });
                }
                self.visit_expr(value);
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.visit_expr(value);
                self.visit_expr(slice);
            }
            ast::Expr::Starred(ast::ExprStarred { value, .. }) => self.visit_expr(value),
            ast::Expr::Name(ast::ExprName { id, ctx, .. }) => {
                let name = id.as_str();
                match ctx {
                    ast::ExprContext::Load => {
                        if self.policy.is_reserved(name) {
                            self.deny(
                                offset,
                                format!("name '{}'", name),
                                format!(
                                    "names starting with '{}' are reserved: '{}'",
                                    self.policy.reserved_prefix, name
                                ),
                            );
                        } else if DISALLOWED_BUILTINS.contains(&name) {
                            self.builtin_refs.push((offset, name.to_string()));
                        }
                    }
                    _ => self.bind(name, offset),
                }
            }
            ast::Expr::Slice(ast::ExprSlice { lower, upper, step, .. }) => {
                self.visit_opt(lower);
                self.visit_opt(upper);
                self.visit_opt(step);
            }
            #[allow(unreachable_patterns)]
            _ => self.unsupported(offset, "expression"),
        }
    }
}
