//! Capability profiles
//!
//! A profile declares what a snippet may see: which library modules are
//! pre-bound (and importable, in the restricted tier), which builtins are
//! reachable, and whether attribute reads go through the runtime guard.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::identifier::validate_python_identifier;
use crate::protocol::ExecutionTier;

/// A library made available to snippets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryHandle {
    /// Canonical binding name, e.g. `statistics`
    pub name: String,
    /// Dotted module path to import, e.g. `os.path`. Defaults to `name`.
    #[serde(default)]
    pub module: Option<String>,
    /// Short aliases bound to the same module, e.g. `stats`
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl LibraryHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: None,
            aliases: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn module_path(&self) -> &str {
        self.module.as_deref().unwrap_or(&self.name)
    }

    /// First segment of the module path; what the import allow-list matches on
    pub fn top_level_module(&self) -> &str {
        self.module_path().split('.').next().unwrap_or_default()
    }

    /// Every identifier this handle binds in a namespace
    pub fn binding_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Reject handles that could not be imported or bound as written.
    pub fn validate(&self) -> Result<(), String> {
        for segment in self.module_path().split('.') {
            validate_python_identifier(segment)
                .map_err(|e| format!("library '{}': invalid module path: {}", self.name, e))?;
        }
        for binding in self.binding_names() {
            validate_python_identifier(binding)
                .map_err(|e| format!("library '{}': invalid binding: {}", self.name, e))?;
        }
        Ok(())
    }
}

/// Which builtins are reachable by snippets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinSet {
    Full,
    SafeSubset,
}

/// Rules the runtime attribute guard applies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributePolicy {
    /// Attribute and identifier names starting with this prefix are refused
    pub reserved_prefix: String,
    /// Attribute names refused regardless of prefix
    pub denied_names: BTreeSet<String>,
}

/// Interpreter internals reachable without an underscore
pub const DENIED_ATTRIBUTES: &[&str] = &[
    "gi_frame",
    "gi_code",
    "gi_yieldfrom",
    "cr_frame",
    "cr_code",
    "cr_await",
    "ag_frame",
    "ag_code",
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_back",
    "f_code",
    "tb_frame",
    "tb_next",
    "co_code",
    "mro",
];

/// Attributes refused only on strings, where they reach the formatting mini-language
pub const STRING_FORMAT_ATTRIBUTES: &[&str] = &["format", "format_map"];

impl Default for AttributePolicy {
    fn default() -> Self {
        Self {
            reserved_prefix: "_".to_string(),
            denied_names: DENIED_ATTRIBUTES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AttributePolicy {
    /// Whether `name` is reserved (prefixed) or explicitly denied.
    /// A bare `_` is an ordinary throwaway name and stays allowed.
    pub fn is_denied(&self, name: &str) -> bool {
        self.is_reserved(name) || self.denied_names.contains(name)
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        !self.reserved_prefix.is_empty() && name != "_" && name.starts_with(&self.reserved_prefix)
    }
}

/// What an execution is allowed to touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub libraries: Vec<LibraryHandle>,
    pub builtin_set: BuiltinSet,
    pub guarded_attribute_access: bool,
    #[serde(default)]
    pub attribute_policy: AttributePolicy,
}

impl CapabilityProfile {
    pub fn permissive(libraries: Vec<LibraryHandle>) -> Self {
        Self {
            libraries,
            builtin_set: BuiltinSet::Full,
            guarded_attribute_access: false,
            attribute_policy: AttributePolicy::default(),
        }
    }

    pub fn restricted(libraries: Vec<LibraryHandle>) -> Self {
        Self {
            libraries,
            builtin_set: BuiltinSet::SafeSubset,
            guarded_attribute_access: true,
            attribute_policy: AttributePolicy::default(),
        }
    }

    pub fn for_tier(tier: ExecutionTier, libraries: Vec<LibraryHandle>) -> Self {
        match tier {
            ExecutionTier::Permissive => Self::permissive(libraries),
            ExecutionTier::Restricted => Self::restricted(libraries),
        }
    }

    /// Top-level module names snippets may import in the restricted tier
    pub fn approved_modules(&self) -> BTreeSet<String> {
        self.libraries
            .iter()
            .map(|lib| lib.top_level_module().to_string())
            .collect()
    }

    pub fn is_module_approved(&self, module: &str) -> bool {
        let top = module.split('.').next().unwrap_or_default();
        self.libraries.iter().any(|lib| lib.top_level_module() == top)
    }

    /// Identifiers bound by the library layer, in binding order
    pub fn library_names(&self) -> Vec<String> {
        self.libraries
            .iter()
            .flat_map(|lib| lib.binding_names().map(str::to_string))
            .collect()
    }
}

/// Analysis libraries bound by default. The pure-Python stdlib stands in for
/// the dataframe and plotting stack an embedded interpreter cannot load.
pub fn default_libraries() -> Vec<LibraryHandle> {
    vec![
        LibraryHandle::new("math"),
        LibraryHandle::new("json"),
        LibraryHandle::new("statistics").with_alias("stats"),
        LibraryHandle::new("datetime").with_alias("dt"),
        LibraryHandle::new("collections"),
        LibraryHandle::new("itertools"),
        LibraryHandle::new("functools"),
        LibraryHandle::new("re"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_profile_guards_attributes() {
        let profile = CapabilityProfile::restricted(default_libraries());
        assert_eq!(profile.builtin_set, BuiltinSet::SafeSubset);
        assert!(profile.guarded_attribute_access);

        let permissive = CapabilityProfile::for_tier(ExecutionTier::Permissive, vec![]);
        assert_eq!(permissive.builtin_set, BuiltinSet::Full);
        assert!(!permissive.guarded_attribute_access);
    }

    #[test]
    fn test_attribute_policy() {
        let policy = AttributePolicy::default();
        assert!(policy.is_denied("__class__"));
        assert!(policy.is_denied("_private"));
        assert!(policy.is_denied("gi_frame"));
        assert!(policy.is_denied("mro"));
        assert!(!policy.is_denied("_"));
        assert!(!policy.is_denied("upper"));
        assert!(!policy.is_denied("format"));
    }

    #[test]
    fn test_module_approval_uses_top_level_name() {
        let profile = CapabilityProfile::restricted(vec![
            LibraryHandle::new("math"),
            LibraryHandle::new("path").with_module("os.path"),
        ]);
        assert!(profile.is_module_approved("math"));
        assert!(profile.is_module_approved("os.path"));
        assert!(profile.is_module_approved("os"));
        assert!(!profile.is_module_approved("subprocess"));
        assert_eq!(
            profile.approved_modules().into_iter().collect::<Vec<_>>(),
            vec!["math".to_string(), "os".to_string()]
        );
    }

    #[test]
    fn test_library_names_include_aliases() {
        let profile = CapabilityProfile::permissive(default_libraries());
        let names = profile.library_names();
        assert!(names.contains(&"statistics".to_string()));
        assert!(names.contains(&"stats".to_string()));
        assert!(names.contains(&"dt".to_string()));
    }

    #[test]
    fn test_library_handle_validation() {
        assert!(LibraryHandle::new("math").validate().is_ok());
        assert!(LibraryHandle::new("json").with_alias("j").validate().is_ok());
        assert!(LibraryHandle::new("bad").with_module("os; import sys").validate().is_err());
        assert!(LibraryHandle::new("x").with_alias("not valid").validate().is_err());
    }

    #[test]
    fn test_profile_deserializes_with_default_policy() {
        let profile: CapabilityProfile = serde_json::from_value(serde_json::json!({
            "libraries": [{"name": "statistics", "aliases": ["stats"]}],
            "builtin_set": "safe_subset",
            "guarded_attribute_access": true
        }))
        .unwrap();
        assert_eq!(profile.attribute_policy, AttributePolicy::default());
        assert_eq!(profile.libraries[0].module_path(), "statistics");
    }
}
