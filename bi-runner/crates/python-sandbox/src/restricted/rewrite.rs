//! Source rewrite routing attribute reads through the runtime guard
//!
//! `value.attr` in Load context becomes `_getattr_(value, "attr")`. Edits are
//! plain text insertions and replacements that never add a newline, so line
//! numbers in tracebacks still match the submitted snippet.

use super::guards::GETATTR_HOOK;
use super::validator::AttributeLoad;
use crate::interpreter::line_of;
use crate::protocol::ExecutionError;

#[derive(Debug)]
struct Edit {
    start: usize,
    end: usize,
    text: String,
}

/// Rewrite every recorded attribute read in `source`
pub fn guard_attribute_reads(source: &str, loads: &[AttributeLoad]) -> Result<String, ExecutionError> {
    if loads.is_empty() {
        return Ok(source.to_string());
    }

    let mut edits = Vec::with_capacity(loads.len() * 2);
    for load in loads {
        let segment = source.get(load.value_end..load.end).ok_or_else(|| unguardable(source, load))?;
        let dot = find_attribute_dot(segment).ok_or_else(|| unguardable(source, load))?;
        let start = balanced_start(source, load, count_closers(&segment[..dot]));

        edits.push(Edit {
            start,
            end: start,
            text: format!("{}(", GETATTR_HOOK),
        });
        edits.push(Edit {
            start: load.value_end,
            end: load.end,
            text: format!("{}, \"{}\")", &segment[..dot], load.attr),
        });
    }

    // Stable: loads arrive outermost first, so nested hooks open in the right order
    edits.sort_by_key(|edit| edit.start);

    let mut output = String::with_capacity(source.len() + edits.len() * 8);
    let mut cursor = 0;
    for edit in &edits {
        if edit.start < cursor {
            return Err(ExecutionError::violation(
                "attribute access",
                "overlapping attribute rewrite",
                Some(line_of(source, edit.start)),
            ));
        }
        output.push_str(&source[cursor..edit.start]);
        output.push_str(&edit.text);
        cursor = edit.end;
    }
    output.push_str(&source[cursor..]);
    Ok(output)
}

fn unguardable(source: &str, load: &AttributeLoad) -> ExecutionError {
    ExecutionError::violation(
        format!("attribute '{}'", load.attr),
        format!("attribute access '.{}' could not be guarded", load.attr),
        Some(line_of(source, load.start)),
    )
}

/// `)` characters between the value and the dot, comments excluded
fn count_closers(between: &str) -> usize {
    let mut in_comment = false;
    let mut closers = 0;
    for c in between.chars() {
        match c {
            '\n' => in_comment = false,
            _ if in_comment => {}
            '#' => in_comment = true,
            ')' => closers += 1,
            _ => {}
        }
    }
    closers
}

/// Where the hook call must open so that it encloses every `(` closed
/// between the value and the dot. The parser may or may not include the
/// opening parens of a parenthesized value in the attribute's range.
fn balanced_start(source: &str, load: &AttributeLoad, closers: usize) -> usize {
    let openers = source
        .get(load.start..load.value_start)
        .map(|prefix| prefix.matches('(').count())
        .unwrap_or(0);
    let mut missing = closers.saturating_sub(openers);
    let mut start = load.start;
    let bytes = source.as_bytes();
    while missing > 0 && start > 0 {
        let mut probe = start;
        while probe > 0 && bytes[probe - 1].is_ascii_whitespace() {
            probe -= 1;
        }
        if probe > 0 && bytes[probe - 1] == b'(' {
            start = probe - 1;
            missing -= 1;
        } else {
            break;
        }
    }
    start
}

/// Byte index of the `.` between the end of the value and the attribute
/// name. Only closing parens, whitespace, line continuations and comments
/// can sit in between.
fn find_attribute_dot(segment: &str) -> Option<usize> {
    let mut in_comment = false;
    for (i, c) in segment.char_indices() {
        match c {
            '\n' => in_comment = false,
            _ if in_comment => {}
            '#' => in_comment = true,
            '.' => return Some(i),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{default_libraries, CapabilityProfile};
    use crate::interpreter::parse_snippet;
    use crate::restricted::validator::validate_snippet;
    use std::collections::HashSet;

    fn rewrite(source: &str) -> String {
        let profile = CapabilityProfile::restricted(default_libraries());
        let suite = parse_snippet(source).unwrap();
        let analysis = validate_snippet(source, &suite, &profile, &HashSet::new()).unwrap();
        guard_attribute_reads(source, &analysis.attribute_loads).unwrap()
    }

    #[test]
    fn test_simple_attribute() {
        assert_eq!(rewrite("x = s.upper()"), "x = _getattr_(s, \"upper\")()");
    }

    #[test]
    fn test_chained_attributes_nest() {
        assert_eq!(rewrite("y = a.b.c"), "y = _getattr_(_getattr_(a, \"b\"), \"c\")");
    }

    #[test]
    fn test_parenthesized_value() {
        assert_eq!(rewrite("z = (a + b).real"), "z = _getattr_((a + b), \"real\")");
    }

    #[test]
    fn test_call_result_attribute() {
        assert_eq!(
            rewrite("n = sales.column('units').count(3)"),
            "n = _getattr_(_getattr_(sales, \"column\")('units'), \"count\")(3)"
        );
    }

    #[test]
    fn test_store_target_keeps_attribute() {
        assert_eq!(rewrite("a.b.c = 1"), "_getattr_(a, \"b\").c = 1");
    }

    #[test]
    fn test_fstring_fields_untouched() {
        assert_eq!(rewrite("print(f\"{row.total}\")"), "print(f\"{row.total}\")");
    }

    #[test]
    fn test_multiline_chain_keeps_line_count() {
        let source = "v = (data\n     .copy())\nprint(v)";
        let rewritten = rewrite(source);
        assert_eq!(rewritten.lines().count(), source.lines().count());
        assert!(rewritten.contains("_getattr_(data\n     , \"copy\")()"));
    }

    #[test]
    fn test_start_walks_back_over_unowned_parens() {
        let source = "z = ( a + b ).real";
        let load = AttributeLoad {
            start: 6,
            value_start: 6,
            value_end: 11,
            end: source.len(),
            attr: "real".into(),
        };
        assert_eq!(
            guard_attribute_reads(source, &[load]).unwrap(),
            "z = _getattr_(( a + b ), \"real\")"
        );
    }

    #[test]
    fn test_dot_search_skips_comments() {
        assert_eq!(find_attribute_dot(") # note. with dot\n  .x"), Some(21));
        assert_eq!(find_attribute_dot("  "), None);
    }
}
