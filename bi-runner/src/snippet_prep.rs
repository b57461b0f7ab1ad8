//! Snippet preparation for model output.
//!
//! Models hand over analysis code in several shapes: fenced blocks inside a
//! prose answer, tool arguments with the program as one string, or tool
//! arguments with the program as an array of lines (often with the
//! indentation dropped). Everything here turns those shapes into source text
//! the sandbox can compile.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref PYTHON_FENCE: Regex =
        Regex::new(r"```(?:python3?|py)[ \t]*\r?\n([\s\S]*?)```").expect("valid regex");
    static ref BARE_FENCE: Regex = Regex::new(r"```[ \t]*\r?\n([\s\S]*?)```").expect("valid regex");
    static ref BLOCK_STARTER: Regex = Regex::new(
        r"^(for\s.+|while\s.+|if\s.+|elif\s.+|else\s*|def\s.+|class\s.+|try\s*|except.*|finally\s*|with\s.+):\s*(#.*)?$"
    )
    .expect("valid regex");
    static ref CONTINUATION: Regex =
        Regex::new(r"^(elif\s.+|else\s*|except.*|finally\s*):\s*(#.*)?$").expect("valid regex");
    static ref BLOCK_ENDER: Regex = Regex::new(r"^(return|break|continue|raise|pass)\b").expect("valid regex");
    static ref AWAIT: Regex = Regex::new(r"\bawait\s+").expect("valid regex");
}

const INDENT: &str = "    ";

/// Where a prepared snippet came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetShape {
    /// One source string
    Text,
    /// An array of lines, possibly missing indentation
    Lines,
}

/// Source lines pulled out of a tool call or response, before cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSnippet {
    pub shape: SnippetShape,
    pub lines: Vec<String>,
}

impl RawSnippet {
    fn text(code: &str) -> Self {
        Self {
            shape: SnippetShape::Text,
            lines: code.lines().map(str::to_string).collect(),
        }
    }

    fn lines(values: &[Value]) -> Option<Self> {
        let lines: Vec<String> = values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        if lines.is_empty() {
            return None;
        }
        Some(Self {
            shape: SnippetShape::Lines,
            lines,
        })
    }

    /// Clean up and join into compilable source
    pub fn into_source(self) -> String {
        let lines = strip_unsupported_python(&self.lines);
        let lines = match self.shape {
            SnippetShape::Lines => fix_python_indentation(&lines),
            SnippetShape::Text => lines,
        };
        lines.join("\n")
    }
}

/// Parse the arguments of a code-execution tool call.
///
/// Accepted shapes:
/// - `{"code": "print(1)"}`
/// - `{"code": ["print(1)", "print(2)"]}`
/// - `["print(1)", "print(2)"]`
/// - `{"arguments": {...}}` or `{"code": {...}}` wrapping one of the above
pub fn parse_code_arguments(arguments: &Value) -> Option<RawSnippet> {
    parse_code_value(arguments, 0)
}

fn parse_code_value(value: &Value, depth: usize) -> Option<RawSnippet> {
    if depth > 2 {
        return None;
    }
    let parsed = match value {
        Value::Array(items) => RawSnippet::lines(items),
        Value::Object(map) => {
            if let Some(code) = map.get("code") {
                match code {
                    Value::String(s) if !s.trim().is_empty() => return Some(RawSnippet::text(s)),
                    Value::Array(items) => return RawSnippet::lines(items),
                    Value::Object(_) => return parse_code_value(code, depth + 1),
                    _ => {}
                }
            }
            match map.get("arguments")? {
                // Some models JSON-encode the inner arguments a second time
                Value::String(s) => serde_json::from_str::<Value>(s)
                    .ok()
                    .and_then(|decoded| parse_code_value(&decoded, depth + 1)),
                other => parse_code_value(other, depth + 1),
            }
        }
        _ => None,
    };
    if parsed.is_none() && depth == 0 {
        let preview: String = value.to_string().chars().take(200).collect();
        tracing::debug!(%preview, "no code found in tool arguments");
    }
    parsed
}

/// Re-indent a line array whose indentation was dropped.
///
/// Arrays where any line is already indented are returned as-is: the model
/// kept its indentation and guessing would only damage it.
pub fn fix_python_indentation(lines: &[String]) -> Vec<String> {
    let already_indented = lines
        .iter()
        .any(|line| !line.trim().is_empty() && line.starts_with(char::is_whitespace));
    if already_indented {
        return lines.to_vec();
    }

    let mut depth: usize = 0;
    let mut fixed = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            fixed.push(String::new());
            continue;
        }

        if CONTINUATION.is_match(trimmed) {
            depth = depth.saturating_sub(1);
        }
        fixed.push(format!("{}{}", INDENT.repeat(depth), trimmed));

        if BLOCK_STARTER.is_match(trimmed) {
            depth += 1;
        } else if BLOCK_ENDER.is_match(trimmed) && depth > 0 {
            let next_continues = lines
                .get(i + 1)
                .map(|next| CONTINUATION.is_match(next.trim()))
                .unwrap_or(false);
            if !next_continues {
                depth -= 1;
            }
        }
    }

    if fixed.iter().zip(lines).any(|(a, b)| a != b) {
        tracing::debug!(lines = lines.len(), "re-indented snippet lines");
    }
    fixed
}

/// Remove `await` keywords; snippets run synchronously.
pub fn strip_unsupported_python(lines: &[String]) -> Vec<String> {
    let mut stripped = 0;
    let result = lines
        .iter()
        .map(|line| {
            if line.trim_start().starts_with('#') || !AWAIT.is_match(line) {
                return line.clone();
            }
            stripped += 1;
            AWAIT.replace_all(line, "").into_owned()
        })
        .collect();

    if stripped > 0 {
        tracing::debug!(lines = stripped, "stripped await from snippet");
    }
    result
}

/// Pull a Python program out of a model response.
///
/// Prefers a ```python fence, then a bare fence whose content looks like
/// Python, then the whole response if it reads as code rather than prose.
pub fn extract_python_program(response: &str) -> Option<String> {
    if let Some(code) = PYTHON_FENCE.captures(response).and_then(|c| c.get(1)) {
        if !code.as_str().trim().is_empty() {
            return Some(code.as_str().trim_end().to_string());
        }
    }

    if let Some(code) = BARE_FENCE.captures(response).and_then(|c| c.get(1)) {
        if looks_like_python(code.as_str()) {
            return Some(code.as_str().trim_end().to_string());
        }
    }

    let trimmed = response.trim();
    looks_like_standalone_python(trimmed).then(|| trimmed.to_string())
}

/// Turn a model reply into source, whether it is tool-call JSON or a prose answer
pub fn snippet_from_response(response: &str) -> Option<String> {
    if let Ok(arguments) = serde_json::from_str::<Value>(response.trim()) {
        if let Some(raw) = parse_code_arguments(&arguments) {
            return Some(raw.into_source());
        }
    }
    extract_python_program(response).map(|code| RawSnippet::text(&code).into_source())
}

fn looks_like_python(code: &str) -> bool {
    const MARKERS: [&str; 14] = [
        "def ", "import ", "from ", "class ", "print(", "for ", "while ", "try:", "except", "elif ", "else:",
        "return ", "with ", " = ",
    ];
    code.lines().any(|line| MARKERS.iter().any(|m| line.contains(m)))
}

fn looks_like_standalone_python(text: &str) -> bool {
    if text.lines().count() < 2 {
        return false;
    }

    let (mut code, mut prose) = (0usize, 0usize);
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let is_code = ["def ", "import ", "from ", "class ", "for ", "if ", "while ", "return ", "print("]
            .iter()
            .any(|p| line.starts_with(p))
            || line.ends_with(':')
            || line.contains(" = ")
            || line.contains("()");
        if is_code {
            code += 1;
        } else if line.len() > 50 && line.contains(' ') && !line.contains('(') {
            prose += 1;
        }
    }
    code > 0 && code > prose * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owned(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_indentation_if_else() {
        let fixed = fix_python_indentation(&owned(&["if x > 0:", "print('positive')", "else:", "print('not positive')"]));
        assert_eq!(
            fixed,
            owned(&["if x > 0:", "    print('positive')", "else:", "    print('not positive')"])
        );
    }

    #[test]
    fn test_indentation_nested_loop() {
        let fixed = fix_python_indentation(&owned(&["for row in sales.rows:", "if row[1]:", "print(row[0])"]));
        assert_eq!(fixed[1], "    if row[1]:");
        assert_eq!(fixed[2], "        print(row[0])");
    }

    #[test]
    fn test_indentation_dedents_after_return() {
        let fixed = fix_python_indentation(&owned(&["def total(xs):", "return sum(xs)", "print(total([1, 2]))"]));
        assert_eq!(fixed, owned(&["def total(xs):", "    return sum(xs)", "print(total([1, 2]))"]));
    }

    #[test]
    fn test_indented_arrays_are_trusted() {
        let lines = owned(&["for i in range(3):", "    print(i)", "print('done')"]);
        assert_eq!(fix_python_indentation(&lines), lines);
    }

    #[test]
    fn test_strip_await_skips_comments() {
        let stripped = strip_unsupported_python(&owned(&["# await later", "rows = await fetch()"]));
        assert_eq!(stripped, owned(&["# await later", "rows = fetch()"]));
    }

    #[test]
    fn test_code_argument_shapes() {
        let text = parse_code_arguments(&json!({"code": "x = 1\nprint(x)"})).unwrap();
        assert_eq!(text.shape, SnippetShape::Text);
        assert_eq!(text.into_source(), "x = 1\nprint(x)");

        let lines = parse_code_arguments(&json!({"code": ["for i in range(2):", "print(i)"], "context": null})).unwrap();
        assert_eq!(lines.into_source(), "for i in range(2):\n    print(i)");

        let bare = parse_code_arguments(&json!(["print(1)"])).unwrap();
        assert_eq!(bare.shape, SnippetShape::Lines);

        let nested = parse_code_arguments(&json!({"arguments": {"code": ["print(2)"]}})).unwrap();
        assert_eq!(nested.into_source(), "print(2)");

        let encoded = parse_code_arguments(&json!({"arguments": "{\"code\": \"print(3)\"}"})).unwrap();
        assert_eq!(encoded.into_source(), "print(3)");

        assert!(parse_code_arguments(&json!({"code": ""})).is_none());
        assert!(parse_code_arguments(&json!({"query": "select 1"})).is_none());
    }

    #[test]
    fn test_text_snippets_keep_their_layout() {
        let snippet = parse_code_arguments(&json!({"code": "for i in range(2):\n    x = i\nprint(x)"})).unwrap();
        assert_eq!(snippet.into_source(), "for i in range(2):\n    x = i\nprint(x)");
    }

    #[test]
    fn test_extract_python_fence() {
        let response = "Here is the analysis:\n```python\nprint(sales.shape)\n```\nDone.";
        assert_eq!(extract_python_program(response).as_deref(), Some("print(sales.shape)"));
    }

    #[test]
    fn test_extract_bare_fence_only_when_python() {
        let response = "```\nprint(len(sales.rows))\n```";
        assert_eq!(extract_python_program(response).as_deref(), Some("print(len(sales.rows))"));

        let shell = "```\nls -la\n```";
        assert_eq!(extract_python_program(shell), None);
    }

    #[test]
    fn test_snippet_from_response() {
        let tool_call = r#"{"code": ["for r in sales.rows:", "print(r[0])"]}"#;
        assert_eq!(
            snippet_from_response(tool_call).as_deref(),
            Some("for r in sales.rows:\n    print(r[0])")
        );

        let reply = "Let me check.\n```python\nrows = await load()\nprint(len(rows))\n```";
        assert_eq!(snippet_from_response(reply).as_deref(), Some("rows = load()\nprint(len(rows))"));

        assert_eq!(snippet_from_response("No code needed, the answer is 42."), None);
    }

    #[test]
    fn test_extract_rejects_prose() {
        let prose = "The northern region sold more units than any other region this quarter.\nSales were flat overall across the remaining regions we track.";
        assert_eq!(extract_python_program(prose), None);

        let code = "total = 0\nfor row in sales.rows:\n    total += row[1]\nprint(total)";
        assert_eq!(extract_python_program(code).as_deref(), Some(code));
    }
}
