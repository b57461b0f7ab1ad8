//! Python identifier checks for names bound into a snippet namespace

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await",
    "break", "class", "continue", "def", "del", "elif", "else", "except",
    "finally", "for", "from", "global", "if", "import", "in", "is",
    "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

pub fn is_python_keyword(name: &str) -> bool {
    PYTHON_KEYWORDS.contains(&name)
}

/// Validate that a string can be bound as a Python name.
///
/// Rules:
/// - ASCII letters, digits and underscores only
/// - Cannot start with a digit
/// - Cannot be a Python keyword
/// - Cannot be empty
pub fn validate_python_identifier(name: &str) -> Result<(), String> {
    let Some(first_char) = name.chars().next() else {
        return Err("Python identifier cannot be empty".to_string());
    };

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(format!(
            "Python identifier must start with a letter or underscore, got '{}'",
            first_char
        ));
    }

    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(format!(
                "Python identifier can only contain letters, digits, and underscores. \
                Invalid character '{}' at position {}",
                c, i
            ));
        }
    }

    if is_python_keyword(name) {
        return Err(format!("'{}' is a Python reserved keyword", name));
    }

    Ok(())
}

/// Convert an arbitrary dataset or file name to a bindable snake_case identifier.
///
/// The result never starts with an underscore, so it stays reachable from the
/// restricted tier.
pub fn to_python_identifier(name: &str) -> String {
    let mut result = String::new();
    let mut last_was_underscore = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c.to_ascii_lowercase());
            last_was_underscore = false;
        } else if matches!(c, ' ' | '-' | '_' | '.' | '/') && !last_was_underscore && !result.is_empty() {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        return "dataset".to_string();
    }

    if result.starts_with(|c: char| c.is_ascii_digit()) {
        result.insert_str(0, "t_");
    }

    if is_python_keyword(&result) {
        result.push_str("_data");
    }

    result
}
