use regex::Regex;

/// Returns true iff `pattern` equals `value` exactly.
///
/// An empty pattern never matches anything.
pub fn exact_match(pattern: &str, value: &str) -> bool {
    !pattern.is_empty() && pattern == value
}

/// Matches a configured pattern against a single value.
///
/// A `*` in the pattern matches any run of characters (including the empty
/// run). A pattern without wildcards degrades to exact equality. An empty
/// pattern fails closed.
pub fn match_pattern(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    match glob_regex(pattern) {
        Some(re) => re.is_match(value),
        None => false,
    }
}

/// Matches a pattern against an array of values; true if any element matches.
pub fn match_pattern_array<S: AsRef<str>>(pattern: &str, values: &[S]) -> bool {
    values.iter().any(|v| match_pattern(pattern, v.as_ref()))
}

fn glob_regex(pattern: &str) -> Option<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for part in pattern.split('*') {
        expr.push_str(&regex::escape(part));
        expr.push_str(".*");
    }
    // The trailing ".*" stands for a wildcard only if the pattern ends with one.
    if !pattern.ends_with('*') {
        expr.truncate(expr.len() - 2);
    }
    expr.push('$');
    Regex::new(&expr).ok()
}
