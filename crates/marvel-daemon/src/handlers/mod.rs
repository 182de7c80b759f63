pub mod agents;
pub mod compact;
pub mod post_tool;
pub mod prompt;
pub mod security;
pub mod session;
pub mod stop;

/// Tools whose writes go through the injection and invalidation paths.
pub(crate) fn is_edit_tool(tool: &str) -> bool {
    matches!(tool, "Edit" | "Write" | "MultiEdit" | "NotebookEdit")
}

pub(crate) fn is_bash_tool(tool: &str) -> bool {
    tool.eq_ignore_ascii_case("bash")
}

/// Short single-line summary of an arbitrary JSON value.
pub(crate) fn summarize_value(value: Option<&serde_json::Value>, limit: usize) -> String {
    let Some(value) = value else {
        return String::new();
    };
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut flat = text.replace('\n', " ");
    if flat.len() > limit {
        let mut end = limit;
        while !flat.is_char_boundary(end) {
            end -= 1;
        }
        flat.truncate(end);
        flat.push('…');
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_are_single_line_and_bounded() {
        let value = serde_json::json!("line one\nline two");
        assert_eq!(summarize_value(Some(&value), 100), "line one line two");

        let long = serde_json::json!("x".repeat(500));
        let summary = summarize_value(Some(&long), 100);
        assert!(summary.chars().count() <= 101);
        assert!(summary.ends_with('…'));

        assert_eq!(summarize_value(None, 100), "");
    }

    #[test]
    fn tool_classification() {
        assert!(is_edit_tool("Edit"));
        assert!(is_edit_tool("Write"));
        assert!(!is_edit_tool("Bash"));
        assert!(is_bash_tool("Bash"));
        assert!(is_bash_tool("bash"));
        assert!(!is_bash_tool("Edit"));
    }
}
