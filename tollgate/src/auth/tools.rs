//! Tool-name extraction from request bodies.
//!
//! Different client dialects declare tools in different shapes; enforcement
//! needs the declared names regardless of dialect:
//!
//! - `tools: [{"type": "function", "function": {"name": ...}}]`
//! - `functions: [{"name": ...}]` (legacy)
//! - `tools: [{"name": ...}]`
//! - `tools: [{"function_declarations": [{"name": ...}]}]`
//!
//! Unknown shapes contribute nothing; a body that declares no tools yields an
//! empty list, which every allow-list accepts.

use serde_json::Value;

/// All tool names declared by a request body, deduplicated, in declaration
/// order.
pub fn extract_tool_names(body: &Value) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        for tool in tools {
            // {"function": {"name": ...}}
            if let Some(name) = tool
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
            {
                push(name);
                continue;
            }
            // {"function_declarations": [{"name": ...}]}
            if let Some(decls) = tool.get("function_declarations").and_then(Value::as_array) {
                for decl in decls {
                    if let Some(name) = decl.get("name").and_then(Value::as_str) {
                        push(name);
                    }
                }
                continue;
            }
            // {"name": ...}
            if let Some(name) = tool.get("name").and_then(Value::as_str) {
                push(name);
            }
        }
    }

    if let Some(functions) = body.get("functions").and_then(Value::as_array) {
        for function in functions {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                push(name);
            }
        }
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_tools() {
        let body = json!({
            "model": "gpt-4o",
            "tools": [
                {"type": "function", "function": {"name": "get_weather"}},
                {"type": "function", "function": {"name": "search_web"}}
            ]
        });
        assert_eq!(extract_tool_names(&body), vec!["get_weather", "search_web"]);
    }

    #[test]
    fn test_legacy_functions_field() {
        let body = json!({"functions": [{"name": "get_weather"}]});
        assert_eq!(extract_tool_names(&body), vec!["get_weather"]);
    }

    #[test]
    fn test_named_tools() {
        let body = json!({"tools": [{"name": "bash", "max_uses": 3}]});
        assert_eq!(extract_tool_names(&body), vec!["bash"]);
    }

    #[test]
    fn test_function_declarations() {
        let body = json!({
            "tools": [{"function_declarations": [
                {"name": "get_weather"},
                {"name": "get_time"}
            ]}]
        });
        assert_eq!(extract_tool_names(&body), vec!["get_weather", "get_time"]);
    }

    #[test]
    fn test_mixed_shapes_deduplicate() {
        let body = json!({
            "tools": [{"type": "function", "function": {"name": "get_weather"}}],
            "functions": [{"name": "get_weather"}, {"name": "search_web"}]
        });
        assert_eq!(extract_tool_names(&body), vec!["get_weather", "search_web"]);
    }

    #[test]
    fn test_no_tools_yields_empty() {
        assert!(extract_tool_names(&json!({"model": "gpt-4o"})).is_empty());
        assert!(extract_tool_names(&json!({"tools": "not-an-array"})).is_empty());
        assert!(extract_tool_names(&json!({"tools": [{"type": "web_search"}]})).is_empty());
    }
}
