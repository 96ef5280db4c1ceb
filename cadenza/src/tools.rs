//! Tool registry and dispatch.
//!
//! Executors never surface failures as stream errors: everything a tool
//! does, including refusing bad arguments or crashing, becomes an output
//! string in the provider JSON convention
//! (`{"output": …, "metadata": {"exit_code", "duration_seconds"}}`, with
//! `"success": false` on failures) so the model can react to it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use llm::events::FunctionCall;
use llm::messages::Tool;
use serde_json::{Value, json};

/// What a tool produced.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Combined stdout/stderr-style text. Lossy UTF-8 is the caller's
    /// job; by the time it is here it is a string.
    pub output: String,
    /// Process-style exit code; 0 for plain successes.
    pub exit_code: i32,
    /// Wall-clock execution time.
    pub duration: Duration,
    /// Binary payload for providers that take one (Gemini `inlineData`).
    pub inline_data: Option<InlineData>,
}

/// Binary sidecar for a tool output.
#[derive(Debug, Clone)]
pub struct InlineData {
    pub media_type: String,
    pub base64_data: String,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
            duration: Duration::ZERO,
            inline_data: None,
        }
    }
}

/// A tool implementation.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run with already-validated arguments. `Err` carries a reason
    /// string and is reported to the model, not raised.
    async fn execute(&self, args: Value) -> Result<ToolOutput, String>;
}

struct RegisteredTool {
    tool: Tool,
    executor: Arc<dyn ToolExecutor>,
}

/// What dispatch hands back to the turn loop.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// The JSON-convention output string (always valid JSON).
    pub content: String,
    /// Binary sidecar, when the tool produced one.
    pub inline_data: Option<InlineData>,
}

/// Name → executor registry.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a tool.
    pub fn register(&mut self, tool: Tool, executor: Arc<dyn ToolExecutor>) {
        self.tools.insert(tool.name.clone(), RegisteredTool { tool, executor });
    }

    /// Declarations for the translators, in stable name order.
    pub fn declarations(&self) -> Vec<Tool> {
        self.tools.values().map(|entry| entry.tool.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute one call and produce its output string.
    pub async fn dispatch(&self, call: &FunctionCall) -> DispatchOutcome {
        let Some(entry) = self.tools.get(&call.name) else {
            log::warn!("Model called unknown tool '{}'", call.name);
            return failure(format!("Tool '{}' not found", call.name), "tool_not_found");
        };

        let args: Value = match serde_json::from_str(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                return failure(
                    format!("Arguments for '{}' are not valid JSON: {e}", call.name),
                    "tool_arguments_invalid",
                );
            }
        };

        if let Err(reason) = validate_args(&entry.tool.parameters, &args) {
            return failure(
                format!("Arguments for '{}' do not match the schema: {reason}", call.name),
                "tool_arguments_invalid",
            );
        }

        let started = std::time::Instant::now();
        match entry.executor.execute(args).await {
            Ok(mut output) => {
                if output.duration == Duration::ZERO {
                    output.duration = started.elapsed();
                }
                let content = json!({
                    "output": truncate_output(&output.output),
                    "metadata": {
                        "exit_code": output.exit_code,
                        "duration_seconds": output.duration.as_secs_f64(),
                    }
                })
                .to_string();

                DispatchOutcome {
                    content,
                    inline_data: output.inline_data,
                }
            }
            Err(reason) => {
                log::warn!("Tool '{}' failed: {reason}", call.name);
                failure(truncate_output(&reason), "tool_execution_error")
            }
        }
    }
}

fn failure(output: String, error: &str) -> DispatchOutcome {
    DispatchOutcome {
        content: json!({ "output": output, "success": false, "error": error }).to_string(),
        inline_data: None,
    }
}

/// Shallow structural validation of arguments against the declared
/// schema: object-ness, required keys, and primitive property types.
fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if schema.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
        return Err("expected a JSON object".to_string());
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if args.get(key).is_none() {
                return Err(format!("missing required property '{key}'"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (key, property) in properties {
        let Some(value) = args.get(key) else { continue };
        let Some(expected) = property.get("type").and_then(Value::as_str) else {
            continue;
        };

        let matches = match expected {
            "string" => value.is_string(),
            "boolean" => value.is_boolean(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            "null" => value.is_null(),
            _ => true,
        };

        if !matches {
            return Err(format!("property '{key}' should be of type {expected}"));
        }
    }

    Ok(())
}

const HEAD_LINES: usize = 256;
const TAIL_LINES: usize = 128;
const MAX_BYTES: usize = 64_000;

/// Cap tool output to 256 head + 128 tail lines and 64000 bytes, with
/// an omission marker where the middle was dropped.
fn truncate_output(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let mut result = if lines.len() > HEAD_LINES + TAIL_LINES {
        let omitted = lines.len() - HEAD_LINES - TAIL_LINES;
        let mut out = lines[..HEAD_LINES].join("\n");
        out.push_str(&format!("\n[... omitted {omitted} of {} lines ...]\n", lines.len()));
        out.push_str(&lines[lines.len() - TAIL_LINES..].join("\n"));
        out
    } else {
        text.to_string()
    };

    if result.len() > MAX_BYTES {
        let mut cut = MAX_BYTES;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result.truncate(cut);
        result.push_str("\n[... output truncated ...]\n");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolExecutor for EchoTool {
        async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
            let command = args["command"].as_str().unwrap_or_default();
            Ok(ToolOutput {
                output: format!("ran: {command}"),
                exit_code: 0,
                duration: Duration::from_millis(100),
                inline_data: None,
            })
        }
    }

    struct FailingTool;

    #[async_trait]
    impl ToolExecutor for FailingTool {
        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Err("disk on fire".to_string())
        }
    }

    fn shell_tool() -> Tool {
        Tool {
            name: "run_shell_command".into(),
            description: "Run a shell command".into(),
            parameters: json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }),
            strict: None,
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(shell_tool(), Arc::new(EchoTool));
        registry
    }

    fn call(name: &str, arguments: &str) -> FunctionCall {
        FunctionCall {
            id: "call_1".into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    #[tokio::test]
    async fn successful_dispatch_produces_the_json_convention() {
        let outcome = registry()
            .dispatch(&call("run_shell_command", r#"{"command":"ls -la"}"#))
            .await;

        let decoded: Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(decoded["output"], "ran: ls -la");
        assert_eq!(decoded["metadata"]["exit_code"], 0);
        assert!(decoded["metadata"]["duration_seconds"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_output_payload_not_an_error() {
        let outcome = registry().dispatch(&call("no_such_tool", "{}")).await;

        let decoded: Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(decoded["success"], false);
        assert_eq!(decoded["error"], "tool_not_found");
    }

    #[tokio::test]
    async fn schema_violations_are_reported_as_invalid_arguments() {
        let registry = registry();

        let missing = registry.dispatch(&call("run_shell_command", "{}")).await;
        let decoded: Value = serde_json::from_str(&missing.content).unwrap();
        assert_eq!(decoded["error"], "tool_arguments_invalid");
        assert!(decoded["output"].as_str().unwrap().contains("command"));

        let wrong_type = registry
            .dispatch(&call("run_shell_command", r#"{"command":42}"#))
            .await;
        let decoded: Value = serde_json::from_str(&wrong_type.content).unwrap();
        assert_eq!(decoded["error"], "tool_arguments_invalid");
    }

    #[tokio::test]
    async fn executor_failure_becomes_a_failure_payload() {
        let mut registry = ToolRegistry::new();
        let mut tool = shell_tool();
        tool.name = "explode".into();
        tool.parameters = json!({ "type": "object" });
        registry.register(tool, Arc::new(FailingTool));

        let outcome = registry.dispatch(&call("explode", "{}")).await;

        let decoded: Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(decoded["success"], false);
        assert_eq!(decoded["error"], "tool_execution_error");
        assert_eq!(decoded["output"], "disk on fire");
    }

    #[test]
    fn long_output_keeps_head_and_tail_with_a_marker() {
        let text: String = (0..1000).map(|i| format!("line {i}\n")).collect();
        let truncated = truncate_output(&text);

        assert!(truncated.starts_with("line 0\n"));
        assert!(truncated.contains("[... omitted 616 of 1000 lines ...]"));
        assert!(truncated.contains("line 999"));
    }

    #[test]
    fn oversized_output_is_byte_capped() {
        let text = "x".repeat(100_000);
        let truncated = truncate_output(&text);

        assert!(truncated.len() < 70_000);
        assert!(truncated.ends_with("[... output truncated ...]\n"));
    }

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(truncate_output("hello\nworld"), "hello\nworld");
    }
}
