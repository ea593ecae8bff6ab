//! Deterministic offline capability.
//!
//! Produces well-formed artifacts from the request input without any network
//! access. Used by the CLI when no external provider is wired in, and by
//! tests, which can override outputs per stage and inject delays or failures.

use crate::capability::{Capability, CapabilityError, CapabilityRequest, CapabilityResponse, Usage};
use async_trait::async_trait;
use cp_protocol::Stage;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Script {
    outputs: HashMap<Stage, VecDeque<Value>>,
    transient_failures: HashMap<Stage, u32>,
    fatal: HashMap<Stage, String>,
    delays: HashMap<Stage, Duration>,
    calls: Vec<CapabilityRequest>,
}

/// Scripted capability provider.
#[derive(Clone, Default)]
pub struct ScriptedCapability {
    script: Arc<Mutex<Script>>,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script(self, edit: impl FnOnce(&mut Script)) -> Self {
        if let Ok(mut script) = self.script.lock() {
            edit(&mut script);
        }
        self
    }

    /// Return `output` for every call at `stage`.
    pub fn with_output(self, stage: Stage, output: Value) -> Self {
        self.with_outputs(stage, vec![output])
    }

    /// Return `outputs` in order for successive calls at `stage`; the last one
    /// repeats.
    pub fn with_outputs(self, stage: Stage, outputs: Vec<Value>) -> Self {
        self.with_script(|script| {
            script.outputs.insert(stage, outputs.into_iter().collect());
        })
    }

    /// Fail the next `count` calls at `stage` with a transient error.
    pub fn with_transient_failures(self, stage: Stage, count: u32) -> Self {
        self.with_script(|script| {
            script.transient_failures.insert(stage, count);
        })
    }

    /// Fail every call at `stage` with a non-transient error.
    pub fn with_fatal_failure(self, stage: Stage, message: &str) -> Self {
        let message = message.to_string();
        self.with_script(|script| {
            script.fatal.insert(stage, message);
        })
    }

    /// Delay every call at `stage`.
    pub fn with_delay(self, stage: Stage, delay: Duration) -> Self {
        self.with_script(|script| {
            script.delays.insert(stage, delay);
        })
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<CapabilityRequest> {
        self.script
            .lock()
            .map(|script| script.calls.clone())
            .unwrap_or_default()
    }

    /// Number of requests received for `stage`.
    pub fn call_count(&self, stage: Stage) -> usize {
        self.calls().iter().filter(|call| call.stage == stage).count()
    }

    fn plan(&self, request: &CapabilityRequest) -> Result<(Option<Duration>, Option<Value>), CapabilityError> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| CapabilityError::Fatal("capability script poisoned".to_string()))?;
        script.calls.push(request.clone());

        if let Some(message) = script.fatal.get(&request.stage) {
            return Err(CapabilityError::Fatal(message.clone()));
        }
        if let Some(remaining) = script.transient_failures.get_mut(&request.stage) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CapabilityError::Timeout(format!(
                    "{} timed out",
                    request.task
                )));
            }
        }

        let delay = script.delays.get(&request.stage).copied();
        let output = script.outputs.get_mut(&request.stage).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        Ok((delay, output))
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    async fn invoke(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let (delay, scripted) = self.plan(request)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let output = match scripted {
            Some(output) => output,
            None => default_output(request),
        };
        let output_tokens = output.to_string().len() as u64 / 4;
        Ok(CapabilityResponse {
            output,
            usage: Usage {
                input_tokens: request.input.to_string().len() as u64 / 4,
                output_tokens,
                cost_usd: output_tokens as f64 * 0.000_002,
            },
        })
    }
}

fn text<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn count(value: &Value) -> u64 {
    value.get("count").and_then(Value::as_u64).unwrap_or(3).max(1)
}

fn default_output(request: &CapabilityRequest) -> Value {
    let input = &request.input;
    match request.stage {
        Stage::KeywordAnalysis => {
            let keywords: Vec<String> = input
                .get("keywords")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let related: Vec<String> = keywords.iter().map(|k| format!("{k} guide")).collect();
            json!({
                "primary_keywords": keywords,
                "related_keywords": related,
                "search_intent": "informational",
            })
        }
        Stage::PersonaGeneration => {
            let primary = input["keyword_analysis"]["primary_keywords"]
                .as_array()
                .and_then(|items| items.first())
                .and_then(Value::as_str)
                .unwrap_or("the topic")
                .to_string();
            let personas: Vec<Value> = (0..count(input))
                .map(|i| {
                    json!({
                        "id": i,
                        "name": format!("Reader {}", i + 1),
                        "description": format!("Reader profile {} researching {primary}", i + 1),
                    })
                })
                .collect();
            json!(personas)
        }
        Stage::ThemeGeneration => {
            let persona = text(&input["persona"], "name").to_string();
            let themes: Vec<Value> = (0..count(input))
                .map(|i| {
                    json!({
                        "title": format!("Angle {} for {persona}", i + 1),
                        "description": format!("Content angle {} tailored to {persona}", i + 1),
                        "keywords": input["keyword_analysis"]["primary_keywords"],
                    })
                })
                .collect();
            json!(themes)
        }
        Stage::ResearchPlanning => {
            let theme = text(&input["theme"], "title").to_string();
            json!({
                "topic": theme,
                "queries": [
                    { "query": format!("{theme} background"), "focus": "context" },
                    { "query": format!("{theme} costs"), "focus": "numbers" },
                ],
            })
        }
        Stage::ResearchExecution => {
            let query = text(input, "query").to_string();
            let index = input.get("index").and_then(Value::as_u64).unwrap_or(0);
            json!({
                "query": query,
                "summary": format!("Findings for {query}"),
                "sources": [{
                    "title": format!("Source {}", index + 1),
                    "url": format!("https://example.com/research/{index}"),
                }],
            })
        }
        Stage::ResearchSynthesis => {
            let results = input["results"].as_array().cloned().unwrap_or_default();
            let key_points: Vec<Value> = results
                .iter()
                .map(|result| json!(text(result, "summary")))
                .collect();
            let sources: Vec<Value> = results
                .iter()
                .flat_map(|result| result["sources"].as_array().cloned().unwrap_or_default())
                .collect();
            json!({
                "summary": format!("Synthesis of {} research result(s)", results.len()),
                "key_points": key_points,
                "sources": sources,
            })
        }
        Stage::OutlineGeneration => {
            let title = text(&input["theme"], "title").to_string();
            let sections: Vec<Value> = ["Background", "Key considerations", "Next steps"]
                .iter()
                .map(|heading| {
                    json!({
                        "heading": heading,
                        "level": 2,
                        "description": format!("{heading} for {title}"),
                        "subsections": [{
                            "heading": format!("{heading} in detail"),
                            "level": 3,
                            "description": "",
                            "subsections": [],
                        }],
                    })
                })
                .collect();
            json!({ "title": title, "top_level_heading": 2, "sections": sections })
        }
        Stage::SectionWriting => {
            let section = &input["section"];
            let heading = text(section, "heading").to_string();
            json!({
                "heading": heading,
                "level": section.get("level").and_then(Value::as_u64).unwrap_or(2),
                "content": format!("Draft text for {heading}."),
            })
        }
        Stage::Editing => {
            let title = text(input, "title").to_string();
            let body = input["sections"]
                .as_array()
                .map(|sections| {
                    sections
                        .iter()
                        .map(|section| {
                            let level = section.get("level").and_then(Value::as_u64).unwrap_or(2);
                            format!(
                                "{} {}\n\n{}",
                                "#".repeat(level as usize),
                                text(section, "heading"),
                                text(section, "content")
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n\n")
                })
                .unwrap_or_default();
            json!({ "title": title, "body": body })
        }
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(stage: Stage, input: Value) -> CapabilityRequest {
        CapabilityRequest {
            stage,
            task: stage.as_str().to_string(),
            input,
        }
    }

    #[tokio::test]
    async fn test_default_personas_honor_count() {
        let capability = ScriptedCapability::new();
        let response = capability
            .invoke(&request(
                Stage::PersonaGeneration,
                json!({ "count": 2, "keyword_analysis": { "primary_keywords": ["sapporo"] } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.output.as_array().map(Vec::len), Some(2));
        assert!(response.usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let capability =
            ScriptedCapability::new().with_transient_failures(Stage::KeywordAnalysis, 2);
        let call = request(Stage::KeywordAnalysis, json!({ "keywords": ["a"] }));

        assert!(matches!(
            capability.invoke(&call).await,
            Err(CapabilityError::Timeout(_))
        ));
        assert!(capability.invoke(&call).await.is_err());
        assert!(capability.invoke(&call).await.is_ok());
        assert_eq!(capability.call_count(Stage::KeywordAnalysis), 3);
    }

    #[tokio::test]
    async fn test_scripted_outputs_in_order() {
        let capability = ScriptedCapability::new()
            .with_outputs(Stage::Editing, vec![json!({"n": 1}), json!({"n": 2})]);
        let call = request(Stage::Editing, json!({}));
        assert_eq!(capability.invoke(&call).await.unwrap().output, json!({"n": 1}));
        assert_eq!(capability.invoke(&call).await.unwrap().output, json!({"n": 2}));
        assert_eq!(capability.invoke(&call).await.unwrap().output, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_transient() {
        let capability = ScriptedCapability::new().with_fatal_failure(Stage::Editing, "quota");
        let err = capability
            .invoke(&request(Stage::Editing, json!({})))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
