use std::sync::Arc;

use slmbench_core::{
    Analysis, ComparisonMeta, ComparisonReport, GenerationOptions, Result, RunSummary,
    SlmBenchError, StructuredVerdict,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{ChatRequest, InferenceBackend};

pub const DEFAULT_ANALYSIS_TEMPERATURE: f32 = 0.3;

const DEGRADED_NOTE: &str = "LLM analysis failed, raw summaries only";

/// Asks an analysis model to compare two or more model runs. Best effort:
/// apart from cancellation, failures degrade the report instead of
/// aborting the comparison step.
pub struct ComparisonAdviser {
    backend: Arc<dyn InferenceBackend>,
    analysis_model: String,
    temperature: f32,
}

impl ComparisonAdviser {
    pub fn new(backend: Arc<dyn InferenceBackend>, analysis_model: &str) -> Self {
        Self {
            backend,
            analysis_model: analysis_model.to_string(),
            temperature: DEFAULT_ANALYSIS_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub async fn compare(
        &self,
        summaries: &[RunSummary],
        timestamp: u64,
        cancel: &CancellationToken,
    ) -> Result<ComparisonReport> {
        if summaries.len() < 2 {
            return Err(SlmBenchError::NotEnoughSummaries(summaries.len()));
        }

        let prompt = build_prompt(summaries)?;
        let mut meta = ComparisonMeta {
            timestamp,
            models_compared: summaries.iter().map(|s| s.model.clone()).collect(),
            analysis_model: self.analysis_model.clone(),
            error: None,
            note: None,
        };

        info!(model = %self.analysis_model, "Generating comparison analysis");
        let mut reply = self.ask(&self.analysis_model, &prompt, cancel).await;

        let fallback = &summaries[0].model;
        if reply.as_ref().is_err_and(is_runtime_rejection) && fallback != &self.analysis_model {
            warn!(
                model = %self.analysis_model,
                fallback = %fallback,
                "Analysis model unavailable, falling back to a benchmarked model"
            );
            meta.analysis_model = fallback.clone();
            meta.note = Some(format!(
                "analysis model '{}' unavailable, used '{}'",
                self.analysis_model, fallback
            ));
            reply = self.ask(fallback, &prompt, cancel).await;
        }

        let analysis = match reply {
            Ok(text) => Analysis {
                structured: parse_verdict(&text),
                readable: text,
            },
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Analysis generation failed");
                meta.error = Some(e.to_string());
                meta.note = Some(DEGRADED_NOTE.to_string());
                Analysis::default()
            }
        };

        Ok(ComparisonReport {
            meta,
            summaries: summaries.to_vec(),
            analysis,
        })
    }

    async fn ask(&self, model: &str, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let options = GenerationOptions {
            max_tokens: None,
            temperature: self.temperature,
        };
        let request = ChatRequest::new(model, prompt, options);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SlmBenchError::Cancelled),
            reply = self.backend.chat(&request) => reply,
        }
    }
}

/// The runtime answered but refused the request (unknown model, auth,
/// server error). Transport failures and cancellation are not rejections.
fn is_runtime_rejection(e: &SlmBenchError) -> bool {
    matches!(e, SlmBenchError::ModelNotFound(_) | SlmBenchError::OllamaError(_))
}

pub fn build_prompt(summaries: &[RunSummary]) -> Result<String> {
    let mut prompt = String::from(
        "You are an AI performance analyst. Analyze the following benchmark results and provide insights.\n\nBenchmark Data:\n",
    );
    for summary in summaries {
        prompt.push('\n');
        prompt.push_str(&serde_json::to_string_pretty(summary)?);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nPlease provide:\n\
         1. Performance Ranking: Rank models by overall efficiency (consider TPS, TTFT, and consistency)\n\
         2. Strengths & Weaknesses: For each model, identify what it does best and worst\n\
         3. Use Case Recommendations: Which model is best for which scenario?\n\
         4. Key Insights: Any notable patterns or surprising findings\n\
         5. Winner: Overall best model and why\n\n\
         Format your response as structured JSON with these keys: ranking, strengths_weaknesses, recommendations, insights, winner\n",
    );
    Ok(prompt)
}

/// Pulls a JSON object out of free text: a ```json fence first, then any
/// ``` fence, then the whole text. Anything else is `None`.
pub fn parse_verdict(text: &str) -> Option<StructuredVerdict> {
    let candidate = fenced(text, "```json").or_else(|| fenced(text, "```")).unwrap_or(text);

    let value: serde_json::Value = serde_json::from_str(candidate.trim()).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Body between `open` and the next closing fence; an unclosed fence runs
/// to the end of the text.
fn fenced<'a>(text: &'a str, open: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let rest = &text[start..];
    let end = rest.find("```").unwrap_or(rest.len());
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::RunAggregator;
    use crate::test_support::ScriptedBackend;
    use slmbench_core::RunConfig;

    fn summary(model: &str) -> RunSummary {
        let config = RunConfig {
            max_tokens: None,
            temperature: 0.7,
            max_retries: 2,
        };
        RunAggregator::summarize(model, &[], &config, 1_700_000_000)
    }

    fn summaries() -> Vec<RunSummary> {
        vec![summary("phi3"), summary("gemma:2b")]
    }

    #[test]
    fn test_parse_json_fence() {
        let text = "Here you go:\n```json\n{\"ranking\": [\"phi3\", \"gemma:2b\"], \"winner\": \"phi3\"}\n```\nThanks";
        let verdict = parse_verdict(text).unwrap();
        assert_eq!(verdict.winner, serde_json::json!("phi3"));
        assert_eq!(verdict.ranking, serde_json::json!(["phi3", "gemma:2b"]));
    }

    #[test]
    fn test_parse_bare_fence_and_whole_text() {
        let fenced = "```\n{\"insights\": \"fast\"}\n```";
        assert_eq!(parse_verdict(fenced).unwrap().insights, serde_json::json!("fast"));

        let whole = "{\"winner\": {\"model\": \"phi3\"}, \"extra_field\": 1}";
        let verdict = parse_verdict(whole).unwrap();
        assert_eq!(verdict.extra["extra_field"], serde_json::json!(1));
    }

    #[test]
    fn test_unparseable_text_keeps_no_structure() {
        assert!(parse_verdict("phi3 wins because it is fastest.").is_none());
        assert!(parse_verdict("```json\n[1, 2, 3]\n```").is_none());
        assert!(parse_verdict("```json\n{broken\n```").is_none());
    }

    #[test]
    fn test_prompt_embeds_every_summary() {
        let prompt = build_prompt(&summaries()).unwrap();
        assert!(prompt.contains("\"model\": \"phi3\""));
        assert!(prompt.contains("\"model\": \"gemma:2b\""));
        assert!(prompt.contains("ranking, strengths_weaknesses, recommendations, insights, winner"));
    }

    #[tokio::test]
    async fn test_compare_needs_two_summaries() {
        let adviser = ComparisonAdviser::new(Arc::new(ScriptedBackend::new(&[])), "judge");
        let err = adviser
            .compare(&[summary("phi3")], 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SlmBenchError::NotEnoughSummaries(1)));
    }

    #[tokio::test]
    async fn test_compare_with_structured_reply() {
        let backend = Arc::new(
            ScriptedBackend::new(&[])
                .chat_reply(Ok("```json\n{\"winner\": \"phi3\"}\n```".to_string())),
        );
        let adviser = ComparisonAdviser::new(backend.clone(), "judge");

        let report = adviser
            .compare(&summaries(), 42, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.is_degraded());
        assert_eq!(report.meta.timestamp, 42);
        assert_eq!(report.meta.models_compared, vec!["phi3", "gemma:2b"]);
        assert_eq!(report.meta.analysis_model, "judge");
        assert_eq!(report.summaries.len(), 2);
        assert!(report.analysis.readable.contains("winner"));
        assert!(report.analysis.structured.is_some());

        let requests = backend.chat_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].options.temperature, DEFAULT_ANALYSIS_TEMPERATURE);
        assert_eq!(requests[0].options.max_tokens, None);
    }

    #[tokio::test]
    async fn test_prose_reply_keeps_narrative() {
        let backend = Arc::new(
            ScriptedBackend::new(&[]).chat_reply(Ok("phi3 is the clear winner.".to_string())),
        );
        let adviser = ComparisonAdviser::new(backend, "judge");

        let report = adviser
            .compare(&summaries(), 0, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.is_degraded());
        assert_eq!(report.analysis.readable, "phi3 is the clear winner.");
        assert!(report.analysis.structured.is_none());
    }

    #[tokio::test]
    async fn test_missing_analysis_model_falls_back_to_first_run() {
        let backend = Arc::new(
            ScriptedBackend::new(&[])
                .chat_reply(Err(SlmBenchError::ModelNotFound("judge".into())))
                .chat_reply(Ok("{\"winner\": \"gemma:2b\"}".to_string())),
        );
        let adviser = ComparisonAdviser::new(backend.clone(), "judge");

        let report = adviser
            .compare(&summaries(), 0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.meta.analysis_model, "phi3");
        assert!(report.meta.note.is_some());
        assert!(!report.is_degraded());
        let requests = backend.chat_requests.lock().unwrap();
        assert_eq!(requests[1].model, "phi3");
    }

    #[tokio::test]
    async fn test_rejected_analysis_model_falls_back_to_first_run() {
        let backend = Arc::new(
            ScriptedBackend::new(&[])
                .chat_reply(Err(SlmBenchError::OllamaError(
                    "Chat failed: 401 Unauthorized - unauthorized".into(),
                )))
                .chat_reply(Ok("{\"winner\": \"phi3\"}".to_string())),
        );
        let adviser = ComparisonAdviser::new(backend.clone(), "deepseek-v3.1:671b-cloud");

        let report = adviser
            .compare(&summaries(), 0, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.is_degraded());
        assert_eq!(report.meta.analysis_model, "phi3");
        assert!(report.meta.error.is_none());
        assert_eq!(report.analysis.structured.unwrap().winner, serde_json::json!("phi3"));
        assert_eq!(backend.chat_requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fallback_degrades_report() {
        let backend = Arc::new(
            ScriptedBackend::new(&[])
                .chat_reply(Err(SlmBenchError::OllamaError("Chat failed: 500".into())))
                .chat_reply(Err(SlmBenchError::OllamaError("Chat failed: 500".into()))),
        );
        let adviser = ComparisonAdviser::new(backend.clone(), "judge");

        let report = adviser
            .compare(&summaries(), 0, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_degraded());
        assert_eq!(report.meta.analysis_model, "phi3");
        assert_eq!(backend.chat_requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_degrades_report() {
        let backend = Arc::new(
            ScriptedBackend::new(&[])
                .chat_reply(Err(SlmBenchError::Connection("connection refused".into()))),
        );
        let adviser = ComparisonAdviser::new(backend.clone(), "judge");

        let report = adviser
            .compare(&summaries(), 0, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_degraded());
        assert!(report.analysis.readable.is_empty());
        assert!(report.analysis.structured.is_none());
        assert_eq!(report.meta.note.as_deref(), Some(DEGRADED_NOTE));
        assert_eq!(report.summaries.len(), 2);
        assert_eq!(backend.chat_requests.lock().unwrap().len(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["analysis"]["structured"].is_null());
    }

    #[tokio::test]
    async fn test_cancelled_comparison_is_an_error() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let adviser = ComparisonAdviser::new(Arc::new(ScriptedBackend::new(&[])), "judge");

        let err = adviser.compare(&summaries(), 0, &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
    }
}
