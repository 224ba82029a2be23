//! Source-driven research pipeline.
//!
//! Runs one stage per selected source, in request order, then ranks every
//! collected idea by its composite score.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::sources::{SourceRegistry, SourceSettings};

use super::execution::{Metering, Pipeline, PipelineContext, PipelineError, ResultItem};

/// Input for one research run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchInput {
    pub query: String,
    /// Source ids to consult, in order.
    pub sources: Vec<String>,
    #[serde(default)]
    pub settings: SourceSettings,
    /// Metering provider override.
    #[serde(default)]
    pub provider: Option<String>,
}

impl ResearchInput {
    pub fn new(query: impl Into<String>, sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            query: query.into(),
            sources: sources.into_iter().map(Into::into).collect(),
            settings: SourceSettings::default(),
            provider: None,
        }
    }

    pub fn with_settings(mut self, settings: SourceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// Pipeline that queries registered sources and ranks what they return.
#[derive(Debug, Clone, Default)]
pub struct ResearchPipeline {
    sources: SourceRegistry,
}

impl ResearchPipeline {
    pub fn new(sources: SourceRegistry) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }
}

impl Pipeline for ResearchPipeline {
    type Input = ResearchInput;

    fn metering(&self, input: &ResearchInput) -> Metering {
        Metering {
            provider: input.provider.clone(),
            rate_limit: None,
        }
    }

    fn describe(&self, input: &ResearchInput) -> Value {
        json!({
            "query": input.query,
            "sources": input.sources,
        })
    }

    fn execute(&self, input: ResearchInput, ctx: &PipelineContext) -> Result<Vec<ResultItem>, PipelineError> {
        if input.query.trim().is_empty() {
            return Err(PipelineError::InvalidInput("query cannot be empty".to_string()));
        }

        let fetchers = self.sources.resolve(&input.sources, &input.settings);
        if fetchers.is_empty() {
            warn!(run_id = %ctx.run_id(), requested = ?input.sources, "No usable sources");
            return Ok(Vec::new());
        }

        info!(run_id = %ctx.run_id(), sources = fetchers.len(), "Running research stages");

        let attempted = fetchers.len();
        let mut failed = 0usize;
        let mut ideas = Vec::new();

        for fetcher in fetchers {
            ctx.checkpoint()?;

            let stage = fetcher.id().to_string();
            ctx.stage_started(&stage);

            match fetcher.fetch(&input.query) {
                Ok(report) => {
                    ctx.record_usage(report.prompt_units, report.completion_units);
                    ctx.stage_completed(&stage, &format!("{} items", report.items.len()));
                    ideas.extend(report.items);
                }
                Err(e) => {
                    failed += 1;
                    warn!(run_id = %ctx.run_id(), stage = %stage, error = %e, "Stage failed");
                    ctx.stage_failed(&stage, &e.to_string());
                }
            }
        }

        if failed == attempted {
            return Err(PipelineError::Failed(format!(
                "all {} sources failed",
                attempted
            )));
        }

        ctx.checkpoint()?;
        Ok(rank_ideas(ideas, ctx.run_id()))
    }
}

/// Tag every idea with the run id, fill in missing composite scores, and
/// order by composite score, best first.
pub fn rank_ideas(ideas: Vec<Value>, run_id: &str) -> Vec<Value> {
    let mut ranked: Vec<Value> = ideas
        .into_iter()
        .map(|mut idea| {
            if let Some(fields) = idea.as_object_mut() {
                if !fields.contains_key("composite_score") {
                    let score = composite_score(fields);
                    fields.insert("composite_score".to_string(), json!(score));
                }
                fields.insert("research_run_id".to_string(), json!(run_id));
            }
            idea
        })
        .collect();

    ranked.sort_by(|a, b| score_of(b).total_cmp(&score_of(a)));
    ranked
}

/// Mean of business potential, market size, inverted competition and sentiment.
/// Missing or null scores count as zero.
pub fn composite_score(idea: &serde_json::Map<String, Value>) -> f64 {
    let field = |key: &str| idea.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    let scores = [
        field("business_potential"),
        field("market_size_score"),
        1.0 - field("competition_score"),
        field("sentiment_score"),
    ];
    scores.iter().sum::<f64>() / scores.len() as f64
}

fn score_of(idea: &Value) -> f64 {
    idea.get("composite_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::CancellationToken;
    use crate::sources::{SimulatedSource, SourceRegistry};
    use crate::usage::UsageAccumulator;
    use crate::pipeline::execution::StageCallbacks;
    use std::sync::{Arc, Mutex};

    fn recording_context(log: Arc<Mutex<Vec<String>>>) -> PipelineContext {
        let (a, b, c) = (log.clone(), log.clone(), log);
        PipelineContext::new(
            "run-1",
            CancellationToken::new(),
            Arc::new(UsageAccumulator::new("run-1", "groq", None)),
            StageCallbacks::new(
                move |stage| a.lock().expect("lock").push(format!("start:{}", stage)),
                move |stage, summary| b.lock().expect("lock").push(format!("done:{}:{}", stage, summary)),
                move |stage, error| c.lock().expect("lock").push(format!("fail:{}:{}", stage, error)),
            ),
        )
    }

    fn pipeline(sources: Vec<SimulatedSource>) -> ResearchPipeline {
        let registry = sources.into_iter().fold(SourceRegistry::new(), |reg, s| {
            reg.with_source(Arc::new(s))
        });
        ResearchPipeline::new(registry)
    }

    #[test]
    fn test_composite_score_matches_formula() {
        let idea = json!({
            "business_potential": 0.8,
            "market_size_score": 0.6,
            "competition_score": 0.2,
            "sentiment_score": 0.4,
        });
        let score = composite_score(idea.as_object().expect("object"));
        assert!((score - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_composite_score_treats_missing_as_zero() {
        let idea = json!({"business_potential": null});
        let score = composite_score(idea.as_object().expect("object"));
        // Only the inverted competition term contributes.
        assert!((score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_rank_ideas_sorts_and_tags() {
        let ideas = vec![
            json!({"title": "low", "composite_score": 0.1}),
            json!({"title": "high", "composite_score": 0.9}),
            json!({"title": "computed", "business_potential": 1.0, "market_size_score": 1.0, "sentiment_score": 1.0}),
        ];

        let ranked = rank_ideas(ideas, "run-1");
        let titles: Vec<&str> = ranked.iter().filter_map(|i| i["title"].as_str()).collect();
        assert_eq!(titles, vec!["computed", "high", "low"]);
        assert!(ranked.iter().all(|i| i["research_run_id"] == "run-1"));
        // Existing scores are kept as-is.
        assert_eq!(ranked[1]["composite_score"], 0.9);
    }

    #[test]
    fn test_execute_runs_stage_per_source() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ctx = recording_context(log.clone());
        let pipe = pipeline(vec![
            SimulatedSource::new("reddit").with_items(2).with_units_per_item(10),
            SimulatedSource::new("github").with_items(1).with_units_per_item(10),
        ]);

        let results = pipe
            .execute(ResearchInput::new("pet care", ["reddit", "github"]), &ctx)
            .expect("execute");

        assert_eq!(results.len(), 3);
        assert_eq!(
            *log.lock().expect("lock"),
            vec!["start:reddit", "done:reddit:2 items", "start:github", "done:github:1 items"]
        );

        let usage = ctx.usage_snapshot();
        assert_eq!(usage.call_count, 2);
        assert_eq!(usage.prompt_units, 30);
    }

    #[test]
    fn test_failed_stage_does_not_stop_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ctx = recording_context(log.clone());
        let pipe = pipeline(vec![
            SimulatedSource::new("news").failing("quota exhausted"),
            SimulatedSource::new("reddit").with_items(1),
        ]);
        let input = ResearchInput::new("q", ["news", "reddit"])
            .with_settings(SourceSettings::new().with_toggle("news", true));

        let results = pipe.execute(input, &ctx).expect("execute");
        assert_eq!(results.len(), 1);

        let log = log.lock().expect("lock");
        assert_eq!(log[0], "start:news");
        assert!(log[1].starts_with("fail:news:"));
        assert!(log[1].contains("quota exhausted"));
    }

    #[test]
    fn test_all_stages_failing_fails_run() {
        let ctx = recording_context(Arc::new(Mutex::new(Vec::new())));
        let pipe = pipeline(vec![SimulatedSource::new("reddit").failing("down")]);

        let err = pipe
            .execute(ResearchInput::new("q", ["reddit"]), &ctx)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Failed(_)));
    }

    #[test]
    fn test_no_usable_sources_returns_empty() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ctx = recording_context(log.clone());
        let pipe = pipeline(vec![SimulatedSource::new("wikipedia")]);

        // wikipedia is off by default and "ghost" is not registered.
        let results = pipe
            .execute(ResearchInput::new("q", ["wikipedia", "ghost"]), &ctx)
            .expect("execute");
        assert!(results.is_empty());
        assert!(log.lock().expect("lock").is_empty());
    }

    #[test]
    fn test_cancelled_before_first_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ctx = recording_context(log.clone());
        ctx.token().signal();
        let pipe = pipeline(vec![SimulatedSource::new("reddit")]);

        let err = pipe
            .execute(ResearchInput::new("q", ["reddit"]), &ctx)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(log.lock().expect("lock").is_empty());
    }

    #[test]
    fn test_empty_query_is_invalid() {
        let ctx = recording_context(Arc::new(Mutex::new(Vec::new())));
        let err = pipeline(vec![])
            .execute(ResearchInput::new("  ", ["reddit"]), &ctx)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn test_describe_and_metering() {
        let pipe = pipeline(vec![]);
        let input = ResearchInput::new("q", ["reddit"]).with_provider("gemini");
        assert_eq!(pipe.describe(&input), json!({"query": "q", "sources": ["reddit"]}));
        assert_eq!(pipe.metering(&input).provider.as_deref(), Some("gemini"));
    }
}
