//! Deterministic stand-in source.
//!
//! Produces scored idea records without touching the network. Used by the
//! `simulate` command and in tests.

use std::time::Duration;

use serde_json::json;

use super::{FetchReport, SourceError, SourceFetcher};

#[derive(Debug, Clone)]
pub struct SimulatedSource {
    id: String,
    items: usize,
    latency: Duration,
    units_per_item: u64,
    failure: Option<String>,
}

impl SimulatedSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            items: 3,
            latency: Duration::ZERO,
            units_per_item: 120,
            failure: None,
        }
    }

    pub fn with_items(mut self, items: usize) -> Self {
        self.items = items;
        self
    }

    /// Sleep this long inside every fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_units_per_item(mut self, units: u64) -> Self {
        self.units_per_item = units;
        self
    }

    /// Make every fetch fail with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    fn score(&self, index: usize, salt: usize) -> f64 {
        let seed = self.id.bytes().map(usize::from).sum::<usize>() + index * 7 + salt * 13;
        (seed % 10) as f64 / 10.0
    }
}

impl SourceFetcher for SimulatedSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch(&self, query: &str) -> Result<FetchReport, SourceError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if let Some(message) = &self.failure {
            return Err(SourceError::Unavailable {
                source_id: self.id.clone(),
                message: message.clone(),
            });
        }

        let items: Vec<_> = (0..self.items)
            .map(|i| {
                json!({
                    "title": format!("{} idea #{} for {}", self.id, i + 1, query),
                    "source": self.id,
                    "business_potential": self.score(i, 1),
                    "market_size_score": self.score(i, 2),
                    "competition_score": self.score(i, 3),
                    "sentiment_score": self.score(i, 4),
                })
            })
            .collect();

        let prompt_units = self.units_per_item * self.items as u64;
        Ok(FetchReport {
            items,
            prompt_units,
            completion_units: prompt_units / 4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_produces_scored_items() {
        let source = SimulatedSource::new("reddit").with_items(2).with_units_per_item(100);
        let report = source.fetch("pet care").expect("fetch");

        assert_eq!(report.items.len(), 2);
        assert_eq!(report.prompt_units, 200);
        assert_eq!(report.completion_units, 50);
        assert_eq!(report.items[0]["source"], "reddit");
        assert!(report.items[0]["title"].as_str().expect("title").contains("pet care"));
        let score = report.items[1]["business_potential"].as_f64().expect("score");
        assert!((0.0..1.0).contains(&score));
    }

    #[test]
    fn test_fetch_is_deterministic() {
        let source = SimulatedSource::new("github");
        assert_eq!(source.fetch("q").expect("fetch"), source.fetch("q").expect("fetch"));
    }

    #[test]
    fn test_failing_source() {
        let err = SimulatedSource::new("news").failing("quota exhausted").fetch("q").unwrap_err();
        assert_eq!(
            err,
            SourceError::Unavailable {
                source_id: "news".to_string(),
                message: "quota exhausted".to_string(),
            }
        );
    }
}
