use async_trait::async_trait;
use tracing::debug;

use super::pattern::SearchRequest;
use super::{Evaluator, PolicyJob};
use crate::engine::Engine;
use crate::sarif::{Location, ResultFactory, SarifResult};
use crate::severity::SarifLevel;

/// Pattern matches are violations.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanEvaluator;

#[async_trait]
impl Evaluator for ScanEvaluator {
    async fn evaluate(&self, engine: &Engine, job: &PolicyJob) -> anyhow::Result<Vec<SarifResult>> {
        let policy = &job.policy;
        let paths = job.paths();
        let ignore = engine.ignore_rules();
        let matches = engine
            .searcher()
            .search(SearchRequest {
                patterns: &policy.regex,
                files: &paths,
                ignore: &ignore,
            })
            .await?;

        let factory = ResultFactory::new(policy, engine.environment());
        let level = factory.failing_level();
        let mut results = Vec::new();

        for m in &matches {
            for sub in &m.submatches {
                let text = &sub.text;
                let (start, end) = sub.columns(&m.line);
                let message = if text.is_empty() {
                    format!("Policy violation: {}", policy.metadata.name)
                } else {
                    format!(
                        "Policy violation: {} Matched text: {}",
                        policy.metadata.name, text
                    )
                };
                results.push(factory.detail(
                    level,
                    message,
                    vec![Location::region(
                        m.path.clone(),
                        m.line_number,
                        start,
                        end,
                        Some(text.clone()),
                    )],
                ));
            }
        }

        debug!(policy = %policy.id, files = paths.len(), violations = results.len(), "scan evaluated");

        if results.is_empty() {
            results.push(factory.summary(
                SarifLevel::Note,
                format!("Policy {} is compliant: No violations found", policy.id),
                vec![Location::not_applicable()],
            ));
        } else {
            let count = results.len();
            results.push(factory.summary(
                level,
                format!("Policy {} is non-compliant: {count} violations found", policy.id),
                vec![Location::not_applicable()],
            ));
        }
        Ok(results)
    }

    fn cacheable(&self, _job: &PolicyJob) -> bool {
        true
    }
}
