use async_trait::async_trait;
use tracing::debug;

use super::pattern::SearchRequest;
use super::{Evaluator, PolicyJob};
use crate::engine::Engine;
use crate::sarif::{Location, ResultFactory, SarifResult};
use crate::severity::SarifLevel;

/// Inverse of scan: the pattern must be present somewhere in the inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssureEvaluator;

#[async_trait]
impl Evaluator for AssureEvaluator {
    async fn evaluate(&self, engine: &Engine, job: &PolicyJob) -> anyhow::Result<Vec<SarifResult>> {
        let policy = &job.policy;
        let paths = job.paths();
        let ignore = engine.ignore_rules();
        let outcome = engine
            .searcher()
            .search(SearchRequest {
                patterns: &policy.regex,
                files: &paths,
                ignore: &ignore,
            })
            .await;

        // The handler hears about every execution, failed searches included.
        let matches = match outcome {
            Ok(matches) => matches,
            Err(e) => {
                engine.status().report(policy, false);
                return Err(e);
            }
        };
        let found = !matches.is_empty();
        engine.status().report(policy, found);

        let factory = ResultFactory::new(policy, engine.environment());
        debug!(policy = %policy.id, found, "assure evaluated");

        let result = if found {
            let locations = matches
                .iter()
                .map(|m| {
                    Location::region(
                        m.path.clone(),
                        m.line_number,
                        1,
                        m.line.trim_end_matches(['\r', '\n']).len(),
                        None,
                    )
                })
                .collect();
            factory.summary(
                SarifLevel::Note,
                format!("Assure policy {}: Pattern FOUND", policy.metadata.name),
                locations,
            )
        } else {
            factory.summary(
                factory.failing_level(),
                format!("Assure policy {}: Pattern NOT FOUND", policy.metadata.name),
                vec![Location::not_applicable()],
            )
        };
        Ok(vec![result])
    }
}
