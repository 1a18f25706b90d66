//! `spawn_research`: fan a list of questions out to parallel model calls.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::spawn::{SpawnCoordinator, SpawnJob};
use crate::core::tool_parser::ToolArgs;
use crate::tools::spec::{
    ArgKind, ArgSpec, ToolContext, ToolDescriptor, ToolError, ToolHandler, list_items,
    optional_str, required_str,
};
use crate::utils::one_line;

pub const DEFAULT_MAX_QUERIES: usize = 6;
const QUERY_LABEL_CHARS: usize = 60;

/// Tool that runs several research questions at once through the coordinator.
pub struct SpawnResearchTool {
    coordinator: Arc<SpawnCoordinator>,
    max_queries: usize,
}

impl SpawnResearchTool {
    #[must_use]
    pub fn new(coordinator: Arc<SpawnCoordinator>, max_queries: usize) -> Self {
        Self {
            coordinator,
            max_queries: max_queries.max(1),
        }
    }
}

#[async_trait]
impl ToolHandler for SpawnResearchTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "spawn_research",
            description: "Research several independent questions in parallel. Separate queries with `;` or newlines; optional shared context is prepended to each.",
            mutates: false,
            needs_confirmation: false,
            args: vec![
                ArgSpec::required("queries", ArgKind::List),
                ArgSpec::optional("context", ArgKind::Text),
            ],
        }
    }

    async fn execute(&self, args: &ToolArgs, _context: &ToolContext) -> Result<String, ToolError> {
        let queries = list_items(required_str(args, "queries")?);
        validate_queries(&queries, self.max_queries)?;

        let count = queries.len();
        let jobs = match optional_str(args, "context") {
            Some(shared) => self.coordinator.spawn_with_context(shared, queries).await,
            None => self.coordinator.run_jobs(queries).await,
        };

        let report = format_report(count, &jobs);
        if jobs.iter().any(|job| job.result.is_ok()) {
            Ok(report)
        } else {
            Err(ToolError::execution_failed(report))
        }
    }
}

fn validate_queries(queries: &[String], max_queries: usize) -> Result<(), ToolError> {
    if queries.is_empty() {
        return Err(ToolError::invalid_input("queries cannot be empty"));
    }
    if queries.len() > max_queries {
        return Err(ToolError::invalid_input(format!(
            "too many queries ({}, max {max_queries} to stay within rate limits)",
            queries.len()
        )));
    }
    Ok(())
}

/// Console and tool-result rendering of finished jobs.
pub fn format_report(count: usize, jobs: &[SpawnJob]) -> String {
    let mut out = format!("Spawned {count} parallel research queries:\n");

    for job in jobs {
        if let Ok(answer) = &job.result {
            let account = job
                .credential
                .as_ref()
                .map_or_else(|| "unassigned".to_string(), ToString::to_string);
            let _ = write!(
                out,
                "\n=== Query: {} ({account}) ===\n{}\n",
                one_line(&job.query, QUERY_LABEL_CHARS),
                answer.trim()
            );
        }
    }

    let failures: Vec<&SpawnJob> = jobs.iter().filter(|job| job.result.is_err()).collect();
    if !failures.is_empty() {
        out.push_str("\n=== Errors ===\n");
        for job in failures {
            if let Err(err) = &job.result {
                let _ = write!(
                    out,
                    "Query: {}\nError: {err}\n",
                    one_line(&job.query, QUERY_LABEL_CHARS)
                );
            }
        }
    }
    out.trim_end().to_string()
}
