//! Output formatting for CLI commands.

use serde::{Deserialize, Serialize};

use crate::cli::args::{NrtbenchArgs, OutputFormat};
use crate::coordinator::RunReport;
use crate::error::Result;

/// Results that can be printed for people as well as serialized.
pub trait HumanOutput {
    /// Lines printed in human format.
    fn human_lines(&self) -> Vec<String>;
}

/// Task order of one category.
#[derive(Debug, Serialize, Deserialize)]
pub struct CategoryListing {
    pub category: String,
    pub tasks: Vec<String>,
}

/// Result of `nrtbench tasks`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskListing {
    pub seed: u64,
    pub categories: Vec<CategoryListing>,
}

impl HumanOutput for TaskListing {
    fn human_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for listing in &self.categories {
            lines.push(format!("{} (seed {}):", listing.category, self.seed));
            for (i, task) in listing.tasks.iter().enumerate() {
                lines.push(format!("  {:>3}. {task}", i + 1));
            }
        }
        lines
    }
}

impl HumanOutput for RunReport {
    fn human_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Run {} ({:.1}s)", self.run_id, self.elapsed_secs),
            "════════════════".to_string(),
            format!(
                "Ingestion: {} records ({:.1}/s), {} retries, {} rejected, {} source errors, {} write errors",
                self.ingest.submitted,
                self.ingest.records_per_second,
                self.ingest.retries,
                self.ingest.rejected,
                self.ingest.source_errors,
                self.ingest.write_errors
            ),
            format!(
                "Writer: max_doc={} num_docs={} segments={} flushes={} merges={}",
                self.writer.max_doc,
                self.writer.num_docs,
                self.writer.segment_count,
                self.writer.flushes,
                self.writer.merges_committed
            ),
            format!(
                "Merges: completed={} failed={} abandoned={} admission_stalls={}",
                self.writer.compactor.completed,
                self.writer.compactor.failed,
                self.writer.compactor.abandoned,
                self.writer.compactor.admission_stalls
            ),
            format!(
                "Refresh: reopens={} unchanged={} errors={} fell_behind={} max_lag={}ms",
                self.refresh.reopens,
                self.refresh.unchanged,
                self.refresh.errors,
                self.refresh.fell_behind,
                self.refresh.max_lag_ms
            ),
            format!("Tasks: {} executed", self.tasks_executed),
        ];

        if !self.tasks.is_empty() {
            lines.push(String::new());
            lines.push(format!(
                "{:<16} {:>9} {:>7} {:>9} {:>9} {:>9} {:>9} {:>9}",
                "category", "count", "failed", "mean/s", "1m/s", "p50 us", "p99 us", "max us"
            ));
            lines.push("─".repeat(84));
            for report in &self.tasks {
                lines.push(format!(
                    "{:<16} {:>9} {:>7} {:>9.1} {:>9.1} {:>9} {:>9} {:>9}",
                    report.category,
                    report.count,
                    report.failures,
                    report.mean_rate,
                    report.one_minute_rate,
                    report.latency.p50_us,
                    report.latency.p99_us,
                    report.latency.max_us
                ));
            }
        }
        lines
    }
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize + HumanOutput>(result: &T, args: &NrtbenchArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => {
            for line in result.human_lines() {
                println!("{line}");
            }
            Ok(())
        }
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &NrtbenchArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}
