//! Markdown export of finished (or partial) research reports.
//!
//! Reports are rendered with a Handlebars template and written to month directories:
//! `<output_dir>/YYYY-MM/<prefix>_<id8>_<YYYYMMDD_HHMMSS>.md`.

use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ExportConfig;
use crate::error::ExportError;
use crate::types::{ResultRecord, TaskRecord, short_id};

const REPORT_TEMPLATE: &str = "# {{title}}

{{#if include_metadata}}
| Field | Value |
|-------|-------|
| Task | `{{task_id}}` |
| Status | {{status}}{{#if partial}} (partial){{/if}} |
| Model | {{model}} |
| Created | {{created_at}} |
| Completed | {{completed_at}} |
| Duration | {{duration_minutes}} min |
| Tokens | {{tokens_in}} in / {{tokens_out}} out |
| Estimated cost | ${{cost}} |

{{/if}}
## Query

{{query}}

## Findings

{{report}}
{{#if include_sources}}{{#if sources}}

## Sources

{{#each sources}}
{{n}}. [{{title}}]({{url}}){{#if snippet}} - {{snippet}}{{/if}}
{{/each}}
{{/if}}{{/if}}

---
*Saved {{saved_at}}*
";

const TITLE_LIMIT: usize = 80;

/// Where a report was written.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedReport {
    pub path: PathBuf,
    pub filename: String,
    pub bytes: u64,
    pub sections: Vec<&'static str>,
}

pub struct MarkdownExporter {
    handlebars: Handlebars<'static>,
    config: ExportConfig,
}

impl MarkdownExporter {
    pub fn new(config: ExportConfig) -> Result<Self, ExportError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string("report", REPORT_TEMPLATE)
            .map_err(|e| ExportError::Render {
                message: e.to_string(),
            })?;
        Ok(Self { handlebars, config })
    }

    pub fn output_dir(&self) -> PathBuf {
        self.config.resolved_output_dir()
    }

    /// Render a report to Markdown.
    pub fn render(
        &self,
        task: &TaskRecord,
        result: &ResultRecord,
        saved_at: DateTime<Utc>,
    ) -> Result<String, ExportError> {
        let completed = task.completed_at.unwrap_or(saved_at);
        let duration = (completed - task.created_at).num_milliseconds().max(0) as f64 / 60_000.0;
        let sources: Vec<_> = result
            .sources
            .iter()
            .enumerate()
            .map(|(i, s)| {
                json!({
                    "n": i + 1,
                    "title": s.title,
                    "url": s.url,
                    "snippet": s.snippet,
                })
            })
            .collect();

        let context = json!({
            "title": report_title(&task.query),
            "task_id": task.id,
            "status": task.status.as_str(),
            "partial": result.is_partial(),
            "model": task.model,
            "created_at": task.created_at.to_rfc3339(),
            "completed_at": completed.to_rfc3339(),
            "duration_minutes": format!("{duration:.2}"),
            "tokens_in": task.tokens_in,
            "tokens_out": task.tokens_out,
            "cost": format!("{:.4}", task.cost_estimate),
            "query": task.query,
            "report": result.report,
            "sources": sources,
            "include_metadata": self.config.include_metadata,
            "include_sources": self.config.include_sources,
            "saved_at": saved_at.to_rfc3339(),
        });

        self.handlebars
            .render("report", &context)
            .map_err(|e| ExportError::Render {
                message: e.to_string(),
            })
    }

    /// Render and write a report into the month directory for `saved_at`.
    pub fn export(
        &self,
        task: &TaskRecord,
        result: &ResultRecord,
        saved_at: DateTime<Utc>,
    ) -> Result<ExportedReport, ExportError> {
        let content = self.render(task, result, saved_at)?;
        let month_dir = self
            .output_dir()
            .join(saved_at.format("%Y-%m").to_string());
        let filename = report_filename(&self.config.file_prefix, &task.id, saved_at);
        let path = month_dir.join(&filename);

        atomic_write(&path, content.as_bytes()).map_err(|e| ExportError::Write {
            path: path.clone(),
            message: e.to_string(),
        })?;
        info!(path = %path.display(), bytes = content.len(), "Saved report");

        let mut sections = Vec::new();
        if self.config.include_metadata {
            sections.push("metadata");
        }
        sections.push("findings");
        if self.config.include_sources && !result.sources.is_empty() {
            sections.push("sources");
        }

        Ok(ExportedReport {
            path,
            filename,
            bytes: content.len() as u64,
            sections,
        })
    }
}

/// Document title derived from the query, truncated to 80 characters.
pub fn report_title(query: &str) -> String {
    let query = query.trim();
    if query.chars().count() > TITLE_LIMIT {
        let head: String = query.chars().take(TITLE_LIMIT - 3).collect();
        format!("{head}...")
    } else {
        query.to_string()
    }
}

pub fn report_filename(prefix: &str, task_id: &str, ts: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}.md",
        prefix,
        short_id(task_id),
        ts.format("%Y%m%d_%H%M%S")
    )
}

/// Write to a `.tmp` sibling, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Source, TaskStatus, meta};
    use chrono::TimeZone;

    fn task() -> TaskRecord {
        let mut task = TaskRecord::new("Effects of & on <markdown>", "model-x", 60);
        task.id = "550e8400-e29b-41d4-a716-446655440000".into();
        task.status = TaskStatus::Completed;
        task.tokens_in = 1000;
        task.tokens_out = 2000;
        task.cost_estimate = 0.009;
        task.completed_at = Some(task.created_at + chrono::Duration::minutes(12));
        task
    }

    fn result() -> ResultRecord {
        let mut result = ResultRecord::new("550e8400", "Body with **bold** & <tags>");
        result.sources.push(Source {
            title: "First".into(),
            url: "https://example.com/1".into(),
            snippet: Some("snip".into()),
            relevance_score: None,
        });
        result
    }

    #[test]
    fn test_title_truncation() {
        assert_eq!(report_title("short"), "short");
        let long = "a".repeat(120);
        let title = report_title(&long);
        assert_eq!(title.chars().count(), 80);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_filename_format() {
        let ts = Utc.with_ymd_and_hms(2025, 12, 14, 10, 30, 45).unwrap();
        assert_eq!(
            report_filename("research", "550e8400-e29b", ts),
            "research_550e8400_20251214_103045.md"
        );
    }

    #[test]
    fn test_render_is_not_html_escaped() {
        let exporter = MarkdownExporter::new(ExportConfig::default()).unwrap();
        let md = exporter.render(&task(), &result(), Utc::now()).unwrap();
        assert!(md.starts_with("# Effects of & on <markdown>"));
        assert!(md.contains("Body with **bold** & <tags>"));
        assert!(md.contains("1. [First](https://example.com/1) - snip"));
        assert!(md.contains("| Duration | 12.00 min |"));
        assert!(!md.contains("(partial)"));
    }

    #[test]
    fn test_render_marks_partial_and_hides_sections() {
        let config = ExportConfig {
            include_metadata: false,
            include_sources: false,
            ..Default::default()
        };
        let exporter = MarkdownExporter::new(config).unwrap();
        let mut partial = result();
        partial.set_meta(meta::PARTIAL, true);
        let md = exporter.render(&task(), &partial, Utc::now()).unwrap();
        assert!(!md.contains("| Task |"));
        assert!(!md.contains("## Sources"));
        assert!(md.contains("## Findings"));
    }

    #[test]
    fn test_export_writes_month_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExportConfig {
            output_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let exporter = MarkdownExporter::new(config).unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 3, 9, 8, 0, 0).unwrap();
        let exported = exporter.export(&task(), &result(), ts).unwrap();

        assert_eq!(exported.filename, "research_550e8400_20250309_080000.md");
        assert_eq!(exported.path, dir.path().join("2025-03").join(&exported.filename));
        assert_eq!(exported.sections, vec!["metadata", "findings", "sources"]);
        let written = std::fs::read_to_string(&exported.path).unwrap();
        assert_eq!(written.len() as u64, exported.bytes);
        assert!(!dir.path().join("2025-03").join("research_550e8400_20250309_080000.tmp").exists());
    }
}
