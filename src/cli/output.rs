//! CLI output formatting

use crate::core::config::{PipelineConfig, StageConfig, StageKind};
use crate::engine::EngineConfig;
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Width of the separator printed between rendered templates
const SEPARATOR_WIDTH: usize = 60;

/// One line describing a stage, e.g. `#1 execute (workers: 4, channel: 8)`
pub fn format_stage(index: usize, stage: &StageConfig) -> String {
    let detail = match &stage.kind {
        StageKind::Execute(conf) => format!("{} queries", conf.queries.len()),
        StageKind::Buffer(conf) => {
            let mut triggers = Vec::new();
            if let Some(max) = conf.max_size {
                triggers.push(format!("max_size={}", max));
            }
            if let Some(ms) = conf.max_duration_ms {
                triggers.push(format!("max_duration={}ms", ms));
            }
            if conf.condition.is_some() {
                triggers.push("condition".to_string());
            }
            triggers.join(", ")
        }
        StageKind::Metrics(conf) => format!("{} metrics", conf.metrics.len()),
        StageKind::Sleep(conf) => format!("{}ms", conf.duration_ms),
        StageKind::Sequence(_) | StageKind::Debug(_) => String::new(),
    };

    format!(
        "#{} {} {} {}",
        index,
        style(stage.kind.name()).bold(),
        style(format!("(workers: {}, channel: {})", stage.workers, stage.channel_size)).dim(),
        style(detail).cyan()
    )
}

/// Multi-line summary of a validated pipeline
pub fn format_pipeline_summary(pipeline: &PipelineConfig, engine: &EngineConfig) -> String {
    let engine = match engine {
        EngineConfig::Local(_) => "local",
        EngineConfig::Remote(_) => "remote",
    };

    let mut lines = vec![
        format!("  Engine: {}", style(engine).bold()),
        format!("  Init queries: {}", style(pipeline.init.queries.len()).cyan()),
        format!("  Source: {}", style(&pipeline.source.query).bold()),
        format!("  Stages: {}", style(pipeline.stages.len()).cyan()),
    ];
    lines.extend(
        pipeline
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| format!("    {}", format_stage(i, stage))),
    );
    lines.join("\n")
}

/// Header line printed above a rendered template
pub fn format_template_header(name: &str) -> String {
    let title = format!("-- {} ", name);
    let pad = SEPARATOR_WIDTH.saturating_sub(title.chars().count());
    style(format!("{}{}", title, "-".repeat(pad))).dim().to_string()
}
