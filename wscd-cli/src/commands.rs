//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::TrainArgs;
use std::path::Path;
use wscd_core::{ConfigOverrides, ModelVariant, TrainConfig};
use wscd_ml::training::{CheckpointEntry, Checkpointer};
use wscd_ml::{RunContext, RunSummary, StopReason, TrainingOrchestrator};

/// Handle a CLI subcommand.
pub fn handle_command(
    command: Commands,
    workdir: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Train(args) => handle_train(args, workdir, config_file),
        Commands::Config { action } => handle_config(action, workdir, config_file),
        Commands::Checkpoints { model, json } => {
            handle_checkpoints(model, json, workdir, config_file)
        }
    }
}

fn load(
    workdir: &Path,
    config_file: Option<&Path>,
    overrides: &ConfigOverrides,
) -> anyhow::Result<TrainConfig> {
    wscd_core::load_config(config_file, workdir, overrides)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn handle_train(args: TrainArgs, workdir: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load(workdir, config_file, &args.into_overrides())?;
    let ctx = RunContext::new(config.random_seed, config.device)?;
    let test_only = config.test_only;
    let mut orchestrator = TrainingOrchestrator::from_config(config, &ctx)?;

    if test_only {
        let result = orchestrator.evaluate()?;
        println!(
            "F-score {:.4}  precision {:.4}  recall {:.4}",
            result.f_score, result.precision, result.recall
        );
        return Ok(());
    }

    let summary = orchestrator.run()?;
    println!("{}", render_summary(&summary));
    Ok(())
}

fn render_summary(summary: &RunSummary) -> String {
    let state = &summary.state;
    let reason = match summary.stop_reason {
        StopReason::Budget => "iteration budget reached",
        StopReason::EarlyStop => "early stop",
    };
    let best_epoch = state
        .best_epoch
        .map(|epoch| epoch.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut lines = vec![
        format!("Stopped: {reason}"),
        format!(
            "Iterations: {}  epochs: {}  validations: {} (every {} iterations)",
            state.cur_iteration,
            state.cur_epoch,
            summary.validations.len(),
            summary.validation_interval
        ),
        format!("Best F-score: {:.4} (epoch {best_epoch})", state.best_score),
    ];
    if let Some(report) = &summary.merge_report {
        lines.push(format!(
            "Checkpoint merge: {} applied, {} left default, {} discarded",
            report.applied.len(),
            report.left_default.len(),
            report.discarded.len()
        ));
    }
    lines.join("\n")
}

fn handle_config(
    action: ConfigAction,
    workdir: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = config_file
                .map(Path::to_path_buf)
                .unwrap_or_else(|| workdir.join(wscd_core::config::CONFIG_FILE_NAME));
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            wscd_core::write_default_config(&config_path)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workdir, config_file, &ConfigOverrides::default())?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn handle_checkpoints(
    model: Option<ModelVariant>,
    json: bool,
    workdir: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        model,
        ..ConfigOverrides::default()
    };
    let config = load(workdir, config_file, &overrides)?;
    let checkpointer = Checkpointer::from_config(&config);
    let entries = checkpointer.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No checkpoints in {}", checkpointer.dir().display());
        return Ok(());
    }
    let best = checkpointer.best()?;
    println!("{}", render_checkpoints(&entries, best.as_ref()));
    Ok(())
}

fn render_checkpoints(entries: &[CheckpointEntry], best: Option<&CheckpointEntry>) -> String {
    entries
        .iter()
        .map(|entry| {
            let marker = if best.is_some_and(|b| b.id == entry.id) {
                "*"
            } else {
                " "
            };
            format!(
                "{marker} {:<6} epoch {:>4}  F {:.4}  {}  {}",
                entry.tag.as_str(),
                entry.epoch,
                entry.f_score,
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.path.display()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use wscd_ml::TrainingState;
    use wscd_ml::training::{CheckpointTag, MergeReport};

    fn entry(id: &str, tag: CheckpointTag, epoch: u64, f_score: f64) -> CheckpointEntry {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "tag": tag.as_str(),
            "epoch": epoch,
            "f_score": f_score,
            "path": format!("/runs/{tag}_epoch{epoch}.json"),
            "sha256": "00",
            "size_bytes": 10,
            "created_at": "2024-05-01T12:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn test_config_init_writes_once() {
        let dir = TempDir::new().unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();
        let path = dir.path().join("wscd.toml");
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("total_itrs"));

        std::fs::write(&path, "batch_size = 2\n").unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "batch_size = 2\n");
    }

    #[test]
    fn test_checkpoint_listing_marks_best() {
        let entries = vec![
            entry("a", CheckpointTag::Best, 1, 0.61),
            entry("b", CheckpointTag::Best, 3, 0.74),
            entry("c", CheckpointTag::Latest, 4, 0.70),
        ];
        let rendered = render_checkpoints(&entries, entries.get(1));
        let marked: Vec<&str> = rendered.lines().filter(|l| l.starts_with('*')).collect();
        assert_eq!(marked.len(), 1);
        assert!(marked[0].contains("epoch    3"));
        assert!(marked[0].contains("F 0.7400"));
    }

    #[test]
    fn test_summary_mentions_stop_reason_and_merge() {
        let summary = RunSummary {
            state: TrainingState {
                cur_iteration: 24,
                cur_epoch: 6,
                best_score: 0.5,
                best_epoch: Some(2),
                ..TrainingState::default()
            },
            stop_reason: StopReason::EarlyStop,
            validation_interval: 6,
            validations: Vec::new(),
            merge_report: Some(MergeReport {
                applied: vec!["a".into()],
                left_default: Vec::new(),
                discarded: vec!["b".into(), "c".into()],
            }),
        };
        let rendered = render_summary(&summary);
        assert!(rendered.contains("early stop"));
        assert!(rendered.contains("Best F-score: 0.5000 (epoch 2)"));
        assert!(rendered.contains("1 applied, 0 left default, 2 discarded"));
    }
}
