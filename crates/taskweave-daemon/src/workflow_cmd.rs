//! `taskweave-daemon workflow ...` subcommands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use taskweave_core::config::Config;
use taskweave_daemon::workflow::{
    FileWorkflowStore, RunMode, RunStatus, WorkflowDoc, WorkflowEngine, WorkflowStore, validate,
};

use crate::{build_dispatcher, read_file, resolve_workflow_dir};

/// Workflow management subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum WorkflowAction {
    /// Check a workflow file and report every problem found.
    Validate {
        /// Path to a workflow JSON document
        file: PathBuf,
    },

    /// Validate a workflow file and store it under its name.
    Save {
        /// Path to a workflow JSON document
        file: PathBuf,
    },

    /// Run a stored workflow and print the run record as JSON.
    Run {
        /// Workflow name
        name: String,

        /// Input variable as KEY=VALUE; overrides the workflow's defaults. Repeatable.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Resolve templates and conditions without invoking any agent.
        #[arg(long)]
        dry_run: bool,
    },

    /// List stored workflows.
    List,

    /// Print a stored workflow.
    Show {
        /// Workflow name
        name: String,
    },

    /// Delete a stored workflow.
    Delete {
        /// Workflow name
        name: String,
    },
}

/// Execute the `workflow` subcommand.
pub async fn run(action: WorkflowAction, config: &Config) -> anyhow::Result<()> {
    let store = FileWorkflowStore::new(resolve_workflow_dir(config)?);
    match action {
        WorkflowAction::Validate { file } => run_validate(&file),
        WorkflowAction::Save { file } => run_save(&store, &file).await,
        WorkflowAction::Run {
            name,
            vars,
            dry_run,
        } => {
            let mode = if dry_run { RunMode::DryRun } else { RunMode::Live };
            run_workflow(&store, config, &name, vars.into_iter().collect(), mode).await
        }
        WorkflowAction::List => run_list(&store).await,
        WorkflowAction::Show { name } => run_show(&store, &name).await,
        WorkflowAction::Delete { name } => {
            store.delete(&name).await?;
            info!(workflow = %name, "Workflow deleted");
            Ok(())
        }
    }
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in {raw:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_file(file: &Path) -> anyhow::Result<WorkflowDoc> {
    let content = read_file(file)?;
    WorkflowDoc::from_json(&content).with_context(|| format!("Failed to parse {}", file.display()))
}

#[allow(clippy::print_stdout)]
fn run_validate(file: &Path) -> anyhow::Result<()> {
    let doc = parse_file(file)?;
    match validate(&doc) {
        Ok(workflow) => {
            println!(
                "{}: valid ({} steps)",
                workflow.name,
                workflow.steps.len()
            );
            println!("  order: {}", workflow.execution_order().join(" -> "));
            Ok(())
        }
        Err(errors) => {
            for message in errors.messages() {
                println!("  - {message}");
            }
            anyhow::bail!("{} validation error(s) in {}", errors.len(), file.display())
        }
    }
}

async fn run_save(store: &FileWorkflowStore, file: &Path) -> anyhow::Result<()> {
    let doc = parse_file(file)?;
    validate(&doc)?;
    store.save(&doc).await?;
    info!(workflow = %doc.name, dir = %store.dir().display(), "Workflow saved");
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn run_list(store: &FileWorkflowStore) -> anyhow::Result<()> {
    let docs = store.list().await?;
    if docs.is_empty() {
        println!("No workflows in {}", store.dir().display());
        return Ok(());
    }
    for doc in docs {
        if doc.description.is_empty() {
            println!("{} ({} steps)", doc.name, doc.steps.len());
        } else {
            println!("{} ({} steps) - {}", doc.name, doc.steps.len(), doc.description);
        }
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn run_show(store: &FileWorkflowStore, name: &str) -> anyhow::Result<()> {
    let doc = store.load(name).await?;
    println!("{}", doc.to_json_pretty()?);
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn run_workflow(
    store: &FileWorkflowStore,
    config: &Config,
    name: &str,
    vars: BTreeMap<String, String>,
    mode: RunMode,
) -> anyhow::Result<()> {
    let workflow = store.load_validated(name).await?;
    let engine = WorkflowEngine::new(build_dispatcher(config));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling workflow run");
            on_interrupt.cancel();
        }
    });

    let run = engine.execute(&workflow, vars, mode, &cancel).await;
    println!("{}", serde_json::to_string_pretty(&run)?);

    if run.status != RunStatus::Success {
        anyhow::bail!(
            "workflow {} finished with status {}: {}",
            run.workflow_name,
            run.status.as_str(),
            run.error.as_deref().unwrap_or("see step results")
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_splits_on_first_equals() {
        assert_eq!(
            parse_var("query=a=b").unwrap(),
            ("query".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_var("empty=").unwrap(),
            ("empty".to_string(), String::new())
        );
    }

    #[test]
    fn parse_var_rejects_malformed() {
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=value").is_err());
    }
}
