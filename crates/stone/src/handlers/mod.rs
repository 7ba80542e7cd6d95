//! Role handlers and the stage → handler table.
//!
//! The table is built once at startup. Every enabled dispatchable stage must
//! have exactly one handler; anything else is a configuration error raised
//! before the first issue is touched.

pub mod prompts;
mod roles;

pub use prompts::{PromptContext, PromptLibrary};
pub use roles::{
    CodeWritingHandler, ErrorTriageHandler, GateHandler, HandlerContext, PromptedRoleHandler,
    PullRequestHandler,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use stone_config::WorkflowConfig;
use tracing::debug;

use crate::error::WorkflowError;
use crate::github::Issue;
use crate::orchestrator::WorkflowRun;
use crate::stage::{LabelSet, Stage, DISPATCH_PRIORITY};

/// Everything a handler sees for one run.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub run: WorkflowRun,
    pub issue: Issue,
    pub labels: LabelSet,
}

/// Labels to add, plus labels to drop besides the current stage label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelTransition {
    pub add: Vec<String>,
    pub clear: Vec<String>,
}

impl LabelTransition {
    /// Move to `stage`.
    #[must_use]
    pub fn to(stage: Stage) -> Self {
        Self {
            add: vec![stage.label()],
            clear: Vec::new(),
        }
    }

    /// Also add an outcome marker.
    #[must_use]
    pub fn with_marker(mut self, marker: Stage) -> Self {
        self.add.push(marker.label());
        self
    }

    /// Also drop `stage`'s label if present.
    #[must_use]
    pub fn clearing(mut self, stage: Stage) -> Self {
        self.clear.push(stage.label());
        self
    }
}

/// What a handler decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Advance(LabelTransition),
    /// Stay on the current stage; nothing is relabelled
    Hold { reason: String },
}

/// One workflow role.
#[async_trait]
pub trait RoleHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, input: &StageInput) -> Result<StageOutcome, WorkflowError>;
}

/// Collects handlers before validation.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: Vec<(Stage, Arc<dyn RoleHandler>)>,
}

impl HandlerRegistryBuilder {
    #[must_use]
    pub fn register(mut self, stage: Stage, handler: Arc<dyn RoleHandler>) -> Self {
        self.handlers.push((stage, handler));
        self
    }

    /// Validate against the enabled stages and freeze the table.
    pub fn build(self, enabled: &[Stage]) -> Result<HandlerRegistry, WorkflowError> {
        let mut table: HashMap<Stage, Arc<dyn RoleHandler>> = HashMap::new();
        for (stage, handler) in self.handlers {
            if !stage.is_dispatchable() {
                return Err(WorkflowError::Configuration(format!(
                    "handler {} registered for non-dispatchable stage {}",
                    handler.name(),
                    stage.label()
                )));
            }
            if table.insert(stage, handler).is_some() {
                return Err(WorkflowError::Configuration(format!(
                    "more than one handler registered for {}",
                    stage.label()
                )));
            }
        }

        for stage in enabled {
            if !stage.is_dispatchable() {
                return Err(WorkflowError::Configuration(format!(
                    "{} cannot be enabled; it is never dispatched",
                    stage.label()
                )));
            }
            if !table.contains_key(stage) {
                return Err(WorkflowError::Configuration(format!(
                    "no handler registered for enabled stage {}",
                    stage.label()
                )));
            }
        }

        table.retain(|stage, _| enabled.contains(stage));
        debug!(stages = ?table.keys().collect::<Vec<_>>(), "Handler table built");
        Ok(HandlerRegistry { handlers: table })
    }
}

/// Frozen stage → handler table.
pub struct HandlerRegistry {
    handlers: HashMap<Stage, Arc<dyn RoleHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<_> = self.handlers.keys().collect();
        stages.sort();
        f.debug_struct("HandlerRegistry").field("stages", &stages).finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Handler for `stage`; a missing or disabled stage is a configuration error.
    pub fn get(&self, stage: Stage) -> Result<Arc<dyn RoleHandler>, WorkflowError> {
        self.handlers.get(&stage).cloned().ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "no enabled handler for stage {}",
                stage.label()
            ))
        })
    }

    #[must_use]
    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.handlers.contains_key(&stage)
    }
}

/// Enabled stages from configuration. Empty means every dispatchable stage.
///
/// Entries may be written with or without the `stone-` prefix.
pub fn enabled_stages_from_config(config: &WorkflowConfig) -> Result<Vec<Stage>, WorkflowError> {
    if config.enabled_stages.is_empty() {
        return Ok(DISPATCH_PRIORITY.to_vec());
    }
    config
        .enabled_stages
        .iter()
        .map(|entry| {
            let label = if entry.starts_with(crate::stage::LABEL_PREFIX) {
                entry.clone()
            } else {
                format!("{}{entry}", crate::stage::LABEL_PREFIX)
            };
            Stage::from_label(&label).ok_or_else(|| {
                WorkflowError::Configuration(format!("unknown stage in enabledStages: {entry}"))
            })
        })
        .collect()
}

/// Registry with the standard handler for every dispatchable stage.
pub fn standard_handlers(ctx: &Arc<HandlerContext>) -> HandlerRegistryBuilder {
    HandlerRegistry::builder()
        .register(Stage::Error, Arc::new(ErrorTriageHandler::new(Arc::clone(ctx))))
        .register(Stage::Process, Arc::new(PromptedRoleHandler::new(Stage::Process, Arc::clone(ctx))))
        .register(Stage::Qa, Arc::new(PromptedRoleHandler::new(Stage::Qa, Arc::clone(ctx))))
        .register(Stage::Actions, Arc::new(CodeWritingHandler::new(Stage::Actions, Arc::clone(ctx))))
        .register(
            Stage::FeatureImplement,
            Arc::new(CodeWritingHandler::new(Stage::FeatureImplement, Arc::clone(ctx))),
        )
        .register(
            Stage::FeatureFix,
            Arc::new(CodeWritingHandler::new(Stage::FeatureFix, Arc::clone(ctx))),
        )
        .register(Stage::Audit, Arc::new(GateHandler::audit(Arc::clone(ctx))))
        .register(Stage::ReadyForTests, Arc::new(GateHandler::tests(Arc::clone(ctx))))
        .register(Stage::Docs, Arc::new(CodeWritingHandler::new(Stage::Docs, Arc::clone(ctx))))
        .register(Stage::Pr, Arc::new(PullRequestHandler::new(Arc::clone(ctx))))
}
