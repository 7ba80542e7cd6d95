//! Prompt template management.

use handlebars::Handlebars;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

use crate::error::WorkflowError;
use crate::stage::Stage;

/// Values available to every template.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub repository: String,
    pub issue_number: u64,
    pub title: String,
    pub body: String,
    pub stage: String,
    pub branch: String,
    pub labels: Vec<String>,
}

/// Handlebars templates for each role.
pub struct PromptLibrary {
    handlebars: Handlebars<'static>,
}

const TEMPLATES: &[(&str, &str)] = &[
    ("process", PROCESS_TEMPLATE),
    ("qa", QA_TEMPLATE),
    ("actions", CODE_TEMPLATE),
    ("feature-implement", CODE_TEMPLATE),
    ("feature-fix", FIX_TEMPLATE),
    ("audit", AUDIT_TEMPLATE),
    ("ready-for-tests", TESTS_TEMPLATE),
    ("docs", CODE_TEMPLATE),
];

impl PromptLibrary {
    /// Library with the embedded templates.
    pub fn new() -> Result<Self, WorkflowError> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        for (name, template) in TEMPLATES {
            handlebars
                .register_template_string(name, *template)
                .map_err(|e| WorkflowError::Configuration(format!("prompt template {name}: {e}")))?;
        }
        Ok(Self { handlebars })
    }

    /// Embedded templates, overridden by any `{stage-slug}.hbs` in `dir`.
    pub fn with_overrides(dir: &Path) -> Result<Self, WorkflowError> {
        let mut library = Self::new()?;
        for (name, _) in TEMPLATES {
            let path = dir.join(format!("{name}.hbs"));
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| {
                WorkflowError::Configuration(format!("failed to read {}: {e}", path.display()))
            })?;
            library
                .handlebars
                .register_template_string(name, &content)
                .map_err(|e| WorkflowError::Configuration(format!("prompt template {name}: {e}")))?;
            debug!(template = name, path = %path.display(), "Loaded prompt override");
        }
        Ok(library)
    }

    pub fn render(&self, stage: Stage, context: &PromptContext) -> Result<String, WorkflowError> {
        self.handlebars
            .render(stage.slug(), context)
            .map_err(|e| WorkflowError::handler(stage, format!("prompt rendering failed: {e}")))
    }

    /// Role description sent as the system prompt.
    #[must_use]
    pub fn system_prompt(stage: Stage) -> &'static str {
        match stage {
            Stage::Process => "You are the product manager. Break issues into clear, testable requirements.",
            Stage::Qa => "You are the QA lead. Write precise test plans before any code exists.",
            Stage::Actions => "You are a CI engineer. Write GitHub Actions workflows that build and test the change.",
            Stage::FeatureImplement | Stage::FeatureFix => {
                "You are a senior engineer. Write complete, working code; never leave placeholders."
            }
            Stage::Audit => "You are a strict code auditor. Only pass code that fully meets the requirements.",
            Stage::ReadyForTests => "You are the QA lead. Check the implementation against the agreed test plan.",
            Stage::Docs => "You are a technical writer. Document behavior for users and maintainers.",
            _ => "You are a member of an automated software team.",
        }
    }
}

const PROCESS_TEMPLATE: &str = r"Break the following issue into requirements.

Repository: {{repository}}
Issue #{{issue_number}}: {{title}}

{{body}}

Respond in Markdown with sections: Summary, Requirements (numbered), Out of scope, Open questions.
";

const QA_TEMPLATE: &str = r"Write a test plan for this issue.

Repository: {{repository}}
Issue #{{issue_number}}: {{title}}

{{body}}

List each test case with: name, setup, steps, expected result. Cover edge cases and failure paths.
";

const CODE_TEMPLATE: &str = r"Stage: {{stage}}

Repository: {{repository}}
Issue #{{issue_number}}: {{title}}
Branch: {{branch}}

{{body}}

Return every file you create or change as a complete file, using exactly this format:

--- FILE: path/relative/to/repo
<full file content>
--- END FILE

Paths are relative to the repository root. Do not return partial files or diffs.
";

const FIX_TEMPLATE: &str = r"The implementation on branch {{branch}} failed review or testing. Fix it.

Repository: {{repository}}
Issue #{{issue_number}}: {{title}}

{{body}}

Read the audit and test comments on the issue, then return every file you change as a complete file:

--- FILE: path/relative/to/repo
<full file content>
--- END FILE
";

const AUDIT_TEMPLATE: &str = r"Audit the implementation on branch {{branch}} against the issue requirements.

Repository: {{repository}}
Issue #{{issue_number}}: {{title}}

{{body}}

Report findings as a Markdown list. End your response with exactly one line:
VERDICT: PASS
or
VERDICT: FAIL
";

const TESTS_TEMPLATE: &str = r"Check whether the implementation on branch {{branch}} satisfies the test plan posted on this issue.

Repository: {{repository}}
Issue #{{issue_number}}: {{title}}

{{body}}

Summarize each test case as passed or failed. End your response with exactly one line:
TESTS: PASS
or
TESTS: FAIL
";

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PromptContext {
        PromptContext {
            repository: "acme/widgets".to_string(),
            issue_number: 42,
            title: "Export <widgets> to CSV".to_string(),
            body: "Users need CSV & JSON".to_string(),
            stage: "Feature".to_string(),
            branch: "stone/issue-42".to_string(),
            labels: vec!["stone-feature-implement".to_string()],
        }
    }

    #[test]
    fn test_every_dispatchable_role_with_a_prompt_renders() {
        let library = PromptLibrary::new().unwrap();
        for stage in [
            Stage::Process,
            Stage::Qa,
            Stage::Actions,
            Stage::FeatureImplement,
            Stage::FeatureFix,
            Stage::Audit,
            Stage::ReadyForTests,
            Stage::Docs,
        ] {
            let prompt = library.render(stage, &context()).unwrap();
            assert!(prompt.contains("Issue #42"), "{stage:?}");
        }
    }

    #[test]
    fn test_no_html_escaping() {
        let library = PromptLibrary::new().unwrap();
        let prompt = library.render(Stage::FeatureImplement, &context()).unwrap();
        assert!(prompt.contains("Export <widgets> to CSV"));
        assert!(prompt.contains("--- FILE:"));
    }

    #[test]
    fn test_overrides_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qa.hbs"), "custom QA for #{{issue_number}}").unwrap();

        let library = PromptLibrary::with_overrides(dir.path()).unwrap();
        assert_eq!(library.render(Stage::Qa, &context()).unwrap(), "custom QA for #42");
        assert!(library.render(Stage::Audit, &context()).unwrap().contains("VERDICT"));
    }

    #[test]
    fn test_stage_without_template_is_handler_error() {
        let library = PromptLibrary::new().unwrap();
        assert!(matches!(
            library.render(Stage::Pr, &context()),
            Err(WorkflowError::Handler { .. })
        ));
    }
}
