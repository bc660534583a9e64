//! Classification prompt templates.
//!
//! Prompts are plain-text files with a closed variable set; a missing file is
//! a fatal configuration error rather than a silent fallback.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// The answer vocabulary offered to the model.
pub const OUTPUT_LABELS: &str = "SENSITIVE, PERSONAL, or PUBLIC";

const SYSTEM_PROMPT_FILE: &str = "classification_system.md";
const USER_TEMPLATE_FILE: &str = "classification_user.md";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("classification system prompt not found: {0}; create it or set PROMPTS_DIR")]
    MissingSystem(PathBuf),
    #[error("classification user template not found: {0}; create it or set PROMPTS_DIR")]
    MissingUser(PathBuf),
    #[error("could not read prompt file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Values substituted into the templates. The variable set is closed:
/// `{sender}`, `{subject}`, `{body_preview}`, `{output_labels}`,
/// `{has_attachments}`, `{labels}`.
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub sender: &'a str,
    pub subject: &'a str,
    pub body_preview: &'a str,
    pub has_attachments: bool,
    pub labels: &'a [String],
}

#[derive(Debug, Clone)]
pub struct PromptSet {
    system: String,
    user_template: String,
}

impl PromptSet {
    /// Load both templates from the prompt directory.
    pub fn load(dir: &Path) -> Result<Self, PromptError> {
        let system_path = dir.join(SYSTEM_PROMPT_FILE);
        let user_path = dir.join(USER_TEMPLATE_FILE);
        if !system_path.exists() {
            return Err(PromptError::MissingSystem(system_path));
        }
        if !user_path.exists() {
            return Err(PromptError::MissingUser(user_path));
        }

        let system = read(&system_path)?.trim().to_string();
        let mut user_template = read(&user_path)?;
        if !user_template.is_empty() && !user_template.ends_with('\n') {
            user_template.push('\n');
        }

        Ok(Self {
            system,
            user_template,
        })
    }

    pub fn render_system(&self, vars: &TemplateVars<'_>) -> String {
        render(&self.system, vars)
    }

    pub fn render_user(&self, vars: &TemplateVars<'_>) -> String {
        render(&self.user_template, vars)
    }

    /// System and user content joined the way the token budget is measured.
    pub fn render_combined(&self, vars: &TemplateVars<'_>) -> String {
        format!("{}\n\n{}", self.render_system(vars), self.render_user(vars))
    }
}

fn read(path: &Path) -> Result<String, PromptError> {
    std::fs::read_to_string(path).map_err(|source| PromptError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    let labels = if vars.labels.is_empty() {
        "none".to_string()
    } else {
        vars.labels.join(", ")
    };
    template
        .replace("{sender}", vars.sender)
        .replace("{subject}", vars.subject)
        .replace("{body_preview}", vars.body_preview)
        .replace("{output_labels}", OUTPUT_LABELS)
        .replace(
            "{has_attachments}",
            if vars.has_attachments { "yes" } else { "no" },
        )
        .replace("{labels}", &labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_prompts(dir: &Path) {
        fs::write(
            dir.join(SYSTEM_PROMPT_FILE),
            "Classify into {output_labels}.\n",
        )
        .expect("write system");
        fs::write(
            dir.join(USER_TEMPLATE_FILE),
            "From: {sender}\nSubject: {subject}\nLabels: {labels}\nAttachments: {has_attachments}\n\n{body_preview}",
        )
        .expect("write user");
    }

    #[test]
    fn loads_and_renders_templates() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_prompts(dir.path());

        let prompts = PromptSet::load(dir.path()).expect("load");
        let labels = vec!["INBOX".to_string(), "Receipts".to_string()];
        let vars = TemplateVars {
            sender: "news@example.com",
            subject: "Weekly Digest",
            body_preview: "hello",
            has_attachments: false,
            labels: &labels,
        };

        let system = prompts.render_system(&vars);
        assert_eq!(system, "Classify into SENSITIVE, PERSONAL, or PUBLIC.");

        let user = prompts.render_user(&vars);
        assert!(user.contains("From: news@example.com"));
        assert!(user.contains("Labels: INBOX, Receipts"));
        assert!(user.contains("Attachments: no"));
        assert!(user.ends_with("hello\n"));
    }

    #[test]
    fn empty_labels_render_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_prompts(dir.path());
        let prompts = PromptSet::load(dir.path()).expect("load");
        let vars = TemplateVars {
            sender: "a@b.c",
            subject: "s",
            body_preview: "b",
            has_attachments: true,
            labels: &[],
        };
        let user = prompts.render_user(&vars);
        assert!(user.contains("Labels: none"));
        assert!(user.contains("Attachments: yes"));
    }

    #[test]
    fn missing_system_prompt_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = PromptSet::load(dir.path()).unwrap_err();
        assert!(matches!(err, PromptError::MissingSystem(_)));
    }

    #[test]
    fn missing_user_template_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(SYSTEM_PROMPT_FILE), "system").expect("write");
        let err = PromptSet::load(dir.path()).unwrap_err();
        assert!(matches!(err, PromptError::MissingUser(_)));
    }

    #[test]
    fn combined_render_joins_system_and_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_prompts(dir.path());
        let prompts = PromptSet::load(dir.path()).expect("load");
        let vars = TemplateVars {
            sender: "a@b.c",
            subject: "s",
            body_preview: "body here",
            has_attachments: false,
            labels: &[],
        };
        let combined = prompts.render_combined(&vars);
        assert!(combined.starts_with("Classify into"));
        assert!(combined.contains("\n\nFrom: a@b.c"));
    }
}
