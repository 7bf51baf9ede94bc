//! Prompt rendering for messenger calls.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::commitment::{Commitment, CommitmentList};

const ASSIGNMENT_TEMPLATE: &str = include_str!("prompts/assignment.md");
const FEEDBACK_TEMPLATE: &str = include_str!("prompts/feedback.md");
const CONTINUE_TEMPLATE: &str = include_str!("prompts/continue.md");
const MESSAGE_TEMPLATE: &str = include_str!("prompts/message.md");

#[derive(Debug, Clone, Serialize)]
struct CommitmentContext {
    description: String,
    check: String,
    detail: Option<String>,
}

impl CommitmentContext {
    fn from_commitment(commitment: &Commitment) -> Self {
        Self {
            description: commitment.description().to_string(),
            check: commitment.check().to_string(),
            detail: commitment
                .detail()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}

/// Inputs for the first prompt an assigned agent receives.
#[derive(Debug, Clone, Copy)]
pub struct AssignmentPrompt<'a> {
    pub name: &'a str,
    pub assignment: &'a str,
    pub commitments: &'a CommitmentList,
    pub workdir: &'a Path,
    pub commitment_prefix: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("assignment", ASSIGNMENT_TEMPLATE)
            .expect("assignment template should be valid");
        env.add_template("feedback", FEEDBACK_TEMPLATE)
            .expect("feedback template should be valid");
        env.add_template("continue", CONTINUE_TEMPLATE)
            .expect("continue template should be valid");
        env.add_template("message", MESSAGE_TEMPLATE)
            .expect("message template should be valid");
        Self { env }
    }

    pub fn render_assignment(&self, input: &AssignmentPrompt<'_>) -> Result<String> {
        let commitments: Vec<_> = input
            .commitments
            .iter()
            .map(CommitmentContext::from_commitment)
            .collect();
        let template = self.env.get_template("assignment")?;
        let rendered = template.render(context! {
            name => input.name,
            assignment => input.assignment.trim(),
            commitments => commitments,
            workdir => input.workdir.display().to_string(),
            commitment_prefix => (!input.commitment_prefix.is_empty()).then_some(input.commitment_prefix),
        })?;
        Ok(rendered)
    }

    /// Re-prompt listing every failed commitment with its check output.
    pub fn render_feedback(&self, commitments: &CommitmentList) -> Result<String> {
        let failed: Vec<_> = commitments
            .failed()
            .map(CommitmentContext::from_commitment)
            .collect();
        let template = self.env.get_template("feedback")?;
        Ok(template.render(context! { failed => failed })?)
    }

    pub fn render_continue(&self) -> Result<String> {
        let template = self.env.get_template("continue")?;
        Ok(template.render(context! {})?)
    }

    pub fn render_message(&self, sender: &str, text: &str) -> Result<String> {
        let template = self.env.get_template("message")?;
        Ok(template.render(context! { sender => sender, text => text.trim() })?)
    }
}
