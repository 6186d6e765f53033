use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::directive::ExecutionPath;
use crate::instructions::OperatingInstructions;

pub struct PromptContext<'a> {
    pub instructions: &'a OperatingInstructions,
    pub path: ExecutionPath,
    /// Constrained domains the verifier checks deep answers against.
    pub domains: &'a [&'a str],
    pub now: DateTime<Utc>,
}

pub trait PromptSection: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, ctx: &PromptContext<'_>) -> Result<String>;
}

#[derive(Default)]
pub struct SystemPromptBuilder {
    sections: Vec<Box<dyn PromptSection>>,
}

impl SystemPromptBuilder {
    pub fn with_defaults() -> Self {
        Self {
            sections: vec![
                Box::new(InstructionsSection),
                Box::new(PathSection),
                Box::new(GroundingSection),
                Box::new(DateTimeSection),
            ],
        }
    }

    pub fn add_section(mut self, section: Box<dyn PromptSection>) -> Self {
        self.sections.push(section);
        self
    }

    pub fn build(&self, ctx: &PromptContext<'_>) -> Result<String> {
        let mut output = String::new();
        for section in &self.sections {
            let part = section
                .build(ctx)
                .with_context(|| format!("Prompt section '{}' failed", section.name()))?;
            if part.trim().is_empty() {
                continue;
            }
            output.push_str(part.trim_end());
            output.push_str("\n\n");
        }
        Ok(output.trim_end().to_string())
    }
}

pub struct InstructionsSection;
pub struct PathSection;
pub struct GroundingSection;
pub struct DateTimeSection;

impl PromptSection for InstructionsSection {
    fn name(&self) -> &str {
        "instructions"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> Result<String> {
        let body = ctx.instructions.body().trim();
        if body.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(
            "## Operating Instructions (v{})\n\n{body}",
            ctx.instructions.version
        ))
    }
}

impl PromptSection for PathSection {
    fn name(&self) -> &str {
        "path"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> Result<String> {
        Ok(match ctx.path {
            ExecutionPath::Fast => "## Response Mode\n\n\
                Answer directly in a few sentences. Do not speculate about figures you were not given."
                .into(),
            ExecutionPath::Deep => "## Response Mode\n\n\
                Think through the request step by step, weigh options and trade-offs, \
                then give a structured answer with a clear recommendation."
                .into(),
        })
    }
}

impl PromptSection for GroundingSection {
    fn name(&self) -> &str {
        "grounding"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> Result<String> {
        if ctx.path == ExecutionPath::Fast || ctx.domains.is_empty() {
            return Ok(String::new());
        }
        let mut prompt = String::from(
            "## Grounding\n\n\
             Statements in these domains are checked against the reference documents \
             and must match them exactly:\n",
        );
        for domain in ctx.domains {
            let _ = writeln!(prompt, "- {domain}");
        }
        prompt.push_str("\nIf a needed figure is not in the documents, say it is unavailable.");
        Ok(prompt)
    }
}

impl PromptSection for DateTimeSection {
    fn name(&self) -> &str {
        "datetime"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> Result<String> {
        Ok(format!(
            "## Current Date & Time\n\n{}",
            ctx.now.format("%Y-%m-%d %H:%M UTC")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instructions(content: &str) -> OperatingInstructions {
        OperatingInstructions {
            version: 3,
            content: content.into(),
            rationale: "test".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn deep_prompt_lists_grounding_domains() {
        let doc = instructions("+++\nconfidence_threshold = 0.7\n+++\n\nBe precise.");
        let domains = ["pricing", "legal"];
        let ctx = PromptContext {
            instructions: &doc,
            path: ExecutionPath::Deep,
            domains: &domains,
            now: Utc.with_ymd_and_hms(2026, 5, 1, 9, 30, 0).unwrap(),
        };
        let prompt = SystemPromptBuilder::with_defaults().build(&ctx).unwrap();

        assert!(prompt.starts_with("## Operating Instructions (v3)\n\nBe precise."));
        assert!(!prompt.contains("confidence_threshold"));
        assert!(prompt.contains("- pricing\n- legal"));
        assert!(prompt.ends_with("2026-05-01 09:30 UTC"));
    }

    #[test]
    fn fast_prompt_skips_grounding() {
        let doc = instructions("Be brief.");
        let ctx = PromptContext {
            instructions: &doc,
            path: ExecutionPath::Fast,
            domains: &["pricing"],
            now: Utc::now(),
        };
        let prompt = SystemPromptBuilder::with_defaults().build(&ctx).unwrap();
        assert!(prompt.contains("Answer directly"));
        assert!(!prompt.contains("## Grounding"));
    }

    #[test]
    fn custom_sections_are_appended() {
        struct Footer;
        impl PromptSection for Footer {
            fn name(&self) -> &str {
                "footer"
            }
            fn build(&self, _ctx: &PromptContext<'_>) -> Result<String> {
                Ok("## Footer".into())
            }
        }

        let doc = instructions("");
        let ctx = PromptContext {
            instructions: &doc,
            path: ExecutionPath::Fast,
            domains: &[],
            now: Utc::now(),
        };
        let prompt = SystemPromptBuilder::default()
            .add_section(Box::new(Footer))
            .build(&ctx)
            .unwrap();
        assert_eq!(prompt, "## Footer");
    }

    #[test]
    fn failing_section_is_named_in_error() {
        struct Broken;
        impl PromptSection for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn build(&self, _ctx: &PromptContext<'_>) -> Result<String> {
                anyhow::bail!("no data")
            }
        }

        let doc = instructions("Be brief.");
        let ctx = PromptContext {
            instructions: &doc,
            path: ExecutionPath::Fast,
            domains: &[],
            now: Utc::now(),
        };
        let err = SystemPromptBuilder::with_defaults()
            .add_section(Box::new(Broken))
            .build(&ctx)
            .unwrap_err();
        assert!(format!("{err:#}").contains("Prompt section 'broken' failed"));
    }
}
