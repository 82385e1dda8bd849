// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use serde::Deserialize;

/// Longest accepted `description` field, in characters.
pub(crate) const MAX_DESCRIPTION_CHARS: usize = 1024;

/// How a skill is matched against incoming user messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkillFormat {
    /// Case-insensitive substring match of any trigger.
    Keyword,
    /// Triggers are regular expressions matched against the message.
    Task,
    /// Injected into every session regardless of the message.
    AlwaysOn,
    /// Only the metadata block is injected; the model pulls the full body
    /// on demand.  Matching uses a relevance score over the description.
    Progressive,
}

#[derive(Debug, Deserialize)]
struct RawFrontmatter {
    #[serde(default)]
    name: Option<String>,
    description: String,
    #[serde(default)]
    triggers: Vec<String>,
    #[serde(default)]
    format: Option<SkillFormat>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    metadata: Option<serde_yaml::Value>,
    #[serde(default, rename = "allowed-tools")]
    allowed_tools: Vec<String>,
}

/// Parsed frontmatter fields plus the SKILL.md body.
pub struct ParsedSkill {
    /// Display name; falls back to the directory name when absent.
    pub name: Option<String>,
    pub description: String,
    pub triggers: Vec<String>,
    pub format: SkillFormat,
    pub license: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub allowed_tools: Vec<String>,
    /// Everything after the closing `---` fence.
    pub body: String,
}

/// Parse a raw SKILL.md string into frontmatter fields and body.
///
/// Returns `None` when the frontmatter is missing or malformed, or the
/// `description` is empty or longer than [`MAX_DESCRIPTION_CHARS`].
///
/// When no explicit `format:` is given, the triggers decide: no triggers →
/// progressive, any trigger containing regex metacharacters → task,
/// otherwise keyword.
#[must_use]
pub fn parse_skill_file(raw: &str) -> Option<ParsedSkill> {
    let rest = raw.trim_start_matches('\n');
    let after_open = rest.strip_prefix("---")?;
    let close = after_open.find("\n---")?;
    let yaml_block = &after_open[..close];
    let body = after_open[close + 4..].trim_start_matches('\n').to_string();

    let fm: RawFrontmatter = serde_yaml::from_str(yaml_block).ok()?;

    let description = fm.description.trim().to_string();
    if description.is_empty() || description.len() > MAX_DESCRIPTION_CHARS {
        return None;
    }

    let format = fm.format.unwrap_or_else(|| infer_format(&fm.triggers));

    let metadata = fm
        .metadata
        .and_then(|v| serde_json::to_value(v).ok())
        .filter(|v| !v.is_null());

    Some(ParsedSkill {
        name: fm.name.filter(|n| !n.trim().is_empty()),
        description,
        triggers: fm.triggers,
        format,
        license: fm.license,
        metadata,
        allowed_tools: fm.allowed_tools,
        body,
    })
}

fn infer_format(triggers: &[String]) -> SkillFormat {
    if triggers.is_empty() {
        return SkillFormat::Progressive;
    }
    let looks_like_pattern = triggers
        .iter()
        .any(|t| t.chars().any(|c| matches!(c, '\\' | '^' | '$' | '*' | '+' | '?' | '[' | '(' | '|')));
    if looks_like_pattern {
        SkillFormat::Task
    } else {
        SkillFormat::Keyword
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
