// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::manifest::{parse_skill_file, SkillFormat};

/// SKILL.md files above this size are skipped during discovery.
const MAX_SKILL_FILE_BYTES: u64 = 256 * 1024;

/// Score at or above which a progressive skill counts as matching.
const PROGRESSIVE_MATCH_THRESHOLD: f32 = 0.25;

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("unknown skill: {0}")]
    Unknown(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid trigger pattern '{pattern}' in skill {skill}: {source}")]
    BadPattern {
        skill: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// In-memory metadata for one discovered skill.  The instruction body stays
/// on disk until [`SkillRegistry::activate`] is called.
#[derive(Debug, Clone)]
pub struct SkillMeta {
    pub name: String,
    pub description: String,
    pub triggers: Vec<String>,
    pub format: SkillFormat,
    /// Absolute path of the `SKILL.md` file.
    pub source_path: PathBuf,
    /// Parent directory (holds optional `scripts/`, `references/`, `assets/`).
    pub skill_dir: PathBuf,
    pub allowed_tools: Vec<String>,
}

/// Scores how relevant a skill description is to a user message.
///
/// The embedding-backed scorer lives outside this crate; the default is a
/// lexical overlap that needs no model: the fraction of description words
/// present in the message.  Appending text to a message can only add words,
/// so scores are monotone in message extension.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, message: &str, description: &str) -> f32;
}

#[derive(Default)]
pub struct LexicalScorer;

impl RelevanceScorer for LexicalScorer {
    fn score(&self, message: &str, description: &str) -> f32 {
        let message = message.to_lowercase();
        let message_words: std::collections::HashSet<&str> =
            message.split(|c: char| !c.is_alphanumeric()).filter(|w| w.len() > 2).collect();
        let description = description.to_lowercase();
        let desc_words: Vec<&str> = description
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .collect();
        if desc_words.is_empty() {
            return 0.0;
        }
        let hits = desc_words.iter().filter(|w| message_words.contains(*w)).count();
        hits as f32 / desc_words.len() as f32
    }
}

pub struct SkillRegistry {
    /// Sorted by name for deterministic listings.
    skills: Vec<SkillMeta>,
    scorer: Box<dyn RelevanceScorer>,
}

impl SkillRegistry {
    pub fn empty() -> Self {
        Self { skills: Vec::new(), scorer: Box::new(LexicalScorer) }
    }

    /// Walk the global directories, then the project directories.  Within
    /// the combined walk, a later directory declaring an already-seen skill
    /// name shadows the earlier one — project scope overrides global scope.
    pub fn discover(global_dirs: &[PathBuf], project_dirs: &[PathBuf]) -> Self {
        let mut by_name: HashMap<String, SkillMeta> = HashMap::new();
        for dir in global_dirs.iter().chain(project_dirs.iter()) {
            for skill in scan_skills_dir(dir) {
                by_name.insert(skill.name.clone(), skill);
            }
        }
        let mut skills: Vec<SkillMeta> = by_name.into_values().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Self { skills, scorer: Box::new(LexicalScorer) }
    }

    /// Swap in a different relevance scorer (e.g. embedding-backed).
    pub fn with_scorer(mut self, scorer: Box<dyn RelevanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Names and descriptions only — cheap enough for system-prompt
    /// injection or a `discover_skills` tool result.
    pub fn list_metadata(&self) -> &[SkillMeta] {
        &self.skills
    }

    pub fn get(&self, name: &str) -> Option<&SkillMeta> {
        self.skills.iter().find(|s| s.name == name)
    }

    /// Skills injected into every session.
    pub fn always_on(&self) -> impl Iterator<Item = &SkillMeta> {
        self.skills.iter().filter(|s| s.format == SkillFormat::AlwaysOn)
    }

    /// Lazily read the full instruction body from disk.
    pub fn activate(&self, name: &str) -> Result<String, SkillError> {
        let skill = self.get(name).ok_or_else(|| SkillError::Unknown(name.to_string()))?;
        let raw = std::fs::read_to_string(&skill.source_path).map_err(|source| SkillError::Io {
            path: skill.source_path.clone(),
            source,
        })?;
        match parse_skill_file(&raw) {
            Some(parsed) => Ok(parsed.body),
            // The file changed on disk since discovery; fall back to raw.
            None => Ok(raw),
        }
    }

    /// Names of the skills that match `message`, in order: keyword and task
    /// matches in listing order, then progressive matches by descending
    /// relevance score.
    pub fn matches(&self, message: &str) -> Vec<String> {
        let lowered = message.to_lowercase();
        let mut names: Vec<String> = Vec::new();
        let mut progressive: Vec<(f32, &str)> = Vec::new();

        for skill in &self.skills {
            match skill.format {
                SkillFormat::AlwaysOn => {}
                SkillFormat::Keyword => {
                    if skill.triggers.iter().any(|t| lowered.contains(&t.to_lowercase())) {
                        names.push(skill.name.clone());
                    }
                }
                SkillFormat::Task => {
                    let hit = skill.triggers.iter().any(|t| match regex::Regex::new(t) {
                        Ok(re) => re.is_match(message),
                        Err(e) => {
                            warn!(skill = %skill.name, pattern = %t, error = %e, "invalid task trigger pattern");
                            false
                        }
                    });
                    if hit {
                        names.push(skill.name.clone());
                    }
                }
                SkillFormat::Progressive => {
                    let score = self.scorer.score(message, &skill.description);
                    if score >= PROGRESSIVE_MATCH_THRESHOLD {
                        progressive.push((score, &skill.name));
                    }
                }
            }
        }

        progressive.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        names.extend(progressive.into_iter().map(|(_, n)| n.to_string()));
        names
    }

    /// Render an `<available_skills>` block for the named skills.  Each
    /// entry is capped to roughly 100 tokens so the block stays cheap.
    pub fn as_prompt_block(&self, names: &[String]) -> String {
        const PER_SKILL_CHAR_CAP: usize = 400;
        let mut out = String::from("<available_skills>\n");
        for name in names {
            let Some(skill) = self.get(name) else { continue };
            let mut entry = format!(
                "- {}: {} (location: {})",
                skill.name,
                skill.description,
                skill.skill_dir.display()
            );
            if entry.len() > PER_SKILL_CHAR_CAP {
                entry.truncate(PER_SKILL_CHAR_CAP);
                entry.push('…');
            }
            out.push_str(&entry);
            out.push('\n');
        }
        out.push_str("</available_skills>");
        out
    }
}

/// Scan one skills root: every immediate subdirectory containing a SKILL.md
/// is a skill.  Resource subdirectories (`scripts/`, `references/`,
/// `assets/`) have no SKILL.md and are skipped naturally.
fn scan_skills_dir(dir: &Path) -> Vec<SkillMeta> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let skill_dir = entry.path();
        if !skill_dir.is_dir() {
            continue;
        }
        let skill_md = skill_dir.join("SKILL.md");
        if !skill_md.is_file() {
            continue;
        }
        if let Some(skill) = try_load_skill(&skill_dir, &skill_md) {
            out.push(skill);
        }
    }
    out
}

fn try_load_skill(skill_dir: &Path, skill_md: &Path) -> Option<SkillMeta> {
    let size = skill_md.metadata().map(|m| m.len()).unwrap_or(0);
    if size > MAX_SKILL_FILE_BYTES {
        warn!(path = %skill_md.display(), size, max = MAX_SKILL_FILE_BYTES, "skipping oversized SKILL.md");
        return None;
    }

    let raw = match std::fs::read_to_string(skill_md) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %skill_md.display(), error = %e, "failed to read SKILL.md");
            return None;
        }
    };

    let parsed = match parse_skill_file(&raw) {
        Some(p) => p,
        None => {
            warn!(path = %skill_md.display(), "invalid SKILL.md frontmatter — skipping");
            return None;
        }
    };

    let name = parsed.name.unwrap_or_else(|| {
        skill_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".into())
    });

    Some(SkillMeta {
        name,
        description: parsed.description,
        triggers: parsed.triggers,
        format: parsed.format,
        source_path: skill_md.to_path_buf(),
        skill_dir: skill_dir.to_path_buf(),
        allowed_tools: parsed.allowed_tools,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_skill(root: &Path, dir_name: &str, frontmatter: &str, body: &str) {
        let skill_dir = root.join(dir_name);
        fs::create_dir_all(&skill_dir).unwrap();
        fs::write(skill_dir.join("SKILL.md"), format!("---\n{frontmatter}---\n\n{body}")).unwrap();
    }

    fn registry_with(skills: &[(&str, &str)]) -> (TempDir, SkillRegistry) {
        let tmp = TempDir::new().unwrap();
        for (name, frontmatter) in skills {
            write_skill(tmp.path(), name, frontmatter, "Body text.");
        }
        let registry = SkillRegistry::discover(&[tmp.path().to_path_buf()], &[]);
        (tmp, registry)
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    #[test]
    fn discover_empty_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let r = SkillRegistry::discover(&[tmp.path().to_path_buf()], &[]);
        assert!(r.list_metadata().is_empty());
    }

    #[test]
    fn discover_finds_skills_sorted_by_name() {
        let (_tmp, r) = registry_with(&[
            ("zebra", "description: Z.\n"),
            ("apple", "description: A.\n"),
        ]);
        let names: Vec<&str> = r.list_metadata().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["apple", "zebra"]);
    }

    #[test]
    fn name_falls_back_to_directory() {
        let (_tmp, r) = registry_with(&[("dir-name", "description: D.\n")]);
        assert_eq!(r.list_metadata()[0].name, "dir-name");
    }

    #[test]
    fn explicit_name_overrides_directory() {
        let (_tmp, r) = registry_with(&[("dir-name", "name: pretty\ndescription: D.\n")]);
        assert_eq!(r.list_metadata()[0].name, "pretty");
    }

    #[test]
    fn project_scope_shadows_global_scope() {
        let global = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        write_skill(global.path(), "deploy", "description: Global version.\n", "");
        write_skill(project.path(), "deploy", "description: Project version.\n", "");

        let r = SkillRegistry::discover(
            &[global.path().to_path_buf()],
            &[project.path().to_path_buf()],
        );
        assert_eq!(r.list_metadata().len(), 1);
        assert_eq!(r.list_metadata()[0].description, "Project version.");
    }

    #[test]
    fn dirs_without_skill_md_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let not_a_skill = tmp.path().join("scripts");
        fs::create_dir_all(&not_a_skill).unwrap();
        fs::write(not_a_skill.join("run.sh"), "#!/bin/sh").unwrap();
        let r = SkillRegistry::discover(&[tmp.path().to_path_buf()], &[]);
        assert!(r.list_metadata().is_empty());
    }

    #[test]
    fn oversized_skill_md_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let skill_dir = tmp.path().join("big");
        fs::create_dir_all(&skill_dir).unwrap();
        let big = format!("---\ndescription: Big.\n---\n\n{}", "x".repeat(300 * 1024));
        fs::write(skill_dir.join("SKILL.md"), big).unwrap();
        let r = SkillRegistry::discover(&[tmp.path().to_path_buf()], &[]);
        assert!(r.list_metadata().is_empty());
    }

    // ── Activation ────────────────────────────────────────────────────────────

    #[test]
    fn activate_returns_body_without_frontmatter() {
        let (_tmp, r) = registry_with(&[("db-schema", "description: Tables.\n")]);
        let body = r.activate("db-schema").unwrap();
        assert_eq!(body, "Body text.");
        assert!(!body.contains("description:"));
    }

    #[test]
    fn activate_unknown_skill_errors() {
        let (_tmp, r) = registry_with(&[]);
        assert!(matches!(r.activate("ghost"), Err(SkillError::Unknown(_))));
    }

    // ── Matching ──────────────────────────────────────────────────────────────

    #[test]
    fn keyword_trigger_matches_substring_case_insensitive() {
        let (_tmp, r) = registry_with(&[(
            "db-schema",
            "description: Schema reference.\ntriggers: [database]\n",
        )]);
        assert_eq!(r.matches("show the DATABASE tables"), vec!["db-schema"]);
        assert!(r.matches("show me the files").is_empty());
    }

    #[test]
    fn task_trigger_matches_regex() {
        let (_tmp, r) = registry_with(&[(
            "deployer",
            "description: Deploy helper.\ntriggers: [\"deploy (to|on) \\\\w+\"]\nformat: task\n",
        )]);
        assert_eq!(r.matches("please deploy to staging"), vec!["deployer"]);
        assert!(r.matches("please deploy").is_empty());
    }

    #[test]
    fn progressive_matches_by_description_overlap() {
        let (_tmp, r) = registry_with(&[(
            "kube",
            "description: kubernetes cluster debugging\nformat: progressive\n",
        )]);
        assert_eq!(
            r.matches("my kubernetes cluster pods keep debugging restarting"),
            vec!["kube"]
        );
        assert!(r.matches("write a poem").is_empty());
    }

    #[test]
    fn always_on_skills_never_match_but_are_listed() {
        let (_tmp, r) = registry_with(&[(
            "house-style",
            "description: Project conventions.\nformat: always-on\n",
        )]);
        assert!(r.matches("anything at all with conventions project").is_empty());
        assert_eq!(r.always_on().count(), 1);
    }

    #[test]
    fn match_is_monotone_under_message_extension() {
        let (_tmp, r) = registry_with(&[
            ("kw", "description: K.\ntriggers: [database]\n"),
            ("task", "description: T.\ntriggers: [\"run .* tests\"]\nformat: task\n"),
            ("prog", "description: kubernetes cluster pods\nformat: progressive\n"),
        ]);
        let base = "fix the database, run the unit tests, kubernetes cluster pods failing";
        let matched = r.matches(base);
        for suffix in [" please", " and also update the docs tomorrow", " !!"] {
            let extended = format!("{base}{suffix}");
            let matched_ext = r.matches(&extended);
            for name in &matched {
                assert!(
                    matched_ext.contains(name),
                    "skill {name} stopped matching after appending {suffix:?}"
                );
            }
        }
    }

    // ── Prompt block ──────────────────────────────────────────────────────────

    #[test]
    fn prompt_block_lists_name_description_location() {
        let (_tmp, r) = registry_with(&[("db-schema", "description: Tables.\ntriggers: [database]\n")]);
        let block = r.as_prompt_block(&["db-schema".into()]);
        assert!(block.starts_with("<available_skills>"));
        assert!(block.ends_with("</available_skills>"));
        assert!(block.contains("db-schema: Tables."));
        assert!(block.contains("db-schema"));
    }

    #[test]
    fn prompt_block_caps_entry_length() {
        let long_desc = format!("description: {}.\n", "word ".repeat(150));
        let (_tmp, r) = registry_with(&[("wordy", &long_desc)]);
        let block = r.as_prompt_block(&["wordy".into()]);
        let entry_line = block.lines().nth(1).unwrap();
        assert!(entry_line.len() <= 420, "entry was {} chars", entry_line.len());
    }

    #[test]
    fn prompt_block_skips_unknown_names() {
        let (_tmp, r) = registry_with(&[]);
        let block = r.as_prompt_block(&["ghost".into()]);
        assert_eq!(block, "<available_skills>\n</available_skills>");
    }

    // ── Scorer ────────────────────────────────────────────────────────────────

    #[test]
    fn lexical_scorer_is_fraction_of_description_words() {
        let s = LexicalScorer;
        assert_eq!(s.score("kubernetes pods", "kubernetes pods"), 1.0);
        assert!(s.score("kubernetes only", "kubernetes pods") > 0.4);
        assert_eq!(s.score("nothing related", "kubernetes pods"), 0.0);
    }

    #[test]
    fn lexical_scorer_never_decreases_with_suffix() {
        let s = LexicalScorer;
        let desc = "kubernetes cluster debugging";
        let base = "help with kubernetes";
        let extended = format!("{base} and some extra words");
        assert!(s.score(&extended, desc) >= s.score(base, desc));
    }
}
