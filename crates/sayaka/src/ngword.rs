//! NG-word rules.
//!
//! `~/.sayaka/ngword.json` is an array of `{type, text, user}` objects.
//! A missing or empty file is fine; entries with an unknown type are
//! skipped with a warning; a regex that fails to compile aborts the load.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use log::warn;
use regex::Regex;
use serde::Deserialize;

#[derive(Deserialize)]
struct RawRule {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
    user: Option<String>,
}

pub enum RuleKind {
    /// Substring test.
    Text,
    Regex(Regex),
}

pub struct NgRule {
    pub kind: RuleKind,
    pub text: String,
    /// Only notes from this `@user[@host]` are tested when set.
    pub user: Option<String>,
}

impl NgRule {
    fn matches(&self, text: &str, user_id: &str) -> bool {
        if let Some(user) = &self.user {
            if user != user_id {
                return false;
            }
        }
        match &self.kind {
            RuleKind::Text => text.contains(&self.text),
            RuleKind::Regex(re) => re.is_match(text),
        }
    }
}

#[derive(Default)]
pub struct NgWords {
    pub rules: Vec<NgRule>,
}

impl NgWords {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let body = match fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| path.display().to_string()),
        };
        if body.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: Vec<RawRule> = serde_json::from_str(&body)
            .with_context(|| format!("{}: invalid JSON", path.display()))?;

        let mut rules = Vec::new();
        for (i, r) in raw.into_iter().enumerate() {
            let kind = match r.kind.as_deref() {
                Some("text") => RuleKind::Text,
                Some("regex") => {
                    let text = r.text.as_deref().unwrap_or("");
                    match Regex::new(text) {
                        Ok(re) => RuleKind::Regex(re),
                        Err(e) => {
                            bail!("{}[{}]: \"{}\": {}", path.display(), i + 1, text, e);
                        }
                    }
                }
                Some(other) => {
                    warn!("{}[{}]: unknown type: {}", path.display(), i + 1, other);
                    continue;
                }
                None => {
                    warn!("{}[{}]: type not found", path.display(), i + 1);
                    continue;
                }
            };
            rules.push(NgRule {
                kind,
                text: r.text.unwrap_or_default(),
                user: r.user.filter(|u| !u.is_empty()),
            });
        }
        Ok(Self { rules })
    }

    /// First matching rule against the note's visible text, or None.
    pub fn match_text(&self, text: &str, user_id: &str) -> Option<&NgRule> {
        self.rules.iter().find(|r| r.matches(text, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(json: &str) -> anyhow::Result<NgWords> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        NgWords::load(f.path())
    }

    #[test]
    fn missing_file_is_empty() {
        let ng = NgWords::load(Path::new("/nonexistent/ngword.json")).unwrap();
        assert!(ng.rules.is_empty());
    }

    #[test]
    fn substring_and_regex_rules() {
        let ng = load_str(
            r#"[
                {"type":"text","text":"spam"},
                {"type":"regex","text":"^ad:","user":"@bot@ads.example"}
            ]"#,
        )
        .unwrap();
        assert!(ng.match_text("some spam here", "@alice").is_some());
        assert!(ng.match_text("clean", "@alice").is_none());
        // Regex rule is user-scoped.
        assert!(ng.match_text("ad: buy", "@bot@ads.example").is_some());
        assert!(ng.match_text("ad: buy", "@alice").is_none());
    }

    #[test]
    fn unknown_type_is_skipped() {
        let ng = load_str(r#"[{"type":"glob","text":"*"},{"type":"text","text":"x"}]"#).unwrap();
        assert_eq!(ng.rules.len(), 1);
    }

    #[test]
    fn bad_regex_aborts_load() {
        assert!(load_str(r#"[{"type":"regex","text":"("}]"#).is_err());
    }
}
