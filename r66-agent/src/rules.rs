//! Rule file loading.
//!
//! The file is a JSON array of rules:
//!
//! ```json
//! [{ "name": "default",
//!    "send_post": [{ "kind": "MOVE", "arg": "#ARCHPATH#" }] }]
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};

// ---

use r66_domain::{Rule, Stage};
use r66_engine::TaskRegistry;

// ---------------------------------------------------------------------------
// load_rules
// ---------------------------------------------------------------------------

/// Read and check the rule file. Without one, a single empty `default`
/// rule is returned.
pub fn load_rules(path: Option<&Path>, tasks: &TaskRegistry) -> anyhow::Result<Vec<Rule>> {
    // ---
    let Some(path) = path else {
        return Ok(vec![Rule::named("default")]);
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading rules from {}", path.display()))?;
    let rules: Vec<Rule> = serde_json::from_str(&text)
        .with_context(|| format!("parsing rules from {}", path.display()))?;
    validate(&rules, tasks)?;
    Ok(rules)
}

// ---

/// Names are unique and non-empty; every task builds.
fn validate(rules: &[Rule], tasks: &TaskRegistry) -> anyhow::Result<()> {
    // ---
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.name.trim().is_empty() {
            bail!("rule with an empty name");
        }
        if !seen.insert(rule.name.as_str()) {
            bail!("rule {} defined twice", rule.name);
        }
        for is_sender in [false, true] {
            for stage in [Stage::Pre, Stage::Post, Stage::Error] {
                for spec in rule.tasks(is_sender, stage) {
                    tasks
                        .build(spec)
                        .with_context(|| format!("rule {}: task {}", rule.name, spec.kind))?;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use r66_domain::TaskKind;

    fn write(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("rules.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_tasks_by_upper_case_kind() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            r##"[{"name":"archive","send_post":[{"kind":"MOVE","arg":"#ARCHPATH#"}]}]"##,
        );
        let rules = load_rules(Some(&path), &TaskRegistry::with_defaults()).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].send_post[0].kind, TaskKind::Move);
        assert!(rules[0].recv_pre.is_empty(), "missing lists default to empty");
    }

    #[test]
    fn unknown_kind_fails_at_load() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"[{"name":"x","send_pre":[{"kind":"TELEPORT"}]}]"#);
        assert!(load_rules(Some(&path), &TaskRegistry::with_defaults()).is_err());
    }

    #[test]
    fn kind_without_factory_fails_at_load() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"[{"name":"x","recv_post":[{"kind":"EXEC"}]}]"#);
        let err = load_rules(Some(&path), &TaskRegistry::empty()).unwrap_err();
        assert!(format!("{err:#}").contains("EXEC"), "error names the task: {err:#}");
    }

    #[test]
    fn duplicate_names_rejected() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"[{"name":"a"},{"name":"a"}]"#);
        assert!(load_rules(Some(&path), &TaskRegistry::with_defaults()).is_err());
    }

    #[test]
    fn no_file_means_default_rule() {
        let rules = load_rules(None, &TaskRegistry::with_defaults()).unwrap();
        assert_eq!(rules, vec![Rule::named("default")]);
    }
}
