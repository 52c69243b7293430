//! Rules: named task lists per direction and stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---

use super::error::TaskError;
use super::record::GlobalStep;

// ---------------------------------------------------------------------------
// TaskKind
// ---------------------------------------------------------------------------

/// Every task a rule may name. Adding a kind means adding a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    // ---
    Log,
    Move,
    MoveRename,
    Copy,
    CopyRename,
    Exec,
    ExecRename,
    Delete,
    ValidFilePath,
    Test,
}

impl TaskKind {
    // ---
    pub const ALL: [TaskKind; 10] = [
        TaskKind::Log,
        TaskKind::Move,
        TaskKind::MoveRename,
        TaskKind::Copy,
        TaskKind::CopyRename,
        TaskKind::Exec,
        TaskKind::ExecRename,
        TaskKind::Delete,
        TaskKind::ValidFilePath,
        TaskKind::Test,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Log => "LOG",
            Self::Move => "MOVE",
            Self::MoveRename => "MOVERENAME",
            Self::Copy => "COPY",
            Self::CopyRename => "COPYRENAME",
            Self::Exec => "EXEC",
            Self::ExecRename => "EXECRENAME",
            Self::Delete => "DELETE",
            Self::ValidFilePath => "VALIDFILEPATH",
            Self::Test => "TEST",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        let wanted = s.trim().to_ascii_uppercase();
        // EXECMOVE is the older name for EXECRENAME.
        if wanted == "EXECMOVE" {
            return Ok(Self::ExecRename);
        }
        Self::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| TaskError::UnknownKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// TaskSpec
// ---------------------------------------------------------------------------

/// One entry of a rule's task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    // ---
    pub kind: TaskKind,
    /// Argument template; placeholders are substituted at run time.
    #[serde(default)]
    pub arg: String,
    /// Milliseconds. For `Exec*` a kill timeout, for `Log` the output mode.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl TaskSpec {
    // ---
    pub fn new(kind: TaskKind, arg: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            kind,
            arg: arg.into(),
            timeout_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Stages that carry a task list. The data stage has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pre,
    Post,
    Error,
}

impl Stage {
    // ---
    pub fn of(step: GlobalStep) -> Option<Self> {
        match step {
            GlobalStep::PreTask => Some(Self::Pre),
            GlobalStep::PostTask => Some(Self::Post),
            GlobalStep::ErrorTask => Some(Self::Error),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// Named set of task lists. Immutable once handed to a transfer; a changed
/// rule is a new `Arc<Rule>` that only later transfers see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    // ---
    pub name: String,

    pub recv_pre: Vec<TaskSpec>,
    pub recv_post: Vec<TaskSpec>,
    pub recv_error: Vec<TaskSpec>,
    pub send_pre: Vec<TaskSpec>,
    pub send_post: Vec<TaskSpec>,
    pub send_error: Vec<TaskSpec>,

    /// Per-rule overrides of the host directories.
    pub recv_path: Option<String>,
    pub send_path: Option<String>,
    pub work_path: Option<String>,
    pub arch_path: Option<String>,
}

impl Rule {
    // ---
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    // ---

    pub fn tasks(&self, is_sender: bool, stage: Stage) -> &[TaskSpec] {
        // ---
        match (is_sender, stage) {
            (false, Stage::Pre) => &self.recv_pre,
            (false, Stage::Post) => &self.recv_post,
            (false, Stage::Error) => &self.recv_error,
            (true, Stage::Pre) => &self.send_pre,
            (true, Stage::Post) => &self.send_post,
            (true, Stage::Error) => &self.send_error,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn task_kind_parses_legacy_and_mixed_case_names() {
        // ---
        assert_eq!("moveRename".parse::<TaskKind>().unwrap(), TaskKind::MoveRename);
        assert_eq!("EXECMOVE".parse::<TaskKind>().unwrap(), TaskKind::ExecRename);
        assert!(matches!(
            "FTP".parse::<TaskKind>(),
            Err(TaskError::UnknownKind(name)) if name == "FTP"
        ));
    }

    #[test]
    fn rule_loads_from_json_and_selects_by_direction() {
        // ---
        let json = r#"{
            "name": "backup",
            "recv_post": [{"kind": "MOVE", "arg": "/archive"}],
            "send_pre":  [{"kind": "EXEC", "arg": "/bin/true", "timeout_ms": 500}]
        }"#;
        let rule: Rule = serde_json::from_str(json).unwrap();

        assert_eq!(rule.tasks(false, Stage::Post)[0].kind, TaskKind::Move);
        assert_eq!(rule.tasks(true, Stage::Pre)[0].timeout_ms, 500);
        assert!(rule.tasks(true, Stage::Error).is_empty());
    }
}
