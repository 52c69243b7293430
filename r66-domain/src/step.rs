//! Legal [`GlobalStep`] transitions as a data table.
//!
//! ```text
//! NoTask ─► PreTask ─► TransferTask ─► PostTask ─► AllDone
//!    │         │            │             │          ▲
//!    └─────────┴────────────┴─────────────┴─► ErrorTask
//! ```
//!
//! Every stage may re-enter itself (step or rank resume), and every step may
//! go back to `NoTask` when a transfer is restarted from scratch. Resuming
//! at the last reached stage is the runner's reset path and is not a table
//! move.

use std::collections::HashMap;
use std::sync::OnceLock;

// ---

use super::record::GlobalStep;

fn table() -> &'static HashMap<GlobalStep, &'static [GlobalStep]> {
    // ---
    static TABLE: OnceLock<HashMap<GlobalStep, &'static [GlobalStep]>> = OnceLock::new();

    TABLE.get_or_init(|| {
        use GlobalStep::*;
        HashMap::from([
            (NoTask, &[NoTask, PreTask, ErrorTask][..]),
            (PreTask, &[PreTask, TransferTask, ErrorTask, NoTask][..]),
            (TransferTask, &[TransferTask, PostTask, ErrorTask, NoTask][..]),
            (PostTask, &[PostTask, AllDone, ErrorTask, NoTask][..]),
            (ErrorTask, &[ErrorTask, AllDone, NoTask][..]),
            (AllDone, &[AllDone, NoTask][..]),
        ])
    })
}

// ---

/// Steps reachable from `from`, restart to `NoTask` included.
pub fn step_successors(from: GlobalStep) -> &'static [GlobalStep] {
    table().get(&from).copied().unwrap_or(&[])
}

// ---

pub fn is_legal_step(from: GlobalStep, to: GlobalStep) -> bool {
    step_successors(from).contains(&to)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
