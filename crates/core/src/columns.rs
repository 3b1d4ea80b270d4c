//! Status table columns shared by the CLI and monitor output.
//!
//! Column ids are stable so JSON consumers and human renderers agree on
//! ordering.

#![forbid(unsafe_code)]

use crate::StatusRow;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Id,
    Name,
    Status,
    Mode,
    Replicas,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub kind: ColumnKind,
    pub label: &'static str,
    pub width: usize,
}

/// Length of the substrate id prefix shown in tables.
pub const ID_PREFIX_LEN: usize = 12;

pub fn status_columns() -> [ColumnSpec; 6] {
    [
        ColumnSpec { kind: ColumnKind::Id, label: "ID", width: ID_PREFIX_LEN + 1 },
        ColumnSpec { kind: ColumnKind::Name, label: "NAME", width: 24 },
        ColumnSpec { kind: ColumnKind::Status, label: "STATUS", width: 19 },
        ColumnSpec { kind: ColumnKind::Mode, label: "MODE", width: 11 },
        ColumnSpec { kind: ColumnKind::Replicas, label: "REPLICAS", width: 10 },
        ColumnSpec { kind: ColumnKind::Failed, label: "FAILED", width: 6 },
    ]
}

/// Render one cell as plain text (no padding, no color).
pub fn cell(row: &StatusRow, kind: ColumnKind) -> String {
    match kind {
        ColumnKind::Id => if row.id.is_empty() { "-".to_string() } else { row.id.clone() },
        ColumnKind::Name => {
            if row.user { format!("{} (user)", row.name) } else { row.name.clone() }
        }
        ColumnKind::Status => {
            if row.forced { format!("{} (forced)", row.status) } else { row.status.to_string() }
        }
        ColumnKind::Mode => row.mode.as_str().to_string(),
        ColumnKind::Replicas => row.replicas(),
        ColumnKind::Failed => row.failed.to_string(),
    }
}

/// Truncate a substrate id to the display prefix.
pub fn id_prefix(id: &str) -> String { id.chars().take(ID_PREFIX_LEN).collect() }
