use std::io::IsTerminal;

use amp_core::columns::{cell, status_columns};
use amp_core::{ClusterSnapshot, Severity, StatusRow};
use crossterm::style::{Color, Stylize};

fn color_for(sev: Severity) -> Option<Color> {
    match sev {
        Severity::Regular => None,
        Severity::Info => Some(Color::Cyan),
        Severity::Warn => Some(Color::Yellow),
        Severity::Error => Some(Color::Red),
        Severity::Success => Some(Color::Green),
    }
}

pub fn use_color() -> bool { std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none() }

pub fn header() -> String {
    status_columns().iter().map(|c| format!("{:<w$}", c.label, w = c.width)).collect::<Vec<_>>().join(" ")
}

pub fn row_line(row: &StatusRow, color: bool) -> String {
    let line = status_columns()
        .iter()
        .map(|c| format!("{:<w$}", cell(row, c.kind), w = c.width))
        .collect::<Vec<_>>()
        .join(" ");
    match (color, color_for(row.severity)) {
        (true, Some(c)) => line.with(c).to_string(),
        _ => line,
    }
}

pub fn print_snapshot(snap: &ClusterSnapshot, color: bool) {
    println!("{}", header().trim_end());
    for row in &snap.rows {
        println!("{}", row_line(row, color).trim_end());
    }
    let summary = format!("cluster status: {}", snap.aggregate);
    let sev = if snap.aggregate == amp_core::AggregateStatus::Running { Severity::Success } else { Severity::Warn };
    match (color, color_for(sev)) {
        (true, Some(c)) => println!("{}", summary.with(c).bold()),
        _ => println!("{}", summary),
    }
}
