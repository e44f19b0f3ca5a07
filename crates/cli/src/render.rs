//! Human-readable rendering of run reports and branch status.

use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use branchsync_core::models::{BranchStatus, SyncReport};

use crate::style;

/// Print a summary of a finished run.
pub fn print_report(report: &SyncReport) {
    println!();
    println!("{}", style::header("Synchronization complete"));
    println!();

    let sections: [(&str, &[String]); 5] = [
        ("Mirrors refreshed", report.refreshed.as_slice()),
        ("Tags moved", report.tags_moved.as_slice()),
        ("Forward branches rebased", report.forwarded.as_slice()),
        ("Integration branches rebuilt", report.rebuilt.as_slice()),
        ("Top-level branches changed", report.changed.as_slice()),
    ];
    for (label, names) in sections {
        if names.is_empty() {
            continue;
        }
        println!("  {label}");
        for name in names {
            println!("    {}", style::branch(name));
        }
    }

    if report.is_noop() {
        println!("{}", style::success("Everything was already up to date."));
    } else if report.rebuild_skipped {
        println!(
            "  {}",
            style::dim("Top-level branches unchanged; integration rebuild skipped.")
        );
    }

    for warning in &report.warnings {
        println!("{}", style::warn(&warning.to_string()));
    }

    if report.restored {
        println!(
            "  {}",
            style::dim(&format!("Back on {}", report.restore_point))
        );
    }
    println!();
}

/// Table of every maintained branch and whether it is current.
pub fn status_table(rows: &[BranchStatus]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Branch", "Role", "Compared with", "State", "Note"]);

    for row in rows {
        let state = if row.up_to_date {
            Cell::new("✓ up to date").fg(Color::Green)
        } else {
            Cell::new("⧗ stale").fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(&row.name),
            Cell::new(row.role),
            Cell::new(&row.reference),
            state,
            Cell::new(row.note.as_deref().unwrap_or("")),
        ]);
    }
    table
}
