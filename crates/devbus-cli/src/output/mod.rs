//! Output formatting utilities for the CLI
//!
//! Soak reports are rendered either as a table for the terminal or as JSON
//! for scripts; status lines are colored with `crossterm`.

use tabled::{
    settings::{Alignment, Modify, Style, object::Columns},
    Table, Tabled,
};

use crate::commands::{SessionReport, SoakReport};

/// Format per-session soak results as an ASCII table
pub fn format_sessions(sessions: &[SessionReport]) -> String {
    if sessions.is_empty() {
        return "No sessions".to_string();
    }

    #[derive(Tabled)]
    struct SessionRow {
        #[tabled(rename = "SESSION")]
        id: String,
        #[tabled(rename = "VERSION")]
        version: u16,
        #[tabled(rename = "MESSAGES")]
        messages: u64,
        #[tabled(rename = "BYTES")]
        bytes: u64,
        #[tabled(rename = "REASON")]
        reason: String,
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .map(|s| SessionRow {
            id: format!("{:#010x}", s.session_id),
            version: s.protocol_version,
            messages: s.messages,
            bytes: s.bytes,
            reason: s.termination_reason.clone(),
        })
        .collect();

    Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..4)).with(Alignment::right()))
        .to_string()
}

/// Format the soak summary followed by the session table
pub fn format_report(report: &SoakReport) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "Sessions:   {}\n",
        report.sessions.len()
    ));
    output.push_str(&format!(
        "Messages:   {} ({} bytes)\n",
        report.total_messages, report.total_bytes
    ));
    output.push_str(&format!(
        "Elapsed:    {:.2}s ({:.0} msg/s)\n",
        report.elapsed_secs,
        report.messages_per_sec()
    ));
    output.push_str(&format!(
        "Link:       {} delivered, {} dropped, {} duplicated, {} reordered\n",
        report.link.delivered, report.link.dropped, report.link.duplicated, report.link.reordered
    ));
    output.push('\n');
    output.push_str(&format_sessions(&report.sessions));

    output
}

/// Print success message
pub fn print_success(msg: &str) {
    print_tagged(crossterm::style::Color::Green, "✓ ", msg);
}

/// Print error message
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print warning message
pub fn print_warning(msg: &str) {
    print_tagged(crossterm::style::Color::Yellow, "! ", msg);
}

/// Print info message
pub fn print_info(msg: &str) {
    print_tagged(crossterm::style::Color::Cyan, "→ ", msg);
}

fn print_tagged(color: crossterm::style::Color, tag: &str, msg: &str) {
    use crossterm::style::{Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(color),
        Print(tag),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbus_session::LinkStats;

    fn report() -> SoakReport {
        SoakReport {
            sessions: vec![SessionReport {
                session_id: 0x0001_0002,
                protocol_version: 1,
                messages: 10,
                bytes: 640,
                termination_reason: "success".to_string(),
            }],
            total_messages: 10,
            total_bytes: 640,
            elapsed_secs: 0.5,
            link: LinkStats {
                delivered: 30,
                dropped: 2,
                duplicated: 1,
                reordered: 0,
            },
        }
    }

    #[test]
    fn test_format_sessions_empty() {
        assert_eq!(format_sessions(&[]), "No sessions");
    }

    #[test]
    fn test_format_report_includes_link_stats() {
        let text = format_report(&report());
        assert!(text.contains("2 dropped"));
        assert!(text.contains("0x00010002"));
        assert!(text.contains("20 msg/s"));
    }
}
