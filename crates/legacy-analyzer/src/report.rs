//! Human-readable report rendering.

use std::fmt::Write as _;

use analysis_coordination::consensus::AttributedRecommendation;
use analysis_coordination::{AnalysisReport, ReportStatus};

fn section(out: &mut String, title: &str, items: &[AttributedRecommendation]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n{title}:");
    for item in items {
        let rec = &item.recommendation;
        let _ = writeln!(
            out,
            "  - {} ({:.1}h, from {})",
            rec.title, rec.estimated_hours, item.source_agent
        );
    }
}

pub fn render_summary(report: &AnalysisReport) -> String {
    let mut out = String::new();
    let status = match report.status {
        ReportStatus::Complete => "complete",
        ReportStatus::Partial => "partial",
    };
    let _ = writeln!(
        out,
        "Analysis {status}{} [{}]",
        if report.from_cache { " (cached)" } else { "" },
        report.fingerprint
    );

    let consensus = &report.consensus;
    let _ = writeln!(
        out,
        "Team confidence {}%, agreement {:.1}% on {}",
        consensus.team_confidence,
        consensus.agreement_percentage,
        consensus
            .consensus_priority
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into()),
    );
    let _ = writeln!(
        out,
        "Files: {} extracted, {} failed ({:.2}x parallel speedup)",
        report.extraction.succeeded, report.extraction.failed, report.extraction.speedup
    );

    for analysis in &report.analyses {
        let _ = writeln!(
            out,
            "\n[{}] {} priority, {:.0}% confidence",
            analysis.agent_name, analysis.priority, analysis.confidence_score
        );
        for finding in &analysis.findings {
            let _ = writeln!(out, "  * {finding}");
        }
    }

    let recs = &report.recommendations;
    section(&mut out, "High priority", &recs.high_priority);
    section(&mut out, "Medium priority", &recs.medium_priority);
    section(&mut out, "Long-term", &recs.long_term_strategic);
    let _ = writeln!(out, "\nTotal estimated effort: {:.1}h", recs.total_estimated_effort);

    for failure in &report.file_failures {
        let _ = writeln!(out, "! file {}: {}", failure.name, failure.error);
    }
    for failure in &report.specialist_failures {
        let _ = writeln!(out, "! specialist {}: {}", failure.specialty, failure.error);
    }
    out
}
