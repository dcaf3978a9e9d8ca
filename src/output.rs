use console::Style;

use crate::compiler::Diagnostics;
use crate::duel::{AcceptOutcome, ClaimOutcome, DuelOutcome, Killability, KillabilityReport, RejectOutcome};
use crate::engine::GameSummary;
use crate::mutants::{Mutant, MutantState};
use crate::orchestrator::{Judging, MutantSubmission, TestSubmission};

pub fn print_error(msg: &str) {
    let style = Style::new().red().bold();
    eprintln!("{} {}", style.apply_to("✗"), msg);
}

pub fn print_success(msg: &str) {
    let style = Style::new().green().bold();
    println!("{} {}", style.apply_to("✓"), msg);
}

pub fn print_warning(msg: &str) {
    let style = Style::new().yellow().bold();
    println!("{} {}", style.apply_to("!"), msg);
}

pub fn print_diagnostics(diagnostics: &Diagnostics) {
    let line_style = Style::new().cyan();
    if diagnostics.errors.is_empty() {
        let dim = Style::new().dim();
        for line in diagnostics.raw.lines().take(20) {
            eprintln!("  {}", dim.apply_to(line));
        }
        return;
    }
    for error in &diagnostics.errors {
        eprintln!("  {} {}", line_style.apply_to(format!("line {}:", error.line)), error.message);
    }
}

fn print_judging(judging: &Judging) {
    let dim = Style::new().dim();
    match judging {
        Judging::Complete { executed } => {
            println!("  {} {} test run(s) executed", dim.apply_to("·"), executed);
        }
        Judging::Unavailable { reason } => {
            print_warning(&format!("Could not judge this round: {}", reason));
        }
    }
}

fn print_auto_claims(claimed: &[u32]) {
    if !claimed.is_empty() {
        let ids: Vec<String> = claimed.iter().map(|id| format!("#{}", id)).collect();
        print_warning(&format!("Automatically claimed as equivalent: {}", ids.join(", ")));
    }
}

pub fn print_mutant_submission(result: &MutantSubmission) {
    print_success(&format!("Mutant #{} created", result.mutant.id));
    if let Some(kill) = result.kill {
        print_warning(&format!("Killed right away by test #{}", kill.test));
    } else if result.survived {
        println!("  Survived every test that reached it");
    }
    print_judging(&result.judging);
    print_auto_claims(&result.auto_claimed);
    if let Some(state) = result.game_state {
        println!("  The game is now {}", state);
    }
}

pub fn print_test_submission(result: &TestSubmission) {
    print_success(&format!("Test #{} created", result.test.id));
    if result.killed.is_empty() {
        println!("  No mutant killed");
    } else {
        let ids: Vec<String> = result.killed.iter().map(|k| format!("#{}", k.mutant)).collect();
        println!("  Killed {}", ids.join(", "));
    }
    for smell in &result.smells {
        print_warning(&format!("Test smell: {}", smell));
    }
    print_judging(&result.judging);
    print_auto_claims(&result.auto_claimed);
    if let Some(state) = result.game_state {
        println!("  The game is now {}", state);
    }
}

pub fn print_claim(result: &ClaimOutcome) {
    let ids: Vec<String> = result.claimed().iter().map(|id| format!("#{}", id)).collect();
    print_success(&format!("Claimed {} as equivalent", ids.join(", ")));
}

fn print_killability(report: &KillabilityReport) {
    let dim = Style::new().dim();
    let text = match report.verdict {
        Killability::Killable => "a test from another game kills this mutant",
        Killability::NotKillable => "no sampled test from other games kills this mutant",
        Killability::Unknown => "killability could not be checked",
        Killability::Disabled => return,
    };
    println!("  {} {}", dim.apply_to("·"), text);
}

pub fn print_accept(result: &AcceptOutcome) {
    print_success(&format!("Mutant #{} declared equivalent", result.duel.mutant_id));
    print_killability(&result.killability);
}

pub fn print_reject(result: &RejectOutcome) {
    print_success(&format!("Test #{} submitted for the duel", result.test.id));
    for r in &result.resolved {
        match r.outcome {
            DuelOutcome::ProvenNonEquivalent => {
                let style = Style::new().green();
                println!("  #{} {}", r.mutant, style.apply_to("killed, not equivalent"));
            }
            DuelOutcome::DeclaredEquivalent => {
                let style = Style::new().yellow();
                println!("  #{} {}", r.mutant, style.apply_to("declared equivalent"));
            }
            DuelOutcome::Unresolved => {}
        }
    }
    if let Some(report) = &result.killability {
        print_killability(report);
    }
}

fn state_label(state: MutantState) -> console::StyledObject<&'static str> {
    match state {
        MutantState::Alive => Style::new().yellow().apply_to("alive"),
        MutantState::Killed => Style::new().green().apply_to("killed"),
        MutantState::FlaggedEquivalent => Style::new().magenta().apply_to("claimed"),
        MutantState::DeclaredEquivalent => Style::new().dim().apply_to("equivalent"),
        MutantState::ProvenNonEquivalent => Style::new().green().apply_to("killed in duel"),
    }
}

pub fn print_mutant_detail(m: &Mutant) {
    let ref_style = Style::new().cyan().bold();
    let dim = Style::new().dim();
    let lines: Vec<String> = m.lines.iter().map(u32::to_string).collect();
    println!(
        "  {} {} {} score {}",
        ref_style.apply_to(format!("#{}", m.id)),
        if m.is_viable() {
            state_label(m.state)
        } else {
            Style::new().red().dim().apply_to("unviable")
        },
        dim.apply_to(format!("[lines {}]", lines.join(","))),
        m.score,
    );
    for line in m.diff.lines() {
        if line.starts_with('-') {
            println!("      {}", Style::new().red().apply_to(line));
        } else if line.starts_with('+') {
            println!("      {}", Style::new().green().apply_to(line));
        }
    }
}

pub fn print_summary(summary: &GameSummary) {
    let game = &summary.game;
    println!(
        "Game {}: {}, round {} ({} valid / {} invalid submissions)",
        game.id, game.state, game.round, game.valid_submissions, game.invalid_submissions,
    );
    println!();
    for p in &summary.players {
        println!("  {} {} ({}) {} points", Style::new().bold().apply_to(format!("@{}", p.id)), p.name, p.role, p.points);
    }
    if !summary.mutants.is_empty() {
        println!();
        println!("Mutants:");
        for m in &summary.mutants {
            print_mutant_detail(m);
        }
    }
    if !summary.unviable_mutants.is_empty() {
        println!();
        println!("Unviable mutants (did not compile):");
        for m in &summary.unviable_mutants {
            print_mutant_detail(m);
        }
    }
    if !summary.tests.is_empty() {
        println!();
        println!("Tests:");
        for t in &summary.tests {
            let lines: Vec<String> = t.covered_lines.iter().map(u32::to_string).collect();
            println!(
                "  #{} {} by @{} score {} covers {}",
                t.id,
                if t.is_valid() { "valid" } else { "invalid" },
                t.player_id,
                t.score,
                if lines.is_empty() { "-".to_string() } else { lines.join(",") },
            );
        }
    }
    if !summary.pending_duels.is_empty() {
        println!();
        let ids: Vec<String> = summary.pending_duels.iter().map(|d| format!("#{}", d.mutant_id)).collect();
        print_warning(&format!("Pending equivalence duels: {}", ids.join(", ")));
    }
}
