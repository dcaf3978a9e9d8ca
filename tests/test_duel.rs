mod common;

use std::collections::BTreeSet;

use common::*;
use mutduel::duel::{DuelOutcome, DuelState, Killability, parse_lines};
use mutduel::error::EngineError;
use mutduel::events::{EventCategory, Visibility};
use mutduel::game::GameRules;
use mutduel::mutants::MutantState;
use mutduel::store::Store;
use mutduel::{Actor, Role};

/// Three surviving mutants on lines 4, 7 and 2, all covered by one test.
fn three_survivors(fx: &Fixture) -> (u32, u32, u32) {
    let a = fx.submit_mutant(&mutant_a()).id;
    let b = fx.submit_mutant(&mutant_b()).id;
    let c = fx.submit_mutant(&mutant_c()).id;
    fx.submit_test(&test_source("TestAll", &[2, 4, 7], &[]));
    (a, b, c)
}

#[test]
fn claim_opens_duel_and_freezes_mutant() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));

    let outcome = fx
        .engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();

    assert_eq!(outcome.claimed(), vec![mutant.id]);
    assert_eq!(outcome.duels[0].claimant, Actor::Player(fx.defender.id));
    assert_eq!(outcome.duels[0].state, DuelState::Pending);
    assert_eq!(fx.mutant(mutant.id).state, MutantState::FlaggedEquivalent);

    let events = fx.notifier.events();
    assert!(events.iter().any(|e| e.category == EventCategory::DefenderMutantClaimedEquivalent
        && e.visibility == Visibility::Player(fx.attacker.id)));
    assert!(events
        .iter()
        .any(|e| e.category == EventCategory::GameMessageDefender && e.visibility == Visibility::Game));
}

#[test]
fn frozen_mutant_is_not_judged_by_new_tests() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();

    let result = fx
        .engine
        .submit_test(fx.game.id, fx.defender.id, &test_source("TestB", &[4], &["// kills: a"]), BTreeSet::new())
        .unwrap();

    assert!(result.killed.is_empty());
    assert_eq!(fx.mutant(mutant.id).state, MutantState::FlaggedEquivalent);
}

#[test]
fn claim_over_uncovered_lines_changes_nothing() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestB", &[7], &[]));

    let err = fx
        .engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap_err();

    assert!(matches!(err, EngineError::NotClaimable));
    assert_eq!(fx.mutant(mutant.id).state, MutantState::Alive);
    assert!(fx.store.duels_for_mutant(mutant.id).unwrap().is_empty());
}

#[test]
fn second_claim_on_pending_mutant_conflicts() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    let lines = BTreeSet::from([4]);
    fx.engine.claim_equivalent(fx.game.id, fx.defender.id, &lines).unwrap();

    let err = fx.engine.claim_equivalent(fx.game.id, fx.defender.id, &lines).unwrap_err();

    assert!(matches!(err, EngineError::DuelConflict { mutant: m, .. } if m == mutant.id));
    assert_eq!(fx.store.duels_for_mutant(mutant.id).unwrap().len(), 1);
}

#[test]
fn claim_on_killed_mutant_conflicts() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &["// kills: a"]));
    assert_eq!(fx.mutant(mutant.id).state, MutantState::Killed);

    let err = fx
        .engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap_err();

    assert!(matches!(err, EngineError::DuelConflict { mutant: m, .. } if m == mutant.id));
    assert!(fx.store.duels_for_mutant(mutant.id).unwrap().is_empty());
}

#[test]
fn only_defenders_claim() {
    let fx = Fixture::new(GameRules::default());
    fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    let err = fx
        .engine
        .claim_equivalent(fx.game.id, fx.attacker.id, &BTreeSet::from([4]))
        .unwrap_err();
    assert!(matches!(err, EngineError::WrongRole { expected: Role::Defender, .. }));
}

#[test]
fn accept_declares_equivalent_and_rewards_claimant() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();
    let before = fx.points(fx.defender.id);

    let outcome = fx
        .engine
        .accept_equivalence(fx.game.id, fx.attacker.id, mutant.id)
        .unwrap();

    assert_eq!(outcome.duel.state, DuelState::Resolved);
    assert_eq!(outcome.duel.outcome, DuelOutcome::DeclaredEquivalent);
    assert_eq!(outcome.killability.verdict, Killability::NotKillable);
    assert_eq!(fx.mutant(mutant.id).state, MutantState::DeclaredEquivalent);
    assert_eq!(fx.points(fx.defender.id), before + 1);
    assert!(fx.store.pending_duel(mutant.id).unwrap().is_none());
}

#[test]
fn accept_without_pending_duel_conflicts() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    let err = fx
        .engine
        .accept_equivalence(fx.game.id, fx.attacker.id, mutant.id)
        .unwrap_err();
    assert!(matches!(err, EngineError::DuelConflict { .. }));
    assert_eq!(fx.mutant(mutant.id).state, MutantState::Alive);
}

#[test]
fn only_the_owner_answers_a_claim() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();
    let other = fx.engine.join_game(fx.game.id, "eve", Role::Attacker).unwrap();

    let err = fx.engine.accept_equivalence(fx.game.id, other.id, mutant.id).unwrap_err();
    assert!(matches!(err, EngineError::DuelConflict { .. }));
    let err = fx
        .engine
        .reject_equivalence(fx.game.id, other.id, mutant.id, &test_source("TestK", &[4], &["// kills: a"]))
        .unwrap_err();
    assert!(matches!(err, EngineError::DuelConflict { .. }));
    assert_eq!(fx.mutant(mutant.id).state, MutantState::FlaggedEquivalent);
}

#[test]
fn reject_resolves_every_pending_mutant() {
    let fx = Fixture::new(GameRules::default());
    let (a, b, c) = three_survivors(&fx);
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([2, 4, 7]))
        .unwrap();
    let attacker_before = fx.points(fx.attacker.id);
    let defender_before = fx.points(fx.defender.id);

    let outcome = fx
        .engine
        .reject_equivalence(fx.game.id, fx.attacker.id, a, &test_source("TestK", &[2, 4, 7], &["// kills: a b"]))
        .unwrap();

    assert_eq!(outcome.resolved[0].mutant, a);
    assert_eq!(outcome.outcome_of(a), Some(DuelOutcome::ProvenNonEquivalent));
    assert_eq!(outcome.outcome_of(b), Some(DuelOutcome::ProvenNonEquivalent));
    assert_eq!(outcome.outcome_of(c), Some(DuelOutcome::DeclaredEquivalent));
    assert!(outcome.killability.is_none());

    assert_eq!(fx.mutant(a).state, MutantState::ProvenNonEquivalent);
    assert!(fx.mutant(a).state.is_killed());
    assert_eq!(fx.mutant(a).killed_by, Some(outcome.test.id));
    assert_eq!(fx.mutant(b).state, MutantState::ProvenNonEquivalent);
    assert_eq!(fx.mutant(c).state, MutantState::DeclaredEquivalent);

    assert_eq!(fx.points(fx.attacker.id), attacker_before + 2);
    assert_eq!(fx.points(fx.defender.id), defender_before + 1);
    assert_eq!(outcome.test.score, 2);
    assert!(fx.store.pending_duels_for_game(fx.game.id).unwrap().is_empty());

    let events = fx.notifier.events();
    let duel_kills = events
        .iter()
        .filter(|e| e.category == EventCategory::AttackerMutantKilledEquivalent)
        .count();
    assert_eq!(duel_kills, 2);
}

#[test]
fn reject_with_a_test_that_does_not_kill_loses_the_duel() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();
    let defender_before = fx.points(fx.defender.id);

    let outcome = fx
        .engine
        .reject_equivalence(fx.game.id, fx.attacker.id, mutant.id, &test_source("TestK", &[4], &[]))
        .unwrap();

    assert_eq!(outcome.outcome_of(mutant.id), Some(DuelOutcome::DeclaredEquivalent));
    assert_eq!(outcome.killability.map(|k| k.verdict), Some(Killability::NotKillable));
    assert_eq!(fx.mutant(mutant.id).state, MutantState::DeclaredEquivalent);
    assert_eq!(fx.points(fx.defender.id), defender_before + 1);
    assert!(fx
        .notifier
        .events()
        .iter()
        .any(|e| e.message.contains("lost an equivalence duel")));
}

#[test]
fn reject_test_must_pass_on_original() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();

    let err = fx
        .engine
        .reject_equivalence(
            fx.game.id,
            fx.attacker.id,
            mutant.id,
            &test_source("TestK", &[4], &["// fails-original", "// kills: a"]),
        )
        .unwrap_err();

    assert!(matches!(err, EngineError::FailsOnOriginal { .. }));
    assert_eq!(fx.mutant(mutant.id).state, MutantState::FlaggedEquivalent);
    assert!(fx.store.pending_duel(mutant.id).unwrap().is_some());
}

#[test]
fn reject_infra_failure_keeps_duel_pending() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();

    let err = fx
        .engine
        .reject_equivalence(fx.game.id, fx.attacker.id, mutant.id, &test_source("TestK", &[4], &["// crashes: a"]))
        .unwrap_err();

    assert!(matches!(err, EngineError::Infra(_)));
    assert!(!err.is_recoverable());
    assert_eq!(fx.mutant(mutant.id).state, MutantState::FlaggedEquivalent);
    assert!(fx.store.pending_duel(mutant.id).unwrap().is_some());
}

#[test]
fn automatic_claim_fires_once_at_threshold() {
    let fx = Fixture::new(GameRules {
        auto_equivalence_threshold: 2,
        ..GameRules::default()
    });
    let mutant = fx.submit_mutant(&mutant_a());

    let first = fx
        .engine
        .submit_test(fx.game.id, fx.defender.id, &test_source("T1", &[4], &[]), BTreeSet::new())
        .unwrap();
    assert!(first.auto_claimed.is_empty());
    assert_eq!(fx.mutant(mutant.id).state, MutantState::Alive);

    let second = fx
        .engine
        .submit_test(fx.game.id, fx.defender.id, &test_source("T2", &[4], &[]), BTreeSet::new())
        .unwrap();
    assert_eq!(second.auto_claimed, vec![mutant.id]);
    assert_eq!(fx.mutant(mutant.id).state, MutantState::FlaggedEquivalent);

    let third = fx
        .engine
        .submit_test(fx.game.id, fx.defender.id, &test_source("T3", &[4], &[]), BTreeSet::new())
        .unwrap();
    assert!(third.auto_claimed.is_empty());

    let duels = fx.store.duels_for_mutant(mutant.id).unwrap();
    assert_eq!(duels.len(), 1);
    assert_eq!(duels[0].claimant, Actor::System);
    assert!(fx.notifier.events().iter().any(|e| {
        e.visibility == Visibility::Player(fx.attacker.id)
            && e.message == "One of your mutants survived 2 tests so it was automatically claimed as equivalent."
    }));
}

#[test]
fn automatic_claim_ignores_tests_older_than_the_mutant() {
    let fx = Fixture::new(GameRules {
        auto_equivalence_threshold: 1,
        ..GameRules::default()
    });
    fx.submit_test(&test_source("T1", &[4], &[]));
    let mutant = fx.submit_mutant(&mutant_a());

    assert_eq!(fx.mutant(mutant.id).state, MutantState::Alive);
    assert!(fx.engine.check_automatic_equivalence(fx.game.id).unwrap().is_empty());
}

#[test]
fn system_claim_resolution_awards_no_claimant() {
    let fx = Fixture::new(GameRules {
        auto_equivalence_threshold: 1,
        ..GameRules::default()
    });
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("T1", &[4], &[]));
    let defender_before = fx.points(fx.defender.id);

    let outcome = fx
        .engine
        .accept_equivalence(fx.game.id, fx.attacker.id, mutant.id)
        .unwrap();

    assert_eq!(outcome.duel.claimant, Actor::System);
    assert_eq!(fx.points(fx.defender.id), defender_before);
}

#[test]
fn killability_uses_tests_from_other_games() {
    let fx = Fixture::new(GameRules::default());
    let (other, _, other_defender) = fx.second_game(GameRules::default());
    fx.engine
        .submit_test(other.id, other_defender.id, &test_source("Foreign", &[4], &["// kills: a"]), BTreeSet::new())
        .unwrap();

    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();

    let outcome = fx
        .engine
        .accept_equivalence(fx.game.id, fx.attacker.id, mutant.id)
        .unwrap();

    assert_eq!(outcome.killability.verdict, Killability::Killable);
    assert_eq!(outcome.killability.entries.len(), 1);
    assert_eq!(outcome.duel.validation, outcome.killability.entries);
    // Advisory only: the duel is still resolved as conceded.
    assert_eq!(fx.mutant(mutant.id).state, MutantState::DeclaredEquivalent);
}

/// A mutant of the main game claimed by its defender, plus a test in another
/// game that kills it.
fn claimed_killable_mutant(fx: &Fixture) -> u32 {
    let (other, _, other_defender) = fx.second_game(GameRules::default());
    fx.engine
        .submit_test(other.id, other_defender.id, &test_source("Foreign", &[4], &["// kills: a"]), BTreeSet::new())
        .unwrap();
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();
    mutant.id
}

fn assert_killable_announced(fx: &Fixture, mutant: u32) {
    let events = fx.notifier.events();
    let announcement = events
        .iter()
        .find(|e| e.category == EventCategory::DefenderMutantEquivalent && e.visibility == Visibility::Game)
        .unwrap();
    assert!(announcement.message.to_lowercase().contains(&format!("mutant {} ", mutant)));
    assert!(announcement.message.ends_with("However, the mutant was killable!"));

    let to_claimant: Vec<_> = events
        .iter()
        .filter(|e| e.visibility == Visibility::Player(fx.defender.id))
        .collect();
    assert_eq!(to_claimant.len(), 1);
    assert!(to_claimant[0].message.contains("was killable"));
}

#[test]
fn accepted_killable_mutant_is_announced_to_both_sides() {
    let fx = Fixture::new(GameRules::default());
    let mutant = claimed_killable_mutant(&fx);

    let outcome = fx.engine.accept_equivalence(fx.game.id, fx.attacker.id, mutant).unwrap();

    assert!(outcome.killability.is_killable());
    assert_killable_announced(&fx, mutant);
}

#[test]
fn lost_duel_on_killable_mutant_is_announced_to_both_sides() {
    let fx = Fixture::new(GameRules::default());
    let mutant = claimed_killable_mutant(&fx);

    let outcome = fx
        .engine
        .reject_equivalence(fx.game.id, fx.attacker.id, mutant, &test_source("TestK", &[4], &[]))
        .unwrap();

    assert_eq!(outcome.outcome_of(mutant), Some(DuelOutcome::DeclaredEquivalent));
    assert_eq!(outcome.killability.map(|k| k.verdict), Some(Killability::Killable));
    assert_killable_announced(&fx, mutant);
}

#[test]
fn unkillable_equivalence_is_announced_plainly() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();

    fx.engine.accept_equivalence(fx.game.id, fx.attacker.id, mutant.id).unwrap();

    let events = fx.notifier.events();
    assert!(events.iter().all(|e| !e.message.contains("killable")));
    assert!(events.iter().all(|e| e.visibility != Visibility::Player(fx.defender.id)));
}

#[test]
fn killability_is_unknown_when_the_sandbox_fails() {
    let fx = Fixture::new(GameRules::default());
    let (other, _, other_defender) = fx.second_game(GameRules::default());
    fx.engine
        .submit_test(other.id, other_defender.id, &test_source("Foreign", &[4], &["// crashes: a"]), BTreeSet::new())
        .unwrap();
    let mutant = fx.submit_mutant(&mutant_a());

    let report = fx.engine.validate_killability(&mutant).unwrap();
    assert_eq!(report.verdict, Killability::Unknown);
    assert!(report.entries.is_empty());
}

#[test]
fn killability_can_be_disabled() {
    let fx = Fixture::with_config(GameRules::default(), |c| c.duel_validation_max_tests = 0);
    let mutant = fx.submit_mutant(&mutant_a());
    let report = fx.engine.validate_killability(&mutant).unwrap();
    assert_eq!(report.verdict, Killability::Disabled);
}

#[test]
fn duels_follow_the_game_state() {
    let fx = Fixture::new(GameRules::default());
    let mutant = fx.submit_mutant(&mutant_a());
    fx.submit_test(&test_source("TestA", &[4], &[]));
    fx.engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap();
    fx.engine.enter_grace(fx.game.id).unwrap();
    fx.engine.enter_grace(fx.game.id).unwrap();

    let err = fx
        .engine
        .claim_equivalent(fx.game.id, fx.defender.id, &BTreeSet::from([4]))
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalAction { .. }));

    fx.engine
        .accept_equivalence(fx.game.id, fx.attacker.id, mutant.id)
        .unwrap();

    fx.engine.finish_game(fx.game.id).unwrap();
    let err = fx
        .engine
        .accept_equivalence(fx.game.id, fx.attacker.id, mutant.id)
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalAction { .. }));
}

#[test]
fn parse_lines_accepts_commas_and_spaces() {
    assert_eq!(parse_lines("3, 5 8").unwrap(), BTreeSet::from([3, 5, 8]));
    assert!(matches!(parse_lines("3,x"), Err(EngineError::Validation(_))));
    assert!(matches!(parse_lines("0"), Err(EngineError::Validation(_))));
    assert!(matches!(parse_lines(""), Err(EngineError::Validation(_))));
}
