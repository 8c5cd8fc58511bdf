// tests/batch_budget.rs
// Batch runs: budget caps under concurrency, spillover to the next tier,
// order independence, cost reconciliation, and cancellation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use enrichment_waterfall::providers::fixed::{FnProvider, StaticProvider};
use enrichment_waterfall::tier::budget::cap_for;
use enrichment_waterfall::tier::Fields;
use enrichment_waterfall::trace::TierOutcome;
use enrichment_waterfall::{
    BatchCoordinator, BatchOptions, Cost, Subject, SubjectStatus, TierDescriptor, TierRegistry, TierRequest,
    TierResult, Waterfall,
};
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

fn found(conf: f64, cost: f64, email: &str) -> TierResult {
    let mut f = Fields::new();
    f.insert("email".into(), email.into());
    TierResult::found(f, conf, Cost::from_units(cost))
}

fn subjects(n: usize) -> Vec<Subject> {
    (0..n).map(|i| Subject::with_domain(format!("company{i}.com"))).collect()
}

/// premium (capped, always accepts) → fallback (uncapped, always accepts)
fn premium_then_fallback(fraction: f64) -> (Arc<StaticProvider>, Arc<StaticProvider>, Waterfall) {
    let premium = Arc::new(
        StaticProvider::new("premium", found(0.99, 0.25, "vip@x.com")).with_delay(Duration::from_millis(2)),
    );
    let fallback = Arc::new(StaticProvider::new("fallback", found(0.9, 0.01, "info@x.com")));
    let reg = TierRegistry::new(vec![
        TierDescriptor::new("premium", 1, premium.clone())
            .unit_cost(0.25)
            .budget(fraction),
        TierDescriptor::new("fallback", 2, fallback.clone()).unit_cost(0.01),
    ])
    .unwrap();
    (premium, fallback, Waterfall::new(reg))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifteen_percent_of_twenty_admits_three() {
    let (premium, fallback, wf) = premium_then_fallback(0.15);
    let coord = BatchCoordinator::new(Arc::new(wf), 8);

    let report = coord.enrich_batch(subjects(20), &BatchOptions::default()).await;

    assert_eq!(premium.calls(), 3);
    assert_eq!(fallback.calls(), 17);
    assert_eq!(report.accepted_by_tier.get("premium"), Some(&3));
    assert_eq!(report.accepted_by_tier.get("fallback"), Some(&17));
    assert_eq!(report.not_found, 0);
    let usage = report.budget["premium"];
    assert_eq!((usage.cap, usage.admitted), (3, 3));

    // spillover subjects show the skip in their trace and still got a result
    let traces = coord.waterfall().traces().last_n(20);
    let spilled: Vec<_> = traces
        .iter()
        .filter(|t| t.steps.first() == Some(&TierOutcome::BudgetExhausted { tier: "premium".into() }))
        .collect();
    assert_eq!(spilled.len(), 17);
    assert!(spilled.iter().all(|t| t.accepted_tier() == Some("fallback")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn budget_cap_holds_under_shuffled_concurrent_batches() {
    let mut rng = rand::rng();
    for (n, fraction, conc) in [(7, 0.3, 7), (40, 0.1, 16), (33, 0.5, 5), (5, 0.1, 5), (64, 1.0, 32)] {
        let (premium, fallback, wf) = premium_then_fallback(fraction);
        let coord = BatchCoordinator::new(Arc::new(wf), conc);
        let mut batch = subjects(n);
        batch.shuffle(&mut rng);

        let report = coord.enrich_batch(batch, &BatchOptions::default()).await;
        let cap = cap_for(n, fraction);

        assert_eq!(premium.calls(), cap, "n={n} f={fraction}");
        assert_eq!(fallback.calls(), n - cap, "n={n} f={fraction}");
        assert_eq!(report.accepted(), n);
        assert!(report.budget["premium"].admitted <= cap);
    }
}

#[tokio::test]
async fn batch_total_matches_ledger_and_outcomes() {
    let cheap = Arc::new(FnProvider::new("cheap", |req: TierRequest<'_>| {
        // odd-numbered companies are found cheaply
        let digit = req.key.value().chars().filter(|c| c.is_ascii_digit()).last();
        Ok(match digit.and_then(|d| d.to_digit(10)) {
            Some(d) if d % 2 == 1 => found(0.8, 0.003, "hi@x.com"),
            _ => TierResult::NotFound {
                cost: Cost::from_units(0.001),
            },
        })
    }));
    let expensive = Arc::new(StaticProvider::new(
        "expensive",
        TierResult::NotFound {
            cost: Cost::from_units(0.2),
        },
    ));
    let reg = TierRegistry::new(vec![
        TierDescriptor::new("cheap", 1, cheap),
        TierDescriptor::new("expensive", 2, expensive).budget(0.5),
    ])
    .unwrap();
    let wf = Arc::new(Waterfall::new(reg));
    let coord = BatchCoordinator::new(Arc::clone(&wf), 4);

    let report = coord.enrich_batch(subjects(10), &BatchOptions::default()).await;

    let from_outcomes: Cost = report.outcomes.iter().map(|o| o.cost).sum();
    let from_ledger: Cost = wf.ledger().entries_for(&report.batch_id).iter().map(|e| e.cost).sum();
    assert_eq!(report.total_cost, from_outcomes);
    assert_eq!(report.total_cost, from_ledger);
    assert_eq!(report.cost_by_tier.values().copied().sum::<Cost>(), report.total_cost);

    // 5 odd found cheaply, 5 even miss; all 5 evens fit in the expensive cap of 5
    assert_eq!(report.accepted_by_tier.get("cheap"), Some(&5));
    assert_eq!(report.not_found, 5);
    assert_eq!(report.not_found_keys().len(), 5);
    assert!(report.not_found_keys().iter().all(|k| {
        let d = k.chars().filter(|c| c.is_ascii_digit()).last().unwrap();
        d.to_digit(10).unwrap() % 2 == 0
    }));
    assert_eq!(
        report.total_cost,
        Cost::from_units(5.0 * 0.003 + 5.0 * 0.001 + 5.0 * 0.2)
    );

    // outcomes come back in submission order
    let idx: Vec<usize> = report.outcomes.iter().map(|o| o.index).collect();
    assert_eq!(idx, (0..10).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn permuting_the_batch_does_not_change_uncapped_outcomes() {
    let build = || {
        let t1 = Arc::new(FnProvider::new("t1", |req: TierRequest<'_>| {
            Ok(if req.key.value().len() % 3 == 0 {
                found(0.9, 0.0, "a@x.com")
            } else {
                found(0.4, 0.0, "maybe@x.com")
            })
        }));
        let t2 = Arc::new(FnProvider::new("t2", |req: TierRequest<'_>| {
            Ok(if req.key.value().len() % 2 == 0 {
                found(0.95, 0.0, "b@x.com")
            } else {
                TierResult::NotFound { cost: Cost::ZERO }
            })
        }));
        let reg = TierRegistry::new(vec![TierDescriptor::new("t1", 1, t1), TierDescriptor::new("t2", 2, t2)]).unwrap();
        BatchCoordinator::new(Arc::new(Waterfall::new(reg)), 6)
    };

    let base: Vec<Subject> = (0..30)
        .map(|i| Subject::with_domain(format!("{}.io", "a".repeat(i % 9 + 1) + &i.to_string())))
        .collect();

    let outcome_map = |report: &enrichment_waterfall::BatchReport| -> BTreeMap<String, SubjectStatus> {
        report
            .outcomes
            .iter()
            .map(|o| (o.key.clone().unwrap(), o.status.clone()))
            .collect()
    };

    let first = build().enrich_batch(base.clone(), &BatchOptions::default()).await;
    let mut shuffled = base.clone();
    shuffled.shuffle(&mut rand::rng());
    let second = build().enrich_batch(shuffled, &BatchOptions::default()).await;

    assert_eq!(outcome_map(&first), outcome_map(&second));
    assert_eq!(first.accepted_by_tier, second.accepted_by_tier);
    assert_eq!(first.not_found, second.not_found);
}

#[tokio::test]
async fn invalid_subjects_are_reported_not_fatal() {
    let tier = Arc::new(StaticProvider::new("t1", found(0.9, 0.0, "x@y.com")));
    let reg = TierRegistry::new(vec![TierDescriptor::new("t1", 1, tier.clone())]).unwrap();
    let coord = BatchCoordinator::new(Arc::new(Waterfall::new(reg)), 2);

    let batch = vec![
        Subject::with_domain("good.com"),
        Subject::default(),
        Subject::with_email("broken"),
        Subject::with_email("ok@good.com"),
    ];
    let report = coord.enrich_batch(batch, &BatchOptions::default()).await;

    assert_eq!(report.subjects, 4);
    assert_eq!(report.invalid, 2);
    assert_eq!(report.accepted(), 2);
    assert_eq!(tier.calls(), 2);
    assert!(matches!(report.outcomes[1].status, SubjectStatus::Invalid { .. }));
    assert_eq!(report.outcomes[1].key, None);
}

#[tokio::test]
async fn second_batch_is_served_from_cache() {
    let tier = Arc::new(StaticProvider::new("t1", found(0.9, 0.05, "x@y.com")));
    let reg = TierRegistry::new(vec![TierDescriptor::new("t1", 1, tier.clone())]).unwrap();
    let coord = BatchCoordinator::new(Arc::new(Waterfall::new(reg)), 4);

    let first = coord.enrich_batch(subjects(6), &BatchOptions::default()).await;
    assert_eq!(first.cache_hits, 0);
    assert_eq!(first.total_cost, Cost::from_units(0.30));

    let second = coord.enrich_batch(subjects(6), &BatchOptions::default()).await;
    assert_eq!(second.cache_hits, 6);
    assert!(second.accepted_by_tier.is_empty());
    assert_eq!(second.total_cost, Cost::ZERO);
    assert_eq!(tier.calls(), 6);
    assert_ne!(first.batch_id, second.batch_id);

    let refreshed = coord
        .enrich_batch(
            subjects(6),
            &BatchOptions {
                force_refresh: true,
                ..BatchOptions::default()
            },
        )
        .await;
    assert_eq!(refreshed.cache_hits, 0);
    assert_eq!(tier.calls(), 12);
}

#[tokio::test]
async fn cancelled_before_start_dispatches_nothing() {
    let tier = Arc::new(StaticProvider::new("t1", found(0.9, 0.05, "x@y.com")));
    let reg = TierRegistry::new(vec![TierDescriptor::new("t1", 1, tier.clone())]).unwrap();
    let coord = BatchCoordinator::new(Arc::new(Waterfall::new(reg)), 4);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = coord
        .enrich_batch(
            subjects(5),
            &BatchOptions {
                force_refresh: false,
                cancel,
            },
        )
        .await;

    assert_eq!(report.cancelled, 5);
    assert_eq!(tier.calls(), 0);
    assert_eq!(report.total_cost, Cost::ZERO);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.status == SubjectStatus::Cancelled && o.key.is_some()));
}

#[tokio::test]
async fn cancel_mid_batch_lets_in_flight_subjects_finish() {
    let slow = Arc::new(StaticProvider::new("slow", found(0.9, 0.01, "x@y.com")).with_delay(Duration::from_millis(30)));
    let reg = TierRegistry::new(vec![TierDescriptor::new("slow", 1, slow.clone())]).unwrap();
    let wf = Arc::new(Waterfall::new(reg));
    let coord = BatchCoordinator::new(Arc::clone(&wf), 1);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(75)).await;
        trigger.cancel();
    });

    let report = coord
        .enrich_batch(
            subjects(20),
            &BatchOptions {
                force_refresh: false,
                cancel,
            },
        )
        .await;

    let finished = report.accepted();
    assert!(finished >= 1, "at least the first subject completes");
    assert!(report.cancelled >= 10, "cancelled={}", report.cancelled);
    assert_eq!(finished + report.cancelled, 20);
    // every started call was recorded and charged
    assert_eq!(slow.calls(), finished);
    assert_eq!(report.total_cost, Cost::from_units(0.01 * finished as f64));
}
