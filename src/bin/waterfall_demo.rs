//! Runs a small batch through three fake tiers and prints the batch report.
//! Set `WATERFALL_DIAG_ADDR=127.0.0.1:8080` to keep the diagnostics router
//! (plus `/metrics`) up afterwards until Ctrl-C.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use enrichment_waterfall::metrics::Metrics;
use enrichment_waterfall::providers::fixed::{FnProvider, StaticProvider};
use enrichment_waterfall::subject::IdKind;
use enrichment_waterfall::tier::Fields;
use enrichment_waterfall::{
    init_tracing, router, BatchCoordinator, BatchOptions, Cost, Subject, TierProvider, TierRequest, TierResult,
    Waterfall, WaterfallConfig,
};
use tracing::info;

const BUNDLED_CONFIG: &str = include_str!("../../config/waterfall.toml");

fn fields(pairs: &[(&str, &str)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn demo_providers() -> HashMap<String, Arc<dyn TierProvider>> {
    let email_finder = FnProvider::new("email_finder", |req: TierRequest<'_>| {
        Ok(match req.key.kind() {
            IdKind::Email => TierResult::found(fields(&[("email", req.key.value())]), 0.95, Cost::from_units(0.002)),
            // a guess: usually rejected, but forwarded as a hint
            IdKind::Name => {
                let guess = req.key.value().replace(' ', ".");
                TierResult::found(fields(&[("email", guess.as_str())]), 0.55, Cost::from_units(0.002))
            }
            _ => TierResult::NotFound {
                cost: Cost::from_units(0.001),
            },
        })
    });

    let company_api = FnProvider::new("company_api", |req: TierRequest<'_>| {
        Ok(match req.hint {
            Some(h) => {
                let mut f = h.fields.clone();
                f.insert("title".into(), "Head of Operations".into());
                TierResult::found(f, 0.86, Cost::from_units(0.05))
            }
            None => TierResult::NotFound {
                cost: Cost::from_units(0.05),
            },
        })
    });

    let premium = StaticProvider::new(
        "premium_lookup",
        TierResult::found(fields(&[("email", "founders@example.com")]), 0.99, Cost::from_units(0.25)),
    );

    let mut map: HashMap<String, Arc<dyn TierProvider>> = HashMap::new();
    map.insert("email_finder".into(), Arc::new(email_finder));
    map.insert("company_api".into(), Arc::new(company_api));
    map.insert("premium_lookup".into(), Arc::new(premium));
    map
}

fn demo_subjects() -> Vec<Subject> {
    vec![
        Subject::with_email("Jo.Smith@Acme.com"),
        Subject::with_name_at("Ana Lopez", "globex.io").attr("employees", 120.0),
        Subject::with_name_at("Li Wei", "initech.com").attr("employees", 8.0),
        Subject::with_domain("https://www.Hooli.com/about")
            .attr("hiring", true)
            .attr("region", "us"),
        Subject::with_domain("tiny-shop.example"),
        Subject::default(),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let mut cfg = WaterfallConfig::load_default().context("loading waterfall config")?;
    if cfg.tiers.is_empty() {
        cfg.tiers = toml::from_str::<WaterfallConfig>(BUNDLED_CONFIG)
            .context("parsing bundled demo config")?
            .tiers;
    }

    let metrics = Metrics::init()?;
    let waterfall = Arc::new(Waterfall::from_config(&cfg, &demo_providers())?);
    let coordinator = BatchCoordinator::new(Arc::clone(&waterfall), cfg.concurrency);

    let report = coordinator
        .enrich_batch(demo_subjects(), &BatchOptions::default())
        .await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    // second pass is served from cache at zero cost
    let again = coordinator
        .enrich_batch(demo_subjects(), &BatchOptions::default())
        .await;
    info!(cache_hits = again.cache_hits, total_cost = %again.total_cost, "second pass");

    if let Ok(addr) = std::env::var("WATERFALL_DIAG_ADDR") {
        let app = router(Arc::clone(&waterfall)).merge(metrics.router());
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!(%addr, "diagnostics listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    }
    Ok(())
}
