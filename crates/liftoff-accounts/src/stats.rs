//! Read-time quota aggregation: provider grouping, per-account overall
//! percentage, and the pool-wide global mean.

use std::collections::HashMap;

use liftoff_core::types::{
    round1, Account, AccountStats, HealthStatus, ProviderGroup, Quota,
};

use crate::registry::{detect_provider, KNOWN_PROVIDERS, OTHERS};

/// Group one account's models by provider and derive its overall stats.
///
/// Group order is stable: registered providers in declaration order, then
/// `others` last. Empty groups are omitted. `visible` gates which models
/// count toward the averages (absent-from-config means visible).
pub fn group_models_by_provider(
    quota: &Quota,
    visible: impl Fn(&str) -> bool,
) -> AccountStats {
    let mut buckets: HashMap<&'static str, Vec<&str>> = HashMap::new();
    let mut model_names: Vec<&str> = quota
        .models
        .keys()
        .map(String::as_str)
        .filter(|m| visible(m))
        .collect();
    // HashMap iteration order is arbitrary; groups list models sorted.
    model_names.sort_unstable();

    for model in &model_names {
        buckets.entry(detect_provider(model).name).or_default().push(model);
    }

    let mut groups = Vec::new();
    for provider in KNOWN_PROVIDERS.iter().map(|p| &p.info).chain([&OTHERS]) {
        let Some(models) = buckets.get(provider.name) else {
            continue;
        };
        let percentages: Vec<f64> = models
            .iter()
            .map(|m| quota.models[*m].percentage)
            .collect();
        let avg = round1(percentages.iter().sum::<f64>() / percentages.len() as f64);
        let earliest_reset = models
            .iter()
            .filter_map(|m| quota.models[*m].reset_time)
            .min();
        groups.push(ProviderGroup {
            provider: provider.clone(),
            models: models.iter().map(|m| m.to_string()).collect(),
            avg_percentage: avg,
            earliest_reset,
        });
    }

    let overall = overall_percentage(quota, |m| model_names.contains(&m));
    AccountStats {
        groups,
        overall_percentage: overall,
        health: HealthStatus::from_percentage(overall),
    }
}

/// Mean percentage over all visible models, one decimal. Empty set yields 0.
pub fn overall_percentage(quota: &Quota, visible: impl Fn(&str) -> bool) -> f64 {
    let percentages: Vec<f64> = quota
        .models
        .iter()
        .filter(|(m, _)| visible(m))
        .map(|(_, q)| q.percentage)
        .collect();
    if percentages.is_empty() {
        return 0.0;
    }
    round1(percentages.iter().sum::<f64>() / percentages.len() as f64)
}

/// Pool-wide quota: a flat mean over every visible model of every account —
/// not a mean of per-account means.
pub fn global_quota(accounts: &[Account], visible: impl Fn(&str) -> bool) -> f64 {
    let percentages: Vec<f64> = accounts
        .iter()
        .flat_map(|a| a.quota.models.iter())
        .filter(|(m, _)| visible(m))
        .map(|(_, q)| q.percentage)
        .collect();
    if percentages.is_empty() {
        return 0.0;
    }
    round1(percentages.iter().sum::<f64>() / percentages.len() as f64)
}
