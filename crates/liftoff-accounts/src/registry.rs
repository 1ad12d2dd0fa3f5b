//! Built-in provider registry — maps a model identifier to its logical
//! provider by prefix. First match in declaration order wins; anything
//! unmatched collapses into the `others` bucket. New providers are added by
//! extending the table.

use liftoff_core::types::ProviderInfo;

/// A registered model-name prefix and the provider it denotes.
pub struct ProviderPrefix {
    pub prefix: &'static str,
    pub info: ProviderInfo,
}

pub const KNOWN_PROVIDERS: &[ProviderPrefix] = &[
    ProviderPrefix {
        prefix: "claude-",
        info: ProviderInfo {
            name: "Claude",
            company: "Anthropic",
            color: "#D97757",
        },
    },
    ProviderPrefix {
        prefix: "gemini-",
        info: ProviderInfo {
            name: "Gemini",
            company: "Google",
            color: "#4285F4",
        },
    },
];

/// Catch-all bucket for unmatched models.
pub const OTHERS: ProviderInfo = ProviderInfo {
    name: "Others",
    company: "",
    color: "#9AA0A6",
};

/// Classify a model identifier. Total: every input maps to a registered
/// provider or to [`OTHERS`].
pub fn detect_provider(model: &str) -> &'static ProviderInfo {
    KNOWN_PROVIDERS
        .iter()
        .find(|p| model.starts_with(p.prefix))
        .map(|p| &p.info)
        .unwrap_or(&OTHERS)
}
