// Anthropic enrichment provider

mod provider;

pub use provider::AnthropicEnrichmentProvider;
