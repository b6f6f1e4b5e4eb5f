// OpenAI-compatible enrichment provider

mod provider;

pub use provider::OpenAiEnrichmentProvider;
