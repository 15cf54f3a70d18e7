pub mod agents;
pub mod copilot;
pub mod provider;

/// Every analysis session is pinned to this model regardless of
/// caller-supplied overrides; it keeps token cost low and response
/// latency predictable across all tool-analyst and summarizer agents.
pub const REQUIRED_MODEL: &str = "gpt-5-mini";
