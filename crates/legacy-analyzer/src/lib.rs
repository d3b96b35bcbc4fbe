//! Legacy codebase analyzer.
//!
//! Discovers source files, extracts local metadata, and asks security,
//! performance and architecture specialists (LLM-backed) for a joint
//! assessment through the `analysis_coordination` control plane.

pub mod config;
pub mod extractor;
pub mod files;
pub mod llm;
pub mod report;
pub mod specialists;
