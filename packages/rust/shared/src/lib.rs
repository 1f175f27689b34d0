//! Shared types, error model, backend interfaces and configuration for repoqa.
//!
//! This crate is the foundation depended on by all other repoqa crates.
//! It provides:
//! - [`RepoQaError`] and [`BackendError`]: the error types
//! - The step data model ([`ToolResult`], [`ToolError`], [`ToolStatus`], ...)
//! - Typed step payloads ([`RelevanceAssessment`], [`SearchOutcome`], ...)
//! - Collaborator traits ([`SearchBackend`], [`LanguageBackend`], ...)
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod backend;
pub mod config;
pub mod error;
pub mod payloads;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use backend::{
    AnalysisRequest, AnalysisResponse, AnalysisTask, CompressedDocument, DocumentCompressor,
    EmbeddingBackend, LanguageBackend, SearchBackend, SearchParams,
};
pub use config::{
    AppConfig, CacheConfig, DefaultsConfig, DomainConfig, OpenRouterConfig, PipelineConfig,
    RetryConfig, api_key, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, validate_api_key,
};
pub use error::{BackendError, RepoQaError, Result};
pub use payloads::{
    ContextAssessment, ConversationTurn, GeneratedResponse, QueryAnalysis, RankedDocument,
    RelevanceAssessment, Role, SearchHit, SearchMode, SearchOutcome, SearchStrategy,
    SourceDocument,
};
pub use types::{
    ResultMetadata, RoutingSignal, ToolDescriptor, ToolError, ToolErrorKind, ToolPhase,
    ToolResult, ToolStatus, codes,
};
