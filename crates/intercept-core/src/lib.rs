//! Policy-as-code compliance engine.
//!
//! A bundle of typed policies is evaluated against a target (a file tree, a
//! configuration document, an HTTP endpoint or host runtime state) and the
//! results are merged into one SARIF 2.1.0 report.
//!
//! - [`run_audit`]: one-shot evaluation of every selected policy.
//! - [`observe::Observer`]: cron- and change-driven re-evaluation with a
//!   periodic merged report under `_status/`.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use intercept_core::{load_bundle, run_audit, Dispatcher, Engine, EngineSettings, PolicyFilter, RunId};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let run_id = RunId::new();
//! let loaded = load_bundle("policies.yaml", None, &run_id).await?;
//! let engine = Engine::builder(loaded.bundle, EngineSettings::default())
//!     .run_id(run_id)
//!     .build()?;
//! let summary = run_audit(Arc::new(engine), Arc::new(Dispatcher::standard()), &PolicyFilter::default()).await?;
//! std::process::exit(summary.exit_code());
//! # }
//! ```
//!
//! # External tools
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `INTERCEPT_RG_PATH` | ripgrep binary used by `scan`/`assure` (default: `rg`) |
//! | `INTERCEPT_GOSS_PATH` | goss binary used by `runtime` (default: `goss`) |
//! | `INTERCEPT_OPA_PATH` | opa binary used by `rego` (default: `opa`) |

pub mod cache;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod eval;
pub mod filter;
pub mod host;
pub mod http;
pub mod loader;
pub mod model;
pub mod observe;
pub mod output;
pub mod run_id;
pub mod sarif;
pub mod severity;
pub mod sink;
pub mod target;

// Re-export main types
pub use cache::ResultCache;
pub use dispatch::{run_audit, AuditSummary, Dispatcher, PolicyOutcome};
pub use engine::{Engine, EngineBuilder, EngineSettings, ToolPaths};
pub use error::{InterceptError, InterceptResult};
pub use eval::{Evaluator, PolicyJob};
pub use filter::{detect_environment, PolicyFilter};
pub use host::HostIdentity;
pub use loader::{is_url, load_bundle, load_bundle_from_file, load_bundle_from_str, LoadedBundle};
pub use model::{Bundle, HookConfig, Policy, PolicyType};
pub use observe::{ObserveOptions, ObserveSummary, Observer};
pub use output::OutputLayout;
pub use run_id::RunId;
pub use sarif::{MergedReport, SarifReport, SarifResult};
pub use severity::SarifLevel;
pub use sink::{SinkFanout, WebhookSecret};
