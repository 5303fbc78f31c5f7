//! checkplan: a test-job orchestration engine.
//!
//! Test jobs are declared in provider unit files, selected through test
//! plans or whitelists, ordered by their dependencies and run one at a time
//! inside a session that is checkpointed after every step and can be
//! resumed after a crash or reboot.
//!
//! # Architecture
//!
//! - **Units** ([`unit`], [`provider`]): jobs, templates, test plans and
//!   categories loaded from `*.pxu` files into a [`UnitCatalogue`]
//! - **Resources** ([`resource`], [`template`]): records produced by resource
//!   jobs, the `requires` expression language, template instantiation
//! - **Selection** ([`qualifier`]) and **resolution** ([`resolver`]): the
//!   desired job list and the ordered run list
//! - **Sessions** ([`session`]): results, discovery log, checkpoint and resume
//! - **Execution** ([`execution`], [`orchestrator`]): the run loop and the
//!   local subprocess controller
//!
//! # Example
//!
//! ```no_run
//! use checkplan::execution::{ExecutionContext, LocalController};
//! use checkplan::orchestrator::Orchestrator;
//! use checkplan::provider::{Provider, load_catalogue};
//! use checkplan::qualifier::SelectionSource;
//! use checkplan::report::ConsoleReporter;
//! use checkplan::session::{SessionMetadata, SessionRepository, SessionState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let providers = vec![Provider::new("com.example", "units")];
//!     let (catalogue, _problems) = load_catalogue(&providers)?;
//!
//!     let storage = SessionRepository::new("/tmp/sessions").create()?;
//!     let mut session = SessionState::new(catalogue, SessionMetadata::new(None));
//!     session.select(SelectionSource::TestPlan { id: "com.example::smoke".into() })?;
//!
//!     let ctx = ExecutionContext::for_session(&storage).with_providers(&providers);
//!     let mut orchestrator = Orchestrator::new(
//!         session,
//!         storage,
//!         LocalController::new(),
//!         ConsoleReporter::new(false),
//!         ctx,
//!     );
//!     let summary = orchestrator.run().await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod config;
pub mod execution;
pub mod orchestrator;
pub mod provider;
pub mod qualifier;
pub mod report;
pub mod resolver;
pub mod resource;
pub mod rfc822;
pub mod session;
pub mod template;
pub mod unit;

pub use config::{Config, load_config};
pub use execution::{ExecutionController, LocalController};
pub use orchestrator::{Orchestrator, RunSummary};
pub use report::Reporter;
pub use session::{SessionState, SessionStorage};
pub use unit::{Unit, UnitCatalogue};
