//! Runs per-repository scripts in response to GitHub webhooks.
//!
//! A [`Pipeliner`] serves a webhook endpoint, verifies each delivery's
//! `X-Hub-Signature-256`, and maps pushes, pull requests, merges, releases,
//! and new branches and tags onto [`EventKind`]. For each event it runs
//! `{scripts_path}/{organization}/{repository}/{event}.sh` (and the configured
//! interpreter's script) one webhook at a time, in arrival order.

pub mod config;
pub mod emitter;
pub mod error;
pub mod logging;
pub mod notify;
pub mod pipeliner;
pub mod queue;
pub mod script;
pub mod signature;
pub mod webhook;

pub use config::PipelinerConfig;
pub use emitter::{Channel, EventEmitter, PipelineEvent};
pub use error::{PipelinerError, Result};
pub use notify::{LogNotifier, Notifier, NotifyError};
pub use pipeliner::{Pipeliner, PipelinerState};
pub use queue::SequentialQueue;
pub use script::{Interpreter, ScriptDispatcher, ScriptError, ScriptResult};
pub use webhook::{ClassifiedEvent, EventData, EventKind, WebhookRequest, classify};
