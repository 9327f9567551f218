//! MayaUSD proxy-stage core
//!
//! Proxy shape nodes that resolve a USD stage inside a pull-evaluated
//! dependency graph, the notice plumbing that tells the rest of the
//! application what changed on those stages, and the bridges that keep
//! scene items, locked layers and render indices in step.

pub mod config;
pub mod draw;
pub mod error;
pub mod host;
pub mod hydra;
pub mod layers;
pub mod listener;
pub mod nodes;
pub mod proxy_shape;
pub(crate) mod sync;
pub mod ufe;
pub mod usd;

pub use config::MayaUsdConfig;
pub use error::{ConfigError, DgError, MayaUsdError, Result, UsdError};
pub use host::PluginHost;
pub use listener::{classify_objects_changed, ChangeType, StageNoticeListener};

/// Set up `env_logger` with `filter` unless `RUST_LOG` says otherwise.
/// Later calls are no-ops.
pub fn init_logging(filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .try_init();
}
