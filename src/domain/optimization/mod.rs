pub mod canary;
pub mod direct;
pub mod state;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::config::FailureMode;
use crate::core::client::controllers::Controller;
use crate::core::resources::settings::{Adjustment, Component};
use crate::errors::{Error, Result};

/// The agent-side binding of a configured target to its runtime state and
/// mutation operations.
///
/// `adjust` records mutations against the local wrapper only; `apply`
/// commits them to the cluster and waits for convergence. `handle_error`
/// runs the operator-selected recovery and reports whether the error was
/// handled: `Ok(true)` swallows it (ignore mode), `Ok(false)` means the
/// recovery ran but the original error must still propagate. Recovery
/// failures are logged by the handler and never replace the original error.
#[async_trait]
pub trait Optimization: Send + Sync {
    /// The component name, stable for the lifetime of the optimization.
    fn name(&self) -> &str;

    fn controller(&self) -> &Controller;

    fn container_name(&self) -> &str;

    /// The optimizer-facing description of this target's tunables.
    fn to_components(&self) -> Vec<Component>;

    /// Record a mutation on the local wrapper. No cluster I/O.
    fn adjust(&mut self, adjustment: &Adjustment) -> Result<()>;

    /// Commit pending mutations to the cluster and wait for convergence.
    async fn apply(&mut self) -> Result<()>;

    /// The target is ready and has not restarted since the baseline.
    async fn is_ready(&self) -> Result<bool>;

    async fn rollback(&mut self, error: Option<&Error>) -> Result<()>;

    async fn destroy(&mut self, error: Option<&Error>) -> Result<()>;

    async fn handle_error(&mut self, error: &Error, mode: FailureMode) -> Result<bool>;
}

/// The general failure-mode dispatch shared by the strategies. Strategies
/// with specialized recovery (the canary) intercept the modes they redefine
/// and fall through to this for the rest.
pub(crate) async fn dispatch_failure<O>(
    optimization: &mut O,
    error: &Error,
    mode: FailureMode,
) -> Result<bool>
where
    O: Optimization + ?Sized,
{
    match mode {
        FailureMode::Crash => {
            error!(
                "an unrecoverable failure occurred while interacting with Kubernetes: {error}"
            );
            Ok(false)
        }
        FailureMode::Ignore => {
            warn!("ignoring runtime error and continuing: {error}");
            Ok(true)
        }
        FailureMode::Rollback => {
            if let Err(recovery_error) = optimization.rollback(Some(error)).await {
                error!("rollback failed with unrecoverable error: {recovery_error}");
            }
            Ok(false)
        }
        FailureMode::Destroy => {
            if let Err(recovery_error) = optimization.destroy(Some(error)).await {
                error!("destroy failed with unrecoverable error: {recovery_error}");
            }
            Ok(false)
        }
    }
}
