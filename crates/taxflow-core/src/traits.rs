use futures::future::BoxFuture;

use crate::definition::{Action, NotificationConfig};
use crate::error::Result;
use crate::types::{ActionContext, ActionOutput, Notification};

/// Performs the work behind an action (remote call, transform, validation,
/// notification, manual-review gate).
///
/// Returning `TaxflowError::HandlerNotFound` aborts the stage without retry.
pub trait ActionExecutor: Send + Sync + 'static {
    fn execute(&self, action: Action, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>>;
}

/// Delivers escalation and notification events.
pub trait Notifier: Send + Sync + 'static {
    fn notify(
        &self,
        config: NotificationConfig,
        payload: Notification,
    ) -> BoxFuture<'_, Result<()>>;
}
