use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::job::{TaskId, Tick};

static INIT: Once = Once::new();

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Later calls are no-ops, as is a call after another subscriber was installed.
pub fn init_tracing(default_filter: &str) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init();
    });
}

/// Span carrying the task and tick of a run
#[must_use]
pub fn task_span(task_id: &TaskId, tick: Tick, worker_id: &str) -> Span {
    tracing::info_span!(
        "task",
        task_id = %task_id,
        tick = tick.0,
        worker = worker_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("debug");
        init_tracing("info");
        let span = task_span(&TaskId::merge_dimension("customers"), Tick(3), "w1");
        let _guard = span.enter();
        tracing::info!("inside task span");
    }
}
