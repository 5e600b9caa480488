//! Worker boundary for node bodies
//!
//! Each body runs on its own worker. The worker always delivers exactly one
//! outcome, converting a panic into a `Panicked` failure. A worker that is
//! dropped before it can deliver (for example because the thread could not
//! be spawned) surfaces as a closed channel, which the receiver treats as a
//! panic too.

use futures::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::oneshot;
use tracing::{error, trace};

use crate::context::SpecContext;
use crate::models::{Body, BodyResult, CodeLocation, Failure, NodeBody, SpecState};
use crate::suite::panic_message;

pub(crate) type Outcome = (SpecState, Failure);

/// Start `body` and return the channel its outcome arrives on
pub(crate) fn spawn_body(body: NodeBody, ctx: SpecContext) -> oneshot::Receiver<Outcome> {
    let (tx, rx) = oneshot::channel();
    match body {
        Body::Blocking(f) => spawn_thread(move || f(()), tx),
        Body::BlockingWithContext(f) => spawn_thread(move || f(ctx, ()), tx),
        Body::Async(f) => {
            tokio::spawn(async move {
                let result = AssertUnwindSafe(async move { f(ctx, ()).await })
                    .catch_unwind()
                    .await;
                // The executor may have stopped listening after a timeout.
                let _ = tx.send(outcome_from(result));
            });
        }
    }
    rx
}

fn spawn_thread<F>(run: F, tx: oneshot::Sender<Outcome>)
where
    F: FnOnce() -> BodyResult + Send + 'static,
{
    let spawned = std::thread::Builder::new()
        .name("spec-node".to_string())
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(run));
            let _ = tx.send(outcome_from(result));
            trace!("node worker finished");
        });
    if let Err(e) = spawned {
        error!("Failed to spawn node worker: {}", e);
    }
}

fn outcome_from(result: std::thread::Result<BodyResult>) -> Outcome {
    match result {
        Ok(Ok(())) => (SpecState::Passed, Failure::default()),
        Ok(Err(err)) => (
            err.state(),
            Failure {
                message: err.message().to_string(),
                location: err.location().clone(),
                ..Default::default()
            },
        ),
        Err(payload) => panicked(Some(panic_message(payload.as_ref()))),
    }
}

/// Failure for a body that panicked or never reported back
pub(crate) fn panicked(payload: Option<String>) -> Outcome {
    (
        SpecState::Panicked,
        Failure {
            message: "Test Panicked".to_string(),
            location: CodeLocation::caller().with_stack_trace(),
            forwarded_panic: Some(
                payload.unwrap_or_else(|| "node worker exited without reporting".to_string()),
            ),
            ..Default::default()
        },
    )
}
