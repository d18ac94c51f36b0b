//! Sequential step pipeline with short-circuit error and cancel semantics.
//!
//! A pipeline is an ordered list of async steps sharing a caller-supplied
//! scratch context. Each step receives the context and the previous step's
//! error (if any) and resolves to one of:
//!
//! - [`StepOutcome::Continue`]: proceed, clearing any carried error,
//! - [`StepOutcome::ContinueWith`]: proceed, handing the error to the next
//!   step for inspection,
//! - [`StepOutcome::Skip`]: abort the remainder and surface the error
//!   (`None` means "skip without failing").
//!
//! The executor owns advancing state: it checks the run's [`CancelToken`]
//! before every step and races each step against it, so a step suspended on
//! timers or device I/O is abandoned at its next await point once the run is
//! cancelled. Cleanup for suspended work is expressed with [`CleanupGuard`]
//! values that fire exactly once, on whichever path ends the step.
//!
//! Sub-pipelines are ordinary pipelines over their own context type and do
//! not leak scratch state into the parent.

use crate::broker::CancelToken;
use crate::error::RunError;
use futures::future::BoxFuture;

/// What a step decided about the rest of the pipeline.
#[derive(Debug)]
pub enum StepOutcome {
    /// Continue normally to the next step.
    Continue,
    /// Continue, but let the next step observe this error.
    ContinueWith(RunError),
    /// Abort the remainder, surfacing the error if any.
    Skip(Option<RunError>),
}

/// Boxed pipeline step.
pub type BoxStep<C> =
    Box<dyn for<'a> FnMut(&'a mut C, Option<&'a RunError>) -> BoxFuture<'a, StepOutcome> + Send>;

pub struct Pipeline<C> {
    steps: Vec<BoxStep<C>>,
}

impl<C: Send> Default for Pipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send> Pipeline<C> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Append a step. Steps run in insertion order.
    pub fn step<F>(mut self, step: F) -> Self
    where
        F: for<'a> FnMut(&'a mut C, Option<&'a RunError>) -> BoxFuture<'a, StepOutcome>
            + Send
            + 'static,
    {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Drive the pipeline to completion.
    ///
    /// Returns the surfaced error, or `None` on clean completion or a silent
    /// skip. An error still carried when the steps run out surfaces as if the
    /// last step had skipped with it.
    pub async fn run(mut self, ctx: &mut C, cancel: &CancelToken) -> Option<RunError> {
        let mut carried: Option<RunError> = None;

        for step in self.steps.iter_mut() {
            if cancel.is_cancelled() {
                return Some(RunError::cancelled());
            }

            let fut = step(ctx, carried.as_ref());
            let outcome = tokio::select! {
                outcome = fut => outcome,
                _ = cancel.cancelled() => StepOutcome::Skip(Some(RunError::cancelled())),
            };

            match outcome {
                StepOutcome::Continue => carried = None,
                StepOutcome::ContinueWith(err) => carried = Some(err),
                StepOutcome::Skip(err) => return err,
            }
        }

        carried
    }
}

/// Runs a closure exactly once, on drop or on an explicit [`fire`](Self::fire).
///
/// Used by suspended pipeline steps to register cleanup (stop a timer, cancel
/// a subscription) that must run regardless of which path terminates the
/// step: success, failure or cancellation.
pub struct CleanupGuard {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl CleanupGuard {
    pub fn new<F: FnOnce() + Send + 'static>(cleanup: F) -> Self {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Run the cleanup now. Later calls and the drop are no-ops.
    pub fn fire(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }

    /// Forget the cleanup without running it.
    pub fn disarm(&mut self) {
        self.cleanup = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::cancel_pair;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Ctx {
        trace: Vec<&'static str>,
    }

    fn unreachable_step<'a>(
        ctx: &'a mut Ctx,
        _prev: Option<&'a RunError>,
    ) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            ctx.trace.push("unreachable");
            StepOutcome::Continue
        })
    }

    fn step_a<'a>(ctx: &'a mut Ctx, _prev: Option<&'a RunError>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            ctx.trace.push("a");
            StepOutcome::Continue
        })
    }

    fn skip_with_error<'a>(
        ctx: &'a mut Ctx,
        _prev: Option<&'a RunError>,
    ) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            ctx.trace.push("skip");
            StepOutcome::Skip(Some(RunError::code("BOOM")))
        })
    }

    fn carry_error<'a>(ctx: &'a mut Ctx, _prev: Option<&'a RunError>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            ctx.trace.push("carry");
            StepOutcome::ContinueWith(RunError::code("SOFT"))
        })
    }

    fn forward_prev<'a>(ctx: &'a mut Ctx, prev: Option<&'a RunError>) -> BoxFuture<'a, StepOutcome> {
        let prev = prev.cloned();
        Box::pin(async move {
            ctx.trace.push("forward");
            match prev {
                Some(err) => StepOutcome::Skip(Some(err)),
                None => StepOutcome::Continue,
            }
        })
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let (_handle, token) = cancel_pair();
        let mut ctx = Ctx::default();
        let pipeline = Pipeline::new().step(step_a).step(step_a);
        let err = pipeline.run(&mut ctx, &token).await;
        assert!(err.is_none());
        assert_eq!(ctx.trace, vec!["a", "a"]);
    }

    #[tokio::test]
    async fn skip_aborts_remainder_and_surfaces_error() {
        let (_handle, token) = cancel_pair();
        let mut ctx = Ctx::default();
        let pipeline = Pipeline::new()
            .step(step_a)
            .step(skip_with_error)
            .step(unreachable_step);

        let err = pipeline.run(&mut ctx, &token).await;
        assert_eq!(err.unwrap().code, "BOOM");
        assert_eq!(ctx.trace, vec!["a", "skip"]);
    }

    #[tokio::test]
    async fn carried_error_reaches_next_step() {
        let (_handle, token) = cancel_pair();
        let mut ctx = Ctx::default();
        let pipeline = Pipeline::new().step(carry_error).step(forward_prev);
        let err = pipeline.run(&mut ctx, &token).await;
        assert_eq!(err.unwrap().code, "SOFT");
        assert_eq!(ctx.trace, vec!["carry", "forward"]);
    }

    #[tokio::test]
    async fn carried_error_surfaces_at_pipeline_end() {
        let (_handle, token) = cancel_pair();
        let mut ctx = Ctx::default();
        let pipeline = Pipeline::new().step(carry_error);
        let err = pipeline.run(&mut ctx, &token).await;
        assert_eq!(err.unwrap().code, "SOFT");
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_a_step() {
        let (handle, token) = cancel_pair();
        handle.cancel();
        let mut ctx = Ctx::default();
        let pipeline = Pipeline::new().step(step_a);
        let err = pipeline.run(&mut ctx, &token).await;
        assert!(err.unwrap().is_cancelled());
        assert!(ctx.trace.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_a_suspended_step() {
        fn sleepy<'a>(ctx: &'a mut Ctx, _prev: Option<&'a RunError>) -> BoxFuture<'a, StepOutcome> {
            Box::pin(async move {
                ctx.trace.push("before");
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ctx.trace.push("after");
                StepOutcome::Continue
            })
        }

        let (handle, token) = cancel_pair();
        let mut ctx = Ctx::default();
        let err = {
            let run = Pipeline::new().step(sleepy).run(&mut ctx, &token);
            tokio::pin!(run);

            // Give the step a chance to reach its sleep, then cancel.
            tokio::select! {
                biased;
                _ = &mut run => panic!("step must still be suspended"),
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }
            handle.cancel();

            run.await
        };
        assert!(err.unwrap().is_cancelled());
        assert_eq!(ctx.trace, vec!["before"]);
    }

    #[test]
    fn cleanup_guard_fires_exactly_once() {
        let count = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&count);
        let mut guard = CleanupGuard::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        guard.fire();
        guard.fire();
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarmed_guard_never_fires() {
        let count = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&count);
        let mut guard = CleanupGuard::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        guard.disarm();
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
