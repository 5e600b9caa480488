//! Node bodies and body outcomes
//!
//! A body is the code a node runs. Bodies come in three flavours: blocking
//! bodies that cannot observe cancellation, blocking bodies that receive a
//! [`SpecContext`], and async bodies that receive a [`SpecContext`].

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use super::node::CodeLocation;
use super::report::{Report, SpecReport, SpecState};
use crate::context::SpecContext;
use crate::suite::{Suite, SuiteError};

/// Outcome returned by a node body
pub type BodyResult = Result<(), BodyError>;

/// Ways a body can end other than passing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error("{message}")]
    Fail {
        message: String,
        location: CodeLocation,
    },

    #[error("{message}")]
    Skip {
        message: String,
        location: CodeLocation,
    },

    #[error("{message}")]
    Abort {
        message: String,
        location: CodeLocation,
    },
}

impl BodyError {
    #[track_caller]
    pub fn fail(message: impl Into<String>) -> Self {
        BodyError::Fail {
            message: message.into(),
            location: CodeLocation::caller(),
        }
    }

    #[track_caller]
    pub fn skip(message: impl Into<String>) -> Self {
        BodyError::Skip {
            message: message.into(),
            location: CodeLocation::caller(),
        }
    }

    /// Fail the running spec and skip every remaining spec in the suite
    #[track_caller]
    pub fn abort_suite(message: impl Into<String>) -> Self {
        BodyError::Abort {
            message: message.into(),
            location: CodeLocation::caller(),
        }
    }

    pub fn state(&self) -> SpecState {
        match self {
            BodyError::Fail { .. } => SpecState::Failed,
            BodyError::Skip { .. } => SpecState::Skipped,
            BodyError::Abort { .. } => SpecState::Aborted,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            BodyError::Fail { message, .. }
            | BodyError::Skip { message, .. }
            | BodyError::Abort { message, .. } => message,
        }
    }

    pub fn location(&self) -> &CodeLocation {
        match self {
            BodyError::Fail { location, .. }
            | BodyError::Skip { location, .. }
            | BodyError::Abort { location, .. } => location,
        }
    }
}

impl From<anyhow::Error> for BodyError {
    #[track_caller]
    fn from(err: anyhow::Error) -> Self {
        BodyError::Fail {
            message: format!("{err:#}"),
            location: CodeLocation::caller(),
        }
    }
}

/// Function taking an input and producing an output, optionally with a context
pub enum Body<I, O> {
    Blocking(Arc<dyn Fn(I) -> Result<O, BodyError> + Send + Sync>),
    BlockingWithContext(Arc<dyn Fn(SpecContext, I) -> Result<O, BodyError> + Send + Sync>),
    Async(Arc<dyn Fn(SpecContext, I) -> BoxFuture<'static, Result<O, BodyError>> + Send + Sync>),
}

impl<I, O> Clone for Body<I, O> {
    fn clone(&self) -> Self {
        match self {
            Body::Blocking(f) => Body::Blocking(f.clone()),
            Body::BlockingWithContext(f) => Body::BlockingWithContext(f.clone()),
            Body::Async(f) => Body::Async(f.clone()),
        }
    }
}

/// Body of an ordinary node
pub type NodeBody = Body<(), ()>;
/// Proc-1 segment of a synchronized before-suite node; returns the payload to broadcast
pub type DataBody = Body<(), Vec<u8>>;
/// All-processes segment of a synchronized before-suite node; receives the payload
pub type PayloadBody = Body<Vec<u8>, ()>;

pub type ContainerBody = Arc<dyn Fn(&mut Suite) -> Result<(), SuiteError> + Send + Sync>;
pub type ReportEachBody = Arc<dyn Fn(SpecReport) -> BodyResult + Send + Sync>;
pub type ReportAfterSuiteBody = Arc<dyn Fn(Report) -> BodyResult + Send + Sync>;

impl<I, O> Body<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn has_context(&self) -> bool {
        !matches!(self, Body::Blocking(_))
    }

    /// Fix the input and store the output in `sink`, producing a plain node body
    pub fn bind(self, input: I, sink: Arc<Mutex<Option<O>>>) -> NodeBody {
        match self {
            Body::Blocking(f) => Body::Blocking(Arc::new(move |()| {
                let out = f(input.clone())?;
                *sink.lock() = Some(out);
                Ok(())
            })),
            Body::BlockingWithContext(f) => Body::BlockingWithContext(Arc::new(move |ctx, ()| {
                let out = f(ctx, input.clone())?;
                *sink.lock() = Some(out);
                Ok(())
            })),
            Body::Async(f) => Body::Async(Arc::new(move |ctx, ()| {
                let fut = f(ctx, input.clone());
                let sink = sink.clone();
                async move {
                    let out = fut.await?;
                    *sink.lock() = Some(out);
                    Ok(())
                }
                .boxed()
            })),
        }
    }
}

impl Body<(), ()> {
    /// Body that cannot observe cancellation
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn() -> BodyResult + Send + Sync + 'static,
    {
        Body::Blocking(Arc::new(move |()| f()))
    }

    /// Blocking body that can poll [`SpecContext::is_cancelled`]
    pub fn blocking_with_context<F>(f: F) -> Self
    where
        F: Fn(SpecContext) -> BodyResult + Send + Sync + 'static,
    {
        Body::BlockingWithContext(Arc::new(move |ctx, ()| f(ctx)))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(SpecContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BodyResult> + Send + 'static,
    {
        Body::Async(Arc::new(move |ctx, ()| f(ctx).boxed()))
    }
}

impl Body<(), Vec<u8>> {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn() -> Result<Vec<u8>, BodyError> + Send + Sync + 'static,
    {
        Body::Blocking(Arc::new(move |()| f()))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(SpecContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, BodyError>> + Send + 'static,
    {
        Body::Async(Arc::new(move |ctx, ()| f(ctx).boxed()))
    }
}

impl Body<Vec<u8>, ()> {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Vec<u8>) -> BodyResult + Send + Sync + 'static,
    {
        Body::Blocking(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(SpecContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BodyResult> + Send + 'static,
    {
        Body::Async(Arc::new(move |ctx, data| f(ctx, data).boxed()))
    }
}
