//! The single-item transformation executed by the task runner.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::error::ProcessError;

/// Result of processing one item.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The item was transformed and should be emitted.
    Kept(T),
    /// The item was intentionally filtered out.
    Dropped,
    /// Processing failed.
    Failed(ProcessError),
}

impl<T> Outcome<T> {
    /// Fails with a plain message.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Outcome::Failed(anyhow::anyhow!("{message}"))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Converts back to the `Result<Option<T>, _>` shape.
    pub fn into_result(self) -> Result<Option<T>, ProcessError> {
        match self {
            Outcome::Kept(item) => Ok(Some(item)),
            Outcome::Dropped => Ok(None),
            Outcome::Failed(e) => Err(e),
        }
    }
}

impl<T, E> From<Result<Option<T>, E>> for Outcome<T>
where
    E: Into<ProcessError>,
{
    fn from(result: Result<Option<T>, E>) -> Self {
        match result {
            Ok(Some(item)) => Outcome::Kept(item),
            Ok(None) => Outcome::Dropped,
            Err(e) => Outcome::Failed(e.into()),
        }
    }
}

/// Transforms one item.
///
/// Implementations are shared by every worker of a run, so `process` takes
/// `&self` and must be safe to call concurrently. Failures are reported
/// through [`Outcome::Failed`] and never abort the worker itself.
#[async_trait]
pub trait Processor<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn process(&self, item: &T) -> Outcome<T>;

    /// Name used in log output.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A [`Processor`] backed by an async closure.
pub struct FnProcessor<F, T> {
    func: F,
    _item: PhantomData<fn(T) -> T>,
}

/// Adapts an async closure into a [`Processor`].
///
/// The closure receives an owned clone of each item and may return anything
/// convertible into an [`Outcome`], such as `anyhow::Result<Option<T>>`.
///
/// ```
/// use convoforge::task::{processor_fn, Outcome};
///
/// let double = processor_fn(|n: u64| async move { Outcome::Kept(n * 2) });
/// # let _ = double;
/// ```
pub fn processor_fn<F, Fut, O, T>(func: F) -> FnProcessor<F, T>
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = O> + Send,
    O: Into<Outcome<T>>,
    T: Clone + Send + Sync + 'static,
{
    FnProcessor {
        func,
        _item: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, O, T> Processor<T> for FnProcessor<F, T>
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = O> + Send,
    O: Into<Outcome<T>>,
    T: Clone + Send + Sync + 'static,
{
    async fn process(&self, item: &T) -> Outcome<T> {
        (self.func)(item.clone()).await.into()
    }

    fn name(&self) -> &str {
        "fn"
    }
}
