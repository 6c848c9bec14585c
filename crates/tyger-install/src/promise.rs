//! Single-assignment promises for provisioning steps
//!
//! A [`Promise`] starts its action on a Tokio task as soon as it is created and
//! registers itself in a [`PromiseGroup`]. The result is written exactly once,
//! by that task, and every later [`Promise::wait`] observes the same value.
//!
//! Dependencies are declared with [`Promise::after`]: the wrapped action first
//! waits for each prerequisite in order and resolves to
//! [`InstallError::DependencyFailed`] without running if any of them failed.

use crate::error::{InstallError, Result};
use crate::group::PromiseGroup;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A promise with its result type erased
#[async_trait]
pub trait Awaitable: Send + Sync {
    /// Wait for the step to finish and keep only its error
    async fn wait_err(&self) -> Result<()>;
}

/// Type-erased handle used to declare a dependency or fill a group
pub type Dependency = Arc<dyn Awaitable>;

/// Observable state of a promise
///
/// There is no separate "start" call: a promise is running from the moment it
/// is constructed. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Running,
    Succeeded,
    Failed,
    /// A prerequisite failed, so the action never ran
    ShortCircuited,
}

impl std::fmt::Display for PromiseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromiseState::Running => write!(f, "running"),
            PromiseState::Succeeded => write!(f, "succeeded"),
            PromiseState::Failed => write!(f, "failed"),
            PromiseState::ShortCircuited => write!(f, "short-circuited"),
        }
    }
}

/// Handle to the eventual result of one provisioning action
///
/// Cloning the handle is cheap; all clones observe the same result.
pub struct Promise<T> {
    outcome: watch::Receiver<Option<Result<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            outcome: self.outcome.clone(),
        }
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start `action` on its own task and register the promise in `group`
    ///
    /// The action receives a clone of `token`; cancelling it is the only way to
    /// stop an action that is already running. The task inherits the caller's
    /// tracing span.
    pub fn new<F, Fut>(token: &CancellationToken, group: &mut PromiseGroup, action: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let token = token.clone();

        tokio::spawn(
            async move {
                let result = action(token).await;
                tx.send_replace(Some(result));
            }
            .instrument(tracing::Span::current()),
        );

        let promise = Self { outcome: rx };
        group.push(promise.as_dependency());
        promise
    }

    /// Like [`Promise::new`], but `action` only runs once every dependency succeeded
    ///
    /// Dependencies are awaited in order. The first failure resolves this promise
    /// to [`InstallError::DependencyFailed`] and `action` is dropped unrun.
    /// Dependencies are not re-checked after `action` starts.
    pub fn after<F, Fut>(
        token: &CancellationToken,
        group: &mut PromiseGroup,
        action: F,
        dependencies: Vec<Dependency>,
    ) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::new(token, group, move |token| async move {
            for dependency in &dependencies {
                if dependency.wait_err().await.is_err() {
                    return Err(InstallError::DependencyFailed);
                }
            }

            action(token).await
        })
    }

    /// Wait for the action to finish and return its result
    pub async fn wait(&self) -> Result<T> {
        self.observe(|result| result.clone()).await?
    }

    /// Wait for a prerequisite's value
    ///
    /// Any failure is reported as [`InstallError::DependencyFailed`], since the
    /// promise that failed is responsible for surfacing its own error.
    pub async fn wait_as_dependency(&self) -> Result<T> {
        self.wait()
            .await
            .map_err(|_| InstallError::DependencyFailed)
    }

    pub fn as_dependency(&self) -> Dependency {
        Arc::new(self.clone())
    }
}

impl<T> Promise<T> {
    pub fn state(&self) -> PromiseState {
        let closed = self.outcome.has_changed().is_err();
        match &*self.outcome.borrow() {
            None if closed => PromiseState::Failed,
            None => PromiseState::Running,
            Some(Ok(_)) => PromiseState::Succeeded,
            Some(Err(InstallError::DependencyFailed)) => PromiseState::ShortCircuited,
            Some(Err(_)) => PromiseState::Failed,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.state() != PromiseState::Running
    }

    async fn observe<R>(&self, read: impl FnOnce(&Result<T>) -> R) -> Result<R> {
        let mut outcome = self.outcome.clone();
        let resolved = match outcome.wait_for(Option::is_some).await {
            Ok(guard) => (*guard).as_ref().map(read),
            Err(_) => None,
        };
        resolved.ok_or(InstallError::Abandoned)
    }
}

#[async_trait]
impl<T> Awaitable for Promise<T>
where
    T: Send + Sync + 'static,
{
    async fn wait_err(&self) -> Result<()> {
        self.observe(|result| match result {
            Ok(_) => Ok(()),
            Err(err) => Err(err.clone()),
        })
        .await?
    }
}
