//! Consumer handler trait.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::context::ConsumeContext;
use crate::error::HandlerError;
use crate::message::Message;

/// Application code invoked for every delivery of `M`.
///
/// Returning an error makes the consumer retry the call; once retries are
/// exhausted the delivery is nacked and requeued.
#[async_trait]
pub trait ConsumerHandler<M: Message>: Send + Sync {
    async fn handle(&self, ctx: &ConsumeContext<M>) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure.
pub struct FnHandler<M, F> {
    f: F,
    _message: PhantomData<fn(M)>,
}

/// Wrap an async closure as a [`ConsumerHandler`].
///
/// ```
/// use postbus_messaging::{handler_fn, ConsumeContext, ConsumerHandler, MessageBase, impl_message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct Ping {
///     #[serde(flatten)]
///     base: MessageBase,
/// }
/// impl_message!(Ping);
///
/// let handler = handler_fn(|ctx: ConsumeContext<Ping>| async move {
///     tracing::info!(redelivered = ctx.redelivered(), "ping");
///     Ok(())
/// });
/// fn assert_handler<H: ConsumerHandler<Ping>>(_: &H) {}
/// assert_handler(&handler);
/// ```
pub fn handler_fn<M, F, Fut>(f: F) -> FnHandler<M, F>
where
    M: Message,
    F: Fn(ConsumeContext<M>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<M, F, Fut> ConsumerHandler<M> for FnHandler<M, F>
where
    M: Message,
    F: Fn(ConsumeContext<M>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &ConsumeContext<M>) -> Result<(), HandlerError> {
        (self.f)(ctx.clone()).await
    }
}
