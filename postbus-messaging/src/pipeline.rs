//! Consumer-side middleware around handler invocation.
//!
//! Stages run onion-style in registration order: the first stage added is
//! the outermost. A stage that returns without calling `next` stops the
//! chain, the handler included.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{Span, SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use postbus_telemetry::attributes::{
    MESSAGING_CONSUMER_ID, MESSAGING_DESTINATION_NAME, MESSAGING_OPERATION,
    MESSAGING_RABBITMQ_ROUTING_KEY, message_attributes,
};
use postbus_telemetry::finish_span;
use tracing::{debug, trace, warn};

use crate::context::ConsumeContext;
use crate::error::HandlerError;
use crate::message::DynMessage;

/// Boxed future returned by pipeline continuations.
pub type PipelineFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// Continuation running the rest of the chain.
pub type Next = Box<dyn FnOnce(ConsumeContext<dyn DynMessage>) -> PipelineFuture + Send>;

/// Terminal call at the end of the chain.
pub type HandlerFn =
    Arc<dyn Fn(ConsumeContext<dyn DynMessage>) -> PipelineFuture + Send + Sync>;

/// A cross-cutting stage wrapped around handler invocation.
#[async_trait]
pub trait ConsumerPipeline: Send + Sync {
    async fn handle(
        &self,
        ctx: ConsumeContext<dyn DynMessage>,
        next: Next,
    ) -> Result<(), HandlerError>;
}

/// Ordered pipeline stages.
#[derive(Clone, Default)]
pub struct PipelineChain {
    stages: Arc<Vec<Arc<dyn ConsumerPipeline>>>,
}

impl PipelineChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracing, logging and validation, outermost first.
    pub fn standard(tracer: Arc<BoxedTracer>) -> Self {
        let mut chain = Self::new();
        chain.push(TracingPipeline::new(tracer));
        chain.push(LoggingPipeline);
        chain.push(ValidationPipeline);
        chain
    }

    /// Add a stage inside the ones already registered.
    pub fn push<P: ConsumerPipeline + 'static>(&mut self, stage: P) {
        self.push_arc(Arc::new(stage));
    }

    pub fn push_arc(&mut self, stage: Arc<dyn ConsumerPipeline>) {
        let mut stages = (*self.stages).clone();
        stages.push(stage);
        self.stages = Arc::new(stages);
    }

    /// Chain of `self` followed by `inner`.
    pub fn then(&self, inner: &PipelineChain) -> Self {
        let mut stages = (*self.stages).clone();
        stages.extend(inner.stages.iter().cloned());
        Self {
            stages: Arc::new(stages),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the chain around `handler`.
    pub fn execute(
        &self,
        ctx: ConsumeContext<dyn DynMessage>,
        handler: HandlerFn,
    ) -> PipelineFuture {
        self.execute_from(0, ctx, handler)
    }

    fn execute_from(
        &self,
        index: usize,
        ctx: ConsumeContext<dyn DynMessage>,
        handler: HandlerFn,
    ) -> PipelineFuture {
        if index >= self.stages.len() {
            trace!("Pipeline complete, calling handler");
            handler(ctx)
        } else {
            let stage = self.stages[index].clone();
            let chain = self.clone();

            trace!(stage_index = index, "Executing pipeline stage");
            Box::pin(async move {
                stage
                    .handle(
                        ctx,
                        Box::new(move |ctx| chain.execute_from(index + 1, ctx, handler)),
                    )
                    .await
            })
        }
    }
}

/// Opens a consumer span, child of the producer span carried in the
/// delivery headers.
pub struct TracingPipeline {
    tracer: Arc<BoxedTracer>,
}

impl TracingPipeline {
    pub fn new(tracer: Arc<BoxedTracer>) -> Self {
        Self { tracer }
    }
}

#[async_trait]
impl ConsumerPipeline for TracingPipeline {
    async fn handle(
        &self,
        ctx: ConsumeContext<dyn DynMessage>,
        next: Next,
    ) -> Result<(), HandlerError> {
        let parent = if ctx.span_context().is_valid() {
            Context::new().with_remote_span_context(ctx.span_context().clone())
        } else {
            Context::new()
        };

        let correlation_id = ctx.correlation_id();
        let mut attributes =
            message_attributes(ctx.message_type(), ctx.message_id(), Some(correlation_id));
        attributes.push(KeyValue::new(MESSAGING_OPERATION, "process"));
        attributes.push(KeyValue::new(
            MESSAGING_DESTINATION_NAME,
            ctx.exchange().to_string(),
        ));
        attributes.push(KeyValue::new(
            MESSAGING_RABBITMQ_ROUTING_KEY,
            ctx.routing_key().to_string(),
        ));
        attributes.push(KeyValue::new(MESSAGING_CONSUMER_ID, ctx.queue().to_string()));

        let span = self.tracer.build_with_context(
            self.tracer
                .span_builder(format!("{} process", ctx.message_type()))
                .with_kind(SpanKind::Consumer)
                .with_attributes(attributes),
            &parent,
        );

        let child = ctx.with_span_context(span.span_context().clone());
        let result = next(child).await;
        finish_span(span, &result);
        result
    }
}

/// Logs start, completion and failure of every handler call.
pub struct LoggingPipeline;

#[async_trait]
impl ConsumerPipeline for LoggingPipeline {
    async fn handle(
        &self,
        ctx: ConsumeContext<dyn DynMessage>,
        next: Next,
    ) -> Result<(), HandlerError> {
        let message_type = ctx.message_type().to_string();
        let message_id = ctx.message_id().to_string();
        let start = Instant::now();

        debug!(
            message_type = %message_type,
            message_id = %message_id,
            redelivered = ctx.redelivered(),
            "Handling message"
        );

        let result = next(ctx).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => debug!(
                message_type = %message_type,
                message_id = %message_id,
                elapsed_ms,
                "Message handled"
            ),
            Err(e) => warn!(
                message_type = %message_type,
                message_id = %message_id,
                elapsed_ms,
                error = %e,
                "Message handler failed"
            ),
        }

        result
    }
}

/// Rejects messages whose `validate` fails without calling the handler.
pub struct ValidationPipeline;

#[async_trait]
impl ConsumerPipeline for ValidationPipeline {
    async fn handle(
        &self,
        ctx: ConsumeContext<dyn DynMessage>,
        next: Next,
    ) -> Result<(), HandlerError> {
        if let Err(e) = ctx.message().run_validation() {
            warn!(
                message_type = %ctx.message_type(),
                message_id = %ctx.message_id(),
                error = %e,
                "Message failed validation"
            );
            return Err(Box::new(e));
        }
        next(ctx).await
    }
}
