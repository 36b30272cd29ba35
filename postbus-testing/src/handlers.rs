//! Fake consumer handlers.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use postbus_messaging::{ConsumeContext, ConsumerHandler, HandlerError, Message, Metadata};

/// Handler recording every message it receives.
///
/// Clones share the recording, so keep one clone for assertions and hand
/// the other to the consumer.
pub struct FakeHandler<M> {
    handled: Arc<Mutex<Vec<(Arc<M>, Metadata)>>>,
    delay: Option<Duration>,
}

impl<M> Clone for FakeHandler<M> {
    fn clone(&self) -> Self {
        Self {
            handled: self.handled.clone(),
            delay: self.delay,
        }
    }
}

impl<M> Default for FakeHandler<M> {
    fn default() -> Self {
        Self {
            handled: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }
}

impl<M> FakeHandler<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before recording each message.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn is_handled(&self) -> bool {
        !self.handled.lock().is_empty()
    }

    pub fn handled_count(&self) -> usize {
        self.handled.lock().len()
    }

    pub fn messages(&self) -> Vec<Arc<M>> {
        self.handled.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn metadata(&self) -> Vec<Metadata> {
        self.handled.lock().iter().map(|(_, md)| md.clone()).collect()
    }
}

#[async_trait]
impl<M: Message> ConsumerHandler<M> for FakeHandler<M> {
    async fn handle(&self, ctx: &ConsumeContext<M>) -> Result<(), HandlerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.handled
            .lock()
            .push((ctx.message_arc(), ctx.metadata().clone()));
        Ok(())
    }
}

/// Handler that fails a configurable number of times.
pub struct FailingHandler<M> {
    failures: Option<u32>,
    calls: Arc<AtomicU32>,
    redelivered: Arc<AtomicU32>,
    _message: PhantomData<fn(M)>,
}

impl<M> Clone for FailingHandler<M> {
    fn clone(&self) -> Self {
        Self {
            failures: self.failures,
            calls: self.calls.clone(),
            redelivered: self.redelivered.clone(),
            _message: PhantomData,
        }
    }
}

impl<M> FailingHandler<M> {
    /// Fails every call.
    pub fn always() -> Self {
        Self::with_failures(None)
    }

    /// Fails the first `n` calls, then succeeds.
    pub fn times(n: u32) -> Self {
        Self::with_failures(Some(n))
    }

    fn with_failures(failures: Option<u32>) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU32::new(0)),
            redelivered: Arc::new(AtomicU32::new(0)),
            _message: PhantomData,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls made for deliveries flagged as redelivered.
    pub fn redelivered_calls(&self) -> u32 {
        self.redelivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<M: Message> ConsumerHandler<M> for FailingHandler<M> {
    async fn handle(&self, ctx: &ConsumeContext<M>) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if ctx.redelivered() {
            self.redelivered.fetch_add(1, Ordering::SeqCst);
        }
        match self.failures {
            Some(n) if call > n => Ok(()),
            _ => Err(format!("call {} failed", call).into()),
        }
    }
}

/// Handler tracking how many calls run at the same time.
pub struct ConcurrencyProbe<M> {
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    _message: PhantomData<fn(M)>,
}

impl<M> Clone for ConcurrencyProbe<M> {
    fn clone(&self) -> Self {
        Self {
            delay: self.delay,
            in_flight: self.in_flight.clone(),
            max_in_flight: self.max_in_flight.clone(),
            completed: self.completed.clone(),
            _message: PhantomData,
        }
    }
}

impl<M> ConcurrencyProbe<M> {
    /// Every call takes `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
            _message: PhantomData,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<M: Message> ConsumerHandler<M> for ConcurrencyProbe<M> {
    async fn handle(&self, _ctx: &ConsumeContext<M>) -> Result<(), HandlerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `predicate` every 10ms until it holds or `timeout` elapses.
///
/// Returns whether the predicate held.
pub async fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
