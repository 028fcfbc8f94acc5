//! The per-delivery [`Middleware`] chain and its "auto-next" runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::message::Message;

/// A boxed, owned future, used so the middleware continuation can be stored in a
/// `Mutex<Option<_>>` and taken out exactly once.
type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A single layer of per-delivery processing.
///
/// A middleware may:
/// - inspect or decorate `message` and call `next.call()` to continue the chain,
///   propagating whatever `next.call()` returns;
/// - handle the message itself (ack/nack/reply it) and return without calling `next`,
///   short-circuiting the rest of the chain *and* the user handler;
/// - do neither (just return `Ok(())` without touching `message` or calling `next`),
///   in which case the runtime calls `next` on the middleware's behalf once this
///   `handle` future settles. `next` runs at most once per layer; a second call is a
///   no-op (logged).
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Processes `message`, optionally continuing the chain via `next`.
    async fn handle(&self, message: Message, next: Next) -> Result<()>;
}

/// Blanket impl so a plain async closure can be used as a [`Middleware`] without a
/// wrapper type.
#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(Message, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Message, next: Next) -> Result<()> {
        self(message, next).await
    }
}

/// The state shared between a [`Next`] handle and the driver that constructed it: the
/// continuation to run, and whether it has been consumed yet.
struct NextState {
    called: AtomicBool,
    continuation: Mutex<Option<BoxFuture>>,
}

impl NextState {
    async fn take_and_run(&self) -> Result<()> {
        let fut = self.continuation.lock().expect("next mutex poisoned").take();
        match fut {
            Some(fut) => fut.await,
            // Either already consumed, or this was the terminal layer with nothing left.
            None => Ok(()),
        }
    }
}

/// A handle a [`Middleware`] uses to continue the chain.
///
/// Calling `next.call()` more than once per layer is a no-op after the first call (an
/// explicitly open question in the source design, resolved here: subsequent calls are
/// logged via `tracing::warn!` and otherwise ignored, rather than erroring).
pub struct Next {
    state: Arc<NextState>,
}

impl Next {
    fn new(continuation: BoxFuture) -> (Self, Arc<NextState>) {
        let state = Arc::new(NextState {
            called: AtomicBool::new(false),
            continuation: Mutex::new(Some(continuation)),
        });
        (Self { state: Arc::clone(&state) }, state)
    }

    /// Continues the chain, running the next middleware (or the chain's terminal, if
    /// this was the last layer). Returns whatever the rest of the chain returns.
    pub async fn call(&self) -> Result<()> {
        if self.state.called.swap(true, Ordering::AcqRel) {
            warn!("next() called more than once in a single middleware layer, ignoring");
            return Ok(());
        }
        self.state.take_and_run().await
    }
}

/// Runs the full middleware chain against `message`, starting at `middlewares[0]`.
///
/// Implements the per-delivery pipeline's middleware step: declaration order,
/// automatic `next` invocation for middleware that doesn't call it and doesn't hand
/// the message itself, and short-circuit on error or on an already-handled message.
pub(crate) async fn run_chain(message: Message, middlewares: Arc<[Arc<dyn Middleware>]>) -> Result<()> {
    run_chain_from(message, middlewares, 0).await
}

fn run_chain_from(
    message: Message,
    middlewares: Arc<[Arc<dyn Middleware>]>,
    index: usize,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let Some(mw) = middlewares.get(index).cloned() else {
            // Past the last layer: the terminal of the chain does nothing. The
            // consumer pipeline invokes the user handler itself once the chain as a
            // whole returns successfully.
            return Ok(());
        };

        let rest_message = message.clone();
        let rest_middlewares = Arc::clone(&middlewares);
        let continuation: BoxFuture =
            Box::pin(async move { run_chain_from(rest_message, rest_middlewares, index + 1).await });
        let (next, next_state) = Next::new(continuation);

        let result = mw.handle(message.clone(), next).await;

        if result.is_err() {
            // Error short-circuits regardless of whether `next` ran: if it did, this
            // is the downstream error surfacing through `?`; if it didn't, the layer
            // itself failed before continuing.
            return result;
        }

        if next_state.called.load(Ordering::Acquire) {
            // The middleware already drove the rest of the chain itself; `result` is
            // that chain's outcome.
            return result;
        }

        if message.is_handled() {
            debug!("middleware short-circuited without calling next()");
            return Ok(());
        }

        // The middleware neither called `next` nor handled the message: auto-advance.
        next_state.take_and_run().await
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use lapin::options::BasicConsumeOptions;
    use lapin::protocol::basic::AMQPProperties;
    use lapin::types::ShortString;
    use lapin::{acker::Acker, message::Delivery};

    use super::*;

    fn test_message() -> Message {
        let delivery = Delivery {
            delivery_tag: 1,
            exchange: ShortString::from(""),
            routing_key: ShortString::from("rk"),
            redelivered: false,
            properties: AMQPProperties::default(),
            data: b"{}".to_vec(),
            acker: Acker::default(),
        };
        let _ = BasicConsumeOptions::default();
        Message::from_delivery(delivery, "queue".to_string(), "ctag".to_string(), true)
    }

    struct CallNext;
    #[async_trait]
    impl Middleware for CallNext {
        async fn handle(&self, _message: Message, next: Next) -> Result<()> {
            next.call().await
        }
    }

    struct Noop;
    #[async_trait]
    impl Middleware for Noop {
        async fn handle(&self, _message: Message, _next: Next) -> Result<()> {
            Ok(())
        }
    }

    struct ShortCircuit;
    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(&self, message: Message, _next: Next) -> Result<()> {
            message.ack().await
        }
    }

    struct Failing;
    #[async_trait]
    impl Middleware for Failing {
        async fn handle(&self, _message: Message, _next: Next) -> Result<()> {
            Err(crate::error::Error::config("boom"))
        }
    }

    #[tokio::test]
    async fn empty_chain_runs_to_completion() {
        let message = test_message();
        let middlewares: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![]);
        assert!(run_chain(message, middlewares).await.is_ok());
    }

    #[tokio::test]
    async fn middleware_without_next_call_auto_advances() {
        let reached = Arc::new(AtomicUsize::new(0));
        struct Counting(Arc<AtomicUsize>);
        #[async_trait]
        impl Middleware for Counting {
            async fn handle(&self, _message: Message, _next: Next) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let message = test_message();
        let middlewares: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![
            Arc::new(Noop) as Arc<dyn Middleware>,
            Arc::new(Counting(Arc::clone(&reached))) as Arc<dyn Middleware>,
        ]);
        assert!(run_chain(message, middlewares).await.is_ok());
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn explicit_next_call_reaches_downstream_layers() {
        let message = test_message();
        let middlewares: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![
            Arc::new(CallNext) as Arc<dyn Middleware>,
            Arc::new(CallNext) as Arc<dyn Middleware>,
        ]);
        assert!(run_chain(message, middlewares).await.is_ok());
    }

    #[tokio::test]
    async fn short_circuit_skips_downstream_layers() {
        let reached = Arc::new(AtomicUsize::new(0));
        struct Counting(Arc<AtomicUsize>);
        #[async_trait]
        impl Middleware for Counting {
            async fn handle(&self, _message: Message, _next: Next) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let message = test_message();
        let middlewares: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![
            Arc::new(ShortCircuit) as Arc<dyn Middleware>,
            Arc::new(Counting(Arc::clone(&reached))) as Arc<dyn Middleware>,
        ]);
        assert!(run_chain(message, middlewares).await.is_ok());
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_layer_short_circuits_with_error() {
        let message = test_message();
        let middlewares: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![Arc::new(Failing) as Arc<dyn Middleware>]);
        assert!(run_chain(message, middlewares).await.is_err());
    }

    #[tokio::test]
    async fn calling_next_twice_is_a_no_op_on_the_second_call() {
        struct CallTwice;
        #[async_trait]
        impl Middleware for CallTwice {
            async fn handle(&self, _message: Message, next: Next) -> Result<()> {
                next.call().await?;
                next.call().await
            }
        }

        let message = test_message();
        let middlewares: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![Arc::new(CallTwice) as Arc<dyn Middleware>]);
        assert!(run_chain(message, middlewares).await.is_ok());
    }
}
