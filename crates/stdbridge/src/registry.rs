//! Worker-side handler registry.
//!
//! Maps function names to type-erased handlers. Argument conversion happens
//! in the adapter closures built by [`Handler::from_sync`] and
//! [`Handler::from_async`], so the dispatch loop only ever deals in strings.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;

/// Boxed future for async handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type HandlerResult = Result<String, HandlerError>;

type SyncFn = dyn Fn(Vec<String>) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(Vec<String>) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// Why a handler produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("argument {index} ({value:?}) is invalid: {reason}")]
    InvalidArgument {
        index: usize,
        value: String,
        reason: String,
    },

    #[error("handler panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Runs inline on the dispatch loop.
    Sync,
    /// Spawned as its own task per call.
    Async,
}

/// A registered function, with its context already bound.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl Handler {
    /// Adapt a synchronous function.
    ///
    /// Each argument is parsed as `A`; the first failure becomes
    /// [`HandlerError::InvalidArgument`]. `context` is cloned into every call.
    pub fn from_sync<A, T, C, F>(function: F, context: Option<C>) -> Self
    where
        A: FromStr,
        A::Err: Display,
        T: ToString,
        C: Clone + Send + Sync + 'static,
        F: Fn(Vec<A>, Option<C>) -> T + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(move |args: Vec<String>| -> HandlerResult {
            let parsed = parse_args::<A>(args)?;
            Ok(function(parsed, context.clone()).to_string())
        }))
    }

    /// Adapt an async function taking raw string arguments.
    pub fn from_async<T, C, F, Fut>(function: F, context: Option<C>) -> Self
    where
        T: ToString,
        C: Clone + Send + Sync + 'static,
        F: Fn(Vec<String>, Option<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Handler::Async(Arc::new(
            move |args: Vec<String>| -> BoxFuture<'static, HandlerResult> {
                let fut = function(args, context.clone());
                Box::pin(async move { Ok(fut.await.to_string()) })
            },
        ))
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Sync(_) => HandlerKind::Sync,
            Handler::Async(_) => HandlerKind::Async,
        }
    }

    /// Run a sync handler on the current thread, catching panics.
    ///
    /// Returns `None` for async handlers.
    pub fn call_sync(&self, args: Vec<String>) -> Option<HandlerResult> {
        match self {
            Handler::Sync(function) => Some(run_sync(function.as_ref(), args)),
            Handler::Async(_) => None,
        }
    }

    /// Future running the handler to completion, catching panics.
    ///
    /// Sync handlers run eagerly, before the future is returned.
    pub fn invoke(&self, args: Vec<String>) -> BoxFuture<'static, HandlerResult> {
        match self {
            Handler::Sync(function) => {
                let result = run_sync(function.as_ref(), args);
                Box::pin(async move { result })
            }
            Handler::Async(function) => {
                let function = Arc::clone(function);
                Box::pin(async move {
                    // Constructing the future may itself panic.
                    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| function(args))) {
                        Ok(fut) => fut,
                        Err(payload) => return Err(HandlerError::Panicked(panic_message(payload))),
                    };
                    AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload))))
                })
            }
        }
    }
}

fn run_sync(function: &SyncFn, args: Vec<String>) -> HandlerResult {
    std::panic::catch_unwind(AssertUnwindSafe(|| function(args)))
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload))))
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

fn parse_args<A>(args: Vec<String>) -> Result<Vec<A>, HandlerError>
where
    A: FromStr,
    A::Err: Display,
{
    args.into_iter()
        .enumerate()
        .map(|(index, value)| {
            value.parse::<A>().map_err(|e| HandlerError::InvalidArgument {
                index,
                reason: e.to_string(),
                value,
            })
        })
        .collect()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Name → handler table owned by one worker bridge.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handler` under `name`, returning the handler it replaced.
    pub fn insert(&self, name: &str, handler: Handler) -> Option<Handler> {
        let kind = handler.kind();
        let previous = self.handlers.insert(name.to_string(), handler);
        if previous.is_some() {
            tracing::debug!(name, ?kind, "Handler replaced");
        } else {
            tracing::debug!(name, ?kind, "Handler registered");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(params: Vec<i64>, _: Option<()>) -> i64 {
        params.iter().sum()
    }

    async fn find_longer(params: Vec<String>, context: Option<&'static str>) -> String {
        assert_eq!(context, Some("passed through"));
        if params[0].len() > params[1].len() {
            return params[0].clone();
        }
        params[1].clone()
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn sync_handler_parses_arguments() {
        let handler = Handler::from_sync(add, None);
        assert_eq!(handler.kind(), HandlerKind::Sync);
        assert_eq!(handler.call_sync(args(&["10", "20"])), Some(Ok("30".to_string())));
    }

    #[test]
    fn sync_handler_reports_bad_argument() {
        let handler = Handler::from_sync(add, None);
        let result = handler.call_sync(args(&["10", "twenty"])).unwrap();
        assert!(matches!(
            result,
            Err(HandlerError::InvalidArgument { index: 1, ref value, .. }) if value == "twenty"
        ));
    }

    #[test]
    fn sync_handler_receives_context() {
        let handler = Handler::from_sync(
            |params: Vec<String>, prefix: Option<String>| {
                format!("{}{}", prefix.unwrap_or_default(), params.join(","))
            },
            Some("ctx:".to_string()),
        );
        assert_eq!(handler.call_sync(args(&["a", "b"])), Some(Ok("ctx:a,b".to_string())));
    }

    #[test]
    fn sync_panic_is_caught() {
        let handler = Handler::from_sync(
            |_: Vec<String>, _: Option<()>| -> String { panic!("kaboom") },
            None,
        );
        assert_eq!(
            handler.call_sync(vec![]),
            Some(Err(HandlerError::Panicked("kaboom".to_string())))
        );
    }

    #[tokio::test]
    async fn async_handler_runs_with_context() {
        let handler = Handler::from_async(find_longer, Some("passed through"));
        assert_eq!(handler.kind(), HandlerKind::Async);
        assert_eq!(handler.call_sync(vec![]), None);
        assert_eq!(
            handler.invoke(args(&["foo", "longer_foo"])).await,
            Ok("longer_foo".to_string())
        );
    }

    #[tokio::test]
    async fn async_panic_is_caught() {
        let handler = Handler::from_async(
            |_: Vec<String>, _: Option<()>| async move {
                if true {
                    panic!("async kaboom");
                }
                0
            },
            None,
        );
        assert_eq!(
            handler.invoke(vec![]).await,
            Err(HandlerError::Panicked("async kaboom".to_string()))
        );
    }

    #[tokio::test]
    async fn invoke_runs_sync_handlers_too() {
        let handler = Handler::from_sync(add, None);
        assert_eq!(handler.invoke(args(&["1", "2", "3"])).await, Ok("6".to_string()));
    }

    #[test]
    fn reregistering_replaces_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.insert("f", Handler::from_sync(add, None)).is_none());
        let replaced = registry.insert(
            "f",
            Handler::from_sync(|_: Vec<String>, _: Option<()>| "second", None),
        );
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);

        let handler = registry.get("f").unwrap();
        assert_eq!(handler.call_sync(args(&["1"])), Some(Ok("second".to_string())));
    }

    #[test]
    fn names_are_sorted() {
        let registry = HandlerRegistry::new();
        registry.insert("b", Handler::from_sync(add, None));
        registry.insert("a", Handler::from_sync(add, None));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert!(!registry.contains("c"));
        assert!(registry.get("c").is_none());
    }
}
