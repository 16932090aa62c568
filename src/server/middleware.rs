//! Onion-style middleware around request handling.
//!
//! Each middleware receives the mutable [`MiddlewareContext`] and a [`Next`] continuation.
//! Calling `next.run(ctx).await` runs the rest of the chain and finally the handler; code after
//! that call sees `ctx.response`. A middleware may also return an error without calling
//! `next`, which becomes the response.
//!
//! ```
//! use mcp_server_rs::server::{McpServer, ServerOptions};
//!
//! let server = McpServer::new(ServerOptions::new("demo", "0.1.0"));
//! server.use_middleware(|ctx, next| {
//!     Box::pin(async move {
//!         let started = std::time::Instant::now();
//!         next.run(ctx).await?;
//!         tracing::info!(method = %ctx.method, elapsed = ?started.elapsed(), "handled");
//!         Ok(())
//!     })
//! });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::protocol::RequestId;
use crate::store::SessionId;
use crate::types::AuthInfo;
use crate::Error;

/// Per-request state shared by every middleware and the handler.
#[derive(Debug)]
pub struct MiddlewareContext {
    pub method: String,
    pub params: Value,
    pub request_id: RequestId,
    pub session_id: Option<SessionId>,
    pub auth: Option<AuthInfo>,
    /// Scratch space for passing values between middleware.
    pub state: HashMap<String, Value>,
    /// The handler's outcome, set once the chain reaches it.
    pub response: Option<Result<Value, Error>>,
    executed: bool,
}

impl MiddlewareContext {
    pub(crate) fn new(
        method: String,
        params: Value,
        request_id: RequestId,
        session_id: Option<SessionId>,
        auth: Option<AuthInfo>,
    ) -> Self {
        Self {
            method,
            params,
            request_id,
            session_id,
            auth,
            state: HashMap::new(),
            response: None,
            executed: false,
        }
    }

    /// Whether the handler was reached.
    pub fn executed(&self) -> bool {
        self.executed
    }

    pub(crate) fn complete(&mut self, outcome: Result<Value, Error>) {
        self.executed = true;
        self.response = Some(outcome);
    }
}

pub type MiddlewareFn = Arc<
    dyn for<'a> Fn(&'a mut MiddlewareContext, Next<'a>) -> BoxFuture<'a, Result<(), Error>>
        + Send
        + Sync,
>;

/// Boxes a closure as a [`MiddlewareFn`], fixing its higher-ranked signature.
pub fn middleware_fn<F>(f: F) -> MiddlewareFn
where
    F: for<'a> Fn(&'a mut MiddlewareContext, Next<'a>) -> BoxFuture<'a, Result<(), Error>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// The innermost step of a chain.
pub(crate) trait Terminal: Send + Sync {
    fn call<'a>(&'a self, ctx: &'a mut MiddlewareContext) -> BoxFuture<'a, Result<(), Error>>;
}

/// Continuation handed to each middleware.
pub struct Next<'a> {
    chain: &'a [MiddlewareFn],
    index: usize,
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [MiddlewareFn], terminal: &'a dyn Terminal) -> Self {
        Self {
            chain,
            index: 0,
            terminal,
        }
    }

    /// Runs the remaining middleware and then the handler.
    pub fn run<'b>(self, ctx: &'b mut MiddlewareContext) -> BoxFuture<'b, Result<(), Error>>
    where
        'a: 'b,
    {
        match self.chain.get(self.index) {
            Some(layer) => layer(
                ctx,
                Next {
                    chain: self.chain,
                    index: self.index + 1,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.call(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Echo;

    impl Terminal for Echo {
        fn call<'a>(&'a self, ctx: &'a mut MiddlewareContext) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async move {
                let params = ctx.params.clone();
                ctx.complete(Ok(params));
                Ok(())
            })
        }
    }

    fn ctx() -> MiddlewareContext {
        MiddlewareContext::new(
            "tools/call".into(),
            serde_json::json!({"n": 1}),
            RequestId::Number(1),
            None,
            None,
        )
    }

    fn recording(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> MiddlewareFn {
        middleware_fn(move |ctx, next| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(format!("{name}:before"));
                next.run(ctx).await?;
                log.lock().push(format!("{name}:after"));
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn runs_in_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![recording(log.clone(), "outer"), recording(log.clone(), "inner")];
        let mut c = ctx();
        Next::new(&chain, &Echo).run(&mut c).await.unwrap();
        assert!(c.executed());
        assert_eq!(
            *log.lock(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn skipping_next_leaves_handler_unexecuted() {
        let chain: Vec<MiddlewareFn> = vec![middleware_fn(|_ctx, _next| Box::pin(async { Ok(()) }))];
        let mut c = ctx();
        Next::new(&chain, &Echo).run(&mut c).await.unwrap();
        assert!(!c.executed());
        assert!(c.response.is_none());
    }

    #[tokio::test]
    async fn middleware_can_rewrite_params() {
        let chain: Vec<MiddlewareFn> = vec![middleware_fn(|ctx, next| {
            Box::pin(async move {
                ctx.params = serde_json::json!({"n": 2});
                next.run(ctx).await
            })
        })];
        let mut c = ctx();
        Next::new(&chain, &Echo).run(&mut c).await.unwrap();
        assert_eq!(c.response.unwrap().unwrap()["n"], 2);
    }
}
