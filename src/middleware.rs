// Copyright 2020 The Exonum Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Middleware: wrappers around the call dispatch.
//!
//! Middleware is registered before `start` and composed once into a
//! single handler: the first registered wrapper becomes the outermost.
//! Every call (local or remote, user-initiated or arriving from a peer)
//! flows through the composed chain. A wrapper may short-circuit, retry,
//! transform parameters or results, and it sees errors on the way out,
//! but it must preserve the error kind it propagates.

use futures::future::BoxFuture;

use std::sync::Arc;

use crate::{context::Context, errors::BrokerError};

/// Result of a call.
pub type CallResult = Result<serde_json::Value, BrokerError>;

/// Future of a call result.
pub type CallFuture = BoxFuture<'static, CallResult>;

/// A call handler: the innermost one dispatches to the endpoint, outer
/// ones are produced by middleware wrapping.
pub type CallHandler = Arc<dyn Fn(Context) -> CallFuture + Send + Sync>;

/// A middleware wraps the next handler of the chain and returns the
/// handler replacing it.
pub trait Middleware: Send + Sync {
    /// Wraps the next handler.
    fn wrap(&self, next: CallHandler) -> CallHandler;
}

/// Middleware built from a plain function over handlers.
pub struct FnMiddleware<F>(F);

impl<F> FnMiddleware<F>
where
    F: Fn(CallHandler) -> CallHandler + Send + Sync,
{
    /// Wraps a `Fn(next) -> handler` closure as a middleware.
    pub fn new(wrap: F) -> Self {
        Self(wrap)
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(CallHandler) -> CallHandler + Send + Sync,
{
    fn wrap(&self, next: CallHandler) -> CallHandler {
        (self.0)(next)
    }
}

/// Composes the registered middleware around the base dispatch handler.
/// Registration order is preserved: the first registered middleware is
/// the first to see the context.
pub(crate) fn compose(middlewares: &[Arc<dyn Middleware>], base: CallHandler) -> CallHandler {
    middlewares
        .iter()
        .rev()
        .fold(base, |next, middleware| middleware.wrap(next))
}
