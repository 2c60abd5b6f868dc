//! Interceptor traits and pipeline composition.
//!
//! A pipeline is built by folding interceptors right-to-left over a terminal
//! handler: for `[i0, i1, i2]` and `h` the result is `i0(i1(i2(h)))`. The first
//! registered interceptor is outermost: it runs first on the way in and last
//! on the way out, so it observes the final error and the total elapsed time.

use std::sync::Arc;

use super::handler::{SharedHandler, SharedPublisher};
use crate::types::SubscriptionInfo;

/// Wraps a subscription's message handler.
pub trait SubscriptionInterceptor: Send + Sync {
    fn intercept(&self, info: &SubscriptionInfo, next: SharedHandler) -> SharedHandler;
}

/// Wraps the publisher used for outgoing messages.
pub trait PublishInterceptor: Send + Sync {
    fn intercept(&self, next: SharedPublisher) -> SharedPublisher;
}

pub type SharedSubscriptionInterceptor = Arc<dyn SubscriptionInterceptor>;
pub type SharedPublishInterceptor = Arc<dyn PublishInterceptor>;

/// Fold `interceptors` around `terminal`, first element outermost.
pub fn compose<I, H>(interceptors: &[I], terminal: H, wrap: impl Fn(&I, H) -> H) -> H {
    interceptors
        .iter()
        .rev()
        .fold(terminal, |next, interceptor| wrap(interceptor, next))
}

/// Ordered subscription interceptors.
#[derive(Clone, Default)]
pub struct SubscriptionChain {
    interceptors: Vec<SharedSubscriptionInterceptor>,
}

impl SubscriptionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor. Earlier interceptors wrap later ones.
    pub fn with<I: SubscriptionInterceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_shared(mut self, interceptor: SharedSubscriptionInterceptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Compose the pipeline for one subscription.
    pub fn build(&self, info: &SubscriptionInfo, handler: SharedHandler) -> SharedHandler {
        compose(&self.interceptors, handler, |interceptor, next| {
            interceptor.intercept(info, next)
        })
    }
}

/// Ordered publish interceptors.
#[derive(Clone, Default)]
pub struct PublishChain {
    interceptors: Vec<SharedPublishInterceptor>,
}

impl PublishChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor. Earlier interceptors wrap later ones.
    pub fn with<I: PublishInterceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_shared(mut self, interceptor: SharedPublishInterceptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Compose the publish pipeline.
    pub fn build(&self, publisher: SharedPublisher) -> SharedPublisher {
        compose(&self.interceptors, publisher, |interceptor, next| {
            interceptor.intercept(next)
        })
    }
}

/// Subscription interceptor backed by a closure. Created by [`interceptor_fn`].
pub struct InterceptorFn<F> {
    f: F,
}

impl<F> SubscriptionInterceptor for InterceptorFn<F>
where
    F: Fn(&SubscriptionInfo, SharedHandler) -> SharedHandler + Send + Sync,
{
    fn intercept(&self, info: &SubscriptionInfo, next: SharedHandler) -> SharedHandler {
        (self.f)(info, next)
    }
}

pub fn interceptor_fn<F>(f: F) -> InterceptorFn<F>
where
    F: Fn(&SubscriptionInfo, SharedHandler) -> SharedHandler + Send + Sync,
{
    InterceptorFn { f }
}

/// Publish interceptor backed by a closure. Created by [`publish_interceptor_fn`].
pub struct PublishInterceptorFn<F> {
    f: F,
}

impl<F> PublishInterceptor for PublishInterceptorFn<F>
where
    F: Fn(SharedPublisher) -> SharedPublisher + Send + Sync,
{
    fn intercept(&self, next: SharedPublisher) -> SharedPublisher {
        (self.f)(next)
    }
}

pub fn publish_interceptor_fn<F>(f: F) -> PublishInterceptorFn<F>
where
    F: Fn(SharedPublisher) -> SharedPublisher + Send + Sync,
{
    PublishInterceptorFn { f }
}
