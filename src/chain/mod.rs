//! Interceptor chain composition.
//!
//! Both the subscribe and publish paths are built the same way: an ordered
//! list of interceptors is folded around a terminal handler (or publisher)
//! once, producing a single immutable pipeline.

mod handler;
mod interceptor;

pub use handler::{
    handler_fn, publisher_fn, HandlerFn, MessageHandler, MessagePublisher, PublisherFn,
    SharedHandler, SharedPublisher,
};
pub use interceptor::{
    compose, interceptor_fn, publish_interceptor_fn, InterceptorFn, PublishChain,
    PublishInterceptor, PublishInterceptorFn, SharedPublishInterceptor,
    SharedSubscriptionInterceptor, SubscriptionChain, SubscriptionInterceptor,
};
