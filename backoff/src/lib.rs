//! Retry helpers shared across the relay. [strategy] yields the sleep durations between attempts,
//! [retry::Retry] drives an [Operation] until it succeeds, the [Condition] rejects the error, or
//! the strategy runs dry.

use std::future::Future;

pub mod retry;
pub mod strategy;

/// An operation that can be attempted more than once. Every call to [Operation::run] must start a
/// fresh attempt.
pub trait Operation {
    type Future: Future<Output = Result<Self::Item, Self::Error>>;
    type Item;
    type Error;

    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    T: Future<Output = Result<I, E>>,
    F: FnMut() -> T,
{
    type Future = T;
    type Item = I;
    type Error = E;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether an error is worth another attempt.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}
