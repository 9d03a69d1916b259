use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// An attempt is either in flight or we are waiting out the delay before the next one.
#[pin_project(project = AttemptProj)]
enum Attempt<O>
where
    O: Operation,
{
    InFlight(#[pin] O::Future),
    CoolingOff(#[pin] Sleep),
}

/// Future that re-runs `operation` with the delays yielded by `backoff` for as long as
/// `condition` accepts the error. When the delays run out the last error is returned.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    attempt: Attempt<O>,
    backoff: I,
    operation: O,
    condition: C,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            attempt: Attempt::InFlight(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
        }
    }

    /// Arms the sleep for the next delay, or hands the error back once the backoff is spent.
    fn schedule_next(mut self: Pin<&mut Self>, err: O::Error) -> Result<(), O::Error> {
        let mut this = self.as_mut().project();
        let Some(delay) = this.backoff.next() else {
            return Err(err);
        };
        this.attempt
            .set(Attempt::CoolingOff(sleep_until(Instant::now() + delay)));
        Ok(())
    }

    fn start_attempt(self: Pin<&mut Self>) {
        let mut this = self.project();
        let future = this.operation.run();
        this.attempt.set(Attempt::InFlight(future));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project().attempt.project() {
                AttemptProj::InFlight(fut) => match fut.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(e)) => {
                        if !self.as_mut().project().condition.can_retry(&e) {
                            return Poll::Ready(Err(e));
                        }
                        if let Err(e) = self.as_mut().schedule_next(e) {
                            return Poll::Ready(Err(e));
                        }
                    }
                },
                AttemptProj::CoolingOff(sleep) => match sleep.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => self.as_mut().start_attempt(),
                },
            }
        }
    }
}
