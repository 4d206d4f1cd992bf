//! Interceptor (middleware) chain.
//!
//! One generic chain serves both flavors: a [`Session`](crate::Session)
//! chain produces one [`Response`](crate::Response), a
//! [`MultiDriver`](crate::MultiDriver) chain produces a batch. Interceptors run
//! in registration order, the first registered being outermost. Each one may
//! rewrite the target, call [`Chain::proceed`] at most once, post-process the
//! result, or return without proceeding to short-circuit everything below it.

use std::sync::Arc;

use crate::error::{Error, Result};

/// Something an interceptor chain can wrap.
pub trait Target {
    type Output;

    /// The real work, run when the innermost interceptor proceeds.
    fn terminal(&mut self) -> Result<Self::Output>;
}

pub trait Interceptor<T: Target>: Send + Sync {
    fn intercept(&self, chain: &mut Chain<'_, T>) -> Result<T::Output>;
}

struct FnInterceptor<F>(F);

impl<T, F> Interceptor<T> for FnInterceptor<F>
where
    T: Target,
    F: Fn(&mut Chain<'_, T>) -> Result<T::Output> + Send + Sync,
{
    fn intercept(&self, chain: &mut Chain<'_, T>) -> Result<T::Output> {
        (self.0)(chain)
    }
}

/// Progress of a chain run.
///
/// Inside an interceptor, [`Chain::state`] is `Running` until it proceeds.
/// [`InterceptorChain::run_with_state`] reports how the whole run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Running,
    /// `proceed()` was called; for a whole run, the target was reached.
    Completed,
    /// An interceptor returned without proceeding, so the target never ran.
    ShortCircuited,
}

/// View of the chain handed to one interceptor.
pub struct Chain<'a, T: Target> {
    target: &'a mut T,
    rest: &'a [Arc<dyn Interceptor<T>>],
    state: ChainState,
    /// How the interceptors below ended, once proceeded.
    below: Option<ChainState>,
}

impl<T: Target> Chain<'_, T> {
    pub fn target(&mut self) -> &mut T {
        &mut *self.target
    }

    /// Run the remaining interceptors and then the target itself.
    ///
    /// A second call fails with [`Error::InvalidArgument`].
    pub fn proceed(&mut self) -> Result<T::Output> {
        if self.state == ChainState::Completed {
            return Err(Error::invalid("proceed() may only be called once per interceptor"));
        }
        self.state = ChainState::Completed;
        let (output, below) = run_from(&mut *self.target, self.rest);
        self.below = Some(below);
        output
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn has_proceeded(&self) -> bool {
        self.state == ChainState::Completed
    }

    /// Interceptors still below this one.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

fn run_from<T: Target>(
    target: &mut T,
    interceptors: &[Arc<dyn Interceptor<T>>],
) -> (Result<T::Output>, ChainState) {
    let Some((first, rest)) = interceptors.split_first() else {
        return (target.terminal(), ChainState::Completed);
    };
    let mut chain = Chain {
        target,
        rest,
        state: ChainState::Running,
        below: None,
    };
    let output = first.intercept(&mut chain);
    let state = chain.below.unwrap_or_else(|| {
        tracing::debug!(skipped = rest.len(), "Interceptor short-circuited the chain");
        ChainState::ShortCircuited
    });
    (output, state)
}

/// Ordered list of interceptors for targets of type `T`.
pub struct InterceptorChain<T: Target> {
    interceptors: Vec<Arc<dyn Interceptor<T>>>,
}

impl<T: Target> Default for InterceptorChain<T> {
    fn default() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }
}

impl<T: Target> Clone for InterceptorChain<T> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<T: Target> std::fmt::Debug for InterceptorChain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl<T: Target> InterceptorChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, interceptor: impl Interceptor<T> + 'static) {
        self.interceptors.push(Arc::new(interceptor));
    }

    pub fn add_shared(&mut self, interceptor: Arc<dyn Interceptor<T>>) {
        self.interceptors.push(interceptor);
    }

    pub fn add_fn<F>(&mut self, f: F)
    where
        F: Fn(&mut Chain<'_, T>) -> Result<T::Output> + Send + Sync + 'static,
        T: 'static,
    {
        self.interceptors.push(Arc::new(FnInterceptor(f)));
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `target` through every interceptor. An empty chain calls the
    /// target directly.
    pub fn run(&self, target: &mut T) -> Result<T::Output> {
        self.run_with_state(target).0
    }

    /// Like [`run`](Self::run), also reporting whether the target was
    /// reached ([`ChainState::Completed`]) or some interceptor answered in
    /// its place ([`ChainState::ShortCircuited`]).
    pub fn run_with_state(&self, target: &mut T) -> (Result<T::Output>, ChainState) {
        run_from(target, &self.interceptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counter {
        value: i32,
        terminal_calls: usize,
    }

    impl Target for Counter {
        type Output = i32;

        fn terminal(&mut self) -> Result<i32> {
            self.terminal_calls += 1;
            Ok(self.value)
        }
    }

    struct Log {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Interceptor<Counter> for Log {
        fn intercept(&self, chain: &mut Chain<'_, Counter>) -> Result<i32> {
            self.calls.lock().unwrap().push(format!("{} before", self.name));
            let out = chain.proceed();
            self.calls.lock().unwrap().push(format!("{} after", self.name));
            out
        }
    }

    #[test]
    fn empty_chain_calls_target() {
        let chain = InterceptorChain::new();
        let mut target = Counter {
            value: 4,
            ..Default::default()
        };
        assert_eq!(chain.run(&mut target), Ok(4));
        assert_eq!(target.terminal_calls, 1);
    }

    #[test]
    fn first_registered_runs_outermost() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.add(Log {
            name: "outer",
            calls: Arc::clone(&calls),
        });
        chain.add(Log {
            name: "inner",
            calls: Arc::clone(&calls),
        });

        chain.run(&mut Counter::default()).unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            ["outer before", "inner before", "inner after", "outer after"]
        );
    }

    #[test]
    fn interceptors_rewrite_target_and_result() {
        let mut chain = InterceptorChain::new();
        chain.add_fn(|chain: &mut Chain<'_, Counter>| {
            chain.target().value = 10;
            chain.proceed().map(|v| v * 2)
        });
        chain.add_fn(|chain: &mut Chain<'_, Counter>| chain.proceed().map(|v| v + 1));

        assert_eq!(chain.run(&mut Counter::default()), Ok(22));
    }

    #[test]
    fn short_circuit_skips_the_rest() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.add_fn(|_: &mut Chain<'_, Counter>| Ok(-1));
        chain.add(Log {
            name: "never",
            calls: Arc::clone(&calls),
        });

        let mut target = Counter::default();
        assert_eq!(chain.run(&mut target), Ok(-1));
        assert_eq!(target.terminal_calls, 0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn second_proceed_is_rejected() {
        let mut chain = InterceptorChain::new();
        chain.add_fn(|chain: &mut Chain<'_, Counter>| {
            assert_eq!(chain.state(), ChainState::Running);
            let first = chain.proceed()?;
            assert!(chain.has_proceeded());
            chain.proceed().map(|second| first + second)
        });

        let mut target = Counter::default();
        assert!(matches!(
            chain.run(&mut target),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(target.terminal_calls, 1);
    }

    #[test]
    fn chain_reports_remaining_depth() {
        let depths = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        for _ in 0..3 {
            let depths = Arc::clone(&depths);
            chain.add_fn(move |chain: &mut Chain<'_, Counter>| {
                depths.lock().unwrap().push(chain.remaining());
                chain.proceed()
            });
        }
        chain.run(&mut Counter::default()).unwrap();
        assert_eq!(*depths.lock().unwrap(), [2, 1, 0]);
    }

    #[test]
    fn run_reports_how_the_chain_ended() {
        let mut chain = InterceptorChain::new();
        assert_eq!(
            chain.run_with_state(&mut Counter::default()),
            (Ok(0), ChainState::Completed)
        );

        chain.add_fn(|chain: &mut Chain<'_, Counter>| chain.proceed());
        let mut target = Counter::default();
        assert_eq!(chain.run_with_state(&mut target), (Ok(0), ChainState::Completed));

        // The outer interceptor proceeds; the inner one answers by itself.
        chain.add_fn(|_: &mut Chain<'_, Counter>| Ok(9));
        assert_eq!(
            chain.run_with_state(&mut target),
            (Ok(9), ChainState::ShortCircuited)
        );
        assert_eq!(target.terminal_calls, 1);
    }
}
