//! Scheduler and clock seams.
//!
//! Every delay the orchestrator takes (backoff waits, per-attempt timeouts,
//! replay pacing) goes through a [`Sleeper`], and every timestamp (cache
//! freshness, latency) through a [`Clock`]. Tests swap both for fakes.

use std::future::Future;
use std::time::Duration;

/// Boxed future used at the crate's dynamic seams.
///
/// On native targets the future is `Send`. On WASM, reqwest futures wrap the
/// browser Fetch API and are not `Send`, so the alias is the local variant.
#[cfg(not(target_arch = "wasm32"))]
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type BoxFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;

/// Suspends for a duration.
pub trait Sleeper: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Millisecond time source.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::{SystemClock, TokioSleeper};
#[cfg(target_arch = "wasm32")]
pub use wasm::{JsClock, JsSleeper};

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::time::{Duration, Instant};

    use super::{BoxFuture, Clock, Sleeper};

    #[derive(Clone, Copy, Debug, Default)]
    pub struct TokioSleeper;

    impl Sleeper for TokioSleeper {
        fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
            Box::pin(tokio::time::sleep(duration))
        }
    }

    /// Monotonic clock counting from its construction.
    #[derive(Clone, Copy, Debug)]
    pub struct SystemClock {
        origin: Instant,
    }

    impl Default for SystemClock {
        fn default() -> Self {
            Self {
                origin: Instant::now(),
            }
        }
    }

    impl Clock for SystemClock {
        fn now_ms(&self) -> u64 {
            u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
        }
    }
}

#[cfg(target_arch = "wasm32")]
mod wasm {
    use std::time::Duration;

    use wasm_bindgen::{JsCast, JsValue};

    use super::{BoxFuture, Clock, Sleeper};

    /// Sleeps through the host's global `setTimeout`.
    ///
    /// Works in browsers and in edge runtimes that expose `setTimeout` on the
    /// global object. Without it the sleep resolves immediately.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct JsSleeper;

    impl Sleeper for JsSleeper {
        fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
            let millis = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
            let promise = js_sys::Promise::new(&mut |resolve, _reject| {
                let global = js_sys::global();
                let set_timeout = js_sys::Reflect::get(&global, &JsValue::from_str("setTimeout"))
                    .ok()
                    .and_then(|value| value.dyn_into::<js_sys::Function>().ok());
                match set_timeout {
                    Some(set_timeout) => {
                        let _ = set_timeout.call2(&global, &resolve, &JsValue::from(millis));
                    }
                    None => {
                        let _ = resolve.call0(&JsValue::UNDEFINED);
                    }
                }
            });
            Box::pin(async move {
                let _ = wasm_bindgen_futures::JsFuture::from(promise).await;
            })
        }
    }

    /// Wall clock backed by `Date.now()`.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct JsClock;

    impl Clock for JsClock {
        fn now_ms(&self) -> u64 {
            js_sys::Date::now() as u64
        }
    }
}

/// Default sleeper for the current target.
pub fn default_sleeper() -> std::sync::Arc<dyn Sleeper> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        std::sync::Arc::new(TokioSleeper)
    }
    #[cfg(target_arch = "wasm32")]
    {
        std::sync::Arc::new(JsSleeper)
    }
}

/// Default clock for the current target.
pub fn default_clock() -> std::sync::Arc<dyn Clock> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        std::sync::Arc::new(SystemClock::default())
    }
    #[cfg(target_arch = "wasm32")]
    {
        std::sync::Arc::new(JsClock)
    }
}

/// Runs `future` in the background on the current target's executor.
///
/// Native targets require a running tokio runtime.
#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn spawn<F>(future: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future)
}

#[cfg(target_arch = "wasm32")]
pub(crate) fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future)
}
