//! Process supervision: one signal handler, ordered shutdown hooks.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

type Hook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Shutdown hooks, run in registration order when the process is asked to
/// stop. Each hook gets the shutdown timeout to finish; stragglers are
/// abandoned, not awaited forever.
pub struct ShutdownHooks {
    timeout: Duration,
    hooks: Vec<(&'static str, Hook)>,
}

impl ShutdownHooks {
    pub fn new(timeout: Duration) -> ShutdownHooks {
        ShutdownHooks { timeout, hooks: Vec::new() }
    }

    pub fn register<F, Fut>(&mut self, name: &'static str, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.push((name, Box::new(move || Box::pin(hook()))));
    }

    /// Run every hook in order, each bounded by the shutdown timeout.
    pub async fn run(self) {
        for (name, hook) in self.hooks {
            tracing::info!("shutdown: running {name}");
            if tokio::time::timeout(self.timeout, hook()).await.is_err() {
                tracing::warn!("shutdown: {name} exceeded {:?}, moving on", self.timeout);
            }
        }
    }
}

/// Block until SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let ctrl_c = tokio::signal::ctrl_c();
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = ctrl_c => {},
                _ = sigterm.recv() => {},
            }
        } else {
            let _ = ctrl_c.await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut hooks = ShutdownHooks::new(Duration::from_secs(1));

        for i in 0..3 {
            let order = Arc::clone(&order);
            hooks.register("test", move || async move {
                order.lock().unwrap().push(i);
            });
        }

        hooks.run().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn hung_hook_does_not_block_the_rest() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut hooks = ShutdownHooks::new(Duration::from_millis(50));

        hooks.register("hung", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let ran2 = Arc::clone(&ran);
        hooks.register("after", move || async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::timeout(Duration::from_secs(5), hooks.run()).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
