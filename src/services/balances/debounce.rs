use std::time::Duration;

use tokio::time::Instant;

/// Trailing-edge timer. The first `arm` after a flush starts the window;
/// later arms inside the window do not push the deadline back, so a steady
/// stream of changes still flushes once per window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    pub fn arm(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    /// Resolves at the deadline; pending forever while disarmed. Safe to use
    /// as a `tokio::select!` branch.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}
