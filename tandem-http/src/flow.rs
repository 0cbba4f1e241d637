//! Send-side flow control for one HTTP/2 connection.
//!
//! Every window lives behind one lock so that checking and decrementing a
//! stream window together with the connection window is a single step.
//! Senders that find a window exhausted park on a per-stream [`Notify`] until
//! a WINDOW_UPDATE, a SETTINGS change or shutdown wakes them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tandem_h2::Window;
use tokio::sync::Notify;

use crate::error::HttpError;

struct StreamWindow {
    window: Window,
    wake: Arc<Notify>,
}

struct FlowState {
    connection: Window,
    /// Wakes senders blocked on the connection window (id 0).
    connection_wake: Arc<Notify>,
    streams: HashMap<u32, StreamWindow>,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE, applied to new streams.
    initial: i64,
    closed: bool,
}

impl FlowState {
    fn wake_all(&self) {
        self.connection_wake.notify_waiters();
        for stream in self.streams.values() {
            stream.wake.notify_waiters();
        }
    }

    fn waker(&self, id: u32) -> Result<Arc<Notify>, HttpError> {
        if self.closed {
            return Err(HttpError::ConnectionClosed);
        }
        if id == 0 {
            return Ok(self.connection_wake.clone());
        }
        self.streams
            .get(&id)
            .map(|s| s.wake.clone())
            .ok_or_else(|| HttpError::Protocol(format!("stream {id} is closed")))
    }

    /// Largest amount `id` may send right now.
    fn sendable(&self, id: u32) -> Result<i64, HttpError> {
        if self.closed {
            return Err(HttpError::ConnectionClosed);
        }
        let conn = self.connection.available();
        if id == 0 {
            return Ok(conn);
        }
        let stream = self
            .streams
            .get(&id)
            .ok_or_else(|| HttpError::Protocol(format!("stream {id} is closed")))?;
        Ok(conn.min(stream.window.available()))
    }

    fn take(&mut self, id: u32, amount: u32) -> Result<(), HttpError> {
        if self.sendable(id)? < i64::from(amount) {
            return Err(HttpError::FlowControl);
        }
        if id != 0
            && let Some(stream) = self.streams.get_mut(&id)
        {
            stream
                .window
                .consume(amount)
                .map_err(|_| HttpError::FlowControl)?;
        }
        self.connection
            .consume(amount)
            .map_err(|_| HttpError::FlowControl)
    }
}

/// Send windows for a connection (id 0) and its streams.
pub struct FlowControl {
    state: Mutex<FlowState>,
}

impl FlowControl {
    /// `initial_window` is the window new streams start with until the peer
    /// says otherwise. The connection window always starts at 65535.
    pub fn new(initial_window: u32) -> Self {
        Self {
            state: Mutex::new(FlowState {
                connection: Window::default(),
                connection_wake: Arc::new(Notify::new()),
                streams: HashMap::new(),
                initial: i64::from(initial_window),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stream with the current initial window.
    pub fn add_stream(&self, id: u32) {
        let mut state = self.lock();
        let initial = state.initial;
        state.streams.entry(id).or_insert_with(|| StreamWindow {
            window: Window::new(initial),
            wake: Arc::new(Notify::new()),
        });
    }

    /// Forget a stream. Senders still waiting on it fail.
    pub fn remove_stream(&self, id: u32) {
        if let Some(stream) = self.lock().streams.remove(&id) {
            stream.wake.notify_waiters();
        }
    }

    /// Current window for `id` (0 for the connection).
    pub fn window(&self, id: u32) -> Option<i64> {
        let state = self.lock();
        if id == 0 {
            Some(state.connection.available())
        } else {
            state.streams.get(&id).map(|s| s.window.available())
        }
    }

    /// Take `amount` bytes from the stream window (unless `id` is 0) and the
    /// connection window. Nothing is taken if either would go negative.
    pub fn consume_window(&self, id: u32, amount: u32) -> Result<(), HttpError> {
        self.lock().take(id, amount)
    }

    /// Apply a WINDOW_UPDATE of `increment` bytes and wake blocked senders:
    /// the stream's own for a stream update, all of them for id 0.
    pub fn update_window(&self, id: u32, increment: u32) -> Result<(), HttpError> {
        let mut state = self.lock();
        if id == 0 {
            state
                .connection
                .increase(increment)
                .map_err(|_| HttpError::FlowControl)?;
            state.wake_all();
            return Ok(());
        }
        match state.streams.get_mut(&id) {
            Some(stream) => {
                stream
                    .window
                    .increase(increment)
                    .map_err(|_| HttpError::FlowControl)?;
                stream.wake.notify_waiters();
                Ok(())
            }
            // Updates for streams we already dropped are harmless.
            None => Ok(()),
        }
    }

    /// Apply a new SETTINGS_INITIAL_WINDOW_SIZE: every open stream window
    /// shifts by the difference, possibly below zero.
    pub fn adjust_initial(&self, initial_window: u32) -> Result<(), HttpError> {
        let mut state = self.lock();
        let delta = i64::from(initial_window) - state.initial;
        state.initial = i64::from(initial_window);
        for stream in state.streams.values_mut() {
            stream
                .window
                .adjust(delta)
                .map_err(|_| HttpError::FlowControl)?;
        }
        if delta > 0 {
            state.wake_all();
        }
        Ok(())
    }

    /// Wait until `amount` bytes can be taken from `id`, then take them.
    pub async fn acquire(&self, id: u32, amount: u32) -> Result<(), HttpError> {
        loop {
            let wake = self.lock().waker(id)?;
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.sendable(id)? >= i64::from(amount) {
                    return state.take(id, amount);
                }
            }
            notified.await;
        }
    }

    /// Wait until at least one byte can be sent on `id`, then take as much as
    /// is available up to `max`. Returns the amount taken.
    pub async fn acquire_up_to(&self, id: u32, max: u32) -> Result<u32, HttpError> {
        if max == 0 {
            return Ok(0);
        }
        loop {
            let wake = self.lock().waker(id)?;
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                let sendable = state.sendable(id)?;
                if sendable > 0 {
                    let amount = sendable.min(i64::from(max)) as u32;
                    state.take(id, amount)?;
                    return Ok(amount);
                }
            }
            notified.await;
        }
    }

    /// Fail every current and future wait with `ConnectionClosed`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.wake_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn consume_decrements_stream_and_connection() {
        let flow = FlowControl::new(65_535);
        flow.add_stream(1);
        flow.consume_window(1, 1000).unwrap();
        assert_eq!(flow.window(1), Some(64_535));
        assert_eq!(flow.window(0), Some(64_535));
    }

    #[test]
    fn consume_failure_takes_nothing() {
        let flow = FlowControl::new(100);
        flow.add_stream(1);
        assert!(matches!(
            flow.consume_window(1, 101),
            Err(HttpError::FlowControl)
        ));
        assert_eq!(flow.window(1), Some(100));
        assert_eq!(flow.window(0), Some(65_535));

        flow.consume_window(1, 100).unwrap();
        assert_eq!(flow.window(1), Some(0));
        assert!(flow.consume_window(1, 1).is_err());
        assert_eq!(flow.window(0), Some(65_435));
    }

    #[test]
    fn connection_window_limits_every_stream() {
        let flow = FlowControl::new(65_535);
        flow.add_stream(1);
        flow.add_stream(3);
        flow.consume_window(0, 65_000).unwrap();
        assert!(flow.consume_window(3, 600).is_err());
        assert_eq!(flow.window(3), Some(65_535));
        flow.consume_window(3, 535).unwrap();
    }

    #[test]
    fn update_adds_exact_delta() {
        let flow = FlowControl::new(65_535);
        flow.add_stream(1);
        flow.consume_window(1, 5000).unwrap();
        flow.update_window(1, 1234).unwrap();
        assert_eq!(flow.window(1), Some(65_535 - 5000 + 1234));
        flow.update_window(0, 10).unwrap();
        assert_eq!(flow.window(0), Some(65_535 - 5000 + 10));
    }

    #[test]
    fn update_overflow_rejected() {
        let flow = FlowControl::new(65_535);
        assert!(matches!(
            flow.update_window(0, 0x7fff_ffff),
            Err(HttpError::FlowControl)
        ));
    }

    #[test]
    fn adjust_initial_shifts_open_streams() {
        let flow = FlowControl::new(65_535);
        flow.add_stream(1);
        flow.consume_window(1, 60_000).unwrap();
        flow.adjust_initial(1000).unwrap();
        assert_eq!(flow.window(1), Some(5_535 - 64_535));
        flow.add_stream(3);
        assert_eq!(flow.window(3), Some(1000));
    }

    #[tokio::test]
    async fn waiter_resumes_after_update() {
        let flow = Arc::new(FlowControl::new(10));
        flow.add_stream(1);
        flow.consume_window(1, 10).unwrap();

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire(1, 5).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        flow.update_window(1, 5).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(flow.window(1), Some(0));
    }

    #[tokio::test]
    async fn connection_update_wakes_all_streams() {
        let flow = Arc::new(FlowControl::new(65_535));
        flow.add_stream(1);
        flow.add_stream(3);
        flow.consume_window(0, 65_535).unwrap();

        let a = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire(1, 10).await })
        };
        let b = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire_up_to(3, 40).await })
        };
        tokio::task::yield_now().await;

        flow.update_window(0, 50).unwrap();
        a.await.unwrap().unwrap();
        assert_eq!(b.await.unwrap().unwrap(), 40);
        assert_eq!(flow.window(0), Some(0));
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let flow = Arc::new(FlowControl::new(0));
        flow.add_stream(1);
        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire(1, 1).await })
        };
        tokio::task::yield_now().await;
        flow.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(HttpError::ConnectionClosed)
        ));
        assert!(matches!(
            flow.acquire(1, 0).await,
            Err(HttpError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn removed_stream_fails_waiter() {
        let flow = Arc::new(FlowControl::new(0));
        flow.add_stream(1);
        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire(1, 1).await })
        };
        tokio::task::yield_now().await;
        flow.remove_stream(1);
        assert!(matches!(waiter.await.unwrap(), Err(HttpError::Protocol(_))));
    }
}
