use crate::error::{NestqlError, Result};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type Connector<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

/// A connection opened on first use.
///
/// Concurrent first callers block on the same initialization; a failed
/// attempt leaves the connection `Disconnected` so a later call retries.
pub struct LazyConnection<C> {
    cell: OnceCell<C>,
    state: Mutex<ConnectionState>,
    attempts: AtomicUsize,
    connect: Connector<C>,
}

impl<C> LazyConnection<C> {
    pub fn new(connect: impl Fn() -> Result<C> + Send + Sync + 'static) -> Self {
        LazyConnection {
            cell: OnceCell::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            attempts: AtomicUsize::new(0),
            connect: Box::new(connect),
        }
    }

    pub fn get(&self) -> Result<&C> {
        if let Some(connection) = self.cell.get() {
            return Ok(connection);
        }
        self.cell.get_or_try_init(|| {
            self.set_state(ConnectionState::Connecting);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match (self.connect)() {
                Ok(connection) => {
                    self.set_state(ConnectionState::Connected);
                    log::info!("Connected after {attempt} attempt(s)");
                    Ok(connection)
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    log::warn!("Connection attempt {attempt} failed: {e}");
                    Err(match e {
                        NestqlError::ConnectionFailed(_) => e,
                        other => NestqlError::ConnectionFailed(other.to_string()),
                    })
                }
            }
        })
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_first_callers_share_one_attempt() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let lazy = LazyConnection::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(42_u32)
        });
        assert_eq!(lazy.state(), ConnectionState::Disconnected);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| assert_eq!(*lazy.get().unwrap(), 42));
            }
        });
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.attempts(), 1);
        assert_eq!(lazy.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_failed_attempt_can_be_retried() {
        let fail = Arc::new(AtomicBool::new(true));
        let flag = fail.clone();
        let lazy = LazyConnection::new(move || {
            if flag.load(Ordering::SeqCst) {
                Err(NestqlError::Other("refused".into()))
            } else {
                Ok("conn")
            }
        });

        let err = lazy.get().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(lazy.state(), ConnectionState::Disconnected);

        fail.store(false, Ordering::SeqCst);
        assert_eq!(*lazy.get().unwrap(), "conn");
        assert_eq!(lazy.attempts(), 2);
        assert_eq!(lazy.state(), ConnectionState::Connected);
    }
}
