use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{FetchError, PageRequest};

/// Rendered output of one navigation.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub url: String,
    pub html: String,
}

/// A live browser session able to render pages.
#[async_trait]
pub trait BrowserSession: Send {
    async fn render(&mut self, request: &PageRequest) -> Result<Rendered, FetchError>;

    /// Releases the underlying browser. Called exactly once per session.
    async fn close(&mut self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, FetchError>;
}

/// Bounded set of reusable browser sessions.
///
/// At most `size` sessions are checked out at once. Healthy sessions go back
/// to the idle list; failed ones are closed.
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    idle: Mutex<Vec<Box<dyn BrowserSession>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, size: usize) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            factory,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    pub async fn checkout(self: &Arc<Self>) -> Result<PooledSession, FetchError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::PoolClosed)?;

        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let session = match reused {
            Some(session) => session,
            None => {
                debug!("opening browser session");
                self.factory.open().await?
            }
        };

        Ok(PooledSession {
            session: Some(session),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Stops new checkouts and closes every idle session.
    pub async fn shutdown(&self) {
        self.permits.close();
        let idle = match self.idle.lock() {
            Ok(mut idle) => std::mem::take(&mut *idle),
            Err(_) => Vec::new(),
        };
        for mut session in idle {
            session.close().await;
        }
    }

    fn give_back(&self, session: Box<dyn BrowserSession>) {
        if self.permits.is_closed() {
            close_in_background(session);
            return;
        }
        match self.idle.lock() {
            Ok(mut idle) => idle.push(session),
            Err(_) => close_in_background(session),
        }
    }
}

/// A checked-out session. Return it with [`PooledSession::release`] or
/// [`PooledSession::discard`]; dropping it closes the browser in the background.
pub struct PooledSession {
    session: Option<Box<dyn BrowserSession>>,
    pool: Arc<SessionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub async fn render(&mut self, request: &PageRequest) -> Result<Rendered, FetchError> {
        match self.session.as_mut() {
            Some(session) => session.render(request).await,
            None => Err(FetchError::PoolClosed),
        }
    }

    pub fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session);
        }
    }

    pub async fn discard(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("session dropped while checked out; closing");
            close_in_background(session);
        }
    }
}

fn close_in_background(mut session: Box<dyn BrowserSession>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                session.close().await;
            });
        }
        Err(_) => warn!("no runtime available; browser session leaked"),
    }
}
