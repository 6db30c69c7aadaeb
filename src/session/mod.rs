//! Session lifecycle: owns the fetch capability across polls.
//!
//! A capability is either fresh (just created, possibly seeded with a
//! saved session) or retired (torn down, never reused). Retiring always
//! tears down, even when the session cannot be read or saved.

use crate::fetch::{Capability, CapabilityFactory, FetchError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session encoding: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("capability: {0}")]
    Capability(#[from] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Opaque credential bundle carried from one capability to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub cookies: Vec<Cookie>,
}

pub trait SessionStore: Send + Sync {
    /// A missing or unreadable session is a fresh start, not an error.
    fn load(&self) -> Option<Session>;
    fn save(&self, session: &Session) -> Result<(), SessionError>;
}

/// JSON file on disk.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Option<Session> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no session file found, starting fresh session");
                return None;
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "cannot read session file");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "ignoring corrupt session file");
                None
            }
        }
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(session)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Restart when the capability has served `restart_interval` cycles or
/// has been rate limited `rate_limit_threshold` times.
pub fn should_restart(
    cycles_since_restart: u64,
    rate_limit_count: u64,
    restart_interval: u64,
    rate_limit_threshold: u64,
) -> bool {
    cycles_since_restart >= restart_interval || rate_limit_count >= rate_limit_threshold
}

pub struct SessionManager {
    factory: Arc<dyn CapabilityFactory>,
    store: Arc<dyn SessionStore>,
    /// Last known session; takes precedence over the store.
    cached: Option<Session>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn CapabilityFactory>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            factory,
            store,
            cached: None,
        }
    }

    pub fn cached(&self) -> Option<&Session> {
        self.cached.as_ref()
    }

    /// Create a fresh capability, seeded with the in-memory session if
    /// there is one, otherwise with whatever the store holds.
    pub async fn acquire(&mut self) -> Result<Box<dyn Capability>, SessionError> {
        let mut capability = self.factory.create().await?;

        if let Some(ref session) = self.cached {
            capability.apply_session(session);
            info!(cookies = session.cookies.len(), "session restored from memory");
        } else if let Some(session) = self.store.load() {
            capability.apply_session(&session);
            info!(cookies = session.cookies.len(), "session restored from file");
            self.cached = Some(session);
        }

        Ok(capability)
    }

    /// Save the capability's session and tear it down. Teardown happens
    /// whether or not the session could be read or written.
    pub async fn retire(&mut self, mut capability: Box<dyn Capability>) -> Option<Session> {
        let session = match capability.current_session() {
            Ok(session) => {
                if let Err(e) = self.store.save(&session) {
                    warn!(error = %e, "failed to persist session");
                } else {
                    info!(cookies = session.cookies.len(), "session saved");
                }
                self.cached = Some(session.clone());
                Some(session)
            }
            Err(e) => {
                warn!(error = %e, "could not read session from capability");
                None
            }
        };

        capability.teardown().await;
        info!("capability retired");
        session
    }

    /// Retire the given capability (if any) and acquire a new one.
    pub async fn restart(
        &mut self,
        capability: Option<Box<dyn Capability>>,
    ) -> Result<Box<dyn Capability>, SessionError> {
        if let Some(capability) = capability {
            self.retire(capability).await;
        }
        info!("restarting capability");
        self.acquire().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory doubles shared by the session and poller tests.

    use super::*;
    use crate::fetch::Document;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub type Script = Arc<Mutex<VecDeque<Result<Document, FetchError>>>>;

    pub fn page(body: &str) -> Result<Document, FetchError> {
        Ok(Document {
            url: "https://example.test/event".into(),
            status: 200,
            body: body.into(),
        })
    }

    #[derive(Default)]
    pub struct Counters {
        pub created: AtomicUsize,
        pub torn_down: AtomicUsize,
        pub applied: Mutex<Vec<Session>>,
    }

    impl Counters {
        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
        pub fn torn_down(&self) -> usize {
            self.torn_down.load(Ordering::SeqCst)
        }
    }

    pub struct FakeCapability {
        id: usize,
        script: Script,
        counters: Arc<Counters>,
        session: Session,
        fail_session_read: bool,
    }

    #[async_trait]
    impl Capability for FakeCapability {
        async fn fetch(&mut self, _url: &str, _timeout: Duration) -> Result<Document, FetchError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| page("<html></html>"))
        }

        fn apply_session(&mut self, session: &Session) {
            self.counters.applied.lock().unwrap().push(session.clone());
            self.session = session.clone();
        }

        fn current_session(&self) -> Result<Session, FetchError> {
            if self.fail_session_read {
                return Err(FetchError::Client("browser gone".into()));
            }
            let mut session = self.session.clone();
            session.cookies.push(Cookie {
                name: "gen".into(),
                value: self.id.to_string(),
            });
            Ok(session)
        }

        async fn teardown(&mut self) {
            self.counters.torn_down.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub struct FakeFactory {
        pub script: Script,
        pub counters: Arc<Counters>,
        pub fail_session_read: bool,
    }

    impl FakeFactory {
        pub fn new(script: Script) -> Self {
            Self {
                script,
                counters: Arc::new(Counters::default()),
                fail_session_read: false,
            }
        }
    }

    #[async_trait]
    impl CapabilityFactory for FakeFactory {
        async fn create(&self) -> Result<Box<dyn Capability>, FetchError> {
            let id = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(FakeCapability {
                id,
                script: self.script.clone(),
                counters: self.counters.clone(),
                session: Session::default(),
                fail_session_read: self.fail_session_read,
            }))
        }
    }

    #[derive(Default)]
    pub struct MemoryStore {
        pub saved: Mutex<Option<Session>>,
        pub fail_writes: bool,
    }

    impl SessionStore for MemoryStore {
        fn load(&self) -> Option<Session> {
            self.saved.lock().unwrap().clone()
        }

        fn save(&self, session: &Session) -> Result<(), SessionError> {
            if self.fail_writes {
                return Err(SessionError::Io(std::io::Error::other("disk full")));
            }
            *self.saved.lock().unwrap() = Some(session.clone());
            Ok(())
        }
    }
}
