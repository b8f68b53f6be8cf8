//! Session management for the Telegram client
//!
//! Provides:
//! - File-based session locking so two processes never share one MTProto session
//! - Session file validation
//! - Client creation on top of a `SenderPool`
//! - The one-time interactive login

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use grammers_client::client::updates::UpdatesLike;
use grammers_client::{Client, SignInError};
use grammers_mtsender::{SenderPool, SenderPoolHandle};
use grammers_session::storages::SqliteSession;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Exclusive lock guarding the session file.
pub struct SessionLock {
    path: PathBuf,
    lock_file: Option<File>,
}

impl SessionLock {
    /// Acquire an exclusive lock at `path`, failing fast when another process holds it.
    pub fn acquire<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        ensure_parent(&path)
            .map_err(|e| Error::LockError(format!("Failed to create lock directory: {}", e)))?;

        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::LockError(format!("Failed to open lock file: {}", e)))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Session lock acquired");
                Ok(Self {
                    path,
                    lock_file: Some(lock_file),
                })
            }
            Err(_) => {
                warn!(
                    path = %path.display(),
                    "Telegram session is already in use by another process"
                );
                Err(Error::SessionLocked)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock manually
    pub fn release(&mut self) {
        if let Some(file) = self.lock_file.take() {
            let _ = file.unlock();
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Check that the session file exists.
pub fn check_session_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "Session file not found, run `telegram_forwarder init-session` first"
        );
        return Err(Error::SessionNotFound(path.display().to_string()));
    }
    Ok(())
}

/// Open (or create) the SQLite session at `path`.
pub fn open_session(path: &Path) -> Result<Arc<SqliteSession>> {
    ensure_parent(path)?;
    let session = SqliteSession::open(path).map_err(|e| {
        Error::SessionNotFound(format!("Failed to open session {}: {}", path.display(), e))
    })?;
    Ok(Arc::new(session))
}

/// Connected client plus the pieces of its sender pool.
pub struct TelegramClient {
    pub client: Client,
    pub handle: SenderPoolHandle,
    updates: Option<mpsc::UnboundedReceiver<UpdatesLike>>,
    runner: tokio::task::JoinHandle<()>,
}

impl TelegramClient {
    pub async fn connect(session: Arc<SqliteSession>, api_id: i32) -> Result<Self> {
        let pool = SenderPool::new(session, api_id);
        let client = Client::new(&pool);

        let SenderPool {
            runner,
            updates,
            handle,
        } = pool;

        let runner = tokio::spawn(async move {
            runner.run().await;
        });

        Ok(Self {
            client,
            handle,
            updates: Some(updates),
            runner,
        })
    }

    /// Take ownership of the raw updates receiver. `None` once taken.
    pub fn take_updates(&mut self) -> Option<mpsc::UnboundedReceiver<UpdatesLike>> {
        self.updates.take()
    }
}

impl std::ops::Deref for TelegramClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl Drop for TelegramClient {
    fn drop(&mut self) {
        self.runner.abort();
    }
}

/// Connect with the existing, already authorized session.
pub async fn get_client(config: &Config) -> Result<TelegramClient> {
    check_session_exists(&config.session_file)?;
    let session = open_session(&config.session_file)?;
    let client = TelegramClient::connect(session, config.api_id).await?;

    if !client.is_authorized().await? {
        return Err(Error::AuthorizationRequired);
    }
    Ok(client)
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Interactive one-time login writing the session file.
///
/// Returns the display name of the signed-in account.
pub async fn init_session(config: &Config) -> Result<String> {
    if config.phone.is_empty() {
        return Err(Error::Config("TG_PHONE is required for init-session".into()));
    }

    let session = open_session(&config.session_file)?;
    let client = TelegramClient::connect(session, config.api_id).await?;

    if client.is_authorized().await? {
        info!(path = %config.session_file.display(), "Session is already authorized");
        return Ok(String::from("already authorized"));
    }

    info!(phone = %config.phone, "Requesting login code");
    let token = client
        .request_login_code(&config.phone, &config.api_hash)
        .await
        .map_err(|e| Error::TelegramError(format!("Failed to request code: {}", e)))?;

    let code = prompt("Enter the code from Telegram: ")?;

    let user = match client.sign_in(&token, &code).await {
        Ok(user) => user,
        Err(SignInError::PasswordRequired(password_token)) => {
            let password = prompt("Two-step verification password: ")?;
            client
                .check_password(password_token, password.as_bytes())
                .await
                .map_err(|e| Error::TelegramError(format!("Failed to check password: {}", e)))?
        }
        Err(e) => return Err(Error::TelegramError(format!("Failed to sign in: {}", e))),
    };

    let name = user.full_name();
    info!(
        user = %name,
        username = user.username().unwrap_or("-"),
        path = %config.session_file.display(),
        "Session created"
    );
    Ok(name)
}
