//! Session initialization command

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::session::{init_session, SessionLock};

pub async fn run(config: &Config) -> Result<()> {
    let _lock = SessionLock::acquire(config.lock_file())?;
    let user = init_session(config).await?;
    info!(user = %user, path = %config.session_file.display(), "Session ready");
    Ok(())
}
