//! Keeps a [`Client`]'s token in sync with a token file that is rotated by someone else
//! (typically a Vault agent sidecar or a mounted Kubernetes secret).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::Client;

/// How often adding the file watch is attempted before giving up, with exponential backoff.
const WATCH_ATTEMPTS: u32 = 16;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read token file {path:?}"))]
    ReadToken {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("token file {path:?} is empty"))]
    EmptyToken { path: PathBuf },

    #[snafu(display("failed to initialize file watcher"))]
    InitWatcher { source: notify::Error },

    #[snafu(display("failed to watch token file {path:?}"))]
    WatchFile {
        source: notify::Error,
        path: PathBuf,
    },
}

/// Loads the token stored in `path` into `client`.
pub async fn load_token_file(client: &Client, path: &Path) -> Result<(), Error> {
    let content = tokio::fs::read_to_string(path)
        .await
        .context(ReadTokenSnafu { path })?;
    let token = content.trim();
    if token.is_empty() {
        return EmptyTokenSnafu { path }.fail();
    }
    client.set_token(token).await;
    Ok(())
}

async fn watch_with_backoff(watcher: &mut RecommendedWatcher, path: &Path) -> Result<(), Error> {
    let mut attempt = 0;
    loop {
        match watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => return Ok(()),
            Err(err) if attempt + 1 < WATCH_ATTEMPTS => {
                let delay = Duration::from_secs(1 << attempt);
                warn!(
                    error = &err as &dyn std::error::Error,
                    token_file = %path.display(),
                    retry_in = ?delay,
                    "failed to watch token file, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err).context(WatchFileSnafu { path }),
        }
    }
}

async fn reload(client: &Client, path: &Path) {
    match load_token_file(client, path).await {
        Ok(()) => info!(token_file = %path.display(), "loaded new Vault token"),
        Err(err) => warn!(
            error = &err as &dyn std::error::Error,
            "failed to reload Vault token"
        ),
    }
}

/// Loads the token from `path` and reloads it whenever the file changes.
///
/// Runs until the underlying watcher shuts down, so it should be spawned as a background task.
pub async fn watch_token_file(client: Client, path: PathBuf) -> Result<(), Error> {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
        // The receiver only goes away when the task is shutting down anyway
        let _ = tx.send(event);
    })
    .context(InitWatcherSnafu)?;
    watch_with_backoff(&mut watcher, &path).await?;
    reload(&client, &path).await;

    while let Some(event) = rx.recv().await {
        match event {
            Ok(event) => match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => reload(&client, &path).await,
                // Atomic replacements (as done for mounted secrets) remove the watched inode
                EventKind::Remove(_) => {
                    let _ = watcher.unwatch(&path);
                    watch_with_backoff(&mut watcher, &path).await?;
                    reload(&client, &path).await;
                }
                _ => {}
            },
            Err(err) => warn!(
                error = &err as &dyn std::error::Error,
                "received error from token file watcher"
            ),
        }
    }
    Ok(())
}
