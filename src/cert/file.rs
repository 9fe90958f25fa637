//! Serve a certificate/key pair mounted from disk, picking up rotations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::*;

use super::{CertBundle, CertStore};
use crate::shutdown::ShutdownSignal;
use crate::Result;

pub const RELOAD_INTERVAL: Duration = Duration::from_secs(10);

pub struct FileWatcher {
    cert_path: PathBuf,
    key_path: PathBuf,
    store: Arc<CertStore>,
    interval: Duration,
    loaded: (Vec<u8>, Vec<u8>),
}

impl FileWatcher {
    /// Load the pair once into `store`; unreadable or malformed files are an error
    pub async fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        store: Arc<CertStore>,
    ) -> Result<Self> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();

        let (cert, key) = read_pair(&cert_path, &key_path).await?;
        store.replace(CertBundle::from_pem(&cert, &key)?);
        info!(cert = %cert_path.display(), key = %key_path.display(), "loaded serving certificate");

        Ok(FileWatcher {
            cert_path,
            key_path,
            store,
            interval: RELOAD_INTERVAL,
            loaded: (cert, key),
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll the files until shutdown
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately and the pair was just loaded
        ticker.tick().await;

        let stop = shutdown.recv();
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => {
                    debug!("stopping certificate file watcher");
                    return;
                }
                _ = ticker.tick() => {
                    self.reload().await;
                }
            }
        }
    }

    /// Re-read both files and swap the bundle if they changed. Returns whether it was swapped.
    pub async fn reload(&mut self) -> bool {
        let pair = match read_pair(&self.cert_path, &self.key_path).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "could not read certificate files, keeping current certificate");
                return false;
            }
        };
        if pair == self.loaded {
            return false;
        }

        match CertBundle::from_pem(&pair.0, &pair.1) {
            Ok(bundle) => {
                self.store.replace(bundle);
                self.loaded = pair;
                true
            }
            Err(err) => {
                // the key may be written after the certificate, retry next tick
                warn!(error = %err, "certificate files changed but do not parse, keeping current certificate");
                false
            }
        }
    }
}

async fn read_pair(cert_path: &Path, key_path: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    let cert = tokio::fs::read(cert_path).await?;
    let key = tokio::fs::read(key_path).await?;
    Ok((cert, key))
}
