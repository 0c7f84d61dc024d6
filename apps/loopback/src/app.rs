//! Wires two transfer managers together and sends one file across.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use onetox_protocol::{FileKind, TransferKey};
use onetox_transfer::{
    BackingStore, JsonAssociationStore, ProgressTracker, ResumeLedger, TransferEvent,
    TransferManager, TransferState, fingerprint_store,
};
use tokio::sync::{mpsc, oneshot};

use crate::config::LoopbackConfig;
use crate::loopback::{self, Node};

const DEMO_FILE_NAME: &str = "loopback-demo.bin";
const TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the loopback until the file has arrived.
pub async fn run(config: LoopbackConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.downloads_dir)
        .with_context(|| format!("creating {}", config.downloads_dir.display()))?;
    let source = match &config.source_file {
        Some(path) => path.clone(),
        None => write_demo_file(&config.work_dir(), config.demo_bytes)?,
    };
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .context("source file has no usable name")?
        .to_string();

    // -- Nodes --
    let (mut alice_node, mut bob_node) = loopback::pair(config.transfer.chunk_size);
    let alice = Arc::new(TransferManager::new(
        alice_node.session.clone(),
        ResumeLedger::in_memory(config.transfer.ledger_capacity),
        config.transfer.clone(),
    ));
    let bob_store = JsonAssociationStore::open(config.ledger_path.clone(), config.transfer.ledger_capacity)
        .with_context(|| format!("opening resume ledger {}", config.ledger_path.display()))?;
    let bob = Arc::new(TransferManager::new(
        bob_node.session.clone(),
        ResumeLedger::new(Arc::new(bob_store)),
        config.transfer.clone(),
    ));

    alice_node.spawn_pump(Arc::clone(&alice));
    bob_node.spawn_pump(Arc::clone(&bob));
    spawn_sender_log(&alice);
    let (done_tx, done_rx) = oneshot::channel();
    spawn_receiver(&bob, config.downloads_dir.clone(), done_tx);

    // -- Progress --
    let tracker = ProgressTracker::new(Arc::clone(&bob), None);
    tracker.on_progress(Box::new(|p| {
        tracing::info!(
            key = %p.key,
            state = %p.state,
            bytes = p.transferred_bytes,
            total = p.total_bytes,
            "{:.1}%",
            p.percent
        );
    }));
    tracker.start();

    connect(&alice_node, &bob_node, true);

    // -- Send --
    let mut store = BackingStore::open_file(&source)?;
    let fingerprint = fingerprint_store(&mut store)?;
    let key = alice.send_data(alice_node.remote_id(), FileKind::Data, &name, store, Some(fingerprint))?;
    tracing::info!(%key, file = %source.display(), "offered file");

    if config.simulate_interruption {
        interrupt_and_reconnect(&alice_node, &bob_node, &alice, &bob).await?;
    }

    let received = tokio::time::timeout(TIMEOUT, done_rx)
        .await
        .context("timed out waiting for the transfer")?
        .context("receiver stopped")?;
    tracker.stop();

    let sent = std::fs::read(&source)?;
    let got = std::fs::read(&received)?;
    anyhow::ensure!(sent == got, "received file differs from the source");
    tracing::info!(bytes = got.len(), file = %received.display(), "file received intact");
    Ok(())
}

/// Pauses the download once it runs, drops the connection, reconnects and
/// lets the resume ledger pick the transfer up again.
async fn interrupt_and_reconnect(
    alice_node: &Node,
    bob_node: &Node,
    alice: &TransferManager,
    bob: &TransferManager,
) -> anyhow::Result<()> {
    let key = wait_for(|| {
        bob.snapshot()
            .into_iter()
            .find(|p| p.state == TransferState::Downloading)
            .map(|p| p.key)
    })
    .await
    .context("download never started")?;

    if let Err(e) = bob.pause(key) {
        // Already done; nothing left to interrupt.
        tracing::info!(%key, error = %e, "skipping interruption");
        return Ok(());
    }
    wait_for(|| (bob.state(key) != Some(TransferState::Downloading)).then_some(()))
        .await
        .context("pause never applied")?;
    tracing::info!(%key, "download paused, dropping connection");

    connect(alice_node, bob_node, false);
    wait_for(|| (alice.active_count() == 0 && bob.active_count() == 0).then_some(()))
        .await
        .context("transfers survived the disconnect")?;
    let saved: Vec<TransferKey> = bob.ledger().entries()?.iter().map(|e| e.key()).collect();
    tracing::info!(?saved, "connection dropped, reconnecting");

    // The receiver must be reachable before the sender re-offers.
    bob_node.set_peer_online(true);
    alice_node.set_peer_online(true);
    Ok(())
}

fn connect(alice_node: &Node, bob_node: &Node, online: bool) {
    alice_node.set_peer_online(online);
    bob_node.set_peer_online(online);
}

/// Polls `check` until it yields a value or the timeout expires.
async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> Option<T> {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .ok()
}

fn spawn_sender_log(manager: &TransferManager) {
    let Some(mut events) = manager.take_events() else {
        return;
    };
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(side = "sender", ?event, "transfer event");
        }
    });
}

/// Accepts every incoming file into `downloads_dir` and reports the path of
/// the first one that completes.
fn spawn_receiver(manager: &Arc<TransferManager>, downloads_dir: PathBuf, done: oneshot::Sender<PathBuf>) {
    let Some(events) = manager.take_events() else {
        return;
    };
    let manager = Arc::clone(manager);
    tokio::spawn(receive(manager, events, downloads_dir, done));
}

async fn receive(
    manager: Arc<TransferManager>,
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
    downloads_dir: PathBuf,
    done: oneshot::Sender<PathBuf>,
) {
    let mut done = Some(done);
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::IncomingRequest { key, name, size, .. } => {
                tracing::info!(%key, name = %name, size, "accepting");
                let accepted = BackingStore::create_in_dir(&downloads_dir, &name)
                    .and_then(|store| manager.accept_incoming(key, store));
                if let Err(e) = accepted {
                    tracing::error!(%key, error = %e, "could not accept");
                    if let Err(e) = manager.cancel(key) {
                        tracing::warn!(%key, error = %e, "cancel failed");
                    }
                }
            }
            TransferEvent::Resumed { key, offset, .. } => {
                tracing::info!(%key, offset, "download resumed");
            }
            TransferEvent::Finished { key, name, .. } => {
                tracing::info!(%key, name = %name, "download finished");
                if let Some(done) = done.take() {
                    let _ = done.send(downloads_dir.join(name));
                }
            }
            TransferEvent::Failed { key, error } => {
                tracing::error!(%key, error = %error, "download failed");
            }
            other => tracing::debug!(side = "receiver", event = ?other, "transfer event"),
        }
    }
}

fn write_demo_file(dir: &Path, size: u64) -> anyhow::Result<PathBuf> {
    let path = dir.join("outbox").join(DEMO_FILE_NAME);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data: Vec<u8> = (0..size).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
    std::fs::write(&path, data)?;
    tracing::debug!(path = %path.display(), size, "demo file written");
    Ok(path)
}
