//! LISTEN/NOTIFY transport for the notification gateway.
//!
//! One background task owns the `PgListener`. Listen and unlisten requests
//! reach it over a command channel; notifications are decoded into
//! [`Notice`]s and forwarded to whoever calls [`Transport::recv`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{Notice, Transport};

/// Notification channel for `subject`. Subjects are arbitrary text, channel
/// names are identifiers of at most 63 bytes, so the subject is hashed.
pub fn channel_for(subject: &str) -> String {
    let digest = Sha256::digest(subject.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("fq_{}", &hex[..40])
}

enum Command {
    Listen(String, oneshot::Sender<Result<()>>),
    Unlisten(String, oneshot::Sender<Result<()>>),
}

pub struct PgTransport {
    commands: mpsc::UnboundedSender<Command>,
    notices: Mutex<mpsc::UnboundedReceiver<Notice>>,
    task: JoinHandle<()>,
}

impl PgTransport {
    /// Spawn the listener task. Connects lazily on the first `listen`.
    pub fn start(pool: PgPool) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_listener(pool, command_rx, notice_tx));
        Self {
            commands,
            notices: Mutex::new(notices),
            task,
        }
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| Error::AdapterUnavailable("notification listener stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::AdapterUnavailable("notification listener stopped".into()))?
    }
}

impl Drop for PgTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Transport for PgTransport {
    async fn listen(&self, subject: &str) -> Result<()> {
        self.request(|reply| Command::Listen(subject.to_string(), reply))
            .await
    }

    async fn unlisten(&self, subject: &str) -> Result<()> {
        self.request(|reply| Command::Unlisten(subject.to_string(), reply))
            .await
    }

    async fn recv(&self) -> Option<Notice> {
        self.notices.lock().await.recv().await
    }
}

async fn run_listener(
    pool: PgPool,
    mut commands: mpsc::UnboundedReceiver<Command>,
    notices: mpsc::UnboundedSender<Notice>,
) {
    let mut listener: Option<PgListener> = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("transport dropped, listener task exiting");
                    return;
                };
                match command {
                    Command::Listen(subject, reply) => {
                        let result = listen(&pool, &mut listener, &subject).await;
                        let _ = reply.send(result);
                    }
                    Command::Unlisten(subject, reply) => {
                        let result = match listener.as_mut() {
                            Some(l) => l.unlisten(&channel_for(&subject)).await.map_err(Error::from),
                            None => Ok(()),
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            notification = recv(&mut listener) => {
                match notification {
                    Ok(n) => match serde_json::from_str::<Notice>(n.payload()) {
                        Ok(notice) => {
                            if notices.send(notice).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(channel = n.channel(), "undecodable notification: {e}"),
                    },
                    // PgListener reconnects and re-issues LISTENs on its own.
                    Err(e) => warn!("listener error: {e}"),
                }
            }
        }
    }
}

async fn listen(pool: &PgPool, listener: &mut Option<PgListener>, subject: &str) -> Result<()> {
    if listener.is_none() {
        let connected = PgListener::connect_with(pool)
            .await
            .map_err(|e| Error::AdapterUnavailable(format!("listener connect failed: {e}")))?;
        info!("notification listener connected");
        *listener = Some(connected);
    }
    if let Some(l) = listener.as_mut() {
        l.listen(&channel_for(subject)).await?;
    }
    Ok(())
}

/// Next notification, or pending forever while no connection exists.
async fn recv(
    listener: &mut Option<PgListener>,
) -> std::result::Result<sqlx::postgres::PgNotification, sqlx::Error> {
    match listener.as_mut() {
        Some(l) => l.recv().await,
        None => std::future::pending().await,
    }
}
