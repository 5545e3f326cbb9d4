//! WebSocket connection to the gateway

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parley_shared::protocol::{self, ClientEvent, ServerEvent};
use parley_shared::AccountId;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Outbound half of a gateway connection
///
/// Sends are fire-and-forget: success means the frame was queued, not that
/// anyone received it.
#[async_trait]
pub trait GatewayLink: Send + Sync + 'static {
    async fn send_event(&self, event: ClientEvent) -> Result<()>;
}

/// Live connection, re-dialable after a drop
pub struct GatewayConnection {
    config: ClientConfig,
    account: AccountId,
    token: Option<String>,
    outbound: RwLock<mpsc::Sender<Vec<u8>>>,
}

impl GatewayConnection {
    /// Connect and identify
    ///
    /// The returned receiver yields server events until the connection
    /// drops, then closes.
    pub async fn connect(
        config: ClientConfig,
        account: AccountId,
        token: Option<String>,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>)> {
        let (outbound, events) = dial(&config, &account, token.clone()).await?;
        let connection = Self {
            config,
            account,
            token,
            outbound: RwLock::new(outbound),
        };
        Ok((connection, events))
    }

    /// Dial again and re-identify, replacing the dropped connection
    ///
    /// Callers should resync history afterwards; anything pushed while the
    /// connection was down was not delivered live.
    pub async fn reconnect(&self) -> Result<mpsc::Receiver<ServerEvent>> {
        let (outbound, events) = dial(&self.config, &self.account, self.token.clone()).await?;
        // Dropping the old sender ends the old write task
        *self.outbound.write().await = outbound;
        info!("Reconnected to gateway as {}", self.account.short());
        Ok(events)
    }

    /// False once the transport has dropped
    pub async fn is_connected(&self) -> bool {
        !self.outbound.read().await.is_closed()
    }
}

#[async_trait]
impl GatewayLink for GatewayConnection {
    async fn send_event(&self, event: ClientEvent) -> Result<()> {
        let frame = protocol::encode(&event).map_err(|e| ClientError::Transport(e.to_string()))?;
        self.outbound
            .read()
            .await
            .send(frame)
            .await
            .map_err(|_| ClientError::Transport("connection closed".into()))
    }
}

async fn dial(
    config: &ClientConfig,
    account: &AccountId,
    token: Option<String>,
) -> Result<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<ServerEvent>)> {
    let url = config.ws_url();
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| ClientError::Transport(format!("failed to connect to {}: {}", url, e)))?;
    let (mut write, mut read) = ws_stream.split();

    // The gateway ignores everything until the connection identifies
    let identify = protocol::encode(&ClientEvent::Identify {
        account_id: account.clone(),
        token,
    })
    .map_err(|e| ClientError::Transport(e.to_string()))?;
    write
        .send(Message::Binary(identify))
        .await
        .map_err(|e| ClientError::Transport(format!("failed to identify: {}", e)))?;

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(100);
    let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(100);
    // Dropped when the read side ends, which stops the writer too
    let (read_done_tx, mut read_done) = oneshot::channel::<()>();

    tokio::spawn(async move {
        debug!("Gateway write task started");
        loop {
            tokio::select! {
                data = rx.recv() => {
                    let Some(data) = data else { break };
                    if let Err(e) = write.send(Message::Binary(data)).await {
                        error!("Gateway write error: {}", e);
                        break;
                    }
                }
                _ = &mut read_done => break,
            }
        }
        // Closing the receiver marks the connection as down for senders
        rx.close();
        let _ = write.close().await;
        debug!("Gateway write task ended");
    });

    tokio::spawn(async move {
        let _read_done = read_done_tx;
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Binary(data)) => match protocol::decode::<ServerEvent>(&data) {
                    // Nobody listening: keep the connection up for sends
                    Ok(event) => {
                        let _ = event_tx.send(event).await;
                    }
                    Err(e) => warn!("Undecodable frame from gateway: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Gateway closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Gateway connection error: {}", e);
                    break;
                }
            }
        }
    });

    info!("Connected to gateway at {} as {}", url, account.short());
    Ok((tx, event_rx))
}
