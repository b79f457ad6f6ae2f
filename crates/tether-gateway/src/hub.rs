//! TCP fanout hub.
//!
//! A standalone listener that lets several tether instances share one
//! [`LocalHub`]. Each TCP client is one attached link. Frames are JSON, one
//! per line:
//!
//!   client -> hub: `{"op":"sub","user":N}`, `{"op":"unsub","user":N}`,
//!                  `{"op":"pub","user":N,"payload":"..."}`
//!   hub -> client: `{"op":"msg","user":N,"payload":"..."}`

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

use tether_types::models::UserId;

use crate::error::ChatError;
use crate::fanout::{FanoutChannel, FanoutMessage, FanoutReceiver, LocalHub};

/// Maximum frame size (1 MiB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum HubFrame {
    Sub { user: UserId },
    Unsub { user: UserId },
    Pub { user: UserId, payload: String },
    Msg { user: UserId, payload: String },
}

fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    let sock_ref = SockRef::from(stream);
    sock_ref.set_nodelay(true)?;
    sock_ref.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))?;
    Ok(())
}

// -- Server --

/// Shared state for all hub connections.
#[derive(Clone, Default)]
pub struct HubServer {
    hub: LocalHub,
}

impl HubServer {
    pub fn new(hub: LocalHub) -> Self {
        Self { hub }
    }

    /// Accept hub clients. Runs until the task is cancelled.
    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("Fanout hub: new connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            warn!("Fanout hub connection error: {}", e);
                        }
                        info!("Fanout hub: {} disconnected", addr);
                    });
                }
                Err(e) => {
                    error!("Fanout hub accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        configure_socket(&stream)?;
        let (reader, writer) = stream.into_split();
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_SIZE));
        let mut sink = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_FRAME_SIZE));

        // The link detaches from the hub when this function returns
        let (link, mut inbound) = self.hub.attach();

        // Writer task: hub deliveries -> socket
        let mut writer_task = tokio::spawn(async move {
            while let Some(FanoutMessage { user_id, payload }) = inbound.recv().await {
                let frame = HubFrame::Msg {
                    user: user_id,
                    payload,
                };
                let line = serde_json::to_string(&frame)?;
                sink.send(line).await?;
            }
            anyhow::Ok(())
        });

        let result = loop {
            tokio::select! {
                line = lines.next() => {
                    let Some(line) = line else { break Ok(()) };
                    let frame = match serde_json::from_str::<HubFrame>(&line?) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Fanout hub: bad frame: {}", e);
                            continue;
                        }
                    };
                    match frame {
                        HubFrame::Sub { user } => link.subscribe(user)?,
                        HubFrame::Unsub { user } => link.unsubscribe(user)?,
                        HubFrame::Pub { user, payload } => link.publish(user, &payload)?,
                        HubFrame::Msg { user, .. } => {
                            warn!("Fanout hub: client sent a msg frame for {}", user);
                        }
                    }
                }
                done = &mut writer_task => {
                    break match done {
                        Ok(result) => result,
                        Err(e) => Err(e.into()),
                    };
                }
            }
        };

        writer_task.abort();
        result
    }
}

// -- Client --

/// Connection from one tether instance to a remote [`HubServer`].
///
/// Calls only queue frames for the writer task; once the hub connection is
/// gone they fail with [`ChatError::FanoutUnavailable`].
pub struct RemoteLink {
    tx: mpsc::UnboundedSender<HubFrame>,
}

impl RemoteLink {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> anyhow::Result<(Self, FanoutReceiver)> {
        let stream = TcpStream::connect(addr).await?;
        configure_socket(&stream)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let (tx, mut outbound) = mpsc::unbounded_channel::<HubFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_FRAME_SIZE));
            while let Some(frame) = outbound.recv().await {
                let line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Fanout: failed to encode frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    warn!("Fanout: hub write failed: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_SIZE));
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Fanout: hub read failed: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<HubFrame>(&line) {
                    Ok(HubFrame::Msg { user, payload }) => {
                        let msg = FanoutMessage {
                            user_id: user,
                            payload,
                        };
                        if inbound_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(other) => debug!("Fanout: ignoring unexpected frame {:?}", other),
                    Err(e) => warn!("Fanout: bad frame from hub: {}", e),
                }
            }
            warn!("Fanout: connection to hub {} closed", peer);
        });

        info!("Connected to fanout hub at {}", peer);
        Ok((Self { tx }, inbound_rx))
    }

    fn send(&self, frame: HubFrame) -> Result<(), ChatError> {
        self.tx
            .send(frame)
            .map_err(|_| ChatError::FanoutUnavailable("hub connection closed".into()))
    }
}

impl FanoutChannel for RemoteLink {
    fn subscribe(&self, user_id: UserId) -> Result<(), ChatError> {
        self.send(HubFrame::Sub { user: user_id })
    }

    fn unsubscribe(&self, user_id: UserId) -> Result<(), ChatError> {
        self.send(HubFrame::Unsub { user: user_id })
    }

    fn publish(&self, user_id: UserId, payload: &str) -> Result<(), ChatError> {
        self.send(HubFrame::Pub {
            user: user_id,
            payload: payload.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn start_hub() -> (LocalHub, std::net::SocketAddr) {
        let hub = LocalHub::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(HubServer::new(hub.clone()).run(listener));
        (hub, addr)
    }

    async fn wait_for_subscribers(hub: &LocalHub, user: UserId, count: usize) {
        timeout(Duration::from_secs(5), async {
            while hub.subscriber_count(user) != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription never reached the hub");
    }

    #[test]
    fn frames_use_op_tags() {
        let frame = HubFrame::Pub {
            user: 3,
            payload: "{\"msgid\":6}".into(),
        };
        let line = serde_json::to_string(&frame).unwrap();
        assert_eq!(line, r#"{"op":"pub","user":3,"payload":"{\"msgid\":6}"}"#);
        assert_eq!(serde_json::from_str::<HubFrame>(&line).unwrap(), frame);
    }

    #[tokio::test]
    async fn publish_crosses_the_hub_between_instances() {
        let (hub, addr) = start_hub().await;
        let (east, mut east_rx) = RemoteLink::connect(addr).await.unwrap();
        let (west, _west_rx) = RemoteLink::connect(addr).await.unwrap();

        east.subscribe(7).unwrap();
        wait_for_subscribers(&hub, 7, 1).await;

        west.publish(7, "hello east").unwrap();
        let msg = timeout(Duration::from_secs(5), east_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.user_id, 7);
        assert_eq!(msg.payload, "hello east");

        east.unsubscribe(7).unwrap();
        wait_for_subscribers(&hub, 7, 0).await;
    }

    #[tokio::test]
    async fn disconnecting_client_loses_its_subscriptions() {
        let (hub, addr) = start_hub().await;
        let (link, rx) = RemoteLink::connect(addr).await.unwrap();
        link.subscribe(9).unwrap();
        wait_for_subscribers(&hub, 9, 1).await;

        drop(link);
        drop(rx);
        wait_for_subscribers(&hub, 9, 0).await;
    }
}
