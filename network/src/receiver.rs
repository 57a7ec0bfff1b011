use crate::error::NetworkError;
use crate::multipart::{self, Frames};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, StreamExt};
use log::{debug, info, warn};
use std::error::Error;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// The writer half handlers use to reply. Replies are a single frame.
pub type Writer = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;

/// Defines how the receiver dispatches incoming multipart requests.
#[async_trait]
pub trait MessageHandler: Clone + Send + Sync + 'static {
    async fn dispatch(&self, writer: &mut Writer, frames: Frames) -> Result<(), Box<dyn Error>>;
}

/// The router endpoint: accepts connections from peers and feeds each
/// request to the message handler.
pub struct Receiver<Handler: MessageHandler> {
    /// Address to listen to.
    address: SocketAddr,
    /// Struct responsible to define how to handle received messages.
    handler: Handler,
}

impl<Handler: MessageHandler> Receiver<Handler> {
    pub fn spawn(address: SocketAddr, handler: Handler) {
        tokio::spawn(async move {
            Self { address, handler }.run().await;
        });
    }

    async fn run(&self) {
        let listener = TcpListener::bind(&self.address)
            .await
            .unwrap_or_else(|e| panic!("Failed to bind router address {}: {}", self.address, e));

        info!("Listening on {}", self.address);
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(value) => value,
                Err(e) => {
                    warn!("{}", NetworkError::FailedToReceive(self.address, e));
                    continue;
                }
            };
            debug!("Incoming connection established with {}", peer);
            Self::spawn_runner(socket, peer, self.handler.clone()).await;
        }
    }

    async fn spawn_runner(socket: TcpStream, peer: SocketAddr, handler: Handler) {
        tokio::spawn(async move {
            let transport = Framed::new(socket, LengthDelimitedCodec::new());
            let (mut writer, mut reader) = transport.split();
            while let Some(unit) = reader.next().await {
                let frames = match unit {
                    Ok(bytes) => match multipart::decode(&bytes) {
                        Ok(frames) => frames,
                        Err(e) => {
                            warn!("{}", e);
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!("{}", NetworkError::FailedToReceive(peer, e));
                        break;
                    }
                };
                if let Err(e) = handler.dispatch(&mut writer, frames).await {
                    warn!("{}", e);
                    continue;
                }
            }
            debug!("Connection with {} closed", peer);
        });
    }
}
