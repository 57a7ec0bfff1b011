use crate::error::{NetworkError, NetworkResult};
use crate::multipart::{self, Frames};
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use log::{debug, warn};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// How many times to attempt a connection before giving up.
const CONNECT_ATTEMPTS: usize = 50;
/// Budget for a single connection attempt, and the spacing between attempts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// The capacity of the request queue feeding the connection task.
const CHANNEL_CAPACITY: usize = 1_000;

struct Request {
    payload: Bytes,
    replier: oneshot::Sender<NetworkResult<Vec<u8>>>,
}

/// A unicast request/response channel to one peer's router endpoint.
///
/// Requests are strictly serialized: the owning task writes request `i+1`
/// only after request `i`'s reply was fully read, so a channel never
/// interleaves two exchanges.
#[derive(Clone)]
pub struct PeerChannel {
    tx: mpsc::Sender<Request>,
}

impl PeerChannel {
    /// Spawn the connection task for a peer. The connection itself is
    /// established lazily on the first request.
    pub fn spawn(address: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            Connection {
                address,
                rx,
                transport: None,
            }
            .run()
            .await;
        });
        Self { tx }
    }

    /// Send a multipart request and await the single reply frame.
    pub async fn send(&self, frames: Frames) -> NetworkResult<Vec<u8>> {
        let (sender, receiver) = oneshot::channel();
        let request = Request {
            payload: multipart::encode(&frames),
            replier: sender,
        };
        self.tx
            .send(request)
            .await
            .map_err(|_| NetworkError::ChannelClosed)?;
        receiver.await.map_err(|_| NetworkError::ChannelClosed)?
    }
}

struct Connection {
    address: SocketAddr,
    rx: mpsc::Receiver<Request>,
    transport: Option<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl Connection {
    async fn run(&mut self) {
        while let Some(Request { payload, replier }) = self.rx.recv().await {
            let result = self.request(payload).await;
            if let Err(e) = &result {
                warn!("{}", e);
                // Drop the stream so the next request reconnects.
                self.transport = None;
            }
            let _ = replier.send(result);
        }
        debug!("Channel to {} shut down", self.address);
    }

    async fn connect(&mut self) -> NetworkResult<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        for attempt in 1..=CONNECT_ATTEMPTS {
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address)).await {
                Ok(Ok(stream)) => {
                    debug!("Connected to {} (attempt {})", self.address, attempt);
                    self.transport = Some(Framed::new(stream, LengthDelimitedCodec::new()));
                    return Ok(());
                }
                _ => sleep(CONNECT_TIMEOUT).await,
            }
        }
        Err(NetworkError::FailedToConnect(self.address, CONNECT_ATTEMPTS))
    }

    async fn request(&mut self, payload: Bytes) -> NetworkResult<Vec<u8>> {
        self.connect().await?;
        let transport = self.transport.as_mut().expect("Transport was just connected");
        transport
            .send(payload)
            .await
            .map_err(|e| NetworkError::FailedToSend(self.address, e))?;
        match transport.next().await {
            Some(Ok(reply)) => Ok(reply.to_vec()),
            Some(Err(e)) => Err(NetworkError::FailedToReceive(self.address, e)),
            None => Err(NetworkError::Disconnected(self.address)),
        }
    }
}

/// One-shot request outside any peer channel (peer discovery). Retries the
/// connection with the same bounded budget, sends the frames, and awaits the
/// single reply frame.
pub async fn send_unsigned(address: SocketAddr, frames: Frames) -> NetworkResult<Vec<u8>> {
    let payload = multipart::encode(&frames);
    let mut stream = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(Ok(socket)) => {
                stream = Some(socket);
                break;
            }
            _ => sleep(CONNECT_TIMEOUT).await,
        }
    }
    let socket = stream.ok_or(NetworkError::FailedToConnect(address, CONNECT_ATTEMPTS))?;
    let mut transport = Framed::new(socket, LengthDelimitedCodec::new());
    transport
        .send(payload)
        .await
        .map_err(|e| NetworkError::FailedToSend(address, e))?;
    match transport.next().await {
        Some(Ok(reply)) => Ok(reply.to_vec()),
        Some(Err(e)) => Err(NetworkError::FailedToReceive(address, e)),
        None => Err(NetworkError::Disconnected(address)),
    }
}
