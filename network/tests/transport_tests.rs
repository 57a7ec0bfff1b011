use async_trait::async_trait;
use bytes::Bytes;
use futures::sink::SinkExt;
use network::multipart::Frames;
use network::peer_channel::{send_unsigned, PeerChannel};
use network::publisher::Publisher;
use network::receiver::{MessageHandler, Receiver, Writer};
use network::subscriber::Subscriber;
use std::error::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

/// A handler replying with the body frame it received.
#[derive(Clone)]
struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn dispatch(&self, writer: &mut Writer, frames: Frames) -> Result<(), Box<dyn Error>> {
        let body = frames.get(2).cloned().unwrap_or_default();
        writer.send(Bytes::from(body)).await?;
        Ok(())
    }
}

fn request(body: &[u8]) -> Frames {
    vec![b"test-node".to_vec(), Vec::new(), body.to_vec()]
}

#[tokio::test]
async fn channel_request_reply() {
    let address = "127.0.0.1:9100".parse().unwrap();
    Receiver::spawn(address, EchoHandler);
    tokio::task::yield_now().await;

    let channel = PeerChannel::spawn(address);
    let reply = channel.send(request(b"hello")).await.unwrap();
    assert_eq!(reply, b"hello");
}

#[tokio::test]
async fn channel_serializes_requests() {
    let address = "127.0.0.1:9101".parse().unwrap();
    Receiver::spawn(address, EchoHandler);
    tokio::task::yield_now().await;

    // Many concurrent requests on one channel each get their own reply.
    let channel = PeerChannel::spawn(address);
    let handles: Vec<_> = (0..10u8)
        .map(|i| {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send(request(&[i])).await.unwrap() })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), vec![i as u8]);
    }
}

#[tokio::test]
async fn unsigned_one_shot() {
    let address = "127.0.0.1:9102".parse().unwrap();
    Receiver::spawn(address, EchoHandler);
    tokio::task::yield_now().await;

    let reply = send_unsigned(address, request(b"ping")).await.unwrap();
    assert_eq!(reply, b"ping");
}

#[tokio::test]
async fn publish_subscribe_with_topic_filter() {
    let address = "127.0.0.1:9103".parse().unwrap();
    let publisher = Publisher::spawn(address, /* interval */ 0.05);

    let (tx_output, mut rx_output) = mpsc::channel(100);
    let subscriber = Subscriber::spawn(tx_output);
    subscriber.subscribe("yolo".to_string()).await;
    subscriber.connect(address).await;
    sleep(Duration::from_millis(100)).await;

    // A flush on a subscribed topic is received.
    publisher
        .queue("yolo".to_string(), "Hey bro".to_string(), "sig".to_string())
        .await;
    let (topic, body, signature) = timeout(Duration::from_secs(2), rx_output.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "yolo");
    assert_eq!(body, b"Hey bro");
    assert_eq!(signature, b"sig");

    // A flush on another topic is filtered out.
    publisher
        .queue("tumbo".to_string(), "nope".to_string(), "sig".to_string())
        .await;
    assert!(timeout(Duration::from_millis(300), rx_output.recv())
        .await
        .is_err());

    // After unsubscribing, the original topic is filtered out too.
    subscriber.unsubscribe("yolo".to_string()).await;
    publisher
        .queue("yolo".to_string(), "again".to_string(), "sig".to_string())
        .await;
    assert!(timeout(Duration::from_millis(300), rx_output.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn flush_batches_many_responses() {
    let address = "127.0.0.1:9104".parse().unwrap();
    let publisher = Publisher::spawn(address, 0.2);

    let (tx_output, mut rx_output) = mpsc::channel(100);
    let subscriber = Subscriber::spawn(tx_output);
    subscriber.subscribe("a".to_string()).await;
    subscriber.subscribe("b".to_string()).await;
    subscriber.connect(address).await;
    sleep(Duration::from_millis(100)).await;

    // Two responses queued inside one flush window arrive in order.
    publisher.queue("a".to_string(), "1".to_string(), "s1".to_string()).await;
    publisher.queue("b".to_string(), "2".to_string(), "s2".to_string()).await;

    let first = timeout(Duration::from_secs(2), rx_output.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), rx_output.recv()).await.unwrap().unwrap();
    assert_eq!(first.0, "a");
    assert_eq!(second.0, "b");
}
