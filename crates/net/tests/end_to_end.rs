//! Hub and links talking over real sockets

use std::time::Duration;

use jetlink_net::{
    prepare_outgoing, ContentType, Envelope, EnvelopeKind, Error, Hub, HubConfig, InboundMessage,
    Inbox, Link, LinkConfig, LinkState, MessageSink, Silent, SinkError,
};
use std::sync::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

fn link_config(addr: std::net::SocketAddr) -> LinkConfig {
    LinkConfig {
        retry_interval_ms: 100,
        ..LinkConfig::for_addr(addr)
    }
}

async fn wait_connected(link: &Link) {
    let mut rx = link.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == LinkState::Connected))
        .await
        .expect("link did not connect")
        .unwrap();
}

async fn wait_peers(hub: &Hub, n: usize) {
    for _ in 0..250 {
        if hub.peer_count().await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hub never reached {n} peers");
}

async fn next_message(rx: &mut broadcast::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no message in time")
        .unwrap()
}

#[tokio::test]
async fn message_reaches_every_peer_including_sender() {
    let hub = Hub::new(HubConfig::ephemeral());
    let addr = hub.start().await.unwrap();

    let a = Link::connect(link_config(addr), "u1").unwrap();
    let b = Link::connect(link_config(addr), "u2").unwrap();
    let mut a_rx = a.subscribe_messages();
    let mut b_rx = b.subscribe_messages();
    wait_connected(&a).await;
    wait_connected(&b).await;
    wait_peers(&hub, 2).await;

    a.send(Some("u2"), ContentType::Text, "hi", None).await.unwrap();

    let at_b = next_message(&mut b_rx).await;
    assert_eq!(at_b.kind, EnvelopeKind::Message);
    assert_eq!(at_b.from, "u1");
    assert_eq!(at_b.payload.as_ref().unwrap().content, "hi");
    assert!(!b.is_self_origin(&at_b));

    // The sender hears its own message and must recognise it
    let at_a = next_message(&mut a_rx).await;
    assert_eq!(at_a, at_b);
    assert!(a.is_self_origin(&at_a));

    a.disconnect().await;
    b.disconnect().await;
    hub.stop().await;
}

#[tokio::test]
async fn typing_signal_relayed() {
    let hub = Hub::new(HubConfig::ephemeral());
    let addr = hub.start().await.unwrap();

    let a = Link::connect(link_config(addr), "u1").unwrap();
    let b = Link::connect(link_config(addr), "u2").unwrap();
    let mut typing = b.subscribe_typing();
    wait_connected(&a).await;
    wait_connected(&b).await;
    wait_peers(&hub, 2).await;

    a.notify_typing(Some("u2"));

    let signal = tokio::time::timeout(WAIT, typing.recv()).await.unwrap().unwrap();
    assert_eq!(signal.from, "u1");
    assert_eq!(signal.to.as_deref(), Some("u2"));

    a.disconnect().await;
    b.disconnect().await;
    hub.stop().await;
}

#[tokio::test]
async fn links_survive_hub_restart() {
    let hub = Hub::new(HubConfig::ephemeral());
    let addr = hub.start().await.unwrap();

    let link = Link::connect(link_config(addr), "u1").unwrap();
    wait_connected(&link).await;
    wait_peers(&hub, 1).await;

    // Subscribe while connected so the drop is observed as a change
    let mut states = link.watch_state();
    hub.stop().await;
    tokio::time::timeout(WAIT, states.wait_for(|s| *s != LinkState::Connected))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        link.send(None, ContentType::Text, "nobody home", None).await,
        Err(Error::NotConnected)
    ));
    // Never an error while the hub is away
    link.notify_typing(None);

    let restarted = Hub::new(HubConfig {
        port: addr.port(),
        ..HubConfig::ephemeral()
    });
    restarted.start().await.unwrap();
    wait_connected(&link).await;
    wait_peers(&restarted, 1).await;

    let mut rx = link.subscribe_messages();
    link.send(None, ContentType::Text, "back", None).await.unwrap();
    assert_eq!(
        next_message(&mut rx).await.payload.unwrap().content,
        "back"
    );

    link.disconnect().await;
    restarted.stop().await;
}

#[tokio::test]
async fn hub_stop_closes_peer_connections() {
    let hub = Hub::new(HubConfig::ephemeral());
    let addr = hub.start().await.unwrap();

    let raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_peers(&hub, 1).await;
    hub.stop().await;

    let mut raw = raw;
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, raw.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[derive(Default)]
struct Downloads {
    images: Mutex<Vec<Vec<u8>>>,
    rows: Mutex<Vec<InboundMessage>>,
}

impl MessageSink for Downloads {
    fn save_image(&self, bytes: &[u8]) -> Result<String, SinkError> {
        let mut images = self.images.lock().unwrap();
        images.push(bytes.to_vec());
        Ok(format!("file:///downloads/{}.jpg", images.len()))
    }

    fn insert(&self, message: InboundMessage) -> Result<i64, SinkError> {
        let mut rows = self.rows.lock().unwrap();
        rows.push(message);
        Ok(rows.len() as i64)
    }
}

#[tokio::test]
async fn image_travels_through_the_hub() {
    use image::{ImageBuffer, ImageEncoder, Rgb};

    let source = ImageBuffer::from_fn(1600, 1200, |x, y| Rgb([(x / 7) as u8, (y / 5) as u8, 90]));
    let mut png = Vec::new();
    image::codecs::png::PngEncoder::new(&mut png)
        .write_image(source.as_raw(), 1600, 1200, image::ColorType::Rgb8)
        .unwrap();
    let prepared = prepare_outgoing(&png).unwrap();

    let hub = Hub::new(HubConfig::ephemeral());
    let addr = hub.start().await.unwrap();
    let a = Link::connect(link_config(addr), "u1").unwrap();
    let b = Link::connect(link_config(addr), "u2").unwrap();
    let mut b_rx = b.subscribe_messages();
    wait_connected(&a).await;
    wait_connected(&b).await;
    wait_peers(&hub, 2).await;

    a.send(Some("u2"), ContentType::Image, prepared, Some(12))
        .await
        .unwrap();

    let inbox = Inbox::new("u2", Downloads::default(), Silent);
    let delivery = inbox.accept(next_message(&mut b_rx).await).unwrap().unwrap();
    assert_eq!(delivery.sender_id, "u1");

    let image_bytes = inbox.sink().images.lock().unwrap()[0].clone();
    let decoded = image::load_from_memory(&image_bytes).unwrap();
    assert!(decoded.width().max(decoded.height()) <= 1024);

    let row = inbox.sink().rows.lock().unwrap()[0].clone();
    assert_eq!(row.content, "file:///downloads/1.jpg");
    assert_eq!(row.reply_id, Some(12));

    a.disconnect().await;
    b.disconnect().await;
    hub.stop().await;
}
