//! End-to-end behavior of the channel supply endpoint.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{start_http_endpoint, ws_url};
use ws_hosting::{
    BinaryChannel, BoxError, ChannelEvent, ChannelSubscriber, ChannelSupplyHandler, TextChannel,
    WebSocketChannelSupplyEndpoint, WebSocketEndpointConfig,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(url: &str, protocol: Option<&str>) -> (WsClient, u16, Option<String>) {
    let mut request = url.into_client_request().unwrap();
    if let Some(protocol) = protocol {
        request
            .headers_mut()
            .insert("sec-websocket-protocol", protocol.parse().unwrap());
    }
    let (stream, response) = connect_async(request).await.unwrap();
    let accepted = response
        .headers()
        .get("sec-websocket-protocol")
        .map(|v| v.to_str().unwrap().to_owned());
    (stream, response.status().as_u16(), accepted)
}

async fn expect_text(stream: &mut WsClient) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for text frame")
        .expect("stream ended")
        .expect("transport error");
    match frame {
        Message::Text(payload) => payload.as_str().to_owned(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn expect_close_code(stream: &mut WsClient) -> u16 {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for close frame")
            .expect("stream ended without close frame")
            .expect("transport error before close");
        match frame {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Close(None) => panic!("close frame carried no code"),
            _ => continue,
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..50 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not met within five seconds");
}

/// Echoes text payloads back as `echo:<payload>`.
struct EchoHandler;

impl ChannelSupplyHandler for EchoHandler {
    fn on_open_text_channel(&self, channel: &Arc<TextChannel>) -> Result<(), BoxError> {
        channel.subscribe(Arc::new(TextEcho {
            channel: Arc::downgrade(channel),
        }));
        Ok(())
    }
}

struct TextEcho {
    channel: Weak<TextChannel>,
}

#[async_trait]
impl ChannelSubscriber<String> for TextEcho {
    async fn on_event(&self, event: ChannelEvent<String>) -> Result<(), BoxError> {
        if let ChannelEvent::Data(payload) = event {
            if let Some(channel) = self.channel.upgrade() {
                channel
                    .send(format!("echo:{payload}"))
                    .await
                    .map_err(|e| Box::new(e) as BoxError)?;
            }
        }
        Ok(())
    }
}

/// Records every event and optionally fails on data.
struct Recording {
    events: Mutex<Vec<String>>,
    fail_on_data: bool,
}

impl Recording {
    fn new(fail_on_data: bool) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail_on_data,
        })
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelSubscriber<String> for Recording {
    async fn on_event(&self, event: ChannelEvent<String>) -> Result<(), BoxError> {
        match event {
            ChannelEvent::Data(payload) => {
                self.events.lock().unwrap().push(format!("data:{payload}"));
                if self.fail_on_data {
                    return Err("subscriber refused payload".into());
                }
                Ok(())
            }
            ChannelEvent::Fault(fault) => {
                self.events.lock().unwrap().push(format!("fault:{fault}"));
                Ok(())
            }
        }
    }
}

#[tokio::test]
async fn text_echo_roundtrip() {
    let endpoint = start_http_endpoint().await;
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(EchoHandler),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, status, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    assert_eq!(status, 101);

    client.send(Message::text("ping")).await.unwrap();
    assert_eq!(expect_text(&mut client).await, "echo:ping");

    ws.dispose().await;
    endpoint.dispose().await;
}

#[tokio::test]
async fn first_proposed_protocol_is_echoed() {
    let endpoint = start_http_endpoint().await;
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text").with_allowed_protocols(["bin"]),
        Arc::new(EchoHandler),
    );
    ws.bind(&endpoint).unwrap();

    let (_client, _, accepted) = connect(&ws_url(&endpoint, "/ws"), Some("bin")).await;
    assert_eq!(accepted.as_deref(), Some("bin"));

    ws.dispose().await;
    endpoint.dispose().await;
}

#[tokio::test]
async fn disallowed_protocol_is_closed_1007() {
    let endpoint = start_http_endpoint().await;
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(EchoHandler),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, _, _) = connect(&ws_url(&endpoint, "/ws"), Some("exotic")).await;
    assert_eq!(expect_close_code(&mut client).await, 1007);

    ws.dispose().await;
    endpoint.dispose().await;
}

struct FanoutHandler {
    failing: Arc<Recording>,
    healthy: Arc<Recording>,
}

impl ChannelSupplyHandler for FanoutHandler {
    fn on_open_text_channel(&self, channel: &Arc<TextChannel>) -> Result<(), BoxError> {
        channel.subscribe(self.failing.clone());
        channel.subscribe(self.healthy.clone());
        Ok(())
    }
}

#[tokio::test]
async fn subscriber_failure_breaks_channel_with_1011() {
    let endpoint = start_http_endpoint().await;
    let failing = Recording::new(true);
    let healthy = Recording::new(false);
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(FanoutHandler {
            failing: failing.clone(),
            healthy: healthy.clone(),
        }),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, _, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    client.send(Message::text("boom")).await.unwrap();
    client.send(Message::text("after")).await.unwrap();

    assert_eq!(expect_close_code(&mut client).await, 1011);

    // The healthy subscriber saw the payload and then the fault, and the
    // payload behind the break never reached it.
    wait_until(|| healthy.events().len() >= 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let events = healthy.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], "data:boom");
    assert!(events[1].starts_with("fault:"));

    // The failing subscriber hears about its own mess too.
    wait_until(|| failing.events().len() == 2).await;

    ws.dispose().await;
    endpoint.dispose().await;
}

struct KindsHandler {
    order: Arc<Mutex<Vec<&'static str>>>,
}

impl ChannelSupplyHandler for KindsHandler {
    fn on_open_binary_channel(&self, _channel: &Arc<BinaryChannel>) -> Result<(), BoxError> {
        self.order.lock().unwrap().push("binary");
        Ok(())
    }

    fn on_open_text_channel(&self, _channel: &Arc<TextChannel>) -> Result<(), BoxError> {
        self.order.lock().unwrap().push("text");
        Ok(())
    }
}

#[tokio::test]
async fn one_channel_per_payload_kind_in_arrival_order() {
    let endpoint = start_http_endpoint().await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(KindsHandler { order: order.clone() }),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, _, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    client.send(Message::binary(vec![0x01])).await.unwrap();
    client.send(Message::text("first text")).await.unwrap();
    client.send(Message::binary(vec![0x02])).await.unwrap();
    client.send(Message::text("second text")).await.unwrap();

    // Each kind opened exactly one channel, binary first.
    wait_until(|| order.lock().unwrap().len() >= 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*order.lock().unwrap(), vec!["binary", "text"]);

    ws.dispose().await;
    endpoint.dispose().await;
}

struct CaptureHandler {
    slot: Arc<Mutex<Option<Arc<TextChannel>>>>,
}

impl ChannelSupplyHandler for CaptureHandler {
    fn on_open_text_channel(&self, channel: &Arc<TextChannel>) -> Result<(), BoxError> {
        *self.slot.lock().unwrap() = Some(channel.clone());
        Ok(())
    }
}

#[tokio::test]
async fn send_after_connection_close_is_rejected() {
    let endpoint = start_http_endpoint().await;
    let slot = Arc::new(Mutex::new(None));
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(CaptureHandler { slot: slot.clone() }),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, _, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    client.send(Message::text("open sesame")).await.unwrap();
    wait_until(|| slot.lock().unwrap().is_some()).await;

    client.close(None).await.unwrap();
    wait_until(|| ws.active_connections() == 0).await;

    let channel = slot.lock().unwrap().clone().unwrap();
    let err = channel.send("too late".to_string()).await.unwrap_err();
    assert!(matches!(
        err,
        ws_hosting::HostingError::InvalidOperation(_)
    ));

    ws.dispose().await;
    endpoint.dispose().await;
}

struct RejectingHandler;

impl ChannelSupplyHandler for RejectingHandler {
    fn on_open_text_channel(&self, _channel: &Arc<TextChannel>) -> Result<(), BoxError> {
        Err("no channels today".into())
    }
}

#[tokio::test]
async fn open_hook_failure_closes_1011() {
    let endpoint = start_http_endpoint().await;
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(RejectingHandler),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, _, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    client.send(Message::text("hello")).await.unwrap();
    assert_eq!(expect_close_code(&mut client).await, 1011);

    ws.dispose().await;
    endpoint.dispose().await;
}

#[tokio::test]
async fn unhandled_payload_kind_closes_1011() {
    let endpoint = start_http_endpoint().await;
    // EchoHandler leaves the binary hook at its rejecting default.
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(EchoHandler),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, _, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    client
        .send(Message::binary(vec![0x01, 0x02]))
        .await
        .unwrap();
    assert_eq!(expect_close_code(&mut client).await, 1011);

    ws.dispose().await;
    endpoint.dispose().await;
}

/// Records fault events seen on a binary channel.
struct BinaryFaultLog {
    faults: Mutex<Vec<String>>,
}

#[async_trait]
impl ChannelSubscriber<bytes::Bytes> for BinaryFaultLog {
    async fn on_event(&self, event: ChannelEvent<bytes::Bytes>) -> Result<(), BoxError> {
        if let ChannelEvent::Fault(fault) = event {
            self.faults.lock().unwrap().push(fault.to_string());
        }
        Ok(())
    }
}

struct SplitHandler {
    faults: Arc<BinaryFaultLog>,
}

impl ChannelSupplyHandler for SplitHandler {
    fn on_open_binary_channel(&self, channel: &Arc<BinaryChannel>) -> Result<(), BoxError> {
        channel.subscribe(self.faults.clone());
        Ok(())
    }

    fn on_open_text_channel(&self, channel: &Arc<TextChannel>) -> Result<(), BoxError> {
        channel.subscribe(Recording::new(true));
        Ok(())
    }
}

#[tokio::test]
async fn surviving_channel_sees_the_actual_close_code() {
    let endpoint = start_http_endpoint().await;
    let faults = Arc::new(BinaryFaultLog {
        faults: Mutex::new(Vec::new()),
    });
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(SplitHandler {
            faults: faults.clone(),
        }),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, _, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    client.send(Message::binary(vec![0x01])).await.unwrap();
    client.send(Message::text("boom")).await.unwrap();
    assert_eq!(expect_close_code(&mut client).await, 1011);

    // The binary channel's close fault carries the 1011 the broken text
    // channel closed the connection with.
    wait_until(|| !faults.faults.lock().unwrap().is_empty()).await;
    let recorded = faults.faults.lock().unwrap().clone();
    assert!(recorded[0].contains("code 1011"), "got {recorded:?}");

    ws.dispose().await;
    endpoint.dispose().await;
}

#[tokio::test]
async fn dispose_closes_connections_going_away() {
    let endpoint = start_http_endpoint().await;
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(EchoHandler),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, _, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    // Make sure the connection is registered before disposing.
    client.send(Message::text("ping")).await.unwrap();
    assert_eq!(expect_text(&mut client).await, "echo:ping");

    ws.dispose().await;
    assert_eq!(expect_close_code(&mut client).await, 1001);

    // Connections arriving during teardown are turned away the same way.
    let (mut late, _, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    assert_eq!(expect_close_code(&mut late).await, 1001);

    endpoint.dispose().await;
}

#[tokio::test]
async fn dispose_racing_with_new_connections_leaves_none_behind() {
    let endpoint = start_http_endpoint().await;
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(EchoHandler),
    );
    ws.bind(&endpoint).unwrap();

    let url = ws_url(&endpoint, "/ws");
    let mut clients = Vec::new();
    for _ in 0..8 {
        let url = url.clone();
        clients.push(tokio::spawn(async move {
            let (mut client, _, _) = connect(&url, None).await;
            expect_close_code(&mut client).await
        }));
    }
    tokio::task::yield_now().await;
    ws.dispose().await;

    // Every racing client is closed going-away, whether it registered
    // before the teardown drained the connection table or after.
    for task in clients {
        assert_eq!(task.await.unwrap(), 1001);
    }
    assert_eq!(ws.active_connections(), 0);

    endpoint.dispose().await;
}

/// Unsubscribes itself after the first payload.
struct OneShot {
    channel: Weak<TextChannel>,
    me: Mutex<Option<Arc<dyn ChannelSubscriber<String>>>>,
    seen: AtomicUsize,
}

#[async_trait]
impl ChannelSubscriber<String> for OneShot {
    async fn on_event(&self, event: ChannelEvent<String>) -> Result<(), BoxError> {
        if matches!(event, ChannelEvent::Data(_)) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if let (Some(channel), Some(me)) =
                (self.channel.upgrade(), self.me.lock().unwrap().take())
            {
                channel.unsubscribe(&me);
            }
        }
        Ok(())
    }
}

struct OneShotHandler {
    seen: Arc<AtomicUsize>,
}

impl ChannelSupplyHandler for OneShotHandler {
    fn on_open_text_channel(&self, channel: &Arc<TextChannel>) -> Result<(), BoxError> {
        let one_shot = Arc::new(OneShot {
            channel: Arc::downgrade(channel),
            me: Mutex::new(None),
            seen: AtomicUsize::new(0),
        });
        *one_shot.me.lock().unwrap() =
            Some(one_shot.clone() as Arc<dyn ChannelSubscriber<String>>);
        channel.subscribe(one_shot.clone());

        // Mirror the per-channel counter into the test.
        let seen = self.seen.clone();
        channel.subscribe(Arc::new(CountMirror { one_shot, seen }));
        Ok(())
    }
}

struct CountMirror {
    one_shot: Arc<OneShot>,
    seen: Arc<AtomicUsize>,
}

#[async_trait]
impl ChannelSubscriber<String> for CountMirror {
    async fn on_event(&self, event: ChannelEvent<String>) -> Result<(), BoxError> {
        if matches!(event, ChannelEvent::Data(_)) {
            self.seen
                .store(self.one_shot.seen.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        Ok(())
    }
}

#[tokio::test]
async fn subscriber_can_unsubscribe_itself_mid_dispatch() {
    let endpoint = start_http_endpoint().await;
    let seen = Arc::new(AtomicUsize::new(0));
    let ws = WebSocketChannelSupplyEndpoint::new(
        WebSocketEndpointConfig::new("/ws", "text"),
        Arc::new(OneShotHandler { seen: seen.clone() }),
    );
    ws.bind(&endpoint).unwrap();

    let (mut client, _, _) = connect(&ws_url(&endpoint, "/ws"), None).await;
    client.send(Message::text("first")).await.unwrap();
    client.send(Message::text("second")).await.unwrap();
    client.send(Message::text("third")).await.unwrap();

    // The one-shot subscriber only ever saw the first payload.
    wait_until(|| seen.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    ws.dispose().await;
    endpoint.dispose().await;
}

#[allow(dead_code)]
fn assert_traits() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<Arc<BinaryChannel>>();
    is_send_sync::<Arc<TextChannel>>();
}
