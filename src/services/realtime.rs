use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Config,
    error::{AppError, Result},
    models::realtime::{ChangeEvent, ChangeKind, ChannelMessage},
    services::remote::ChangeSubscription,
};

/// Supplies the user token a channel joins with.
///
/// Consulted before every join and on every heartbeat, so a refreshed
/// session reaches a long-lived subscription.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// `None` joins with the anon key only.
    async fn access_token(&self) -> Option<String>;
}

/// 实时变更订阅客户端
///
/// Speaks the Phoenix channel protocol of the backend's realtime socket.
/// Each subscription owns one socket, joins one table topic and reconnects
/// on its own until the subscription is dropped.
#[derive(Debug, Clone)]
pub struct RealtimeClient {
    endpoint: Url,
    heartbeat: Duration,
    reconnect: Duration,
    join_timeout: Duration,
}

/// Why a socket session ended.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    /// The subscriber went away.
    Dropped,
    /// The server closed the socket or the channel.
    Disconnected,
}

/// One decoded text frame, seen from the joined topic.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Change(ChangeEvent),
    Joined,
    ChannelDown,
    Other,
}

impl RealtimeClient {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        heartbeat: Duration,
        reconnect: Duration,
        join_timeout: Duration,
    ) -> Result<Self> {
        if heartbeat.is_zero() {
            return Err(AppError::Config("Realtime heartbeat must be greater than 0".to_string()));
        }

        Ok(Self {
            endpoint: Self::endpoint_for(base_url, anon_key)?,
            heartbeat,
            reconnect,
            join_timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.backend_url,
            &config.backend_anon_key,
            Duration::from_secs(config.realtime_heartbeat_secs),
            Duration::from_secs(config.realtime_reconnect_secs),
            config.request_timeout(),
        )
    }

    /// `{base}/realtime/v1/websocket?apikey=..&vsn=1.0.0` on the ws scheme
    /// matching the base URL's http scheme.
    pub fn endpoint_for(base_url: &str, anon_key: &str) -> Result<Url> {
        let mut endpoint = Url::parse(&format!("{}/realtime/v1/websocket", base_url.trim_end_matches('/')))?;
        let scheme = match endpoint.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => return Err(AppError::Config(format!("Unsupported backend scheme: {}", other))),
        };
        endpoint
            .set_scheme(scheme)
            .map_err(|_| AppError::Config(format!("Cannot use {} for the realtime socket", base_url)))?;
        endpoint
            .query_pairs_mut()
            .append_pair("apikey", anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(endpoint)
    }

    /// Starts listening for `kinds` on `table` and returns once the server
    /// acknowledges the first join, or after the join timeout. The returned
    /// subscription stays live across reconnects.
    pub async fn subscribe(
        &self,
        table: &str,
        kinds: &[ChangeKind],
        tokens: Arc<dyn TokenSource>,
    ) -> ChangeSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let (joined_tx, joined_rx) = oneshot::channel();
        let client = self.clone();
        let owned_table = table.to_string();
        let kinds = kinds.to_vec();

        let task = tokio::spawn(async move {
            client.run(&owned_table, &kinds, tokens.as_ref(), tx, joined_tx).await;
        });

        match tokio::time::timeout(self.join_timeout, joined_rx).await {
            Ok(Ok(())) => debug!("Realtime join on {} acknowledged", table),
            _ => warn!("Realtime join on {} not acknowledged in {:?}", table, self.join_timeout),
        }

        ChangeSubscription::new(rx, task)
    }

    async fn run(
        &self,
        table: &str,
        kinds: &[ChangeKind],
        tokens: &dyn TokenSource,
        tx: mpsc::UnboundedSender<ChangeEvent>,
        joined: oneshot::Sender<()>,
    ) {
        let mut joined = Some(joined);
        loop {
            match self.listen(table, kinds, tokens, &tx, &mut joined).await {
                Ok(Exit::Dropped) => {
                    debug!("Realtime subscriber for {} went away", table);
                    return;
                }
                Ok(Exit::Disconnected) => info!("Realtime channel closed for {}, reconnecting", table),
                Err(e) => warn!("Realtime channel for {} failed: {}", table, e),
            }

            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(self.reconnect).await;
        }
    }

    async fn listen(
        &self,
        table: &str,
        kinds: &[ChangeKind],
        tokens: &dyn TokenSource,
        tx: &mpsc::UnboundedSender<ChangeEvent>,
        joined: &mut Option<oneshot::Sender<()>>,
    ) -> Result<Exit> {
        let mut sent_token = tokens.access_token().await;

        let (socket, _) = connect_async(self.endpoint.as_str()).await?;
        let (mut write, mut read) = socket.split();
        let join_ref: u64 = 1;
        let mut msg_ref = join_ref;

        let join = ChannelMessage::join(table, kinds, sent_token.as_deref(), join_ref);
        write.send(Message::Text(serde_json::to_string(&join)?)).await?;
        debug!("Sent join for realtime topic {}", join.topic);

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        // interval fires immediately; the join just went out
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    msg_ref += 1;
                    let beat = ChannelMessage::heartbeat(msg_ref);
                    write.send(Message::Text(serde_json::to_string(&beat)?)).await?;

                    if let Some(token) = tokens.access_token().await {
                        if sent_token.as_deref() != Some(token.as_str()) {
                            msg_ref += 1;
                            let push = ChannelMessage::access_token(table, &token, msg_ref);
                            write.send(Message::Text(serde_json::to_string(&push)?)).await?;
                            debug!("Pushed refreshed access token to {}", join.topic);
                            sent_token = Some(token);
                        }
                    }
                }
                _ = tx.closed() => {
                    let leave = ChannelMessage::leave(table, msg_ref + 1);
                    let _ = write.send(Message::Text(serde_json::to_string(&leave)?)).await;
                    let _ = write.close().await;
                    return Ok(Exit::Dropped);
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match decode_frame(&text, &join.topic, join_ref)? {
                        Frame::Change(event) => {
                            debug!("Realtime {} on {}", event.kind.as_str(), event.table);
                            if tx.send(event).is_err() {
                                return Ok(Exit::Dropped);
                            }
                        }
                        Frame::Joined => {
                            info!("Joined realtime topic {}", join.topic);
                            if let Some(joined) = joined.take() {
                                let _ = joined.send(());
                            }
                        }
                        Frame::ChannelDown => {
                            warn!("Server closed realtime channel {}", join.topic);
                            return Ok(Exit::Disconnected);
                        }
                        Frame::Other => {}
                    },
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => return Ok(Exit::Disconnected),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}

/// Decodes one text frame against the channel joined on `topic` with
/// `join_ref`. A rejected join is an error.
pub fn decode_frame(text: &str, topic: &str, join_ref: u64) -> Result<Frame> {
    let message: ChannelMessage = serde_json::from_str(text)?;

    let replies_to_join = message.topic == topic && message.msg_ref.as_deref() == Some(join_ref.to_string().as_str());
    if replies_to_join && message.is_join_rejection() {
        return Err(AppError::Realtime(format!(
            "Join rejected on {}: {}",
            message.topic, message.payload
        )));
    }
    if message.is_join_ack(topic, join_ref) {
        return Ok(Frame::Joined);
    }
    if message.closes_channel(topic) {
        return Ok(Frame::ChannelDown);
    }

    Ok(message.change_event().map_or(Frame::Other, Frame::Change))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::realtime::{EVENT_ACCESS_TOKEN, EVENT_HEARTBEAT, EVENT_JOIN};
    use parking_lot::Mutex;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;

    const TOPIC: &str = "realtime:public:bookmarks";

    struct SharedToken(Mutex<Option<String>>);

    impl SharedToken {
        fn new(token: &str) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Some(token.to_string()))))
        }

        fn set(&self, token: &str) {
            *self.0.lock() = Some(token.to_string());
        }
    }

    #[async_trait]
    impl TokenSource for SharedToken {
        async fn access_token(&self) -> Option<String> {
            self.0.lock().clone()
        }
    }

    fn client(addr: std::net::SocketAddr, reconnect: Duration) -> RealtimeClient {
        RealtimeClient::new(
            &format!("http://{}", addr),
            "anon",
            Duration::from_millis(50),
            reconnect,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn next_message(socket: &mut WebSocketStream<TcpStream>) -> ChannelMessage {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    }

    async fn reply_ok(socket: &mut WebSocketStream<TcpStream>, join: &ChannelMessage) {
        let reply = serde_json::json!({
            "topic": join.topic,
            "event": "phx_reply",
            "payload": {"status": "ok", "response": {}},
            "ref": join.msg_ref,
        });
        socket.send(Message::Text(reply.to_string())).await.unwrap();
    }

    #[test]
    fn test_endpoint_uses_ws_scheme() {
        let secure = RealtimeClient::endpoint_for("https://project.example.co/", "anon").unwrap();
        assert_eq!(
            secure.as_str(),
            "wss://project.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let local = RealtimeClient::endpoint_for("http://127.0.0.1:54321", "anon").unwrap();
        assert_eq!(local.scheme(), "ws");
        assert_eq!(local.port(), Some(54321));

        assert!(RealtimeClient::endpoint_for("ftp://example.com", "anon").is_err());
    }

    #[test]
    fn test_zero_heartbeat_is_rejected() {
        let result = RealtimeClient::new(
            "http://127.0.0.1:54321",
            "anon",
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_decode_frame() {
        let change = r#"{"topic":"realtime:public:bookmarks","event":"postgres_changes",
            "payload":{"data":{"type":"INSERT","table":"bookmarks","record":{"id":1}}},"ref":null}"#;
        match decode_frame(change, TOPIC, 1).unwrap() {
            Frame::Change(event) => assert_eq!(event.kind, ChangeKind::Insert),
            other => panic!("expected a change, got {:?}", other),
        }

        let ack = r#"{"topic":"realtime:public:bookmarks","event":"phx_reply","payload":{"status":"ok"},"ref":"1"}"#;
        assert_eq!(decode_frame(ack, TOPIC, 1).unwrap(), Frame::Joined);

        let heartbeat_reply = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"2"}"#;
        assert_eq!(decode_frame(heartbeat_reply, TOPIC, 1).unwrap(), Frame::Other);

        let errored = r#"{"topic":"realtime:public:bookmarks","event":"phx_error","payload":{},"ref":"1"}"#;
        assert_eq!(decode_frame(errored, TOPIC, 1).unwrap(), Frame::ChannelDown);

        let closed = r#"{"topic":"realtime:public:bookmarks","event":"phx_close","payload":{},"ref":"1"}"#;
        assert_eq!(decode_frame(closed, TOPIC, 1).unwrap(), Frame::ChannelDown);

        let rejected = r#"{"topic":"realtime:public:bookmarks","event":"phx_reply","payload":{"status":"error"},"ref":"1"}"#;
        assert!(matches!(decode_frame(rejected, TOPIC, 1), Err(AppError::Realtime(_))));

        assert!(decode_frame("not json", TOPIC, 1).is_err());
    }

    #[tokio::test]
    async fn test_subscription_joins_and_delivers_changes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            let join = next_message(&mut socket).await;
            reply_ok(&mut socket, &join).await;

            let change = r#"{"topic":"realtime:public:bookmarks","event":"postgres_changes",
                "payload":{"data":{"type":"DELETE","table":"bookmarks","old_record":{"id":7}}},"ref":null}"#;
            socket.send(Message::Text(change.to_string())).await.unwrap();

            // wait for the client's heartbeat before hanging up
            while next_message(&mut socket).await.event != EVENT_HEARTBEAT {}
            join
        });

        let mut sub = client(addr, Duration::from_secs(60))
            .subscribe("bookmarks", &[ChangeKind::Insert, ChangeKind::Delete], SharedToken::new("jwt"))
            .await;

        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.old_record.unwrap()["id"], 7);

        let join = server.await.unwrap();
        assert_eq!(join.event, EVENT_JOIN);
        assert_eq!(join.topic, TOPIC);
        assert_eq!(join.payload["access_token"], "jwt");

        sub.unsubscribe();
    }

    #[tokio::test]
    async fn test_rejoins_with_fresh_token_after_channel_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tokens = SharedToken::new("jwt-1");

        let server = tokio::spawn(async move {
            let mut first = accept(&listener).await;
            let first_join = next_message(&mut first).await;
            reply_ok(&mut first, &first_join).await;

            let pushed = loop {
                let msg = next_message(&mut first).await;
                if msg.event == EVENT_ACCESS_TOKEN {
                    break msg;
                }
            };

            let errored = serde_json::json!({
                "topic": TOPIC, "event": "phx_error", "payload": {}, "ref": first_join.msg_ref,
            });
            first.send(Message::Text(errored.to_string())).await.unwrap();

            let mut second = accept(&listener).await;
            let second_join = next_message(&mut second).await;
            reply_ok(&mut second, &second_join).await;
            (first_join, pushed, second_join)
        });

        let sub = client(addr, Duration::from_millis(20))
            .subscribe("bookmarks", &[ChangeKind::Insert], tokens.clone())
            .await;
        tokens.set("jwt-2");

        let (first_join, pushed, second_join) = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server timed out")
            .unwrap();

        assert_eq!(first_join.payload["access_token"], "jwt-1");
        assert_eq!(pushed.topic, TOPIC);
        assert_eq!(pushed.payload["access_token"], "jwt-2");
        assert_eq!(second_join.event, EVENT_JOIN);
        assert_eq!(second_join.payload["access_token"], "jwt-2");

        sub.unsubscribe();
    }
}
