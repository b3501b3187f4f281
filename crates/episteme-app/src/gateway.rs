// WebSocket gateway to the chat bridge.
//
// The bridge is a thin adapter between a chat platform and this process:
// it sends every chat message it sees as an `InboundEvent` JSON text frame
// and delivers every `OutboundMessage` frame we send back. One bridge is
// served at a time.

use std::fmt::Display;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::protocol::{split_message, OutboundMessage};

/// Events emitted by the gateway to the application layer.
#[derive(Debug, PartialEq)]
pub enum GatewayEvent {
    /// A bridge has connected.
    Connected { addr: String },
    /// The current bridge has disconnected.
    Disconnected,
    /// A text frame was received from the bridge (raw JSON string).
    Message(String),
}

/// Run the gateway on `host:port`, forwarding bridge frames through `tx` and
/// delivering everything received on `outbound` to the connected bridge.
///
/// Outbound messages that arrive while no bridge is connected are dropped.
/// Returns when either channel is closed.
pub async fn run(
    host: &str,
    port: u16,
    tx: mpsc::Sender<GatewayEvent>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    max_message_len: usize,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let local_addr = listener.local_addr()?;
    info!("Gateway listening on {local_addr}");

    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    warn!("No bridge connected; dropping message for {:?}", msg.target);
                    continue;
                }
                None => break,
            },
        };
        let addr_str = addr.to_string();
        info!("Accepted TCP connection from {addr_str}");

        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake failed for {addr_str}: {e}");
                continue;
            }
        };

        if tx
            .send(GatewayEvent::Connected {
                addr: addr_str.clone(),
            })
            .await
            .is_err()
        {
            break;
        }

        let (mut write, read) = ws_stream.split();
        let served = serve_connection(
            read,
            &mut write,
            &tx,
            &mut outbound,
            &addr_str,
            max_message_len,
        )
        .await;

        if tx.send(GatewayEvent::Disconnected).await.is_err() || served.is_err() {
            break;
        }
    }

    info!("Gateway stopped");
    Ok(())
}

/// Serve one connected bridge until it goes away.
///
/// Text frames are forwarded through `tx`; messages from `outbound` are
/// split to `max_message_len` and written as JSON frames. Returns `Err(())`
/// when either application channel is closed, signalling the caller to stop.
///
/// Generic over the stream and sink so it can be tested without opening TCP
/// ports.
pub async fn serve_connection<R, W>(
    mut read: R,
    write: &mut W,
    tx: &mpsc::Sender<GatewayEvent>,
    outbound: &mut mpsc::Receiver<OutboundMessage>,
    addr: &str,
    max_message_len: usize,
) -> Result<(), ()>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if tx.send(GatewayEvent::Message(text.to_string())).await.is_err() {
                        return Err(());
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Bridge {addr} sent close frame");
                    return Ok(());
                }
                Some(Err(e)) => {
                    warn!("WebSocket error from {addr}: {e}");
                    return Ok(());
                }
                Some(Ok(_)) => {
                    // Binary, Ping, Pong and raw frames carry nothing for us.
                }
                None => return Ok(()),
            },
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    return Err(());
                };
                if let Err(e) = deliver(write, &msg, max_message_len).await {
                    warn!("Failed to deliver message to {addr}: {e}");
                    return Ok(());
                }
            }
        }
    }
}

async fn deliver<W>(
    write: &mut W,
    msg: &OutboundMessage,
    max_message_len: usize,
) -> anyhow::Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let frames = encode_outbound(msg, max_message_len)?;
    debug!("Sending {} frame(s) to {:?}", frames.len(), msg.target);
    for frame in frames {
        write
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

/// Encode a message as one or more JSON frames, each carrying at most
/// `max_message_len` characters of text for the same target.
pub fn encode_outbound(
    msg: &OutboundMessage,
    max_message_len: usize,
) -> serde_json::Result<Vec<String>> {
    split_message(&msg.text, max_message_len)
        .into_iter()
        .map(|text| {
            serde_json::to_string(&OutboundMessage {
                target: msg.target.clone(),
                text,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Target;
    use futures_util::stream;

    /// Frames from `messages`, then a stream that never ends.
    fn open_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages).chain(stream::pending())
    }

    fn closed_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    #[tokio::test]
    async fn text_frames_forwarded_in_order() {
        let (tx, mut rx) = mpsc::channel(64);
        let (_out_tx, mut out_rx) = mpsc::channel(8);
        let mut sink: Vec<Message> = Vec::new();
        let frames = vec![
            Ok(Message::Text("first".into())),
            Ok(Message::Text("second".into())),
        ];

        serve_connection(closed_stream(frames), &mut sink, &tx, &mut out_rx, "test", 2000)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), GatewayEvent::Message("first".into()));
        assert_eq!(rx.recv().await.unwrap(), GatewayEvent::Message("second".into()));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn close_frame_ends_connection() {
        let (tx, mut rx) = mpsc::channel(64);
        let (_out_tx, mut out_rx) = mpsc::channel(8);
        let mut sink: Vec<Message> = Vec::new();
        let frames = vec![
            Ok(Message::Text("before_close".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text("after_close".into())),
        ];

        serve_connection(open_stream(frames), &mut sink, &tx, &mut out_rx, "test", 2000)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), GatewayEvent::Message("before_close".into()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_error_ends_connection() {
        let (tx, mut rx) = mpsc::channel(64);
        let (_out_tx, mut out_rx) = mpsc::channel(8);
        let mut sink: Vec<Message> = Vec::new();
        let frames = vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            Err(WsError::ConnectionClosed),
            Ok(Message::Text("after_error".into())),
        ];

        serve_connection(open_stream(frames), &mut sink, &tx, &mut out_rx, "test", 2000)
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn outbound_messages_written_as_chunked_frames() {
        let (tx, _rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let mut sink: Vec<Message> = Vec::new();

        out_tx
            .send(OutboundMessage::direct("u1", "aaaa\nbbbb"))
            .await
            .unwrap();
        drop(out_tx);

        // Closing the outbound channel stops the gateway.
        let result = serve_connection(open_stream(vec![]), &mut sink, &tx, &mut out_rx, "test", 4).await;
        assert_eq!(result, Err(()));

        let texts: Vec<String> = sink
            .into_iter()
            .map(|m| match m {
                Message::Text(t) => t.to_string(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                r#"{"target":{"user":"u1"},"text":"aaaa"}"#.to_string(),
                r#"{"target":{"user":"u1"},"text":"bbbb"}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn closed_event_channel_stops_gateway() {
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let (_out_tx, mut out_rx) = mpsc::channel(8);
        let mut sink: Vec<Message> = Vec::new();
        let frames = vec![Ok(Message::Text("hello".into()))];

        let result = serve_connection(open_stream(frames), &mut sink, &tx, &mut out_rx, "test", 2000).await;
        assert_eq!(result, Err(()));
    }

    #[test]
    fn short_message_is_one_frame() {
        let msg = OutboundMessage::channel("general", "hello");
        let frames = encode_outbound(&msg, 2000).unwrap();
        assert_eq!(frames.len(), 1);
        let decoded: OutboundMessage = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(decoded.target, Target::Channel("general".into()));
        assert_eq!(decoded.text, "hello");
    }
}
