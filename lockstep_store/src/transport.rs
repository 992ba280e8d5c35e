// WebSocket transport between a peer and the relay.
//
// `Transport::connect()` opens the socket and splits it into two background
// tasks:
// - the reader task decodes `ServerMessage` frames and pushes them into an
//   unbounded `mpsc` inbox;
// - the writer task drains an outgoing queue fed by `TransportSender`
//   handles and encodes each `ClientMessage` as one text frame.
//
// Sending never awaits, so callers may send while holding the store lock and
// proposals leave in exactly the order they were queued. The inbox closes
// (`recv()` returns `None`) when the socket closes, a frame fails to decode,
// or the transport is disposed; the store treats that as disconnection.

use futures::{SinkExt, StreamExt};
use lockstep_protocol::{ClientMessage, ServerMessage, decode_message, encode_message};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

enum Outgoing {
    Message(ClientMessage),
    Close,
}

/// Cloneable handle for queueing messages to the relay.
#[derive(Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl TransportSender {
    pub fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        self.tx
            .send(Outgoing::Message(msg))
            .map_err(|_| TransportError::Closed)
    }

    /// Close the socket after everything already queued has been written.
    pub fn dispose(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// A connected WebSocket to the relay.
pub struct Transport {
    sender: TransportSender,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Transport {
    /// Connect to `url` (e.g. `ws://host:port/networks/<id>`) and spawn the
    /// reader and writer tasks.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (socket, _response) = connect_async(url).await?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                match outgoing {
                    Outgoing::Message(msg) => {
                        let text = match encode_message(&msg) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping unencodable message");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        let (in_tx, inbox) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match decode_message::<ServerMessage>(text.as_str()) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break; // Store dropped the receiver
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "malformed frame from relay");
                            break;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "relay socket error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            sender: TransportSender { tx: out_tx },
            inbox,
        })
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        self.sender.send(msg)
    }

    /// Next message from the relay, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbox.recv().await
    }

    pub fn dispose(&self) {
        self.sender.dispose();
    }

    pub(crate) fn into_parts(self) -> (TransportSender, mpsc::UnboundedReceiver<ServerMessage>) {
        (self.sender, self.inbox)
    }
}
