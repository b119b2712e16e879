use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Connector, Frame, Transport};
use crate::error::NetError;

/// [`Connector`] over `tokio-tungstenite` (`ws://` and `wss://`).
#[derive(Clone, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>, NetError> {
        match tokio_tungstenite::connect_async(endpoint).await {
            Ok((stream, response)) => {
                log::debug!("ws: handshake complete endpoint={endpoint} status={}", response.status());
                Ok(Box::new(WsTransport { stream }))
            }
            Err(tungstenite::Error::Http(response)) => Err(NetError::connection(format!(
                "handshake rejected endpoint={endpoint} status={}",
                response.status().as_u16()
            ))),
            Err(err) => Err(NetError::connection(format!("connect {endpoint}: {err}"))),
        }
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), NetError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| NetError::connection(format!("write: {err}")))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, NetError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(NetError::connection(format!("read: {err}")))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Binary(data) => {
                    return Some(Ok(Frame::Text(String::from_utf8_lossy(&data).into_owned())))
                }
                Message::Close(frame) => {
                    return Some(Ok(Frame::Close(frame.map(|frame| u16::from(frame.code)))))
                }
                // Protocol-level ping/pong is answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self, code: u16) -> Result<(), NetError> {
        let frame = CloseFrame { code: CloseCode::from(code), reason: "".into() };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|err| NetError::connection(format!("close: {err}")))
    }
}
