//! Streaming socket backend.
//!
//! `SocketBackend` owns the websocket and pumps it: outbound [`Frame`]s are
//! encoded and written, inbound text is decoded and forwarded to the
//! connection manager. The backend shuts down when instructed to by the
//! manager or when the manager drops (the dispatch channel closes); a
//! transport failure is signalled to the manager through the error oneshot.

use crate::error::Error;
use futures_channel::{mpsc, oneshot};
use futures_util::{
    select,
    sink::SinkExt,
    stream::{Fuse, StreamExt},
};
use qpub_core::protocol::{Frame, FrameError};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{error, trace};

type WsStream = Fuse<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// One item forwarded to the connection manager.
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame(Frame),
    /// The peer sent text that is not a valid frame. The pump keeps running.
    ParseError(FrameError),
}

/// Sending half of the dispatch channel, shared with every channel state.
#[derive(Clone, Debug)]
pub(crate) struct FrameSink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSink {
    pub(crate) fn send(&self, frame: Frame) -> Result<(), Error> {
        self.tx.unbounded_send(frame).map_err(|_| Error::NotConnected)
    }
}

/// Manager-side handle for one socket backend.
pub(crate) struct BackendHandle {
    /// Decoded frames (and parse failures) from the socket.
    pub(crate) frames: mpsc::UnboundedReceiver<Inbound>,
    /// Fires when the backend halts on a transport error.
    pub(crate) error: oneshot::Receiver<()>,
    /// Outbound frame dispatch.
    pub(crate) link: FrameSink,
    shutdown: oneshot::Sender<()>,
}

impl BackendHandle {
    pub(crate) fn shutdown(self) {
        // failure means the backend is already gone
        let _ = self.shutdown.send(());
    }
}

/// Connect request carrying the optional handshake Authorization header.
#[derive(Clone, Debug)]
pub(crate) struct ConnectRequest {
    pub(crate) url: String,
    pub(crate) auth_header: Option<String>,
}

impl IntoClientRequest for ConnectRequest {
    fn into_client_request(self) -> tungstenite::Result<tungstenite::handshake::client::Request> {
        let mut request: http::Request<()> = self.url.into_client_request()?;
        if let Some(value) = self.auth_header {
            let mut value = http::HeaderValue::from_str(&value)?;
            value.set_sensitive(true);
            request.headers_mut().insert(http::header::AUTHORIZATION, value);
        }
        request.into_client_request()
    }
}

pub(crate) struct SocketBackend {
    server: WsStream,

    // items for the manager
    handler: mpsc::UnboundedSender<Inbound>,
    // notify the manager of a terminal transport error
    error: oneshot::Sender<()>,

    // frames to write out
    to_dispatch: mpsc::UnboundedReceiver<Frame>,
    // intentional shutdown from the manager
    shutdown: oneshot::Receiver<()>,
}

impl SocketBackend {
    pub(crate) async fn connect(
        request: ConnectRequest,
    ) -> Result<(Self, BackendHandle), Error> {
        let (ws, _) = connect_async(request).await?;
        Ok(Self::new(ws.fuse()))
    }

    pub(crate) fn new(server: WsStream) -> (Self, BackendHandle) {
        let (handler, frames) = mpsc::unbounded();
        let (dispatcher, to_dispatch) = mpsc::unbounded();
        let (error_tx, error_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        (
            SocketBackend { server, handler, error: error_tx, to_dispatch, shutdown: shutdown_rx },
            BackendHandle {
                frames,
                error: error_rx,
                link: FrameSink { tx: dispatcher },
                shutdown: shutdown_tx,
            },
        )
    }

    fn handle_text(&mut self, text: String) -> Result<(), Error> {
        trace!(text, "received text frame");
        let item = match Frame::decode(&text) {
            Ok(frame) => Inbound::Frame(frame),
            Err(e) => {
                error!(err = %e, "failed to parse inbound frame");
                Inbound::ParseError(e)
            }
        };
        self.handler.unbounded_send(item).map_err(|_| Error::DeadChannel)
    }

    fn handle(&mut self, item: Result<Message, tungstenite::Error>) -> Result<(), Error> {
        match item {
            Ok(Message::Text(text)) => self.handle_text(text),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => Ok(()),
            Ok(Message::Binary(_)) => {
                error!("unexpected binary websocket message");
                Err(Error::ConnectionFailed("unexpected binary message".into()))
            }
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    error!(%frame, "websocket closed by peer");
                }
                Err(Error::ConnectionFailed("websocket closed".into()))
            }
            Err(e) => {
                error!(err = %e, "websocket error");
                Err(e.into())
            }
        }
    }

    pub(crate) fn spawn(mut self) {
        let fut = async move {
            let mut err = false;
            loop {
                select! {
                    item = self.server.next() => {
                        match item {
                            Some(item) => {
                                err = self.handle(item).is_err();
                                if err { break }
                            }
                            None => {
                                error!("websocket server has gone away");
                                err = true;
                                break
                            }
                        }
                    }
                    frame = self.to_dispatch.next() => {
                        match frame {
                            Some(frame) => {
                                let text = match frame.encode() {
                                    Ok(text) => text,
                                    // undispatchable frame; drop it rather than the link
                                    Err(e) => {
                                        error!(err = %e, "failed to encode outbound frame");
                                        continue
                                    }
                                };
                                if let Err(e) = self.server.send(Message::Text(text)).await {
                                    error!(err = %e, "websocket connection error");
                                    err = true;
                                    break
                                }
                            }
                            // manager has gone away
                            None => break,
                        }
                    }
                    _ = &mut self.shutdown => break,
                }
            }
            if err {
                let _ = self.error.send(());
            }
        };

        tokio::spawn(fut);
    }
}
