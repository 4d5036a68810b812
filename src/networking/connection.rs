use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Mutex as StdMutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use crate::Result;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Holds the current websocket session to one remote endpoint.
///
/// The session underneath is swapped on every reconnect with [`ConnectionWrapper::reset`], while
/// the read channel handed out by [`ConnectionWrapper::take_read_channel`] stays the same for the
/// lifetime of the wrapper, so a reader task never has to resubscribe.
pub struct ConnectionWrapper {
    name: String,
    write_sink: Mutex<Option<WsSink>>,
    read_sender: mpsc::UnboundedSender<Vec<u8>>,
    read_receiver: StdMutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionWrapper {
    pub fn new(name: &str) -> Self {
        let (read_sender, read_receiver) = mpsc::unbounded_channel();
        ConnectionWrapper {
            name: name.to_string(),
            write_sink: Mutex::new(None),
            read_sender,
            read_receiver: StdMutex::new(Some(read_receiver)),
            reader_task: StdMutex::new(None),
        }
    }

    /// The receiving end of the read channel. Only the first caller gets it.
    pub fn take_read_channel(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        match self.read_receiver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Replace the current session with `stream`. The returned receiver resolves once the new
    /// session is closed by the remote end or fails.
    pub async fn reset(&self, stream: WsStream) -> oneshot::Receiver<()> {
        self.disconnect().await;

        let (write_sink, mut read_stream) = stream.split();
        let (closed_sender, closed_receiver) = oneshot::channel();
        let read_sender = self.read_sender.clone();
        let name = self.name.clone();

        let reader = tokio::spawn(async move {
            while let Some(result) = read_stream.next().await {
                match result {
                    Ok(Message::Binary(data)) => {
                        if read_sender.send(data).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        if read_sender.send(text.into_bytes()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(name = %name, ?frame, "close frame received");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(name = %name, %err, "error reading from websocket");
                        break;
                    }
                }
            }
            let _ = closed_sender.send(());
        });

        *self.write_sink.lock().await = Some(write_sink);
        self.replace_reader(Some(reader));
        closed_receiver
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        let mut write_sink = self.write_sink.lock().await;
        match write_sink.as_mut() {
            Some(sink) => {
                sink.send(Message::Binary(data)).await?;
                Ok(())
            }
            None => Err(tungstenite::Error::AlreadyClosed.into()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.write_sink.lock().await.is_some()
    }

    /// Drop the current session without sending a close frame.
    pub async fn disconnect(&self) {
        self.replace_reader(None);
        self.write_sink.lock().await.take();
    }

    /// Gracefully close the current session, if any.
    pub async fn close(&self) -> Result<()> {
        self.replace_reader(None);
        let sink = self.write_sink.lock().await.take();
        if let Some(mut sink) = sink {
            info!(name = %self.name, "closing websocket session");
            let _ = sink.send(Message::Close(None)).await;
            match sink.close().await {
                Ok(()) | Err(tungstenite::Error::ConnectionClosed) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn replace_reader(&self, reader: Option<JoinHandle<()>>) {
        let previous = match self.reader_task.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, reader),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), reader),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}
