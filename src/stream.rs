use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::body::{WriteLock, WriteLockState, WriterSlot, locks_writer};
use crate::engine::{EVENT_BUFFER, EngineMode, LifecycleEvent, RequestEngine};
use crate::error::{Error, ErrorCode};
use crate::options::NormalizedOptions;
use crate::response::ResponseHead;
use crate::util::lock_unpoisoned;

/// Writable side of a streamed request.
///
/// Locked when the body came from the options or the method cannot carry
/// one; writing to a locked writer fails immediately.
#[derive(Clone, Debug)]
pub struct BodyWriter {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
    lock: Arc<WriteLock>,
}

impl BodyWriter {
    pub fn write(&self, chunk: impl Into<Bytes>) -> crate::Result<()> {
        self.ensure_writable()?;
        let sender = lock_unpoisoned(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(finished_error());
        };
        sender.send(chunk.into()).map_err(|_| {
            Error::request(
                ErrorCode::Generic,
                "the request is no longer accepting body data",
            )
        })
    }

    /// Ends the request body.
    pub fn finish(&self) -> crate::Result<()> {
        self.ensure_writable()?;
        self.lock.finish();
        lock_unpoisoned(&self.sender).take();
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.lock.state() == WriteLockState::Locked
    }

    fn ensure_writable(&self) -> crate::Result<()> {
        match self.lock.state() {
            WriteLockState::Open => Ok(()),
            WriteLockState::Locked => Err(Error::invalid_options(
                "the request body is not writable: a payload was supplied or the method cannot carry one",
            )),
            WriteLockState::Finished => Err(finished_error()),
        }
    }
}

fn finished_error() -> Error {
    Error::request(ErrorCode::Generic, "the request body was already finished")
}

/// Stream-mode request: lifecycle events as they happen.
///
/// Dropping the stream cancels the request.
pub struct RequestStream {
    events: mpsc::Receiver<LifecycleEvent>,
    writer: BodyWriter,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for RequestStream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestStream")
            .field("canceled", &self.cancel.is_cancelled())
            .field("writer_locked", &self.writer.is_locked())
            .finish_non_exhaustive()
    }
}

impl RequestStream {
    pub(crate) fn spawn(options: NormalizedOptions) -> Self {
        let (body_sender, body_receiver) = mpsc::unbounded_channel();
        let lock = Arc::new(WriteLock::default());
        if locks_writer(&options) {
            lock.lock();
        }

        let (events_sender, events) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let engine = RequestEngine::new(options, EngineMode::Stream, events_sender, cancel.clone())
            .with_writer(WriterSlot {
                receiver: Some(body_receiver),
                lock: Arc::clone(&lock),
            });
        let task = tokio::spawn(async move {
            engine.run().await;
        });

        Self {
            events,
            writer: BodyWriter {
                sender: Arc::new(Mutex::new(Some(body_sender))),
                lock,
            },
            cancel,
            task,
        }
    }

    pub fn writer(&self) -> &BodyWriter {
        &self.writer
    }

    pub fn write(&self, chunk: impl Into<Bytes>) -> crate::Result<()> {
        self.writer.write(chunk)
    }

    pub fn finish(&self) -> crate::Result<()> {
        self.writer.finish()
    }

    /// `None` once the request has settled or was canceled.
    pub async fn next_event(&mut self) -> Option<LifecycleEvent> {
        self.events.recv().await
    }

    /// Waits for the final response head, skipping redirects and retries.
    pub async fn response(&mut self) -> crate::Result<ResponseHead> {
        while let Some(event) = self.next_event().await {
            match event {
                LifecycleEvent::Response(head) => return Ok(head),
                LifecycleEvent::Error(error) => return Err(error),
                _ => {}
            }
        }
        Err(Error::cancel())
    }

    /// Buffers the rest of the body.
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(event) = self.next_event().await {
            match event {
                LifecycleEvent::Data(chunk) => body.extend_from_slice(&chunk),
                LifecycleEvent::Retry { .. } => body.clear(),
                LifecycleEvent::End(_) => return Ok(body.freeze()),
                LifecycleEvent::Error(error) => return Err(error),
                _ => {}
            }
        }
        Err(Error::cancel())
    }

    /// Aborts the request. Later events are not delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.writer.lock.lock();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for RequestStream {
    type Item = LifecycleEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use http::Method;

    use super::RequestStream;
    use crate::engine::LifecycleEvent;
    use crate::tests::{Scripted, ScriptedTransport, options_for};

    #[tokio::test]
    async fn get_stream_has_a_locked_writer() {
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = ScriptedTransport::new([Scripted::ok(200, "body")]);
        let stream = RequestStream::spawn(options);

        assert!(stream.writer().is_locked());
        let error = stream.write("nope").unwrap_err();
        assert_eq!(error.code().as_str(), "ERR_INVALID_OPTIONS");
        assert_eq!(stream.bytes().await.unwrap(), "body");
    }

    #[tokio::test]
    async fn written_chunks_become_the_request_body() {
        let transport = ScriptedTransport::new([Scripted::ok(201, "")]);
        let mut options = options_for(Method::POST, "http://a.test/upload");
        options.transport = transport.clone();
        let mut stream = RequestStream::spawn(options);

        stream.write("hello ").unwrap();
        stream.write("world").unwrap();
        stream.finish().unwrap();
        assert!(stream.write("late").is_err());

        let head = stream.response().await.unwrap();
        assert_eq!(head.status().as_u16(), 201);
        assert_eq!(transport.requests()[0].body, "hello world");
    }

    #[tokio::test]
    async fn see_other_after_written_body_sends_bodyless_get() {
        let transport = ScriptedTransport::new([
            Scripted::redirect(303, "/done"),
            Scripted::ok(200, "done"),
        ]);
        let mut options = options_for(Method::POST, "http://a.test/upload");
        options.transport = transport.clone();
        let mut stream = RequestStream::spawn(options);

        stream.write("payload").unwrap();
        stream.finish().unwrap();

        let head = stream.response().await.unwrap();
        assert_eq!(head.status().as_u16(), 200);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].body, "payload");
        assert_eq!(requests[1].method, Method::GET);
        assert_eq!(requests[1].url.path(), "/done");
        assert!(requests[1].body.is_empty());
    }

    #[tokio::test]
    async fn error_event_ends_the_stream() {
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = ScriptedTransport::new([Scripted::ok(404, "missing")]);
        let mut stream = RequestStream::spawn(options);

        let mut last = None;
        while let Some(event) = stream.next().await {
            last = Some(event);
        }
        let Some(LifecycleEvent::Error(error)) = last else {
            panic!("expected the stream to end with an error");
        };
        assert_eq!(error.code().as_str(), "ERR_NON_2XX_3XX_RESPONSE");
        assert_eq!(error.response().unwrap().text().unwrap(), "missing");
    }

    #[tokio::test]
    async fn cancel_stops_event_delivery() {
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = ScriptedTransport::new([Scripted::Hang]);
        let mut stream = RequestStream::spawn(options);

        assert!(matches!(stream.next_event().await, Some(LifecycleEvent::Request { .. })));
        stream.cancel();
        assert!(stream.is_canceled());
        assert!(stream.response().await.is_err());
    }
}
