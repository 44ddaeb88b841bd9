//! Application handles for stream transmissions.
//!
//! A stream is a single transmission whose length is only bounded up front. The sender
//! pushes genes as fast as the local window and the receiver's window allow; the receiver
//! hands chunks to the application in order and reopens its window as they are consumed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::connection::{Connection, await_result};
use super::receive_transmission::StreamRead;
use super::send_transmission::StreamPush;
use crate::protocol::{DataControl, MAX_GENE_LENGTH, NetError, NetResult};

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Writing half of a stream.
///
/// Dropping the handle before [`SendStream::complete`] aborts the transmission.
pub struct SendStream {
    connection: Arc<Connection>,
    transmission_id: u32,
    notify: Arc<Notify>,
    completion: Option<oneshot::Receiver<NetResult<()>>>,
    timeout: Duration,
}

impl SendStream {
    pub(crate) fn new(
        connection: Arc<Connection>,
        transmission_id: u32,
        notify: Arc<Notify>,
        completion: oneshot::Receiver<NetResult<()>>,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            transmission_id,
            notify,
            completion: Some(completion),
            timeout,
        }
    }

    /// Transmission id of the stream.
    #[must_use]
    pub fn transmission_id(&self) -> u32 {
        self.transmission_id
    }

    /// Queue `data`, waiting while either window is full.
    pub async fn send(&mut self, data: &[u8]) -> NetResult<()> {
        let deadline = Instant::now() + self.timeout;
        for chunk in data.chunks(MAX_GENE_LENGTH) {
            self.push(chunk, DataControl::Valid, deadline).await?;
        }
        Ok(())
    }

    /// Finish the stream and wait until the receiver acknowledged every gene.
    pub async fn complete(mut self) -> NetResult<()> {
        self.finish(DataControl::Complete).await
    }

    /// Abort the stream; the receiver observes a cancellation.
    pub async fn cancel(mut self) -> NetResult<()> {
        self.finish(DataControl::Cancel).await
    }

    async fn finish(&mut self, control: DataControl) -> NetResult<()> {
        let deadline = Instant::now() + self.timeout;
        self.push(&[], control, deadline).await?;
        let completion = self.completion.take().ok_or(NetError::Closed)?;
        await_result(completion, deadline.saturating_duration_since(Instant::now())).await
    }

    async fn push(&self, chunk: &[u8], control: DataControl, deadline: Instant) -> NetResult<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let receiver_window = match self
                .connection
                .push_stream_gene(self.transmission_id, chunk, control)?
            {
                StreamPush::Pushed => return Ok(()),
                StreamPush::Blocked { receiver_window } => receiver_window,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(NetError::Timeout);
            }
            let wait = backoff.min(deadline - now);
            if tokio::time::timeout(wait, self.notify.notified()).await.is_err() {
                if receiver_window {
                    self.connection.knock(self.transmission_id)?;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            } else {
                backoff = INITIAL_BACKOFF;
            }
        }
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        self.connection
            .release_send(self.transmission_id, NetError::Canceled);
    }
}

impl fmt::Debug for SendStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendStream")
            .field("connection_id", &self.connection.connection_id())
            .field("transmission_id", &self.transmission_id)
            .finish_non_exhaustive()
    }
}

/// Reading half of a stream, delivered through the terminal's incoming queue.
pub struct ReceiveStream {
    connection: Arc<Connection>,
    transmission_id: u32,
    data_kind: u32,
    data_id: u64,
    notify: Arc<Notify>,
    timeout: Duration,
}

impl ReceiveStream {
    pub(crate) fn new(
        connection: Arc<Connection>,
        transmission_id: u32,
        (data_kind, data_id): (u32, u64),
        notify: Arc<Notify>,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            transmission_id,
            data_kind,
            data_id,
            notify,
            timeout,
        }
    }

    /// Transmission id of the stream.
    #[must_use]
    pub fn transmission_id(&self) -> u32 {
        self.transmission_id
    }

    /// Application data kind announced by the sender.
    #[must_use]
    pub fn data_kind(&self) -> u32 {
        self.data_kind
    }

    /// Application data id announced by the sender.
    #[must_use]
    pub fn data_id(&self) -> u64 {
        self.data_id
    }

    /// Use `timeout` for each wait on incoming data.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Next chunk in order, or `None` once the sender completed the stream.
    pub async fn receive(&mut self) -> NetResult<Option<Bytes>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.connection.stream_read(self.transmission_id) {
                StreamRead::Chunk { data, .. } => return Ok(Some(data)),
                StreamRead::Finished => return Ok(None),
                StreamRead::Canceled => {
                    debug!(transmission_id = self.transmission_id, "stream canceled by sender");
                    return Err(NetError::Canceled);
                }
                StreamRead::Failed(error) => return Err(error),
                StreamRead::Pending => {}
            }

            if !self.connection.is_open() {
                return Err(NetError::Closed);
            }
            trace!(transmission_id = self.transmission_id, "stream waiting");
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Err(NetError::Timeout);
            }
        }
    }

    /// Read the whole stream into one buffer.
    pub async fn receive_to_end(&mut self) -> NetResult<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.receive().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

impl Drop for ReceiveStream {
    fn drop(&mut self) {
        self.connection
            .release_receive(self.transmission_id, NetError::Canceled);
    }
}

impl fmt::Debug for ReceiveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveStream")
            .field("connection_id", &self.connection.connection_id())
            .field("transmission_id", &self.transmission_id)
            .field("data_kind", &self.data_kind)
            .field("data_id", &self.data_id)
            .finish_non_exhaustive()
    }
}
