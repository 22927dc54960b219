//! Scripted in-memory transport.
//!
//! `MockTransport` replays queued read chunks and records every write, so the
//! protocol layer and device façades can be exercised without hardware. A
//! [`MockHandle`] shares the same state and stays usable after the transport
//! has been moved into a client.
//!
//! ```rust
//! use labmon::transport::{MockTransport, Transport};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let mut transport = MockTransport::new();
//! let handle = transport.handle();
//! handle.push_chunk(b"12.345\n");
//!
//! transport.open(Duration::from_millis(10)).await.unwrap();
//! let mut buf = [0u8; 128];
//! let outcome = transport.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
//! assert!(outcome.is_end_of_message);
//! assert_eq!(handle.receive_calls(), 1);
//! # });
//! ```

use super::{notify, ConnectionEvent, ReadOutcome, Transport, LINE_FEED};
use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct MockState {
    open: bool,
    reads: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    receive_calls: usize,
    open_failure: bool,
    responder: Option<Responder>,
}

/// In-memory transport with scripted reads.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Inspection and scripting handle for a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            events,
        }
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
            events: self.events.clone(),
        }
    }
}

impl MockHandle {
    /// Queue one raw chunk; each `receive` returns at most one chunk.
    pub fn push_chunk(&self, chunk: &[u8]) {
        self.state.lock().reads.push_back(chunk.to_vec());
    }

    /// Queue a full response line (the terminator is appended).
    pub fn push_response(&self, line: &str) {
        let mut chunk = line.as_bytes().to_vec();
        chunk.push(LINE_FEED);
        self.push_chunk(&chunk);
    }

    /// Answer written commands automatically.
    ///
    /// The closure receives each written command without its terminator and
    /// returns the response line to queue, or `None` for commands with no reply.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Make subsequent `open` calls fail with `ConnectionFailed`.
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().open_failure = fail;
    }

    /// Simulate the peer going away.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            notify(&self.events, "mock://", false, "connection dropped");
        }
    }

    /// Everything written so far, one entry per `send`, lossily decoded.
    pub fn written(&self) -> Vec<String> {
        self.state
            .lock()
            .written
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    pub fn send_calls(&self) -> usize {
        self.state.lock().written.len()
    }

    pub fn receive_calls(&self) -> usize {
        self.state.lock().receive_calls
    }

    pub fn pending_reads(&self) -> usize {
        self.state.lock().reads.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn path(&self) -> String {
        "mock://".to_string()
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn open(&mut self, _timeout: Duration) -> LabResult<()> {
        let mut state = self.state.lock();
        if state.open_failure {
            notify(&self.events, "mock://", false, "mock open failure");
            return Err(LabError::connection_failed("mock transport refused to open"));
        }
        state.open = true;
        notify(&self.events, "mock://", true, "mock connection established");
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            notify(&self.events, "mock://", false, "mock connection closed");
        }
    }

    async fn send(&mut self, data: &[u8], _timeout: Duration) -> LabResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(LabError::not_connected("mock transport is not open"));
        }
        state.written.push(data.to_vec());

        let reply = state.responder.as_ref().and_then(|responder| {
            let command = String::from_utf8_lossy(data);
            responder(command.trim_end_matches(['\r', '\n']))
        });
        if let Some(line) = reply {
            let mut chunk = line.into_bytes();
            chunk.push(LINE_FEED);
            state.reads.push_back(chunk);
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> LabResult<ReadOutcome> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(LabError::not_connected("mock transport is not open"));
        }
        state.receive_calls += 1;

        let Some(mut chunk) = state.reads.pop_front() else {
            return Err(LabError::timeout("mock transport has no scripted response"));
        };
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            state.reads.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(ReadOutcome::from_chunk(&buf[..chunk.len()], LINE_FEED))
    }

    async fn clear_input(&mut self) -> LabResult<usize> {
        Ok(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
