//! Scripted in-memory [`Process`] for engine tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::codec::FrameDecoder;
use crate::process::{Process, ReadOutcome};

#[derive(Default)]
struct MockState {
    /// `None` entries yield one `Empty` read, simulating data that arrives
    /// later.
    stdout: VecDeque<Option<Vec<u8>>>,
    stderr: VecDeque<Vec<u8>>,
    stdout_closed: bool,
    written: Vec<u8>,
    write_calls: usize,
    stalled: bool,
    failing: bool,
    exited: bool,
    killed: bool,
}

pub(crate) struct MockProcess(Rc<RefCell<MockState>>);

/// Test-side handle onto a [`MockProcess`] owned by a client.
#[derive(Clone)]
pub(crate) struct MockHandle(Rc<RefCell<MockState>>);

impl MockProcess {
    pub fn new() -> (Self, MockHandle) {
        let state = Rc::new(RefCell::new(MockState::default()));
        (Self(state.clone()), MockHandle(state))
    }
}

impl Process for MockProcess {
    fn running(&mut self) -> bool {
        let state = self.0.borrow();
        !state.exited && !state.killed
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        state.write_calls += 1;
        if state.exited || state.killed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if state.failing {
            return Err(io::Error::other("mock write failure"));
        }
        if state.stalled {
            return Ok(0);
        }
        state.written.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn read_stdout(&mut self, max_bytes: usize) -> ReadOutcome {
        let mut state = self.0.borrow_mut();
        match state.stdout.pop_front() {
            Some(None) => ReadOutcome::Empty,
            Some(Some(mut chunk)) => {
                if chunk.len() > max_bytes {
                    let rest = chunk.split_off(max_bytes);
                    state.stdout.push_front(Some(rest));
                }
                ReadOutcome::Data(chunk)
            }
            None if state.stdout_closed => ReadOutcome::Closed,
            None => ReadOutcome::Empty,
        }
    }

    fn read_stderr(&mut self, _max_bytes: usize) -> ReadOutcome {
        let mut state = self.0.borrow_mut();
        match state.stderr.pop_front() {
            Some(chunk) => ReadOutcome::Data(chunk),
            None if state.exited => ReadOutcome::Closed,
            None => ReadOutcome::Empty,
        }
    }

    fn kill(&mut self) {
        self.0.borrow_mut().killed = true;
    }
}

impl MockHandle {
    /// Queue bytes as one stdout read.
    pub fn push_stdout(&self, bytes: impl AsRef<[u8]>) {
        self.0
            .borrow_mut()
            .stdout
            .push_back(Some(bytes.as_ref().to_vec()));
    }

    /// Queue one read that finds nothing.
    pub fn push_gap(&self) {
        self.0.borrow_mut().stdout.push_back(None);
    }

    pub fn push_stderr(&self, text: &str) {
        self.0
            .borrow_mut()
            .stderr
            .push_back(text.as_bytes().to_vec());
    }

    /// Queue `message` the way servers frame it: Content-Length equal to
    /// the body, no trailer.
    pub fn reply(&self, message: &serde_json::Value) {
        let body = message.to_string();
        self.push_stdout(format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    }

    /// Every message the client has written so far.
    pub fn sent(&self) -> Vec<serde_json::Value> {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&self.0.borrow().written);
        decoder.decode_all().expect("client wrote malformed frames")
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|m| m.get("method").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect()
    }

    pub fn written_bytes(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }

    pub fn clear_written(&self) {
        let mut state = self.0.borrow_mut();
        state.written.clear();
        state.write_calls = 0;
    }

    pub fn write_calls(&self) -> usize {
        self.0.borrow().write_calls
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.0.borrow_mut().stalled = stalled;
    }

    pub fn set_failing(&self, failing: bool) {
        self.0.borrow_mut().failing = failing;
    }

    /// Simulate the server exiting: stdout reaches EOF once drained.
    pub fn exit(&self) {
        let mut state = self.0.borrow_mut();
        state.exited = true;
        state.stdout_closed = true;
    }

    pub fn killed(&self) -> bool {
        self.0.borrow().killed
    }
}
