//! Depth-1 send pipeline for an adapter link.
//!
//! Adapters carry no request ids, so a reply always belongs to the oldest
//! outstanding entry. Only the head of the queue is ever on the wire; the
//! next payload is written once the head's reply has arrived.

use std::collections::VecDeque;

#[derive(Debug)]
struct Entry<S> {
    payload: Option<String>,
    sink: S,
}

#[derive(Debug)]
pub struct SendQueue<S> {
    entries: VecDeque<Entry<S>>,
}

impl<S> Default for SendQueue<S> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<S> SendQueue<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<&S> {
        self.entries.front().map(|entry| &entry.sink)
    }

    /// Appends an entry. Returns the payload to write now when the entry is
    /// the only one queued. A `None` payload occupies a slot without writing
    /// anything (the handshake line, which the adapter sends unprompted).
    pub fn push(&mut self, payload: Option<String>, sink: S) -> Option<String> {
        self.entries.push_back(Entry {
            payload: payload.clone(),
            sink,
        });
        if self.entries.len() == 1 {
            payload
        } else {
            None
        }
    }

    /// Pops the head for the reply that just arrived, returning its sink and
    /// the next payload to write, if any.
    pub fn complete(&mut self) -> Option<(S, Option<String>)> {
        let head = self.entries.pop_front()?;
        let next = self
            .entries
            .front()
            .and_then(|entry| entry.payload.clone());
        Some((head.sink, next))
    }

    /// Empties the queue, e.g. when the link closes.
    pub fn drain(&mut self) -> impl Iterator<Item = S> + '_ {
        self.entries.drain(..).map(|entry| entry.sink)
    }
}
