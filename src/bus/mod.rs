//! Message bus: the append-only event log connecting roles to the
//! coordinator.
//!
//! Publishing never delivers to anyone. Readers either query the log (a
//! finite, restartable sequence) or tail it as an async stream that polls
//! for new entries.

pub mod log;
pub mod message;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};

use crate::error::Result;
use crate::orchestration::retry::{with_backoff, RetryPolicy};
use crate::util::blocking;
use crate::{hlog_debug, hlog_error};

pub use log::{EventLog, JsonlLog, MemoryLog};
pub use message::{Message, MessageDraft, MessageFilter, MessageType};

/// Messages fetched from the log per page by queries and tails.
const PAGE_SIZE: usize = 256;

#[derive(Clone)]
pub struct MessageBus {
    log: Arc<dyn EventLog>,
    team: String,
    retry: RetryPolicy,
}

impl MessageBus {
    pub fn new(log: Arc<dyn EventLog>, team: &str) -> Self {
        Self {
            log,
            team: team.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn in_memory(team: &str) -> Self {
        Self::new(Arc::new(MemoryLog::new()), team)
    }

    /// Policy used to retry appends that hit `StorageUnavailable`.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    /// Append a message, stamping the bus team when the draft has none.
    pub async fn publish(&self, mut draft: MessageDraft) -> Result<Message> {
        if draft.team.is_empty() {
            draft.team = self.team.clone();
        }
        let what = format!("publish {}", draft.kind);
        let result = with_backoff(&self.retry, &what, || {
            let log = Arc::clone(&self.log);
            let draft = draft.clone();
            blocking(move || log.append(draft))
        })
        .await;

        match &result {
            Ok(msg) => hlog_debug!(
                "bus #{} {} {} -> {}: {}",
                msg.seq,
                msg.kind,
                msg.from,
                msg.to,
                msg.summary
            ),
            Err(e) => hlog_error!("{} gave up: {}", what, e),
        }
        result
    }

    /// Append without going through the async runtime.
    pub fn publish_blocking(&self, mut draft: MessageDraft) -> Result<Message> {
        if draft.team.is_empty() {
            draft.team = self.team.clone();
        }
        self.log.append(draft)
    }

    /// Lazy sequence of matching messages from the start of the log.
    pub fn query(&self, filter: MessageFilter) -> Query {
        self.query_after(filter, 0)
    }

    /// Lazy sequence of matching messages with `seq > after`.
    pub fn query_after(&self, filter: MessageFilter, after: u64) -> Query {
        Query {
            log: Arc::clone(&self.log),
            filter,
            cursor: after,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn last_seq(&self) -> Result<u64> {
        self.log.last_seq()
    }

    /// Follow the log from `after`, yielding matching messages as they are
    /// appended. Waits `poll` between reads once caught up. The stream ends
    /// only on a read error, which it yields first.
    pub fn tail(
        &self,
        filter: MessageFilter,
        after: u64,
        poll: Duration,
    ) -> impl Stream<Item = Result<Message>> + Send + 'static {
        let state = TailState {
            log: Arc::clone(&self.log),
            filter,
            cursor: after,
            buffer: VecDeque::new(),
            failed: false,
        };

        stream::unfold(state, move |mut state| async move {
            if state.failed {
                return None;
            }
            loop {
                if let Some(msg) = state.buffer.pop_front() {
                    return Some((Ok(msg), state));
                }
                let log = Arc::clone(&state.log);
                let cursor = state.cursor;
                match blocking(move || log.read_after(cursor, PAGE_SIZE)).await {
                    Ok(page) if page.is_empty() => tokio::time::sleep(poll).await,
                    Ok(page) => {
                        if let Some(last) = page.last() {
                            state.cursor = last.seq;
                        }
                        let filter = &state.filter;
                        let matching: Vec<Message> =
                            page.into_iter().filter(|m| filter.matches(m)).collect();
                        state.buffer.extend(matching);
                    }
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
    }
}

struct TailState {
    log: Arc<dyn EventLog>,
    filter: MessageFilter,
    cursor: u64,
    buffer: VecDeque<Message>,
    failed: bool,
}

/// Iterator over a log snapshot, reading one page at a time.
///
/// Messages appended while iterating are picked up. Re-running the same
/// query yields the same prefix since the log is never rewritten.
pub struct Query {
    log: Arc<dyn EventLog>,
    filter: MessageFilter,
    cursor: u64,
    buffer: VecDeque<Message>,
    done: bool,
}

impl Iterator for Query {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(msg) = self.buffer.pop_front() {
                return Some(Ok(msg));
            }
            if self.done {
                return None;
            }
            let page = match self.log.read_after(self.cursor, PAGE_SIZE) {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match page.last() {
                Some(last) => self.cursor = last.seq,
                None => {
                    self.done = true;
                    continue;
                }
            }
            let filter = &self.filter;
            self.buffer
                .extend(page.into_iter().filter(|m| filter.matches(m)));
        }
    }
}
