//! Asynchronous block-I/O interface consumed by the cache.
//!
//! The cache never performs I/O itself. Read fills are the client's
//! responsibility; the flush integration builds write requests and submits
//! them through [`PageIo`], receiving completions on a [`CompletionTarget`].

use crate::page::PageHandle;
use grist_error::{CacheError, Result};
use grist_types::PageOffset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// One submitted request: a contiguous run of one or more pages starting
/// at `offset`. The request owns refcounted handles for every page it
/// touches, so none of them can be evicted or reassigned mid-flight.
#[derive(Debug)]
pub struct IoRequest {
    offset: PageOffset,
    direction: IoDirection,
    pages: Vec<PageHandle>,
    high_priority: bool,
}

impl IoRequest {
    #[must_use]
    pub fn new(
        offset: PageOffset,
        direction: IoDirection,
        pages: Vec<PageHandle>,
        high_priority: bool,
    ) -> Self {
        debug_assert!(!pages.is_empty(), "I/O request without pages");
        Self {
            offset,
            direction,
            pages,
            high_priority,
        }
    }

    #[must_use]
    pub fn offset(&self) -> PageOffset {
        self.offset
    }

    #[must_use]
    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    #[must_use]
    pub fn pages(&self) -> &[PageHandle] {
        &self.pages
    }

    #[must_use]
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    #[must_use]
    pub fn len_bytes(&self, page_size: usize) -> usize {
        self.pages.len() * page_size
    }

    /// Consume the request, releasing its page handles to the caller.
    #[must_use]
    pub fn into_pages(self) -> Vec<PageHandle> {
        self.pages
    }
}

/// Submission side of the asynchronous I/O layer.
///
/// `access` queues the requests and returns. The layer owns every accepted
/// request from then on and must eventually report each one on the
/// completion target registered by the submitter, successful or not;
/// submission itself never fails.
pub trait PageIo: Send + Sync {
    fn access(&self, requests: Vec<IoRequest>);
}

/// Outcome of one completed request.
#[derive(Debug)]
pub struct IoCompletion {
    pub request: IoRequest,
    pub result: Result<()>,
}

impl IoCompletion {
    #[must_use]
    pub fn ok(request: IoRequest) -> Self {
        Self {
            request,
            result: Ok(()),
        }
    }

    #[must_use]
    pub fn failed(request: IoRequest, err: CacheError) -> Self {
        Self {
            request,
            result: Err(err),
        }
    }
}

/// Receiver of completion notifications, invoked on I/O-thread context.
pub trait CompletionTarget: Send + Sync {
    fn notify_completion(&self, completions: Vec<IoCompletion>);
}
