//! Page-at-a-time processing over record sets too large to hold in memory.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
pub struct BatchProgress {
    total: AtomicUsize,
    current: AtomicUsize,
    success: AtomicUsize,
    failure: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub current: usize,
    pub success: usize,
    pub failure: usize,
}

impl BatchProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
        self.failure.store(0, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchProcessResult {
    pub total: usize,
    pub processed: usize,
    pub success_rate: f64,
}

impl BatchProcessResult {
    fn new(total: usize, processed: usize) -> Self {
        let success_rate = if total == 0 {
            0.0
        } else {
            processed as f64 / total as f64 * 100.0
        };
        Self {
            total,
            processed,
            success_rate,
        }
    }
}

pub struct StreamingBatchProcessor {
    progress: Arc<BatchProgress>,
    cancel: CancellationToken,
}

struct PageWalk<T, CountFut, PageFn, Op> {
    count: Option<CountFut>,
    pages: usize,
    next_page: usize,
    page_size: usize,
    buffer: VecDeque<T>,
    fetch_page: PageFn,
    operation: Op,
    progress: Arc<BatchProgress>,
    cancel: CancellationToken,
    done: bool,
}

impl<T, R, E, CountFut, PageFn, PageFut, Op, OpFut> PageWalk<T, CountFut, PageFn, Op>
where
    CountFut: Future<Output = Result<usize, E>>,
    PageFn: FnMut(usize, usize) -> PageFut,
    PageFut: Future<Output = Result<Vec<T>, E>>,
    Op: FnMut(T) -> OpFut,
    OpFut: Future<Output = Result<R, E>>,
{
    async fn step(&mut self) -> Option<Result<R, E>> {
        loop {
            if self.done || self.cancel.is_cancelled() {
                return None;
            }

            if let Some(count) = self.count.take() {
                match count.await {
                    Ok(records) => {
                        self.progress.reset(records);
                        self.pages = records.div_ceil(self.page_size);
                        debug!(records, pages = self.pages, "streaming pages");
                        continue;
                    }
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
            }

            if let Some(record) = self.buffer.pop_front() {
                let result = (self.operation)(record).await;
                match &result {
                    Ok(_) => self.progress.record_success(),
                    Err(_) => self.progress.record_failure(),
                }
                return Some(result);
            }

            if self.next_page >= self.pages {
                self.done = true;
                return None;
            }

            let offset = self.next_page * self.page_size;
            self.next_page += 1;
            match (self.fetch_page)(offset, self.page_size).await {
                Ok(records) if records.is_empty() => {
                    self.done = true;
                    return None;
                }
                Ok(records) => self.buffer.extend(records),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl StreamingBatchProcessor {
    pub fn new(progress: Arc<BatchProgress>, cancel: CancellationToken) -> Self {
        Self { progress, cancel }
    }

    pub fn progress(&self) -> &Arc<BatchProgress> {
        &self.progress
    }

    /// Streams `operation` over every record, fetching one page at a time and
    /// handling one record at a time.
    ///
    /// `count` resolves to the record total and is awaited once; the page
    /// count follows from it. A failed count or page fetch yields a single
    /// `Err` and ends the stream, while a failed record yields `Err` for that
    /// record only.
    pub fn for_each_page<T, R, E, CountFut, PageFn, PageFut, Op, OpFut>(
        &self,
        count: CountFut,
        fetch_page: PageFn,
        page_size: usize,
        operation: Op,
    ) -> impl Stream<Item = Result<R, E>>
    where
        CountFut: Future<Output = Result<usize, E>>,
        PageFn: FnMut(usize, usize) -> PageFut,
        PageFut: Future<Output = Result<Vec<T>, E>>,
        Op: FnMut(T) -> OpFut,
        OpFut: Future<Output = Result<R, E>>,
    {
        let walk = PageWalk {
            count: Some(count),
            pages: 0,
            next_page: 0,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            fetch_page,
            operation,
            progress: Arc::clone(&self.progress),
            cancel: self.cancel.clone(),
            done: false,
        };

        stream::unfold(walk, |mut walk| async move {
            let item = walk.step().await?;
            Some((item, walk))
        })
        .take_until(self.cancel.clone().cancelled_owned())
    }

    /// Walks pages until one comes back short, handing each whole page to
    /// `batch_operation`, which reports how many of its records succeeded.
    pub async fn run_batch<T, E, PageFn, PageFut, BatchOp, BatchFut>(
        &self,
        mut fetch_page: PageFn,
        page_size: usize,
        mut batch_operation: BatchOp,
    ) -> Result<BatchProcessResult, E>
    where
        PageFn: FnMut(usize, usize) -> PageFut,
        PageFut: Future<Output = Result<Vec<T>, E>>,
        BatchOp: FnMut(Vec<T>) -> BatchFut,
        BatchFut: Future<Output = usize>,
    {
        let page_size = page_size.max(1);
        self.progress.reset(0);
        let mut offset = 0;
        let mut total = 0;
        let mut processed = 0;

        while !self.cancel.is_cancelled() {
            let page = fetch_page(offset, page_size).await?;
            let len = page.len();
            if len == 0 {
                break;
            }
            self.progress.add_total(len);
            let succeeded = batch_operation(page).await.min(len);
            for _ in 0..succeeded {
                self.progress.record_success();
            }
            for _ in succeeded..len {
                self.progress.record_failure();
            }
            total += len;
            processed += succeeded;
            offset += len;
            if len < page_size {
                break;
            }
        }

        Ok(BatchProcessResult::new(total, processed))
    }
}
