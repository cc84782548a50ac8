//! Data pipeline
//!
//! Canonical path for every chunk emitted by the session manager. Filters
//! run first (insertion order, fail-open), then processors in ascending
//! priority. Delivery to subscribers is synchronous with `process()`, so
//! the caller's task — the PTY reader — observes the complete fan-out
//! before reading the next chunk. Processors must therefore be non-blocking
//! and CPU-cheap.

pub mod filters;
pub mod processors;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use shelltender_types::DataSource;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, Weak};
use tracing::{error, warn};

/// Priority bands: 10-19 security, 20-29 compliance, 30-49 shaping,
/// 50 default, 60+ observability.
pub const DEFAULT_PRIORITY: u8 = 50;

/// Free-form chunk metadata; `source` is always present.
#[derive(Debug, Clone)]
pub struct ChunkMetadata {
    pub source: DataSource,
    pub extra: HashMap<String, serde_json::Value>,
}

impl ChunkMetadata {
    pub fn from_source(source: DataSource) -> Self {
        Self {
            source,
            extra: HashMap::new(),
        }
    }
}

/// The pipeline's output record, consumed by the buffer, the pattern
/// engine and the multiplexer.
#[derive(Debug, Clone)]
pub struct ProcessedDataEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub original_data: Bytes,
    pub processed_data: Bytes,
    /// Names of the processors that actually modified the bytes, in the
    /// order they ran.
    pub transformations: Vec<String>,
    pub metadata: ChunkMetadata,
}

/// What a processor did with the chunk.
pub enum ProcessorOutcome {
    Unchanged,
    Replaced(Vec<u8>),
    /// Drop the event entirely; no sequence is assigned and nothing is
    /// broadcast.
    Drop,
}

/// Ordered transform. Errors are reported and the processor is skipped;
/// the event continues unchanged.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> u8 {
        DEFAULT_PRIORITY
    }
    fn apply(&self, event: &ProcessedDataEvent) -> anyhow::Result<ProcessorOutcome>;
}

/// Pure predicate that can reject events before processors run. Errors are
/// fail-open: the event passes and the error is reported.
pub trait DataFilter: Send + Sync {
    fn name(&self) -> &str;
    fn accept(&self, event: &ProcessedDataEvent) -> anyhow::Result<bool>;
}

/// Lifecycle notifications mirroring the data flow through `process()`.
#[derive(Debug, Clone)]
pub enum PipelineNotice {
    Raw {
        session_id: String,
        len: usize,
    },
    Blocked {
        session_id: String,
        filter: String,
    },
    Dropped {
        session_id: String,
        processor: String,
    },
    Transformed {
        session_id: String,
        transformations: Vec<String>,
    },
    Processed {
        session_id: String,
    },
    Error {
        session_id: String,
        stage: String,
        message: String,
    },
}

type DataCallback = Arc<dyn Fn(&ProcessedDataEvent) + Send + Sync>;
type NoticeCallback = Arc<dyn Fn(&PipelineNotice) + Send + Sync>;

struct DataSubscriber {
    id: u64,
    /// `None` subscribes to every session.
    session_id: Option<String>,
    callback: DataCallback,
}

struct NoticeSubscriber {
    id: u64,
    callback: NoticeCallback,
}

#[derive(Default)]
struct Registry {
    filters: Vec<Arc<dyn DataFilter>>,
    /// Kept sorted by (priority, insertion index).
    processors: Vec<(u64, Arc<dyn Processor>)>,
    data_subscribers: Vec<DataSubscriber>,
    notice_subscribers: Vec<NoticeSubscriber>,
    next_id: u64,
}

/// Ordered processor chain plus filter set; see the module docs.
pub struct Pipeline {
    registry: Arc<RwLock<Registry>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    pub fn add_filter(&self, filter: Arc<dyn DataFilter>) {
        self.registry.write().unwrap().filters.push(filter);
    }

    pub fn add_processor(&self, processor: Arc<dyn Processor>) {
        let mut registry = self.registry.write().unwrap();
        registry.next_id += 1;
        let insertion = registry.next_id;
        registry.processors.push((insertion, processor));
        registry
            .processors
            .sort_by_key(|(idx, p)| (p.priority(), *idx));
    }

    /// Subscribe to every processed event. The returned handle unsubscribes
    /// on `dispose()`.
    pub fn on_data(
        &self,
        callback: impl Fn(&ProcessedDataEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_data(None, Arc::new(callback))
    }

    /// Subscribe to one session's processed events.
    pub fn on_session_data(
        &self,
        session_id: impl Into<String>,
        callback: impl Fn(&ProcessedDataEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_data(Some(session_id.into()), Arc::new(callback))
    }

    fn subscribe_data(&self, session_id: Option<String>, callback: DataCallback) -> Subscription {
        let mut registry = self.registry.write().unwrap();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.data_subscribers.push(DataSubscriber {
            id,
            session_id,
            callback,
        });
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Subscribe to lifecycle notices (`raw`, `blocked`, `dropped`,
    /// `transformed`, `processed`, `error`).
    pub fn on_notice(
        &self,
        callback: impl Fn(&PipelineNotice) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = self.registry.write().unwrap();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.notice_subscribers.push(NoticeSubscriber {
            id,
            callback: Arc::new(callback),
        });
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Run one chunk through filters and processors, then deliver the final
    /// event to subscribers. Synchronous with the caller.
    pub fn process(&self, session_id: &str, data: &[u8], metadata: ChunkMetadata) {
        // Snapshot the registries so no lock is held across user callbacks.
        let (filters, processors, data_subs, notice_subs) = {
            let registry = self.registry.read().unwrap();
            (
                registry.filters.clone(),
                registry.processors.clone(),
                registry
                    .data_subscribers
                    .iter()
                    .map(|s| (s.session_id.clone(), s.callback.clone()))
                    .collect::<Vec<_>>(),
                registry
                    .notice_subscribers
                    .iter()
                    .map(|s| s.callback.clone())
                    .collect::<Vec<_>>(),
            )
        };

        let notify = |notice: PipelineNotice| {
            for callback in &notice_subs {
                callback(&notice);
            }
        };

        notify(PipelineNotice::Raw {
            session_id: session_id.to_string(),
            len: data.len(),
        });

        let mut event = ProcessedDataEvent {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            original_data: Bytes::copy_from_slice(data),
            processed_data: Bytes::copy_from_slice(data),
            transformations: Vec::new(),
            metadata,
        };

        for filter in &filters {
            match filter.accept(&event) {
                Ok(true) => {}
                Ok(false) => {
                    notify(PipelineNotice::Blocked {
                        session_id: session_id.to_string(),
                        filter: filter.name().to_string(),
                    });
                    return;
                }
                Err(e) => {
                    // Fail-open: a broken filter never blocks data.
                    notify(PipelineNotice::Error {
                        session_id: session_id.to_string(),
                        stage: format!("filter:{}", filter.name()),
                        message: e.to_string(),
                    });
                    warn!("filter {} failed (treated as pass): {}", filter.name(), e);
                }
            }
        }

        for (_, processor) in &processors {
            match processor.apply(&event) {
                Ok(ProcessorOutcome::Unchanged) => {}
                Ok(ProcessorOutcome::Replaced(bytes)) => {
                    if bytes != event.processed_data {
                        event.transformations.push(processor.name().to_string());
                        event.processed_data = Bytes::from(bytes);
                    }
                }
                Ok(ProcessorOutcome::Drop) => {
                    notify(PipelineNotice::Dropped {
                        session_id: session_id.to_string(),
                        processor: processor.name().to_string(),
                    });
                    return;
                }
                Err(e) => {
                    notify(PipelineNotice::Error {
                        session_id: session_id.to_string(),
                        stage: format!("processor:{}", processor.name()),
                        message: e.to_string(),
                    });
                    warn!("processor {} failed (skipped): {}", processor.name(), e);
                }
            }
        }

        if !event.transformations.is_empty() {
            notify(PipelineNotice::Transformed {
                session_id: session_id.to_string(),
                transformations: event.transformations.clone(),
            });
        }
        notify(PipelineNotice::Processed {
            session_id: session_id.to_string(),
        });

        for (scope, callback) in &data_subs {
            if let Some(scoped) = scope {
                if scoped != session_id {
                    continue;
                }
            }
            // A panicking subscriber must never stop the pipeline.
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!("pipeline subscriber panicked for session {}", session_id);
            }
        }
    }
}

/// Disposer returned by the subscribe calls. Dropping it without calling
/// `dispose()` leaves the subscription active.
pub struct Subscription {
    registry: Weak<RwLock<Registry>>,
    id: u64,
}

impl Subscription {
    pub fn dispose(self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.write().unwrap();
            registry.data_subscribers.retain(|s| s.id != self.id);
            registry.notice_subscribers.retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::filters::MaxDataSize;
    use super::processors::SecurityFilter;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Uppercase {
        priority: u8,
    }
    impl Processor for Uppercase {
        fn name(&self) -> &str {
            "uppercase"
        }
        fn priority(&self) -> u8 {
            self.priority
        }
        fn apply(&self, event: &ProcessedDataEvent) -> anyhow::Result<ProcessorOutcome> {
            Ok(ProcessorOutcome::Replaced(
                event.processed_data.to_ascii_uppercase(),
            ))
        }
    }

    struct Failing;
    impl Processor for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn apply(&self, _event: &ProcessedDataEvent) -> anyhow::Result<ProcessorOutcome> {
            anyhow::bail!("boom")
        }
    }

    fn collect_events(pipeline: &Pipeline) -> Arc<Mutex<Vec<ProcessedDataEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pipeline.on_data(move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[test]
    fn delivers_processed_event_to_subscribers() {
        let pipeline = Pipeline::new();
        let seen = collect_events(&pipeline);

        pipeline.process("s1", b"hello", ChunkMetadata::from_source(DataSource::Pty));

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(&events[0].processed_data[..], b"hello");
        assert!(events[0].transformations.is_empty());
    }

    #[test]
    fn filters_block_before_processors_run() {
        let pipeline = Pipeline::new();
        pipeline.add_filter(Arc::new(MaxDataSize::new(4)));
        let seen = collect_events(&pipeline);

        let blocked = Arc::new(AtomicUsize::new(0));
        let counter = blocked.clone();
        pipeline.on_notice(move |notice| {
            if matches!(notice, PipelineNotice::Blocked { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        pipeline.process(
            "s1",
            b"this is too long",
            ChunkMetadata::from_source(DataSource::Pty),
        );
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn processors_run_in_priority_order() {
        let pipeline = Pipeline::new();
        // Redaction at 10 runs before uppercasing at 50; the redacted
        // marker survives in uppercase form.
        pipeline.add_processor(Arc::new(Uppercase { priority: 50 }));
        pipeline.add_processor(Arc::new(SecurityFilter::new(vec![
            regex::bytes::Regex::new(r"password=\S+").unwrap(),
        ])));
        let seen = collect_events(&pipeline);

        pipeline.process(
            "s1",
            b"password=hunter2 ok",
            ChunkMetadata::from_source(DataSource::Pty),
        );

        let events = seen.lock().unwrap();
        assert_eq!(&events[0].processed_data[..], b"[REDACTED] OK");
        assert_eq!(events[0].transformations, vec!["security", "uppercase"]);
    }

    #[test]
    fn failing_processor_is_skipped_and_reported() {
        let pipeline = Pipeline::new();
        pipeline.add_processor(Arc::new(Failing));
        let seen = collect_events(&pipeline);

        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        pipeline.on_notice(move |notice| {
            if matches!(notice, PipelineNotice::Error { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        pipeline.process("s1", b"data", ChunkMetadata::from_source(DataSource::Pty));
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(&events[0].processed_data[..], b"data");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn session_scoped_subscription_only_sees_its_session() {
        let pipeline = Pipeline::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pipeline.on_session_data("s1", move |event| {
            sink.lock().unwrap().push(event.session_id.clone())
        });

        pipeline.process("s1", b"a", ChunkMetadata::from_source(DataSource::Pty));
        pipeline.process("s2", b"b", ChunkMetadata::from_source(DataSource::Pty));

        assert_eq!(*seen.lock().unwrap(), vec!["s1".to_string()]);
    }

    #[test]
    fn disposed_subscription_receives_nothing() {
        let pipeline = Pipeline::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let subscription = pipeline.on_data(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        pipeline.process("s1", b"one", ChunkMetadata::from_source(DataSource::Pty));
        subscription.dispose();
        pipeline.process("s1", b"two", ChunkMetadata::from_source(DataSource::Pty));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_delivery() {
        let pipeline = Pipeline::new();
        pipeline.on_data(|_| panic!("subscriber bug"));
        let seen = collect_events(&pipeline);

        pipeline.process("s1", b"x", ChunkMetadata::from_source(DataSource::Pty));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
