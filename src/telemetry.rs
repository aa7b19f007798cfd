//! Pluggable metrics and tracing sinks
//!
//! The runner reports one rate counter and one duration timing per work
//! iteration, plus an error counter when an iteration fails, and opens a
//! span around session open/close and each iteration. Embedders wire these
//! traits to their aggregator of choice; the no-op implementations satisfy
//! both contracts for embedders that do not collect telemetry.

use std::time::Duration;

/// Sink for tagged counters and timings emitted by background runners.
pub trait Metrics: Send + Sync {
    /// Counts how often a background job runs. Incremented once per work
    /// iteration, tagged with the session and runner name.
    fn background_rate(&self, session_id: i64, job_name: &str, value: i64);

    /// Counts background job failures, carrying a short code and a message.
    fn background_error(
        &self,
        session_id: i64,
        job_name: &str,
        code: &str,
        message: &str,
        value: i64,
    );

    /// Tracks the runtime of a work iteration, submitted on success and
    /// failure alike.
    fn background_duration(&self, session_id: i64, job_name: &str, value: Duration);

    /// Free-form business counter for background jobs.
    fn background_custom(&self, session_id: i64, job_name: &str, custom_name: &str, value: i64);

    /// Counts calls to external partner services. Not emitted by the runner
    /// loop; present so one sink can serve a whole service.
    fn external_rate(&self, _direction: &str, _service: &str, _path: &str, _value: i64) {}

    /// Counts external partner call failures.
    fn external_error(
        &self,
        _direction: &str,
        _service: &str,
        _path: &str,
        _code: &str,
        _message: &str,
        _value: i64,
    ) {
    }

    /// Tracks the runtime of external partner calls.
    fn external_duration(&self, _direction: &str, _service: &str, _path: &str, _value: Duration) {}

    /// Free-form business counter for external partner calls.
    fn external_custom(
        &self,
        _direction: &str,
        _service: &str,
        _path: &str,
        _custom_name: &str,
        _value: i64,
    ) {
    }

    /// Free-form business counter for internal service-to-service calls.
    fn internal_custom(
        &self,
        _originating_service: &str,
        _destination_service: &str,
        _path: &str,
        _custom_name: &str,
        _value: i64,
    ) {
    }
}

/// A span handle returned by [`Tracer::start_span`].
pub trait Span: Send {
    /// Attach a free-form tag to the span.
    fn set_tag(&mut self, key: &str, value: &str);

    /// Mark the span as failed with an error description.
    fn set_error(&mut self, message: &str);

    /// Finalize and submit the span.
    fn finish(self: Box<Self>);
}

/// Starts named spans around runner operations.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str) -> Box<dyn Span>;
}

/// Metrics sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn background_rate(&self, _session_id: i64, _job_name: &str, _value: i64) {}

    fn background_error(
        &self,
        _session_id: i64,
        _job_name: &str,
        _code: &str,
        _message: &str,
        _value: i64,
    ) {
    }

    fn background_duration(&self, _session_id: i64, _job_name: &str, _value: Duration) {}

    fn background_custom(
        &self,
        _session_id: i64,
        _job_name: &str,
        _custom_name: &str,
        _value: i64,
    ) {
    }
}

/// Tracer that hands out inert spans.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

struct NoopSpan;

impl Span for NoopSpan {
    fn set_tag(&mut self, _key: &str, _value: &str) {}
    fn set_error(&mut self, _message: &str) {}
    fn finish(self: Box<Self>) {}
}

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}
