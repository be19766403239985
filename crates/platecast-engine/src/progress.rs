use anyhow::Result;
use platecast_contracts::events::{EventPayload, EventWriter};
use serde_json::{json, Value};

use crate::pipeline::{BatchRun, ItemStage, PipelineItemResult, Progress};
use crate::retry::RetryNotice;

/// Hooks the runner calls while a batch moves forward. All methods default to
/// doing nothing; an `Err` aborts the batch, so only return one for IO
/// failures the caller must see.
pub trait PipelineObserver {
    fn batch_started(&mut self, _total: usize, _max_items: usize) -> Result<()> {
        Ok(())
    }

    fn batch_truncated(&mut self, _rejected: usize, _max_items: usize) -> Result<()> {
        Ok(())
    }

    fn warning(&mut self, _message: &str) -> Result<()> {
        Ok(())
    }

    fn item_stage(&mut self, _index: usize, _stage: ItemStage) -> Result<()> {
        Ok(())
    }

    fn retry_scheduled(&mut self, _index: usize, _notice: &RetryNotice) -> Result<()> {
        Ok(())
    }

    fn item_finished(&mut self, _result: &PipelineItemResult, _progress: Progress) -> Result<()> {
        Ok(())
    }

    fn batch_finished(&mut self, _run: &BatchRun) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Mirrors pipeline progress into the JSONL event log.
#[derive(Debug, Clone)]
pub struct EventLogObserver {
    events: EventWriter,
}

impl EventLogObserver {
    pub fn new(events: EventWriter) -> Self {
        Self { events }
    }

    fn emit(&self, event_type: &str, payload: Value) -> Result<()> {
        self.events.emit(event_type, map_object(payload))?;
        Ok(())
    }
}

impl PipelineObserver for EventLogObserver {
    fn batch_started(&mut self, total: usize, max_items: usize) -> Result<()> {
        self.emit(
            "batch_started",
            json!({ "total": total, "max_items": max_items }),
        )
    }

    fn batch_truncated(&mut self, rejected: usize, max_items: usize) -> Result<()> {
        self.emit(
            "batch_truncated",
            json!({ "rejected": rejected, "max_items": max_items }),
        )
    }

    fn item_stage(&mut self, index: usize, stage: ItemStage) -> Result<()> {
        self.emit(
            "item_stage",
            json!({ "index": index, "stage": stage.as_str() }),
        )
    }

    fn retry_scheduled(&mut self, index: usize, notice: &RetryNotice) -> Result<()> {
        self.emit(
            "retry_scheduled",
            json!({
                "index": index,
                "label": notice.label,
                "attempt": notice.attempt,
                "max_attempts": notice.max_attempts,
                "delay_ms": notice.delay.as_millis() as u64,
                "provider": notice.error.provider(),
                "status": notice.error.status(),
                "error": notice.error.to_string(),
            }),
        )
    }

    fn item_finished(&mut self, result: &PipelineItemResult, progress: Progress) -> Result<()> {
        let mut payload = result.to_row();
        payload.insert("done".to_string(), json!(progress.done));
        payload.insert("total".to_string(), json!(progress.total));
        payload.insert("fraction".to_string(), json!(progress.fraction()));
        self.events.emit("item_finished", payload)?;
        Ok(())
    }

    fn batch_finished(&mut self, run: &BatchRun) -> Result<()> {
        self.emit(
            "batch_finished",
            json!({
                "succeeded": run.succeeded(),
                "failed": run.failed(),
                "rejected": run.rejected,
                "summary": run.summary_line(),
            }),
        )
    }
}

pub(crate) fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}
