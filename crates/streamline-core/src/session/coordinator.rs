//! Stream job coordination
//!
//! Each stream channel has at most one live job. Starting a new stream on a
//! channel supersedes the job running there; stopping applies the
//! partial-content rule: anything the user already saw is kept as the final
//! message, an empty placeholder left by a user stop is removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cancellation::{CancellationReason, StreamCancellation};
use super::isolation::{SessionIsolationManager, StreamChannel};
use super::store::{MessageRecord, MessageStore};
use crate::blocks::{correct_format, MarkdownBlock, MarkdownBlockManager};
use crate::config::EngineConfig;
use crate::output::{OutputUpdate, StreamingOutputController};
use crate::stream::{ProcessedEventResult, StreamEvent, StreamEventProcessor, StreamPhase};

/// Identifies the message a stream fills
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRequest {
    pub session_id: String,
    pub message_id: String,
    pub channel: StreamChannel,
}

impl StreamRequest {
    pub fn text(session_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            channel: StreamChannel::Text,
        }
    }

    pub fn image(session_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            channel: StreamChannel::Image,
            ..Self::text(session_id, message_id)
        }
    }
}

/// How a stream job ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StreamOutcome {
    Completed,
    Errored { message: String },
    Cancelled { reason: CancellationReason },
}

/// Something the UI should render for one message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UiUpdate {
    pub message_id: String,
    #[serde(flatten)]
    pub kind: UiUpdateKind,
}

/// Answer text only ever arrives as `Output`, followed by the matching
/// `Blocks`; `Event` carries the other processor results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "update", content = "data", rename_all = "snake_case")]
pub enum UiUpdateKind {
    Event(ProcessedEventResult),
    Output(OutputUpdate),
    Blocks(Vec<MarkdownBlock>),
    Finished(StreamOutcome),
}

/// Appended to the visible text when a stream fails
fn error_marker(message: &str) -> String {
    format!("[Error: {}]", message)
}

struct ActiveJob {
    id: u64,
    request: StreamRequest,
    processor: Arc<StreamEventProcessor>,
    cancellation: StreamCancellation,
    /// Claimed by whichever side finalizes the message first
    finalized: Arc<AtomicBool>,
}

/// Live jobs, one slot per channel
type JobSlots = Arc<Mutex<HashMap<StreamChannel, ActiveJob>>>;

/// Everything a stream task needs, detached from the coordinator
struct JobContext {
    id: u64,
    request: StreamRequest,
    processor: Arc<StreamEventProcessor>,
    cancellation: StreamCancellation,
    finalized: Arc<AtomicBool>,
    store: Arc<dyn MessageStore>,
    ui: mpsc::UnboundedSender<UiUpdate>,
    config: EngineConfig,
    jobs: JobSlots,
}

impl JobContext {
    fn send(&self, kind: UiUpdateKind) {
        let update = UiUpdate {
            message_id: self.request.message_id.clone(),
            kind,
        };
        if self.ui.send(update).is_err() {
            debug!(message_id = %self.request.message_id, "UI receiver dropped");
        }
    }

    /// Forward what the output controller emitted, then the blocks that
    /// match the last emission
    fn forward_output(&self, rx: &mut mpsc::UnboundedReceiver<OutputUpdate>) {
        let mut latest = None;
        while let Ok(update) = rx.try_recv() {
            self.send(UiUpdateKind::Output(update.clone()));
            latest = Some(update);
        }
        if let Some(update) = latest {
            self.send(UiUpdateKind::Blocks(self.blocks_for(&update)));
        }
    }

    fn blocks_for(&self, update: &OutputUpdate) -> Vec<MarkdownBlock> {
        if !update.truncated {
            return self.processor.blocks();
        }
        // The processor keeps the full text past the cap
        let mut manager = MarkdownBlockManager::new(&self.config.blocks);
        manager.sync_text(&correct_format(&update.text));
        manager.blocks()
    }

    /// Report a stop the coordinator (or a session teardown) handled
    fn stopped(&self, reason: CancellationReason) -> StreamOutcome {
        debug!(job_id = self.id, reason = reason.as_str(), "Stream task stopped");
        let outcome = StreamOutcome::Cancelled { reason };
        self.send(UiUpdateKind::Finished(outcome.clone()));
        outcome
    }

    /// Clear this job's slot if it still holds this job
    fn release(&self) {
        let mut jobs = self.jobs.lock();
        if jobs.get(&self.request.channel).map(|job| job.id) == Some(self.id) {
            jobs.remove(&self.request.channel);
        }
    }
}

pub struct CancellationCoordinator {
    sessions: Arc<SessionIsolationManager>,
    store: Arc<dyn MessageStore>,
    ui: mpsc::UnboundedSender<UiUpdate>,
    jobs: JobSlots,
    next_job_id: AtomicU64,
}

impl CancellationCoordinator {
    pub fn new(
        sessions: Arc<SessionIsolationManager>,
        store: Arc<dyn MessageStore>,
        ui: mpsc::UnboundedSender<UiUpdate>,
    ) -> Self {
        Self {
            sessions,
            store,
            ui,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_job_id: AtomicU64::new(1),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionIsolationManager> {
        &self.sessions
    }

    /// Whether any channel has a live job
    pub fn has_active_job(&self) -> bool {
        !self.jobs.lock().is_empty()
    }

    /// Request of the live job on `channel`, if any
    pub fn active_request(&self, channel: StreamChannel) -> Option<StreamRequest> {
        self.jobs
            .lock()
            .get(&channel)
            .map(|job| job.request.clone())
    }

    /// Start consuming `events` for `request`, superseding the live job on
    /// the same channel
    pub async fn start_stream<S>(
        &self,
        request: StreamRequest,
        events: S,
    ) -> JoinHandle<StreamOutcome>
    where
        S: Stream<Item = StreamEvent> + Send + 'static,
    {
        self.cancel_channel_job(
            request.channel,
            CancellationReason::SupersededByNewStream,
            true,
        )
        .await;

        self.sessions
            .switch_session(request.channel, &request.session_id);
        let processor = self
            .sessions
            .restart_message_processor(&request.session_id, &request.message_id);

        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let cancellation = StreamCancellation::new();
        let finalized = Arc::new(AtomicBool::new(false));

        self.jobs.lock().insert(
            request.channel,
            ActiveJob {
                id,
                request: request.clone(),
                processor: processor.clone(),
                cancellation: cancellation.clone(),
                finalized: finalized.clone(),
            },
        );

        info!(
            job_id = id,
            channel = ?request.channel,
            session_id = %request.session_id,
            message_id = %request.message_id,
            "Starting stream job"
        );

        let ctx = JobContext {
            id,
            request,
            processor,
            cancellation,
            finalized,
            store: self.store.clone(),
            ui: self.ui.clone(),
            config: self.sessions.config().clone(),
            jobs: self.jobs.clone(),
        };
        tokio::spawn(run_stream(ctx, events))
    }

    /// Cancel every live job. Returns true if any job was cancelled.
    pub async fn cancel_current_job(
        &self,
        reason: CancellationReason,
        is_new_message_send: bool,
    ) -> bool {
        let channels: Vec<StreamChannel> = self.jobs.lock().keys().copied().collect();
        let mut cancelled = false;
        for channel in channels {
            cancelled |= self
                .cancel_channel_job(channel, reason, is_new_message_send)
                .await;
        }
        cancelled
    }

    /// Cancel the live job on `channel`, if any. Returns true if a job was
    /// cancelled.
    ///
    /// Partial text is committed and history saved. When nothing was
    /// received, a user stop without a follow-up message removes the
    /// placeholder; any other case keeps it.
    pub async fn cancel_channel_job(
        &self,
        channel: StreamChannel,
        reason: CancellationReason,
        is_new_message_send: bool,
    ) -> bool {
        let job = self.jobs.lock().remove(&channel);
        let Some(job) = job else {
            return false;
        };

        // Reason first, so the task sees it the moment it wakes
        if !job.cancellation.cancel(reason) {
            return false;
        }
        job.processor.cancel();

        info!(
            job_id = job.id,
            channel = ?channel,
            message_id = %job.request.message_id,
            reason = reason.as_str(),
            "Cancelling stream job"
        );

        if job.finalized.swap(true, Ordering::SeqCst) {
            debug!(job_id = job.id, "Job already finalized");
            return true;
        }

        let text = job.processor.current_text().trim().to_string();
        let reasoning = job
            .processor
            .current_reasoning()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        if !text.is_empty() || reasoning.is_some() {
            let record =
                MessageRecord::new(&job.request.session_id, &job.request.message_id, text)
                    .with_reasoning(reasoning)
                    .partial();
            commit_and_save(self.store.as_ref(), record).await;
        } else if reason == CancellationReason::UserCancelled && !is_new_message_send {
            if let Err(e) = self.store.remove_placeholder(&job.request.message_id).await {
                warn!(message_id = %job.request.message_id, "Failed to remove placeholder: {}", e);
            }
        } else {
            debug!(
                message_id = %job.request.message_id,
                "Keeping placeholder for cancelled job"
            );
        }
        true
    }
}

async fn commit_and_save(store: &dyn MessageStore, record: MessageRecord) {
    let message_id = record.message_id.clone();
    if let Err(e) = store.commit(record).await {
        warn!(message_id = %message_id, "Failed to commit message: {}", e);
        return;
    }
    if let Err(e) = store.save_history().await {
        warn!(message_id = %message_id, "Failed to save history: {}", e);
    }
}

async fn run_stream<S>(ctx: JobContext, events: S) -> StreamOutcome
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let mut events = Box::pin(events);
    let stop = ctx.cancellation.child_token();
    let (mut output, mut output_rx) = StreamingOutputController::channel(&ctx.config.output);
    let mut failure: Option<String> = None;

    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = events.next() => match next {
                Some(event) => event,
                None => break,
            },
        };

        match ctx.processor.process_event(event) {
            ProcessedEventResult::Cancelled => break,
            ProcessedEventResult::NoChange => continue,
            ProcessedEventResult::ContentUpdated { text } => {
                output.replace_text(&text);
            }
            ProcessedEventResult::Error { message } => {
                failure = Some(message.clone());
                ctx.send(UiUpdateKind::Event(ProcessedEventResult::Error { message }));
            }
            other => ctx.send(UiUpdateKind::Event(other)),
        }
        ctx.forward_output(&mut output_rx);

        if failure.is_some() || ctx.processor.phase() == StreamPhase::Completed {
            break;
        }
    }

    // Settle the phase before claiming the message
    if failure.is_none() && ctx.processor.force_complete() {
        debug!(message_id = %ctx.request.message_id, "Stream ended without finish event");
    }

    // Cancelled by the coordinator, which handles the message
    if let Some(reason) = ctx.cancellation.reason() {
        return ctx.stopped(reason);
    }
    if ctx.finalized.swap(true, Ordering::SeqCst) {
        let reason = ctx
            .cancellation
            .reason()
            .unwrap_or(CancellationReason::UserCancelled);
        return ctx.stopped(reason);
    }

    let session_id = &ctx.request.session_id;
    let message_id = &ctx.request.message_id;

    if ctx.processor.phase() == StreamPhase::Cancelled {
        info!(
            session_id = %session_id,
            message_id = %message_id,
            "Stream job dropped with its session"
        );
        ctx.release();
        return ctx.stopped(CancellationReason::SupersededByNewStream);
    }

    output.flush_update();
    ctx.forward_output(&mut output_rx);

    let reasoning = ctx.processor.current_reasoning();
    let outcome = match failure {
        Some(message) => {
            let text = ctx.processor.current_text();
            let marked = if text.trim().is_empty() {
                error_marker(&message)
            } else {
                format!("{}\n\n{}", text.trim_end(), error_marker(&message))
            };
            warn!(
                session_id = %session_id,
                message_id = %message_id,
                error = %message,
                "Stream failed"
            );
            let record = MessageRecord::new(session_id, message_id, marked)
                .with_reasoning(reasoning)
                .errored();
            commit_and_save(ctx.store.as_ref(), record).await;
            StreamOutcome::Errored { message }
        }
        None => {
            let record =
                MessageRecord::new(session_id, message_id, ctx.processor.current_text())
                    .with_reasoning(reasoning);
            commit_and_save(ctx.store.as_ref(), record).await;
            info!(session_id = %session_id, message_id = %message_id, "Stream job completed");
            StreamOutcome::Completed
        }
    };

    ctx.release();
    ctx.send(UiUpdateKind::Finished(outcome.clone()));
    outcome
}
