//! `streamline replay`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use streamline_core::session::StreamOutcome;
use streamline_core::stream::WireError;
use streamline_core::{
    CancellationCoordinator, CancellationReason, EngineConfig, InMemoryMessageStore,
    MarkdownBlock, MessageRecord, SessionIsolationManager, StreamEvent, StreamRequest,
    UiUpdateKind, WireDecoder,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

/// Bytes handed to the decoder at a time, mimicking transport chunks
const CHUNK_SIZE: usize = 256;

pub struct ReplayOptions {
    pub file: PathBuf,
    pub session: Option<String>,
    pub json: bool,
    pub delay_ms: u64,
}

#[derive(Debug, Serialize)]
struct ReplaySummary {
    session_id: String,
    message_id: String,
    events: usize,
    ui_updates: usize,
    outcome: StreamOutcome,
    record: Option<MessageRecord>,
    blocks: Vec<MarkdownBlock>,
}

pub async fn run(config: EngineConfig, options: ReplayOptions) -> Result<()> {
    let events = load_events(&options.file).await?;
    let event_count = events.len();
    info!(events = event_count, file = ?options.file, "Loaded recorded stream");

    let session_id = options
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let message_id = uuid::Uuid::new_v4().to_string();

    let sessions = Arc::new(SessionIsolationManager::new(config));
    let store = Arc::new(InMemoryMessageStore::new());
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let coordinator = CancellationCoordinator::new(sessions.clone(), store.clone(), ui_tx);

    store.add_placeholder(&message_id);
    let mut handle = coordinator
        .start_stream(
            StreamRequest::text(&session_id, &message_id),
            event_stream(events, options.delay_ms),
        )
        .await;

    let outcome = tokio::select! {
        joined = &mut handle => joined.context("stream task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            coordinator
                .cancel_current_job(CancellationReason::UserCancelled, false)
                .await;
            handle.await.context("stream task panicked")?
        }
    };
    drop(coordinator);

    let mut ui_updates = 0usize;
    let mut blocks = Vec::new();
    while let Ok(update) = ui_rx.try_recv() {
        ui_updates += 1;
        if let UiUpdateKind::Blocks(latest) = update.kind {
            blocks = latest;
        }
    }
    sessions.collect_garbage();

    let summary = ReplaySummary {
        record: store.record(&message_id),
        session_id,
        message_id,
        events: event_count,
        ui_updates,
        outcome,
        blocks,
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

/// Decode a recorded stream, skipping lines that do not decode
async fn load_events(path: &Path) -> Result<Vec<StreamEvent>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(decode_all(&bytes))
}

fn decode_all(bytes: &[u8]) -> Vec<StreamEvent> {
    let mut decoder = WireDecoder::new();
    let mut events = Vec::new();
    let mut push = |result: Result<StreamEvent, WireError>| match result {
        Ok(event) => events.push(event),
        Err(e) => warn!("Skipping undecodable line: {}", e),
    };
    for chunk in bytes.chunks(CHUNK_SIZE) {
        decoder.push_chunk(chunk).into_iter().for_each(&mut push);
    }
    if let Some(result) = decoder.finish() {
        push(result);
    }
    events
}

fn event_stream(events: Vec<StreamEvent>, delay_ms: u64) -> BoxStream<'static, StreamEvent> {
    if delay_ms == 0 {
        return stream::iter(events).boxed();
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        for event in events {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    UnboundedReceiverStream::new(rx).boxed()
}

fn render_block(block: &MarkdownBlock) -> String {
    match block {
        MarkdownBlock::Text { content } => content.clone(),
        MarkdownBlock::Code { content, language } => format!(
            "```{}\n{}\n```",
            language.as_deref().unwrap_or_default(),
            content.trim_end_matches('\n')
        ),
        MarkdownBlock::Math {
            latex,
            is_display: true,
        } => format!("$$\n{}\n$$", latex),
        MarkdownBlock::Math { latex, .. } => format!("${}$", latex),
        MarkdownBlock::Header { level, content } => {
            format!("{} {}", "#".repeat(usize::from(*level)), content)
        }
        MarkdownBlock::ListItem { content } => format!("- {}", content),
    }
}

fn print_summary(summary: &ReplaySummary) {
    for (idx, block) in summary.blocks.iter().enumerate() {
        println!("[{} {}]", idx, block.kind().as_str());
        println!("{}\n", render_block(block));
    }

    let outcome = match &summary.outcome {
        StreamOutcome::Completed => "completed".to_string(),
        StreamOutcome::Errored { message } => format!("errored: {}", message),
        StreamOutcome::Cancelled { reason } => format!("cancelled ({})", reason.as_str()),
    };
    eprintln!(
        "{} events, {} UI updates, {} blocks, {}",
        summary.events,
        summary.ui_updates,
        summary.blocks.len(),
        outcome
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RECORDING: &str = concat!(
        "{\"type\":\"reasoning\",\"text\":\"Thinking...\"}\n",
        "data: {\"type\":\"content\",\"text\":\"# Answer\\n\\nHello\"}\n",
        "not json\n",
        "\n",
        "{\"type\":\"content\",\"text\":\"# Answer\\n\\nHello, world!\"}\n",
        "data: [DONE]\n",
    );

    #[test]
    fn test_decode_all_skips_bad_lines() {
        let events = decode_all(RECORDING.as_bytes());
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], StreamEvent::Reasoning { .. }));
        assert_eq!(events[3], StreamEvent::Finish);
    }

    #[tokio::test]
    async fn test_replay_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RECORDING.as_bytes()).unwrap();

        let events = load_events(file.path()).await.unwrap();
        assert_eq!(events.len(), 4);

        run(
            EngineConfig::default(),
            ReplayOptions {
                file: file.path().to_path_buf(),
                session: Some("replay-test".to_string()),
                json: true,
                delay_ms: 0,
            },
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_render_block() {
        assert_eq!(
            render_block(&MarkdownBlock::Header {
                level: 2,
                content: "Setup".to_string()
            }),
            "## Setup"
        );
        assert_eq!(
            render_block(&MarkdownBlock::Code {
                content: "let x = 1;\n".to_string(),
                language: Some("rust".to_string())
            }),
            "```rust\nlet x = 1;\n```"
        );
        assert_eq!(
            render_block(&MarkdownBlock::Math {
                latex: "x^2".to_string(),
                is_display: false
            }),
            "$x^2$"
        );
    }
}
