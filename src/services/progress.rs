use crate::models::CompressionAlgorithm;
use crate::utils::format::{format_file_size, reduction_percent};
use serde::Serialize;
use tokio::sync::mpsc;
use utoipa::ToSchema;

/// Stage-boundary notifications for one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Received {
        file_id: String,
        original_name: String,
        original_size: u64,
    },
    CompressionStarted {
        algorithm: CompressionAlgorithm,
        level: u32,
    },
    CompressionFinished {
        compressed_size: u64,
        ratio: f64,
    },
    UploadStarted {
        attempt: u32,
    },
    UploadRetry {
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    UploadFinished {
        attempts: u32,
    },
    Stored {
        file_id: String,
        ratio: f64,
        summary: String,
    },
    Failed {
        file_id: Option<String>,
        reason: String,
    },
}

impl TransferEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, TransferEvent::Stored { .. } | TransferEvent::Failed { .. })
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            TransferEvent::Received { .. } => "received",
            TransferEvent::CompressionStarted { .. } => "compression_started",
            TransferEvent::CompressionFinished { .. } => "compression_finished",
            TransferEvent::UploadStarted { .. } => "upload_started",
            TransferEvent::UploadRetry { .. } => "upload_retry",
            TransferEvent::UploadFinished { .. } => "upload_finished",
            TransferEvent::Stored { .. } => "stored",
            TransferEvent::Failed { .. } => "failed",
        }
    }
}

/// Human summary attached to the final STORED event.
pub fn stored_summary(original_size: u64, stored_size: u64, ratio: f64) -> String {
    if original_size == stored_size {
        format!("Stored {}", format_file_size(original_size))
    } else {
        format!(
            "Stored {} as {} ({:.1}% smaller)",
            format_file_size(original_size),
            format_file_size(stored_size),
            reduction_percent(ratio)
        )
    }
}

/// Best-effort sender. A slow or vanished listener never stalls the pipeline.
#[derive(Clone)]
pub struct ProgressNotifier {
    tx: Option<mpsc::Sender<TransferEvent>>,
}

impl ProgressNotifier {
    pub fn new(tx: mpsc::Sender<TransferEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    /// Drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn notify(&self, event: TransferEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            tracing::debug!("Dropped progress event: {}", e);
        }
    }
}
