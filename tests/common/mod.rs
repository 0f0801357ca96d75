#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use matchplay::{
    OutgoingMessage,
    question::{Choice, Question, QuestionKind},
    registry::SessionHandle,
    session::{Phase, SyncMessage, UpdateMessage},
    tunnel::Tunnel,
};
use tracing_subscriber::{EnvFilter, fmt};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Installs a test subscriber once; level from `TEST_LOG`, then `RUST_LOG`, then `warn`
pub fn init_logging() {
    INITIALIZED.get_or_init(|| {
        let filter = std::env::var("TEST_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new("warn"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .try_init()
            .ok();
    });
}

/// Tunnel that records every frame as JSON
#[derive(Debug, Clone, Default)]
pub struct RecordingTunnel {
    frames: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingTunnel {
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.frames.lock().unwrap().iter().any(|f| f.contains(needle))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Tunnel for RecordingTunnel {
    fn send_message(&self, message: &OutgoingMessage<UpdateMessage>) {
        self.frames.lock().unwrap().push(message.to_message());
    }

    fn send_state(&self, state: &OutgoingMessage<SyncMessage>) {
        self.frames.lock().unwrap().push(state.to_message());
    }

    fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn choice_question(id: &str, correct: &[usize], time_allowed: u32) -> Question {
    Question {
        id: id.into(),
        text: format!("Question {id}"),
        points: 10,
        time_allowed,
        kind: QuestionKind::Choice {
            choices: (0..3)
                .map(|i| Choice {
                    text: format!("option {i}"),
                    is_correct: correct.contains(&i),
                })
                .collect(),
        },
    }
}

/// Polls the published view until the phase matches, advancing paused time
pub async fn wait_for_phase(handle: &SessionHandle<RecordingTunnel>, phase: Phase) {
    for _ in 0..200 {
        if handle.view().phase == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("session never reached {phase:?}, stuck in {:?}", handle.view().phase);
}
