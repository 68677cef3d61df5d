//! The pipeline: state machine, bus, and clock selection.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::{Bus, BusMessage, BusSender};
use crate::clock::ClockSource;
use crate::error::PipelineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl PipelineState {
    fn rank(self) -> i8 {
        match self {
            PipelineState::Null => 0,
            PipelineState::Ready => 1,
            PipelineState::Paused => 2,
            PipelineState::Playing => 3,
        }
    }

    fn from_rank(rank: i8) -> PipelineState {
        match rank {
            0 => PipelineState::Null,
            1 => PipelineState::Ready,
            2 => PipelineState::Paused,
            _ => PipelineState::Playing,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PipelineState::Null => "null",
            PipelineState::Ready => "ready",
            PipelineState::Paused => "paused",
            PipelineState::Playing => "playing",
        })
    }
}

/// The pipeline owns the bus and the clock; elements are owned by the
/// component that assembled them and share the bus through
/// [`Pipeline::bus_sender`].
pub struct Pipeline {
    name: Arc<str>,
    bus: Bus,
    state: Mutex<PipelineState>,
    clock: Mutex<ClockSource>,
}

impl Pipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            bus: Bus::new(),
            state: Mutex::new(PipelineState::Null),
            clock: Mutex::new(ClockSource::system()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    /// Has the pipeline moved past READY? Decides whether an fd can
    /// be set directly or needs the block/swap/unblock dance.
    pub fn past_ready(&self) -> bool {
        self.state().rank() > PipelineState::Ready.rank()
    }

    pub fn bus_sender(&self) -> BusSender {
        self.bus.sender()
    }

    pub fn take_bus_receiver(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<BusMessage>> {
        self.bus.take_receiver()
    }

    /// Walk to `target` one state at a time, posting a `StateChanged`
    /// bus message for every hop.
    pub async fn set_state(&self, target: PipelineState) -> PipelineResult<PipelineState> {
        loop {
            let (old, new) = {
                let mut state = self.state.lock().unwrap();
                let current = *state;
                if current == target {
                    return Ok(current);
                }
                let step = if target.rank() > current.rank() { 1 } else { -1 };
                let next = PipelineState::from_rank(current.rank() + step);
                *state = next;
                (current, next)
            };
            debug!(pipeline = %self.name, %old, %new, "pipeline state hop");
            self.bus.sender().post(BusMessage::StateChanged {
                element: self.name.to_string(),
                old,
                new,
            });
            tokio::task::yield_now().await;
        }
    }

    pub fn set_clock(&self, clock: ClockSource) {
        *self.clock.lock().unwrap() = clock;
    }

    pub fn base_time_ns(&self) -> i64 {
        self.clock.lock().unwrap().base_time_ns()
    }

    pub fn clock_now_ns(&self) -> i64 {
        self.clock.lock().unwrap().now_ns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn walks_through_intermediate_states() {
        let pipeline = Pipeline::new("test-pipeline");
        let mut rx = pipeline.take_bus_receiver().unwrap();

        pipeline.set_state(PipelineState::Playing).await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Playing);

        let mut hops = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let BusMessage::StateChanged { old, new, .. } = message {
                hops.push((old, new));
            }
        }
        assert_eq!(
            hops,
            vec![
                (PipelineState::Null, PipelineState::Ready),
                (PipelineState::Ready, PipelineState::Paused),
                (PipelineState::Paused, PipelineState::Playing),
            ]
        );
    }

    #[tokio::test]
    async fn downward_transition_also_hops() {
        let pipeline = Pipeline::new("test-pipeline");
        pipeline.set_state(PipelineState::Playing).await.unwrap();
        pipeline.set_state(PipelineState::Null).await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Null);
    }

    #[tokio::test]
    async fn past_ready_gates_fd_swaps() {
        let pipeline = Pipeline::new("test-pipeline");
        assert!(!pipeline.past_ready());
        pipeline.set_state(PipelineState::Ready).await.unwrap();
        assert!(!pipeline.past_ready());
        pipeline.set_state(PipelineState::Paused).await.unwrap();
        assert!(pipeline.past_ready());
    }
}
