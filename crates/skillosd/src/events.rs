//! Event bus: mirrors every event into `tracing` and fans it out to
//! subscribers (the SSE endpoint, tests).

use skillos_core::events::{Event, EventPayload, EventType};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event_type: EventType, payload: EventPayload) {
        let event = Event::new(event_type, payload);
        log_event(&event);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

fn log_event(event: &Event) {
    let kind = event.event_type.as_str();
    match &event.payload {
        EventPayload::Invocation(p) => match event.event_type {
            EventType::SkillFailed | EventType::SkillTimeout | EventType::CircuitRejected => warn!(
                event = kind,
                trace_id = %p.trace_id,
                run_id = %p.run_id,
                step_id = %p.step_id,
                handler = %p.handler,
                attempt = p.attempt,
                latency_ms = p.latency_ms,
                error = p.error.as_deref(),
                "invocation event"
            ),
            _ => info!(
                event = kind,
                trace_id = %p.trace_id,
                run_id = %p.run_id,
                step_id = %p.step_id,
                handler = %p.handler,
                attempt = p.attempt,
                latency_ms = p.latency_ms,
                "invocation event"
            ),
        },
        EventPayload::RunStarted(p) => info!(
            event = kind,
            trace_id = %p.trace_id,
            run_id = %p.run_id,
            max_steps = p.max_steps,
            "run started"
        ),
        EventPayload::RunFinished(p) => info!(
            event = kind,
            trace_id = %p.trace_id,
            run_id = %p.run_id,
            status = p.status.as_str(),
            steps_completed = p.steps_completed,
            total_time_ms = p.total_time_ms,
            "run finished"
        ),
    }
}
