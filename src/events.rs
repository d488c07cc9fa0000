//! Publish/subscribe hub between document adapters, the player and the UI.
//!
//! Every event kind is part of the wire contract with the UI layer, so the
//! set is closed: [`PlayerEvent`] carries the payload, [`EventKind`] is the
//! subscription key and owns the wire name. Delivery is synchronous and in
//! registration order. The last [`EVENT_LOG_CAPACITY`] publications are kept
//! for diagnostics.

use crate::document::Paragraph;
use crate::player::PlayingState;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, trace};

pub const EVENT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Next,
    Previous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParagraphMove {
    pub from: Option<usize>,
    pub to: usize,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PlayerEvent {
    NewParagraphsAvailable(Vec<Paragraph>),
    NextViewParagraphsAvailable(Vec<Paragraph>),
    PreviousViewParagraphsAvailable(Vec<Paragraph>),
    ParagraphHighlighted(Paragraph),
    ParagraphUnhighlighted(Paragraph),
    PageChanged,
    ParagraphIndexChanged {
        index: Option<usize>,
        paragraph: Option<Paragraph>,
    },
    PlayingStateChanged(PlayingState),
    ErrorsChanged {
        errors: Vec<String>,
    },
    MovedToNextParagraph(ParagraphMove),
    MovedToPrevParagraph(ParagraphMove),
    AudioEnded(Paragraph),
    PlayingAudio(Paragraph),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewParagraphsAvailable,
    NextViewParagraphsAvailable,
    PreviousViewParagraphsAvailable,
    ParagraphHighlighted,
    ParagraphUnhighlighted,
    PageChanged,
    ParagraphIndexChanged,
    PlayingStateChanged,
    ErrorsChanged,
    MovedToNextParagraph,
    MovedToPrevParagraph,
    AudioEnded,
    PlayingAudio,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::NewParagraphsAvailable,
        EventKind::NextViewParagraphsAvailable,
        EventKind::PreviousViewParagraphsAvailable,
        EventKind::ParagraphHighlighted,
        EventKind::ParagraphUnhighlighted,
        EventKind::PageChanged,
        EventKind::ParagraphIndexChanged,
        EventKind::PlayingStateChanged,
        EventKind::ErrorsChanged,
        EventKind::MovedToNextParagraph,
        EventKind::MovedToPrevParagraph,
        EventKind::AudioEnded,
        EventKind::PlayingAudio,
    ];

    /// Wire name seen by the UI layer.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewParagraphsAvailable => "newParagraphsAvailable",
            Self::NextViewParagraphsAvailable => "nextViewParagraphsAvailable",
            Self::PreviousViewParagraphsAvailable => "previousViewParagraphsAvailable",
            Self::ParagraphHighlighted => "paragraphHighlighted",
            Self::ParagraphUnhighlighted => "paragraphUnhighlighted",
            Self::PageChanged => "pageChanged",
            Self::ParagraphIndexChanged => "paragraphIndexChanged",
            Self::PlayingStateChanged => "playingStateChanged",
            Self::ErrorsChanged => "errorsChanged",
            Self::MovedToNextParagraph => "movedToNextParagraph",
            Self::MovedToPrevParagraph => "movedToPrevParagraph",
            Self::AudioEnded => "audioEnded",
            Self::PlayingAudio => "playingAudio",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PlayerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewParagraphsAvailable(_) => EventKind::NewParagraphsAvailable,
            Self::NextViewParagraphsAvailable(_) => EventKind::NextViewParagraphsAvailable,
            Self::PreviousViewParagraphsAvailable(_) => EventKind::PreviousViewParagraphsAvailable,
            Self::ParagraphHighlighted(_) => EventKind::ParagraphHighlighted,
            Self::ParagraphUnhighlighted(_) => EventKind::ParagraphUnhighlighted,
            Self::PageChanged => EventKind::PageChanged,
            Self::ParagraphIndexChanged { .. } => EventKind::ParagraphIndexChanged,
            Self::PlayingStateChanged(_) => EventKind::PlayingStateChanged,
            Self::ErrorsChanged { .. } => EventKind::ErrorsChanged,
            Self::MovedToNextParagraph(_) => EventKind::MovedToNextParagraph,
            Self::MovedToPrevParagraph(_) => EventKind::MovedToPrevParagraph,
            Self::AudioEnded(_) => EventKind::AudioEnded,
            Self::PlayingAudio(_) => EventKind::PlayingAudio,
        }
    }

    /// Payload as it appears in the diagnostic log.
    pub fn args(&self) -> Value {
        let value = match self {
            Self::NewParagraphsAvailable(paragraphs)
            | Self::NextViewParagraphsAvailable(paragraphs)
            | Self::PreviousViewParagraphsAvailable(paragraphs) => serde_json::to_value(paragraphs),
            Self::ParagraphHighlighted(paragraph)
            | Self::ParagraphUnhighlighted(paragraph)
            | Self::AudioEnded(paragraph)
            | Self::PlayingAudio(paragraph) => serde_json::to_value(paragraph),
            Self::PageChanged => Ok(Value::Null),
            Self::ParagraphIndexChanged { index, paragraph } => {
                Ok(json!({ "index": index, "paragraph": paragraph }))
            }
            Self::PlayingStateChanged(state) => serde_json::to_value(state),
            Self::ErrorsChanged { errors } => Ok(json!({ "errors": errors })),
            Self::MovedToNextParagraph(movement) | Self::MovedToPrevParagraph(movement) => {
                serde_json::to_value(movement)
            }
        };
        value.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub timestamp_ms: u64,
    pub event_name: &'static str,
    pub args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Handler = Arc<dyn Fn(&PlayerEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    logs: VecDeque<EventRecord>,
}

#[derive(Default)]
pub struct EventHub {
    state: Mutex<HubState>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log the event, then deliver it to the current subscribers of its kind.
    /// Returns whether anyone was subscribed.
    pub fn publish(&self, event: PlayerEvent) -> bool {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let mut state = self.lock();
            state.logs.push_back(EventRecord {
                timestamp_ms: now_ms(),
                event_name: kind.as_str(),
                args: event.args(),
            });
            while state.logs.len() > EVENT_LOG_CAPACITY {
                state.logs.pop_front();
            }
            state
                .subscribers
                .iter()
                .filter(|sub| sub.kind == kind)
                .map(|sub| Arc::clone(&sub.handler))
                .collect()
        };

        trace!(event = %kind, subscribers = handlers.len(), "Publishing event");
        for handler in &handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if outcome.is_err() {
                error!(event = %kind, "Event subscriber panicked; continuing delivery");
            }
        }
        !handlers.is_empty()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.subscribers.push(Subscriber {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns false when it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|sub| sub.id != id);
        before != state.subscribers.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|sub| sub.kind == kind)
            .count()
    }

    /// Snapshot of the diagnostic log, oldest first.
    pub fn logs(&self) -> Vec<EventRecord> {
        self.lock().logs.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn paragraph(locator: &str) -> Paragraph {
        Paragraph::new(format!("Text for {locator}."), locator)
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_name("nope"), None);
    }

    #[test]
    fn publish_reports_whether_anyone_listened() {
        let hub = EventHub::new();
        assert!(!hub.publish(PlayerEvent::PageChanged));
        hub.subscribe(EventKind::PageChanged, |_| {});
        assert!(hub.publish(PlayerEvent::PageChanged));
        assert!(!hub.publish(PlayerEvent::AudioEnded(paragraph("p0"))));
    }

    #[test]
    fn delivery_follows_registration_order() {
        let hub = EventHub::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for id in 0..3 {
            let seen = Arc::clone(&seen);
            hub.subscribe(EventKind::PlayingAudio, move |_| seen.lock().unwrap().push(id));
        }
        hub.publish(PlayerEvent::PlayingAudio(paragraph("p0")));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let hub = EventHub::new();
        let id = hub.subscribe(EventKind::PageChanged, |_| {});
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.subscriber_count(EventKind::PageChanged), 0);
        assert!(!hub.publish(PlayerEvent::PageChanged));
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let hub = EventHub::new();
        let reached = Arc::new(StdMutex::new(false));
        hub.subscribe(EventKind::PageChanged, |_| panic!("subscriber failure"));
        let flag = Arc::clone(&reached);
        hub.subscribe(EventKind::PageChanged, move |_| *flag.lock().unwrap() = true);
        assert!(hub.publish(PlayerEvent::PageChanged));
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn handlers_may_publish_reentrantly() {
        let hub = Arc::new(EventHub::new());
        let inner = Arc::clone(&hub);
        hub.subscribe(EventKind::PageChanged, move |_| {
            inner.publish(PlayerEvent::ErrorsChanged { errors: Vec::new() });
        });
        hub.publish(PlayerEvent::PageChanged);
        let names: Vec<_> = hub.logs().iter().map(|r| r.event_name).collect();
        assert_eq!(names, vec!["pageChanged", "errorsChanged"]);
    }

    #[test]
    fn log_keeps_only_the_latest_hundred() {
        let hub = EventHub::new();
        for idx in 0..150 {
            hub.publish(PlayerEvent::ParagraphIndexChanged {
                index: Some(idx),
                paragraph: None,
            });
        }
        let logs = hub.logs();
        assert_eq!(logs.len(), EVENT_LOG_CAPACITY);
        assert_eq!(logs[0].args["index"], json!(50));
        assert_eq!(logs[99].args["index"], json!(149));
        assert!(
            logs.iter()
                .all(|record| record.args["index"].as_u64().unwrap() >= 50)
        );
    }

    #[test]
    fn log_args_carry_payload_shape() {
        let hub = EventHub::new();
        hub.publish(PlayerEvent::MovedToNextParagraph(ParagraphMove {
            from: Some(1),
            to: 2,
            direction: Direction::Next,
        }));
        hub.publish(PlayerEvent::PlayingStateChanged(PlayingState::WaitingForNewParagraphs));
        let logs = hub.logs();
        assert_eq!(logs[0].event_name, "movedToNextParagraph");
        assert_eq!(logs[0].args, json!({"from": 1, "to": 2, "direction": "next"}));
        assert_eq!(logs[1].args, json!("waitingForNewParagraphs"));
    }
}
