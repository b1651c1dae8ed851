use std::collections::HashMap;

use shared::domain::{Cursor, MatchupId, Message, MessageId};
use shared::graphql::MessagePage;

/// One element of the render sequence. The run flags mark consecutive
/// same-sender groups so a view can collapse avatars and bubble corners.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub message: Message,
    pub first_of_run: bool,
    pub last_of_run: bool,
}

/// What a consumer renders for one conversation. `Unavailable` is distinct
/// from an empty conversation: the first means the history could not be
/// loaded, the second renders as an empty timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineState {
    Unavailable { reason: String },
    Ready { messages: Vec<RenderedMessage> },
}

/// Merges the historical page and live pages of one matchup into a single
/// duplicate-free, stably ordered timeline.
///
/// Messages are keyed by id and immutable once observed, so applying the
/// same page twice, or overlapping history and live windows, changes
/// nothing. Successive [`timeline`](Self::timeline) outputs are
/// monotonically non-decreasing: a message, once rendered, never
/// disappears.
pub struct MessageSynchronizer {
    matchup_id: MatchupId,
    by_id: HashMap<MessageId, Message>,
    end_cursor: Option<Cursor>,
    history_loaded: bool,
    unavailable: Option<String>,
}

impl MessageSynchronizer {
    pub fn new(matchup_id: MatchupId) -> Self {
        Self {
            matchup_id,
            by_id: HashMap::new(),
            end_cursor: None,
            history_loaded: false,
            unavailable: None,
        }
    }

    pub fn matchup_id(&self) -> MatchupId {
        self.matchup_id
    }

    /// Merges the historical window and clears any unavailable marker.
    pub fn apply_history(&mut self, page: MessagePage) {
        self.unavailable = None;
        self.history_loaded = true;
        self.absorb(page);
    }

    /// Merges one incremental page from the live stream.
    pub fn apply_live(&mut self, page: MessagePage) {
        self.absorb(page);
    }

    fn absorb(&mut self, page: MessagePage) {
        if page.page_info.end_cursor.is_some() {
            self.end_cursor = page.page_info.end_cursor;
        }
        for node in page.nodes {
            let message = node.into_message(self.matchup_id);
            self.by_id.entry(message.id).or_insert(message);
        }
    }

    /// Marks the conversation unavailable. Ignored once a history window
    /// loaded, so a rendered timeline never regresses to an error state.
    pub fn mark_unavailable(&mut self, reason: impl Into<String>) {
        if !self.history_loaded {
            self.unavailable = Some(reason.into());
        }
    }

    /// Where a live subscription should resume so already-known messages
    /// are not re-sent. Tracks the most recent page that carried a cursor.
    pub fn resume_cursor(&self) -> Option<&Cursor> {
        self.end_cursor.as_ref()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The current render state: timestamp-ascending with id as the stable
    /// tie-break, annotated with sender-run boundaries.
    pub fn timeline(&self) -> TimelineState {
        if let Some(reason) = &self.unavailable {
            return TimelineState::Unavailable {
                reason: reason.clone(),
            };
        }
        let mut ordered: Vec<&Message> = self.by_id.values().collect();
        ordered.sort_by_key(|message| message.order_key());
        let messages = ordered
            .iter()
            .enumerate()
            .map(|(index, message)| {
                let previous = index.checked_sub(1).and_then(|i| ordered.get(i));
                let next = ordered.get(index + 1);
                RenderedMessage {
                    message: (*message).clone(),
                    first_of_run: previous.map_or(true, |p| p.sender_id != message.sender_id),
                    last_of_run: next.map_or(true, |n| n.sender_id != message.sender_id),
                }
            })
            .collect();
        TimelineState::Ready { messages }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use shared::domain::ProfileId;
    use shared::graphql::{MessageNode, PageInfo};
    use uuid::Uuid;

    use super::*;

    fn node(id: u128, sender: u128, second: u32, text: &str) -> MessageNode {
        MessageNode {
            id: MessageId(Uuid::from_u128(id)),
            sender_id: ProfileId(Uuid::from_u128(sender)),
            text: text.to_string(),
            timestamp: Utc
                .with_ymd_and_hms(2022, 12, 1, 10, 0, second)
                .single()
                .expect("timestamp"),
        }
    }

    fn page(cursor: Option<&str>, nodes: Vec<MessageNode>) -> MessagePage {
        MessagePage {
            page_info: PageInfo {
                end_cursor: cursor.map(|c| Cursor(c.to_string())),
            },
            nodes,
        }
    }

    fn rendered_texts(state: &TimelineState) -> Vec<String> {
        match state {
            TimelineState::Ready { messages } => messages
                .iter()
                .map(|rendered| rendered.message.text.clone())
                .collect(),
            TimelineState::Unavailable { reason } => panic!("unavailable: {reason}"),
        }
    }

    #[test]
    fn overlapping_history_and_live_windows_render_each_message_once() {
        let mut sync = MessageSynchronizer::new(MatchupId(Uuid::nil()));
        sync.apply_history(page(
            Some("c1"),
            vec![node(1, 10, 1, "hello"), node(2, 11, 2, "hi yourself")],
        ));
        // The live window re-delivers the boundary message plus a new one.
        sync.apply_live(page(
            Some("c2"),
            vec![node(2, 11, 2, "hi yourself"), node(3, 10, 3, "how are you")],
        ));

        assert_eq!(
            rendered_texts(&sync.timeline()),
            vec!["hello", "hi yourself", "how are you"]
        );
        assert_eq!(sync.len(), 3);
    }

    #[test]
    fn reapplying_a_page_changes_nothing() {
        let mut sync = MessageSynchronizer::new(MatchupId(Uuid::nil()));
        let window = page(Some("c1"), vec![node(1, 10, 1, "a"), node(2, 10, 2, "b")]);
        sync.apply_history(window.clone());
        let before = sync.timeline();
        sync.apply_live(window);
        assert_eq!(sync.timeline(), before);
    }

    #[test]
    fn ordering_is_timestamp_ascending_with_id_as_tie_break() {
        let mut sync = MessageSynchronizer::new(MatchupId(Uuid::nil()));
        // Same timestamp; the lower id must render first regardless of
        // arrival order.
        sync.apply_history(page(
            None,
            vec![
                node(9, 10, 5, "tie-high"),
                node(3, 10, 5, "tie-low"),
                node(1, 10, 9, "latest"),
                node(2, 10, 1, "earliest"),
            ],
        ));
        assert_eq!(
            rendered_texts(&sync.timeline()),
            vec!["earliest", "tie-low", "tie-high", "latest"]
        );
    }

    #[test]
    fn rendered_output_is_monotonically_non_decreasing() {
        let mut sync = MessageSynchronizer::new(MatchupId(Uuid::nil()));
        sync.apply_history(page(None, vec![node(1, 10, 1, "a")]));
        let first = match sync.timeline() {
            TimelineState::Ready { messages } => messages,
            _ => panic!("ready"),
        };
        sync.apply_live(page(None, vec![node(2, 10, 2, "b")]));
        let second = match sync.timeline() {
            TimelineState::Ready { messages } => messages,
            _ => panic!("ready"),
        };
        assert!(second.len() >= first.len());
        for rendered in &first {
            assert!(second
                .iter()
                .any(|later| later.message.id == rendered.message.id));
        }
    }

    #[test]
    fn run_flags_mark_consecutive_sender_groups() {
        let mut sync = MessageSynchronizer::new(MatchupId(Uuid::nil()));
        sync.apply_history(page(
            None,
            vec![
                node(1, 10, 1, "a1"),
                node(2, 10, 2, "a2"),
                node(3, 11, 3, "b1"),
                node(4, 10, 4, "a3"),
            ],
        ));
        let TimelineState::Ready { messages } = sync.timeline() else {
            panic!("ready");
        };
        let flags: Vec<(bool, bool)> = messages
            .iter()
            .map(|rendered| (rendered.first_of_run, rendered.last_of_run))
            .collect();
        assert_eq!(
            flags,
            vec![(true, false), (false, true), (true, true), (true, true)]
        );
    }

    #[test]
    fn unavailable_is_distinct_from_empty() {
        let mut missing = MessageSynchronizer::new(MatchupId(Uuid::nil()));
        missing.mark_unavailable("matchup not found");
        assert_eq!(
            missing.timeline(),
            TimelineState::Unavailable {
                reason: "matchup not found".into()
            }
        );

        let mut empty = MessageSynchronizer::new(MatchupId(Uuid::nil()));
        empty.apply_history(page(None, Vec::new()));
        assert_eq!(
            empty.timeline(),
            TimelineState::Ready {
                messages: Vec::new()
            }
        );
    }

    #[test]
    fn a_loaded_timeline_never_regresses_to_unavailable() {
        let mut sync = MessageSynchronizer::new(MatchupId(Uuid::nil()));
        sync.apply_history(page(None, vec![node(1, 10, 1, "a")]));
        sync.mark_unavailable("transient refresh failure");
        assert!(matches!(sync.timeline(), TimelineState::Ready { .. }));
    }

    #[test]
    fn the_resume_cursor_tracks_the_latest_page_that_carried_one() {
        let mut sync = MessageSynchronizer::new(MatchupId(Uuid::nil()));
        assert!(sync.resume_cursor().is_none());

        sync.apply_history(page(Some("c1"), vec![node(1, 10, 1, "a")]));
        assert_eq!(sync.resume_cursor(), Some(&Cursor("c1".into())));

        sync.apply_live(page(Some("c2"), vec![node(2, 10, 2, "b")]));
        assert_eq!(sync.resume_cursor(), Some(&Cursor("c2".into())));

        sync.apply_live(page(None, vec![node(3, 10, 3, "c")]));
        assert_eq!(sync.resume_cursor(), Some(&Cursor("c2".into())));
    }
}
