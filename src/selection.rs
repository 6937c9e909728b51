use crate::capture::CaptureRect;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvent {
    Press { x: i32, y: i32 },
    Move { x: i32, y: i32 },
    Release { x: i32, y: i32 },
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Idle,
    Dragging { start: (i32, i32), current: (i32, i32) },
    Committed(CaptureRect),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionUpdate {
    Progress(CaptureRect),
    Committed(CaptureRect),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RegionSelector {
    state: SelectionState,
}

impl Default for RegionSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionSelector {
    pub fn new() -> Self {
        Self {
            state: SelectionState::Idle,
        }
    }

    pub fn state(&self) -> SelectionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            SelectionState::Committed(_) | SelectionState::Cancelled
        )
    }

    pub fn handle(&mut self, event: PointerEvent) -> Option<SelectionUpdate> {
        if self.is_finished() {
            return None;
        }

        match (self.state, event) {
            (_, PointerEvent::Cancel) => {
                self.state = SelectionState::Cancelled;
                Some(SelectionUpdate::Cancelled)
            }
            // A second press restarts the drag from the new anchor.
            (_, PointerEvent::Press { x, y }) => {
                self.state = SelectionState::Dragging {
                    start: (x, y),
                    current: (x, y),
                };
                Some(SelectionUpdate::Progress(CaptureRect::from_corners(
                    (x, y),
                    (x, y),
                )))
            }
            (SelectionState::Dragging { start, .. }, PointerEvent::Move { x, y }) => {
                self.state = SelectionState::Dragging {
                    start,
                    current: (x, y),
                };
                Some(SelectionUpdate::Progress(CaptureRect::from_corners(
                    start,
                    (x, y),
                )))
            }
            (SelectionState::Dragging { start, .. }, PointerEvent::Release { x, y }) => {
                let rect = CaptureRect::from_corners(start, (x, y));
                if rect.is_empty() {
                    self.state = SelectionState::Cancelled;
                    Some(SelectionUpdate::Cancelled)
                } else {
                    self.state = SelectionState::Committed(rect);
                    Some(SelectionUpdate::Committed(rect))
                }
            }
            (_, PointerEvent::Move { .. } | PointerEvent::Release { .. }) => None,
        }
    }
}

/// `None` when the drag is cancelled or the pointer channel closes first.
pub async fn track_selection<F>(
    mut pointer_rx: mpsc::UnboundedReceiver<PointerEvent>,
    mut on_progress: F,
) -> Option<CaptureRect>
where
    F: FnMut(CaptureRect),
{
    let mut selector = RegionSelector::new();
    while let Some(event) = pointer_rx.recv().await {
        match selector.handle(event) {
            Some(SelectionUpdate::Progress(rect)) => on_progress(rect),
            Some(SelectionUpdate::Committed(rect)) => return Some(rect),
            Some(SelectionUpdate::Cancelled) => return None,
            None => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{PointerEvent, RegionSelector, SelectionState, SelectionUpdate, track_selection};
    use crate::capture::CaptureRect;
    use tokio::sync::mpsc;

    #[test]
    fn press_drag_release_commits_normalized_rect() {
        let mut selector = RegionSelector::new();
        assert_eq!(selector.handle(PointerEvent::Move { x: 1, y: 1 }), None);

        selector.handle(PointerEvent::Press { x: 400, y: 300 });
        assert!(matches!(selector.state(), SelectionState::Dragging { .. }));

        assert_eq!(
            selector.handle(PointerEvent::Move { x: 100, y: 350 }),
            Some(SelectionUpdate::Progress(CaptureRect::from_corners(
                (100, 300),
                (400, 350)
            )))
        );

        let expected = CaptureRect::from_corners((20, 10), (400, 300));
        assert_eq!(
            selector.handle(PointerEvent::Release { x: 20, y: 10 }),
            Some(SelectionUpdate::Committed(expected))
        );
        assert_eq!(selector.state(), SelectionState::Committed(expected));
        assert_eq!(selector.handle(PointerEvent::Cancel), None);
    }

    #[test]
    fn release_without_press_is_ignored() {
        let mut selector = RegionSelector::new();
        assert_eq!(selector.handle(PointerEvent::Release { x: 5, y: 5 }), None);
        assert_eq!(selector.state(), SelectionState::Idle);
    }

    #[test]
    fn click_without_drag_cancels() {
        let mut selector = RegionSelector::new();
        selector.handle(PointerEvent::Press { x: 50, y: 50 });
        assert_eq!(
            selector.handle(PointerEvent::Release { x: 50, y: 80 }),
            Some(SelectionUpdate::Cancelled)
        );
        assert!(selector.is_finished());
    }

    #[tokio::test]
    async fn closing_surface_mid_drag_yields_nothing() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(PointerEvent::Press { x: 0, y: 0 }).expect("send");
        tx.send(PointerEvent::Move { x: 30, y: 40 }).expect("send");
        drop(tx);

        let mut progress = Vec::new();
        let result = track_selection(rx, |rect| progress.push(rect)).await;
        assert_eq!(result, None);
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[1], CaptureRect::from_corners((0, 0), (30, 40)));
    }

    #[tokio::test]
    async fn tracking_returns_committed_rect() {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in [
            PointerEvent::Press { x: 10, y: 10 },
            PointerEvent::Move { x: 60, y: 40 },
            PointerEvent::Release { x: 90, y: 70 },
            PointerEvent::Move { x: 0, y: 0 },
        ] {
            tx.send(event).expect("send");
        }

        let result = track_selection(rx, |_| {}).await;
        assert_eq!(result, Some(CaptureRect::from_corners((10, 10), (90, 70))));
    }
}
