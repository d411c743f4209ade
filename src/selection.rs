use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::constants::HANDLE_TOLERANCE_PX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Drag {
    Start,
    End,
    /// Whole range; `offset` is the grab point's distance from the left edge.
    Range { offset: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Idle,
    OneHandle,
    TwoHandles,
}

/// Wall-clock span the horizontal axis of the image represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeDomain {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeDomain {
    /// `None` unless `start` is strictly before `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    fn span_ms(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOutput {
    pub pixels: (f64, f64),
    pub percent: (f64, f64),
    pub time: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl fmt::Display for SelectionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pixels: [{}, {}] | %: [{:.1}%, {:.1}%]",
            self.pixels.0.round(),
            self.pixels.1.round(),
            self.percent.0,
            self.percent.1
        )?;
        if let Some((t0, t1)) = self.time {
            write!(
                f,
                " | Time: [{} .. {}]",
                t0.to_rfc3339_opts(SecondsFormat::Millis, true),
                t1.to_rfc3339_opts(SecondsFormat::Millis, true)
            )?;
        }
        Ok(())
    }
}

/// Drag-to-select range over an image `width` pixels wide.
#[derive(Debug, Clone)]
pub struct Selection {
    width: f64,
    tolerance: f64,
    domain: Option<TimeDomain>,
    start: Option<f64>,
    end: Option<f64>,
    drag: Option<Drag>,
}

impl Selection {
    pub fn new(width: f64) -> Self {
        Self {
            width: width.max(1.0),
            tolerance: HANDLE_TOLERANCE_PX,
            domain: None,
            start: None,
            end: None,
            drag: None,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.max(0.0);
        self
    }

    pub fn with_domain(mut self, domain: Option<TimeDomain>) -> Self {
        self.domain = domain;
        self
    }

    pub fn set_domain(&mut self, domain: Option<TimeDomain>) {
        self.domain = domain;
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn start(&self) -> Option<f64> {
        self.start
    }

    pub fn end(&self) -> Option<f64> {
        self.end
    }

    pub fn dragging(&self) -> Option<Drag> {
        self.drag
    }

    pub fn state(&self) -> SelectionState {
        match (self.start, self.end) {
            (None, None) => SelectionState::Idle,
            (Some(_), Some(_)) => SelectionState::TwoHandles,
            _ => SelectionState::OneHandle,
        }
    }

    /// The image was resized; keep handles inside it.
    pub fn resize(&mut self, width: f64) {
        self.width = width.max(1.0);
        self.start = self.start.map(|x| self.clamp(x));
        self.end = self.end.map(|x| self.clamp(x));
    }

    fn clamp(&self, x: f64) -> f64 {
        x.clamp(0.0, self.width)
    }

    fn hit(&self, x: f64, handle: Option<f64>) -> bool {
        handle.is_some_and(|h| (x - h).abs() <= self.tolerance)
    }

    pub fn pointer_down(&mut self, x: f64) {
        let x = self.clamp(x);

        if self.hit(x, self.start) {
            self.drag = Some(Drag::Start);
            return;
        }
        if self.hit(x, self.end) {
            self.drag = Some(Drag::End);
            return;
        }

        match (self.start, self.end) {
            (Some(s), Some(e)) => {
                let (a, b) = (s.min(e), s.max(e));
                if (a..=b).contains(&x) {
                    self.drag = Some(Drag::Range { offset: x - a });
                } else {
                    self.start = Some(x);
                    self.end = None;
                    self.drag = Some(Drag::End);
                }
            }
            (None, None) => {
                self.start = Some(x);
                self.drag = Some(Drag::End);
            }
            (None, Some(_)) => {
                self.start = Some(x);
                self.drag = Some(Drag::Start);
            }
            (Some(_), None) => {
                self.end = Some(x);
                self.drag = Some(Drag::End);
            }
        }
    }

    pub fn pointer_move(&mut self, x: f64) {
        match self.drag {
            Some(Drag::Start) => self.start = Some(self.clamp(x)),
            Some(Drag::End) => self.end = Some(self.clamp(x)),
            Some(Drag::Range { offset }) => {
                let (Some(s), Some(e)) = (self.start, self.end) else {
                    return;
                };
                let span = (e - s).abs();
                let a = (x - offset).max(0.0).min(self.width - span);
                let b = a + span;
                if s <= e {
                    self.start = Some(a);
                    self.end = Some(b);
                } else {
                    self.end = Some(a);
                    self.start = Some(b);
                }
            }
            None => {}
        }
    }

    pub fn pointer_up(&mut self) {
        self.drag = None;
    }

    pub fn clear(&mut self) {
        self.start = None;
        self.end = None;
        self.drag = None;
    }

    /// Shaded span between whichever handles exist, normalized to (min, max).
    pub fn span(&self) -> Option<(f64, f64)> {
        let a = self.start.or(self.end)?;
        let b = self.end.or(self.start)?;
        Some((a.min(b), a.max(b)))
    }

    pub fn px_to_domain(&self, x: f64) -> Option<DateTime<Utc>> {
        let domain = self.domain?;
        let ratio = (x / self.width).clamp(0.0, 1.0);
        let offset = Duration::milliseconds((ratio * domain.span_ms()).round() as i64);
        Some(domain.start + offset)
    }

    pub fn domain_to_px(&self, t: DateTime<Utc>) -> Option<f64> {
        let domain = self.domain?;
        let ratio = (t - domain.start).num_milliseconds() as f64 / domain.span_ms();
        Some(ratio * self.width)
    }

    /// `None` until both handles are placed.
    pub fn output(&self) -> Option<SelectionOutput> {
        let (s, e) = (self.start?, self.end?);
        let (a, b) = (s.min(e), s.max(e));
        let time = self.px_to_domain(a).zip(self.px_to_domain(b));
        Some(SelectionOutput {
            pixels: (a, b),
            percent: (a / self.width * 100.0, b / self.width * 100.0),
            time,
        })
    }

    pub fn describe(&self) -> String {
        self.output()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "No selection".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn two_handles(start: f64, end: f64) -> Selection {
        let mut sel = Selection::new(400.0);
        sel.pointer_down(start);
        sel.pointer_move(end);
        sel.pointer_up();
        sel
    }

    #[test]
    fn test_press_drag_release_creates_range() {
        let mut sel = Selection::new(400.0);
        assert_eq!(sel.state(), SelectionState::Idle);
        sel.pointer_down(100.0);
        assert_eq!(sel.state(), SelectionState::OneHandle);
        assert_eq!(sel.dragging(), Some(Drag::End));
        sel.pointer_move(250.0);
        sel.pointer_up();
        assert_eq!(sel.state(), SelectionState::TwoHandles);
        assert_eq!(sel.dragging(), None);
        assert_eq!(sel.output().unwrap().pixels, (100.0, 250.0));
    }

    #[test]
    fn test_drag_start_handle_only_moves_start() {
        let mut sel = two_handles(100.0, 250.0);
        sel.pointer_down(104.0);
        assert_eq!(sel.dragging(), Some(Drag::Start));
        sel.pointer_move(300.0);
        sel.pointer_move(320.0);
        sel.pointer_up();
        assert_eq!(sel.start(), Some(320.0));
        assert_eq!(sel.end(), Some(250.0));
        // Reported normalized even though start > end now.
        assert_eq!(sel.output().unwrap().pixels, (250.0, 320.0));
    }

    #[test]
    fn test_range_drag_preserves_width_and_clamps() {
        let mut sel = two_handles(100.0, 200.0);
        sel.pointer_down(150.0);
        assert_eq!(sel.dragging(), Some(Drag::Range { offset: 50.0 }));
        sel.pointer_move(180.0);
        assert_eq!((sel.start(), sel.end()), (Some(130.0), Some(230.0)));

        sel.pointer_move(1000.0);
        assert_eq!((sel.start(), sel.end()), (Some(300.0), Some(400.0)));

        sel.pointer_move(-500.0);
        assert_eq!((sel.start(), sel.end()), (Some(0.0), Some(100.0)));
    }

    #[test]
    fn test_range_drag_keeps_orientation() {
        let mut sel = two_handles(200.0, 100.0);
        sel.pointer_down(150.0);
        sel.pointer_move(160.0);
        assert_eq!((sel.start(), sel.end()), (Some(210.0), Some(110.0)));
    }

    #[test]
    fn test_press_outside_range_starts_new_one() {
        let mut sel = two_handles(100.0, 200.0);
        sel.pointer_down(300.0);
        assert_eq!(sel.start(), Some(300.0));
        assert_eq!(sel.end(), None);
        assert_eq!(sel.dragging(), Some(Drag::End));
        assert_eq!(sel.describe(), "No selection");
    }

    #[test]
    fn test_second_click_places_missing_handle() {
        let mut sel = Selection::new(400.0);
        sel.pointer_down(50.0);
        sel.pointer_up();
        sel.pointer_down(120.0);
        sel.pointer_up();
        assert_eq!((sel.start(), sel.end()), (Some(50.0), Some(120.0)));
    }

    #[test]
    fn test_moves_are_clamped_to_width() {
        let mut sel = Selection::new(400.0);
        sel.pointer_down(-20.0);
        assert_eq!(sel.start(), Some(0.0));
        sel.pointer_move(900.0);
        assert_eq!(sel.end(), Some(400.0));
    }

    #[test]
    fn test_clear_returns_to_idle() {
        let mut sel = two_handles(10.0, 20.0);
        sel.clear();
        assert_eq!(sel.state(), SelectionState::Idle);
        assert_eq!(sel.span(), None);
    }

    #[test]
    fn test_output_with_and_without_domain() {
        let sel = two_handles(100.0, 300.0);
        assert_eq!(sel.describe(), "Pixels: [100, 300] | %: [25.0%, 75.0%]");

        let t0 = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 9, 2, 0, 0, 0).unwrap();
        let sel = sel.with_domain(TimeDomain::new(t0, t1));
        let out = sel.output().unwrap();
        assert_eq!(
            out.time,
            Some((
                Utc.with_ymd_and_hms(2025, 9, 1, 6, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 9, 1, 18, 0, 0).unwrap()
            ))
        );
        assert!(sel.describe().ends_with(
            "| Time: [2025-09-01T06:00:00.000Z .. 2025-09-01T18:00:00.000Z]"
        ));
        assert_eq!(sel.domain_to_px(t1), Some(400.0));
    }

    #[test]
    fn test_inverted_domain_is_rejected() {
        let t0 = Utc.with_ymd_and_hms(2025, 9, 2, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();
        assert_eq!(TimeDomain::new(t0, t1), None);
    }

    #[test]
    fn test_resize_reclamps_handles() {
        let mut sel = two_handles(100.0, 350.0);
        sel.resize(200.0);
        assert_eq!(sel.span(), Some((100.0, 200.0)));
    }
}
