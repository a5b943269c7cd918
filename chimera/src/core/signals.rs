//! In-band control markers the model embeds in its free text.

/// The agent declares the whole checklist finished.
pub const COMPLETE_MARKER: &str = "<ralph>COMPLETE</ralph>";
/// The agent declares it cannot make further progress.
pub const GUTTER_MARKER: &str = "<ralph>GUTTER</ralph>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Complete,
    Gutter,
}

/// Detect a control marker anywhere in `text`.
///
/// Gutter wins when both are present: a run that claims completion while also
/// declaring itself stuck is not trusted as done.
pub fn detect_signal(text: &str) -> Option<Signal> {
    if text.contains(GUTTER_MARKER) {
        Some(Signal::Gutter)
    } else if text.contains(COMPLETE_MARKER) {
        Some(Signal::Complete)
    } else {
        None
    }
}
