//! Load progress observation.

/// Observer notified synchronously while a model is being loaded.
///
/// `fraction` is in `[0, 1]`, never decreases between calls of one load, and
/// the final call reports exactly `1.0`.
pub trait LoadProgress: Send + Sync {
    fn on_progress(&self, fraction: f32);
}

impl<F> LoadProgress for F
where
    F: Fn(f32) + Send + Sync,
{
    fn on_progress(&self, fraction: f32) {
        self(fraction)
    }
}

/// Observer that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl LoadProgress for NoProgress {
    fn on_progress(&self, _fraction: f32) {}
}
