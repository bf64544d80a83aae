use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Remembers which bookmark was copied last, for a short feedback window.
#[derive(Debug)]
pub struct CopyFeedback {
    window: Duration,
    marked: Mutex<Option<(String, Instant)>>,
}

impl CopyFeedback {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            marked: Mutex::new(None),
        }
    }

    /// Marks `id` as copied, replacing any earlier mark.
    pub fn mark(&self, id: &str) {
        *self.marked.lock() = Some((id.to_string(), Instant::now()));
    }

    pub fn copied_id(&self) -> Option<String> {
        let mut marked = self.marked.lock();
        match marked.as_ref() {
            Some((id, at)) if at.elapsed() < self.window => Some(id.clone()),
            Some(_) => {
                *marked = None;
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_expires_after_window() {
        let feedback = CopyFeedback::new(Duration::from_millis(30));
        assert!(feedback.copied_id().is_none());

        feedback.mark("a");
        assert_eq!(feedback.copied_id().as_deref(), Some("a"));

        std::thread::sleep(Duration::from_millis(60));
        assert!(feedback.copied_id().is_none());
    }

    #[test]
    fn test_new_mark_replaces_old() {
        let feedback = CopyFeedback::new(Duration::from_secs(2));
        feedback.mark("a");
        feedback.mark("b");
        assert_eq!(feedback.copied_id().as_deref(), Some("b"));
    }
}
