//! Output delivery collaborator: speech synthesis or displayed text.

use crate::turn::error::OutputError;

pub trait OutputDelivery: Send {
    /// Start delivering `text`. Completion is reported back to the
    /// controller as an output-complete event, unless
    /// [`completes_immediately`](Self::completes_immediately) is true.
    fn deliver(&mut self, text: &str) -> Result<(), OutputError>;

    /// Abort any output in progress.
    fn cancel(&mut self);

    /// Text output has nothing to wait for.
    fn completes_immediately(&self) -> bool {
        false
    }
}
