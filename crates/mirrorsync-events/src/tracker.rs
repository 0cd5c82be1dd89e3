//! Error-tracking consumer
//!
//! Watches the event stream and flips the session's shared [`ErrorFlag`]
//! the first time an ERROR- or CRITICAL-level log event passes by. This
//! is how `has_errors` stays truthful even when every operation reports
//! `Success`: recoverable errors are logged, not raised, and this
//! consumer is the only component that turns them into session state.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mirrorsync_core::domain::event::Event;
use mirrorsync_core::domain::session::ErrorFlag;

use crate::bus::Subscription;

/// Spawn the error tracker on its own task.
///
/// The task ends when the bus closes or `cancel` fires; pending events
/// are drained first so a final burst of errors is not lost.
pub fn spawn_error_tracker(
    mut events: Subscription,
    flag: ErrorFlag,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let observe = |event: &Event, flag: &ErrorFlag| {
            if let Event::Log(log) = event {
                if log.level.is_error() {
                    flag.set();
                }
            }
        };

        loop {
            tokio::select! {
                maybe = events.next() => match maybe {
                    Some(event) => observe(&event, &flag),
                    None => break,
                },
                () = cancel.cancelled() => break,
            }
        }
        while let Some(event) = events.try_next() {
            observe(&event, &flag);
        }
    })
}
