//! Stream consumer: drains a session into a sink.

use crate::coordinator::Session;
use crate::report::{Event, Reporter};
use crate::sink::Sink;
use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Messages written to the sink.
    pub rendered: u64,
    /// Messages still queued after the max count was reached.
    pub discarded: u64,
}

/// Renders messages until the output queue closes.
///
/// With `max_messages`, the shutdown signal fires as soon as that many have
/// been rendered; the loop then keeps draining without rendering until the
/// queue closes, so returning implies every partition reader was released.
/// A sink error fires the shutdown signal before it is returned.
pub async fn drain<S>(
    session: &mut Session,
    max_messages: Option<u64>,
    sink: &mut S,
    reporter: &dyn Reporter,
) -> Result<DrainStats>
where
    S: Sink + ?Sized,
{
    let mut stats = DrainStats::default();
    let mut limit_hit = false;

    if max_messages == Some(0) {
        limit_hit = true;
        session.shutdown().trigger();
    }

    while let Some(message) = session.recv().await {
        if limit_hit {
            stats.discarded += 1;
            continue;
        }

        if let Err(err) = sink.write(&message) {
            session.shutdown().trigger();
            return Err(err);
        }
        stats.rendered += 1;

        if max_messages == Some(stats.rendered) {
            limit_hit = true;
            reporter.report(Event::MaxReached {
                count: stats.rendered,
            });
            session.shutdown().trigger();
        }
    }

    sink.flush()?;
    Ok(stats)
}
