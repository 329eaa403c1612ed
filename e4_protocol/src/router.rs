use crate::config::StreamBuffer;
use crate::protocol::StreamSample;
use crate::stream::StreamId;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strum::IntoEnumIterator;

// Log every this many drops after the first
const DROP_LOG_INTERVAL: u64 = 1000;

/// Build one delivery channel per stream
pub(crate) fn stream_channels(buffer: StreamBuffer) -> (StreamRouter, StreamReceivers) {
    let mut routes = Vec::new();
    let mut outlets = Vec::new();

    for stream in StreamId::iter() {
        let (sender, receiver) = match buffer {
            StreamBuffer::Unbounded => unbounded(),
            StreamBuffer::Bounded(capacity) => bounded(capacity.max(1)),
        };
        let dropped = Arc::new(AtomicU64::new(0));

        routes.push(Route {
            stream,
            sender,
            evictor: receiver.clone(),
            dropped: Arc::clone(&dropped),
        });
        outlets.push(Outlet { receiver, dropped });
    }

    (StreamRouter { routes }, StreamReceivers { outlets })
}

struct Route {
    stream: StreamId,
    sender: Sender<StreamSample>,
    // Lets the router make room in a full bounded channel
    evictor: Receiver<StreamSample>,
    dropped: Arc<AtomicU64>,
}

/// Receive-loop side: hands samples to their stream's channel without blocking.
///
/// Dropping the router disconnects every stream channel.
pub(crate) struct StreamRouter {
    // Indexed by StreamId discriminant
    routes: Vec<Route>,
}

impl StreamRouter {
    pub(crate) fn deliver(&self, sample: StreamSample) {
        let route = &self.routes[sample.stream as usize];
        let mut sample = sample;

        loop {
            match route.sender.try_send(sample) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if route.evictor.try_recv().is_ok() {
                        let dropped = route.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped == 1 || dropped % DROP_LOG_INTERVAL == 0 {
                            warn!(
                                "⚠️ {} channel full, dropped {} oldest samples so far",
                                route.stream, dropped
                            );
                        }
                    }
                    sample = rejected;
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("No receivers left for {}", route.stream);
                    return;
                }
            }
        }
    }
}

struct Outlet {
    receiver: Receiver<StreamSample>,
    dropped: Arc<AtomicU64>,
}

/// Client side: consumer handles for every stream
pub(crate) struct StreamReceivers {
    outlets: Vec<Outlet>,
}

impl StreamReceivers {
    pub(crate) fn receiver(&self, stream: StreamId) -> Receiver<StreamSample> {
        self.outlets[stream as usize].receiver.clone()
    }

    pub(crate) fn dropped(&self, stream: StreamId) -> u64 {
        self.outlets[stream as usize].dropped.load(Ordering::Relaxed)
    }

    /// Discard samples queued for `stream`, returning how many were dropped
    pub(crate) fn clear(&self, stream: StreamId) -> usize {
        let discarded = self.outlets[stream as usize].receiver.try_iter().count();
        if discarded > 0 {
            debug!("Discarded {} queued {} samples", discarded, stream);
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::TryRecvError;

    fn sample(stream: StreamId, timestamp: f64) -> StreamSample {
        StreamSample {
            stream,
            timestamp,
            values: vec![timestamp],
        }
    }

    #[test]
    fn test_samples_reach_their_own_stream() {
        let (router, receivers) = stream_channels(StreamBuffer::default());
        router.deliver(sample(StreamId::Temp, 1.0));
        router.deliver(sample(StreamId::Hr, 2.0));
        router.deliver(sample(StreamId::Temp, 3.0));

        let temp = receivers.receiver(StreamId::Temp);
        assert_eq!(temp.try_recv().unwrap().timestamp, 1.0);
        assert_eq!(temp.try_recv().unwrap().timestamp, 3.0);
        assert_eq!(receivers.receiver(StreamId::Hr).try_recv().unwrap().timestamp, 2.0);
        assert!(receivers.receiver(StreamId::Ibi).try_recv().is_err());
    }

    #[test]
    fn test_bounded_channel_drops_oldest() {
        let (router, receivers) = stream_channels(StreamBuffer::Bounded(3));
        for i in 0..5 {
            router.deliver(sample(StreamId::Bvp, i as f64));
        }

        let bvp = receivers.receiver(StreamId::Bvp);
        let kept: Vec<f64> = bvp.try_iter().map(|s| s.timestamp).collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
        assert_eq!(receivers.dropped(StreamId::Bvp), 2);
        assert_eq!(receivers.dropped(StreamId::Acc), 0);
    }

    #[test]
    fn test_unbounded_channel_keeps_everything() {
        let (router, receivers) = stream_channels(StreamBuffer::Unbounded);
        for i in 0..10_000 {
            router.deliver(sample(StreamId::Acc, i as f64));
        }

        assert_eq!(receivers.receiver(StreamId::Acc).len(), 10_000);
        assert_eq!(receivers.dropped(StreamId::Acc), 0);
    }

    #[test]
    fn test_clear_empties_only_that_stream() {
        let (router, receivers) = stream_channels(StreamBuffer::default());
        let temp = receivers.receiver(StreamId::Temp);
        for i in 0..3 {
            router.deliver(sample(StreamId::Temp, i as f64));
        }
        router.deliver(sample(StreamId::Gsr, 1.0));

        assert_eq!(receivers.clear(StreamId::Temp), 3);
        assert!(temp.try_recv().is_err());
        assert_eq!(receivers.receiver(StreamId::Gsr).len(), 1);

        router.deliver(sample(StreamId::Temp, 4.0));
        assert_eq!(temp.try_recv().unwrap().timestamp, 4.0);
    }

    #[test]
    fn test_dropping_router_disconnects_consumers() {
        let (router, receivers) = stream_channels(StreamBuffer::default());
        let gsr = receivers.receiver(StreamId::Gsr);
        router.deliver(sample(StreamId::Gsr, 1.0));
        drop(router);

        assert!(gsr.recv().is_ok());
        assert_eq!(gsr.try_recv(), Err(TryRecvError::Disconnected));
    }
}
