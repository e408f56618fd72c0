use crate::OpenChannel;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Bounded lock-free queue carrying finished work from a completing thread
/// back to the execution context that owns the channel.
///
/// Push happens on the completing side; pop only ever happens from the
/// owning context's `poll`, preserving callback context affinity.
pub struct CompletionQueue<T> {
    queue: ArrayQueue<T>,
}

impl<T> CompletionQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: ArrayQueue::new(capacity),
        })
    }

    pub fn push(&self, item: T) -> Result<(), T> {
        self.queue.push(item)
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Slot key returned by [`IoPoller::attach`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollerSlot(usize);

/// Per-execution-context completion poller.
///
/// Owns the channels attached to this context and drains each of them once
/// per scheduling quantum; completion callbacks run synchronously on the
/// polling context. The poller itself is single-threaded by construction:
/// it is neither `Sync` nor shared.
#[derive(Default)]
pub struct IoPoller {
    channels: Vec<Option<OpenChannel>>,
}

impl IoPoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a channel into this context's poll set.
    pub fn attach(&mut self, channel: OpenChannel) -> PollerSlot {
        for (idx, slot) in self.channels.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(channel);
                return PollerSlot(idx);
            }
        }
        self.channels.push(Some(channel));
        PollerSlot(self.channels.len() - 1)
    }

    /// Remove a channel from the poll set, returning it to the caller.
    pub fn detach(&mut self, slot: PollerSlot) -> Option<OpenChannel> {
        self.channels.get_mut(slot.0).and_then(Option::take)
    }

    pub fn channel_mut(&mut self, slot: PollerSlot) -> Option<&mut OpenChannel> {
        self.channels.get_mut(slot.0).and_then(Option::as_mut)
    }

    /// Drain every attached channel once; returns completions fired.
    pub fn poll_once(&mut self) -> usize {
        let mut fired = 0;
        for slot in self.channels.iter_mut() {
            if let Some(channel) = slot.as_mut() {
                fired += channel.poll();
            }
        }
        fired
    }

    /// Poll until no channel has in-flight work or `budget` iterations pass;
    /// returns total completions fired.
    pub fn drain(&mut self, budget: usize) -> usize {
        let mut fired = 0;
        for _ in 0..budget {
            fired += self.poll_once();
            if self.in_flight() == 0 {
                break;
            }
            std::hint::spin_loop();
        }
        fired
    }

    pub fn in_flight(&self) -> usize {
        self.channels
            .iter()
            .filter_map(Option::as_ref)
            .map(OpenChannel::in_flight)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BlockDevice, DeviceChannel, DeviceGeometry, DeviceRegistry, IoBuffer, IoCapabilities,
        IoRequest, IoResult, IoStatus, SubmitReject,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Accepts everything, completes on the next poll.
    struct EchoDevice {
        name: String,
    }

    impl BlockDevice for EchoDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn product_name(&self) -> &str {
            "Echo disk"
        }

        fn geometry(&self) -> DeviceGeometry {
            DeviceGeometry::new(512, 64)
        }

        fn capabilities(&self) -> IoCapabilities {
            IoCapabilities::READ | IoCapabilities::WRITE | IoCapabilities::FLUSH
        }

        fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
            Ok(Box::new(EchoChannel {
                pending: VecDeque::new(),
            }))
        }
    }

    struct EchoChannel {
        pending: VecDeque<IoRequest>,
    }

    impl DeviceChannel for EchoChannel {
        fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject> {
            self.pending.push_back(request);
            Ok(())
        }

        fn poll(&mut self) -> usize {
            let mut fired = 0;
            while let Some(request) = self.pending.pop_front() {
                request.complete(IoStatus::Ok);
                fired += 1;
            }
            fired
        }

        fn in_flight(&self) -> usize {
            self.pending.len()
        }
    }

    fn echo_channel(registry: &DeviceRegistry, name: &str) -> crate::OpenChannel {
        registry
            .register(Arc::new(EchoDevice { name: name.into() }))
            .unwrap();
        registry.lookup(name).unwrap().open_channel().unwrap()
    }

    #[test]
    fn completion_queue_is_bounded() {
        let queue = CompletionQueue::new(2);
        queue.push(1u32).unwrap();
        queue.push(2u32).unwrap();
        assert_eq!(queue.push(3u32), Err(3u32));
        assert_eq!(queue.pop(), Some(1));
        queue.push(3u32).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drain_fires_callbacks_across_attached_channels() {
        let registry = DeviceRegistry::new();
        let mut poller = IoPoller::new();
        let a = poller.attach(echo_channel(&registry, "echo0"));
        let b = poller.attach(echo_channel(&registry, "echo1"));

        let fired = Arc::new(AtomicUsize::new(0));
        for slot in [a, b] {
            let fired = fired.clone();
            poller
                .channel_mut(slot)
                .unwrap()
                .submit(IoRequest::flush(move |completion| {
                    assert!(completion.status.is_ok());
                    fired.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        assert_eq!(poller.in_flight(), 2);
        assert_eq!(poller.drain(16), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(poller.in_flight(), 0);
    }

    #[test]
    fn slots_are_reused_after_detach() {
        let registry = DeviceRegistry::new();
        let mut poller = IoPoller::new();
        let first = poller.attach(echo_channel(&registry, "echo0"));
        let second = poller.attach(echo_channel(&registry, "echo1"));
        assert_ne!(first, second);

        let detached = poller.detach(first).unwrap();
        assert!(poller.detach(first).is_none());
        drop(detached);

        // The freed slot is handed out again before the vector grows.
        let third = poller.attach(echo_channel(&registry, "echo2"));
        assert_eq!(first, third);
        assert!(poller.channel_mut(second).is_some());
    }

    #[test]
    fn detached_channel_keeps_in_flight_work() {
        let registry = DeviceRegistry::new();
        let mut poller = IoPoller::new();
        let slot = poller.attach(echo_channel(&registry, "echo0"));
        poller
            .channel_mut(slot)
            .unwrap()
            .submit(IoRequest::write(0, 1, IoBuffer::alloc_zeroed(512), |_| {}))
            .unwrap();

        let mut channel = poller.detach(slot).unwrap();
        assert_eq!(poller.in_flight(), 0);
        assert_eq!(channel.in_flight(), 1);
        assert_eq!(channel.poll(), 1);
    }
}
