//! The per-thread-class channel context: tag allocation, the pending-frame
//! FIFO, and the re-entrant wait loop that keeps both endpoints responsive
//! while a request is in flight.
//!
//! Each endpoint owns two of these, one for the main thread class and one for
//! the realtime thread class. They never share a socket, mutex, or tag space.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::time::Duration;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use super::channel::BridgeChannel;
use super::frame::{Cmd, Frame};
use super::{BridgeError, BridgeResult};

/// Direction-aware frame handling, implemented by each endpoint. A context
/// cannot know on its own whether a frame is a response to a local request or
/// a call initiated by the peer; the endpoint tells it.
pub trait Endpoint {
    /// Whether a frame with this command is a call initiated by the peer, as
    /// opposed to a response to one of our own requests.
    fn is_peer_call(&self, cmd: Cmd) -> bool;

    /// Serve a peer-initiated call that arrived on `ctx`. Called inline from
    /// [`ChannelContext::wait`] so the peer can make progress while we are
    /// blocked on a response, and from the idle serve loops.
    fn dispatch_call(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()>;

    /// Apply an unsolicited one-way message (tag 0).
    fn handle_oneway(&self, ctx: &ChannelContext, frame: &Frame) -> BridgeResult<()>;
}

struct ContextState {
    next_tag: u32,
    /// Frames read from the channel that did not match the tag the current
    /// waiter was blocking on; they await their own waiter.
    pending: VecDeque<Frame>,
}

/// Holds a context across a full request/response round trip; see
/// [`ChannelContext::lock`].
pub struct ContextGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<ContextState>>,
}

/// A single channel plus its multiplexer state. The mutex is re-entrant
/// because a callback dispatched inside [`wait`](Self::wait) may issue
/// further requests on the same context.
pub struct ChannelContext {
    /// Which thread class this context serves, for diagnostics.
    name: &'static str,
    channel: BridgeChannel,
    state: ReentrantMutex<RefCell<ContextState>>,
}

impl ChannelContext {
    /// Wrap `channel`. `first_tag` picks this side's tag parity: requests
    /// advance by 2 from it, leaving the other parity (and tag 0) to the
    /// peer's requests and unsolicited messages.
    pub fn new(name: &'static str, channel: BridgeChannel, first_tag: u32) -> Self {
        Self {
            name,
            channel,
            state: ReentrantMutex::new(RefCell::new(ContextState {
                next_tag: first_tag,
                pending: VecDeque::new(),
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn channel(&self) -> &BridgeChannel {
        &self.channel
    }

    /// Acquire the context for a full request/response round trip. Callers
    /// hold this guard across `send_request` + `wait` so their traffic is
    /// never interleaved with another thread's on the same context.
    pub fn lock(&self) -> ContextGuard<'_> {
        ContextGuard {
            _guard: self.state.lock(),
        }
    }

    /// Like [`lock`](Self::lock), but gives up instead of blocking when
    /// another thread holds the context. Re-entrant acquisition still
    /// succeeds.
    pub fn try_lock(&self) -> Option<ContextGuard<'_>> {
        self.state
            .try_lock()
            .map(|guard| ContextGuard { _guard: guard })
    }

    /// Allocate a tag for `frame` and write it to the channel. Returns the
    /// tag to wait on. Fire-and-forget commands allocate like any other
    /// request and simply never wait.
    pub fn send_request(&self, frame: &mut Frame) -> BridgeResult<u32> {
        let guard = self.state.lock();
        let tag = {
            let mut state = guard.borrow_mut();
            let tag = state.next_tag;
            state.next_tag = state.next_tag.wrapping_add(2);
            tag
        };

        frame.set_tag(tag);
        self.channel.send(frame)?;
        Ok(tag)
    }

    /// Write a response or unsolicited frame as-is.
    pub fn send(&self, frame: &Frame) -> BridgeResult<()> {
        let _guard = self.state.lock();
        self.channel.send(frame)
    }

    /// Block until the response for `tag` arrives, leaving it in `frame`.
    ///
    /// Frames received in the meantime are routed by direction: peer
    /// initiated calls are dispatched inline through `endpoint`, unsolicited
    /// tag-0 messages go to their handler, and responses for other waiters
    /// are parked in the pending FIFO.
    pub fn wait<E: Endpoint>(
        &self,
        tag: u32,
        frame: &mut Frame,
        endpoint: &E,
    ) -> BridgeResult<()> {
        let guard = self.state.lock();

        loop {
            // A previous waiter may already have parked our response
            let parked = {
                let mut state = guard.borrow_mut();
                match state.pending.iter().position(|pending| pending.tag() == tag) {
                    Some(position) => state.pending.remove(position),
                    None => None,
                }
            };
            if let Some(parked) = parked {
                *frame = parked;
                return Ok(());
            }

            self.channel.recv(frame)?;

            if frame.tag() == tag {
                return Ok(());
            }

            let cmd = match frame.cmd() {
                Ok(cmd) => cmd,
                Err(BridgeError::UnknownCmd(raw)) => {
                    bridge_error!(
                        "[{}] dropping frame with unknown command {} (tag {})",
                        self.name,
                        raw,
                        frame.tag()
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };

            if frame.tag() == 0 {
                endpoint.handle_oneway(self, frame)?;
            } else if endpoint.is_peer_call(cmd) {
                endpoint.dispatch_call(self, frame)?;
            } else {
                // A response for a tag nobody is draining right now; it will
                // be found by its own waiter's pending scan.
                let parked = mem::replace(frame, Frame::new());
                guard.borrow_mut().pending.push_back(parked);
            }
        }
    }

    /// One pass of the endpoint idle loop: wait up to `timeout` for a frame
    /// and dispatch it. Returns false when the poll timed out, so the caller
    /// can run its cooperative stop check.
    pub fn serve_one<E: Endpoint>(
        &self,
        endpoint: &E,
        frame: &mut Frame,
        timeout: Duration,
    ) -> BridgeResult<bool> {
        if !self.channel.poll_readable(timeout)? {
            return Ok(false);
        }

        let guard = self.state.lock();
        self.channel.recv(frame)?;

        let cmd = match frame.cmd() {
            Ok(cmd) => cmd,
            Err(BridgeError::UnknownCmd(raw)) => {
                // Answer with an empty default so a peer waiting on this tag
                // does not stall forever.
                bridge_error!(
                    "[{}] unknown command {} (tag {}), answering with an empty response",
                    self.name,
                    raw,
                    frame.tag()
                );
                if frame.tag() != 0 {
                    frame.set_payload_len(0);
                    self.channel.send(frame)?;
                }
                return Ok(true);
            }
            Err(err) => return Err(err),
        };

        if frame.tag() == 0 {
            endpoint.handle_oneway(self, frame)?;
        } else if endpoint.is_peer_call(cmd) {
            endpoint.dispatch_call(self, frame)?;
        } else {
            bridge_debug_assert_failure!(
                "[{}] response frame with tag {} arrived with no waiter",
                self.name,
                frame.tag()
            );
            let parked = mem::replace(frame, Frame::new());
            guard.borrow_mut().pending.push_back(parked);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::BridgeChannel;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Endpoint that treats `AudioMasterCallback` frames as peer calls and
    /// answers them with `value + 1`, recording how many it served.
    struct CountingEndpoint {
        served: AtomicU32,
        oneways: AtomicU32,
    }

    impl CountingEndpoint {
        fn new() -> Self {
            Self {
                served: AtomicU32::new(0),
                oneways: AtomicU32::new(0),
            }
        }
    }

    impl Endpoint for CountingEndpoint {
        fn is_peer_call(&self, cmd: Cmd) -> bool {
            cmd == Cmd::AudioMasterCallback
        }

        fn dispatch_call(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
            self.served.fetch_add(1, Ordering::SeqCst);
            frame.call_mut().value += 1;
            ctx.send(frame)
        }

        fn handle_oneway(&self, _ctx: &ChannelContext, _frame: &Frame) -> BridgeResult<()> {
            self.oneways.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context_pair() -> (ChannelContext, BridgeChannel) {
        let (ours, theirs) = BridgeChannel::pair().unwrap();
        (ChannelContext::new("test", ours, 2), theirs)
    }

    #[test]
    fn tags_strictly_increase_by_two() {
        let (ctx, peer) = context_pair();
        let mut frame = Frame::new();

        let mut last = None;
        for _ in 0..4 {
            let mut request = Frame::request(Cmd::EffectDispatch);
            let tag = ctx.send_request(&mut request).unwrap();
            if let Some(last) = last {
                assert_eq!(tag, last + 2);
            }
            last = Some(tag);
            peer.recv(&mut frame).unwrap();
            assert_eq!(frame.tag(), tag);
        }
    }

    #[test]
    fn wait_returns_matching_response() {
        let (ctx, peer) = context_pair();
        let endpoint = CountingEndpoint::new();

        let mut request = Frame::request(Cmd::GetParameter);
        request.param_mut().index = 3;
        let tag = ctx.send_request(&mut request).unwrap();

        let mut response = Frame::request(Cmd::GetParameter);
        response.set_tag(tag);
        response.param_mut().value = 0.375;
        peer.send(&response).unwrap();

        let mut received = Frame::new();
        ctx.wait(tag, &mut received, &endpoint).unwrap();
        assert_eq!(received.param().value, 0.375);
        assert_eq!(endpoint.served.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn peer_call_is_dispatched_inline_before_the_response() {
        let (ctx, peer) = context_pair();
        let endpoint = CountingEndpoint::new();

        let mut request = Frame::request(Cmd::EffectDispatch);
        let tag = ctx.send_request(&mut request).unwrap();

        // Peer initiates a callback of its own before answering our request
        let mut callback = Frame::request(Cmd::AudioMasterCallback);
        callback.set_tag(1);
        callback.call_mut().value = 41;
        peer.send(&callback).unwrap();

        let mut response = Frame::request(Cmd::EffectDispatch);
        response.set_tag(tag);
        peer.send(&response).unwrap();

        let mut received = Frame::new();
        ctx.wait(tag, &mut received, &endpoint).unwrap();
        assert_eq!(received.tag(), tag);
        assert_eq!(endpoint.served.load(Ordering::SeqCst), 1);

        // The inline dispatch answered the peer's callback with value + 1
        let mut answer = Frame::new();
        peer.recv(&mut answer).unwrap();
        assert_eq!(answer.tag(), 1);
        assert_eq!(answer.call().value, 42);
    }

    #[test]
    fn out_of_order_responses_park_in_pending() {
        let (ctx, peer) = context_pair();
        let endpoint = CountingEndpoint::new();

        let mut first = Frame::request(Cmd::EffectDispatch);
        let first_tag = ctx.send_request(&mut first).unwrap();
        let mut second = Frame::request(Cmd::EffectDispatch);
        let second_tag = ctx.send_request(&mut second).unwrap();

        // Answer in reverse order
        let mut response = Frame::request(Cmd::EffectDispatch);
        response.set_tag(second_tag);
        response.call_mut().value = 2;
        peer.send(&response).unwrap();
        response.set_tag(first_tag);
        response.call_mut().value = 1;
        peer.send(&response).unwrap();

        let mut received = Frame::new();
        ctx.wait(first_tag, &mut received, &endpoint).unwrap();
        assert_eq!(received.call().value, 1);

        // The second response was parked and is found without reading the
        // channel again
        ctx.wait(second_tag, &mut received, &endpoint).unwrap();
        assert_eq!(received.call().value, 2);
    }

    #[test]
    fn oneway_messages_reach_their_handler() {
        let (ctx, peer) = context_pair();
        let endpoint = CountingEndpoint::new();

        let mut request = Frame::request(Cmd::EffectDispatch);
        let tag = ctx.send_request(&mut request).unwrap();

        let mut push = Frame::request(Cmd::PluginData);
        push.set_plugin_data(&Default::default());
        peer.send(&push).unwrap();

        let mut response = Frame::request(Cmd::EffectDispatch);
        response.set_tag(tag);
        peer.send(&response).unwrap();

        let mut received = Frame::new();
        ctx.wait(tag, &mut received, &endpoint).unwrap();
        assert_eq!(endpoint.oneways.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn serve_one_times_out_quietly() {
        let (ctx, _peer) = context_pair();
        let endpoint = CountingEndpoint::new();
        let mut frame = Frame::new();

        assert!(!ctx
            .serve_one(&endpoint, &mut frame, Duration::from_millis(10))
            .unwrap());
        assert_eq!(endpoint.served.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn serve_one_reports_closure() {
        let (ctx, peer) = context_pair();
        let endpoint = CountingEndpoint::new();
        let mut frame = Frame::new();

        drop(peer);
        assert!(matches!(
            ctx.serve_one(&endpoint, &mut frame, Duration::from_millis(1000)),
            Err(BridgeError::Closed)
        ));
    }
}
