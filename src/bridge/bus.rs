//! Fan-out of the single shell byte stream.
//!
//! One producer (the session reader) feeds one broadcast pump. For
//! every chunk the pump, in order: appends to the in-flight command's
//! buffer, offers the chunk to every attached viewer, and feeds the
//! prompt detector. The detector and the registry append share the
//! pump task, so the boundary event is always observed after all of a
//! command's bytes have been appended.
//!
//! Viewers get bounded queues and non-blocking sends: a viewer that
//! cannot keep up accumulates dropped frames and is disconnected once
//! it crosses the lag limit. The producer is never stalled by a slow
//! viewer. Newly attached viewers see bytes from their attach time
//! forward; there is no backfill.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use super::ansi;
use super::filter::ExitMarker;
use super::prompt::PromptDetector;
use super::record::{CommandStatus, InFlightSlot};
use super::registry::CommandRegistry;
use super::types::ServerFrame;

/// Events consumed by the broadcast pump.
#[derive(Debug)]
pub enum BusEvent {
    /// A chunk drained from the shell, in read order.
    Data(Vec<u8>),
    /// Commit a boundary for `command_id` without waiting for the
    /// prompt; sent by the deadline watchdog after the force grace.
    ForceBoundary { command_id: String },
    /// The shell stream ended; tear the session down.
    Eof,
}

struct Viewer {
    tx: mpsc::Sender<ServerFrame>,
    dropped_frames: AtomicU32,
}

/// The dynamically changing set of attached viewers.
pub struct FanoutBus {
    viewers: RwLock<HashMap<u64, Viewer>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    lag_limit: u32,
    /// Trailing bytes of an incomplete UTF-8 sequence, held until the
    /// next chunk completes it. SSH channel reads split multi-byte
    /// characters at arbitrary offsets; decoding each chunk in
    /// isolation would mangle them on the way to the browser.
    decode_carry: StdMutex<Vec<u8>>,
}

impl FanoutBus {
    pub fn new(queue_capacity: usize, lag_limit: u32) -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            lag_limit,
            decode_carry: StdMutex::new(Vec::new()),
        }
    }

    /// Attach a viewer; frames flow from this moment forward.
    pub async fn register(&self) -> (u64, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.viewers.write().await.insert(
            id,
            Viewer {
                tx,
                dropped_frames: AtomicU32::new(0),
            },
        );
        info!("viewer {} attached", id);
        (id, rx)
    }

    /// Detach a viewer. Idempotent: detaching twice is a no-op.
    pub async fn unregister(&self, viewer_id: u64) -> bool {
        let removed = self.viewers.write().await.remove(&viewer_id).is_some();
        if removed {
            info!("viewer {} detached", viewer_id);
        }
        removed
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    /// Offer a raw output chunk to every attached viewer with a
    /// non-blocking send; laggards past the limit are disconnected.
    ///
    /// Chunks are decoded incrementally: a multi-byte character split
    /// across two channel reads is reassembled before it reaches any
    /// viewer, so the browser sees the stream exactly as the shell
    /// produced it. A chunk that ends mid-character may therefore
    /// produce no frame at all until the remainder arrives.
    pub async fn broadcast_chunk(&self, bytes: &[u8]) {
        let data = {
            let mut carry = self.decode_carry.lock().expect("decode carry poisoned");
            take_decoded(&mut carry, bytes)
        };
        if data.is_empty() {
            return;
        }
        self.broadcast_frame(ServerFrame::Output { data }).await;
    }

    /// Tell every viewer whether the session is up.
    pub async fn broadcast_status(&self, connected: bool) {
        self.broadcast_frame(ServerFrame::Status { connected }).await;
    }

    async fn broadcast_frame(&self, frame: ServerFrame) {
        let mut to_remove: Vec<u64> = Vec::new();

        {
            let viewers = self.viewers.read().await;
            for (id, viewer) in viewers.iter() {
                match viewer.tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let dropped = viewer.dropped_frames.fetch_add(1, Ordering::SeqCst) + 1;
                        if dropped > self.lag_limit {
                            warn!("viewer {} lagging ({} dropped frames)", id, dropped);
                            to_remove.push(*id);
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        to_remove.push(*id);
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut viewers = self.viewers.write().await;
            for id in to_remove {
                if viewers.remove(&id).is_some() {
                    info!("viewer {} disconnected by the bus", id);
                }
            }
        }
    }

    /// Drop every viewer; their receivers observe end-of-stream.
    pub async fn close_all(&self) {
        self.viewers.write().await.clear();
        self.decode_carry
            .lock()
            .expect("decode carry poisoned")
            .clear();
    }
}

/// Incremental UTF-8 decoding with a carry for split characters.
///
/// Appends `bytes` to whatever the previous call held back, decodes
/// the longest valid prefix, and retains the 0-3 trailing bytes of an
/// incomplete sequence for the next call. Genuinely invalid bytes in
/// the middle of the stream become replacement characters rather than
/// stalling the decode.
fn take_decoded(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    let buf = std::mem::take(carry);
    let mut out = String::with_capacity(buf.len());
    let mut rest = buf.as_slice();

    loop {
        match std::str::from_utf8(rest) {
            Ok(text) => {
                out.push_str(text);
                break;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(
                    std::str::from_utf8(&rest[..valid]).expect("validated utf-8 prefix"),
                );
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &rest[valid + bad..];
                    }
                    None => {
                        // Incomplete sequence at the end of the chunk;
                        // hold it until the next read completes it.
                        *carry = rest[valid..].to_vec();
                        break;
                    }
                }
            }
        }
    }

    out
}

/// State threaded through the broadcast pump.
pub struct PumpContext {
    pub bus: Arc<FanoutBus>,
    pub registry: Arc<CommandRegistry>,
    pub slot: Arc<InFlightSlot>,
    pub detector: PromptDetector,
    pub grace: Duration,
    pub marker: ExitMarker,
    /// Flipped to false at teardown; agent handlers watch this.
    pub connected_tx: watch::Sender<bool>,
}

/// The broadcast pump: drains producer events until EOF.
///
/// Boundary protocol: when the detector reports the prompt at the end
/// of the window, a grace timer is armed. Any further bytes disarm it
/// and matching resumes; if the grace expires while armed, the
/// boundary is committed and the in-flight command reaches its
/// intended terminal state.
pub async fn run_pump(mut events: mpsc::UnboundedReceiver<BusEvent>, mut ctx: PumpContext) {
    let mut grace_deadline: Option<tokio::time::Instant> = None;

    loop {
        let event = match grace_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    // Quiescent through the whole grace window.
                    grace_deadline = None;
                    commit_boundary(&mut ctx, false).await;
                    continue;
                }
            },
            None => events.recv().await,
        };

        match event {
            Some(BusEvent::Data(bytes)) => {
                if let Some(command_id) = ctx.slot.current_id().await
                    && let Err(e) = ctx.registry.append(&command_id, &bytes).await
                {
                    debug!("append to {} skipped: {}", command_id, e);
                }

                ctx.bus.broadcast_chunk(&bytes).await;

                ctx.detector.feed(&bytes);
                grace_deadline = ctx
                    .detector
                    .is_at_prompt()
                    .then(|| tokio::time::Instant::now() + ctx.grace);
            }
            Some(BusEvent::ForceBoundary { command_id }) => {
                if let Some(inflight) = ctx.slot.take_if(&command_id).await {
                    warn!("forcing boundary for {}", command_id);
                    finalize_entry(&ctx, &inflight.command_id, inflight.intended, true).await;
                    ctx.detector.reset();
                    grace_deadline = None;
                }
            }
            Some(BusEvent::Eof) | None => break,
        }
    }

    teardown(&mut ctx).await;
}

/// Commit the armed boundary: release the slot and finalize the
/// occupant at its intended terminal state.
async fn commit_boundary(ctx: &mut PumpContext, forced: bool) {
    ctx.detector.reset();
    let Some(inflight) = ctx.slot.take().await else {
        return;
    };
    finalize_entry(ctx, &inflight.command_id, inflight.intended, forced).await;
}

/// Extract the exit code, stamp flags, and apply the terminal
/// transition. Runs on the pump task, after every byte of the command
/// has been appended, so the filter always sees a consistent buffer.
async fn finalize_entry(ctx: &PumpContext, command_id: &str, status: CommandStatus, forced: bool) {
    let Some(entry) = ctx.registry.get(command_id) else {
        warn!("boundary for unknown command {}", command_id);
        return;
    };

    let tail = entry.buffer.lock().await.tail_text(2048);
    if let Some(code) = ctx.marker.extract_exit_code(&ansi::clean(&tail)) {
        *entry.exit_code.lock().await = Some(code);
    }
    if forced {
        entry.set_boundary_forced();
    }

    match entry.transition(status).await {
        Ok(()) => info!("command {} -> {}", command_id, status),
        Err(e) => warn!("boundary transition for {} rejected: {}", command_id, e),
    }
}

/// Session loss: interrupt whatever was active, tell the viewers, and
/// close them out.
async fn teardown(ctx: &mut PumpContext) {
    info!("shell stream ended; tearing down session");

    if let Some(inflight) = ctx.slot.take().await {
        finalize_entry(ctx, &inflight.command_id, CommandStatus::Interrupted, false).await;
    }
    ctx.registry.interrupt_all_active().await;

    let _ = ctx.connected_tx.send(false);
    ctx.bus.broadcast_status(false).await;
    ctx.bus.close_all().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::record::wait_for_terminal;

    const SIG: &str = "user@host:~$";

    struct Rig {
        events_tx: mpsc::UnboundedSender<BusEvent>,
        bus: Arc<FanoutBus>,
        registry: Arc<CommandRegistry>,
        slot: Arc<InFlightSlot>,
        connected_rx: watch::Receiver<bool>,
        pump: tokio::task::JoinHandle<()>,
    }

    fn rig() -> Rig {
        rig_with_queue(64, 4)
    }

    fn rig_with_queue(queue_capacity: usize, lag_limit: u32) -> Rig {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(FanoutBus::new(queue_capacity, lag_limit));
        let registry = Arc::new(CommandRegistry::new(50, 1 << 20));
        let slot = Arc::new(InFlightSlot::new());
        let (connected_tx, connected_rx) = watch::channel(true);

        let mut detector = PromptDetector::new();
        detector.set_signature(SIG.to_string());

        let ctx = PumpContext {
            bus: bus.clone(),
            registry: registry.clone(),
            slot: slot.clone(),
            detector,
            grace: Duration::from_millis(20),
            marker: ExitMarker::with_salt("t1"),
            connected_tx,
        };
        let pump = tokio::spawn(run_pump(events_rx, ctx));

        Rig {
            events_tx,
            bus,
            registry,
            slot,
            connected_rx,
            pump,
        }
    }

    async fn start_command(rig: &Rig, id: &str, command: &str) {
        rig.registry
            .create(id.to_string(), command.to_string(), None)
            .unwrap();
        rig.slot.try_claim(id).await.unwrap();
        rig.registry
            .transition(id, CommandStatus::Running)
            .await
            .unwrap();
    }

    mod delivery {
        use super::*;

        #[tokio::test]
        async fn test_bytes_reach_record_and_viewers_in_order() {
            let rig = rig();
            let (_va, mut rx_a) = rig.bus.register().await;
            let (_vb, mut rx_b) = rig.bus.register().await;

            start_command(&rig, "c1", "seq 3").await;
            for chunk in [b"1\n".as_slice(), b"2\n", b"3\n"] {
                rig.events_tx.send(BusEvent::Data(chunk.to_vec())).unwrap();
            }

            let mut seen_a = String::new();
            let mut seen_b = String::new();
            for _ in 0..3 {
                if let Some(ServerFrame::Output { data }) = rx_a.recv().await {
                    seen_a.push_str(&data);
                }
                if let Some(ServerFrame::Output { data }) = rx_b.recv().await {
                    seen_b.push_str(&data);
                }
            }
            assert_eq!(seen_a, "1\n2\n3\n");
            assert_eq!(seen_a, seen_b);

            let entry = rig.registry.get("c1").unwrap();
            let buf = entry.buffer.lock().await;
            assert_eq!(buf.snapshot(), b"1\n2\n3\n");
        }

        #[tokio::test]
        async fn test_bytes_without_in_flight_command_only_reach_viewers() {
            let rig = rig();
            let (_v, mut rx) = rig.bus.register().await;

            rig.events_tx
                .send(BusEvent::Data(b"idle keystroke echo".to_vec()))
                .unwrap();

            match rx.recv().await {
                Some(ServerFrame::Output { data }) => assert_eq!(data, "idle keystroke echo"),
                other => panic!("unexpected frame: {:?}", other),
            }
            assert!(rig.registry.is_empty());
        }

        #[tokio::test]
        async fn test_multibyte_char_split_across_chunks_is_reassembled() {
            let rig = rig();
            let (_v, mut rx) = rig.bus.register().await;

            // "café.txt": the é (0xC3 0xA9) straddles the two reads.
            let bytes = "café.txt".as_bytes();
            rig.events_tx
                .send(BusEvent::Data(bytes[..4].to_vec()))
                .unwrap();
            rig.events_tx
                .send(BusEvent::Data(bytes[4..].to_vec()))
                .unwrap();

            let mut seen = String::new();
            while seen != "café.txt" {
                match tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                {
                    Some(ServerFrame::Output { data }) => seen.push_str(&data),
                    other => panic!("unexpected frame: {:?}", other),
                }
            }
            assert!(!seen.contains('\u{fffd}'));
        }

        #[tokio::test]
        async fn test_four_byte_char_split_byte_by_byte() {
            let rig = rig();
            let (_v, mut rx) = rig.bus.register().await;

            for byte in "🦀".as_bytes() {
                rig.events_tx.send(BusEvent::Data(vec![*byte])).unwrap();
            }
            rig.events_tx.send(BusEvent::Data(b"!".to_vec())).unwrap();

            let mut seen = String::new();
            while seen != "🦀!" {
                match tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                {
                    Some(ServerFrame::Output { data }) => seen.push_str(&data),
                    other => panic!("unexpected frame: {:?}", other),
                }
            }
        }

        #[tokio::test]
        async fn test_late_viewer_sees_only_later_bytes() {
            let rig = rig();
            let (_va, mut rx_a) = rig.bus.register().await;

            rig.events_tx.send(BusEvent::Data(b"early".to_vec())).unwrap();
            // Drain so the next assertion is unambiguous.
            assert!(matches!(rx_a.recv().await, Some(ServerFrame::Output { .. })));

            let (_vb, mut rx_b) = rig.bus.register().await;
            rig.events_tx.send(BusEvent::Data(b"late".to_vec())).unwrap();

            match rx_b.recv().await {
                Some(ServerFrame::Output { data }) => assert_eq!(data, "late"),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    mod boundaries {
        use super::*;

        #[tokio::test]
        async fn test_prompt_plus_quiescence_completes_command() {
            let rig = rig();
            start_command(&rig, "c1", "true").await;

            rig.events_tx
                .send(BusEvent::Data(
                    format!("__RTX_t1__:0__END__\n{} ", SIG).into_bytes(),
                ))
                .unwrap();

            let entry = rig.registry.get("c1").unwrap();
            let mut status_rx = entry.watch_status();
            let status = tokio::time::timeout(
                Duration::from_secs(1),
                wait_for_terminal(&mut status_rx),
            )
            .await
            .unwrap();

            assert_eq!(status, CommandStatus::Completed);
            assert_eq!(*entry.exit_code.lock().await, Some(0));
            assert!(rig.slot.current_id().await.is_none());
        }

        #[tokio::test]
        async fn test_prompt_lookalike_followed_by_output_does_not_complete() {
            let rig = rig();
            start_command(&rig, "c1", "chatty").await;

            // Prompt-looking tail...
            rig.events_tx
                .send(BusEvent::Data(format!("{} ", SIG).into_bytes()))
                .unwrap();
            // ...but more bytes arrive within the grace window.
            tokio::time::sleep(Duration::from_millis(5)).await;
            rig.events_tx
                .send(BusEvent::Data(b"more output\n".to_vec()))
                .unwrap();

            tokio::time::sleep(Duration::from_millis(60)).await;
            let entry = rig.registry.get("c1").unwrap();
            assert_eq!(entry.status(), CommandStatus::Running);

            // Now the real prompt arrives and stays quiet.
            rig.events_tx
                .send(BusEvent::Data(format!("{} ", SIG).into_bytes()))
                .unwrap();
            let mut status_rx = entry.watch_status();
            let status = tokio::time::timeout(
                Duration::from_secs(1),
                wait_for_terminal(&mut status_rx),
            )
            .await
            .unwrap();
            assert_eq!(status, CommandStatus::Completed);
        }

        #[tokio::test]
        async fn test_intended_status_is_committed_at_boundary() {
            let rig = rig();
            start_command(&rig, "c1", "sleep 60").await;
            rig.slot.set_intended("c1", CommandStatus::Cancelled).await;

            rig.events_tx
                .send(BusEvent::Data(format!("^C\n{} ", SIG).into_bytes()))
                .unwrap();

            let entry = rig.registry.get("c1").unwrap();
            let mut status_rx = entry.watch_status();
            let status = tokio::time::timeout(
                Duration::from_secs(1),
                wait_for_terminal(&mut status_rx),
            )
            .await
            .unwrap();
            assert_eq!(status, CommandStatus::Cancelled);
        }

        #[tokio::test]
        async fn test_force_boundary_marks_entry() {
            let rig = rig();
            start_command(&rig, "c1", "stuck").await;
            rig.slot.set_intended("c1", CommandStatus::Timeout).await;

            rig.events_tx
                .send(BusEvent::ForceBoundary {
                    command_id: "c1".to_string(),
                })
                .unwrap();

            let entry = rig.registry.get("c1").unwrap();
            let mut status_rx = entry.watch_status();
            let status = tokio::time::timeout(
                Duration::from_secs(1),
                wait_for_terminal(&mut status_rx),
            )
            .await
            .unwrap();
            assert_eq!(status, CommandStatus::Timeout);
            assert!(entry.was_boundary_forced());
        }

        #[tokio::test]
        async fn test_force_boundary_for_stale_id_is_ignored() {
            let rig = rig();
            start_command(&rig, "c1", "fine").await;

            rig.events_tx
                .send(BusEvent::ForceBoundary {
                    command_id: "other".to_string(),
                })
                .unwrap();

            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(rig.slot.current_id().await.as_deref(), Some("c1"));
        }
    }

    mod decoding {
        use super::*;

        #[test]
        fn test_valid_chunk_passes_through() {
            let mut carry = Vec::new();
            assert_eq!(take_decoded(&mut carry, b"plain ascii"), "plain ascii");
            assert!(carry.is_empty());
        }

        #[test]
        fn test_split_two_byte_char_is_carried() {
            let mut carry = Vec::new();
            let bytes = "café".as_bytes();

            let first = take_decoded(&mut carry, &bytes[..4]);
            assert_eq!(first, "caf");
            assert_eq!(carry, &bytes[3..4]);

            let second = take_decoded(&mut carry, &bytes[4..]);
            assert_eq!(second, "é");
            assert!(carry.is_empty());
        }

        #[test]
        fn test_four_byte_char_fed_one_byte_at_a_time() {
            let mut carry = Vec::new();
            let bytes = "🦀".as_bytes();
            let mut out = String::new();
            for byte in bytes {
                out.push_str(&take_decoded(&mut carry, &[*byte]));
            }
            assert_eq!(out, "🦀");
            assert!(carry.is_empty());
        }

        #[test]
        fn test_invalid_byte_becomes_replacement() {
            let mut carry = Vec::new();
            let out = take_decoded(&mut carry, b"a\xffb");
            assert_eq!(out, "a\u{fffd}b");
            assert!(carry.is_empty());
        }

        #[test]
        fn test_carry_prepends_to_next_chunk() {
            let mut carry = Vec::new();
            // A lone continuation-start byte, then unrelated ASCII that
            // cannot complete it: the held byte resolves to a
            // replacement, the ASCII survives.
            assert_eq!(take_decoded(&mut carry, b"\xc3"), "");
            assert_eq!(take_decoded(&mut carry, b"ok"), "\u{fffd}ok");
            assert!(carry.is_empty());
        }
    }

    mod lag_policy {
        use super::*;

        #[tokio::test]
        async fn test_lagging_viewer_is_disconnected() {
            // Queue of 1, lag limit 2: the fourth undrained frame
            // crosses the limit.
            let rig = rig_with_queue(1, 2);
            let (_viewer, rx) = rig.bus.register().await;
            // Never drain rx.
            let _hold = rx;

            for i in 0..8 {
                rig.events_tx
                    .send(BusEvent::Data(format!("chunk {}\n", i).into_bytes()))
                    .unwrap();
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(rig.bus.viewer_count().await, 0);
        }

        #[tokio::test]
        async fn test_closed_viewer_is_pruned() {
            let rig = rig();
            let (_viewer, rx) = rig.bus.register().await;
            drop(rx);

            rig.events_tx.send(BusEvent::Data(b"x".to_vec())).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(rig.bus.viewer_count().await, 0);
        }

        #[tokio::test]
        async fn test_unregister_is_idempotent() {
            let rig = rig();
            let (id, _rx) = rig.bus.register().await;
            assert!(rig.bus.unregister(id).await);
            assert!(!rig.bus.unregister(id).await);
        }
    }

    mod teardown {
        use super::*;

        #[tokio::test]
        async fn test_eof_interrupts_and_notifies_viewers() {
            let mut rig = rig();
            let (_viewer, mut rx) = rig.bus.register().await;
            start_command(&rig, "c1", "sleep 60").await;

            rig.events_tx
                .send(BusEvent::Data(b"partial output".to_vec()))
                .unwrap();
            rig.events_tx.send(BusEvent::Eof).unwrap();

            // Output frame, then a disconnected status frame, then the
            // channel closes.
            let mut saw_status = false;
            while let Some(frame) = rx.recv().await {
                if let ServerFrame::Status { connected } = frame {
                    assert!(!connected);
                    saw_status = true;
                }
            }
            assert!(saw_status);

            let entry = rig.registry.get("c1").unwrap();
            assert_eq!(entry.status(), CommandStatus::Interrupted);

            rig.connected_rx.changed().await.unwrap();
            assert!(!*rig.connected_rx.borrow());

            // Buffer kept whatever had accumulated.
            let buf = entry.buffer.lock().await;
            assert_eq!(buf.snapshot(), b"partial output");
        }

        #[tokio::test]
        async fn test_pump_exits_after_eof() {
            let rig = rig();
            rig.events_tx.send(BusEvent::Eof).unwrap();
            tokio::time::timeout(Duration::from_secs(1), rig.pump)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
