// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Combine sink: real-time fan-out of one rendered stream to several real
//! sinks, each with independent adaptive resampling to keep outputs
//! time-aligned despite clock drift between physical devices.
//!
//! Each combined sink instance is its own dedicated OS thread talking to
//! its output branches over `std::sync::mpsc` SPSC channels — the same
//! single-thread-plus-channels shape used for the host connection itself,
//! generalized to fan-out instead of fan-in.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::node::PwObjectId;

/// Fixed render cadence used when no output is active, so latency
/// smoothers and the rate-adjustment loop still have something to measure.
pub const BLOCK_USEC: u64 = 200_000;

/// Default resample-rate adjustment interval.
pub const DEFAULT_ADJUST_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CombineSinkHandle(pub u32);

/// A rendered block of audio handed between the combined sink's task and an
/// output branch's task.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub frames: Vec<f32>,
    pub rate: u32,
}

#[derive(Debug, Clone)]
pub enum OutMsg {
    Block(AudioBlock),
    Unload,
}

/// A consumer-to-task signal. `Shutdown` is currently the only one a real
/// output branch sends; the render loop drains it opportunistically rather
/// than blocking on it, since the branch may also just vanish with the
/// channel disconnecting.
pub enum InMsg {
    Shutdown,
}

/// Attach/detach one output branch without a shared mutex between the
/// render thread and whatever owns the [`CombineSinkTask`] — the branch
/// itself moves across the channel instead.
enum ControlMsg {
    AddOutput(Output),
    RemoveOutput(PwObjectId),
}

/// Per-output published backpressure/latency figures. Published via
/// atomics, the only cross-thread shared state besides the message queues
/// themselves.
pub struct OutputStats {
    pub max_request: AtomicU32,
    pub requested_latency_us: AtomicU64,
    pub stream_latency_us: AtomicU64,
    pub sink_latency_us: AtomicU64,
    pub active: std::sync::atomic::AtomicBool,
    pub current_rate: AtomicU32,
}

impl OutputStats {
    fn new(base_rate: u32) -> Self {
        OutputStats {
            max_request: AtomicU32::new(0),
            requested_latency_us: AtomicU64::new(BLOCK_USEC),
            stream_latency_us: AtomicU64::new(0),
            sink_latency_us: AtomicU64::new(0),
            active: std::sync::atomic::AtomicBool::new(false),
            current_rate: AtomicU32::new(base_rate),
        }
    }

    pub fn total_latency_us(&self) -> u64 {
        self.stream_latency_us.load(Ordering::Relaxed) + self.sink_latency_us.load(Ordering::Relaxed)
    }
}

pub struct Output {
    pub sink: PwObjectId,
    pub to_output: Sender<OutMsg>,
    pub from_output: Receiver<InMsg>,
    pub stats: Arc<OutputStats>,
}

impl Output {
    /// Builds one branch's channel pair, returning the task-side `Output`
    /// to hand to [`CombineSinkTask::add_output`] plus the two consumer-side
    /// ends.
    pub fn new_pair(sink: PwObjectId, base_rate: u32) -> (Output, Receiver<OutMsg>, Sender<InMsg>) {
        let (to_output, from_task) = std::sync::mpsc::channel();
        let (to_task, from_output) = std::sync::mpsc::channel();
        let stats = Arc::new(OutputStats::new(base_rate));
        (Output { sink, to_output, from_output, stats }, from_task, to_task)
    }
}

/// Compute the next sample rate for one output branch, applying the clamp
/// rules:
///
/// - reject the naive correction if it falls outside `[0.8*base, 1.25*base]`
///   (fall back to `base_rate`)
/// - otherwise clamp the *step* to ±2‰ of the current rate
/// - snap to `base_rate` when within 20 Hz of it
pub fn adjust_rate(base_rate: u32, current_rate: u32, total_latency_us: u64, target_us: u64, adjust_secs: u64) -> u32 {
    let base = base_rate as f64;
    let current = current_rate as f64;
    let adjust_secs = adjust_secs.max(1) as f64;

    let error_secs = (total_latency_us as f64 - target_us as f64) / 1_000_000.0;
    let naive = base + (error_secs / adjust_secs) * base;

    if naive < 0.8 * base || naive > 1.25 * base {
        return base_rate;
    }

    let max_step = current * 0.002;
    let mut new_rate = naive.clamp(current - max_step, current + max_step);

    if (new_rate - base).abs() < 20.0 {
        new_rate = base;
    }

    new_rate.round() as u32
}

/// One rate-adjustment pass over every active output:
/// `target = max(max_sink_latency, min_total_latency)`.
pub fn rate_adjustment_pass(base_rate: u32, adjust_secs: u64, outputs: &[Arc<OutputStats>]) {
    let active: Vec<&Arc<OutputStats>> = outputs.iter().filter(|o| o.active.load(Ordering::Relaxed)).collect();
    if active.is_empty() {
        return;
    }

    let max_sink_latency = active.iter().map(|o| o.sink_latency_us.load(Ordering::Relaxed)).max().unwrap_or(0);
    let min_total_latency = active.iter().map(|o| o.total_latency_us()).min().unwrap_or(0);
    let target = max_sink_latency.max(min_total_latency);

    for stats in &active {
        let total = stats.total_latency_us();
        if total > 10_000_000 {
            warn!("output total latency {total}us exceeds 10s, suspected driver bug");
        }
        let current = stats.current_rate.load(Ordering::Relaxed);
        let new_rate = adjust_rate(base_rate, current, total, target, adjust_secs);
        stats.current_rate.store(new_rate, Ordering::Relaxed);
    }
}

/// Spawned on module load, torn down on unload. Owns the combined sink's
/// render loop; each output branch communicates only through its own pair
/// of channels, never through shared mutable state. Branches are attached
/// and detached by posting [`ControlMsg`]s rather than sharing a `Vec`
/// between the caller and the render thread.
pub struct CombineSinkTask {
    pub handle: CombineSinkHandle,
    pub base_rate: u32,
    pub adjust_secs: u64,
    join: Option<JoinHandle<()>>,
    shutdown_tx: Sender<()>,
    control_tx: Sender<ControlMsg>,
}

impl CombineSinkTask {
    pub fn spawn(handle: CombineSinkHandle, base_rate: u32, adjust_secs: u64) -> Self {
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let (control_tx, control_rx) = std::sync::mpsc::channel::<ControlMsg>();
        let join = std::thread::Builder::new()
            .name(format!("combine-sink-{}", handle.0))
            .spawn(move || render_loop(shutdown_rx, control_rx, base_rate))
            .expect("spawn combine sink render thread");

        debug!("combine sink {handle:?} started, base_rate={base_rate}, adjust={adjust_secs}s");

        CombineSinkTask {
            handle,
            base_rate,
            adjust_secs,
            join: Some(join),
            shutdown_tx,
            control_tx,
        }
    }

    /// Attaches a new output branch. The render thread folds it into its
    /// fan-out set on its next cadence tick.
    pub fn add_output(&self, output: Output) {
        let _ = self.control_tx.send(ControlMsg::AddOutput(output));
    }

    /// Detaches a branch by its slave sink index; a no-op if it was never
    /// attached (or already dropped out on its own disconnect).
    pub fn remove_output(&self, sink: PwObjectId) {
        let _ = self.control_tx.send(ControlMsg::RemoveOutput(sink));
    }
}

impl Drop for CombineSinkTask {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Render loop invariant (spec.md section 4.11): drain pending
/// attach/detach control messages, then either fan a freshly rendered
/// block out to every attached output's `inq`, or — when no output is
/// attached yet — tick at the fixed `BLOCK_USEC` discard cadence so
/// latency smoothers and the rate-adjustment loop still have something to
/// measure once an output does attach.
fn render_loop(shutdown_rx: Receiver<()>, control_rx: Receiver<ControlMsg>, base_rate: u32) {
    let mut outputs: Vec<Output> = Vec::new();

    loop {
        while let Ok(msg) = control_rx.try_recv() {
            match msg {
                ControlMsg::AddOutput(output) => {
                    debug!("combine sink attaching output for sink {:?}", output.sink);
                    outputs.push(output);
                }
                ControlMsg::RemoveOutput(sink) => {
                    outputs.retain(|o| o.sink != sink);
                }
            }
        }

        match shutdown_rx.recv_timeout(Duration::from_micros(BLOCK_USEC)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                for output in &outputs {
                    let _ = output.to_output.send(OutMsg::Unload);
                }
                debug!("combine sink render thread shutting down");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                if outputs.is_empty() {
                    // Discard-cadence tick: nothing attached yet to fan to.
                    continue;
                }
                let max_request = outputs
                    .iter()
                    .map(|o| o.stats.max_request.load(Ordering::Relaxed).max(1))
                    .max()
                    .unwrap_or(1);
                let block = AudioBlock { frames: vec![0.0; max_request as usize], rate: base_rate };
                // Fan the same rendered block to every attached branch;
                // a branch whose receiver has gone away is pruned rather
                // than treated as a fatal error.
                outputs.retain(|o| o.to_output.send(OutMsg::Block(block.clone())).is_ok());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_adjustment_clamps_to_two_per_mille_step() {
        // Scenario S3: base 48000, adjust_time 10s, outputs at 95ms/105ms
        // total latency -> target = 105ms. Output A (95ms) needs to speed
        // up; the naive correction would overshoot but must clamp to the
        // documented ±2‰ step of the *current* rate.
        let base = 48_000u32;
        let current = base;
        let target_us = 105_000u64;
        let new_rate = adjust_rate(base, current, 95_000, target_us, 10);
        let max_step = current as f64 * 0.002;
        assert!(
            (new_rate as f64 - current as f64).abs() <= max_step + 1.0,
            "new_rate {new_rate} exceeded the 2 per mille step from {current}"
        );
        assert!(new_rate < base, "output behind target should speed up (lower rate)");
    }

    #[test]
    fn rate_adjustment_is_noop_for_output_already_at_target() {
        let base = 48_000u32;
        let new_rate = adjust_rate(base, base, 105_000, 105_000, 10);
        assert_eq!(new_rate, base);
    }

    #[test]
    fn rate_adjustment_falls_back_to_base_outside_clamp_window() {
        // A pathological 9-second error against a 10s adjust window would
        // ask for roughly double the base rate; that must be rejected.
        let base = 48_000u32;
        let new_rate = adjust_rate(base, base, 9_000_000, 0, 10);
        assert_eq!(new_rate, base);
    }

    #[test]
    fn pass_computes_target_as_max_of_max_sink_and_min_total() {
        let a = Arc::new(OutputStats::new(48_000));
        a.active.store(true, Ordering::Relaxed);
        a.stream_latency_us.store(50_000, Ordering::Relaxed);
        a.sink_latency_us.store(45_000, Ordering::Relaxed);

        let b = Arc::new(OutputStats::new(48_000));
        b.active.store(true, Ordering::Relaxed);
        b.stream_latency_us.store(60_000, Ordering::Relaxed);
        b.sink_latency_us.store(45_000, Ordering::Relaxed);

        rate_adjustment_pass(48_000, 10, &[a.clone(), b.clone()]);

        // Neither should now exceed the clamp window around base rate.
        let ra = a.current_rate.load(Ordering::Relaxed);
        let rb = b.current_rate.load(Ordering::Relaxed);
        assert!((ra as i64 - 48_000).unsigned_abs() <= 96);
        assert!((rb as i64 - 48_000).unsigned_abs() <= 96);
    }

    #[test]
    fn spawn_and_drop_shuts_down_cleanly() {
        let task = CombineSinkTask::spawn(CombineSinkHandle(1), 48_000, 10);
        drop(task);
    }

    #[test]
    fn attached_output_receives_fanned_out_blocks() {
        let task = CombineSinkTask::spawn(CombineSinkHandle(2), 48_000, 10);
        let (output, from_task, _to_task) = Output::new_pair(PwObjectId(5), 48_000);
        output.stats.max_request.store(256, Ordering::Relaxed);
        task.add_output(output);

        let msg = from_task
            .recv_timeout(Duration::from_millis(500))
            .expect("render thread should fan a block to the attached output");
        match msg {
            OutMsg::Block(block) => assert_eq!(block.frames.len(), 256),
            OutMsg::Unload => panic!("unexpected unload before shutdown"),
        }
    }

    #[test]
    fn removed_output_stops_receiving_blocks() {
        let task = CombineSinkTask::spawn(CombineSinkHandle(3), 48_000, 10);
        let (output, from_task, _to_task) = Output::new_pair(PwObjectId(6), 48_000);
        task.add_output(output);
        from_task.recv_timeout(Duration::from_millis(500)).expect("first block");

        task.remove_output(PwObjectId(6));
        // Drain any block already in flight from before the removal landed.
        while from_task.recv_timeout(Duration::from_millis(500)).is_ok() {}
        assert_eq!(from_task.recv_timeout(Duration::from_millis(500)), Err(RecvTimeoutError::Timeout));
    }
}
