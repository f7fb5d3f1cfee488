// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! CVDisplayLink vblank backend.
//!
//! CoreVideo calls back on its own high-priority thread once per display
//! refresh. The callback reports the vblanks elapsed since the previous one,
//! derived from the video time stamps, so a late callback still advances the
//! clock by the right amount. The refresh rate comes from the display's
//! nominal refresh period rather than from a measurement.

use crate::core::{
    BackendExit, ClockError, RateMonitor, ReferenceClock, RefreshRateEstimator, Result,
    RunContext, VblankBackend,
};
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[repr(C)]
struct CVDisplayLink {
    _opaque: [u8; 0],
}

type CVDisplayLinkRef = *mut CVDisplayLink;

// CoreVideo constant names.
#[allow(non_upper_case_globals)]
const kCVReturnSuccess: i32 = 0;
#[allow(non_upper_case_globals)]
const kCVTimeIsIndefinite: i32 = 1 << 0;
#[allow(non_upper_case_globals)]
const kCVTimeStampVideoTimeValid: u64 = 1 << 0;
#[allow(non_upper_case_globals)]
const kCVTimeStampVideoRefreshPeriodValid: u64 = 1 << 4;

#[repr(C)]
struct CVTime {
    time_value: i64,
    time_scale: i32,
    flags: i32,
}

// Full CoreVideo layout; only the video time fields are read.
#[allow(dead_code)]
#[repr(C)]
struct CVTimeStamp {
    version: u32,
    video_time_scale: i32,
    video_time: i64,
    host_time: u64,
    rate_scalar: f64,
    video_refresh_period: i64,
    smpte_time: [u8; 24],
    flags: u64,
    reserved: u64,
}

type CVDisplayLinkOutputCallback = extern "C-unwind" fn(
    display_link: CVDisplayLinkRef,
    in_now: *const CVTimeStamp,
    in_output_time: *const CVTimeStamp,
    flags_in: u64,
    flags_out: *mut u64,
    display_link_context: *mut c_void,
) -> i32;

#[link(name = "CoreVideo", kind = "framework")]
unsafe extern "C" {
    fn CVDisplayLinkCreateWithActiveCGDisplays(display_link_out: *mut CVDisplayLinkRef) -> i32;
    fn CVDisplayLinkSetOutputCallback(
        display_link: CVDisplayLinkRef,
        callback: CVDisplayLinkOutputCallback,
        user_info: *mut c_void,
    ) -> i32;
    fn CVDisplayLinkStart(display_link: CVDisplayLinkRef) -> i32;
    fn CVDisplayLinkStop(display_link: CVDisplayLinkRef) -> i32;
    fn CVDisplayLinkIsRunning(display_link: CVDisplayLinkRef) -> bool;
    fn CVDisplayLinkRelease(display_link: CVDisplayLinkRef);
    fn CVDisplayLinkGetNominalOutputVideoRefreshPeriod(display_link: CVDisplayLinkRef) -> CVTime;
}

const NO_VIDEO_TIME: i64 = i64::MIN;

/// How often `run` checks for stop requests and a silent link.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(20);

/// Shared with the CoreVideo callback thread.
struct DisplayLinkContext {
    clock: Arc<ReferenceClock>,
    last_video_time: AtomicI64,
    callbacks: AtomicU64,
}

/// Vblanks between two callbacks, from their video time stamps.
fn vblanks_between(previous: i64, current: i64, refresh_period: i64) -> u32 {
    if previous == NO_VIDEO_TIME || refresh_period <= 0 || current <= previous {
        return 1;
    }
    let n = ((current - previous) as f64 / refresh_period as f64).round();
    (n as u32).max(1)
}

extern "C-unwind" fn display_link_callback(
    _display_link: CVDisplayLinkRef,
    in_now: *const CVTimeStamp,
    _in_output_time: *const CVTimeStamp,
    _flags_in: u64,
    _flags_out: *mut u64,
    display_link_context: *mut c_void,
) -> i32 {
    // SAFETY: the context outlives the running link (freed in cleanup after
    // CVDisplayLinkStop); `in_now` is valid for the duration of the callback.
    let (context, now) = unsafe {
        (
            &*(display_link_context as *const DisplayLinkContext),
            &*in_now,
        )
    };
    context.callbacks.fetch_add(1, Ordering::Relaxed);

    let valid = kCVTimeStampVideoTimeValid | kCVTimeStampVideoRefreshPeriodValid;
    let n = if now.flags & valid == valid {
        let previous = context
            .last_video_time
            .swap(now.video_time, Ordering::Relaxed);
        vblanks_between(previous, now.video_time, now.video_refresh_period)
    } else {
        1
    };

    context.clock.vblank(n, context.clock.time_source().now());
    kCVReturnSuccess
}

/// Frame rate from the nominal output refresh period.
fn nominal_frame_rate(display_link: CVDisplayLinkRef) -> Result<f64> {
    // SAFETY: `display_link` is a live link created by this module.
    let period = unsafe { CVDisplayLinkGetNominalOutputVideoRefreshPeriod(display_link) };
    if period.flags & kCVTimeIsIndefinite != 0 || period.time_value <= 0 || period.time_scale <= 0
    {
        return Err(ClockError::MeasurementInconclusive(
            "display link has no nominal refresh period".into(),
        ));
    }
    Ok(f64::from(period.time_scale) / period.time_value as f64)
}

/// Vblank backend driven by CVDisplayLink.
pub struct DisplayLinkBackend {
    display_link: CVDisplayLinkRef,
    context_ptr: *mut DisplayLinkContext,
    refresh_rate: f64,
}

// The raw pointers are only touched from the owning thread; the callback
// reaches the context through CoreVideo.
unsafe impl Send for DisplayLinkBackend {}

impl DisplayLinkBackend {
    pub fn new() -> Self {
        Self {
            display_link: std::ptr::null_mut(),
            context_ptr: std::ptr::null_mut(),
            refresh_rate: 0.0,
        }
    }

    fn context(&self) -> Option<&DisplayLinkContext> {
        // SAFETY: non-null context_ptr always comes from Box::into_raw in setup.
        unsafe { self.context_ptr.as_ref() }
    }

    fn is_running(&self) -> bool {
        // SAFETY: checked non-null; the link is live until cleanup.
        !self.display_link.is_null() && unsafe { CVDisplayLinkIsRunning(self.display_link) }
    }
}

impl Default for DisplayLinkBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VblankBackend for DisplayLinkBackend {
    fn name(&self) -> &str {
        "display-link"
    }

    fn setup(&mut self, ctx: &RunContext) -> Result<()> {
        let mut display_link: CVDisplayLinkRef = std::ptr::null_mut();
        // SAFETY: out-pointer to a local.
        let result = unsafe { CVDisplayLinkCreateWithActiveCGDisplays(&mut display_link) };
        if result != kCVReturnSuccess || display_link.is_null() {
            return Err(ClockError::Unsupported(format!(
                "CVDisplayLinkCreateWithActiveCGDisplays failed: error code {}",
                result
            )));
        }
        self.display_link = display_link;

        let estimator = RefreshRateEstimator::from_config(ctx.config());
        self.refresh_rate = estimator.nominal(nominal_frame_rate(display_link)?);

        let context = Box::new(DisplayLinkContext {
            clock: Arc::clone(ctx.clock()),
            last_video_time: AtomicI64::new(NO_VIDEO_TIME),
            callbacks: AtomicU64::new(0),
        });
        self.context_ptr = Box::into_raw(context);

        // SAFETY: link and context are live; the callback matches the CoreVideo signature.
        let result = unsafe {
            CVDisplayLinkSetOutputCallback(
                display_link,
                display_link_callback,
                self.context_ptr as *mut c_void,
            )
        };
        if result != kCVReturnSuccess {
            return Err(ClockError::Backend(format!(
                "Failed to set CVDisplayLink callback: error code {}",
                result
            )));
        }

        tracing::info!(
            "[DisplayLinkBackend] Nominal refresh {:.3} Hz",
            self.refresh_rate
        );
        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> BackendExit {
        // SAFETY: setup succeeded, so the link is live.
        let result = unsafe { CVDisplayLinkStart(self.display_link) };
        if result != kCVReturnSuccess {
            return BackendExit::Failed(ClockError::Backend(format!(
                "Failed to start CVDisplayLink: error code {}",
                result
            )));
        }

        let estimator = RefreshRateEstimator::from_config(ctx.config());
        let recheck = ctx.config().rate_recheck_interval();
        let event_timeout = ctx.config().event_timeout();
        let mut next_recheck = Instant::now() + recheck;
        let mut last_count = 0;
        let mut last_activity = Instant::now();

        loop {
            if let Some(exit) = ctx.interruption() {
                return exit;
            }
            thread::sleep(SUPERVISE_INTERVAL);

            if !self.is_running() {
                tracing::warn!("[DisplayLinkBackend] Display link stopped on its own");
                return BackendExit::DeviceLost;
            }

            let count = self
                .context()
                .map_or(0, |context| context.callbacks.load(Ordering::Relaxed));
            let now = Instant::now();
            if count != last_count {
                last_count = count;
                last_activity = now;
            } else if now.duration_since(last_activity) >= event_timeout {
                tracing::warn!("[DisplayLinkBackend] No callbacks for {:?}", event_timeout);
                return BackendExit::DeviceLost;
            }

            if now >= next_recheck {
                next_recheck = now + recheck;
                match nominal_frame_rate(self.display_link) {
                    Ok(rate) => {
                        let rate = estimator.nominal(rate);
                        if RateMonitor::changed(self.refresh_rate, rate) {
                            return BackendExit::RateChanged {
                                from: self.refresh_rate,
                                to: rate,
                            };
                        }
                    }
                    Err(e) => return BackendExit::Failed(e),
                }
            }
        }
    }

    fn cleanup(&mut self) {
        if !self.display_link.is_null() {
            // SAFETY: the link is live; stop before freeing the context it points to.
            unsafe {
                if CVDisplayLinkIsRunning(self.display_link) {
                    CVDisplayLinkStop(self.display_link);
                }
                CVDisplayLinkRelease(self.display_link);
            }
            self.display_link = std::ptr::null_mut();
        }
        if !self.context_ptr.is_null() {
            // SAFETY: allocated by Box::into_raw in setup; no callback can run any more.
            drop(unsafe { Box::from_raw(self.context_ptr) });
            self.context_ptr = std::ptr::null_mut();
        }
    }

    fn refresh_rate(&self) -> f64 {
        self.refresh_rate
    }
}

impl Drop for DisplayLinkBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}
