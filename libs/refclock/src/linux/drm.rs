// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! DRM kernel vblank events.
//!
//! The kernel keeps a vblank sequence counter per CRTC. `DRM_IOCTL_WAIT_VBLANK`
//! with `DRM_VBLANK_EVENT` queues a one-shot event that becomes readable on the
//! device fd at the next vblank; the event carries the sequence number. One
//! event is always kept queued so no vblank goes unreported. The primary CRTC
//! is used.

use crate::core::backends::{CounterBackend, VsyncCounter};
use crate::core::{ClockError, Result, RunContext};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

const DRM_VBLANK_RELATIVE: u32 = 0x0000_0001;
const DRM_VBLANK_EVENT: u32 = 0x0400_0000;
const DRM_EVENT_VBLANK: u32 = 0x01;

// Kernel ABI layout; some fields are only ever written by the kernel.
#[allow(dead_code, non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy)]
struct drm_wait_vblank_request {
    type_: u32,
    sequence: u32,
    signal: libc::c_ulong,
}

#[allow(dead_code, non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy)]
struct drm_wait_vblank_reply {
    type_: u32,
    sequence: u32,
    tval_sec: libc::c_long,
    tval_usec: libc::c_long,
}

#[allow(dead_code, non_camel_case_types)]
#[repr(C)]
union drm_wait_vblank {
    request: drm_wait_vblank_request,
    reply: drm_wait_vblank_reply,
}

#[allow(dead_code, non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy)]
struct drm_event {
    type_: u32,
    length: u32,
}

#[allow(dead_code, non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy)]
struct drm_event_vblank {
    base: drm_event,
    user_data: u64,
    tv_sec: u32,
    tv_usec: u32,
    sequence: u32,
    crtc_id: u32,
}

/// `_IOWR('d', nr, size)`.
const fn drm_iowr(nr: u32, size: usize) -> libc::c_ulong {
    const IOC_READ_WRITE: u32 = 3;
    ((IOC_READ_WRITE << 30) | (((size as u32) & 0x3fff) << 16) | ((b'd' as u32) << 8) | nr)
        as libc::c_ulong
}

const DRM_IOCTL_WAIT_VBLANK: libc::c_ulong =
    drm_iowr(0x3a, std::mem::size_of::<drm_wait_vblank>());

/// Kernel vblank counter of a DRM device.
pub struct DrmVblankCounter {
    path: PathBuf,
    device: Option<File>,
    event_queued: bool,
}

/// Counter backend over the DRM vblank event.
pub type DrmVblankBackend = CounterBackend<DrmVblankCounter>;

impl DrmVblankCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            device: None,
            event_queued: false,
        }
    }

    fn device(&self) -> Result<&File> {
        self.device
            .as_ref()
            .ok_or_else(|| ClockError::Backend("DRM device is not open".into()))
    }

    fn wait_vblank(&self, type_: u32, sequence: u32) -> io::Result<u32> {
        let fd = self.device().map_err(io::Error::other)?.as_raw_fd();
        let mut vbl = drm_wait_vblank {
            request: drm_wait_vblank_request {
                type_,
                sequence,
                signal: 0,
            },
        };
        loop {
            // SAFETY: `vbl` is a properly sized drm_wait_vblank the kernel reads and writes.
            let ret = unsafe {
                libc::ioctl(
                    fd,
                    DRM_IOCTL_WAIT_VBLANK as _,
                    &mut vbl as *mut drm_wait_vblank,
                )
            };
            if ret == 0 {
                // SAFETY: on success the kernel filled in the reply variant.
                return Ok(unsafe { vbl.reply.sequence });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn queue_event(&mut self) -> Result<()> {
        self.wait_vblank(DRM_VBLANK_RELATIVE | DRM_VBLANK_EVENT, 1)
            .map_err(|e| ClockError::Backend(format!("failed to queue vblank event: {}", e)))?;
        self.event_queued = true;
        Ok(())
    }

    /// Wait until the device fd is readable. `false` on timeout.
    fn poll_readable(&self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.device()?.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX).max(1);
        // SAFETY: one valid pollfd.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err.into());
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(ClockError::Backend(format!(
                "DRM device {} reported poll error",
                self.path.display()
            )));
        }
        Ok(ret > 0)
    }

    /// Drain pending events. Returns the newest vblank sequence, if any.
    fn read_events(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 1024];
        let len = loop {
            let device = self
                .device
                .as_mut()
                .ok_or_else(|| ClockError::Backend("DRM device is not open".into()))?;
            match device.read(&mut buf) {
                Ok(len) => break len,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        Ok(parse_vblank_events(&buf[..len]))
    }
}

/// Newest vblank sequence among the DRM events in `bytes`.
fn parse_vblank_events(bytes: &[u8]) -> Option<u32> {
    let header = std::mem::size_of::<drm_event>();
    let mut offset = 0;
    let mut sequence = None;

    while offset + header <= bytes.len() {
        // SAFETY: at least `header` bytes remain; read_unaligned has no alignment requirement.
        let event: drm_event =
            unsafe { std::ptr::read_unaligned(bytes[offset..].as_ptr().cast()) };
        let length = event.length as usize;
        if length < header || offset + length > bytes.len() {
            break;
        }
        if event.type_ == DRM_EVENT_VBLANK && length >= std::mem::size_of::<drm_event_vblank>() {
            // SAFETY: bounds checked against the event's own length.
            let vblank: drm_event_vblank =
                unsafe { std::ptr::read_unaligned(bytes[offset..].as_ptr().cast()) };
            sequence = Some(vblank.sequence);
        }
        offset += length;
    }
    sequence
}

impl VsyncCounter for DrmVblankCounter {
    fn name(&self) -> &str {
        "drm"
    }

    fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        let device = File::options()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    ClockError::Unsupported(format!("cannot open {}: {}", self.path.display(), e))
                }
                _ => ClockError::Io(e),
            })?;
        self.device = Some(device);
        self.event_queued = false;

        // A relative wait for zero vblanks returns the current sequence at once.
        match self.wait_vblank(DRM_VBLANK_RELATIVE, 0) {
            Ok(sequence) => {
                tracing::debug!(
                    "[DrmVblankCounter] Opened {} at sequence {}",
                    self.path.display(),
                    sequence
                );
                Ok(())
            }
            Err(e) => {
                self.device = None;
                Err(ClockError::Unsupported(format!(
                    "{} has no vblank support: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }

    fn wait_for_vblank(&mut self, timeout: Duration) -> Result<Option<u64>> {
        if !self.event_queued {
            self.queue_event()?;
        }
        if !self.poll_readable(timeout)? {
            return Ok(None);
        }

        let sequence = self.read_events()?;
        if sequence.is_some() {
            self.event_queued = false;
            self.queue_event()?;
        }
        Ok(sequence.map(u64::from))
    }

    fn close(&mut self) {
        // Closing the fd discards the queued event.
        if self.device.take().is_some() {
            tracing::debug!("[DrmVblankCounter] Closed {}", self.path.display());
        }
        self.event_queued = false;
    }
}
